//! Session manager: per-carrier registry of sessions keyed by peer identity
//! (spec §4.1). Dispatches inbound SDP invites to the right session or
//! creates a pending one, and carries the transacted-callback table for
//! outbound invites (spec §5: "guarded by a short mutex; entries live until
//! either reply is delivered or a 60-second timeout elapses").
//!
//! Grounded in shape on `signaling::sessions::Sessions` (keyed registry,
//! idempotent removal) and `signaling::router` (dispatch by message kind),
//! repurposed here from a WebSocket signaling server onto the
//! `FriendOverlay` trait's friend-invite surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{not_exist, wrong_state, CarrierError, ErrorKind, Facility};
use crate::identity::overlay::{FriendEvent, FriendOverlay};
use crate::identity::user_id::UserId;
use crate::log::logger_handle::LoggerHandle;
use crate::sdp::SessionDescription;
use crate::session::session::{Session, SessionState};

/// Bundle id tagging every session SDP friend-invite (spec §4.1, §6).
pub const SESSION_BUNDLE_ID: &str = "session";

/// Spec §4.1: "The application must respond with `reply` before an
/// implementation-defined timeout (>= 30s) or the session is garbage-collected."
const INBOUND_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Spec §5: the transacted-callback table's entries expire after 60s.
const OUTBOUND_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Resolution of an outbound `request()`: accepted carries the peer's SDP
/// answer, refused carries its reason string, timed out is the 60s table
/// expiry (spec §5).
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Accepted(SessionDescription),
    Refused(String),
    TimedOut,
}

/// Installed against an invite's transaction id by `request()` (spec §4.1).
pub type RequestCallback = Box<dyn FnOnce(RequestOutcome) + Send>;

/// Invoked on the identity-overlay iteration thread when an inbound session
/// invite arrives (spec §4.1 `on_request`). The application inspects the
/// remote SDP, adds matching streams to the session reachable via
/// `SessionManager::session`, and calls `reply` before the 30s deadline.
pub type RequestHandler = Arc<dyn Fn(&Arc<SessionManager>, UserId, SessionDescription) + Send + Sync>;

struct PendingOutbound {
    created_at: Instant,
    callback: RequestCallback,
}

struct PendingInbound {
    received_at: Instant,
}

/// Per-carrier registry of sessions keyed by peer identity (spec §3 Session
/// invariant: "exactly one session exists per remote peer per carrier at any
/// moment; re-creation is only legal after the previous session has reached
/// `closed`").
pub struct SessionManager {
    overlay: Arc<dyn FriendOverlay>,
    bind_ip: std::net::IpAddr,
    logger: LoggerHandle,
    sessions: Mutex<HashMap<UserId, Arc<Session>>>,
    outbound: Mutex<HashMap<u64, PendingOutbound>>,
    /// Remote peer -> transaction id of their not-yet-answered invite,
    /// so `reply()` can address the overlay's `send_reply` correctly.
    inbound: Mutex<HashMap<UserId, (u64, PendingInbound)>>,
    on_request: Mutex<Option<RequestHandler>>,
    initialized: AtomicBool,
    stop: Arc<AtomicBool>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SessionManager {
    /// Spec §4.1 `init`: registers a single friend-invite handler on the
    /// identity overlay filtered by the "session" bundle id, and starts the
    /// background thread that drains `overlay.poll_events()` (spec §5: "one
    /// thread to the identity overlay iteration" -- owned by this manager
    /// since the `FriendOverlay` trait itself promises only a non-blocking
    /// poll, not its own driver thread).
    pub fn init(
        overlay: Arc<dyn FriendOverlay>,
        bind_ip: std::net::IpAddr,
        logger: LoggerHandle,
        on_request: RequestHandler,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            overlay,
            bind_ip,
            logger,
            sessions: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            on_request: Mutex::new(Some(on_request)),
            initialized: AtomicBool::new(true),
            stop: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        });
        manager.spawn_pump();
        manager
    }

    fn spawn_pump(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let stop = Arc::clone(&self.stop);
        let join = thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                for event in manager.overlay.poll_events() {
                    manager.dispatch(event);
                }
                manager.sweep_expired();
                thread::sleep(POLL_INTERVAL);
            }
        });
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
    }

    fn dispatch(self: &Arc<Self>, event: FriendEvent) {
        match event {
            FriendEvent::Invite { from, bundle_id, payload, transaction } => {
                if bundle_id != SESSION_BUNDLE_ID {
                    return;
                }
                self.on_request_received(from, transaction, &payload);
            }
            FriendEvent::Reply { transaction, accepted, payload, .. } => {
                self.resolve_outbound(transaction, accepted, payload);
            }
            FriendEvent::Added(_) | FriendEvent::Removed(_) | FriendEvent::PresenceChanged { .. } => {}
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<u64> = outbound
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) >= OUTBOUND_REPLY_TIMEOUT)
            .map(|(&txn, _)| txn)
            .collect();
        for txn in expired {
            if let Some(pending) = outbound.remove(&txn) {
                (pending.callback)(RequestOutcome::TimedOut);
            }
        }
        drop(outbound);

        let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<UserId> = inbound
            .iter()
            .filter(|(_, (_, p))| now.duration_since(p.received_at) >= INBOUND_REPLY_TIMEOUT)
            .map(|(&peer, _)| peer)
            .collect();
        for peer in expired {
            inbound.remove(&peer);
            crate::sink_warn!(self.logger, "inbound session request from {peer} timed out unanswered; garbage-collecting");
            if let Some(session) = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(&peer) {
                session.session_close();
            }
        }
    }

    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, 0)
    }

    /// Spec §4.1 `new`: fails `NOT_EXIST` if the peer is not a confirmed
    /// friend, or if a previous session to the same peer hasn't reached
    /// `closed` (that case is `ALREADY_EXIST` per spec §8 scenario S5).
    pub fn new_session(self: &Arc<Self>, peer: UserId) -> Result<Arc<Session>, CarrierError> {
        if !self.initialized.load(Ordering::Relaxed) {
            return Err(not_exist(Facility::Session, "session manager not initialized"));
        }
        if !self.overlay.is_friend(&peer) {
            return Err(not_exist(Facility::Session, "peer is not a confirmed friend"));
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sessions.get(&peer) {
            if existing.state() != SessionState::Closed {
                return Err(CarrierError::with_context(
                    Facility::Session,
                    ErrorKind::AlreadyExist,
                    "a session to this peer is already open",
                ));
            }
        }
        let session = Session::new_outbound(peer, self.bind_addr(), self.logger.clone());
        sessions.insert(peer, Arc::clone(&session));
        Ok(session)
    }

    /// Spec §4.1 `request`: serializes the local offer and hands it to the
    /// identity overlay as a friend invite; `on_complete` fires once the
    /// peer replies or the transaction times out.
    pub fn request(&self, session: &Arc<Session>, on_complete: RequestCallback) -> Result<(), CarrierError> {
        if session.stream_count() == 0 {
            return Err(wrong_state(Facility::Session, "session has no streams in state initialized"));
        }
        session.mark_offering();
        let sdp = session.build_local_sdp()?;
        let payload = sdp.serialize()?;
        let txn = self.overlay.send_invite(&session.remote_id, SESSION_BUNDLE_ID, &payload)?;
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).insert(
            txn,
            PendingOutbound {
                created_at: Instant::now(),
                callback: on_complete,
            },
        );
        Ok(())
    }

    /// Spec §4.1 `reply`: accepts (with the local SDP answer) or refuses
    /// (with a reason string) an inbound request, identified by `peer`.
    pub fn reply(&self, peer: &UserId, accept: bool, reason: &str) -> Result<(), CarrierError> {
        let (txn, session) = {
            let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
            let (txn, _) = inbound
                .remove(peer)
                .ok_or_else(|| not_exist(Facility::Session, "no pending inbound request for this peer"))?;
            let session = self
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(peer)
                .cloned()
                .ok_or_else(|| not_exist(Facility::Session, "session not found"))?;
            (txn, session)
        };

        if accept {
            let sdp = session.build_local_sdp()?;
            let payload = sdp.serialize()?;
            self.overlay.send_reply(txn, true, &payload)
        } else {
            session.session_close();
            self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(peer);
            self.overlay.send_reply(txn, false, reason.as_bytes())
        }
    }

    /// Spec §4.1 `on_request_received`: look up or create a session for
    /// `from`, move it to `answering`, invoke the application's `on_request`
    /// callback with the remote SDP.
    fn on_request_received(self: &Arc<Self>, from: UserId, transaction: u64, payload: &[u8]) {
        let remote_sdp = match SessionDescription::parse(payload) {
            Ok(sdp) => sdp,
            Err(e) => {
                crate::sink_warn!(self.logger, "malformed session invite from {from}: {e}");
                let _ = self.overlay.send_reply(transaction, false, b"malformed sdp");
                return;
            }
        };

        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = sessions.get(&from) {
                if existing.state() == SessionState::Closed {
                    sessions.remove(&from);
                }
            }
            sessions
                .entry(from)
                .or_insert_with(|| Session::new_inbound(from, &remote_sdp, self.bind_addr(), self.logger.clone()))
                .clone()
        };

        self.inbound.lock().unwrap_or_else(|e| e.into_inner()).insert(
            from,
            (transaction, PendingInbound { received_at: Instant::now() }),
        );

        if let Some(handler) = self.on_request.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            let manager = Arc::clone(self);
            handler(&manager, from, remote_sdp);
        }
        let _ = session;
    }

    fn resolve_outbound(&self, transaction: u64, accepted: bool, payload: Vec<u8>) {
        let Some(pending) = self.outbound.lock().unwrap_or_else(|e| e.into_inner()).remove(&transaction) else {
            return;
        };
        let outcome = if accepted {
            match SessionDescription::parse(&payload) {
                Ok(sdp) => RequestOutcome::Accepted(sdp),
                Err(e) => RequestOutcome::Refused(format!("malformed answer sdp: {e}")),
            }
        } else {
            RequestOutcome::Refused(String::from_utf8_lossy(&payload).into_owned())
        };
        (pending.callback)(outcome);
    }

    #[must_use]
    pub fn session(&self, peer: &UserId) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(peer).cloned()
    }

    /// Spec §4.1 `session_cleanup`: closes and forgets every session this
    /// manager owns. Idempotent.
    pub fn cleanup(&self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for (_, session) in sessions.drain() {
            session.session_close();
        }
    }

    /// Removes one closed session from the registry, fulfilling spec §8's
    /// "`session_new` then `session_close` ... leaves the session table
    /// empty" round-trip law.
    pub fn forget(&self, peer: &UserId) {
        if let Some(session) = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(peer) {
            session.session_close();
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = join.join();
        }
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::identity::mock_overlay::MockFriendOverlay;
    use crate::stream::options::{StreamKind, StreamOptions};
    use crate::stream::NoopStreamCallbacks;
    use std::sync::mpsc;

    fn id(byte: u8) -> UserId {
        UserId::from_bytes([byte; 32])
    }

    fn noop_handler() -> RequestHandler {
        Arc::new(|_, _, _| {})
    }

    fn test_logger() -> LoggerHandle {
        crate::log::logger::Logger::start_in_dir(std::env::temp_dir(), "session-manager-test", 64, 8, 1).handle()
    }

    #[test]
    fn new_session_to_a_stranger_is_not_exist() {
        let (a, _b) = MockFriendOverlay::pair(id(1), id(2));
        let manager = SessionManager::init(a, "127.0.0.1".parse().unwrap(), test_logger(), noop_handler());
        let stranger = id(99);
        let err = manager.new_session(stranger).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotExist);
    }

    #[test]
    fn double_new_session_is_already_exist() {
        let (a, _b) = MockFriendOverlay::pair(id(1), id(2));
        let manager = SessionManager::init(a, "127.0.0.1".parse().unwrap(), test_logger(), noop_handler());
        let _first = manager.new_session(id(2)).unwrap();
        let err = manager.new_session(id(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExist);
    }

    #[test]
    fn request_then_refuse_resolves_with_no_stream_transitions() {
        let (a, b) = MockFriendOverlay::pair(id(1), id(2));
        let (done_tx, done_rx) = mpsc::channel();

        let manager_b_handler: RequestHandler = Arc::new(move |manager, peer, _sdp| {
            let _ = manager.reply(&peer, false, "not interested");
        });
        let manager_b = SessionManager::init(b, "127.0.0.1".parse().unwrap(), test_logger(), manager_b_handler);
        let manager_a = SessionManager::init(a, "127.0.0.1".parse().unwrap(), test_logger(), noop_handler());

        let session_a = manager_a.new_session(id(2)).unwrap();
        session_a
            .add_stream(
                StreamKind::Application,
                StreamOptions { reliable: true, plain: true, multiplexing: false, port_forwarding: false },
                Arc::new(NoopStreamCallbacks),
            )
            .unwrap();

        manager_a
            .request(
                &session_a,
                Box::new(move |outcome| {
                    let _ = done_tx.send(outcome);
                }),
            )
            .unwrap();

        let outcome = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match outcome {
            RequestOutcome::Refused(reason) => assert_eq!(reason, "not interested"),
            other => panic!("expected Refused, got {other:?}"),
        }
        let _ = manager_b;
    }
}
