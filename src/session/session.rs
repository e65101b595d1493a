//! Per-peer session: owns the transport and the stream set, and drives the
//! stream FSM from ICE transport events (spec §4.2, §4.3).

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::channel::ChannelId;
use crate::error::{wrong_state, CarrierError, ErrorKind, Facility};
use crate::fmp::MuxCallbacks;
use crate::ice::{Candidate, IceEvent, IceRole, IceTransportHandle, IceWorker};
use crate::identity::user_id::UserId;
use crate::log::logger_handle::LoggerHandle;
use crate::portforward::{self, PortForwardManager, PortForwardService, MAX_SERVICE_NAME_LEN};
use crate::sdp::{ServiceRegistration, SessionDescription, StreamDescriptor};
use crate::stream::options::{StreamId, StreamKind, StreamOptions};
use crate::stream::state::StreamState;
use crate::stream::{Stream, StreamCallbacks, StreamEntry, StreamTable};

/// Spec §4.2: `raw -> offering | answering -> ready -> closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Raw,
    Offering,
    Answering,
    Ready,
    Closed,
}

/// Spec §8 boundary: "`add_stream` beyond the per-session cap (>= 8) returns
/// `LIMIT_EXCEEDED`."
const MAX_STREAMS_PER_SESSION: usize = 8;

/// How long a server-side service dial is allowed before the channel open is
/// rejected (spec §8: unregistered/unreachable services close "within 5s").
/// Dialing happens inline in the `on_channel_open_request` callback, which in
/// the concurrency model of spec §5 normally must not block — an accepted
/// simplification here since a loopback/LAN backend dial resolves in
/// milliseconds; a production port-forwarder would hand the dial off to a
/// worker and answer the SYN asynchronously.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    pub remote_id: UserId,
    self_weak: Weak<Session>,
    role: Mutex<IceRole>,
    state: Mutex<SessionState>,
    bind_addr: SocketAddr,
    credentials: Mutex<Option<(String, String)>>,
    streams: StreamTable,
    next_stream_id: AtomicU8,
    worker: Mutex<Option<IceWorker>>,
    handle: Mutex<Option<IceTransportHandle>>,
    local_candidate: Mutex<Option<Candidate>>,
    event_thread: Mutex<Option<thread::JoinHandle<()>>>,
    stop_events: Arc<AtomicBool>,
    port_forward: Arc<PortForwardManager>,
    /// Channels opened for port forwarding, tracked so `MuxCallbacks`
    /// dispatch routes their data/close events to the TCP pipe instead of
    /// the stream's application callbacks.
    pf_channels: Mutex<HashSet<(StreamId, ChannelId)>>,
    /// `{name -> backend}` registered via `add_service` (spec §4.6 inbound
    /// side).
    services: Mutex<HashMap<String, PortForwardService>>,
    logger: LoggerHandle,
}

impl Session {
    fn new(
        remote_id: UserId,
        role: IceRole,
        state: SessionState,
        credentials: Option<(String, String)>,
        bind_addr: SocketAddr,
        logger: LoggerHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            remote_id,
            self_weak: weak.clone(),
            role: Mutex::new(role),
            state: Mutex::new(state),
            bind_addr,
            credentials: Mutex::new(credentials),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU8::new(1),
            worker: Mutex::new(None),
            handle: Mutex::new(None),
            local_candidate: Mutex::new(None),
            event_thread: Mutex::new(None),
            stop_events: Arc::new(AtomicBool::new(false)),
            port_forward: PortForwardManager::new(),
            pf_channels: Mutex::new(HashSet::new()),
            services: Mutex::new(HashMap::new()),
            logger,
        })
    }

    /// The offering side: generates the session-wide ufrag/pwd up front so
    /// `request()` can build the local SDP immediately (spec §4.2: "ufrag/pwd
    /// ... bound to the session for its lifetime").
    #[must_use]
    pub fn new_outbound(remote_id: UserId, bind_addr: SocketAddr, logger: LoggerHandle) -> Arc<Self> {
        let credentials = Some(crate::ice::agent::generate_credentials());
        Self::new(remote_id, IceRole::Controlling, SessionState::Raw, credentials, bind_addr, logger)
    }

    /// The answering side: adopts the offer's ufrag/pwd as its own, since
    /// this engine uses one shared credential pair per session rather than
    /// two independently generated ones (required for FMP's symmetric key
    /// derivation in `fmp::crypto::derive_session_key`).
    #[must_use]
    pub fn new_inbound(remote_id: UserId, peer_sdp: &SessionDescription, bind_addr: SocketAddr, logger: LoggerHandle) -> Arc<Self> {
        let credentials = Some((peer_sdp.ufrag.clone(), peer_sdp.pwd.clone()));
        Self::new(remote_id, IceRole::Controlled, SessionState::Answering, credentials, bind_addr, logger)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// The sole guard for every stream state mutation after creation: applies
    /// `next` and fires `on_state_changed` only if `StreamState::can_transition_to`
    /// allows it (spec §4.3's FSM), otherwise leaves the entry untouched.
    fn try_transition(entry: &mut StreamEntry, id: StreamId, next: StreamState) -> bool {
        if !entry.state.can_transition_to(next) {
            return false;
        }
        entry.state = next;
        entry.callbacks.on_state_changed(id, next);
        true
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stream_id)
            .map(|e| e.state)
    }

    pub fn transport_handle(&self) -> Result<IceTransportHandle, CarrierError> {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| wrong_state(Facility::Session, "transport not established yet"))
    }

    fn arc_self(&self) -> Result<Arc<Session>, CarrierError> {
        self.self_weak
            .upgrade()
            .ok_or_else(|| wrong_state(Facility::Session, "session already dropped"))
    }

    /// Spec §4.3 `initialized -> transport-ready`: binds the UDP socket and
    /// starts the ICE worker the first time a stream needs it. A no-op once
    /// already spawned (every stream in a session shares one transport).
    fn ensure_transport(&self) -> Result<(), CarrierError> {
        let mut worker_guard = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker_guard.is_some() {
            return Ok(());
        }
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| wrong_state(Facility::Session, "local credentials not established yet"))?;
        let role = *self.role.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, rx) = mpsc::channel();
        let callbacks: Arc<dyn MuxCallbacks> = self.arc_self()?;
        let (worker, local_candidate) =
            IceWorker::spawn(self.bind_addr, role, credentials, callbacks, tx, self.logger.clone())
                .map_err(CarrierError::from)?;
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker.handle());
        *self.local_candidate.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_candidate);
        *worker_guard = Some(worker);
        drop(worker_guard);
        self.spawn_event_pump(rx)?;
        Ok(())
    }

    fn spawn_event_pump(&self, rx: mpsc::Receiver<IceEvent>) -> Result<(), CarrierError> {
        let session = self.arc_self()?;
        let stop = Arc::clone(&self.stop_events);
        let join = thread::spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(IceEvent::Connected { .. }) => session.on_transport_connected(),
                Ok(IceEvent::Failed) => {
                    session.on_transport_failed();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        *self.event_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        Ok(())
    }

    fn on_transport_connected(&self) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for (&id, entry) in streams.iter_mut() {
            Self::try_transition(entry, id, StreamState::Connected);
        }
    }

    fn on_transport_failed(&self) {
        crate::sink_warn!(self.logger, "session with {} failed: ice transport gave up", self.remote_id);
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for (&id, entry) in streams.iter_mut() {
            Self::try_transition(entry, id, StreamState::Failed);
        }
    }

    /// Spec §4.3 `raw -> initialized -> transport-ready`, folded into one
    /// call: streams may only be added before the session reaches `ready`.
    pub fn add_stream(
        &self,
        kind: StreamKind,
        options: StreamOptions,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<Stream, CarrierError> {
        if !kind.is_implemented() {
            return Err(CarrierError::with_context(
                Facility::Session,
                ErrorKind::InvalidArgs,
                "stream kind is reserved, not implemented",
            ));
        }
        let options = options.validate()?;
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*state, SessionState::Raw | SessionState::Offering | SessionState::Answering) {
                return Err(wrong_state(Facility::Session, "streams can only be added before the session is ready"));
            }
        }

        let stream_id = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            if streams.len() >= MAX_STREAMS_PER_SESSION {
                return Err(CarrierError::new(Facility::Session, ErrorKind::LimitExceeded));
            }
            let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
            if id == 0 {
                return Err(CarrierError::new(Facility::Session, ErrorKind::LimitExceeded));
            }
            streams.insert(
                id,
                StreamEntry {
                    kind,
                    options,
                    state: StreamState::Initialized,
                    callbacks: callbacks.clone(),
                },
            );
            id
        };
        callbacks.on_state_changed(stream_id, StreamState::Initialized);

        self.ensure_transport()?;
        let handle = self.transport_handle()?;
        handle.register_stream(stream_id, options)?;

        {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = streams.get_mut(&stream_id) {
                Self::try_transition(entry, stream_id, StreamState::TransportReady);
            }
        }

        Ok(Stream {
            session: self.self_weak.clone(),
            stream_id,
            kind,
            options,
        })
    }

    pub fn remove_stream(&self, stream_id: StreamId) -> Result<(), CarrierError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streams
            .get_mut(&stream_id)
            .ok_or_else(|| CarrierError::new(Facility::Session, ErrorKind::NotExist))?;
        Self::try_transition(entry, stream_id, StreamState::Closed);
        drop(streams);
        if let Ok(handle) = self.transport_handle() {
            handle.remove_stream(stream_id);
        }
        Ok(())
    }

    /// Registers a `{name -> backend}` forwarding target for the answering
    /// side (spec §4.6 inbound side), and advertises it in the local SDP.
    pub fn add_service(&self, name: &str, host: &str, port: u16) -> Result<(), CarrierError> {
        if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
            return Err(CarrierError::with_context(Facility::Session, ErrorKind::TooLong, "service name must be 1..=63 bytes"));
        }
        self.services.lock().unwrap_or_else(|e| e.into_inner()).insert(
            name.to_string(),
            PortForwardService {
                name: name.to_string(),
                host: host.to_string(),
                port,
            },
        );
        Ok(())
    }

    /// Outbound port forwarding (spec §4.6): binds a local listener and opens
    /// one dedicated channel per accepted connection, carrying `service_name`
    /// as the open cookie.
    pub fn start_outbound_forwarding(
        &self,
        stream_id: StreamId,
        service_name: &str,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<(), CarrierError> {
        let listener = TcpListener::bind((bind_host, bind_port)).map_err(CarrierError::from)?;
        let handle = self.transport_handle()?;
        let pf = Arc::clone(&self.port_forward);
        let session = self.arc_self()?;
        let service_name = service_name.to_string();
        let logger = self.logger.clone();

        thread::spawn(move || {
            for incoming in listener.incoming() {
                let Ok(socket) = incoming else { break };
                let cookie = service_name.clone().into_bytes();
                match handle.open_channel(stream_id, cookie) {
                    Ok(channel_id) => {
                        session
                            .pf_channels
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert((stream_id, channel_id));
                        let write_handle = handle.clone();
                        let close_handle = handle.clone();
                        let ok = portforward::wait_then_pump(
                            &pf,
                            stream_id,
                            channel_id,
                            socket,
                            move |ch, bytes| write_handle.write_channel(stream_id, ch, bytes.to_vec()).is_ok(),
                            move || {
                                let _ = close_handle.close_channel(stream_id, channel_id);
                            },
                        );
                        if !ok {
                            crate::sink_warn!(logger, "port forward '{service_name}' channel {channel_id} timed out waiting for open ack");
                        }
                    }
                    Err(e) => crate::sink_warn!(logger, "port forward '{service_name}' failed to open channel: {e}"),
                }
            }
        });
        Ok(())
    }

    /// Spec §4.2 "SDP discipline": the answering side copies the offering
    /// side's stream list and matches each entry by ordinal; both sides must
    /// agree on the stream count, and a stream that declares an unsupported
    /// combination (kind or multiplexing/port-forwarding mismatch) rejects
    /// the whole session rather than being negotiated individually.
    fn validate_stream_agreement(&self, peer_streams: &[StreamDescriptor]) -> Result<(), CarrierError> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<StreamId> = streams.keys().copied().collect();
        ids.sort_unstable();
        if ids.len() != peer_streams.len() {
            return Err(CarrierError::with_context(
                Facility::Session,
                ErrorKind::ProtocolError,
                format!(
                    "local and remote stream counts disagree: local={}, remote={}",
                    ids.len(),
                    peer_streams.len()
                ),
            ));
        }
        for (ordinal, &id) in ids.iter().enumerate() {
            let local = &streams[&id];
            let remote = &peer_streams[ordinal];
            if local.kind != remote.kind
                || local.options.multiplexing != remote.options.multiplexing
                || local.options.port_forwarding != remote.options.port_forwarding
            {
                return Err(CarrierError::with_context(
                    Facility::Session,
                    ErrorKind::ProtocolError,
                    format!("stream ordinal {ordinal} declares an unsupported combination"),
                ));
            }
        }
        Ok(())
    }

    /// Spec §4.2: applies the peer's ICE credentials/candidates, arms the
    /// transport, and moves every `transport-ready` stream to `connecting`.
    /// Rejects the session (failing every stream) if the peer's ordinal
    /// stream list disagrees in count or in any entry's combination.
    pub fn session_start(&self, peer_sdp: &SessionDescription) -> Result<(), CarrierError> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*state, SessionState::Offering | SessionState::Answering) {
                return Err(wrong_state(Facility::Session, "session_start called out of order"));
            }
        }
        if let Err(e) = self.validate_stream_agreement(&peer_sdp.streams) {
            crate::sink_warn!(self.logger, "session with {} rejected: {e}", self.remote_id);
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            for (&id, entry) in streams.iter_mut() {
                Self::try_transition(entry, id, StreamState::Failed);
            }
            drop(streams);
            self.set_state(SessionState::Closed);
            return Err(e);
        }
        self.ensure_transport()?;
        let handle = self.transport_handle()?;
        for cd in &peer_sdp.candidates {
            handle.add_remote_candidate(Candidate::new(cd.addr, cd.kind));
        }
        handle.set_remote_credentials(peer_sdp.ufrag.clone(), peer_sdp.pwd.clone());

        self.set_state(SessionState::Ready);
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for (&id, entry) in streams.iter_mut() {
            Self::try_transition(entry, id, StreamState::Connecting);
        }
        Ok(())
    }

    /// Serializes the local session description: credentials, the gathered
    /// local candidate, the ordinal stream list, and registered services.
    pub fn build_local_sdp(&self) -> Result<SessionDescription, CarrierError> {
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| wrong_state(Facility::Session, "local credentials not established yet"))?;
        let candidate = *self
            .local_candidate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .ok_or_else(|| wrong_state(Facility::Session, "transport not ready: add a stream first"))?;

        let mut sdp = SessionDescription::new(credentials.0, credentials.1);
        sdp.push_candidate(candidate);

        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<StreamId> = streams.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let entry = &streams[&id];
            sdp.streams.push(StreamDescriptor { kind: entry.kind, options: entry.options });
        }
        drop(streams);

        for svc in self.services.lock().unwrap_or_else(|e| e.into_inner()).values() {
            sdp.services.push(ServiceRegistration { name: svc.name.clone(), host: svc.host.clone(), port: svc.port });
        }
        Ok(sdp)
    }

    pub fn mark_offering(&self) {
        self.set_state(SessionState::Offering);
    }

    /// Synchronous, idempotent teardown (spec §5 "cancellation"): every
    /// non-terminal stream emits its terminal callback before this returns,
    /// and the ICE worker is joined before the call returns.
    pub fn session_close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, SessionState::Closed) {
                return;
            }
            *state = SessionState::Closed;
        }
        self.stop_events.store(true, Ordering::SeqCst);

        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for (&id, entry) in streams.iter_mut() {
            Self::try_transition(entry, id, StreamState::Closed);
        }
        drop(streams);

        // Dropping the worker stops and joins its thread (IceWorker::drop).
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(join) = self.event_thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = join.join();
        }
    }

    fn dial_service_backend(&self, stream_id: StreamId, channel_id: ChannelId, cookie: &[u8]) -> bool {
        let Ok(name) = std::str::from_utf8(cookie) else { return false };
        let service = {
            let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            let Some(service) = services.get(name) else {
                crate::sink_warn!(self.logger, "port forward request for unregistered service '{name}'");
                return false;
            };
            service.clone()
        };
        let Ok(mut addrs) = (service.host.as_str(), service.port).to_socket_addrs() else {
            return false;
        };
        let Some(addr) = addrs.next() else { return false };
        let Ok(socket) = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) else {
            crate::sink_warn!(self.logger, "port forward dial to {}:{} failed", service.host, service.port);
            return false;
        };
        let Ok(write_side) = socket.try_clone() else {
            return false;
        };

        self.pf_channels.lock().unwrap_or_else(|e| e.into_inner()).insert((stream_id, channel_id));
        self.port_forward.register_socket(stream_id, channel_id, write_side);

        let Ok(session_handle) = self.transport_handle() else {
            return false;
        };
        portforward::spawn_tcp_to_channel_pump(
            socket,
            stream_id,
            channel_id,
            move |ch, bytes| session_handle.write_channel(stream_id, ch, bytes.to_vec()).is_ok(),
            || {},
        );
        true
    }
}

impl MuxCallbacks for Session {
    fn on_stream_data(&self, stream: StreamId, bytes: Vec<u8>) {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = streams.get(&stream) {
            entry.callbacks.on_stream_data(stream, bytes);
        }
    }

    fn on_channel_open_request(&self, stream: StreamId, channel: ChannelId, cookie: Vec<u8>) -> bool {
        let port_forwarding = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stream)
            .is_some_and(|e| e.options.port_forwarding);
        if port_forwarding {
            return self.dial_service_backend(stream, channel, &cookie);
        }
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(&stream).is_some_and(|e| e.callbacks.on_channel_open(stream, channel, cookie))
    }

    fn on_channel_opened(&self, stream: StreamId, channel: ChannelId) {
        if self.pf_channels.lock().unwrap_or_else(|e| e.into_inner()).contains(&(stream, channel)) {
            self.port_forward.notify_opened(stream, channel);
            return;
        }
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = streams.get(&stream) {
            entry.callbacks.on_channel_opened(stream, channel);
        }
    }

    fn on_channel_data(&self, stream: StreamId, channel: ChannelId, bytes: Vec<u8>) {
        if self.pf_channels.lock().unwrap_or_else(|e| e.into_inner()).contains(&(stream, channel)) {
            self.port_forward.deliver(stream, channel, &bytes);
            return;
        }
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = streams.get(&stream) {
            entry.callbacks.on_channel_data(stream, channel, bytes);
        }
    }

    fn on_channel_close(&self, stream: StreamId, channel: ChannelId, reason: crate::channel::CloseReason) {
        if self
            .pf_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(stream, channel))
        {
            self.port_forward.close(stream, channel);
            return;
        }
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = streams.get(&stream) {
            entry.callbacks.on_channel_close(stream, channel, reason);
        }
    }

    fn on_channel_pend(&self, stream: StreamId, channel: ChannelId, paused: bool) {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = streams.get(&stream) {
            entry.callbacks.on_channel_pend(stream, channel, paused);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.session_close();
    }
}
