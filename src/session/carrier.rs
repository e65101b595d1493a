//! `Carrier`: the top-level handle an application owns (spec §9 "Reshape
//! as an explicit `SessionManager` value owned by the application and
//! passed in as a handle; applications that want a single-session
//! convenience use a thin accessor rather than hidden globals").
//!
//! Bundles the pieces spec.md treats as external collaborators or ambient
//! concerns -- `Config`, the process `LoggerHandle`, the `FriendOverlay`
//! implementation -- with the in-scope `SessionManager`, so a consumer
//! binary (`pfd`, `speedtest`) has one object to construct and hold.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{not_exist, CarrierError, Facility};
use crate::identity::overlay::FriendOverlay;
use crate::identity::user_id::UserId;
use crate::log::logger_handle::LoggerHandle;
use crate::session::manager::{RequestHandler, SessionManager};
use crate::session::session::Session;

pub struct Carrier {
    pub self_id: UserId,
    config: Config,
    logger: LoggerHandle,
    manager: Arc<SessionManager>,
    /// Remembers the peer of the most recently created/answered session, so
    /// single-peer consumer apps (`pfd`, `speedtest`) can fetch "the"
    /// session without tracking a `UserId` themselves.
    primary_peer: std::sync::Mutex<Option<UserId>>,
}

impl Carrier {
    /// Spec §4.1 `init`: wires the overlay's friend-invite channel to a
    /// fresh `SessionManager`. `bind_ip` is the address new ICE sockets bind
    /// on (ephemeral port per session).
    #[must_use]
    pub fn new(
        self_id: UserId,
        config: Config,
        overlay: Arc<dyn FriendOverlay>,
        bind_ip: IpAddr,
        logger: LoggerHandle,
        on_request: RequestHandler,
    ) -> Self {
        let manager = SessionManager::init(overlay, bind_ip, logger.clone(), on_request);
        Self {
            self_id,
            config,
            logger,
            manager,
            primary_peer: std::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn logger(&self) -> &LoggerHandle {
        &self.logger
    }

    #[must_use]
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Spec §4.1 `new`: creates an outbound session and remembers it as the
    /// single-session convenience accessor's target.
    pub fn connect(&self, peer: UserId) -> Result<Arc<Session>, CarrierError> {
        let session = self.manager.new_session(peer)?;
        *self.primary_peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
        Ok(session)
    }

    /// Single-session convenience accessor (spec §9): the most recently
    /// connected-to or answered peer's session, for applications that only
    /// ever talk to one peer at a time.
    pub fn primary_session(&self) -> Result<Arc<Session>, CarrierError> {
        let peer = self
            .primary_peer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| not_exist(Facility::Session, "no session established yet"))?;
        self.manager
            .session(&peer)
            .ok_or_else(|| not_exist(Facility::Session, "session was closed"))
    }

    /// Records `peer` as the primary session target; called by an
    /// `on_request` handler once it accepts an inbound invite, so
    /// `primary_session` also works on the answering side.
    pub fn note_inbound_peer(&self, peer: UserId) {
        *self.primary_peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
    }

    /// Spec §4.1 `session_cleanup`.
    pub fn shutdown(&self) {
        self.manager.cleanup();
    }
}

impl Drop for Carrier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::identity::mock_overlay::MockFriendOverlay;

    fn id(byte: u8) -> UserId {
        UserId::from_bytes([byte; 32])
    }

    fn test_logger() -> LoggerHandle {
        crate::log::logger::Logger::start_in_dir(std::env::temp_dir(), "carrier-test", 64, 8, 1).handle()
    }

    #[test]
    fn primary_session_is_unset_until_connect() {
        let (a, _b) = MockFriendOverlay::pair(id(1), id(2));
        let carrier = Carrier::new(id(1), Config::empty(), a, "127.0.0.1".parse().unwrap(), test_logger(), Arc::new(|_, _, _| {}));
        assert!(carrier.primary_session().is_err());
        let _session = carrier.connect(id(2)).unwrap();
        assert!(carrier.primary_session().is_ok());
    }
}
