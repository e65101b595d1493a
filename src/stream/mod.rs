//! Per-stream handle (spec §3 "Stream", §4.3).
//!
//! The state machine and options bitset live in [`state`] and [`options`];
//! this module adds the callback trait applications implement and the
//! handle returned by `Session::add_stream`, which forwards every operation
//! to the session's `IceTransportHandle`.

pub mod options;
pub mod state;

use std::sync::{Arc, Mutex, Weak};

use crate::channel::{ChannelId, CloseReason};
use crate::error::{CarrierError, ErrorKind, Facility};
use crate::ice::IceTransportHandle;
use crate::session::session::Session;
pub use options::{StreamId, StreamKind, StreamOptions};
pub use state::StreamState;

/// Application-supplied callbacks for one stream (spec §4.3 "upward
/// callbacks for data, channel events, state transitions").
pub trait StreamCallbacks: Send + Sync {
    fn on_state_changed(&self, stream: StreamId, state: StreamState) {
        let _ = (stream, state);
    }
    fn on_stream_data(&self, stream: StreamId, bytes: Vec<u8>) {
        let _ = (stream, bytes);
    }
    /// Returning `false` rejects the channel (spec §9: closed with `Error`).
    fn on_channel_open(&self, stream: StreamId, channel: ChannelId, cookie: Vec<u8>) -> bool {
        let _ = (stream, channel, cookie);
        false
    }
    fn on_channel_opened(&self, stream: StreamId, channel: ChannelId) {
        let _ = (stream, channel);
    }
    fn on_channel_data(&self, stream: StreamId, channel: ChannelId, bytes: Vec<u8>) {
        let _ = (stream, channel, bytes);
    }
    fn on_channel_close(&self, stream: StreamId, channel: ChannelId, reason: CloseReason) {
        let _ = (stream, channel, reason);
    }
    fn on_channel_pend(&self, stream: StreamId, channel: ChannelId, paused: bool) {
        let _ = (stream, channel, paused);
    }
}

/// A no-op callback set for streams the application doesn't care to observe.
#[derive(Debug, Default)]
pub struct NoopStreamCallbacks;
impl StreamCallbacks for NoopStreamCallbacks {}

/// Bookkeeping the session keeps per stream; not exposed directly.
pub(crate) struct StreamEntry {
    pub kind: StreamKind,
    pub options: StreamOptions,
    pub state: StreamState,
    pub callbacks: Arc<dyn StreamCallbacks>,
}

/// Handle returned by `Session::add_stream`. Cheap to clone; every operation
/// is forwarded to the owning session's ICE worker thread and blocks only on
/// that thread's reply (spec §5 "public API calls ... take no locks held
/// across callbacks").
#[derive(Clone)]
pub struct Stream {
    pub(crate) session: Weak<Session>,
    pub(crate) stream_id: StreamId,
    pub(crate) kind: StreamKind,
    pub(crate) options: StreamOptions,
}

impl Stream {
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    #[must_use]
    pub fn options(&self) -> StreamOptions {
        self.options
    }

    #[must_use]
    pub fn state(&self) -> Option<StreamState> {
        self.session.upgrade().and_then(|s| s.stream_state(self.stream_id))
    }

    fn transport(&self) -> Result<IceTransportHandle, CarrierError> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| CarrierError::new(Facility::Session, ErrorKind::WrongState))?;
        session.transport_handle()
    }

    /// Returns bytes accepted (always the full length on success). Spec
    /// §4.3: zero-byte payloads are `INVALID_ARGS`, a full send window is
    /// the routine, retryable `BUSY`.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, CarrierError> {
        if bytes.is_empty() {
            return Err(CarrierError::new(Facility::Session, ErrorKind::InvalidArgs));
        }
        if self.state() != Some(StreamState::Connected) {
            return Err(CarrierError::new(Facility::Session, ErrorKind::WrongState));
        }
        self.transport()?.write_stream(self.stream_id, bytes.to_vec())?;
        Ok(bytes.len())
    }

    pub fn open_channel(&self, cookie: &[u8]) -> Result<ChannelId, CarrierError> {
        if !self.options.multiplexing {
            return Err(CarrierError::new(Facility::Session, ErrorKind::WrongState));
        }
        self.transport()?.open_channel(self.stream_id, cookie.to_vec())
    }

    pub fn write_channel(&self, channel: ChannelId, bytes: &[u8]) -> Result<usize, CarrierError> {
        if bytes.is_empty() {
            return Err(CarrierError::new(Facility::Session, ErrorKind::InvalidArgs));
        }
        self.transport()?.write_channel(self.stream_id, channel, bytes.to_vec())?;
        Ok(bytes.len())
    }

    pub fn close_channel(&self, channel: ChannelId) -> Result<(), CarrierError> {
        self.transport()?.close_channel(self.stream_id, channel)
    }

    pub fn pend_channel(&self, channel: ChannelId) -> Result<(), CarrierError> {
        self.transport()?.pend_channel(self.stream_id, channel)
    }

    pub fn resume_channel(&self, channel: ChannelId) -> Result<(), CarrierError> {
        self.transport()?.resume_channel(self.stream_id, channel)
    }

    /// Opens an outbound port forwarding (spec §4.6): binds a local TCP
    /// listener and pipes every accepted connection into a dedicated
    /// channel carrying `service_name` as its open cookie.
    pub fn open_port_forwarding(
        &self,
        service_name: &str,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<(), CarrierError> {
        if !self.options.port_forwarding {
            return Err(CarrierError::new(Facility::Session, ErrorKind::WrongState));
        }
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| CarrierError::new(Facility::Session, ErrorKind::WrongState))?;
        session.start_outbound_forwarding(self.stream_id, service_name, bind_host, bind_port)
    }
}

pub(crate) type StreamTable = Mutex<std::collections::HashMap<StreamId, StreamEntry>>;
