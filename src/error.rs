//! Domain-stable error taxonomy shared by every layer of the engine.
//!
//! Errors are packed as `(facility, kind)` pairs per the propagation policy:
//! the layer that detects a fault maps its local error into the nearest
//! `(Facility, ErrorKind)` rather than inventing a new shape per module.

use std::fmt;

/// Which layer raised the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    General,
    Identity,
    Ice,
    Fmp,
    Sdp,
    Session,
    PortForward,
    Io,
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::Identity => "identity",
            Self::Ice => "ice",
            Self::Fmp => "fmp",
            Self::Sdp => "sdp",
            Self::Session => "session",
            Self::PortForward => "portforward",
            Self::Io => "io",
        };
        f.write_str(s)
    }
}

/// Domain-stable error kind, independent of which facility raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgs,
    OutOfMemory,
    NotExist,
    AlreadyExist,
    WrongState,
    /// Non-fatal, retryable: the only routine non-error return path.
    Busy,
    LimitExceeded,
    TooLong,
    /// Transient; callers may retry.
    FriendOffline,
    IceFailed,
    ProtocolError,
    Timeout,
    AddSelf,
    BadAddress,
    PortAlloc,
    BadProxyConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgs => "invalid_args",
            Self::OutOfMemory => "out_of_memory",
            Self::NotExist => "not_exist",
            Self::AlreadyExist => "already_exist",
            Self::WrongState => "wrong_state",
            Self::Busy => "busy",
            Self::LimitExceeded => "limit_exceeded",
            Self::TooLong => "too_long",
            Self::FriendOffline => "friend_offline",
            Self::IceFailed => "ice_failed",
            Self::ProtocolError => "protocol_error",
            Self::Timeout => "timeout",
            Self::AddSelf => "add_self",
            Self::BadAddress => "bad_address",
            Self::PortAlloc => "port_alloc",
            Self::BadProxyConfig => "bad_proxy_config",
        };
        f.write_str(s)
    }
}

/// A `(facility, kind)` error, with an optional human-readable context string.
#[derive(Debug, Clone)]
pub struct CarrierError {
    pub facility: Facility,
    pub kind: ErrorKind,
    pub context: Option<String>,
}

impl CarrierError {
    #[must_use]
    pub fn new(facility: Facility, kind: ErrorKind) -> Self {
        Self {
            facility,
            kind,
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(facility: Facility, kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            facility,
            kind,
            context: Some(context.into()),
        }
    }

    /// `BUSY` is the only routine non-error return path; this documents the check.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self.kind, ErrorKind::Busy)
    }

    /// Transient errors callers may retry without changing anything.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Busy | ErrorKind::FriendOffline)
    }
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "[{}:{}] {ctx}", self.facility, self.kind),
            None => write!(f, "[{}:{}]", self.facility, self.kind),
        }
    }
}

impl std::error::Error for CarrierError {}

impl From<std::io::Error> for CarrierError {
    fn from(e: std::io::Error) -> Self {
        Self::with_context(Facility::Io, ErrorKind::ProtocolError, e.to_string())
    }
}

/// Shorthand constructors used throughout the engine.
pub fn wrong_state(facility: Facility, context: impl Into<String>) -> CarrierError {
    CarrierError::with_context(facility, ErrorKind::WrongState, context)
}

pub fn not_exist(facility: Facility, context: impl Into<String>) -> CarrierError {
    CarrierError::with_context(facility, ErrorKind::NotExist, context)
}

pub fn busy(facility: Facility) -> CarrierError {
    CarrierError::new(facility, ErrorKind::Busy)
}

pub type Result<T> = std::result::Result<T, CarrierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_transient_but_already_exist_is_not() {
        let e = busy(Facility::Fmp);
        assert!(e.is_busy());
        assert!(e.is_transient());

        let e2 = CarrierError::new(Facility::Session, ErrorKind::AlreadyExist);
        assert!(!e2.is_busy());
        assert!(!e2.is_transient());
    }

    #[test]
    fn display_includes_context() {
        let e = wrong_state(Facility::Session, "stream not ready");
        let s = e.to_string();
        assert!(s.contains("session"));
        assert!(s.contains("wrong_state"));
        assert!(s.contains("stream not ready"));
    }
}
