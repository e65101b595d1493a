//! Stream type and options bitset (spec §3 "Stream").

use crate::error::{CarrierError, ErrorKind, Facility};

pub type StreamId = u8;

/// Only `Text`, `Application`, and `Message` are implementable; `Audio` and
/// `Video` are reserved variants per spec §1 non-goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Text,
    Application,
    Message,
    Audio,
    Video,
}

impl StreamKind {
    #[must_use]
    pub const fn is_implemented(self) -> bool {
        matches!(self, Self::Text | Self::Application | Self::Message)
    }

    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Application => 1,
            Self::Message => 2,
            Self::Audio => 3,
            Self::Video => 4,
        }
    }

    #[must_use]
    pub const fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Text),
            1 => Some(Self::Application),
            2 => Some(Self::Message),
            3 => Some(Self::Audio),
            4 => Some(Self::Video),
            _ => None,
        }
    }
}

/// `{reliable, plain, multiplexing, port-forwarding}` as specified in §3.
///
/// Invariant: `port_forwarding` implies `multiplexing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StreamOptions {
    pub reliable: bool,
    pub plain: bool,
    pub multiplexing: bool,
    pub port_forwarding: bool,
}

const BIT_RELIABLE: u8 = 0x01;
const BIT_PLAIN: u8 = 0x02;
const BIT_MULTIPLEXING: u8 = 0x04;
const BIT_PORT_FORWARDING: u8 = 0x08;

impl StreamOptions {
    #[must_use]
    pub fn validate(self) -> Result<Self, CarrierError> {
        if self.port_forwarding && !self.multiplexing {
            return Err(CarrierError::with_context(
                Facility::Session,
                ErrorKind::InvalidArgs,
                "port-forwarding requires multiplexing",
            ));
        }
        Ok(self)
    }

    #[must_use]
    pub const fn to_bits(self) -> u8 {
        let mut b = 0u8;
        if self.reliable {
            b |= BIT_RELIABLE;
        }
        if self.plain {
            b |= BIT_PLAIN;
        }
        if self.multiplexing {
            b |= BIT_MULTIPLEXING;
        }
        if self.port_forwarding {
            b |= BIT_PORT_FORWARDING;
        }
        b
    }

    #[must_use]
    pub const fn from_bits(b: u8) -> Self {
        Self {
            reliable: b & BIT_RELIABLE != 0,
            plain: b & BIT_PLAIN != 0,
            multiplexing: b & BIT_MULTIPLEXING != 0,
            port_forwarding: b & BIT_PORT_FORWARDING != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_forwarding_without_multiplexing_is_rejected() {
        let opts = StreamOptions {
            port_forwarding: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn bits_round_trip() {
        let opts = StreamOptions {
            reliable: true,
            plain: false,
            multiplexing: true,
            port_forwarding: true,
        };
        assert_eq!(StreamOptions::from_bits(opts.to_bits()), opts);
    }

    #[test]
    fn kind_wire_round_trips_for_implemented_kinds() {
        for k in [StreamKind::Text, StreamKind::Application, StreamKind::Message] {
            assert_eq!(StreamKind::from_wire(k.to_wire()), Some(k));
            assert!(k.is_implemented());
        }
        assert!(!StreamKind::Audio.is_implemented());
        assert!(!StreamKind::Video.is_implemented());
    }
}
