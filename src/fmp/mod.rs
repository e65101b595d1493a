//! Flex Multiplexer: framing, crypto, reliability, and the engine that ties
//! them together (spec §4.5). Not literal SCTP — this is the core's own
//! wire protocol, shaped after `sctp::*`'s worker-owned design.

pub mod crypto;
pub mod frame;
pub mod multiplexer;
pub mod reliability;

pub use multiplexer::{MuxCallbacks, Multiplexer, MAX_CHANNELS_PER_STREAM, MAX_COOKIE_LEN};
