//! Peer-to-peer carrier and session runtime: SDP-based session negotiation
//! over a friend-message channel, an ICE state machine establishing a
//! direct or relayed datagram path, and a flex multiplexer layering
//! reliable/unreliable streams, in-stream channels with flow control, and
//! TCP port-forwarding services on top of that path.
//!
//! The DHT/friend overlay itself, config file parsing, CLI dispatch, and
//! crypto primitives beyond the session key derivation are external
//! collaborators; this crate defines the `FriendOverlay` trait boundary to
//! them and ships two thin consumer binaries (`pfd`, `speedtest`) that
//! exercise the core through its public API.

/// Logical sub-streams inside a multiplexing stream: ids, state, and close
/// reasons.
pub mod channel;
/// Process configuration: key/value file format, bootstrap/service/user
/// lists.
pub mod config;
/// Domain-stable `(facility, kind)` error taxonomy shared by every layer.
pub mod error;
/// Flex multiplexer: framing, crypto, reliability, and channel flow control.
pub mod fmp;
/// ICE transport: candidate gathering, connectivity checks, keep-alive.
pub mod ice;
/// Long-lived public identity, bootstrap nodes, and the `FriendOverlay`
/// trait boundary to the external DHT/friend overlay.
pub mod identity;
/// Bounded, non-blocking process logger and `sink_*!` macros.
pub mod log;
/// TCP port-forwarding service: outbound listener pump, inbound backend
/// dial.
pub mod portforward;
/// Session description blob exchanged over the friend-invite channel.
pub mod sdp;
/// Session, session manager, and the `Carrier` facade.
pub mod session;
/// Per-stream state machine, options bitset, and application callback
/// surface.
pub mod stream;
