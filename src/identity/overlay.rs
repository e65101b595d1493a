//! Trait boundary to the external DHT/friend overlay.
//!
//! This crate does not implement a DHT; it assumes a collaborator that can
//! address peers by `UserId`, tell friend from stranger, carry a small
//! invite/reply payload over its own "friend-invite" channel, and surface
//! presence changes. `FriendOverlay` is that boundary.

use crate::error::CarrierError;
use crate::identity::user_id::UserId;

#[derive(Debug, Clone)]
pub enum FriendEvent {
    Invite {
        from: UserId,
        bundle_id: String,
        payload: Vec<u8>,
        /// Echoed back via `send_reply` so the inviter's `Reply` event
        /// correlates to the same transaction `send_invite` returned it.
        transaction: u64,
    },
    Added(UserId),
    Removed(UserId),
    PresenceChanged {
        user: UserId,
        online: bool,
    },
    /// Delivered to whichever side called `send_invite` once the peer answers.
    Reply {
        transaction: u64,
        from: UserId,
        accepted: bool,
        payload: Vec<u8>,
    },
}

pub trait FriendOverlay: Send + Sync {
    fn is_friend(&self, user: &UserId) -> bool;

    /// Sends an invite payload over the named bundle channel, returning a
    /// transaction id the caller can correlate against a later reply.
    fn send_invite(&self, user: &UserId, bundle_id: &str, payload: &[u8]) -> Result<u64, CarrierError>;

    fn send_reply(&self, transaction: u64, accepted: bool, payload: &[u8]) -> Result<(), CarrierError>;

    /// Drains events observed since the last poll. Never blocks.
    fn poll_events(&self) -> Vec<FriendEvent>;
}
