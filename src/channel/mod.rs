//! Logical sub-stream inside a multiplexing stream (spec §3 "Channel", §4.5).

use std::sync::atomic::{AtomicU16, Ordering};

pub type ChannelId = u16;

/// `0` is reserved on the wire for stream-wide control frames; real channels
/// start at 1 and increase monotonically within a stream (spec §4.3).
pub const CONTROL_CHANNEL: ChannelId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Local side sent SYN, awaiting the peer's ACK/FIN.
    Opening,
    Open,
    /// Remote asked us to stop sending (we received PEND).
    RemotePending,
    /// We asked the remote to stop sending (we sent PEND).
    LocalPending,
    Closing,
    Closed,
}

impl ChannelState {
    /// Per spec §3: a channel may carry user data except when the *local*
    /// side has been asked to stop (`LocalPending`) or the channel is not
    /// yet (or no longer) open. `RemotePending` only pauses the remote's
    /// sends to us — we may still send to them.
    #[must_use]
    pub const fn can_send_data(self) -> bool {
        matches!(self, Self::Open | Self::RemotePending)
    }
}

/// Surfaced to the application on close (spec §4.5, §8 invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Peer sent FIN.
    Normal,
    /// Keep-alive expired.
    Timeout,
    /// Protocol violation or reliable-mode retransmit limit exceeded.
    Error,
}

/// Monotonic per-stream channel id allocator; ids are never recycled within
/// the lifetime of a stream (spec §3 invariant).
#[derive(Debug, Default)]
pub struct ChannelIdAllocator {
    next: AtomicU16,
}

impl ChannelIdAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    /// Returns `None` once the 16-bit id space is exhausted.
    pub fn allocate(&self) -> Option<ChannelId> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if id == 0 { None } else { Some(id) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let alloc = ChannelIdAllocator::new();
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
    }

    #[test]
    fn open_and_remote_pending_can_send_but_local_pending_and_closed_cannot() {
        assert!(ChannelState::Open.can_send_data());
        assert!(ChannelState::RemotePending.can_send_data());
        assert!(!ChannelState::Closed.can_send_data());
        assert!(!ChannelState::LocalPending.can_send_data());
    }
}
