//! In-process loopback pair standing in for a real DHT/friend overlay.
//!
//! Grounded on RustyRTC's `ice::signaling_mock` (a same-process stand-in for
//! what is otherwise a real network service) — here generalized into a pair
//! of `FriendOverlay` implementors that hand events directly to each other
//! instead of round-tripping through a file or socket.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CarrierError, ErrorKind, Facility};
use crate::identity::overlay::{FriendEvent, FriendOverlay};
use crate::identity::user_id::UserId;

/// Shared event queue one endpoint delivers into and the other drains.
type Inbox = Arc<Mutex<VecDeque<FriendEvent>>>;

pub struct MockFriendOverlay {
    self_id: UserId,
    friends: Mutex<HashSet<UserId>>,
    inbox: Inbox,
    peer_inbox: Inbox,
    next_txn: AtomicU64,
}

impl MockFriendOverlay {
    /// Builds a connected pair: `a`'s `send_invite`/`send_reply` lands in
    /// `b`'s `poll_events`, and vice versa.
    #[must_use]
    pub fn pair(a_id: UserId, b_id: UserId) -> (Arc<Self>, Arc<Self>) {
        let inbox_a: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let inbox_b: Inbox = Arc::new(Mutex::new(VecDeque::new()));

        let a = Arc::new(Self {
            self_id: a_id,
            friends: Mutex::new(HashSet::from([b_id])),
            inbox: inbox_a.clone(),
            peer_inbox: inbox_b.clone(),
            next_txn: AtomicU64::new(1),
        });
        let b = Arc::new(Self {
            self_id: b_id,
            friends: Mutex::new(HashSet::from([a_id])),
            inbox: inbox_b,
            peer_inbox: inbox_a,
            next_txn: AtomicU64::new(1),
        });
        (a, b)
    }

    pub fn add_friend(&self, user: UserId) {
        self.friends.lock().unwrap_or_else(|e| e.into_inner()).insert(user);
    }

    pub fn remove_friend(&self, user: &UserId) {
        self.friends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user);
    }
}

impl FriendOverlay for MockFriendOverlay {
    fn is_friend(&self, user: &UserId) -> bool {
        self.friends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(user)
    }

    fn send_invite(&self, user: &UserId, bundle_id: &str, payload: &[u8]) -> Result<u64, CarrierError> {
        if !self.is_friend(user) {
            return Err(CarrierError::new(Facility::Identity, ErrorKind::FriendOffline));
        }
        let txn = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.peer_inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(FriendEvent::Invite {
                from: self.self_id,
                bundle_id: bundle_id.to_string(),
                payload: payload.to_vec(),
                transaction: txn,
            });
        Ok(txn)
    }

    fn send_reply(&self, transaction: u64, accepted: bool, payload: &[u8]) -> Result<(), CarrierError> {
        self.peer_inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(FriendEvent::Reply {
                transaction,
                from: self.self_id,
                accepted,
                payload: payload.to_vec(),
            });
        Ok(())
    }

    fn poll_events(&self) -> Vec<FriendEvent> {
        let mut guard = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        guard.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn id(byte: u8) -> UserId {
        UserId::from_bytes([byte; 32])
    }

    #[test]
    fn invite_is_delivered_to_the_peer_only() {
        let (a, b) = MockFriendOverlay::pair(id(1), id(2));
        a.send_invite(&id(2), "session", b"hello").unwrap();

        assert!(a.poll_events().is_empty());
        let events = b.poll_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FriendEvent::Invite { from, bundle_id, payload, .. } => {
                assert_eq!(*from, id(1));
                assert_eq!(bundle_id, "session");
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn reply_round_trips_back_to_the_inviter() {
        let (a, b) = MockFriendOverlay::pair(id(1), id(2));
        let _ = a.send_invite(&id(2), "session", b"offer").unwrap();
        let events = b.poll_events();
        let FriendEvent::Invite { transaction: txn, .. } = events[0] else {
            panic!("expected invite");
        };
        b.send_reply(txn, true, b"answer").unwrap();

        let events = a.poll_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FriendEvent::Reply { transaction, accepted, payload, .. } => {
                assert_eq!(*transaction, txn);
                assert!(*accepted);
                assert_eq!(payload, b"answer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn invite_to_stranger_fails() {
        let (a, _b) = MockFriendOverlay::pair(id(1), id(2));
        let stranger = id(99);
        let err = a.send_invite(&stranger, "session", b"hi").unwrap_err();
        assert_eq!(err.kind, ErrorKind::FriendOffline);
    }
}
