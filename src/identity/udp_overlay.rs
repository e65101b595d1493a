//! Minimal point-to-point `FriendOverlay` over UDP (spec §1: "the underlying
//! DHT/friend overlay... is assumed to deliver identity-addressed
//! datagrams").
//!
//! This crate does not implement a DHT -- building one is explicitly out of
//! scope. `pfd` and `speedtest` still need *something* concrete to run
//! against, so this is a single-static-peer stand-in: one UserId is "the
//! friend", its address comes straight from config, and invites/replies ride
//! a small length-prefixed envelope over a plain UDP socket with a short
//! repeat-send for a little loss tolerance. No presence, no discovery, no
//! store-and-forward -- a real deployment swaps this out for a DHT-backed
//! `FriendOverlay` without touching anything above the trait.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CarrierError, ErrorKind, Facility};
use crate::identity::overlay::{FriendEvent, FriendOverlay};
use crate::identity::user_id::UserId;
use crate::log::logger_handle::LoggerHandle;

const KIND_INVITE: u8 = 1;
const KIND_REPLY: u8 = 2;
const REPEAT_SENDS: u32 = 3;
const REPEAT_INTERVAL: Duration = Duration::from_millis(80);

struct Envelope {
    kind: u8,
    transaction: u64,
    bundle_id: String,
    accepted: bool,
    payload: Vec<u8>,
}

impl Envelope {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + self.bundle_id.len() + self.payload.len());
        buf.write_u8(self.kind)?;
        buf.write_u64::<BigEndian>(self.transaction)?;
        match self.kind {
            KIND_INVITE => {
                #[allow(clippy::cast_possible_truncation)]
                buf.write_u8(self.bundle_id.len() as u8)?;
                buf.write_all(self.bundle_id.as_bytes())?;
            }
            _ => buf.write_u8(u8::from(self.accepted))?,
        }
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.payload.len() as u16)?;
        buf.write_all(&self.payload)?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> io::Result<Self> {
        use std::io::{Cursor, Read, Write};
        let mut cur = Cursor::new(bytes);
        let kind = cur.read_u8()?;
        let transaction = cur.read_u64::<BigEndian>()?;
        let mut bundle_id = String::new();
        let mut accepted = false;
        match kind {
            KIND_INVITE => {
                let len = cur.read_u8()? as usize;
                let mut raw = vec![0u8; len];
                cur.read_exact(&mut raw)?;
                bundle_id = String::from_utf8(raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            KIND_REPLY => accepted = cur.read_u8()? != 0,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown envelope kind")),
        }
        let payload_len = cur.read_u16::<BigEndian>()? as usize;
        let mut payload = vec![0u8; payload_len];
        cur.read_exact(&mut payload)?;
        Ok(Self { kind, transaction, bundle_id, accepted, payload })
    }
}

/// `FriendOverlay` over a raw UDP socket, friends with exactly one
/// statically configured peer.
pub struct UdpFriendOverlay {
    peer_id: UserId,
    peer_addr: SocketAddr,
    socket: UdpSocket,
    inbox: Mutex<VecDeque<FriendEvent>>,
    next_txn: AtomicU64,
    logger: LoggerHandle,
}

impl UdpFriendOverlay {
    /// Binds `bind_addr` and treats `peer_id`@`peer_addr` as the sole friend.
    pub fn bind(
        bind_addr: SocketAddr,
        peer_id: UserId,
        peer_addr: SocketAddr,
        logger: LoggerHandle,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let overlay = Arc::new(Self {
            peer_id,
            peer_addr,
            socket,
            inbox: Mutex::new(VecDeque::new()),
            next_txn: AtomicU64::new(1),
            logger,
        });
        overlay.spawn_reader();
        Ok(overlay)
    }

    fn spawn_reader(self: &Arc<Self>) {
        let overlay = Arc::clone(self);
        thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match overlay.socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        if from != overlay.peer_addr {
                            continue;
                        }
                        match Envelope::decode(&buf[..n]) {
                            Ok(env) => overlay.on_envelope(env),
                            Err(e) => crate::sink_warn!(overlay.logger, "malformed friend-overlay datagram: {e}"),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                }
            }
        });
    }

    fn on_envelope(&self, env: Envelope) {
        let event = match env.kind {
            KIND_INVITE => FriendEvent::Invite {
                from: self.peer_id,
                bundle_id: env.bundle_id,
                payload: env.payload,
                transaction: env.transaction,
            },
            _ => FriendEvent::Reply {
                transaction: env.transaction,
                from: self.peer_id,
                accepted: env.accepted,
                payload: env.payload,
            },
        };
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).push_back(event);
    }

    fn send_envelope(&self, env: &Envelope) -> Result<(), CarrierError> {
        let bytes = env
            .encode()
            .map_err(|e| CarrierError::with_context(Facility::Identity, ErrorKind::ProtocolError, e.to_string()))?;
        for i in 0..REPEAT_SENDS {
            let _ = self.socket.send_to(&bytes, self.peer_addr);
            if i + 1 < REPEAT_SENDS {
                thread::sleep(REPEAT_INTERVAL);
            }
        }
        Ok(())
    }
}

impl FriendOverlay for UdpFriendOverlay {
    fn is_friend(&self, user: &UserId) -> bool {
        *user == self.peer_id
    }

    fn send_invite(&self, user: &UserId, bundle_id: &str, payload: &[u8]) -> Result<u64, CarrierError> {
        if *user != self.peer_id {
            return Err(CarrierError::with_context(
                Facility::Identity,
                ErrorKind::NotExist,
                "overlay knows only the configured peer",
            ));
        }
        let txn = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.send_envelope(&Envelope {
            kind: KIND_INVITE,
            transaction: txn,
            bundle_id: bundle_id.to_string(),
            accepted: false,
            payload: payload.to_vec(),
        })?;
        Ok(txn)
    }

    fn send_reply(&self, transaction: u64, accepted: bool, payload: &[u8]) -> Result<(), CarrierError> {
        self.send_envelope(&Envelope {
            kind: KIND_REPLY,
            transaction,
            bundle_id: String::new(),
            accepted,
            payload: payload.to_vec(),
        })
    }

    fn poll_events(&self) -> Vec<FriendEvent> {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn id(byte: u8) -> UserId {
        UserId::from_bytes([byte; 32])
    }

    fn test_logger() -> LoggerHandle {
        crate::log::logger::Logger::start_in_dir(std::env::temp_dir(), "udp-overlay-test", 64, 8, 1).handle()
    }

    #[test]
    fn invite_round_trips_between_two_bound_sockets() {
        let a_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a_sock = UdpSocket::bind(a_addr).unwrap();
        let b_sock = UdpSocket::bind(b_addr).unwrap();
        let a_local = a_sock.local_addr().unwrap();
        let b_local = b_sock.local_addr().unwrap();
        drop(a_sock);
        drop(b_sock);

        let a = UdpFriendOverlay::bind(a_local, id(2), b_local, test_logger()).unwrap();
        let b = UdpFriendOverlay::bind(b_local, id(1), a_local, test_logger()).unwrap();

        assert!(a.is_friend(&id(2)));
        assert!(!a.is_friend(&id(9)));

        let txn = a.send_invite(&id(2), "session", b"hello-sdp").unwrap();

        let mut got = Vec::new();
        for _ in 0..20 {
            got.extend(b.poll_events());
            if !got.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(got.len(), 1);
        match &got[0] {
            FriendEvent::Invite { from, bundle_id, payload, transaction } => {
                assert_eq!(*from, id(1));
                assert_eq!(bundle_id, "session");
                assert_eq!(payload, b"hello-sdp");
                assert_eq!(*transaction, txn);
            }
            other => panic!("expected Invite, got {other:?}"),
        }

        b.send_reply(txn, true, b"ok").unwrap();
        let mut replies = Vec::new();
        for _ in 0..20 {
            replies.extend(a.poll_events());
            if !replies.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            FriendEvent::Reply { transaction: t, accepted, payload, .. } => {
                assert_eq!(*t, txn);
                assert!(*accepted);
                assert_eq!(payload, b"ok");
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }
}
