//! Candidate gathering (spec §4.4).
//!
//! Grounded on the shape of the teacher's `ice::type_ice::candidate`
//! (priority-ordered host/reflexive/relayed candidates), generalized from an
//! RTP media transport onto the carrier's own datagram path.

use std::net::{SocketAddr, UdpSocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Host => 0,
            Self::ServerReflexive => 1,
            Self::Relayed => 2,
        }
    }

    #[must_use]
    pub const fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Host),
            1 => Some(Self::ServerReflexive),
            2 => Some(Self::Relayed),
            _ => None,
        }
    }

    /// Host beats reflexive beats relayed, matching standard ICE preference.
    #[must_use]
    pub const fn preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub kind: CandidateKind,
    pub priority: u32,
}

impl Candidate {
    #[must_use]
    pub fn new(addr: SocketAddr, kind: CandidateKind) -> Self {
        let priority = (kind.preference() << 24) | (u32::from(addr.port()) & 0x00FF_FFFF);
        Self {
            addr,
            kind,
            priority,
        }
    }
}

/// Binds an ephemeral UDP socket on every local interface and wraps each
/// local address as a host candidate. The caller owns the socket (it becomes
/// the transport's send/recv surface); STUN/TURN gathering for reflexive and
/// relayed candidates is the configured external STUN/TURN server's job and
/// is represented here only as the resulting `Candidate`, not implemented.
pub fn gather_host_candidates(bind_addr: SocketAddr) -> std::io::Result<(UdpSocket, Candidate)> {
    let socket = UdpSocket::bind(bind_addr)?;
    let local = socket.local_addr()?;
    Ok((socket, Candidate::new(local, CandidateKind::Host)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn host_candidates_outrank_relayed() {
        let a = Candidate::new("127.0.0.1:1000".parse().unwrap(), CandidateKind::Host);
        let b = Candidate::new("127.0.0.1:1000".parse().unwrap(), CandidateKind::Relayed);
        assert!(a.priority > b.priority);
    }

    #[test]
    fn wire_kind_round_trips() {
        for k in [
            CandidateKind::Host,
            CandidateKind::ServerReflexive,
            CandidateKind::Relayed,
        ] {
            assert_eq!(CandidateKind::from_wire(k.to_wire()), Some(k));
        }
    }
}
