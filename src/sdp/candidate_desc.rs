use std::net::SocketAddr;

use crate::ice::CandidateKind;

/// Wire form of an ICE candidate as carried inside the SDP blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateDesc {
    pub addr: SocketAddr,
    pub priority: u32,
    pub kind: CandidateKind,
}
