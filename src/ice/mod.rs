//! ICE transport (spec §4.4): one worker thread per session managing a
//! STUN/TURN candidate set, pairing, connectivity checks, and keep-alive,
//! offering a datagram send/recv surface to the flex multiplexer.

pub mod agent;
pub mod candidate;
pub mod worker;

pub use agent::{IceAgent, IceRole};
pub use candidate::{Candidate, CandidateKind};
pub use worker::{IceEvent, IceTransportHandle, IceWorker};
