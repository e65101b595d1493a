//! Session description blob exchanged over the friend-invite channel.
//!
//! Distinct from RTP/WebRTC SDP: this is the core's own opaque text format
//! carrying ICE credentials, candidates, the ordinal stream list, and
//! port-forwarding service registrations (spec §4.1/§4.2/§6). Framing on the
//! wire is just the friend-invite payload — this module owns serialization,
//! not transport.

mod candidate_desc;
mod codec;
mod service_desc;
mod stream_desc;

pub use candidate_desc::CandidateDesc;
pub use codec::{SessionDescription, MAX_SDP_LEN};
pub use service_desc::ServiceRegistration;
pub use stream_desc::StreamDescriptor;
