//! Selective-repeat reliability: send window, RTT-seeded retransmit timer,
//! and the receive-side reorder buffer (spec §4.5).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const INITIAL_RTO: Duration = Duration::from_millis(500);
pub const MIN_RTO: Duration = Duration::from_millis(100);
pub const MAX_RTO: Duration = Duration::from_secs(5);
pub const SEND_WINDOW: usize = 32;
/// Reliable-mode retransmit limit; exceeding it surfaces `CloseReason::Error`.
pub const MAX_RETRIES: u32 = 12;

#[derive(Debug, Clone)]
pub struct InFlightPacket {
    pub payload: Vec<u8>,
    pub sent_at: Instant,
    pub retries: u32,
}

/// Smoothed RTT estimator (Jacobson/Karels), seeded per spec §4.5.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::from_millis(250),
        }
    }
}

impl RttEstimator {
    pub fn sample(&mut self, measured: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(measured);
                self.rttvar = measured / 2;
            }
            Some(srtt) => {
                let delta = if measured > srtt {
                    measured - srtt
                } else {
                    srtt - measured
                };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 3 + measured) / 4);
            }
        }
    }

    #[must_use]
    pub fn rto(&self) -> Duration {
        let base = self.srtt.unwrap_or(INITIAL_RTO) + self.rttvar * 4;
        base.clamp(MIN_RTO, MAX_RTO)
    }
}

/// Tracks unacked outbound packets for one (stream, channel) reliable flow.
#[derive(Debug, Default)]
pub struct SendWindow {
    pub next_seq: u32,
    pub inflight: BTreeMap<u32, InFlightPacket>,
    pub rtt: RttEstimator,
}

impl SendWindow {
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inflight.len() >= SEND_WINDOW
    }

    pub fn track(&mut self, seq: u32, payload: Vec<u8>) {
        self.inflight.insert(
            seq,
            InFlightPacket {
                payload,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
    }

    /// Applies a cumulative ack + bitmap, dropping every packet it covers.
    /// Returns the RTT sample taken from the cumulative ack's packet, if any.
    pub fn apply_ack(&mut self, cumulative: u32, bitmap: u32) -> Option<Duration> {
        let mut rtt_sample = None;
        let to_drop: Vec<u32> = self
            .inflight
            .keys()
            .copied()
            .filter(|&seq| seq <= cumulative || bitmap_covers(bitmap, cumulative, seq))
            .collect();
        for seq in to_drop {
            if let Some(pkt) = self.inflight.remove(&seq)
                && pkt.retries == 0
            {
                rtt_sample = Some(pkt.sent_at.elapsed());
            }
        }
        rtt_sample
    }

    /// Packets whose RTO has elapsed, each retransmitted with backoff.
    /// Returns `(seq, payload)` pairs to resend, and the seqs that exceeded
    /// `MAX_RETRIES` (caller should treat the flow as failed).
    pub fn due_for_retransmit(&mut self) -> (Vec<(u32, Vec<u8>)>, Vec<u32>) {
        let rto = self.rtt.rto();
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        for (&seq, pkt) in &mut self.inflight {
            if pkt.sent_at.elapsed() >= rto {
                pkt.retries += 1;
                pkt.sent_at = Instant::now();
                if pkt.retries > MAX_RETRIES {
                    exhausted.push(seq);
                } else {
                    resend.push((seq, pkt.payload.clone()));
                }
            }
        }
        (resend, exhausted)
    }
}

fn bitmap_covers(bitmap: u32, cumulative: u32, seq: u32) -> bool {
    if seq <= cumulative {
        return true;
    }
    let offset = seq - cumulative - 1;
    offset < 32 && (bitmap >> offset) & 1 != 0
}

/// Receive-side reorder buffer: holds out-of-order packets until the gap
/// fills, then drains a contiguous run in order (spec §8 invariant 2).
#[derive(Debug, Default)]
pub struct RecvBuffer {
    pub next_expected: u32,
    pub held: BTreeMap<u32, Vec<u8>>,
}

impl RecvBuffer {
    /// Accepts an incoming packet; returns the in-order run of payloads now
    /// deliverable (possibly more than one if this packet filled a gap).
    pub fn accept(&mut self, seq: u32, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if seq < self.next_expected {
            return Vec::new(); // duplicate of something already delivered
        }
        self.held.insert(seq, payload);
        let mut out = Vec::new();
        while let Some(p) = self.held.remove(&self.next_expected) {
            out.push(p);
            self.next_expected += 1;
        }
        out
    }

    /// Builds the ack payload (cumulative + selective bitmap) to send back.
    #[must_use]
    pub fn ack(&self) -> (u32, u32) {
        let cumulative = self.next_expected.saturating_sub(1);
        let mut bitmap = 0u32;
        for (&seq, _) in self.held.range(self.next_expected..) {
            let offset = seq - self.next_expected;
            if offset < 32 {
                bitmap |= 1 << offset;
            }
        }
        (cumulative, bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_buffer_delivers_in_order_despite_reordering() {
        let mut buf = RecvBuffer::default();
        assert!(buf.accept(1, b"b".to_vec()).is_empty());
        let delivered = buf.accept(0, b"a".to_vec());
        assert_eq!(delivered, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn recv_buffer_ignores_duplicates() {
        let mut buf = RecvBuffer::default();
        buf.accept(0, b"a".to_vec());
        assert!(buf.accept(0, b"a".to_vec()).is_empty());
    }

    #[test]
    fn send_window_ack_clears_covered_packets() {
        let mut win = SendWindow::default();
        win.track(0, b"a".to_vec());
        win.track(1, b"b".to_vec());
        win.track(2, b"c".to_vec());
        win.apply_ack(0, 0b10); // cumulative 0, plus seq 2 (offset 1) selectively acked
        assert!(!win.inflight.contains_key(&0));
        assert!(win.inflight.contains_key(&1));
        assert!(!win.inflight.contains_key(&2));
    }

    #[test]
    fn window_reports_full_at_capacity() {
        let mut win = SendWindow::default();
        for i in 0..SEND_WINDOW as u32 {
            win.track(i, vec![]);
        }
        assert!(win.is_full());
    }
}
