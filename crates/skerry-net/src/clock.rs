//! NTP-style clock synchronization.
//!
//! Each side periodically probes the peer with a `time_request`; the reply
//! carries the peer's clock. One sample estimates the peer-to-local offset
//! as `t_peer − (t_send + rtt/2)`; the estimator keeps a bounded window of
//! samples and reports their median, which is robust to latency spikes.

use std::collections::VecDeque;

use crate::packet::{Packet, TimeRequest, TimeResponse};

/// Number of samples kept in the sliding window.
pub const CLOCK_SYNC_SAMPLES: usize = 8;

/// Seconds between probe bursts once synchronized.
const RESYNC_PERIOD: f64 = 2.0;

/// Seconds after which an unanswered probe is abandoned.
const REQUEST_TIMEOUT: f64 = 1.0;

/// Bounded-sample clock-offset estimator.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    samples: VecDeque<f64>,
    /// Median of the sample window; add to a peer timestamp to translate it
    /// into local time.
    time_delta: f64,
    pending: Option<TimeRequest>,
    next_id: u32,
    last_request_time: f64,
}

impl ClockSync {
    /// Fresh estimator with no samples.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected samples.
    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Current offset estimate. Meaningless until [`count`] is nonzero.
    ///
    /// [`count`]: ClockSync::count
    #[must_use]
    pub fn time_delta(&self) -> f64 {
        self.time_delta
    }

    /// Translate a peer timestamp into local time, when samples exist.
    #[must_use]
    pub fn adjust(&self, peer_timestamp: f64) -> Option<f64> {
        (self.count() > 0).then(|| peer_timestamp + self.time_delta)
    }

    /// Periodic update; emits a probe when one is due.
    pub fn update(&mut self, now: f64) -> Option<Packet> {
        if let Some(pending) = &self.pending {
            if now - pending.timestamp > REQUEST_TIMEOUT {
                self.pending = None;
            } else {
                return None;
            }
        }

        let due = if self.samples.len() < CLOCK_SYNC_SAMPLES {
            // Fill the window quickly at startup.
            now - self.last_request_time > 0.05
        } else {
            now - self.last_request_time > RESYNC_PERIOD
        };
        if !due {
            return None;
        }

        let request = TimeRequest {
            id: self.next_id,
            timestamp: now,
        };
        self.next_id = self.next_id.wrapping_add(1);
        self.pending = Some(request);
        self.last_request_time = now;
        Some(Packet::TimeRequest(request))
    }

    /// Fold in a probe reply received at local time `now`.
    pub fn process_response(&mut self, response: &TimeResponse, now: f64) {
        let Some(pending) = self.pending else {
            return;
        };
        if pending.id != response.id {
            tracing::warn!(
                expected = pending.id,
                got = response.id,
                "dropping stale time response",
            );
            return;
        }
        self.pending = None;

        let rtt = now - pending.timestamp;
        let sample = response.timestamp - (pending.timestamp + rtt / 2.0);

        if self.samples.len() == CLOCK_SYNC_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|l, r| l.partial_cmp(r).unwrap_or(std::cmp::Ordering::Equal));
        self.time_delta = sorted[sorted.len() / 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// With stationary latency, the estimate converges to the true offset
    /// after the window fills.
    #[test]
    fn test_convergence_with_stationary_latency() {
        let true_offset = -3.25; // peer clock behind local
        let latency = 0.04;

        let mut sync = ClockSync::new();
        let mut now = 0.0;

        for _ in 0..CLOCK_SYNC_SAMPLES + 2 {
            now += 0.1;
            if let Some(Packet::TimeRequest(request)) = sync.update(now) {
                // Peer receives after one latency, replies with its clock.
                let peer_time = (now + latency) + true_offset;
                let response = TimeResponse {
                    id: request.id,
                    timestamp: peer_time,
                };
                now += 2.0 * latency;
                sync.process_response(&response, now);
            }
        }

        assert!(sync.count() >= CLOCK_SYNC_SAMPLES);
        assert_relative_eq!(sync.time_delta(), true_offset, epsilon = 1e-9);
        assert_relative_eq!(
            sync.adjust(5.0 + true_offset).unwrap(),
            5.0,
            epsilon = 1e-9
        );
    }

    /// Asymmetric jitter shifts single samples; the median shrugs it off.
    #[test]
    fn test_median_rejects_spikes() {
        let true_offset = 1.0;
        let mut sync = ClockSync::new();
        let mut now = 0.0;

        for i in 0..CLOCK_SYNC_SAMPLES {
            now += 0.1;
            if let Some(Packet::TimeRequest(request)) = sync.update(now) {
                // One wildly delayed reply in the middle.
                let spike = if i == 3 { 0.5 } else { 0.0 };
                let latency = 0.02 + spike;
                let response = TimeResponse {
                    id: request.id,
                    timestamp: now + latency + true_offset,
                };
                now += 2.0 * 0.02;
                sync.process_response(&response, now);
            }
        }

        assert!((sync.time_delta() - true_offset).abs() < 0.05);
    }

    /// Symmetric jitter around a mean latency: the median estimate stays
    /// within the jitter amplitude of the true offset.
    #[test]
    fn test_convergence_under_jittered_latency() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let true_offset = 0.75;
        let mut rng = StdRng::seed_from_u64(0xc10c);
        let mut sync = ClockSync::new();
        let mut now = 0.0;

        for _ in 0..CLOCK_SYNC_SAMPLES * 2 {
            now += 0.1;
            if let Some(Packet::TimeRequest(request)) = sync.update(now) {
                let out_latency = 0.03 + rng.gen_range(-0.01..0.01);
                let back_latency = 0.03 + rng.gen_range(-0.01..0.01);
                let response = TimeResponse {
                    id: request.id,
                    timestamp: now + out_latency + true_offset,
                };
                now += out_latency + back_latency;
                sync.process_response(&response, now);
            }
        }

        assert!(sync.count() >= CLOCK_SYNC_SAMPLES);
        assert!((sync.time_delta() - true_offset).abs() < 0.02);
    }

    #[test]
    fn test_no_adjustment_without_samples() {
        let sync = ClockSync::new();
        assert!(sync.adjust(1.0).is_none());
    }

    #[test]
    fn test_mismatched_response_ignored() {
        let mut sync = ClockSync::new();
        let request = match sync.update(1.0) {
            Some(Packet::TimeRequest(r)) => r,
            other => panic!("expected probe, got {other:?}"),
        };
        sync.process_response(
            &TimeResponse {
                id: request.id.wrapping_add(7),
                timestamp: 2.0,
            },
            1.1,
        );
        assert_eq!(sync.count(), 0);
    }
}
