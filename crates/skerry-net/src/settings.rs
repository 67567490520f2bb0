//! Replication settings.

use serde::{Deserialize, Serialize};

/// Client-side replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Transient snapshot emission rate, Hz.
    pub snapshot_rate: f64,
    /// Measured round-trip time to the server, seconds.
    pub round_trip_time: f64,
    /// Whether server snapshots are extrapolated to the present before
    /// application.
    pub extrapolation_enabled: bool,
    /// Maximum extrapolation jobs in flight; further snapshots are dropped.
    pub max_concurrent_extrapolations: usize,
    /// Wall-clock budget of one extrapolation job, seconds.
    pub extrapolation_timeout: f64,
    /// Multiplicative per-step decay of discontinuity offsets. Sensitive to
    /// the fixed timestep: a smaller step means faster decay.
    pub discontinuity_decay_rate: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            snapshot_rate: 30.0,
            round_trip_time: 0.0,
            extrapolation_enabled: true,
            max_concurrent_extrapolations: 2,
            extrapolation_timeout: 0.2,
            discontinuity_decay_rate: 0.8,
        }
    }
}

impl ClientSettings {
    /// Disable extrapolation; snapshots snap directly with discontinuities.
    #[must_use]
    pub fn without_extrapolation(mut self) -> Self {
        self.extrapolation_enabled = false;
        self
    }

    /// Set the measured round-trip time.
    #[must_use]
    pub fn round_trip_time(mut self, rtt: f64) -> Self {
        self.round_trip_time = rtt;
        self
    }

    /// Set the snapshot rate in Hz.
    #[must_use]
    pub fn snapshot_rate(mut self, rate: f64) -> Self {
        self.snapshot_rate = rate;
        self
    }
}

/// Server-side replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Factor over the worst half-RTT in a client's region used as that
    /// client's playout delay.
    pub playout_delay_multiplier: f64,
    /// Default per-client snapshot rate, Hz.
    pub snapshot_rate: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            playout_delay_multiplier: 1.2,
            snapshot_rate: 30.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let client = ClientSettings::default();
        assert_eq!(client.snapshot_rate, 30.0);
        assert_eq!(client.round_trip_time, 0.0);
        assert!(client.extrapolation_enabled);
        assert_eq!(client.max_concurrent_extrapolations, 2);
        assert_eq!(client.discontinuity_decay_rate, 0.8);

        let server = ServerSettings::default();
        assert!(server.playout_delay_multiplier > 1.0);
    }
}
