//! Shared monotonic clock.
//!
//! All timestamps in the engine — island times, packet times, clock-sync
//! samples — are seconds on this clock. It starts at an arbitrary zero the
//! first time it is read.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed on the shared monotonic clock.
#[must_use]
pub fn now_seconds() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_seconds();
        let b = now_seconds();
        assert!(b >= a);
    }
}
