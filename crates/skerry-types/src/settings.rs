//! Engine settings shared by the coordinator and every island worker.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Simulation settings. The coordinator broadcasts changes to workers, so
/// this struct crosses the worker message queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSettings {
    /// Fixed integration timestep in seconds.
    pub fixed_dt: f64,
    /// When paused, workers idle and only step on explicit request.
    pub paused: bool,
    /// Uniform gravity applied to dynamic bodies.
    pub gravity: Vector3<f64>,
    /// Constraint solver velocity iterations per step.
    pub velocity_iterations: usize,
    /// Continuous time below the speed thresholds before an island sleeps.
    pub island_time_to_sleep: f64,
    /// Linear speed below which a body counts as resting, m/s.
    pub island_linear_sleep_threshold: f64,
    /// Angular speed below which a body counts as resting, rad/s.
    pub island_angular_sleep_threshold: f64,
    /// Maximum number of fixed steps a worker may lag behind the clock
    /// before its island time is clamped forward.
    pub max_lagging_steps: u32,
    /// Seconds a worker waits after a topology change before testing whether
    /// its island has come apart.
    pub split_debounce: f64,
    /// Multiplicative per-step decay applied to discontinuity offsets.
    pub discontinuity_decay_rate: f64,
    /// AABB margin used when pairing bodies for contact.
    pub contact_aabb_margin: f64,
    /// AABB separation beyond which an existing contact pair is dropped.
    pub contact_aabb_separation: f64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            paused: false,
            gravity: Vector3::new(0.0, -9.81, 0.0),
            velocity_iterations: 8,
            island_time_to_sleep: 0.5,
            island_linear_sleep_threshold: 0.005,
            island_angular_sleep_threshold: 0.005,
            max_lagging_steps: 10,
            split_debounce: 0.6,
            discontinuity_decay_rate: 0.8,
            contact_aabb_margin: 0.04,
            contact_aabb_separation: 0.1,
        }
    }
}

impl SimSettings {
    /// Settings with a specific timestep.
    #[must_use]
    pub fn with_fixed_dt(fixed_dt: f64) -> Self {
        Self {
            fixed_dt,
            ..Self::default()
        }
    }

    /// Start paused; stepping only happens on explicit request.
    #[must_use]
    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Set gravity.
    #[must_use]
    pub fn gravity(mut self, gravity: Vector3<f64>) -> Self {
        self.gravity = gravity;
        self
    }

    /// Set the solver iteration count.
    #[must_use]
    pub fn velocity_iterations(mut self, iterations: usize) -> Self {
        self.velocity_iterations = iterations;
        self
    }

    /// Set the sleep timing and speed thresholds.
    #[must_use]
    pub fn sleep_thresholds(mut self, time: f64, linear: f64, angular: f64) -> Self {
        self.island_time_to_sleep = time;
        self.island_linear_sleep_threshold = linear;
        self.island_angular_sleep_threshold = angular;
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), SimError> {
        if !self.fixed_dt.is_finite() || self.fixed_dt <= 0.0 {
            return Err(SimError::InvalidTimestep(self.fixed_dt));
        }
        if self.fixed_dt > 1.0 {
            return Err(SimError::invalid_config("fixed_dt > 1 second"));
        }
        if self.velocity_iterations == 0 {
            return Err(SimError::invalid_config(
                "velocity_iterations must be at least 1",
            ));
        }
        if self.island_time_to_sleep < 0.0 {
            return Err(SimError::invalid_config(
                "island_time_to_sleep cannot be negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.discontinuity_decay_rate) {
            return Err(SimError::invalid_config(
                "discontinuity_decay_rate must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_validate() {
        let settings = SimSettings::default();
        assert!(settings.validate().is_ok());
        assert_relative_eq!(settings.fixed_dt, 1.0 / 60.0, epsilon = 1e-12);
        assert_eq!(settings.max_lagging_steps, 10);
    }

    #[test]
    fn test_invalid_timestep_rejected() {
        let mut settings = SimSettings::default();
        settings.fixed_dt = 0.0;
        assert!(settings.validate().is_err());
        settings.fixed_dt = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let settings = SimSettings::with_fixed_dt(1.0 / 120.0)
            .gravity(Vector3::zeros())
            .sleep_thresholds(1.0, 0.01, 0.01);
        assert!(settings.validate().is_ok());
        assert_relative_eq!(settings.island_time_to_sleep, 1.0, epsilon = 1e-12);
    }
}
