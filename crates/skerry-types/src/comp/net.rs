//! Replication components.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Marks an entity as subject to replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkedTag;

/// Identifies the client that created (and may own) an entity. On islands it
/// records the single client that owns every owned entity in the island, or
/// nothing when ownership is mixed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityOwner {
    /// The owning client entity, if any.
    pub client: Option<Entity>,
}

impl EntityOwner {
    /// Owned by a specific client.
    #[must_use]
    pub const fn owned_by(client: Entity) -> Self {
        Self {
            client: Some(client),
        }
    }

    /// No owner.
    #[must_use]
    pub const fn none() -> Self {
        Self { client: None }
    }
}

impl Default for EntityOwner {
    fn default() -> Self {
        Self::none()
    }
}

/// Offset between a body's pre- and post-reconciliation transform.
///
/// Applied only to the presentation transform so corrections fade in over a
/// few frames instead of snapping; the worker scales it down every step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discontinuity {
    /// Position error to hide, world space.
    pub position_offset: Vector3<f64>,
    /// Orientation error to hide.
    pub orientation_offset: UnitQuaternion<f64>,
}

impl Discontinuity {
    /// Shrink the offsets by `rate` (multiplicative decay toward zero).
    pub fn decay(&mut self, rate: f64) {
        self.position_offset *= rate;
        self.orientation_offset = UnitQuaternion::identity()
            .slerp(&self.orientation_offset, rate.clamp(0.0, 1.0));
    }

    /// Accumulate the error between an old and a new transform.
    pub fn accumulate(
        &mut self,
        old_position: &Vector3<f64>,
        new_position: &Vector3<f64>,
        old_orientation: &UnitQuaternion<f64>,
        new_orientation: &UnitQuaternion<f64>,
    ) {
        self.position_offset += old_position - new_position;
        self.orientation_offset = old_orientation * new_orientation.inverse() * self.orientation_offset;
    }
}

impl Default for Discontinuity {
    fn default() -> Self {
        Self {
            position_offset: Vector3::zeros(),
            orientation_offset: UnitQuaternion::identity(),
        }
    }
}

/// User input applied to an owned body, replayed during extrapolation.
///
/// Input components bypass the server's ownership check and are fed into the
/// input history on both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyInput {
    /// Force in world space, applied at the center of mass.
    pub force: Vector3<f64>,
    /// Torque in world space.
    pub torque: Vector3<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_discontinuity_decay() {
        let mut d = Discontinuity {
            position_offset: Vector3::new(1.0, 0.0, 0.0),
            orientation_offset: UnitQuaternion::identity(),
        };
        d.decay(0.8);
        assert_relative_eq!(d.position_offset.x, 0.8, epsilon = 1e-12);
        d.decay(0.8);
        assert_relative_eq!(d.position_offset.x, 0.64, epsilon = 1e-12);
    }

    #[test]
    fn test_discontinuity_accumulate() {
        let mut d = Discontinuity::default();
        d.accumulate(
            &Vector3::new(0.9, 0.0, 0.0),
            &Vector3::new(1.0, 0.0, 0.0),
            &UnitQuaternion::identity(),
            &UnitQuaternion::identity(),
        );
        assert_relative_eq!(d.position_offset.x, -0.1, epsilon = 1e-12);
    }
}
