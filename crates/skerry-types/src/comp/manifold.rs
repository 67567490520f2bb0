//! Persistent contact manifolds.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::entity::Entity;

/// Maximum number of persistent points kept per manifold.
pub const MAX_CONTACT_POINTS: usize = 4;

/// One persistent contact point between a pair of bodies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    /// Contact location in the first body's space.
    pub local_pivot_a: Vector3<f64>,
    /// Contact location in the second body's space.
    pub local_pivot_b: Vector3<f64>,
    /// Contact normal in the second body's space, pointing toward the first.
    pub normal: Vector3<f64>,
    /// Accumulated normal impulse, for warm starting.
    pub normal_impulse: f64,
    /// Accumulated friction impulses along the two tangents.
    pub friction_impulse: [f64; 2],
    /// Signed separation distance; negative means penetration.
    pub distance: f64,
    /// Number of steps this point has persisted.
    pub lifetime: u32,
}

/// Up to four persistent contact points between one pair of bodies.
///
/// Manifolds live on the contact edge entity between the two body nodes and
/// are streamed back to the coordinator every step so it can re-partition
/// islands when pairs merge or split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactManifold {
    /// The body pair this manifold belongs to.
    pub body: [Entity; 2],
    /// Persistent contact points.
    pub points: SmallVec<[ContactPoint; MAX_CONTACT_POINTS]>,
    /// Combined friction coefficient for the pair.
    pub friction: f64,
    /// Combined restitution for the pair.
    pub restitution: f64,
}

impl ContactManifold {
    /// Empty manifold for a body pair.
    #[must_use]
    pub fn new(body: [Entity; 2]) -> Self {
        Self {
            body,
            points: SmallVec::new(),
            friction: 0.5,
            restitution: 0.0,
        }
    }

    /// Whether the manifold currently carries any contact points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Insert a point, replacing the shallowest one when full.
    pub fn insert_point(&mut self, point: ContactPoint) {
        if self.points.len() < MAX_CONTACT_POINTS {
            self.points.push(point);
            return;
        }

        let mut worst = 0;
        let mut worst_distance = self.points[0].distance;
        for (i, p) in self.points.iter().enumerate().skip(1) {
            if p.distance > worst_distance {
                worst = i;
                worst_distance = p.distance;
            }
        }
        if point.distance < worst_distance {
            self.points[worst] = point;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_at(distance: f64) -> ContactPoint {
        ContactPoint {
            local_pivot_a: Vector3::zeros(),
            local_pivot_b: Vector3::zeros(),
            normal: Vector3::y(),
            normal_impulse: 0.0,
            friction_impulse: [0.0; 2],
            distance,
            lifetime: 0,
        }
    }

    #[test]
    fn test_insert_caps_at_four_points() {
        let e = Entity::from_parts(0, 0);
        let mut manifold = ContactManifold::new([e, e]);

        for i in 0..4 {
            manifold.insert_point(point_at(-0.01 * f64::from(i)));
        }
        assert_eq!(manifold.points.len(), 4);

        // A deeper point replaces the shallowest.
        manifold.insert_point(point_at(-1.0));
        assert_eq!(manifold.points.len(), 4);
        assert!(manifold.points.iter().any(|p| p.distance == -1.0));
        assert!(manifold.points.iter().all(|p| p.distance < 0.0));
    }
}
