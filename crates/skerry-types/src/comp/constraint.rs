//! Constraint edge components.
//!
//! Constraints are a closed tagged union: dispatch is a match over the tag
//! and adding a kind means editing this list. Every variant references its
//! two bodies and carries the impulses accumulated by the solver for warm
//! starting.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Placeholder edge with no solver rows. Keeps two bodies in the same island.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
}

/// Mutual gravitational attraction between two bodies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GravityConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
    /// Gravitational constant scale for this pair.
    pub magnitude: f64,
}

/// Ball joint: pins a body-space pivot of each body together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
    /// Pivot in each body's space.
    pub pivot: [Vector3<f64>; 2],
    /// Accumulated impulse, world space.
    pub applied_impulse: Vector3<f64>,
}

/// Holds two body-space pivots at a fixed distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
    /// Pivot in each body's space.
    pub pivot: [Vector3<f64>; 2],
    /// Rest distance between the pivots.
    pub distance: f64,
    /// Accumulated impulse along the pivot axis.
    pub impulse: f64,
}

/// Spring-damper between two body-space pivots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftDistanceConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
    /// Pivot in each body's space.
    pub pivot: [Vector3<f64>; 2],
    /// Rest distance between the pivots.
    pub distance: f64,
    /// Spring stiffness, N/m.
    pub stiffness: f64,
    /// Damping coefficient, N·s/m.
    pub damping: f64,
    /// Accumulated impulse along the pivot axis.
    pub impulse: f64,
}

/// Hinge: point constraint plus two angular rows locking rotation to one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HingeConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
    /// Pivot in each body's space.
    pub pivot: [Vector3<f64>; 2],
    /// Hinge axis in each body's space.
    pub axis: [Vector3<f64>; 2],
    /// Accumulated point impulse, world space.
    pub applied_impulse: Vector3<f64>,
    /// Accumulated impulses of the two angular rows.
    pub angular_impulse: [f64; 2],
}

/// Locks all six relative degrees of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenericConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
    /// Pivot in each body's space.
    pub pivot: [Vector3<f64>; 2],
    /// Accumulated linear impulse, world space.
    pub linear_impulse: Vector3<f64>,
    /// Accumulated angular impulse, world space.
    pub angular_impulse: Vector3<f64>,
}

/// Marks a contact edge. The solver rows are generated from the pair's
/// persistent contact manifold, which lives on the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactConstraint {
    /// Constrained body pair.
    pub body: [Entity; 2],
}

/// Closed set of constraint kinds. They are solved in declaration order, so
/// the stiffer kinds come last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// No solver rows.
    Null(NullConstraint),
    /// Pairwise attraction.
    Gravity(GravityConstraint),
    /// Ball joint.
    Point(PointConstraint),
    /// Fixed distance.
    Distance(DistanceConstraint),
    /// Spring-damper distance.
    SoftDistance(SoftDistanceConstraint),
    /// Hinge joint.
    Hinge(HingeConstraint),
    /// Six-DOF lock.
    Generic(GenericConstraint),
    /// Contact edge backed by a manifold.
    Contact(ContactConstraint),
}

impl Constraint {
    /// The two bodies joined by this constraint.
    #[must_use]
    pub fn bodies(&self) -> [Entity; 2] {
        match self {
            Self::Null(c) => c.body,
            Self::Gravity(c) => c.body,
            Self::Point(c) => c.body,
            Self::Distance(c) => c.body,
            Self::SoftDistance(c) => c.body,
            Self::Hinge(c) => c.body,
            Self::Generic(c) => c.body,
            Self::Contact(c) => c.body,
        }
    }

    fn bodies_mut(&mut self) -> &mut [Entity; 2] {
        match self {
            Self::Null(c) => &mut c.body,
            Self::Gravity(c) => &mut c.body,
            Self::Point(c) => &mut c.body,
            Self::Distance(c) => &mut c.body,
            Self::SoftDistance(c) => &mut c.body,
            Self::Hinge(c) => &mut c.body,
            Self::Generic(c) => &mut c.body,
            Self::Contact(c) => &mut c.body,
        }
    }

    /// Rewrite both body references through `f`.
    pub fn remap_bodies(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        let body = self.bodies_mut();
        body[0] = f(body[0]);
        body[1] = f(body[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bodies_accessor() {
        let a = Entity::from_parts(1, 0);
        let b = Entity::from_parts(2, 0);
        let c = Constraint::Distance(DistanceConstraint {
            body: [a, b],
            pivot: [Vector3::zeros(), Vector3::zeros()],
            distance: 1.0,
            impulse: 0.0,
        });
        assert_eq!(c.bodies(), [a, b]);
    }

    #[test]
    fn test_remap_bodies() {
        let a = Entity::from_parts(1, 0);
        let b = Entity::from_parts(2, 0);
        let a2 = Entity::from_parts(10, 0);
        let b2 = Entity::from_parts(20, 0);

        let mut c = Constraint::Contact(ContactConstraint { body: [a, b] });
        c.remap_bodies(&mut |e| {
            if e == a {
                a2
            } else if e == b {
                b2
            } else {
                e
            }
        });
        assert_eq!(c.bodies(), [a2, b2]);
    }
}
