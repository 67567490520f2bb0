//! Rigid-body state components.
//!
//! Transform state is split into individual components rather than a single
//! pose struct so that deltas and snapshots can carry exactly the fields that
//! changed. `Origin`, world-space inverse inertia and the AABB are derived
//! state: they must be refreshed whenever position, orientation or center of
//! mass change outside the integrator.

use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// World-space position of a body's center of mass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position(pub Point3<f64>);

/// World-space orientation of a body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation(pub UnitQuaternion<f64>);

/// Linear velocity in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinVel(pub Vector3<f64>);

/// Angular velocity in rad/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngVel(pub Vector3<f64>);

/// Offset of the center of mass from the body's geometric origin, in body
/// space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CenterOfMass(pub Vector3<f64>);

/// World-space geometric origin, `pos + rotate(orn, -com)`. Derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Origin(pub Point3<f64>);

/// Presentation position, extrapolated between fixed steps for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresentPosition(pub Point3<f64>);

/// Presentation orientation, extrapolated between fixed steps for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresentOrientation(pub UnitQuaternion<f64>);

macro_rules! impl_deref {
    ($name:ident, $target:ty) => {
        impl Deref for $name {
            type Target = $target;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }
    };
}

impl_deref!(Position, Point3<f64>);
impl_deref!(Orientation, UnitQuaternion<f64>);
impl_deref!(LinVel, Vector3<f64>);
impl_deref!(AngVel, Vector3<f64>);
impl_deref!(CenterOfMass, Vector3<f64>);
impl_deref!(Origin, Point3<f64>);
impl_deref!(PresentPosition, Point3<f64>);
impl_deref!(PresentOrientation, UnitQuaternion<f64>);

impl Default for Position {
    fn default() -> Self {
        Self(Point3::origin())
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self(UnitQuaternion::identity())
    }
}

impl Default for LinVel {
    fn default() -> Self {
        Self(Vector3::zeros())
    }
}

impl Default for AngVel {
    fn default() -> Self {
        Self(Vector3::zeros())
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self(Point3::origin())
    }
}

impl Default for PresentPosition {
    fn default() -> Self {
        Self(Point3::origin())
    }
}

impl Default for PresentOrientation {
    fn default() -> Self {
        Self(UnitQuaternion::identity())
    }
}

/// Mass with its cached inverse. Zero inverse means immovable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mass {
    /// Mass in kg.
    pub value: f64,
    /// Cached `1 / value`, or zero for infinite mass.
    pub inv: f64,
}

impl Mass {
    /// Finite mass. Non-positive values produce an immovable body.
    #[must_use]
    pub fn new(value: f64) -> Self {
        if value > 0.0 && value.is_finite() {
            Self {
                value,
                inv: 1.0 / value,
            }
        } else {
            Self::infinite()
        }
    }

    /// Infinite mass (static and kinematic bodies).
    #[must_use]
    pub const fn infinite() -> Self {
        Self {
            value: f64::INFINITY,
            inv: 0.0,
        }
    }
}

impl Default for Mass {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Rotational inertia in body space with cached inverses.
///
/// `inv_world` is derived from the current orientation and must be refreshed
/// whenever the orientation changes outside the integrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inertia {
    /// Inertia tensor in body space.
    pub local: Matrix3<f64>,
    /// Inverse inertia tensor in body space.
    pub inv_local: Matrix3<f64>,
    /// Inverse inertia tensor rotated into world space. Derived.
    pub inv_world: Matrix3<f64>,
}

impl Inertia {
    /// Build from a body-space tensor, caching its inverse.
    #[must_use]
    pub fn new(local: Matrix3<f64>) -> Self {
        let inv_local = local.try_inverse().unwrap_or_else(Matrix3::zeros);
        Self {
            local,
            inv_local,
            inv_world: inv_local,
        }
    }

    /// Inertia of a solid sphere.
    #[must_use]
    pub fn solid_sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self::new(Matrix3::from_diagonal(&Vector3::new(i, i, i)))
    }

    /// Inertia of a solid box with the given half-extents.
    #[must_use]
    pub fn solid_box(mass: f64, half_extents: Vector3<f64>) -> Self {
        let w = 2.0 * half_extents.x;
        let h = 2.0 * half_extents.y;
        let d = 2.0 * half_extents.z;
        let k = mass / 12.0;
        Self::new(Matrix3::from_diagonal(&Vector3::new(
            k * (h * h + d * d),
            k * (w * w + d * d),
            k * (w * w + h * h),
        )))
    }

    /// Immovable inertia (zero inverse).
    #[must_use]
    pub fn infinite() -> Self {
        Self {
            local: Matrix3::zeros(),
            inv_local: Matrix3::zeros(),
            inv_world: Matrix3::zeros(),
        }
    }

    /// Refresh the world-space inverse for a new orientation.
    pub fn update_world(&mut self, orientation: &UnitQuaternion<f64>) {
        let r = orientation.to_rotation_matrix().into_inner();
        self.inv_world = r * self.inv_local * r.transpose();
    }
}

impl Default for Inertia {
    fn default() -> Self {
        Self::solid_sphere(1.0, 0.5)
    }
}

/// Surface material used when two bodies touch. Contact parameters are
/// combined by geometric mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Coulomb friction coefficient.
    pub friction: f64,
    /// Restitution (bounciness) in `[0, 1]`.
    pub restitution: f64,
}

impl Material {
    /// Combine two materials at a contact.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        Self {
            friction: (self.friction * other.friction).sqrt(),
            restitution: (self.restitution * other.restitution).sqrt(),
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            friction: 0.5,
            restitution: 0.0,
        }
    }
}

/// Tag for bodies integrated and solved by the island worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicTag;

/// Tag for bodies moved externally at infinite mass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KinematicTag;

/// Tag for immovable bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticTag;

/// Tag for entities driven entirely by an external system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTag;

/// Tag for entities that participate in constraint solving. A procedural
/// entity belongs to exactly one island.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProceduralTag;

/// Tag present on every entity of a sleeping island.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepingTag;

/// Prevents the island containing this entity from ever sleeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepingDisabledTag;
