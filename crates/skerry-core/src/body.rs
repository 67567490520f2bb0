//! Rigid-body definitions and derived-state refresh.
//!
//! [`RigidBodyDesc`] is the builder consumed by the coordinator when creating
//! bodies. The refresh helpers recompute the state that is derived from
//! `position`/`orientation`/`center_of_mass` — the world origin, the
//! world-space inverse inertia, the AABB and the rotated-mesh caches — and
//! must be called whenever those change outside the integrator.

use nalgebra::{Point3, UnitQuaternion, Vector3};

use skerry_registry::Registry;
use skerry_types::comp::{
    AngVel, CenterOfMass, Continuous, Discontinuity, DynamicTag, ExternalTag, Inertia,
    KinematicTag, LinVel, Mass, Material, NetworkedTag, Orientation, Origin, Position,
    PresentOrientation, PresentPosition, ProceduralTag, RotatedMeshCache, Shape,
    SleepingDisabledTag, StaticTag,
};
use skerry_types::{Aabb, Entity};

/// The mutually exclusive body kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    /// Integrated and solved by the island worker. Procedural.
    #[default]
    Dynamic,
    /// Moved externally at infinite mass. Non-procedural.
    Kinematic,
    /// Immovable. Non-procedural.
    Static,
    /// Driven entirely by an external system. Non-procedural.
    External,
}

impl BodyKind {
    /// Whether bodies of this kind participate in constraint solving.
    #[must_use]
    pub fn is_procedural(self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

/// Definition of a rigid body, consumed by `IslandCoordinator::make_body`.
#[derive(Debug, Clone)]
pub struct RigidBodyDesc {
    /// Body kind.
    pub kind: BodyKind,
    /// Initial position of the center of mass.
    pub position: Point3<f64>,
    /// Initial orientation.
    pub orientation: UnitQuaternion<f64>,
    /// Initial linear velocity.
    pub linvel: Vector3<f64>,
    /// Initial angular velocity.
    pub angvel: Vector3<f64>,
    /// Mass for dynamic bodies; ignored otherwise.
    pub mass: f64,
    /// Collision shape, if the body collides.
    pub shape: Option<Shape>,
    /// Surface material.
    pub material: Material,
    /// Center of mass offset in body space.
    pub center_of_mass: Vector3<f64>,
    /// Whether the entity is replicated.
    pub networked: bool,
    /// Whether the body's island is forbidden from sleeping.
    pub sleeping_disabled: bool,
}

impl Default for RigidBodyDesc {
    fn default() -> Self {
        Self {
            kind: BodyKind::Dynamic,
            position: Point3::origin(),
            orientation: UnitQuaternion::identity(),
            linvel: Vector3::zeros(),
            angvel: Vector3::zeros(),
            mass: 1.0,
            shape: None,
            material: Material::default(),
            center_of_mass: Vector3::zeros(),
            networked: false,
            sleeping_disabled: false,
        }
    }
}

impl RigidBodyDesc {
    /// A dynamic body at a position.
    #[must_use]
    pub fn dynamic(position: Point3<f64>) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// A static body at a position.
    #[must_use]
    pub fn fixed(position: Point3<f64>) -> Self {
        Self {
            kind: BodyKind::Static,
            position,
            ..Self::default()
        }
    }

    /// A kinematic body at a position.
    #[must_use]
    pub fn kinematic(position: Point3<f64>) -> Self {
        Self {
            kind: BodyKind::Kinematic,
            position,
            ..Self::default()
        }
    }

    /// Set the shape.
    #[must_use]
    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Set the mass.
    #[must_use]
    pub fn mass(mut self, mass: f64) -> Self {
        self.mass = mass;
        self
    }

    /// Set the initial velocities.
    #[must_use]
    pub fn velocity(mut self, linvel: Vector3<f64>, angvel: Vector3<f64>) -> Self {
        self.linvel = linvel;
        self.angvel = angvel;
        self
    }

    /// Set the orientation.
    #[must_use]
    pub fn orientation(mut self, orientation: UnitQuaternion<f64>) -> Self {
        self.orientation = orientation;
        self
    }

    /// Set the material.
    #[must_use]
    pub fn material(mut self, friction: f64, restitution: f64) -> Self {
        self.material = Material {
            friction,
            restitution,
        };
        self
    }

    /// Mark the body as replicated.
    #[must_use]
    pub fn networked(mut self) -> Self {
        self.networked = true;
        self
    }

    /// Forbid the body's island from sleeping.
    #[must_use]
    pub fn sleeping_disabled(mut self) -> Self {
        self.sleeping_disabled = true;
        self
    }

    /// Insert this body's components onto an existing entity.
    pub fn insert_components(&self, registry: &mut Registry, entity: Entity) {
        registry.insert(entity, Position(self.position));
        registry.insert(entity, Orientation(self.orientation));
        registry.insert(entity, CenterOfMass(self.center_of_mass));
        registry.insert(entity, self.material);

        match self.kind {
            BodyKind::Dynamic => {
                registry.insert(entity, DynamicTag);
                registry.insert(entity, ProceduralTag);
                registry.insert(entity, LinVel(self.linvel));
                registry.insert(entity, AngVel(self.angvel));
                registry.insert(entity, Mass::new(self.mass));
                let inertia = match &self.shape {
                    Some(Shape::Sphere { radius }) => Inertia::solid_sphere(self.mass, *radius),
                    Some(Shape::Box { half_extents }) => {
                        Inertia::solid_box(self.mass, *half_extents)
                    }
                    Some(shape) => {
                        // Approximate everything else by its bounding box.
                        let aabb =
                            shape.aabb(&Point3::origin(), &UnitQuaternion::identity());
                        Inertia::solid_box(self.mass, (aabb.max - aabb.min) * 0.5)
                    }
                    None => Inertia::solid_sphere(self.mass, 0.5),
                };
                registry.insert(entity, inertia);
                registry.insert(entity, Continuous::rigid_body());
                registry.insert(entity, Discontinuity::default());
                registry.insert(entity, PresentPosition(self.position));
                registry.insert(entity, PresentOrientation(self.orientation));
            }
            BodyKind::Kinematic => {
                registry.insert(entity, KinematicTag);
                registry.insert(entity, LinVel(self.linvel));
                registry.insert(entity, AngVel(self.angvel));
                registry.insert(entity, Mass::infinite());
                registry.insert(entity, Inertia::infinite());
            }
            BodyKind::Static => {
                registry.insert(entity, StaticTag);
                registry.insert(entity, Mass::infinite());
                registry.insert(entity, Inertia::infinite());
            }
            BodyKind::External => {
                registry.insert(entity, ExternalTag);
            }
        }

        if let Some(shape) = &self.shape {
            registry.insert(entity, shape.clone());
        }
        if self.networked {
            registry.insert(entity, NetworkedTag);
        }
        if self.sleeping_disabled {
            registry.insert(entity, SleepingDisabledTag);
        }

        refresh_derived_state(registry, entity);
    }
}

/// Recompute the world-space geometric origin.
pub fn update_origin(registry: &mut Registry, entity: Entity) {
    let (Some(position), Some(orientation)) = (
        registry.get::<Position>(entity).copied(),
        registry.get::<Orientation>(entity).copied(),
    ) else {
        return;
    };
    let com = registry
        .get::<CenterOfMass>(entity)
        .copied()
        .unwrap_or_default();
    registry.insert(
        entity,
        Origin(position.0 + orientation.0 * (-com.0)),
    );
}

/// Recompute the world-space AABB from the shape and transform.
pub fn update_aabb(registry: &mut Registry, entity: Entity) {
    let (Some(shape), Some(position), Some(orientation)) = (
        registry.get::<Shape>(entity),
        registry.get::<Position>(entity),
        registry.get::<Orientation>(entity),
    ) else {
        return;
    };
    let aabb = shape.aabb(&position.0, &orientation.0);
    registry.insert(entity, aabb);
}

/// Recompute the world-space inverse inertia tensor.
pub fn update_inertia_world(registry: &mut Registry, entity: Entity) {
    let Some(orientation) = registry.get::<Orientation>(entity).copied() else {
        return;
    };
    if let Some(inertia) = registry.get_mut::<Inertia>(entity) {
        inertia.update_world(&orientation.0);
    }
}

/// Rebuild the rotated-vertex cache of polyhedral shapes.
pub fn update_rotated_cache(registry: &mut Registry, entity: Entity) {
    let (Some(shape), Some(orientation)) = (
        registry.get::<Shape>(entity),
        registry.get::<Orientation>(entity),
    ) else {
        return;
    };
    if !shape.needs_rotated_cache() {
        return;
    }
    let cache = RotatedMeshCache::build(shape, &orientation.0);
    registry.insert(entity, cache);
}

/// Refresh every piece of state derived from the transform.
pub fn refresh_derived_state(registry: &mut Registry, entity: Entity) {
    update_origin(registry, entity);
    update_aabb(registry, entity);
    update_inertia_world(registry, entity);
    update_rotated_cache(registry, entity);
}

/// World-space AABB helper used before the component exists.
#[must_use]
pub fn compute_aabb(registry: &Registry, entity: Entity) -> Option<Aabb> {
    let shape = registry.get::<Shape>(entity)?;
    let position = registry.get::<Position>(entity)?;
    let orientation = registry.get::<Orientation>(entity)?;
    Some(shape.aabb(&position.0, &orientation.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_body_components() {
        let mut registry = Registry::new();
        let e = registry.create();
        RigidBodyDesc::dynamic(Point3::new(0.0, 2.0, 0.0))
            .shape(Shape::sphere(0.5))
            .networked()
            .insert_components(&mut registry, e);

        assert!(registry.has::<DynamicTag>(e));
        assert!(registry.has::<ProceduralTag>(e));
        assert!(registry.has::<NetworkedTag>(e));
        assert!(registry.has::<Aabb>(e));
        assert_eq!(registry.get::<Origin>(e).map(|o| o.0.y), Some(2.0));
        assert!(registry.get::<Mass>(e).is_some_and(|m| m.inv > 0.0));
    }

    #[test]
    fn test_static_body_is_not_procedural() {
        let mut registry = Registry::new();
        let e = registry.create();
        RigidBodyDesc::fixed(Point3::origin())
            .shape(Shape::plane(Vector3::y(), 0.0))
            .insert_components(&mut registry, e);

        assert!(registry.has::<StaticTag>(e));
        assert!(!registry.has::<ProceduralTag>(e));
        assert!(registry.get::<Mass>(e).is_some_and(|m| m.inv == 0.0));
    }

    #[test]
    fn test_origin_accounts_for_center_of_mass() {
        let mut registry = Registry::new();
        let e = registry.create();
        let mut desc = RigidBodyDesc::dynamic(Point3::new(1.0, 0.0, 0.0));
        desc.center_of_mass = Vector3::new(0.5, 0.0, 0.0);
        desc.insert_components(&mut registry, e);

        assert_eq!(registry.get::<Origin>(e).map(|o| o.0.x), Some(0.5));
    }
}
