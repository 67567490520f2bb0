//! Presentation transforms.
//!
//! Rendering runs at a different cadence than the fixed step, so each
//! procedural body carries a presentation transform extrapolated from the
//! last simulated state, with the body's discontinuity offset layered on top
//! to hide reconciliation snaps.

use skerry_registry::Registry;
use skerry_types::comp::{
    AngVel, Discontinuity, IslandResident, IslandTimestamp, LinVel, Orientation, Position,
    PresentOrientation, PresentPosition, ProceduralTag, SleepingTag,
};
use skerry_types::Entity;

/// Advance presentation transforms to `time`, extrapolating by at most one
/// fixed step past each body's island time, then apply discontinuities.
pub fn update_presentation(registry: &mut Registry, time: f64, fixed_dt: f64) {
    let bodies: Vec<Entity> = registry
        .entities_with::<ProceduralTag>()
        .filter(|e| !registry.has::<SleepingTag>(*e))
        .collect();

    for entity in bodies {
        let island_time = registry
            .get::<IslandResident>(entity)
            .and_then(|r| registry.get::<IslandTimestamp>(r.island))
            .map_or(time - fixed_dt, |t| t.value);
        let dt = (time - fixed_dt - island_time).min(fixed_dt);

        if let (Some(position), Some(linvel)) = (
            registry.get::<Position>(entity).copied(),
            registry.get::<LinVel>(entity).copied(),
        ) {
            if registry.has::<PresentPosition>(entity) {
                registry.insert(entity, PresentPosition(position.0 + linvel.0 * dt));
            }
        }
        if let (Some(orientation), Some(angvel)) = (
            registry.get::<Orientation>(entity).copied(),
            registry.get::<AngVel>(entity).copied(),
        ) {
            if registry.has::<PresentOrientation>(entity) {
                let advanced =
                    nalgebra::UnitQuaternion::from_scaled_axis(angvel.0 * dt) * orientation.0;
                registry.insert(entity, PresentOrientation(advanced));
            }
        }
    }

    // Discontinuity offsets shift only what the viewer sees.
    let offsets: Vec<(Entity, Discontinuity)> = registry
        .iter::<Discontinuity>()
        .map(|(e, d)| (e, *d))
        .collect();
    for (entity, discontinuity) in offsets {
        if let Some(present) = registry.get_mut::<PresentPosition>(entity) {
            present.0 += discontinuity.position_offset;
        }
        if let Some(present) = registry.get_mut::<PresentOrientation>(entity) {
            present.0 = discontinuity.orientation_offset * present.0;
        }
    }
}

/// Copy the simulated transform straight into the presentation transform.
pub fn snap_presentation(registry: &mut Registry) {
    let positions: Vec<(Entity, Position)> = registry
        .iter::<Position>()
        .filter(|(e, _)| registry.has::<PresentPosition>(*e))
        .map(|(e, p)| (e, *p))
        .collect();
    for (entity, position) in positions {
        registry.insert(entity, PresentPosition(position.0));
    }

    let orientations: Vec<(Entity, Orientation)> = registry
        .iter::<Orientation>()
        .filter(|(e, _)| registry.has::<PresentOrientation>(*e))
        .map(|(e, o)| (e, *o))
        .collect();
    for (entity, orientation) in orientations {
        registry.insert(entity, PresentOrientation(orientation.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};

    #[test]
    fn test_presentation_applies_discontinuity() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.insert(e, ProceduralTag);
        registry.insert(e, Position(Point3::new(1.0, 0.0, 0.0)));
        registry.insert(e, LinVel(Vector3::zeros()));
        registry.insert(e, AngVel(Vector3::zeros()));
        registry.insert(e, Orientation::default());
        registry.insert(e, PresentPosition::default());
        registry.insert(e, PresentOrientation::default());
        registry.insert(
            e,
            Discontinuity {
                position_offset: Vector3::new(-0.1, 0.0, 0.0),
                orientation_offset: nalgebra::UnitQuaternion::identity(),
            },
        );

        update_presentation(&mut registry, 1.0, 1.0 / 60.0);
        let shown = registry.get::<PresentPosition>(e).unwrap();
        assert_relative_eq!(shown.x, 0.9, epsilon = 1e-9);

        // Decay toward zero brings the view to the simulated state.
        registry.get_mut::<Discontinuity>(e).unwrap().decay(0.0);
        update_presentation(&mut registry, 1.0, 1.0 / 60.0);
        let shown = registry.get::<PresentPosition>(e).unwrap();
        assert_relative_eq!(shown.x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_snap_presentation() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.insert(e, Position(Point3::new(3.0, 2.0, 1.0)));
        registry.insert(e, Orientation::default());
        registry.insert(e, PresentPosition::default());
        registry.insert(e, PresentOrientation::default());

        snap_presentation(&mut registry);
        assert_relative_eq!(registry.get::<PresentPosition>(e).unwrap().x, 3.0);
    }
}
