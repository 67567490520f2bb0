//! Deltas: serializable packages of entity and component changes.
//!
//! A [`Delta`] describes creations, updates and destructions that happened in
//! one registry, in that registry's entity space. Importing it into another
//! registry goes through an [`EntityMap`]; unknown created entities get fresh
//! local counterparts, and entity references inside component values are
//! rewritten recursively.
//!
//! Deltas cross the coordinator ↔ worker queues after every step and carry
//! island contents during merges and splits. The same machinery backs the
//! network snapshot pools.

mod builder;
mod delta;

pub use builder::DeltaBuilder;
pub use delta::{Delta, ImportResult};

use skerry_types::comp::ComponentId;

/// Whether a component kind may cross registry boundaries inside a delta.
/// Change-tracking records, per-instance caches, graph linkage and island
/// residency never travel: every registry derives its own.
#[must_use]
pub fn is_transportable(id: ComponentId) -> bool {
    !matches!(
        id,
        ComponentId::Dirty
            | ComponentId::NetworkDirty
            | ComponentId::RotatedMeshCache
            | ComponentId::GraphNode
            | ComponentId::GraphEdge
            | ComponentId::Island
            | ComponentId::IslandResident
            | ComponentId::MultiIslandResident
    )
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point3, Vector3};
    use skerry_registry::{EntityMap, Registry};
    use skerry_types::comp::{
        ComponentId, Constraint, DistanceConstraint, DynamicTag, LinVel, Position,
    };
    use skerry_types::Entity;

    use super::*;

    fn body(registry: &mut Registry, position: Point3<f64>) -> Entity {
        let e = registry.create();
        registry.insert(e, DynamicTag);
        registry.insert(e, Position(position));
        registry.insert(e, LinVel(Vector3::new(1.0, 0.0, 0.0)));
        e
    }

    /// Replicate two bodies and a constraint into an empty registry and check
    /// that everything arrives with references rewritten.
    #[test]
    fn test_round_trip_into_fresh_registry() {
        let mut source = Registry::new();
        let a = body(&mut source, Point3::new(0.0, 1.0, 0.0));
        let b = body(&mut source, Point3::new(0.0, 3.0, 0.0));
        let joint = source.create();
        source.insert(
            joint,
            Constraint::Distance(DistanceConstraint {
                body: [a, b],
                pivot: [Vector3::zeros(), Vector3::zeros()],
                distance: 2.0,
                impulse: 0.0,
            }),
        );

        let mut builder = DeltaBuilder::new();
        for e in [a, b, joint] {
            builder.created(e);
            builder.created_all(&source, e);
        }
        let delta = builder.finish();

        let mut target = Registry::new();
        let mut map = EntityMap::new();
        let result = delta.import(&mut target, &mut map);

        assert_eq!(result.created.len(), 3);
        assert_eq!(target.entity_count(), 3);

        let local_a = map.local_for(a).unwrap();
        let local_b = map.local_for(b).unwrap();
        let local_joint = map.local_for(joint).unwrap();

        assert_eq!(
            target.get::<Position>(local_a).map(|p| p.0),
            Some(Point3::new(0.0, 1.0, 0.0))
        );
        match target.get::<Constraint>(local_joint) {
            Some(Constraint::Distance(c)) => assert_eq!(c.body, [local_a, local_b]),
            other => panic!("constraint did not survive: {other:?}"),
        }
    }

    /// Importing the same delta twice must leave the registry exactly as
    /// importing it once: creations of already-mapped entities are no-ops.
    #[test]
    fn test_import_is_idempotent() {
        let mut source = Registry::new();
        let a = body(&mut source, Point3::new(5.0, 0.0, 0.0));

        let mut builder = DeltaBuilder::new();
        builder.created(a);
        builder.created_all(&source, a);
        let delta = builder.finish();

        let mut target = Registry::new();
        let mut map = EntityMap::new();
        delta.import(&mut target, &mut map);
        let count_once = target.entity_count();
        let local = map.local_for(a).unwrap();

        let result = delta.import(&mut target, &mut map);
        assert!(result.created.is_empty());
        assert_eq!(target.entity_count(), count_once);
        assert_eq!(map.local_for(a), Some(local));
        assert_eq!(
            target.get::<Position>(local).map(|p| p.0),
            Some(Point3::new(5.0, 0.0, 0.0))
        );
    }

    #[test]
    fn test_updates_and_component_destruction() {
        let mut source = Registry::new();
        let a = body(&mut source, Point3::origin());

        // Replicate.
        let mut builder = DeltaBuilder::new();
        builder.created(a);
        builder.created_all(&source, a);
        let mut target = Registry::new();
        let mut map = EntityMap::new();
        builder.finish().import(&mut target, &mut map);
        let local = map.local_for(a).unwrap();

        // Update one component, destroy another.
        let mut builder = DeltaBuilder::new();
        builder.updated(a, Position(Point3::new(9.0, 9.0, 9.0)));
        builder.destroyed_component::<LinVel>(a);
        builder.finish().import(&mut target, &mut map);

        assert_eq!(
            target.get::<Position>(local).map(|p| p.0),
            Some(Point3::new(9.0, 9.0, 9.0))
        );
        assert!(target.get::<LinVel>(local).is_none());
    }

    #[test]
    fn test_entity_destruction_clears_mapping() {
        let mut source = Registry::new();
        let a = body(&mut source, Point3::origin());

        let mut builder = DeltaBuilder::new();
        builder.created(a);
        builder.created_all(&source, a);
        let mut target = Registry::new();
        let mut map = EntityMap::new();
        builder.finish().import(&mut target, &mut map);
        let local = map.local_for(a).unwrap();

        let mut builder = DeltaBuilder::new();
        builder.destroyed(a);
        builder.finish().import(&mut target, &mut map);

        assert!(!target.contains(local));
        assert!(!map.has_remote(a));
    }

    #[test]
    fn test_entity_mappings_point_back_at_sender() {
        // Receiver (coordinator side) learns sender-side handles for entities
        // it already owns.
        let mine = Entity::from_parts(7, 0);
        let theirs = Entity::from_parts(70, 0);

        let mut builder = DeltaBuilder::new();
        builder.insert_entity_mapping(mine, theirs);
        assert!(builder.has_mapping_for(mine));
        let delta = builder.finish();

        let mut registry = Registry::new();
        let mut map = EntityMap::new();
        delta.import(&mut registry, &mut map);
        assert_eq!(map.local_for(theirs), Some(mine));
    }

    #[test]
    fn test_created_pools_sorted_by_component_id() {
        let mut source = Registry::new();
        let a = body(&mut source, Point3::origin());
        let joint = source.create();
        source.insert(
            joint,
            Constraint::Distance(DistanceConstraint {
                body: [a, a],
                pivot: [Vector3::zeros(), Vector3::zeros()],
                distance: 1.0,
                impulse: 0.0,
            }),
        );

        // Insert in "wrong" order: constraint first.
        let mut builder = DeltaBuilder::new();
        builder.created(joint);
        builder.created_all(&source, joint);
        builder.created(a);
        builder.created_all(&source, a);
        let delta = builder.finish();

        let ids: Vec<ComponentId> = delta.created_pools().map(|p| p.component_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(ids.contains(&ComponentId::Constraint));
    }

    #[test]
    fn test_delta_serde_round_trip() {
        let mut source = Registry::new();
        let a = body(&mut source, Point3::new(1.0, 2.0, 3.0));
        let mut builder = DeltaBuilder::new();
        builder.created(a);
        builder.created_all(&source, a);
        let delta = builder.finish();

        let bytes = bincode::serialize(&delta).unwrap();
        let back: Delta = bincode::deserialize(&bytes).unwrap();
        assert_eq!(delta, back);
    }
}
