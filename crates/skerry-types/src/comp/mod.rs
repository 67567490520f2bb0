//! Component catalog.
//!
//! All component kinds the engine knows about form a closed compile-time
//! list. Each kind gets a stable [`ComponentId`] ordinal derived from its
//! position in the catalog, and values cross registry boundaries inside a
//! [`ComponentPool`] — a tagged union with one variant per kind. Dispatch on
//! a pool is a match over the tag; adding a kind means editing the catalog.
//!
//! The networked kinds come first in the catalog, so their catalog position
//! doubles as the wire ordinal both endpoints agree on. Bodies and tags sort
//! before constraints and manifolds, which guarantees that a receiver
//! constructs referenced entities before anything that points at them.
//!
//! Downstream crates reuse the list through [`component_catalog!`], which
//! calls back into a local macro with every `(variant, type, field,
//! networked)` row — this is how the registry generates one storage column
//! per kind without repeating the list.

mod body;
mod constraint;
mod island;
mod manifold;
mod net;
mod shape;
mod tracking;

pub use body::{
    AngVel, CenterOfMass, DynamicTag, ExternalTag, Inertia, KinematicTag, LinVel, Mass, Material,
    Orientation, Origin, Position, PresentOrientation, PresentPosition, ProceduralTag,
    SleepingDisabledTag, SleepingTag, StaticTag,
};
pub use constraint::{
    Constraint, ContactConstraint, DistanceConstraint, GenericConstraint, GravityConstraint,
    HingeConstraint, NullConstraint, PointConstraint, SoftDistanceConstraint,
};
pub use island::{
    GraphEdge, GraphNode, Island, IslandResident, IslandTimestamp, MultiIslandResident, TreeView,
};
pub use manifold::{ContactManifold, ContactPoint, MAX_CONTACT_POINTS};
pub use net::{BodyInput, Discontinuity, EntityOwner, NetworkedTag};
pub use shape::{CompoundChild, ConvexMesh, RotatedMeshCache, Shape, TriangleMesh};
pub use tracking::{Continuous, Dirty, NetworkDirty, MAX_CONTINUOUS};

use serde::{Deserialize, Serialize};

use crate::aabb::Aabb;
use crate::entity::Entity;

/// Rewrites the entity references held inside a component value. Applied
/// during delta and snapshot import, after the owning entity itself has been
/// mapped.
pub trait MapEntities {
    /// Rewrite every entity reference through `f`.
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        let _ = f;
    }
}

macro_rules! impl_map_entities_noop {
    ($($ty:ty),+ $(,)?) => {
        $(impl MapEntities for $ty {})+
    };
}

impl_map_entities_noop!(
    DynamicTag,
    KinematicTag,
    StaticTag,
    ExternalTag,
    ProceduralTag,
    SleepingTag,
    SleepingDisabledTag,
    NetworkedTag,
    Position,
    Orientation,
    LinVel,
    AngVel,
    Mass,
    Inertia,
    CenterOfMass,
    Origin,
    Material,
    Shape,
    RotatedMeshCache,
    Aabb,
    IslandTimestamp,
    GraphNode,
    GraphEdge,
    Discontinuity,
    PresentPosition,
    PresentOrientation,
    BodyInput,
    Continuous,
    Dirty,
    NetworkDirty,
);

impl MapEntities for Constraint {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        self.remap_bodies(f);
    }
}

impl MapEntities for ContactManifold {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        self.body[0] = f(self.body[0]);
        self.body[1] = f(self.body[1]);
    }
}

impl MapEntities for EntityOwner {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        if let Some(client) = &mut self.client {
            *client = f(*client);
        }
    }
}

impl MapEntities for IslandResident {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        self.island = f(self.island);
    }
}

impl MapEntities for MultiIslandResident {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        for island in &mut self.islands {
            *island = f(*island);
        }
    }
}

impl MapEntities for Island {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        for node in &mut self.nodes {
            *node = f(*node);
        }
        for edge in &mut self.edges {
            *edge = f(*edge);
        }
    }
}

impl MapEntities for TreeView {
    fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
        for (entity, _) in &mut self.entries {
            *entity = f(*entity);
        }
    }
}

/// A component kind in the closed catalog.
pub trait Component: Clone + std::fmt::Debug + MapEntities + Send + Sync + 'static {
    /// Catalog identity of this kind.
    const ID: ComponentId;
}

/// Typed access into a [`ComponentPool`]. The pool's variant must match `C`;
/// mismatched access is a bug in the caller.
pub trait PoolOps<C: Component> {
    /// Append an entry.
    fn push(&mut self, entity: Entity, value: C);
    /// All entries in insertion order.
    fn entries(&self) -> &[(Entity, C)];
}

/// The component catalog as a higher-order macro: invokes `$m` with one
/// `(variant, type, field, networked)` row per component kind.
///
/// Rows marked `true` are networked; their catalog position is the wire
/// ordinal. Reordering rows is a wire-protocol break.
#[macro_export]
macro_rules! component_catalog {
    ($m:ident) => {
        $m! {
            // Networked kinds. Tags and body state sort before constraints
            // and manifolds so entity references resolve on import.
            (DynamicTag, $crate::comp::DynamicTag, dynamic_tag, true),
            (KinematicTag, $crate::comp::KinematicTag, kinematic_tag, true),
            (StaticTag, $crate::comp::StaticTag, static_tag, true),
            (ExternalTag, $crate::comp::ExternalTag, external_tag, true),
            (ProceduralTag, $crate::comp::ProceduralTag, procedural_tag, true),
            (SleepingDisabledTag, $crate::comp::SleepingDisabledTag, sleeping_disabled_tag, true),
            (Position, $crate::comp::Position, position, true),
            (Orientation, $crate::comp::Orientation, orientation, true),
            (LinVel, $crate::comp::LinVel, linvel, true),
            (AngVel, $crate::comp::AngVel, angvel, true),
            (Mass, $crate::comp::Mass, mass, true),
            (Inertia, $crate::comp::Inertia, inertia, true),
            (CenterOfMass, $crate::comp::CenterOfMass, center_of_mass, true),
            (Material, $crate::comp::Material, material, true),
            (Shape, $crate::comp::Shape, shape, true),
            (Continuous, $crate::comp::Continuous, continuous, true),
            (Constraint, $crate::comp::Constraint, constraint, true),
            (ContactManifold, $crate::comp::ContactManifold, contact_manifold, true),
            (EntityOwner, $crate::comp::EntityOwner, entity_owner, true),
            (BodyInput, $crate::comp::BodyInput, body_input, true),
            // Local kinds: cross coordinator ↔ worker deltas or stay within
            // one registry, never the client/server wire.
            (Aabb, $crate::Aabb, aabb, false),
            (Origin, $crate::comp::Origin, origin, false),
            (SleepingTag, $crate::comp::SleepingTag, sleeping_tag, false),
            (NetworkedTag, $crate::comp::NetworkedTag, networked_tag, false),
            (IslandTimestamp, $crate::comp::IslandTimestamp, island_timestamp, false),
            (TreeView, $crate::comp::TreeView, tree_view, false),
            (Island, $crate::comp::Island, island, false),
            (IslandResident, $crate::comp::IslandResident, island_resident, false),
            (MultiIslandResident, $crate::comp::MultiIslandResident, multi_island_resident, false),
            (GraphNode, $crate::comp::GraphNode, graph_node, false),
            (GraphEdge, $crate::comp::GraphEdge, graph_edge, false),
            (Discontinuity, $crate::comp::Discontinuity, discontinuity, false),
            (PresentPosition, $crate::comp::PresentPosition, present_position, false),
            (PresentOrientation, $crate::comp::PresentOrientation, present_orientation, false),
            (RotatedMeshCache, $crate::comp::RotatedMeshCache, rotated_mesh_cache, false),
            (Dirty, $crate::comp::Dirty, dirty, false),
            (NetworkDirty, $crate::comp::NetworkDirty, network_dirty, false),
        }
    };
}

macro_rules! define_catalog {
    ($(($variant:ident, $ty:ty, $field:ident, $networked:literal)),+ $(,)?) => {
        /// Stable ordinal identity of a component kind, assigned by catalog
        /// position.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[repr(u16)]
        pub enum ComponentId {
            $(
                #[doc = concat!("Identity of [`", stringify!($variant), "`].")]
                $variant,
            )+
        }

        impl ComponentId {
            /// Every component kind, in catalog order.
            pub const ALL: &'static [ComponentId] = &[$(ComponentId::$variant),+];

            /// Number of component kinds in the catalog.
            pub const COUNT: usize = Self::ALL.len();

            /// Catalog position.
            #[must_use]
            pub const fn index(self) -> usize {
                self as usize
            }

            /// Kind at a catalog position.
            #[must_use]
            pub fn from_index(index: usize) -> Option<Self> {
                Self::ALL.get(index).copied()
            }

            /// Component type name, for diagnostics.
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }

            /// Whether values of this kind cross the client/server wire.
            #[must_use]
            pub fn is_networked(self) -> bool {
                match self {
                    $(Self::$variant => $networked),+
                }
            }
        }

        /// One typed column of `(entity, value)` entries crossing a registry
        /// boundary — inside a delta or a snapshot packet.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum ComponentPool {
            $(
                #[doc = concat!("Entries of [`", stringify!($variant), "`].")]
                $variant(Vec<(Entity, $ty)>),
            )+
        }

        impl ComponentPool {
            /// Empty pool for a kind.
            #[must_use]
            pub fn empty(id: ComponentId) -> Self {
                match id {
                    $(ComponentId::$variant => Self::$variant(Vec::new())),+
                }
            }

            /// The kind this pool carries.
            #[must_use]
            pub fn component_id(&self) -> ComponentId {
                match self {
                    $(Self::$variant(_) => ComponentId::$variant),+
                }
            }

            /// Number of entries.
            #[must_use]
            pub fn len(&self) -> usize {
                match self {
                    $(Self::$variant(v) => v.len()),+
                }
            }

            /// Whether the pool has no entries.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Visit the entity of every entry.
            pub fn for_each_entity(&self, mut f: impl FnMut(Entity)) {
                match self {
                    $(Self::$variant(v) => {
                        for (entity, _) in v {
                            f(*entity);
                        }
                    }),+
                }
            }

            /// Keep only the entries whose entity passes `keep`.
            pub fn retain_entities(&mut self, mut keep: impl FnMut(Entity) -> bool) {
                match self {
                    $(Self::$variant(v) => v.retain(|(entity, _)| keep(*entity))),+
                }
            }

            /// Rewrite entry entities and every reference inside the values.
            pub fn map_entities(&mut self, f: &mut dyn FnMut(Entity) -> Entity) {
                match self {
                    $(Self::$variant(v) => {
                        for (entity, value) in v.iter_mut() {
                            *entity = f(*entity);
                            MapEntities::map_entities(value, f);
                        }
                    }),+
                }
            }
        }

        $(
            impl Component for $ty {
                const ID: ComponentId = ComponentId::$variant;
            }

            impl PoolOps<$ty> for ComponentPool {
                fn push(&mut self, entity: Entity, value: $ty) {
                    match self {
                        Self::$variant(v) => v.push((entity, value)),
                        _ => panic!(
                            "pool holds {:?}, pushed {}",
                            self.component_id(),
                            stringify!($variant)
                        ),
                    }
                }

                fn entries(&self) -> &[(Entity, $ty)] {
                    match self {
                        Self::$variant(v) => v,
                        _ => panic!(
                            "pool holds {:?}, read as {}",
                            self.component_id(),
                            stringify!($variant)
                        ),
                    }
                }
            }
        )+
    };
}

component_catalog!(define_catalog);

impl ComponentId {
    /// Ordinal of this kind in the registered-networked-components list.
    /// `None` for local kinds. Both wire endpoints derive the same ordering
    /// from the catalog.
    #[must_use]
    pub fn wire_index(self) -> Option<u16> {
        if self.is_networked() {
            Some(self as u16)
        } else {
            None
        }
    }

    /// Kind for a wire ordinal, rejecting local and out-of-range ordinals.
    #[must_use]
    pub fn from_wire_index(wire: u16) -> Option<Self> {
        let id = Self::from_index(wire as usize)?;
        id.is_networked().then_some(id)
    }

    /// Input kinds bypass server ownership checks and feed the input history.
    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(self, Self::BodyInput)
    }

    /// Kinds carried by transient snapshots: values that change every step.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Position | Self::Orientation | Self::LinVel | Self::AngVel | Self::BodyInput
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn test_catalog_ordinals_are_stable() {
        assert_eq!(ComponentId::DynamicTag.index(), 0);
        assert_eq!(ComponentId::from_index(0), Some(ComponentId::DynamicTag));
        assert_eq!(ComponentId::from_index(ComponentId::COUNT), None);

        // Tags and transforms sort before anything referencing entities.
        assert!(ComponentId::Position.index() < ComponentId::Constraint.index());
        assert!(ComponentId::DynamicTag.index() < ComponentId::ContactManifold.index());
        assert!(ComponentId::ContactManifold.index() < ComponentId::EntityOwner.index());
    }

    #[test]
    fn test_wire_index_round_trip() {
        for id in ComponentId::ALL {
            match id.wire_index() {
                Some(wire) => {
                    assert!(id.is_networked());
                    assert_eq!(ComponentId::from_wire_index(wire), Some(*id));
                }
                None => assert!(!id.is_networked()),
            }
        }

        // Local kinds are rejected on the wire.
        assert!(ComponentId::Aabb.wire_index().is_none());
        assert!(ComponentId::from_wire_index(ComponentId::Aabb as u16).is_none());
    }

    #[test]
    fn test_pool_push_and_entries() {
        let e = Entity::from_parts(1, 0);
        let mut pool = ComponentPool::empty(ComponentId::Position);
        PoolOps::<Position>::push(&mut pool, e, Position(Point3::new(1.0, 2.0, 3.0)));

        assert_eq!(pool.len(), 1);
        let entries = PoolOps::<Position>::entries(&pool);
        assert_eq!(entries[0].0, e);
        assert_eq!(entries[0].1 .0, Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_pool_map_entities_rewrites_refs() {
        let a = Entity::from_parts(1, 0);
        let b = Entity::from_parts(2, 0);
        let edge = Entity::from_parts(3, 0);
        let a2 = Entity::from_parts(11, 0);

        let mut pool = ComponentPool::empty(ComponentId::ContactManifold);
        PoolOps::<ContactManifold>::push(&mut pool, edge, ContactManifold::new([a, b]));

        pool.map_entities(&mut |e| if e == a { a2 } else { e });

        let entries = PoolOps::<ContactManifold>::entries(&pool);
        assert_eq!(entries[0].1.body, [a2, b]);
    }

    #[test]
    fn test_input_and_transient_sets() {
        assert!(ComponentId::BodyInput.is_input());
        assert!(!ComponentId::Position.is_input());
        assert!(ComponentId::Position.is_transient());
        assert!(ComponentId::LinVel.is_transient());
        assert!(!ComponentId::Shape.is_transient());
    }
}
