//! Island bookkeeping components.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::aabb::Aabb;
use crate::entity::Entity;
use crate::index::{EdgeIndex, NodeIndex};

/// An island: one connected component of the entity graph together with its
/// non-procedural neighbors. The unit of parallel simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Island {
    /// Body entities resident in this island.
    pub nodes: Vec<Entity>,
    /// Constraint and manifold entities resident in this island.
    pub edges: Vec<Entity>,
}

/// Simulation time of an island, advanced by `fixed_dt` per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IslandTimestamp {
    /// Seconds on the shared monotonic clock.
    pub value: f64,
}

/// Immutable snapshot of a worker's broad-phase contents, refreshed after
/// every step. The coordinator queries it to re-partition islands and to
/// answer region queries without touching worker state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeView {
    /// Entity/AABB pairs at the time of the snapshot.
    pub entries: Vec<(Entity, Aabb)>,
}

impl TreeView {
    /// Visit every entry overlapping `region`.
    pub fn query(&self, region: &Aabb, mut visit: impl FnMut(Entity)) {
        for (entity, aabb) in &self.entries {
            if aabb.overlaps(region) {
                visit(*entity);
            }
        }
    }
}

/// Membership of a procedural entity (or edge) in its single island.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IslandResident {
    /// The island entity.
    pub island: Entity,
}

/// Membership of a non-procedural body in every island it touches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiIslandResident {
    /// The island entities. A non-procedural body shared by k islands holds
    /// all k here rather than k separate residents.
    pub islands: SmallVec<[Entity; 4]>,
}

impl MultiIslandResident {
    /// Add an island, ignoring duplicates.
    pub fn insert(&mut self, island: Entity) {
        if !self.islands.contains(&island) {
            self.islands.push(island);
        }
    }

    /// Remove an island if present.
    pub fn remove(&mut self, island: Entity) {
        self.islands.retain(|e| *e != island);
    }
}

/// Link from a body entity to its node in the owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node index in the graph of whichever registry owns this entity.
    pub index: NodeIndex,
}

/// Link from a constraint or manifold entity to its edge in the owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Edge index in the graph of whichever registry owns this entity.
    pub index: EdgeIndex,
}
