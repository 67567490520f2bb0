//! Change-tracking components.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::comp::ComponentId;

/// Maximum number of component kinds one entity can stream every step.
pub const MAX_CONTINUOUS: usize = 16;

/// Component kinds a worker must stream back to the coordinator after every
/// step, for values that change continuously (transforms, velocities).
///
/// Kinds are referred to by component id so the set can be shared between
/// client and server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Continuous {
    indices: SmallVec<[ComponentId; MAX_CONTINUOUS]>,
}

impl Continuous {
    /// The default streaming set for a rigid body.
    #[must_use]
    pub fn rigid_body() -> Self {
        let mut c = Self::default();
        c.insert(ComponentId::Position);
        c.insert(ComponentId::Orientation);
        c.insert(ComponentId::LinVel);
        c.insert(ComponentId::AngVel);
        c
    }

    /// Add a component kind. Ignored when already present or when the set is
    /// full.
    pub fn insert(&mut self, id: ComponentId) {
        if self.indices.contains(&id) {
            return;
        }
        debug_assert!(self.indices.len() < MAX_CONTINUOUS);
        if self.indices.len() < MAX_CONTINUOUS {
            self.indices.push(id);
        }
    }

    /// Remove a component kind if present.
    pub fn remove(&mut self, id: ComponentId) {
        self.indices.retain(|i| *i != id);
    }

    /// Whether a kind is in the streaming set.
    #[must_use]
    pub fn contains(&self, id: ComponentId) -> bool {
        self.indices.contains(&id)
    }

    /// Iterate the streaming set.
    pub fn iter(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.indices.iter().copied()
    }
}

/// Per-entity record of mutations that happened outside the island step.
///
/// Created by any out-of-step mutation, drained into the next delta by
/// `sync`, then cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dirty {
    /// Component kinds created since the last drain.
    pub created: SmallVec<[ComponentId; 8]>,
    /// Component kinds updated since the last drain.
    pub updated: SmallVec<[ComponentId; 8]>,
    /// Component kinds destroyed since the last drain.
    pub destroyed: SmallVec<[ComponentId; 8]>,
    /// Whether the entity itself was created since the last drain.
    pub is_new_entity: bool,
}

impl Dirty {
    /// A dirty record for a freshly created entity.
    #[must_use]
    pub fn new_entity() -> Self {
        Self {
            is_new_entity: true,
            ..Self::default()
        }
    }

    /// Mark a component kind created.
    pub fn mark_created(&mut self, id: ComponentId) {
        if !self.created.contains(&id) {
            self.created.push(id);
        }
    }

    /// Mark a component kind updated.
    pub fn mark_updated(&mut self, id: ComponentId) {
        if !self.updated.contains(&id) {
            self.updated.push(id);
        }
    }

    /// Mark a component kind destroyed. Supersedes pending creates/updates of
    /// the same kind.
    pub fn mark_destroyed(&mut self, id: ComponentId) {
        self.created.retain(|i| *i != id);
        self.updated.retain(|i| *i != id);
        if !self.destroyed.contains(&id) {
            self.destroyed.push(id);
        }
    }

    /// Merge another record into this one.
    pub fn merge(&mut self, other: &Self) {
        for id in &other.created {
            self.mark_created(*id);
        }
        for id in &other.updated {
            self.mark_updated(*id);
        }
        for id in &other.destroyed {
            self.mark_destroyed(*id);
        }
        self.is_new_entity |= other.is_new_entity;
    }

    /// Whether there is nothing to drain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_new_entity
            && self.created.is_empty()
            && self.updated.is_empty()
            && self.destroyed.is_empty()
    }
}

/// Dirty record produced by packet import, kept separate from [`Dirty`] so
/// state a client just received is not echoed straight back to its sender.
/// Merged into the regular dirty set at the end of the network tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDirty(pub Dirty);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuous_dedup_and_cap() {
        let mut c = Continuous::rigid_body();
        c.insert(ComponentId::Position);
        assert_eq!(c.iter().count(), 4);
        assert!(c.contains(ComponentId::LinVel));

        c.remove(ComponentId::LinVel);
        assert!(!c.contains(ComponentId::LinVel));
    }

    #[test]
    fn test_dirty_destroy_supersedes_update() {
        let mut d = Dirty::default();
        d.mark_updated(ComponentId::Position);
        d.mark_destroyed(ComponentId::Position);
        assert!(d.updated.is_empty());
        assert_eq!(d.destroyed.len(), 1);
    }

    #[test]
    fn test_dirty_merge() {
        let mut a = Dirty::default();
        a.mark_updated(ComponentId::Position);

        let mut b = Dirty::new_entity();
        b.mark_created(ComponentId::LinVel);
        b.mark_updated(ComponentId::Position);

        a.merge(&b);
        assert!(a.is_new_entity);
        assert_eq!(a.updated.len(), 1);
        assert_eq!(a.created.len(), 1);
    }
}
