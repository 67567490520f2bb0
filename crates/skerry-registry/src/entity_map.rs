//! Bidirectional remote ↔ local entity association.
//!
//! Every cross-registry reference goes through one of these: coordinator ↔
//! worker and client ↔ server each keep their own map. Gaps are allowed —
//! an unknown remote entity simply has no local counterpart yet.

use hashbrown::HashMap;

use skerry_types::Entity;

/// Bidirectional association of remote entity handles to local ones.
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    remote_to_local: HashMap<Entity, Entity>,
    local_to_remote: HashMap<Entity, Entity>,
}

impl EntityMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a remote entity with a local one.
    ///
    /// Re-inserting an existing pair is a no-op; mapping either side to a
    /// different partner replaces the old association.
    pub fn insert(&mut self, remote: Entity, local: Entity) {
        if let Some(previous_local) = self.remote_to_local.insert(remote, local) {
            self.local_to_remote.remove(&previous_local);
        }
        if let Some(previous_remote) = self.local_to_remote.insert(local, remote) {
            self.remote_to_local.remove(&previous_remote);
            self.remote_to_local.insert(remote, local);
        }
    }

    /// Whether a remote entity has a local counterpart.
    #[must_use]
    pub fn has_remote(&self, remote: Entity) -> bool {
        self.remote_to_local.contains_key(&remote)
    }

    /// Whether a local entity has a remote counterpart.
    #[must_use]
    pub fn has_local(&self, local: Entity) -> bool {
        self.local_to_remote.contains_key(&local)
    }

    /// Local counterpart of a remote entity.
    #[must_use]
    pub fn local_for(&self, remote: Entity) -> Option<Entity> {
        self.remote_to_local.get(&remote).copied()
    }

    /// Remote counterpart of a local entity.
    #[must_use]
    pub fn remote_for(&self, local: Entity) -> Option<Entity> {
        self.local_to_remote.get(&local).copied()
    }

    /// Drop the association for a remote entity.
    pub fn erase_remote(&mut self, remote: Entity) {
        if let Some(local) = self.remote_to_local.remove(&remote) {
            self.local_to_remote.remove(&local);
        }
    }

    /// Drop the association for a local entity.
    pub fn erase_local(&mut self, local: Entity) {
        if let Some(remote) = self.local_to_remote.remove(&local) {
            self.remote_to_local.remove(&remote);
        }
    }

    /// Number of associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.remote_to_local.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remote_to_local.is_empty()
    }

    /// Iterate `(remote, local)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, Entity)> + '_ {
        self.remote_to_local.iter().map(|(r, l)| (*r, *l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(index: u32) -> Entity {
        Entity::from_parts(index, 0)
    }

    #[test]
    fn test_round_trip() {
        let mut map = EntityMap::new();
        map.insert(entity(1), entity(100));
        map.insert(entity(2), entity(200));

        assert_eq!(map.local_for(entity(1)), Some(entity(100)));
        assert_eq!(map.remote_for(entity(200)), Some(entity(2)));
        assert!(map.has_remote(entity(1)));
        assert!(map.has_local(entity(200)));
        assert!(!map.has_remote(entity(3)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_erase_both_sides() {
        let mut map = EntityMap::new();
        map.insert(entity(1), entity(100));
        map.erase_remote(entity(1));
        assert!(!map.has_local(entity(100)));

        map.insert(entity(2), entity(200));
        map.erase_local(entity(200));
        assert!(!map.has_remote(entity(2)));
        assert!(map.is_empty());
    }

    #[test]
    fn test_reinsert_replaces_association() {
        let mut map = EntityMap::new();
        map.insert(entity(1), entity(100));
        map.insert(entity(1), entity(101));

        assert_eq!(map.local_for(entity(1)), Some(entity(101)));
        assert!(!map.has_local(entity(100)));
        assert_eq!(map.len(), 1);
    }
}
