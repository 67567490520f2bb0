//! The delta record and its import.

use serde::{Deserialize, Serialize};

use skerry_registry::{EntityMap, Registry};
use skerry_types::comp::{Component, ComponentId, ComponentPool, PoolOps};
use skerry_types::Entity;

/// A package of entity and component changes, in the sender's entity space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub(crate) created_entities: Vec<Entity>,
    pub(crate) destroyed_entities: Vec<Entity>,
    /// `(receiver-space, sender-space)` pairs: tells the receiver which
    /// sender-side handle corresponds to an entity it already owns.
    pub(crate) entity_mappings: Vec<(Entity, Entity)>,
    /// Created components, sorted by component id so receivers construct
    /// referenced entities' components before anything pointing at them.
    pub(crate) created: Vec<ComponentPool>,
    pub(crate) updated: Vec<ComponentPool>,
    pub(crate) destroyed: Vec<(ComponentId, Vec<Entity>)>,
}

/// What an import did, in terms the caller can act on.
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    /// `(sender-space, local)` pairs for entities created by this import.
    /// The caller reports these back to the sender as entity mappings.
    pub created: Vec<(Entity, Entity)>,
    /// Local entities destroyed by this import.
    pub destroyed: Vec<Entity>,
}

impl Delta {
    /// Whether the delta carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created_entities.is_empty()
            && self.destroyed_entities.is_empty()
            && self.entity_mappings.is_empty()
            && self.created.iter().all(ComponentPool::is_empty)
            && self.updated.iter().all(ComponentPool::is_empty)
            && self.destroyed.iter().all(|(_, v)| v.is_empty())
    }

    /// Entities created by the sender, in its entity space.
    #[must_use]
    pub fn created_entities(&self) -> &[Entity] {
        &self.created_entities
    }

    /// Entities destroyed by the sender, in its entity space.
    #[must_use]
    pub fn destroyed_entities(&self) -> &[Entity] {
        &self.destroyed_entities
    }

    /// Iterate the created-component pools, sorted by component id.
    pub fn created_pools(&self) -> impl Iterator<Item = &ComponentPool> {
        self.created.iter()
    }

    /// Iterate the updated-component pools.
    pub fn updated_pools(&self) -> impl Iterator<Item = &ComponentPool> {
        self.updated.iter()
    }

    /// Created entries of one kind, in the sender's entity space.
    pub fn created_of<C: Component>(&self) -> impl Iterator<Item = &(Entity, C)>
    where
        ComponentPool: PoolOps<C>,
    {
        pool_entries::<C>(&self.created)
    }

    /// Updated entries of one kind, in the sender's entity space.
    pub fn updated_of<C: Component>(&self) -> impl Iterator<Item = &(Entity, C)>
    where
        ComponentPool: PoolOps<C>,
    {
        pool_entries::<C>(&self.updated)
    }

    /// Import into `registry`, translating entities through `map` (keyed by
    /// sender-space handles).
    ///
    /// Unknown created entities get fresh local entities and new map entries.
    /// Unknown entities referenced by updates are dropped with a warning —
    /// the protocol-error path, never a panic. Importing the same delta twice
    /// leaves the registry as importing it once.
    pub fn import(&self, registry: &mut Registry, map: &mut EntityMap) -> ImportResult {
        let mut result = ImportResult::default();

        // Mappings for entities the receiver already owns.
        for (mine, theirs) in &self.entity_mappings {
            map.insert(*theirs, *mine);
        }

        for remote in &self.created_entities {
            if let Some(local) = map.local_for(*remote) {
                if registry.contains(local) {
                    continue;
                }
                // Stale mapping left over from a destroyed local; replace it.
                map.erase_remote(*remote);
            }
            let local = registry.create();
            map.insert(*remote, local);
            result.created.push((*remote, local));
        }

        for pool in &self.created {
            import_pool(registry, map, pool);
        }
        for pool in &self.updated {
            import_pool(registry, map, pool);
        }

        for (id, entities) in &self.destroyed {
            for remote in entities {
                if let Some(local) = map.local_for(*remote) {
                    registry.remove_by_id(local, *id);
                }
            }
        }

        for remote in &self.destroyed_entities {
            if let Some(local) = map.local_for(*remote) {
                if registry.destroy(local) {
                    result.destroyed.push(local);
                }
                map.erase_remote(*remote);
            }
        }

        result
    }
}

fn pool_entries<C: Component>(pools: &[ComponentPool]) -> impl Iterator<Item = &(Entity, C)>
where
    ComponentPool: PoolOps<C>,
{
    pools
        .iter()
        .find(|p| p.component_id() == C::ID)
        .map_or(&[][..], |p| PoolOps::<C>::entries(p))
        .iter()
}

fn import_pool(registry: &mut Registry, map: &EntityMap, pool: &ComponentPool) {
    registry.import_pool(
        pool,
        &mut |remote| map.local_for(remote),
        &mut |remote| {
            map.local_for(remote).unwrap_or_else(|| {
                tracing::warn!(
                    component = pool.component_id().name(),
                    entity = %remote,
                    "component references an unmapped entity",
                );
                remote
            })
        },
    );
}
