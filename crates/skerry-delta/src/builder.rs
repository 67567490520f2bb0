//! Incremental construction of a [`Delta`].

use skerry_registry::Registry;
use skerry_types::comp::{Component, ComponentId, ComponentPool, PoolOps};
use skerry_types::Entity;

use crate::delta::Delta;
use crate::is_transportable;

/// Accumulates changes between two drain points, then [`finish`]es into a
/// [`Delta`]. One builder lives on each worker (drained by `sync`) and one
/// per island on the coordinator (drained every tick).
///
/// [`finish`]: DeltaBuilder::finish
#[derive(Debug)]
pub struct DeltaBuilder {
    created_entities: Vec<Entity>,
    destroyed_entities: Vec<Entity>,
    mappings: Vec<(Entity, Entity)>,
    created: Vec<Option<ComponentPool>>,
    updated: Vec<Option<ComponentPool>>,
    destroyed: Vec<Vec<Entity>>,
}

impl Default for DeltaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            created_entities: Vec::new(),
            destroyed_entities: Vec::new(),
            mappings: Vec::new(),
            created: std::iter::repeat_with(|| None)
                .take(ComponentId::COUNT)
                .collect(),
            updated: std::iter::repeat_with(|| None)
                .take(ComponentId::COUNT)
                .collect(),
            destroyed: vec![Vec::new(); ComponentId::COUNT],
        }
    }

    /// Record the creation of an entity.
    pub fn created(&mut self, entity: Entity) {
        if !self.created_entities.contains(&entity) {
            self.created_entities.push(entity);
        }
    }

    /// Record a created component value.
    pub fn created_component<C: Component>(&mut self, entity: Entity, value: C)
    where
        ComponentPool: PoolOps<C>,
    {
        pool_for(&mut self.created, C::ID).push(entity, value);
    }

    /// Record an updated component value.
    pub fn updated<C: Component>(&mut self, entity: Entity, value: C)
    where
        ComponentPool: PoolOps<C>,
    {
        pool_for(&mut self.updated, C::ID).push(entity, value);
    }

    /// Record a created component by kind, cloning the value from `registry`.
    pub fn created_by_id(&mut self, registry: &Registry, entity: Entity, id: ComponentId) {
        if !is_transportable(id) {
            return;
        }
        registry.clone_into_pool(entity, pool_for(&mut self.created, id));
    }

    /// Record an updated component by kind, cloning the value from `registry`.
    pub fn updated_by_id(&mut self, registry: &Registry, entity: Entity, id: ComponentId) {
        if !is_transportable(id) {
            return;
        }
        registry.clone_into_pool(entity, pool_for(&mut self.updated, id));
    }

    /// Record creations for every transportable component the entity holds.
    pub fn created_all(&mut self, registry: &Registry, entity: Entity) {
        registry.for_each_present(entity, |id| {
            if is_transportable(id) {
                registry.clone_into_pool(entity, pool_for(&mut self.created, id));
            }
        });
    }

    /// Record updates for every transportable component the entity holds.
    /// Used when an entity moves between islands and must arrive whole.
    pub fn updated_all(&mut self, registry: &Registry, entity: Entity) {
        registry.for_each_present(entity, |id| {
            if is_transportable(id) {
                registry.clone_into_pool(entity, pool_for(&mut self.updated, id));
            }
        });
    }

    /// Record the destruction of one component kind.
    pub fn destroyed_component<C: Component>(&mut self, entity: Entity) {
        self.destroyed_by_id(entity, C::ID);
    }

    /// Record the destruction of one component kind by id.
    pub fn destroyed_by_id(&mut self, entity: Entity, id: ComponentId) {
        let list = &mut self.destroyed[id.index()];
        if !list.contains(&entity) {
            list.push(entity);
        }
    }

    /// Record the destruction of an entity.
    pub fn destroyed(&mut self, entity: Entity) {
        self.created_entities.retain(|e| *e != entity);
        if !self.destroyed_entities.contains(&entity) {
            self.destroyed_entities.push(entity);
        }
    }

    /// Tell the receiver which sender-side handle corresponds to `remote`,
    /// an entity the receiver already owns.
    pub fn insert_entity_mapping(&mut self, remote: Entity, local: Entity) {
        self.mappings.push((remote, local));
    }

    /// Whether a mapping for the receiver-side entity is already recorded.
    #[must_use]
    pub fn has_mapping_for(&self, remote: Entity) -> bool {
        self.mappings.iter().any(|(r, _)| *r == remote)
    }

    /// Whether nothing has been recorded since the last `finish`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created_entities.is_empty()
            && self.destroyed_entities.is_empty()
            && self.mappings.is_empty()
            && self.created.iter().flatten().all(ComponentPool::is_empty)
            && self.updated.iter().flatten().all(ComponentPool::is_empty)
            && self.destroyed.iter().all(Vec::is_empty)
    }

    /// Drain the builder into a delta. Created pools come out sorted by
    /// component id, which is also catalog order.
    pub fn finish(&mut self) -> Delta {
        let created = self
            .created
            .iter_mut()
            .filter_map(Option::take)
            .filter(|p| !p.is_empty())
            .collect();
        let updated = self
            .updated
            .iter_mut()
            .filter_map(Option::take)
            .filter(|p| !p.is_empty())
            .collect();
        let destroyed = self
            .destroyed
            .iter_mut()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .filter_map(|(i, v)| {
                ComponentId::from_index(i).map(|id| (id, std::mem::take(v)))
            })
            .collect();

        Delta {
            created_entities: std::mem::take(&mut self.created_entities),
            destroyed_entities: std::mem::take(&mut self.destroyed_entities),
            entity_mappings: std::mem::take(&mut self.mappings),
            created,
            updated,
            destroyed,
        }
    }
}

fn pool_for(pools: &mut [Option<ComponentPool>], id: ComponentId) -> &mut ComponentPool {
    pools[id.index()].get_or_insert_with(|| ComponentPool::empty(id))
}
