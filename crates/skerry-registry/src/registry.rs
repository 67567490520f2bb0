//! The entity/component registry.
//!
//! One [`Column`] per catalog kind, generated from the shared component
//! catalog, plus a generation-tracked entity allocator. The coordinator owns
//! one registry for the whole world; each island worker owns a disjoint
//! replica for its shard.
//!
//! The registry has no observer machinery: the worker and coordinator emit
//! creation/destruction bookkeeping explicitly at the call sites that mutate
//! it.

use skerry_types::comp::{Component, ComponentId, ComponentPool, MapEntities};
use skerry_types::Entity;

use crate::column::Column;

#[derive(Debug, Clone, Default)]
struct EntityAllocator {
    generations: Vec<u32>,
    free: Vec<u32>,
    live: usize,
}

impl EntityAllocator {
    #[allow(clippy::cast_possible_truncation)]
    fn create(&mut self) -> Entity {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => Entity::from_parts(slot, self.generations[slot as usize]),
            None => {
                self.generations.push(0);
                Entity::from_parts((self.generations.len() - 1) as u32, 0)
            }
        }
    }

    fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let slot = entity.index();
        self.generations[slot as usize] = self.generations[slot as usize].wrapping_add(1);
        self.free.push(slot);
        self.live -= 1;
        true
    }

    fn is_alive(&self, entity: Entity) -> bool {
        self.generations
            .get(entity.index() as usize)
            .is_some_and(|gen| *gen == entity.generation())
    }
}

macro_rules! define_storage {
    ($(($variant:ident, $ty:ty, $field:ident, $networked:literal)),+ $(,)?) => {
        #[derive(Debug, Clone, Default)]
        struct Columns {
            $($field: Column<$ty>,)+
        }

        /// Typed column access, implemented for every catalog kind.
        pub trait ColumnStore<C: Component> {
            /// Immutable column for `C`.
            fn column(&self) -> &Column<C>;
            /// Mutable column for `C`.
            fn column_mut(&mut self) -> &mut Column<C>;
        }

        $(
            impl ColumnStore<$ty> for Registry {
                fn column(&self) -> &Column<$ty> {
                    &self.columns.$field
                }
                fn column_mut(&mut self) -> &mut Column<$ty> {
                    &mut self.columns.$field
                }
            }
        )+

        impl Registry {
            /// Whether the entity has a component of the given kind.
            #[must_use]
            pub fn contains_by_id(&self, entity: Entity, id: ComponentId) -> bool {
                match id {
                    $(ComponentId::$variant => self.columns.$field.contains(entity),)+
                }
            }

            /// Remove a component by kind. Returns whether one was removed.
            pub fn remove_by_id(&mut self, entity: Entity, id: ComponentId) -> bool {
                match id {
                    $(ComponentId::$variant => self.columns.$field.remove(entity).is_some(),)+
                }
            }

            /// Clone the entity's component of the pool's kind into the pool.
            /// Returns whether the entity had one.
            pub fn clone_into_pool(&self, entity: Entity, pool: &mut ComponentPool) -> bool {
                match pool {
                    $(ComponentPool::$variant(entries) => {
                        if let Some(value) = self.columns.$field.get(entity) {
                            entries.push((entity, value.clone()));
                            true
                        } else {
                            false
                        }
                    })+
                }
            }

            /// Visit the kind of every component the entity holds, in catalog
            /// order.
            pub fn for_each_present(&self, entity: Entity, mut visit: impl FnMut(ComponentId)) {
                $(
                    if self.columns.$field.contains(entity) {
                        visit(ComponentId::$variant);
                    }
                )+
            }

            /// Apply a pool's entries: map each entry's entity through
            /// `key_map` (entries mapping to `None` are skipped), rewrite
            /// internal references through `ref_map`, insert the value.
            /// Returns the number of entries applied.
            pub fn import_pool(
                &mut self,
                pool: &ComponentPool,
                key_map: &mut dyn FnMut(Entity) -> Option<Entity>,
                ref_map: &mut dyn FnMut(Entity) -> Entity,
            ) -> usize {
                let mut applied = 0;
                match pool {
                    $(ComponentPool::$variant(entries) => {
                        for (remote, value) in entries {
                            let Some(local) = key_map(*remote) else {
                                tracing::warn!(
                                    component = ComponentId::$variant.name(),
                                    entity = %remote,
                                    "dropping pool entry for unmapped entity",
                                );
                                continue;
                            };
                            if !self.alloc.is_alive(local) {
                                continue;
                            }
                            let mut value = value.clone();
                            MapEntities::map_entities(&mut value, ref_map);
                            self.columns.$field.insert(local, value);
                            applied += 1;
                        }
                    })+
                }
                applied
            }

            fn remove_all_components(&mut self, entity: Entity) {
                $(self.columns.$field.remove(entity);)+
            }
        }
    };
}

/// Columnar entity/component store over the closed component catalog.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    alloc: EntityAllocator,
    columns: Columns,
}

skerry_types::component_catalog!(define_storage);

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh entity with no components.
    pub fn create(&mut self) -> Entity {
        self.alloc.create()
    }

    /// Destroy an entity and every component attached to it. Returns whether
    /// the entity was alive.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.alloc.is_alive(entity) {
            return false;
        }
        self.remove_all_components(entity);
        self.alloc.destroy(entity)
    }

    /// Whether an entity handle refers to a live entity.
    #[must_use]
    pub fn contains(&self, entity: Entity) -> bool {
        self.alloc.is_alive(entity)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.alloc.live
    }

    /// Insert or replace a component, returning the replaced value.
    ///
    /// The entity must be alive; inserting on a dead entity is a bug.
    pub fn insert<C: Component>(&mut self, entity: Entity, value: C) -> Option<C>
    where
        Self: ColumnStore<C>,
    {
        debug_assert!(self.alloc.is_alive(entity), "insert on dead entity");
        self.column_mut().insert(entity, value)
    }

    /// Component value for an entity.
    #[must_use]
    pub fn get<C: Component>(&self, entity: Entity) -> Option<&C>
    where
        Self: ColumnStore<C>,
    {
        self.column().get(entity)
    }

    /// Mutable component value for an entity.
    #[must_use]
    pub fn get_mut<C: Component>(&mut self, entity: Entity) -> Option<&mut C>
    where
        Self: ColumnStore<C>,
    {
        self.column_mut().get_mut(entity)
    }

    /// Get the component, inserting its default first when missing.
    pub fn get_or_insert_default<C: Component + Default>(&mut self, entity: Entity) -> &mut C
    where
        Self: ColumnStore<C>,
    {
        debug_assert!(self.alloc.is_alive(entity), "insert on dead entity");
        let column = self.column_mut();
        if !column.contains(entity) {
            column.insert(entity, C::default());
        }
        column.get_mut(entity).unwrap_or_else(|| {
            // Insert above cannot fail for a live entity.
            unreachable!("component just inserted")
        })
    }

    /// Remove a component from an entity.
    pub fn remove<C: Component>(&mut self, entity: Entity) -> Option<C>
    where
        Self: ColumnStore<C>,
    {
        self.column_mut().remove(entity)
    }

    /// Whether an entity holds a component of kind `C`.
    #[must_use]
    pub fn has<C: Component>(&self, entity: Entity) -> bool
    where
        Self: ColumnStore<C>,
    {
        self.column().contains(entity)
    }

    /// Iterate `(entity, value)` for a kind, in insertion order.
    pub fn iter<C: Component>(&self) -> impl Iterator<Item = (Entity, &C)>
    where
        Self: ColumnStore<C>,
    {
        self.column().iter()
    }

    /// Iterate `(entity, value)` mutably for a kind.
    pub fn iter_mut<C: Component>(&mut self) -> impl Iterator<Item = (Entity, &mut C)>
    where
        Self: ColumnStore<C>,
    {
        self.column_mut().iter_mut()
    }

    /// Iterate the entities holding a kind, in insertion order.
    pub fn entities_with<C: Component>(&self) -> impl Iterator<Item = Entity> + '_
    where
        Self: ColumnStore<C>,
    {
        self.column().entities()
    }

    /// Drop every value of a kind.
    pub fn clear<C: Component>(&mut self)
    where
        Self: ColumnStore<C>,
    {
        self.column_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use skerry_types::comp::{
        ContactManifold, Dirty, DynamicTag, LinVel, Position, PoolOps,
    };

    #[test]
    fn test_create_destroy_recycles_with_new_generation() {
        let mut registry = Registry::new();
        let a = registry.create();
        registry.insert(a, Position(Point3::new(1.0, 0.0, 0.0)));
        assert!(registry.destroy(a));
        assert!(!registry.contains(a));
        assert!(!registry.destroy(a));

        let b = registry.create();
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(registry.get::<Position>(b).is_none(), "no leak into recycled slot");
    }

    #[test]
    fn test_destroy_removes_all_components() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.insert(e, Position::default());
        registry.insert(e, LinVel::default());
        registry.insert(e, DynamicTag);

        registry.destroy(e);
        assert!(registry.get::<Position>(e).is_none());
        assert_eq!(registry.iter::<LinVel>().count(), 0);
    }

    #[test]
    fn test_dynamic_ops_by_id() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.insert(e, Position::default());
        registry.insert(e, DynamicTag);

        assert!(registry.contains_by_id(e, ComponentId::Position));
        assert!(!registry.contains_by_id(e, ComponentId::LinVel));

        let mut present = Vec::new();
        registry.for_each_present(e, |id| present.push(id));
        assert_eq!(present, vec![ComponentId::DynamicTag, ComponentId::Position]);

        assert!(registry.remove_by_id(e, ComponentId::Position));
        assert!(!registry.contains_by_id(e, ComponentId::Position));
    }

    #[test]
    fn test_clone_into_pool_and_import() {
        let mut source = Registry::new();
        let e = source.create();
        source.insert(e, Position(Point3::new(2.0, 3.0, 4.0)));

        let mut pool = ComponentPool::empty(ComponentId::Position);
        assert!(source.clone_into_pool(e, &mut pool));
        assert_eq!(pool.len(), 1);

        let mut target = Registry::new();
        let local = target.create();
        let applied = target.import_pool(
            &pool,
            &mut |remote| (remote == e).then_some(local),
            &mut |r| r,
        );
        assert_eq!(applied, 1);
        assert_eq!(
            target.get::<Position>(local).map(|p| p.0),
            Some(Point3::new(2.0, 3.0, 4.0))
        );
    }

    #[test]
    fn test_import_pool_remaps_internal_refs() {
        let mut source = Registry::new();
        let body_a = source.create();
        let body_b = source.create();
        let edge = source.create();
        source.insert(edge, ContactManifold::new([body_a, body_b]));

        let mut pool = ComponentPool::empty(ComponentId::ContactManifold);
        assert!(source.clone_into_pool(edge, &mut pool));

        let mut target = Registry::new();
        let local_a = target.create();
        let local_b = target.create();
        let local_edge = target.create();

        target.import_pool(
            &pool,
            &mut |remote| (remote == edge).then_some(local_edge),
            &mut |r| {
                if r == body_a {
                    local_a
                } else if r == body_b {
                    local_b
                } else {
                    r
                }
            },
        );

        let manifold = target.get::<ContactManifold>(local_edge).unwrap();
        assert_eq!(manifold.body, [local_a, local_b]);
    }

    #[test]
    fn test_import_pool_skips_unmapped_and_dead() {
        let mut source = Registry::new();
        let e = source.create();
        source.insert(e, Position::default());
        let mut pool = ComponentPool::empty(ComponentId::Position);
        source.clone_into_pool(e, &mut pool);

        let mut target = Registry::new();
        let dead = target.create();
        target.destroy(dead);

        assert_eq!(target.import_pool(&pool, &mut |_| None, &mut |r| r), 0);
        assert_eq!(
            target.import_pool(&pool, &mut |_| Some(dead), &mut |r| r),
            0
        );
    }

    #[test]
    fn test_get_or_insert_default() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.get_or_insert_default::<Dirty>(e).mark_updated(ComponentId::Position);
        assert_eq!(registry.get::<Dirty>(e).unwrap().updated.len(), 1);
    }

    #[test]
    fn test_typed_pool_entries_via_registry() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.insert(e, Position(Point3::new(1.0, 1.0, 1.0)));

        let mut pool = ComponentPool::empty(ComponentId::Position);
        registry.clone_into_pool(e, &mut pool);
        let entries = PoolOps::<Position>::entries(&pool);
        assert_eq!(entries[0].0, e);
    }
}
