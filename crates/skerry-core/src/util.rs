//! Small shared helpers.

use skerry_registry::Registry;
use skerry_types::comp::{IslandResident, MultiIslandResident};
use skerry_types::Entity;

/// Collect the islands in which any of `entities` reside, deduplicated and
/// in first-seen order.
#[must_use]
pub fn collect_islands_from_residents(
    registry: &Registry,
    entities: impl IntoIterator<Item = Entity>,
) -> Vec<Entity> {
    let mut islands = Vec::new();
    for entity in entities {
        if let Some(resident) = registry.get::<IslandResident>(entity) {
            if !islands.contains(&resident.island) {
                islands.push(resident.island);
            }
        } else if let Some(resident) = registry.get::<MultiIslandResident>(entity) {
            for island in &resident.islands {
                if !islands.contains(island) {
                    islands.push(*island);
                }
            }
        }
    }
    islands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_and_dedups() {
        let mut registry = Registry::new();
        let island_a = registry.create();
        let island_b = registry.create();
        let e1 = registry.create();
        let e2 = registry.create();
        let shared = registry.create();

        registry.insert(e1, IslandResident { island: island_a });
        registry.insert(e2, IslandResident { island: island_a });
        let mut multi = MultiIslandResident::default();
        multi.insert(island_a);
        multi.insert(island_b);
        registry.insert(shared, multi);

        let islands = collect_islands_from_residents(&registry, [e1, e2, shared]);
        assert_eq!(islands, vec![island_a, island_b]);
    }
}
