//! Broad-phase pair discovery.
//!
//! A single-axis sweep over AABBs, chosen by scene extent. Used by each
//! island worker over its shard and by the coordinator over the mirrored
//! AABBs of the whole world to pair bodies across islands. Pairs come out
//! with ordered keys in sweep order, so discovery is deterministic for a
//! given set of boxes.

use skerry_types::{Aabb, Entity};

/// One body entering the sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepEntry {
    /// The body entity.
    pub entity: Entity,
    /// Its current world AABB.
    pub aabb: Aabb,
    /// Whether the body participates in constraint solving. Pairs where
    /// neither side does are skipped.
    pub procedural: bool,
}

/// Order a pair key so `(a, b)` and `(b, a)` collapse.
#[must_use]
pub fn pair_key(a: Entity, b: Entity) -> (Entity, Entity) {
    if a.to_bits() <= b.to_bits() {
        (a, b)
    } else {
        (b, a)
    }
}

/// Find overlapping AABB pairs, with `margin` of slack on every box.
#[must_use]
pub fn sweep_pairs(entries: &[SweepEntry], margin: f64) -> Vec<(Entity, Entity)> {
    if entries.len() < 2 {
        return Vec::new();
    }

    // Sweep along the axis with the largest spread.
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for entry in entries {
        let center = entry.aabb.center();
        for axis in 0..3 {
            min[axis] = min[axis].min(center[axis]);
            max[axis] = max[axis].max(center[axis]);
        }
    }
    let axis = (0..3)
        .max_by(|&l, &r| {
            (max[l] - min[l])
                .partial_cmp(&(max[r] - min[r]))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);

    let mut sorted: Vec<(usize, f64, f64)> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let aabb = entry.aabb.expanded(margin);
            (i, aabb.min[axis], aabb.max[axis])
        })
        .collect();
    sorted.sort_by(|l, r| l.1.partial_cmp(&r.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut pairs = Vec::new();
    for i in 0..sorted.len() {
        let (index_i, _, max_i) = sorted[i];
        for &(index_j, min_j, _) in sorted.iter().skip(i + 1) {
            if min_j > max_i {
                break;
            }
            let a = &entries[index_i];
            let b = &entries[index_j];
            if !a.procedural && !b.procedural {
                continue;
            }
            if a.aabb.expanded(margin).overlaps(&b.aabb.expanded(margin)) {
                pairs.push(pair_key(a.entity, b.entity));
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    fn entry(index: u32, x: f64, procedural: bool) -> SweepEntry {
        SweepEntry {
            entity: Entity::from_parts(index, 0),
            aabb: Aabb::from_center(Point3::new(x, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0)),
            procedural,
        }
    }

    #[test]
    fn test_finds_overlapping_pair() {
        let entries = [entry(1, 0.0, true), entry(2, 1.5, true), entry(3, 10.0, true)];
        let pairs = sweep_pairs(&entries, 0.0);
        assert_eq!(pairs.len(), 1);
        assert_eq!(
            pairs[0],
            pair_key(Entity::from_parts(1, 0), Entity::from_parts(2, 0))
        );
    }

    #[test]
    fn test_skips_pairs_with_no_procedural_side() {
        let entries = [entry(1, 0.0, false), entry(2, 1.0, false)];
        assert!(sweep_pairs(&entries, 0.0).is_empty());

        let entries = [entry(1, 0.0, false), entry(2, 1.0, true)];
        assert_eq!(sweep_pairs(&entries, 0.0).len(), 1);
    }

    #[test]
    fn test_margin_catches_near_misses() {
        let entries = [entry(1, 0.0, true), entry(2, 2.05, true)];
        assert!(sweep_pairs(&entries, 0.0).is_empty());
        assert_eq!(sweep_pairs(&entries, 0.1).len(), 1);
    }

    #[test]
    fn test_deterministic_order() {
        let entries = [
            entry(3, 2.0, true),
            entry(1, 0.0, true),
            entry(2, 1.0, true),
        ];
        let a = sweep_pairs(&entries, 0.0);
        let b = sweep_pairs(&entries, 0.0);
        assert_eq!(a, b);
    }
}
