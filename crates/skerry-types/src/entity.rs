//! Entity handles.
//!
//! An [`Entity`] is an opaque 64-bit generation-index handle. The low 32 bits
//! are a slot index into the owning registry; the high 32 bits are a
//! generation counter that is bumped every time a slot is recycled, so stale
//! handles never alias a live entity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle to an entity in a registry.
///
/// Handles are only meaningful relative to the registry that produced them.
/// Cross-registry references (coordinator ↔ worker, client ↔ server) must go
/// through an entity map.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// Build a handle from a slot index and a generation counter.
    #[must_use]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// Slot index within the owning registry.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Generation counter of the slot at the time this handle was issued.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw 64-bit representation.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw representation.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_round_trip() {
        let e = Entity::from_parts(42, 7);
        assert_eq!(e.index(), 42);
        assert_eq!(e.generation(), 7);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
    }

    #[test]
    fn test_entity_generations_distinguish_recycled_slots() {
        let old = Entity::from_parts(3, 0);
        let new = Entity::from_parts(3, 1);
        assert_ne!(old, new);
        assert_eq!(old.index(), new.index());
    }

    #[test]
    fn test_entity_serde() {
        let e = Entity::from_parts(9, 2);
        let bytes = bincode::serialize(&e).unwrap();
        let back: Entity = bincode::deserialize(&bytes).unwrap();
        assert_eq!(e, back);
    }
}
