//! Stable arena indices used by the entity graph.

use serde::{Deserialize, Serialize};

/// Index of a node in the entity graph.
///
/// Stable across insertion and removal of unrelated nodes; removed indices
/// may be recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIndex(pub u32);

/// Index of an edge in the entity graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeIndex(pub u32);

impl NodeIndex {
    /// Index as a usize for direct arena addressing.
    #[must_use]
    pub const fn to_usize(self) -> usize {
        self.0 as usize
    }
}

impl EdgeIndex {
    /// Index as a usize for direct arena addressing.
    #[must_use]
    pub const fn to_usize(self) -> usize {
        self.0 as usize
    }
}
