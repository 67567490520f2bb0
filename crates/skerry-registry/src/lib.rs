//! Columnar entity/component storage for the skerry engine.
//!
//! A [`Registry`] keeps one dense column per component kind in the shared
//! catalog, indexed by sparse-set lookup from generation-tracked entity
//! handles. An [`EntityMap`] associates handles across registries.

mod column;
mod entity_map;
mod registry;

pub use column::Column;
pub use entity_map::EntityMap;
pub use registry::{ColumnStore, Registry};
