//! Shared types for the skerry engine: entity handles, the component
//! catalog, AABBs, graph indices, settings and errors.
//!
//! Everything here is plain data. Behavior lives in the registry, graph,
//! delta and simulation crates, which all build on this catalog.

pub mod aabb;
pub mod comp;
pub mod entity;
pub mod error;
pub mod index;
pub mod settings;

pub use aabb::Aabb;
pub use entity::Entity;
pub use error::SimError;
pub use index::{EdgeIndex, NodeIndex};
pub use settings::SimSettings;

/// Convenient result alias for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;
