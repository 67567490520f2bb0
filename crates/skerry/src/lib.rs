//! Facade over the skerry engine crates.
//!
//! Pulls the commonly used types into one namespace: build a world with an
//! [`IslandCoordinator`], replicate it with a [`NetworkServer`] and
//! [`NetworkClient`].

pub use skerry_core::{
    collect_islands_from_residents, now_seconds, snap_presentation, update_presentation,
    BodyKind, IslandCoordinator, IslandSim, RigidBodyDesc, WorkerHooks,
};
pub use skerry_delta::{Delta, DeltaBuilder};
pub use skerry_graph::{ConnectedComponent, EntityGraph, GraphError};
pub use skerry_net::{
    ClientSettings, NetworkClient, NetworkServer, Packet, ServerSettings,
};
pub use skerry_registry::{EntityMap, Registry};
pub use skerry_types::{Aabb, Entity, SimError, SimSettings};

/// Component types and the component catalog.
pub mod comp {
    pub use skerry_types::comp::*;
}
