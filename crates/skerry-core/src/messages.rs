//! Typed messages crossing the coordinator ↔ worker queues.
//!
//! Each worker has one inbound and one outbound queue. Messages to a given
//! worker are delivered in send order and processed before the next step
//! decision; there is no ordering between distinct workers.

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use skerry_delta::Delta;
use skerry_types::comp::ComponentPool;
use skerry_types::{Entity, SimSettings};

/// Transform and velocity of one body, as captured by an extrapolation job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodySnapshot {
    /// Position of the center of mass.
    pub position: Point3<f64>,
    /// Orientation.
    pub orientation: UnitQuaternion<f64>,
    /// Linear velocity.
    pub linvel: Vector3<f64>,
    /// Angular velocity.
    pub angvel: Vector3<f64>,
}

/// Final state of a finished extrapolation job, in coordinator entity space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrapolationResult {
    /// The bodies the job advanced.
    pub entities: Vec<Entity>,
    /// One snapshot per entry of `entities`.
    pub snapshots: Vec<BodySnapshot>,
    /// Whether the job hit its wall-clock budget before reaching the present.
    pub terminated_early: bool,
}

/// Messages from the coordinator to an island worker. Entities are in
/// coordinator space; the worker translates through its entity map.
#[derive(Debug, Clone)]
pub enum CoordToWorker {
    /// Entity and component changes to import.
    Delta(Delta),
    /// Pause or resume stepping.
    SetPaused(bool),
    /// Run exactly one step while paused.
    StepSimulation,
    /// Wake a sleeping island.
    WakeUp,
    /// Replace the worker's settings.
    SetSettings(SimSettings),
    /// Re-center a body's mass, fixing up derived state.
    SetCenterOfMass {
        /// Body entity, coordinator space.
        entity: Entity,
        /// New center of mass, body space.
        com: Vector3<f64>,
    },
    /// Snap island state to snapshot pools, recording discontinuities.
    ApplySnapshotPools {
        /// Pools in coordinator entity space.
        pools: Vec<ComponentPool>,
    },
    /// Fold a finished extrapolation into the island, recording
    /// discontinuities.
    ApplyExtrapolationResult(ExtrapolationResult),
}

/// Messages from an island worker back to the coordinator.
#[derive(Debug, Clone)]
pub enum WorkerToCoord {
    /// Everything that changed since the worker's previous sync.
    Delta(Delta),
    /// The worker's graph has come apart; the worker pauses until the
    /// coordinator executes the split.
    SplitRequest,
}
