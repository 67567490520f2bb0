//! Parallel island simulation core.
//!
//! The world is partitioned into *islands* — connected components of the
//! entity graph — each simulated by its own worker job on a small thread
//! pool. The [`IslandCoordinator`] owns the authoritative registry, routes
//! deltas between the main thread and the workers, merges islands when
//! contact or constraint edges bridge them, and splits them back apart when
//! a worker reports that its graph came apart.
//!
//! [`IslandSim`] is the headless per-island stepper; the client network
//! layer reuses it for speculative extrapolation.

pub mod body;
pub mod broadphase;
pub mod collide;
pub mod coordinator;
pub mod dispatcher;
pub mod island;
pub mod messages;
pub mod presentation;
pub mod solver;
pub mod time;
pub mod util;
pub mod worker;

pub use body::{BodyKind, RigidBodyDesc};
pub use coordinator::IslandCoordinator;
pub use dispatcher::{Job, JobDispatcher};
pub use island::IslandSim;
pub use messages::{BodySnapshot, CoordToWorker, ExtrapolationResult, WorkerToCoord};
pub use presentation::{snap_presentation, update_presentation};
pub use time::now_seconds;
pub use util::collect_islands_from_residents;
pub use worker::{StepHook, WorkerHooks};
