//! Client-side extrapolation.
//!
//! On receiving a server snapshot, the client can speculatively re-simulate
//! from the snapshot's timestamp up to the local present instead of snapping
//! into the past. The job seeds a headless [`IslandSim`] with a replica of
//! the affected entities, snaps it to the snapshot, then steps forward at
//! the fixed timestep, replaying buffered inputs at the sub-step they were
//! recorded for. The result is folded back into the live world as
//! discontinuities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use skerry_core::messages::{BodySnapshot, ExtrapolationResult};
use skerry_core::{now_seconds, IslandSim};
use skerry_delta::Delta;
use skerry_types::comp::{AngVel, LinVel, Orientation, Position};
use skerry_types::{Entity, SimSettings};

use crate::history::InputHistory;
use crate::packet::TransientSnapshot;

/// Everything an extrapolation job needs, captured at launch.
#[derive(Debug, Clone)]
pub struct ExtrapolationInput {
    /// The replicated entities, coordinator space: the snapshot's entities,
    /// the constraint edges connecting them, and the static environment.
    pub entities: Vec<Entity>,
    /// Full component state of those entities, as a creation delta.
    pub delta: Delta,
    /// The snapshot to start from, already in coordinator space.
    pub snapshot: TransientSnapshot,
    /// The snapshot's reconstructed timestamp; simulation starts here.
    pub start_time: f64,
    /// Entities owned by the local client.
    pub owned: Vec<Entity>,
    /// Simulation settings for the replayed steps.
    pub settings: SimSettings,
    /// Wall-clock budget in seconds.
    pub budget: f64,
}

/// Handle to a running extrapolation job.
pub struct ExtrapolationJob {
    finished: AtomicBool,
    result: Mutex<Option<ExtrapolationResult>>,
}

impl ExtrapolationJob {
    /// Launch a job on its own thread.
    #[must_use]
    pub fn spawn(input: ExtrapolationInput, history: InputHistory) -> Arc<Self> {
        let job = Arc::new(Self {
            finished: AtomicBool::new(false),
            result: Mutex::new(None),
        });

        let handle = Arc::clone(&job);
        let spawned = std::thread::Builder::new()
            .name("extrapolation".into())
            .spawn(move || {
                let result = run_extrapolation(&input, &history);
                handle.finish(result);
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn extrapolation thread");
            job.finish(ExtrapolationResult {
                terminated_early: true,
                ..ExtrapolationResult::default()
            });
        }
        job
    }

    fn finish(&self, result: ExtrapolationResult) {
        if let Ok(mut slot) = self.result.lock() {
            *slot = Some(result);
        }
        self.finished.store(true, Ordering::Release);
    }

    /// Whether the job has produced its result.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Take the result once finished.
    #[must_use]
    pub fn take_result(&self) -> Option<ExtrapolationResult> {
        if !self.is_finished() {
            return None;
        }
        self.result.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// The job body: runs to the present or until the budget expires.
#[must_use]
pub fn run_extrapolation(
    input: &ExtrapolationInput,
    history: &InputHistory,
) -> ExtrapolationResult {
    let started = Instant::now();
    let mut settings = input.settings.clone();
    settings.paused = false;
    let dt = settings.fixed_dt;

    let mut sim = IslandSim::new(settings);
    sim.import_delta(&input.delta);

    // Snap to the authoritative snapshot state.
    let pools: Vec<_> = input
        .snapshot
        .pools
        .iter()
        .map(|p| p.pool.clone())
        .collect();
    sim.apply_snapshot_pools(&pools);
    sim.set_island_time(input.start_time);

    let mut time = input.start_time;
    let mut terminated_early = false;

    while time + dt <= now_seconds() {
        // Inputs recorded for this sub-step window.
        for frame in history.range(time, time + dt) {
            for (entity, body_input) in &frame.inputs {
                if let Some(local) = sim.entity_map().local_for(*entity) {
                    if sim.registry().contains(local) {
                        sim.registry_mut().insert(local, *body_input);
                    }
                }
            }
        }

        sim.full_step(dt);
        time += dt;
        sim.set_island_time(time);

        if started.elapsed().as_secs_f64() > input.budget {
            terminated_early = true;
            break;
        }
    }

    // Collect final body states, keyed by coordinator entities.
    let mut result = ExtrapolationResult {
        terminated_early,
        ..ExtrapolationResult::default()
    };
    for &entity in &input.entities {
        let Some(local) = sim.entity_map().local_for(entity) else {
            continue;
        };
        let (Some(position), Some(orientation)) = (
            sim.registry().get::<Position>(local),
            sim.registry().get::<Orientation>(local),
        ) else {
            continue;
        };
        let Some(linvel) = sim.registry().get::<LinVel>(local) else {
            continue;
        };
        let angvel = sim
            .registry()
            .get::<AngVel>(local)
            .copied()
            .unwrap_or_default();

        result.entities.push(entity);
        result.snapshots.push(BodySnapshot {
            position: position.0,
            orientation: orientation.0,
            linvel: linvel.0,
            angvel: angvel.0,
        });
    }
    result
}
