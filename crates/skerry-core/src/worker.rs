//! Island worker: one island simulated as a reschedulable job.
//!
//! The worker owns an [`IslandSim`] behind a mutex that is only ever
//! contended in two places: the job itself, and the coordinator's
//! synchronous `split` call while the worker is parked. All other
//! communication is message passing through the per-worker queues.
//!
//! The step state machine:
//!
//! ```text
//! init → step → begin_step → broadphase → [broadphase_async]
//!      → narrowphase → [narrowphase_async] → solve → finish_step → step
//! ```
//!
//! A worker yields in three places: waiting for the next step to be due,
//! waiting for an asynchronous broad/narrow-phase task, and while parked for
//! a split.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;

use skerry_delta::DeltaBuilder;
use skerry_graph::ConnectedComponent;
use skerry_registry::Registry;
use skerry_types::comp::{
    ComponentId, ContactManifold, Continuous, Dirty, IslandTimestamp, SleepingTag,
};
use skerry_types::{Aabb, Entity, SimSettings};

use crate::body::refresh_derived_state;
use crate::collide::ContactCandidate;
use crate::dispatcher::{Job, JobDispatcher};
use crate::island::{BroadphaseOutcome, IslandSim};
use crate::messages::{CoordToWorker, WorkerToCoord};
use crate::time::now_seconds;

/// Hook run by the worker around its step, for external systems.
pub type StepHook = Arc<dyn Fn(&mut Registry) + Send + Sync>;

/// External hook points of the worker step.
#[derive(Clone, Default)]
pub struct WorkerHooks {
    /// Runs once after the worker initializes.
    pub init: Option<StepHook>,
    /// Runs at the start of every step.
    pub pre_step: Option<StepHook>,
    /// Runs at the end of every step, before sync.
    pub post_step: Option<StepHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Step,
    BeginStep,
    Broadphase,
    BroadphaseAsync,
    Narrowphase,
    NarrowphaseAsync,
    Solve,
    FinishStep,
}

/// What the job wants after an update.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    /// Run again as soon as possible.
    Immediate,
    /// Run again after a delay in seconds.
    After(f64),
    /// Do not self-reschedule; an external signal will.
    Park,
}

type AsyncSlot<T> = Arc<Mutex<Option<T>>>;

struct WorkerState {
    sim: IslandSim,
    phase: Phase,
    /// This island's entity in the coordinator's registry.
    coordinator_island: Entity,
    rx: Receiver<CoordToWorker>,
    tx: Sender<WorkerToCoord>,
    builder: DeltaBuilder,
    hooks: WorkerHooks,
    step_start_time: f64,
    sleep_start: Option<f64>,
    topology_changed: bool,
    split_deadline: Option<f64>,
    pending_pairs: Option<AsyncSlot<Vec<(Entity, Entity)>>>,
    pending_contacts: Option<AsyncSlot<Vec<(Entity, Vec<ContactCandidate>)>>>,
}

/// Shared worker handle: the job, its flags and its queues.
pub struct IslandWorker {
    state: Mutex<WorkerState>,
    splitting: AtomicBool,
    terminating: AtomicBool,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    reschedule_counter: AtomicU32,
    dispatcher: JobDispatcher,
    self_ref: OnceLock<Weak<IslandWorker>>,
}

impl IslandWorker {
    /// Create a worker and schedule its first run.
    pub(crate) fn spawn(
        settings: SimSettings,
        hooks: WorkerHooks,
        coordinator_island: Entity,
        rx: Receiver<CoordToWorker>,
        tx: Sender<WorkerToCoord>,
        dispatcher: JobDispatcher,
    ) -> Arc<Self> {
        let worker = Arc::new(Self {
            state: Mutex::new(WorkerState {
                sim: IslandSim::new(settings),
                phase: Phase::Init,
                coordinator_island,
                rx,
                tx,
                builder: DeltaBuilder::new(),
                hooks,
                step_start_time: 0.0,
                sleep_start: None,
                topology_changed: false,
                split_deadline: None,
                pending_pairs: None,
                pending_contacts: None,
            }),
            splitting: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
            reschedule_counter: AtomicU32::new(0),
            dispatcher,
            self_ref: OnceLock::new(),
        });
        let _ = worker.self_ref.set(Arc::downgrade(&worker));
        worker.request_run();
        worker
    }

    fn job(&self) -> Option<Job> {
        let worker = self.self_ref.get()?.upgrade()?;
        Some(Arc::new(move || worker.run()))
    }

    /// Ask the worker to run as soon as possible. Redundant requests while
    /// one is already queued are suppressed by the counter.
    pub(crate) fn request_run(&self) {
        if self.splitting.load(Ordering::Relaxed) {
            // The coordinator resumes the worker after the split.
            return;
        }
        if self.reschedule_counter.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Some(job) = self.job() {
                self.dispatcher.dispatch(job);
            }
        }
    }

    fn request_run_after(&self, delay_secs: f64) {
        if self.splitting.load(Ordering::Relaxed) {
            return;
        }
        if self.reschedule_counter.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Some(job) = self.job() {
                self.dispatcher.dispatch_after(delay_secs, job);
            }
        }
    }

    /// The job body.
    fn run(&self) {
        if self.terminating.load(Ordering::Acquire) {
            if let Ok(mut terminated) = self.terminated.lock() {
                *terminated = true;
            }
            self.terminated_cv.notify_all();
            return;
        }
        if self.splitting.load(Ordering::Relaxed) {
            // Parked awaiting the coordinator's split call.
            return;
        }

        let outcome = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.update(self)
        };

        let extra = self.reschedule_counter.swap(0, Ordering::AcqRel);
        if extra > 1 {
            // External requests arrived while we ran; serve them promptly.
            self.request_run();
            return;
        }
        match outcome {
            Outcome::Immediate => self.request_run(),
            Outcome::After(delay) => self.request_run_after(delay),
            Outcome::Park => {}
        }
    }

    /// Whether the worker has set its splitting flag.
    pub(crate) fn is_splitting(&self) -> bool {
        self.splitting.load(Ordering::Acquire)
    }

    /// Execute a requested split synchronously. Must only be called while
    /// the worker is parked with its splitting flag set; returns the
    /// connected components in coordinator entity space (empty when the
    /// topology healed and no split happened).
    pub(crate) fn split(&self) -> Vec<ConnectedComponent> {
        debug_assert!(self.is_splitting());
        let components = {
            let Ok(mut state) = self.state.lock() else {
                return Vec::new();
            };
            state.execute_split(self)
        };
        self.splitting.store(false, Ordering::Release);
        self.reschedule_counter.store(0, Ordering::Release);
        self.request_run();
        components
    }

    /// Ask the worker to terminate. It deallocates its state on its next
    /// run and signals the termination condvar.
    pub(crate) fn terminate(&self) {
        self.splitting.store(false, Ordering::Release);
        self.terminating.store(true, Ordering::Release);
        if let Some(job) = self.job() {
            self.dispatcher.dispatch(job);
        }
    }

    /// Wait until the worker observed its termination flag.
    pub(crate) fn join(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.terminated.lock() else {
            return false;
        };
        let (guard, result) = match self
            .terminated_cv
            .wait_timeout_while(guard, timeout, |done| !*done)
        {
            Ok(r) => r,
            Err(_) => return false,
        };
        drop(guard);
        !result.timed_out()
    }
}

impl WorkerState {
    fn update(&mut self, worker: &IslandWorker) -> Outcome {
        match self.phase {
            Phase::Init => {
                self.init();
                self.maybe_outcome()
            }
            Phase::Step => {
                self.process_messages();
                if self.should_step() {
                    self.begin_step();
                    if self.run_broadphase(worker) {
                        if self.run_narrowphase(worker) {
                            self.run_solver();
                            self.finish_step(worker);
                        } else {
                            return Outcome::Park;
                        }
                    } else {
                        return Outcome::Park;
                    }
                }
                self.maybe_outcome()
            }
            Phase::BeginStep => {
                self.begin_step();
                Outcome::Immediate
            }
            Phase::Broadphase => {
                if self.run_broadphase(worker) {
                    Outcome::Immediate
                } else {
                    Outcome::Park
                }
            }
            Phase::BroadphaseAsync => {
                if self.finish_broadphase() {
                    if self.run_narrowphase(worker) {
                        self.run_solver();
                        self.finish_step(worker);
                        self.maybe_outcome()
                    } else {
                        Outcome::Park
                    }
                } else {
                    // Spurious wake; the async task will signal us.
                    self.process_messages();
                    Outcome::Park
                }
            }
            Phase::Narrowphase => {
                if self.run_narrowphase(worker) {
                    self.run_solver();
                    self.finish_step(worker);
                    self.maybe_outcome()
                } else {
                    Outcome::Park
                }
            }
            Phase::NarrowphaseAsync => {
                if self.finish_narrowphase() {
                    self.run_solver();
                    self.finish_step(worker);
                    self.maybe_outcome()
                } else {
                    self.process_messages();
                    Outcome::Park
                }
            }
            Phase::Solve => {
                self.run_solver();
                self.finish_step(worker);
                self.maybe_outcome()
            }
            Phase::FinishStep => {
                self.finish_step(worker);
                self.maybe_outcome()
            }
        }
    }

    fn init(&mut self) {
        // Adopt the coordinator's island entity before anything refers to it,
        // and tell the coordinator which local entity stands for the island.
        self.sim
            .adopt_island_mapping(self.coordinator_island);
        self.builder
            .insert_entity_mapping(self.coordinator_island, self.sim.island_entity());

        // Process everything enqueued before the first run, including the
        // delta carrying the island's initial entities.
        self.process_messages();

        if let Some(hook) = self.hooks.init.clone() {
            hook(self.sim.registry_mut());
        }

        self.sim.set_island_time(now_seconds());
        self.phase = Phase::Step;
    }

    /// Self-reschedule decision for the idle path.
    fn maybe_outcome(&mut self) -> Outcome {
        if self.sim.settings().paused || self.sim.is_sleeping() {
            return Outcome::Park;
        }
        let next_due = self.sim.island_time() + self.sim.settings().fixed_dt;
        let delay = next_due - now_seconds();
        if delay > 0.0 {
            Outcome::After(delay)
        } else {
            Outcome::Immediate
        }
    }

    fn process_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: CoordToWorker) {
        match message {
            CoordToWorker::Delta(delta) => {
                let summary = self.sim.import_delta(&delta);
                self.topology_changed |= summary.topology_changed;
                for (remote, local) in summary.created {
                    if !self.builder.has_mapping_for(remote) {
                        self.builder.insert_entity_mapping(remote, local);
                    }
                }
                self.wake_island();
            }
            CoordToWorker::SetPaused(paused) => {
                let mut settings = self.sim.settings().clone();
                settings.paused = paused;
                self.sim.set_settings(settings);
                self.sim.set_island_time(now_seconds());
            }
            CoordToWorker::StepSimulation => {
                if !self.sim.is_sleeping() && self.phase == Phase::Step {
                    self.step_start_time = now_seconds();
                    self.phase = Phase::BeginStep;
                }
            }
            CoordToWorker::WakeUp => self.wake_island(),
            CoordToWorker::SetSettings(settings) => self.sim.set_settings(settings),
            CoordToWorker::SetCenterOfMass { entity, com } => {
                if let Some(local) = self.sim.entity_map().local_for(entity) {
                    self.sim
                        .registry_mut()
                        .insert(local, skerry_types::comp::CenterOfMass(com));
                    refresh_derived_state(self.sim.registry_mut(), local);
                    self.mark_dirty_updated(
                        local,
                        &[
                            ComponentId::CenterOfMass,
                            ComponentId::Position,
                            ComponentId::Orientation,
                        ],
                    );
                }
                self.wake_island();
            }
            CoordToWorker::ApplySnapshotPools { pools } => {
                let touched = self.sim.apply_snapshot_pools(&pools);
                for entity in touched {
                    self.mark_dirty_updated(
                        entity,
                        &[
                            ComponentId::Position,
                            ComponentId::Orientation,
                            ComponentId::LinVel,
                            ComponentId::AngVel,
                            ComponentId::Discontinuity,
                        ],
                    );
                }
                self.wake_island();
            }
            CoordToWorker::ApplyExtrapolationResult(result) => {
                let touched = self.sim.apply_extrapolation_result(&result);
                for entity in touched {
                    self.mark_dirty_updated(
                        entity,
                        &[
                            ComponentId::Position,
                            ComponentId::Orientation,
                            ComponentId::LinVel,
                            ComponentId::AngVel,
                            ComponentId::Discontinuity,
                        ],
                    );
                }
                self.wake_island();
            }
        }
    }

    fn mark_dirty_updated(&mut self, entity: Entity, ids: &[ComponentId]) {
        let dirty = self.sim.registry_mut().get_or_insert_default::<Dirty>(entity);
        for id in ids {
            dirty.mark_updated(*id);
        }
    }

    fn wake_island(&mut self) {
        if !self.sim.is_sleeping() {
            return;
        }
        let now = now_seconds();
        let woken = self.sim.wake_up(now);
        for entity in woken {
            self.builder.destroyed_component::<SleepingTag>(entity);
        }
        self.builder
            .updated(self.sim.island_entity(), IslandTimestamp { value: now });
        self.sleep_start = None;
        self.send_sync_delta();
    }

    fn should_step(&mut self) -> bool {
        let now = now_seconds();
        // A manual step request bypasses the pause and timing gates.
        if self.phase == Phase::BeginStep {
            self.step_start_time = now;
            return true;
        }
        if self.sim.settings().paused || self.sim.is_sleeping() {
            return false;
        }
        if now - self.sim.island_time() < self.sim.settings().fixed_dt {
            return false;
        }
        self.step_start_time = now;
        self.phase = Phase::BeginStep;
        true
    }

    fn begin_step(&mut self) {
        if let Some(hook) = self.hooks.pre_step.clone() {
            hook(self.sim.registry_mut());
        }
        self.sim.begin_step();
        self.phase = Phase::Broadphase;
    }

    /// Returns false when the broad phase went asynchronous.
    fn run_broadphase(&mut self, worker: &IslandWorker) -> bool {
        if self.sim.broadphase_parallelizable() {
            let entries = self.sim.sweep_entries();
            let margin = self.sim.settings().contact_aabb_margin;
            let slot: AsyncSlot<Vec<(Entity, Entity)>> = Arc::new(Mutex::new(None));
            self.pending_pairs = Some(Arc::clone(&slot));
            self.phase = Phase::BroadphaseAsync;

            if let Some(me) = worker.self_ref.get().and_then(Weak::upgrade) {
                worker.dispatcher.dispatch(Arc::new(move || {
                    let pairs = crate::broadphase::sweep_pairs(&entries, margin);
                    if let Ok(mut result) = slot.lock() {
                        *result = Some(pairs);
                    }
                    me.request_run();
                }));
            }
            return false;
        }

        let candidates = self.sim.candidate_pairs();
        let outcome = self.sim.apply_broadphase(&candidates);
        self.record_broadphase(&outcome);
        self.phase = Phase::Narrowphase;
        true
    }

    fn finish_broadphase(&mut self) -> bool {
        let Some(slot) = &self.pending_pairs else {
            return false;
        };
        let Some(pairs) = slot.lock().ok().and_then(|mut s| s.take()) else {
            return false;
        };
        self.pending_pairs = None;
        let outcome = self.sim.apply_broadphase(&pairs);
        self.record_broadphase(&outcome);
        self.phase = Phase::Narrowphase;
        true
    }

    fn record_broadphase(&mut self, outcome: &BroadphaseOutcome) {
        for entity in &outcome.created {
            self.builder.created(*entity);
            self.builder.created_all(self.sim.registry(), *entity);
        }
        for entity in &outcome.destroyed {
            self.builder.destroyed(*entity);
        }
        self.topology_changed |= outcome.changed_topology();
    }

    /// Returns false when the narrow phase went asynchronous.
    fn run_narrowphase(&mut self, worker: &IslandWorker) -> bool {
        // Contact points created this step must reach the outbound delta
        // before any separating points are destroyed below.
        self.sync_dirty();

        if self.sim.narrowphase_parallelizable() {
            let manifolds: Vec<(Entity, [Entity; 2])> = self
                .sim
                .registry()
                .iter::<ContactManifold>()
                .map(|(e, m)| (e, m.body))
                .collect();
            let inputs = contact_inputs(self.sim.registry(), &manifolds);
            let slot: AsyncSlot<Vec<(Entity, Vec<ContactCandidate>)>> =
                Arc::new(Mutex::new(None));
            self.pending_contacts = Some(Arc::clone(&slot));
            self.phase = Phase::NarrowphaseAsync;

            if let Some(me) = worker.self_ref.get().and_then(Weak::upgrade) {
                worker.dispatcher.dispatch(Arc::new(move || {
                    let results = inputs
                        .par_iter()
                        .map(|(edge, a, b)| (*edge, crate::collide::collide(&a.as_input(), &b.as_input())))
                        .collect();
                    if let Ok(mut result) = slot.lock() {
                        *result = Some(results);
                    }
                    me.request_run();
                }));
            }
            return false;
        }

        self.sim.run_narrowphase();
        self.phase = Phase::Solve;
        true
    }

    fn finish_narrowphase(&mut self) -> bool {
        let Some(slot) = &self.pending_contacts else {
            return false;
        };
        let Some(results) = slot.lock().ok().and_then(|mut s| s.take()) else {
            return false;
        };
        self.pending_contacts = None;
        self.sync_dirty();
        self.sim.apply_contacts(results);
        self.phase = Phase::Solve;
        true
    }

    fn run_solver(&mut self) {
        let dt = self.sim.settings().fixed_dt;
        self.sim.run_solver(dt);
        self.phase = Phase::FinishStep;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn finish_step(&mut self, worker: &IslandWorker) {
        let settings = self.sim.settings().clone();
        let fixed_dt = settings.fixed_dt;
        let island_time = self.sim.island_time();
        let dt = self.step_start_time - island_time;

        // Clamp the island time forward when the worker has fallen too far
        // behind the clock.
        let num_steps = (dt / fixed_dt).floor() as i64;
        let max_lag = i64::from(settings.max_lagging_steps);
        if num_steps > max_lag {
            let remainder = dt - num_steps as f64 * fixed_dt;
            self.sim
                .set_island_time(self.step_start_time - (remainder + max_lag as f64 * fixed_dt));
        } else {
            self.sim.set_island_time(island_time + fixed_dt);
        }
        self.builder.updated(
            self.sim.island_entity(),
            IslandTimestamp {
                value: self.sim.island_time(),
            },
        );

        let tree_view = self.sim.tree_view();
        let island_entity = self.sim.island_entity();
        self.sim
            .registry_mut()
            .insert(island_entity, tree_view.clone());
        self.builder.updated(island_entity, tree_view);

        self.maybe_go_to_sleep();

        if let Some(hook) = self.hooks.post_step.clone() {
            hook(self.sim.registry_mut());
        }

        let dangling = self.sim.clear_dangling_nodes();
        self.topology_changed |= !dangling.is_empty();

        self.sync();
        self.phase = Phase::Step;

        // A split cannot happen unilaterally: a merge may be in flight in
        // the coordinator. Park with the flag raised and let the
        // coordinator drive the split.
        if self.should_split() {
            worker.splitting.store(true, Ordering::Release);
            let _ = self.tx.send(WorkerToCoord::SplitRequest);
        }
    }

    fn maybe_go_to_sleep(&mut self) {
        if self.sim.is_sleeping() {
            return;
        }
        if self.sim.could_sleep() {
            let island_time = self.sim.island_time();
            match self.sleep_start {
                None => self.sleep_start = Some(island_time),
                Some(start) => {
                    if island_time - start > self.sim.settings().island_time_to_sleep {
                        let slept = self.sim.go_to_sleep();
                        for entity in slept {
                            self.builder.created_component(entity, SleepingTag);
                            self.builder
                                .updated_by_id(self.sim.registry(), entity, ComponentId::LinVel);
                            self.builder
                                .updated_by_id(self.sim.registry(), entity, ComponentId::AngVel);
                        }
                        self.sleep_start = None;
                    }
                }
            }
        } else {
            self.sleep_start = None;
        }
    }

    fn should_split(&mut self) -> bool {
        if !self.topology_changed {
            return false;
        }
        let now = now_seconds();
        match self.split_deadline {
            None => {
                self.split_deadline = Some(now + self.sim.settings().split_debounce);
                false
            }
            Some(deadline) => {
                if now < deadline {
                    return false;
                }
                self.split_deadline = None;
                self.topology_changed = false;
                !self.sim.graph().is_single_connected_component()
            }
        }
    }

    /// Emit everything that changed this step.
    fn sync(&mut self) {
        // AABBs always, for the coordinator's broad phase.
        let aabbs: Vec<(Entity, Aabb)> = self
            .sim
            .registry()
            .iter::<Aabb>()
            .map(|(e, a)| (e, *a))
            .collect();
        for (entity, aabb) in aabbs {
            self.builder.updated(entity, aabb);
        }

        // Manifolds always, for island re-partitioning.
        let manifolds: Vec<(Entity, ContactManifold)> = self
            .sim
            .registry()
            .iter::<ContactManifold>()
            .map(|(e, m)| (e, m.clone()))
            .collect();
        for (entity, manifold) in manifolds {
            self.builder.updated(entity, manifold);
        }

        // Continuous components.
        let continuous: Vec<(Entity, Vec<ComponentId>)> = self
            .sim
            .registry()
            .iter::<Continuous>()
            .map(|(e, c)| (e, c.iter().collect()))
            .collect();
        for (entity, ids) in continuous {
            for id in ids {
                self.builder.updated_by_id(self.sim.registry(), entity, id);
            }
        }

        self.sync_dirty();
        self.send_sync_delta();
    }

    /// Move dirty records into the delta builder.
    fn sync_dirty(&mut self) {
        let dirty: Vec<(Entity, Dirty)> = self
            .sim
            .registry()
            .iter::<Dirty>()
            .map(|(e, d)| (e, d.clone()))
            .collect();
        for (entity, dirty) in dirty {
            if dirty.is_new_entity {
                self.builder.created(entity);
            }
            for id in &dirty.created {
                self.builder.created_by_id(self.sim.registry(), entity, *id);
            }
            for id in &dirty.updated {
                self.builder.updated_by_id(self.sim.registry(), entity, *id);
            }
            for id in &dirty.destroyed {
                self.builder.destroyed_by_id(entity, *id);
            }
        }
        self.sim.registry_mut().clear::<Dirty>();
    }

    fn send_sync_delta(&mut self) {
        if self.builder.is_empty() {
            return;
        }
        let delta = self.builder.finish();
        if self.tx.send(WorkerToCoord::Delta(delta)).is_err() {
            tracing::warn!("coordinator queue closed; dropping island delta");
        }
    }

    /// The split body, run on the coordinator's thread while parked.
    fn execute_split(&mut self, worker: &IslandWorker) -> Vec<ConnectedComponent> {
        let _ = worker;
        // Pending messages may include a merge that heals the topology.
        self.process_messages();

        let components = self.sim.graph().connected_components();
        if components.len() <= 1 {
            return Vec::new();
        }

        let mut components = components;
        components.sort_by(|l, r| r.len().cmp(&l.len()));

        // Non-procedural entities staying with the resident component must
        // not be removed even when they also appear in departing ones.
        let resident_nodes: Vec<Entity> = components[0].nodes.clone();

        for component in components.iter().skip(1) {
            for entity in &component.nodes {
                if resident_nodes.contains(entity) || !self.sim.registry().contains(*entity) {
                    continue;
                }
                // Ship final state so nothing is lost when the new island
                // worker takes over.
                self.builder.updated_all(self.sim.registry(), *entity);
                self.sim.destroy_entity(*entity);
            }
        }

        let tree_view = self.sim.tree_view();
        let island_entity = self.sim.island_entity();
        self.sim
            .registry_mut()
            .insert(island_entity, tree_view.clone());
        self.builder.updated(island_entity, tree_view);
        self.send_sync_delta();

        // Translate into coordinator space; worker-local entities that were
        // never acknowledged have no mapping and are skipped.
        let map = self.sim.entity_map();
        components
            .into_iter()
            .map(|component| ConnectedComponent {
                nodes: component
                    .nodes
                    .iter()
                    .filter_map(|e| map.remote_for(*e))
                    .collect(),
                edges: component
                    .edges
                    .iter()
                    .filter_map(|e| map.remote_for(*e))
                    .collect(),
            })
            .collect()
    }
}

struct ContactBodyInput {
    shape: skerry_types::comp::Shape,
    position: nalgebra::Point3<f64>,
    orientation: nalgebra::UnitQuaternion<f64>,
    cache: Option<skerry_types::comp::RotatedMeshCache>,
}

impl ContactBodyInput {
    fn as_input(&self) -> crate::collide::CollideInput<'_> {
        crate::collide::CollideInput {
            shape: &self.shape,
            position: self.position,
            orientation: self.orientation,
            cache: self.cache.as_ref(),
        }
    }
}

fn contact_inputs(
    registry: &Registry,
    manifolds: &[(Entity, [Entity; 2])],
) -> Vec<(Entity, ContactBodyInput, ContactBodyInput)> {
    let body_input = |entity: Entity| -> Option<ContactBodyInput> {
        let shape = registry.get::<skerry_types::comp::Shape>(entity)?.clone();
        let orientation = registry.get::<skerry_types::comp::Orientation>(entity)?.0;
        let position = registry
            .get::<skerry_types::comp::Origin>(entity)
            .map(|o| o.0)
            .or_else(|| registry.get::<skerry_types::comp::Position>(entity).map(|p| p.0))?;
        Some(ContactBodyInput {
            shape,
            position,
            orientation,
            cache: registry
                .get::<skerry_types::comp::RotatedMeshCache>(entity)
                .cloned(),
        })
    };

    manifolds
        .iter()
        .filter_map(|(edge, body)| {
            Some((*edge, body_input(body[0])?, body_input(body[1])?))
        })
        .collect()
}
