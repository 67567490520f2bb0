//! Island coordinator.
//!
//! Owns the authoritative registry and the entity graph, assigns entities to
//! islands, merges islands when edges bridge them, executes worker-requested
//! splits, and exchanges deltas with every worker once per [`update`] tick.
//! All methods must be called from one thread; workers only ever see the
//! coordinator through their queues.
//!
//! [`update`]: IslandCoordinator::update

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use nalgebra::Vector3;
use smallvec::SmallVec;

use skerry_delta::{Delta, DeltaBuilder};
use skerry_graph::{ConnectedComponent, EntityGraph};
use skerry_registry::{EntityMap, Registry};
use skerry_types::comp::{
    Component, ComponentId, ComponentPool, Constraint, ContactManifold, Dirty, GraphEdge,
    GraphNode, Island, IslandResident, IslandTimestamp, MultiIslandResident, NetworkedTag,
    ProceduralTag, TreeView,
};
use skerry_types::{Aabb, Entity, SimError, SimSettings};

use crate::body::{refresh_derived_state, RigidBodyDesc};
use crate::broadphase::{pair_key, sweep_pairs, SweepEntry};
use crate::dispatcher::JobDispatcher;
use crate::messages::{CoordToWorker, ExtrapolationResult, WorkerToCoord};
use crate::time::now_seconds;
use crate::worker::{IslandWorker, WorkerHooks};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct IslandHandle {
    worker: Arc<IslandWorker>,
    tx: Sender<CoordToWorker>,
    rx: Receiver<WorkerToCoord>,
    /// Worker-space → main-space.
    map: EntityMap,
    builder: DeltaBuilder,
    /// Whether anything was posted this tick and the worker needs a poke.
    signal: bool,
}

/// The main-thread service owning the world registry and the entity graph.
pub struct IslandCoordinator {
    registry: Registry,
    graph: EntityGraph,
    settings: SimSettings,
    dispatcher: JobDispatcher,
    hooks: WorkerHooks,
    islands: HashMap<Entity, IslandHandle>,
    /// Island entities in creation order, the deterministic tick order.
    island_order: Vec<Entity>,
    /// Cross-island contact pairs created by the coordinator plus every pair
    /// mirrored from workers.
    pairs: HashMap<(Entity, Entity), Entity>,
    /// Workers terminated by merges, joined at shutdown.
    defunct: Vec<Arc<IslandWorker>>,
    networked_created: Vec<Entity>,
    networked_destroyed: Vec<Entity>,
    importing: bool,
}

impl IslandCoordinator {
    /// Create a coordinator with a worker thread pool of the given size.
    pub fn new(settings: SimSettings, num_threads: usize) -> skerry_types::Result<Self> {
        settings.validate()?;
        Ok(Self {
            registry: Registry::new(),
            graph: EntityGraph::new(),
            settings,
            dispatcher: JobDispatcher::new(num_threads),
            hooks: WorkerHooks::default(),
            islands: HashMap::new(),
            island_order: Vec::new(),
            pairs: HashMap::new(),
            defunct: Vec::new(),
            networked_created: Vec::new(),
            networked_destroyed: Vec::new(),
            importing: false,
        })
    }

    /// Install external step hooks for every worker spawned from now on.
    pub fn set_hooks(&mut self, hooks: WorkerHooks) {
        self.hooks = hooks;
    }

    /// The authoritative registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The authoritative registry, mutable. Mutations made here are not
    /// propagated to workers unless marked with [`refresh`].
    ///
    /// [`refresh`]: IslandCoordinator::refresh
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// The entity graph.
    #[must_use]
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    /// Replace the settings everywhere, including on every worker.
    pub fn set_settings(&mut self, settings: SimSettings) -> skerry_types::Result<()> {
        settings.validate()?;
        self.settings = settings.clone();
        for island in &self.island_order.clone() {
            self.post(*island, CoordToWorker::SetSettings(settings.clone()));
        }
        Ok(())
    }

    /// Pause or resume stepping.
    pub fn set_paused(&mut self, paused: bool) {
        self.settings.paused = paused;
        for island in &self.island_order.clone() {
            self.post(*island, CoordToWorker::SetPaused(paused));
        }
    }

    /// Run one fixed step on every island while paused.
    pub fn step_simulation(&mut self) {
        for island in &self.island_order.clone() {
            self.post(*island, CoordToWorker::StepSimulation);
        }
    }

    /// Island entities, in creation order.
    #[must_use]
    pub fn island_entities(&self) -> Vec<Entity> {
        self.island_order.clone()
    }

    /// Every entity whose AABB overlaps `region`, in registry order.
    #[must_use]
    pub fn query_region(&self, region: &Aabb) -> Vec<Entity> {
        self.registry
            .iter::<Aabb>()
            .filter(|(_, aabb)| aabb.overlaps(region))
            .map(|(entity, _)| entity)
            .collect()
    }

    // ------------------------------------------------------------------
    // World mutation
    // ------------------------------------------------------------------

    /// Create a rigid body. Procedural bodies are assigned to a fresh island
    /// with its own worker; non-procedural bodies join islands lazily when
    /// edges appear.
    pub fn make_body(&mut self, desc: &RigidBodyDesc) -> Entity {
        let entity = self.registry.create();
        desc.insert_components(&mut self.registry, entity);

        let procedural = self.registry.has::<ProceduralTag>(entity);
        let index = self.graph.insert_node(entity, !procedural);
        self.registry.insert(entity, GraphNode { index });

        if self.registry.has::<NetworkedTag>(entity) && !self.importing {
            self.networked_created.push(entity);
        }

        if procedural {
            self.create_island(vec![entity], Vec::new());
        }
        entity
    }

    /// Create a constraint edge between two existing bodies, merging their
    /// islands when it bridges them.
    pub fn make_constraint(&mut self, constraint: Constraint) -> skerry_types::Result<Entity> {
        let [a, b] = constraint.bodies();
        let node_a = self
            .registry
            .get::<GraphNode>(a)
            .ok_or(SimError::MissingGraphNode(a))?
            .index;
        let node_b = self
            .registry
            .get::<GraphNode>(b)
            .ok_or(SimError::MissingGraphNode(b))?
            .index;

        let entity = self.registry.create();
        self.registry.insert(entity, constraint);
        let index = match self.graph.insert_edge(entity, node_a, node_b) {
            Ok(index) => index,
            Err(_) => {
                self.registry.destroy(entity);
                return Err(SimError::MissingGraphNode(a));
            }
        };
        self.registry.insert(entity, GraphEdge { index });

        if self.registry.has::<NetworkedTag>(a) && self.registry.has::<NetworkedTag>(b) {
            self.registry.insert(entity, NetworkedTag);
            if !self.importing {
                self.networked_created.push(entity);
            }
        }

        self.assign_edge_to_island(entity, a, b);
        Ok(entity)
    }

    /// Destroy an entity with full cascade and notify the affected workers.
    pub fn destroy_entity(&mut self, entity: Entity) {
        if !self.registry.contains(entity) {
            return;
        }

        if self.registry.has::<GraphNode>(entity) {
            // Destroying a body removes its node, which removes incident
            // edges, which destroys their entities first.
            let index = match self.registry.get::<GraphNode>(entity) {
                Some(node) => node.index,
                None => return,
            };
            let mut incident = Vec::new();
            self.graph.visit_edges(index, |edge| incident.push(edge));
            for edge_index in incident {
                if let Some(edge_entity) = self.graph.edge_entity(edge_index) {
                    self.destroy_entity(edge_entity);
                }
            }
            self.graph.remove_node(index);
        } else if let Some(edge) = self.registry.get::<GraphEdge>(entity).copied() {
            if self.graph.edge_entity(edge.index) == Some(entity) {
                self.graph.remove_edge(edge.index);
            }
            if let Some(manifold) = self.registry.get::<ContactManifold>(entity) {
                self.pairs
                    .remove(&pair_key(manifold.body[0], manifold.body[1]));
            }
        }

        // Pull the entity out of every island it resides in.
        for island in self.islands_of(entity) {
            self.remove_from_island(island, entity, true);
        }

        if self.registry.has::<NetworkedTag>(entity) && !self.importing {
            self.networked_destroyed.push(entity);
        }
        self.registry.destroy(entity);
    }

    /// Re-center a body's mass, propagating to its islands.
    pub fn set_com(&mut self, entity: Entity, com: Vector3<f64>) {
        if !self.registry.contains(entity) {
            return;
        }
        self.registry
            .insert(entity, skerry_types::comp::CenterOfMass(com));
        refresh_derived_state(&mut self.registry, entity);
        for island in self.islands_of(entity) {
            self.post(island, CoordToWorker::SetCenterOfMass { entity, com });
        }
    }

    /// Mark one component of an entity as externally mutated; the next
    /// update ships it to the entity's workers.
    pub fn refresh<C: Component>(&mut self, entity: Entity)
    where
        Registry: skerry_registry::ColumnStore<C>,
    {
        self.refresh_by_id(entity, C::ID);
    }

    /// Untyped [`refresh`](IslandCoordinator::refresh).
    pub fn refresh_by_id(&mut self, entity: Entity, id: ComponentId) {
        if !self.registry.contains(entity) {
            return;
        }
        if matches!(id, ComponentId::Position | ComponentId::Orientation) {
            refresh_derived_state(&mut self.registry, entity);
        }
        self.registry
            .get_or_insert_default::<Dirty>(entity)
            .mark_updated(id);
    }

    /// Wake a sleeping island.
    pub fn wake_up_island(&mut self, island: Entity) {
        self.post(island, CoordToWorker::WakeUp);
    }

    /// Forward snapshot pools to an island for a state snap.
    pub fn send_snapshot_to_island(&mut self, island: Entity, pools: Vec<ComponentPool>) {
        self.post(island, CoordToWorker::ApplySnapshotPools { pools });
    }

    /// Forward a finished extrapolation to an island.
    pub fn send_extrapolation_result(&mut self, island: Entity, result: ExtrapolationResult) {
        self.post(island, CoordToWorker::ApplyExtrapolationResult(result));
    }

    /// Islands an entity currently resides in.
    #[must_use]
    pub fn islands_of(&self, entity: Entity) -> SmallVec<[Entity; 4]> {
        let mut islands = SmallVec::new();
        if let Some(resident) = self.registry.get::<IslandResident>(entity) {
            islands.push(resident.island);
        } else if let Some(resident) = self.registry.get::<MultiIslandResident>(entity) {
            islands.extend(resident.islands.iter().copied());
        }
        islands
    }

    // ------------------------------------------------------------------
    // Network import support
    // ------------------------------------------------------------------

    /// Enter import mode: entities created or destroyed until
    /// [`end_import`](IslandCoordinator::end_import) are not reported as
    /// local changes.
    pub fn begin_import(&mut self) {
        self.importing = true;
    }

    /// Leave import mode.
    pub fn end_import(&mut self) {
        self.importing = false;
    }

    /// Entities created and destroyed locally (outside imports) since the
    /// last drain, for the replication layer.
    pub fn drain_networked_events(&mut self) -> (Vec<Entity>, Vec<Entity>) {
        (
            std::mem::take(&mut self.networked_created),
            std::mem::take(&mut self.networked_destroyed),
        )
    }

    /// Attach entities that were imported from the network: create graph
    /// nodes and edges, derived state, residency and workers for them.
    /// `entities` are in local (coordinator) space with components already
    /// imported.
    pub fn finalize_imported_entities(&mut self, entities: &[Entity]) {
        // Bodies first so edges can resolve their endpoints.
        let mut procedural_batch = Vec::new();
        for &entity in entities {
            if !self.registry.contains(entity) || self.registry.has::<GraphNode>(entity) {
                continue;
            }
            let is_body = self.registry.contains_by_id(entity, ComponentId::DynamicTag)
                || self.registry.contains_by_id(entity, ComponentId::StaticTag)
                || self.registry.contains_by_id(entity, ComponentId::KinematicTag)
                || self.registry.contains_by_id(entity, ComponentId::ExternalTag);
            if !is_body {
                continue;
            }
            let procedural = self.registry.has::<ProceduralTag>(entity);
            let index = self.graph.insert_node(entity, !procedural);
            self.registry.insert(entity, GraphNode { index });
            refresh_derived_state(&mut self.registry, entity);
            if procedural {
                procedural_batch.push(entity);
            }
        }
        for entity in procedural_batch {
            self.create_island(vec![entity], Vec::new());
        }

        for &entity in entities {
            if !self.registry.contains(entity) || self.registry.has::<GraphEdge>(entity) {
                continue;
            }
            let bodies = self
                .registry
                .get::<Constraint>(entity)
                .map(Constraint::bodies)
                .or_else(|| self.registry.get::<ContactManifold>(entity).map(|m| m.body));
            let Some([a, b]) = bodies else {
                continue;
            };
            let (Some(node_a), Some(node_b)) = (
                self.registry.get::<GraphNode>(a).map(|n| n.index),
                self.registry.get::<GraphNode>(b).map(|n| n.index),
            ) else {
                tracing::warn!(entity = %entity, "imported edge references unknown bodies");
                continue;
            };
            match self.graph.insert_edge(entity, node_a, node_b) {
                Ok(index) => {
                    self.registry.insert(entity, GraphEdge { index });
                    if self.registry.has::<ContactManifold>(entity) {
                        self.pairs.insert(pair_key(a, b), entity);
                    }
                    self.assign_edge_to_island(entity, a, b);
                }
                Err(err) => {
                    tracing::warn!(entity = %entity, error = %err, "dropping imported edge");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // The tick
    // ------------------------------------------------------------------

    /// One coordinator tick: drain worker output, execute requested splits,
    /// pair bodies across islands, flush external mutations to workers.
    pub fn update(&mut self) {
        let mut split_requests = Vec::new();

        for island in self.island_order.clone() {
            loop {
                let message = match self.islands.get(&island) {
                    Some(handle) => handle.rx.try_recv().ok(),
                    None => None,
                };
                match message {
                    Some(WorkerToCoord::Delta(delta)) => {
                        self.import_worker_delta(island, &delta);
                    }
                    Some(WorkerToCoord::SplitRequest) => split_requests.push(island),
                    None => break,
                }
            }
        }

        for island in split_requests {
            self.execute_split(island);
        }

        self.run_broadphase();
        self.flush_dirty();
        self.cleanup_empty_islands();
        self.flush_builders();
    }

    /// Shut everything down, joining every worker.
    pub fn shutdown(mut self) -> skerry_types::Result<()> {
        let mut failed = None;

        let handles: Vec<(Entity, IslandHandle)> = self
            .island_order
            .drain(..)
            .filter_map(|island| self.islands.remove(&island).map(|h| (island, h)))
            .collect();
        for (island, handle) in &handles {
            handle.worker.terminate();
            if !handle.worker.join(JOIN_TIMEOUT) {
                failed = Some(*island);
            }
        }
        for worker in self.defunct.drain(..) {
            worker.terminate();
            let _ = worker.join(JOIN_TIMEOUT);
        }
        self.dispatcher.shutdown();

        match failed {
            Some(island) => Err(SimError::WorkerJoinTimeout {
                island,
                timeout_secs: JOIN_TIMEOUT.as_secs_f64(),
            }),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn post(&mut self, island: Entity, message: CoordToWorker) {
        if let Some(handle) = self.islands.get_mut(&island) {
            if handle.tx.send(message).is_err() {
                tracing::warn!(island = %island, "worker queue closed");
            }
            handle.signal = true;
        }
    }

    /// Create an island entity plus its worker and ship the members to it.
    fn create_island(&mut self, nodes: Vec<Entity>, edges: Vec<Entity>) -> Entity {
        let island = self.registry.create();
        self.registry.insert(
            island,
            Island {
                nodes: nodes.clone(),
                edges: edges.clone(),
            },
        );
        self.registry.insert(
            island,
            IslandTimestamp {
                value: now_seconds(),
            },
        );
        self.registry
            .insert(island, skerry_types::comp::EntityOwner::none());
        self.registry.insert(island, TreeView::default());

        let (to_worker, worker_rx) = unbounded();
        let (worker_tx, from_worker) = unbounded();
        let worker = IslandWorker::spawn(
            self.settings.clone(),
            self.hooks.clone(),
            island,
            worker_rx,
            worker_tx,
            self.dispatcher.clone(),
        );

        let mut handle = IslandHandle {
            worker,
            tx: to_worker,
            rx: from_worker,
            map: EntityMap::new(),
            builder: DeltaBuilder::new(),
            signal: true,
        };

        for &entity in &nodes {
            self.set_residency(entity, island, true);
            handle.builder.created(entity);
            handle.builder.created_all(&self.registry, entity);
        }
        for &entity in &edges {
            self.registry.insert(entity, IslandResident { island });
            handle.builder.created(entity);
            handle.builder.created_all(&self.registry, entity);
        }

        self.islands.insert(island, handle);
        self.island_order.push(island);
        island
    }

    fn set_residency(&mut self, entity: Entity, island: Entity, add: bool) {
        if !self.registry.contains(entity) {
            return;
        }
        if self.registry.has::<ProceduralTag>(entity) {
            if add {
                self.registry.insert(entity, IslandResident { island });
            } else if self
                .registry
                .get::<IslandResident>(entity)
                .is_some_and(|r| r.island == island)
            {
                self.registry.remove::<IslandResident>(entity);
            }
        } else {
            let resident = self
                .registry
                .get_or_insert_default::<MultiIslandResident>(entity);
            if add {
                resident.insert(island);
            } else {
                resident.remove(island);
            }
        }
    }

    /// Ship an entity into an island it was not resident in.
    fn ship_to_island(&mut self, island: Entity, entity: Entity) {
        self.set_residency(entity, island, true);
        if let Some(handle) = self.islands.get_mut(&island) {
            handle.builder.created(entity);
            handle.builder.created_all(&self.registry, entity);
            handle.signal = true;
        }
    }

    fn remove_from_island(&mut self, island: Entity, entity: Entity, ship_destroy: bool) {
        self.set_residency(entity, island, false);
        if let Some(island_comp) = self.registry.get_mut::<Island>(island) {
            island_comp.nodes.retain(|e| *e != entity);
            island_comp.edges.retain(|e| *e != entity);
        }
        if ship_destroy {
            if let Some(handle) = self.islands.get_mut(&island) {
                handle.builder.destroyed(entity);
                handle.signal = true;
            }
        }
    }

    /// Put an edge (constraint or manifold) into the right island, merging
    /// islands or absorbing non-procedural bodies as needed.
    fn assign_edge_to_island(&mut self, edge: Entity, a: Entity, b: Entity) {
        let island_a = self
            .registry
            .get::<IslandResident>(a)
            .map(|r| r.island)
            .filter(|_| self.registry.has::<ProceduralTag>(a));
        let island_b = self
            .registry
            .get::<IslandResident>(b)
            .map(|r| r.island)
            .filter(|_| self.registry.has::<ProceduralTag>(b));

        let target = match (island_a, island_b) {
            (Some(ia), Some(ib)) if ia == ib => ia,
            (Some(ia), Some(ib)) => self.merge_islands(ia, ib),
            (Some(ia), None) => {
                // Pull the non-procedural body into the procedural side.
                if !self.island_contains(ia, b) {
                    self.ship_to_island(ia, b);
                    if let Some(island_comp) = self.registry.get_mut::<Island>(ia) {
                        if !island_comp.nodes.contains(&b) {
                            island_comp.nodes.push(b);
                        }
                    }
                }
                ia
            }
            (None, Some(ib)) => {
                if !self.island_contains(ib, a) {
                    self.ship_to_island(ib, a);
                    if let Some(island_comp) = self.registry.get_mut::<Island>(ib) {
                        if !island_comp.nodes.contains(&a) {
                            island_comp.nodes.push(a);
                        }
                    }
                }
                ib
            }
            (None, None) => {
                // Two non-procedural bodies never simulate; the edge stays
                // coordinator-only.
                return;
            }
        };

        self.registry.insert(edge, IslandResident { island: target });
        if let Some(island_comp) = self.registry.get_mut::<Island>(target) {
            if !island_comp.edges.contains(&edge) {
                island_comp.edges.push(edge);
            }
        }
        if let Some(handle) = self.islands.get_mut(&target) {
            handle.builder.created(edge);
            handle.builder.created_all(&self.registry, edge);
            handle.signal = true;
        }
    }

    fn island_contains(&self, island: Entity, entity: Entity) -> bool {
        self.registry
            .get::<Island>(island)
            .is_some_and(|i| i.nodes.contains(&entity) || i.edges.contains(&entity))
    }

    /// Merge two islands: the smaller one is drained into the bigger one and
    /// its worker is terminated. Returns the surviving island.
    fn merge_islands(&mut self, island_a: Entity, island_b: Entity) -> Entity {
        let size = |island: Entity| {
            self.registry
                .get::<Island>(island)
                .map_or(0, |i| i.nodes.len() + i.edges.len())
        };
        let (surviving, absorbed) = if size(island_a) >= size(island_b) {
            (island_a, island_b)
        } else {
            (island_b, island_a)
        };
        tracing::debug!(surviving = %surviving, absorbed = %absorbed, "merging islands");

        // Drain pending output of the dying worker so nothing is lost.
        loop {
            let message = match self.islands.get(&absorbed) {
                Some(handle) => handle.rx.try_recv().ok(),
                None => None,
            };
            match message {
                Some(WorkerToCoord::Delta(delta)) => self.import_worker_delta(absorbed, &delta),
                Some(WorkerToCoord::SplitRequest) | None => break,
            }
        }

        let absorbed_comp = self
            .registry
            .get::<Island>(absorbed)
            .cloned()
            .unwrap_or_default();

        for entity in &absorbed_comp.nodes {
            self.set_residency(*entity, absorbed, false);
            if !self.island_contains(surviving, *entity) {
                self.ship_to_island(surviving, *entity);
                if let Some(island_comp) = self.registry.get_mut::<Island>(surviving) {
                    island_comp.nodes.push(*entity);
                }
            }
        }
        for entity in &absorbed_comp.edges {
            self.set_residency(*entity, absorbed, false);
            self.registry
                .insert(*entity, IslandResident { island: surviving });
            if let Some(handle) = self.islands.get_mut(&surviving) {
                handle.builder.created(*entity);
                handle.builder.created_all(&self.registry, *entity);
                handle.signal = true;
            }
            if let Some(island_comp) = self.registry.get_mut::<Island>(surviving) {
                if !island_comp.edges.contains(entity) {
                    island_comp.edges.push(*entity);
                }
            }
        }

        self.teardown_island(absorbed);
        self.wake_up_island(surviving);
        surviving
    }

    fn teardown_island(&mut self, island: Entity) {
        if let Some(handle) = self.islands.remove(&island) {
            handle.worker.terminate();
            self.defunct.push(handle.worker);
        }
        self.island_order.retain(|e| *e != island);
        self.registry.destroy(island);
    }

    /// Execute a worker-requested split.
    fn execute_split(&mut self, island: Entity) {
        let Some(worker) = self.islands.get(&island).map(|h| Arc::clone(&h.worker)) else {
            return;
        };
        if !worker.is_splitting() {
            return;
        }

        let components = worker.split();

        // The split emitted a final delta with the departing entities' last
        // state; fold it in before re-homing them.
        loop {
            let message = match self.islands.get(&island) {
                Some(handle) => handle.rx.try_recv().ok(),
                None => None,
            };
            match message {
                Some(WorkerToCoord::Delta(delta)) => self.import_worker_delta(island, &delta),
                Some(WorkerToCoord::SplitRequest) | None => break,
            }
        }

        if components.len() <= 1 {
            return;
        }
        tracing::debug!(island = %island, parts = components.len(), "splitting island");

        let resident: &ConnectedComponent = &components[0];
        let resident_nodes = resident.nodes.clone();

        for component in components.iter().skip(1) {
            let mut nodes = Vec::new();
            let mut edges = Vec::new();
            for &entity in &component.nodes {
                if !self.registry.contains(entity) {
                    continue;
                }
                let shared = resident_nodes.contains(&entity);
                if !shared {
                    self.remove_from_island(island, entity, false);
                }
                nodes.push(entity);
            }
            for &entity in &component.edges {
                if !self.registry.contains(entity) {
                    continue;
                }
                self.remove_from_island(island, entity, false);
                edges.push(entity);
            }
            self.create_island(nodes, edges);
        }
    }

    /// Sweep the mirrored AABBs and create contact pairs across islands.
    fn run_broadphase(&mut self) {
        let entries: Vec<SweepEntry> = self
            .registry
            .iter::<Aabb>()
            .filter(|(entity, _)| self.registry.has::<GraphNode>(*entity))
            .map(|(entity, aabb)| SweepEntry {
                entity,
                aabb: *aabb,
                procedural: self.registry.has::<ProceduralTag>(entity),
            })
            .collect();

        let candidates = sweep_pairs(&entries, self.settings.contact_aabb_margin);
        for (a, b) in candidates {
            let key = pair_key(a, b);
            if self.pairs.contains_key(&key) {
                continue;
            }
            if !self.registry.contains_by_id(a, ComponentId::Shape)
                || !self.registry.contains_by_id(b, ComponentId::Shape)
            {
                continue;
            }
            // Pairs within one island are the worker's business.
            let islands_a = self.islands_of(a);
            let islands_b = self.islands_of(b);
            if islands_a.iter().any(|i| islands_b.contains(i)) {
                continue;
            }

            let mut manifold = ContactManifold::new([a, b]);
            if let (Some(ma), Some(mb)) = (
                self.registry.get::<skerry_types::comp::Material>(a),
                self.registry.get::<skerry_types::comp::Material>(b),
            ) {
                let combined = ma.combine(mb);
                manifold.friction = combined.friction;
                manifold.restitution = combined.restitution;
            }

            let (Some(node_a), Some(node_b)) = (
                self.registry.get::<GraphNode>(a).map(|n| n.index),
                self.registry.get::<GraphNode>(b).map(|n| n.index),
            ) else {
                continue;
            };

            let entity = self.registry.create();
            self.registry.insert(entity, manifold);
            match self.graph.insert_edge(entity, node_a, node_b) {
                Ok(index) => {
                    self.registry.insert(entity, GraphEdge { index });
                    self.pairs.insert(key, entity);
                    self.assign_edge_to_island(entity, a, b);
                }
                Err(_) => {
                    self.registry.destroy(entity);
                }
            }
        }

        // Drop pairs whose AABBs separated beyond the wider margin.
        let separation = self.settings.contact_aabb_separation;
        let mut dead = Vec::new();
        for (&(a, b), &edge) in &self.pairs {
            if !self.registry.contains(edge) {
                dead.push((pair_key(a, b), edge, false));
                continue;
            }
            let separated = match (
                self.registry.get::<Aabb>(a),
                self.registry.get::<Aabb>(b),
            ) {
                (Some(aabb_a), Some(aabb_b)) => {
                    !aabb_a.expanded(separation).overlaps(aabb_b)
                }
                _ => true,
            };
            if separated {
                dead.push((pair_key(a, b), edge, true));
            }
        }
        dead.sort_by_key(|(_, edge, _)| edge.to_bits());
        for (key, edge, destroy) in dead {
            self.pairs.remove(&key);
            if destroy {
                self.destroy_entity(edge);
            }
        }
    }

    /// Route externally mutated components to their islands' workers.
    fn flush_dirty(&mut self) {
        let dirty: Vec<(Entity, Dirty)> = self
            .registry
            .iter::<Dirty>()
            .map(|(e, d)| (e, d.clone()))
            .collect();

        for (entity, dirty) in dirty {
            for island in self.islands_of(entity) {
                let Some(handle) = self.islands.get_mut(&island) else {
                    continue;
                };
                if dirty.is_new_entity {
                    handle.builder.created(entity);
                }
                for id in &dirty.created {
                    handle.builder.created_by_id(&self.registry, entity, *id);
                }
                for id in &dirty.updated {
                    handle.builder.updated_by_id(&self.registry, entity, *id);
                }
                for id in &dirty.destroyed {
                    handle.builder.destroyed_by_id(entity, *id);
                }
                handle.signal = true;
            }
        }
        self.registry.clear::<Dirty>();
    }

    /// Tear down islands that lost their last procedural body.
    fn cleanup_empty_islands(&mut self) {
        let empty: Vec<Entity> = self
            .island_order
            .iter()
            .filter(|island| {
                self.registry.get::<Island>(**island).is_some_and(|i| {
                    !i.nodes
                        .iter()
                        .any(|e| self.registry.has::<ProceduralTag>(*e))
                })
            })
            .copied()
            .collect();

        for island in empty {
            tracing::debug!(island = %island, "tearing down empty island");
            let members = self
                .registry
                .get::<Island>(island)
                .cloned()
                .unwrap_or_default();
            for entity in members.nodes.iter().chain(members.edges.iter()) {
                self.set_residency(*entity, island, false);
            }
            self.teardown_island(island);
        }
    }

    /// Send every pending per-island delta and poke workers with messages.
    fn flush_builders(&mut self) {
        for island in self.island_order.clone() {
            let Some(handle) = self.islands.get_mut(&island) else {
                continue;
            };
            if !handle.builder.is_empty() {
                let delta = handle.builder.finish();
                if handle.tx.send(CoordToWorker::Delta(delta)).is_err() {
                    tracing::warn!(island = %island, "worker queue closed");
                }
                handle.signal = true;
            }
            if handle.signal {
                handle.signal = false;
                handle.worker.request_run();
            }
        }
    }

    fn import_worker_delta(&mut self, island: Entity, delta: &Delta) {
        // Graph and island cleanup for entities the worker destroyed
        // (separated manifolds), before the registry import erases them.
        let destroyed_mains: Vec<Entity> = {
            let Some(handle) = self.islands.get(&island) else {
                return;
            };
            delta
                .destroyed_entities()
                .iter()
                .filter_map(|worker_e| handle.map.local_for(*worker_e))
                .collect()
        };
        for main in destroyed_mains {
            if !self.registry.contains(main) {
                continue;
            }
            if let Some(edge) = self.registry.get::<GraphEdge>(main).copied() {
                if self.graph.edge_entity(edge.index) == Some(main) {
                    self.graph.remove_edge(edge.index);
                }
                if let Some(manifold) = self.registry.get::<ContactManifold>(main) {
                    self.pairs
                        .remove(&pair_key(manifold.body[0], manifold.body[1]));
                }
            }
            self.remove_from_island(island, main, false);
            if self.registry.has::<NetworkedTag>(main) {
                self.networked_destroyed.push(main);
            }
        }

        let result = {
            let Some(handle) = self.islands.get_mut(&island) else {
                return;
            };
            delta.import(&mut self.registry, &mut handle.map)
        };

        // Entities the worker created: manifolds discovered by its broad
        // phase. Wire them into the graph and reply with the mapping.
        for (worker_e, main) in &result.created {
            if let Some(handle) = self.islands.get_mut(&island) {
                handle.builder.insert_entity_mapping(*worker_e, *main);
                handle.signal = true;
            }
            let Some(body) = self.registry.get::<ContactManifold>(*main).map(|m| m.body)
            else {
                continue;
            };
            let (Some(node_a), Some(node_b)) = (
                self.registry.get::<GraphNode>(body[0]).map(|n| n.index),
                self.registry.get::<GraphNode>(body[1]).map(|n| n.index),
            ) else {
                continue;
            };
            if let Ok(index) = self.graph.insert_edge(*main, node_a, node_b) {
                self.registry.insert(*main, GraphEdge { index });
                self.pairs.insert(pair_key(body[0], body[1]), *main);
                self.registry.insert(*main, IslandResident { island });
                if let Some(island_comp) = self.registry.get_mut::<Island>(island) {
                    island_comp.edges.push(*main);
                }
            }
        }
    }
}

impl std::fmt::Debug for IslandCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IslandCoordinator")
            .field("islands", &self.island_order.len())
            .field("entities", &self.registry.entity_count())
            .field("paused", &self.settings.paused)
            .finish_non_exhaustive()
    }
}
