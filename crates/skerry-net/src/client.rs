//! Client-side reconciliation.
//!
//! The client mirrors the server's world through its coordinator: created
//! and destroyed local entities are announced, owned-entity inputs go out in
//! transient snapshots, and incoming server snapshots either snap the
//! affected islands (writing discontinuities) or launch an extrapolation job
//! that replays buffered inputs up to the present.
//!
//! Run [`NetworkClient::update`] before the coordinator's own tick so dirty
//! markers are observed before the coordinator drains them to workers.

use std::sync::Arc;

use hashbrown::HashMap;

use skerry_core::{collect_islands_from_residents, now_seconds, IslandCoordinator};
use skerry_delta::DeltaBuilder;
use skerry_registry::EntityMap;
use skerry_types::comp::{
    BodyInput, ComponentId, ComponentPool, ContactManifold, Dirty, Discontinuity, EntityOwner,
    GraphNode, Island, NetworkDirty, NetworkedTag, Orientation, Position, PresentOrientation,
    PresentPosition, ProceduralTag, StaticTag,
};
use skerry_types::Entity;

use crate::clock::ClockSync;
use crate::extrapolation::{ExtrapolationInput, ExtrapolationJob};
use crate::history::{InputFrame, InputHistory};
use crate::packet::{
    export_all, export_component, sort_pools, CreateEntity, DestroyEntity, EntityRequest,
    EntityResponse, GeneralSnapshot, Packet, PoolSnapshot, TimeResponse, TransientSnapshot,
    UpdateEntityMap,
};
use crate::settings::ClientSettings;

/// Frames of input history kept for extrapolation replay.
const INPUT_HISTORY_CAPACITY: usize = 256;

/// Client network reconciliation over one coordinator world.
pub struct NetworkClient {
    settings: ClientSettings,
    /// Local stand-in for this client, assigned by `client_created`.
    client_entity: Option<Entity>,
    /// Server-space → local map.
    entity_map: EntityMap,
    owned_entities: Vec<Entity>,
    clock_sync: ClockSync,
    last_snapshot_time: f64,
    server_playout_delay: f64,
    input_history: InputHistory,
    extrapolation_jobs: Vec<Arc<ExtrapolationJob>>,
    /// Entities already asked for, so repeat snapshots don't spam requests.
    requested_entities: Vec<Entity>,
    extrapolation_timed_out: bool,
    outbound: Vec<Packet>,
}

impl NetworkClient {
    /// New client with the given settings.
    #[must_use]
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            client_entity: None,
            entity_map: EntityMap::new(),
            owned_entities: Vec::new(),
            clock_sync: ClockSync::new(),
            last_snapshot_time: 0.0,
            server_playout_delay: 0.0,
            input_history: InputHistory::new(INPUT_HISTORY_CAPACITY),
            extrapolation_jobs: Vec::new(),
            requested_entities: Vec::new(),
            extrapolation_timed_out: false,
            outbound: Vec::new(),
        }
    }

    /// The local entity standing in for this client, once assigned.
    #[must_use]
    pub fn client_entity(&self) -> Option<Entity> {
        self.client_entity
    }

    /// Server-space → local entity map.
    #[must_use]
    pub fn entity_map(&self) -> &EntityMap {
        &self.entity_map
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// The playout delay last assigned by the server.
    #[must_use]
    pub fn server_playout_delay(&self) -> f64 {
        self.server_playout_delay
    }

    /// Whether an extrapolation job exceeded its budget since the last call.
    pub fn take_extrapolation_timeout(&mut self) -> bool {
        std::mem::take(&mut self.extrapolation_timed_out)
    }

    /// Number of extrapolation jobs currently in flight.
    #[must_use]
    pub fn extrapolation_jobs_in_flight(&self) -> usize {
        self.extrapolation_jobs.len()
    }

    /// Packets emitted since the last drain.
    pub fn drain_outbound(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbound)
    }

    /// One client tick. Call before the coordinator's `update`.
    pub fn update(&mut self, world: &mut IslandCoordinator) {
        let now = now_seconds();

        if let Some(probe) = self.clock_sync.update(now) {
            self.outbound.push(probe);
        }

        let (created, destroyed) = world.drain_networked_events();
        self.process_created_entities(world, created, now);
        self.process_destroyed_entities(destroyed, now);
        self.maybe_publish_transient_snapshot(world, now);
        self.process_finished_extrapolations(world);
        self.record_local_inputs(world, now);
        self.publish_dirty_components(world, now);
        merge_network_dirty_into_dirty(world);
    }

    /// Feed one packet received from the server.
    pub fn receive(&mut self, world: &mut IslandCoordinator, packet: Packet) {
        match packet {
            Packet::ClientCreated(created) => {
                let local = world.registry_mut().create();
                self.entity_map.insert(created.client_entity, local);
                self.client_entity = Some(local);
                self.outbound.push(Packet::UpdateEntityMap(UpdateEntityMap {
                    pairs: vec![(created.client_entity, local)],
                    timestamp: now_seconds(),
                }));
            }
            Packet::UpdateEntityMap(map) => {
                for (mine, theirs) in map.pairs {
                    self.entity_map.insert(theirs, mine);
                }
            }
            Packet::SetPlayoutDelay(delay) => {
                self.server_playout_delay = delay.value;
            }
            Packet::TimeRequest(request) => {
                self.outbound.push(Packet::TimeResponse(TimeResponse {
                    id: request.id,
                    timestamp: now_seconds(),
                }));
            }
            Packet::TimeResponse(response) => {
                self.clock_sync.process_response(&response, now_seconds());
            }
            Packet::CreateEntity(packet) => self.process_create_entity(world, &packet),
            Packet::DestroyEntity(packet) => self.process_destroy_entity(world, &packet),
            Packet::TransientSnapshot(snapshot) => {
                self.process_transient_snapshot(world, snapshot);
            }
            Packet::GeneralSnapshot(snapshot) => self.process_general_snapshot(world, &snapshot),
            // The original leaves the client's entity-request handler
            // unspecified; keep it a no-op.
            Packet::EntityRequest(_) => {}
            Packet::EntityResponse(response) => self.process_entity_response(world, &response),
        }
    }

    // ------------------------------------------------------------------
    // Tick phases
    // ------------------------------------------------------------------

    fn process_created_entities(
        &mut self,
        world: &mut IslandCoordinator,
        created: Vec<Entity>,
        now: f64,
    ) {
        let created: Vec<Entity> = created
            .into_iter()
            .filter(|e| world.registry().contains(*e))
            .collect();
        if created.is_empty() {
            return;
        }

        let mut packet = CreateEntity {
            timestamp: now,
            entities: created.clone(),
            pools: Vec::new(),
        };
        for entity in created {
            if let Some(client) = self.client_entity {
                world
                    .registry_mut()
                    .insert(entity, EntityOwner::owned_by(client));
            }
            if !self.owned_entities.contains(&entity) {
                self.owned_entities.push(entity);
            }
            export_all(world.registry(), entity, &mut packet.pools);
        }
        sort_pools(&mut packet.pools);
        self.outbound.push(Packet::CreateEntity(packet));
    }

    fn process_destroyed_entities(&mut self, destroyed: Vec<Entity>, now: f64) {
        if destroyed.is_empty() {
            return;
        }
        for entity in &destroyed {
            self.owned_entities.retain(|e| e != entity);
            if self.entity_map.has_local(*entity) {
                self.entity_map.erase_local(*entity);
            }
        }
        self.outbound.push(Packet::DestroyEntity(DestroyEntity {
            timestamp: now,
            entities: destroyed,
        }));
    }

    /// Transient state of every island containing a locally owned entity,
    /// excluding entities owned by other clients.
    fn maybe_publish_transient_snapshot(&mut self, world: &IslandCoordinator, now: f64) {
        if now - self.last_snapshot_time < 1.0 / self.settings.snapshot_rate {
            return;
        }
        self.last_snapshot_time = now;

        let islands =
            collect_islands_from_residents(world.registry(), self.owned_entities.iter().copied());
        if islands.is_empty() {
            return;
        }

        let mut packet = TransientSnapshot {
            timestamp: now,
            pools: Vec::new(),
            manifolds: Vec::new(),
        };

        for island in islands {
            let Some(island_comp) = world.registry().get::<Island>(island) else {
                continue;
            };
            for entity in &island_comp.nodes {
                self.export_transient_for(world, *entity, &mut packet.pools);
            }
            for entity in &island_comp.edges {
                if let Some(manifold) = world.registry().get::<ContactManifold>(*entity) {
                    packet.manifolds.push((*entity, manifold.clone()));
                } else {
                    self.export_transient_for(world, *entity, &mut packet.pools);
                }
            }
        }

        if !packet.pools.is_empty() {
            sort_pools(&mut packet.pools);
            self.outbound.push(Packet::TransientSnapshot(packet));
        }
    }

    fn export_transient_for(
        &self,
        world: &IslandCoordinator,
        entity: Entity,
        pools: &mut Vec<PoolSnapshot>,
    ) {
        if !world.registry().has::<NetworkedTag>(entity) {
            return;
        }
        let owned_by_other = world
            .registry()
            .get::<EntityOwner>(entity)
            .and_then(|o| o.client)
            .is_some_and(|owner| Some(owner) != self.client_entity);
        if owned_by_other {
            return;
        }
        crate::packet::export_transient(world.registry(), entity, pools);
    }

    fn process_finished_extrapolations(&mut self, world: &mut IslandCoordinator) {
        let finished: Vec<Arc<ExtrapolationJob>> = self
            .extrapolation_jobs
            .iter()
            .filter(|job| job.is_finished())
            .cloned()
            .collect();
        self.extrapolation_jobs.retain(|job| !job.is_finished());

        for job in finished {
            let Some(mut result) = job.take_result() else {
                continue;
            };
            if result.terminated_early {
                self.extrapolation_timed_out = true;
            }

            // Entities may have died while the job ran.
            let mut keep = Vec::new();
            let mut snapshots = Vec::new();
            for (entity, snapshot) in result.entities.iter().zip(&result.snapshots) {
                if world.registry().contains(*entity) {
                    keep.push(*entity);
                    snapshots.push(*snapshot);
                }
            }
            result.entities = keep;
            result.snapshots = snapshots;
            if result.entities.is_empty() {
                continue;
            }

            let islands =
                collect_islands_from_residents(world.registry(), result.entities.iter().copied());
            for island in islands {
                world.send_extrapolation_result(island, result.clone());
                world.wake_up_island(island);
            }
        }
    }

    fn record_local_inputs(&mut self, world: &IslandCoordinator, now: f64) {
        let mut inputs = Vec::new();
        for entity in &self.owned_entities {
            if let Some(input) = world.registry().get::<BodyInput>(*entity) {
                inputs.push((*entity, *input));
            }
        }
        self.input_history.emplace(InputFrame {
            timestamp: now,
            inputs,
        });
    }

    fn publish_dirty_components(&mut self, world: &IslandCoordinator, now: f64) {
        let mut packet = GeneralSnapshot {
            timestamp: now,
            pools: Vec::new(),
        };
        for (entity, dirty) in world.registry().iter::<Dirty>() {
            if !world.registry().has::<NetworkedTag>(entity) {
                continue;
            }
            for id in &dirty.updated {
                if id.is_networked() && !id.is_transient() {
                    export_component(world.registry(), entity, *id, &mut packet.pools);
                }
            }
        }
        if !packet.pools.is_empty() {
            sort_pools(&mut packet.pools);
            self.outbound.push(Packet::GeneralSnapshot(packet));
        }
    }

    // ------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------

    fn process_create_entity(&mut self, world: &mut IslandCoordinator, packet: &CreateEntity) {
        world.begin_import();

        let mut emap = UpdateEntityMap {
            pairs: Vec::new(),
            timestamp: now_seconds(),
        };
        let mut locals = Vec::new();
        for remote in &packet.entities {
            let local = match self.entity_map.local_for(*remote) {
                Some(local) if world.registry().contains(local) => local,
                _ => {
                    let local = world.registry_mut().create();
                    self.entity_map.insert(*remote, local);
                    emap.pairs.push((*remote, local));
                    local
                }
            };
            self.requested_entities.retain(|e| e != remote);
            locals.push(local);
        }
        if !emap.pairs.is_empty() {
            self.outbound.push(Packet::UpdateEntityMap(emap));
        }

        self.import_pools(world, &packet.pools);

        for local in &locals {
            world.registry_mut().insert(*local, NetworkedTag);
        }
        world.finalize_imported_entities(&locals);

        // Reconciliation corrections on replicated procedural bodies are
        // hidden behind discontinuities.
        for local in &locals {
            if world.registry().has::<ProceduralTag>(*local)
                && !world.registry().has::<Discontinuity>(*local)
            {
                let position = world
                    .registry()
                    .get::<Position>(*local)
                    .copied()
                    .unwrap_or_default();
                let orientation = world
                    .registry()
                    .get::<Orientation>(*local)
                    .copied()
                    .unwrap_or_default();
                world.registry_mut().insert(*local, Discontinuity::default());
                world
                    .registry_mut()
                    .insert(*local, PresentPosition(position.0));
                world
                    .registry_mut()
                    .insert(*local, PresentOrientation(orientation.0));
            }
        }

        world.end_import();
    }

    fn process_destroy_entity(&mut self, world: &mut IslandCoordinator, packet: &DestroyEntity) {
        world.begin_import();
        for remote in &packet.entities {
            let Some(local) = self.entity_map.local_for(*remote) else {
                continue;
            };
            self.entity_map.erase_remote(*remote);
            if world.registry().contains(local) {
                world.destroy_entity(local);
            }
        }
        world.end_import();
    }

    fn process_entity_response(
        &mut self,
        world: &mut IslandCoordinator,
        response: &EntityResponse,
    ) {
        world.begin_import();

        let mut emap = UpdateEntityMap {
            pairs: Vec::new(),
            timestamp: now_seconds(),
        };
        let mut locals = Vec::new();
        for remote in &response.entities {
            self.requested_entities.retain(|e| e != remote);
            if let Some(local) = self.entity_map.local_for(*remote) {
                locals.push(local);
                continue;
            }
            let local = world.registry_mut().create();
            self.entity_map.insert(*remote, local);
            emap.pairs.push((*remote, local));
            locals.push(local);
        }

        self.import_pools(world, &response.pools);

        for local in &locals {
            world.registry_mut().insert(*local, NetworkedTag);
        }
        world.finalize_imported_entities(&locals);
        world.end_import();

        if !emap.pairs.is_empty() {
            self.outbound.push(Packet::UpdateEntityMap(emap));
        }
    }

    fn import_pools(&self, world: &mut IslandCoordinator, pools: &[PoolSnapshot]) {
        for snapshot in pools {
            if let Err(e) = snapshot.validate() {
                tracing::warn!(error = %e, "dropping malformed pool");
                continue;
            }
            let map = &self.entity_map;
            world.registry_mut().import_pool(
                &snapshot.pool,
                &mut |remote| map.local_for(remote),
                &mut |remote| map.local_for(remote).unwrap_or(remote),
            );
        }
    }

    /// Find remote entities with no local counterpart and request them.
    /// Duplicate requests are suppressed until an answer arrives.
    fn request_unknown_entities(&mut self, pools: &[PoolSnapshot]) -> bool {
        let mut unknown = Vec::new();
        for snapshot in pools {
            snapshot.pool.for_each_entity(|remote| {
                if !self.entity_map.has_remote(remote) && !unknown.contains(&remote) {
                    unknown.push(remote);
                }
            });
        }
        if unknown.is_empty() {
            return false;
        }

        let fresh: Vec<Entity> = unknown
            .iter()
            .copied()
            .filter(|e| !self.requested_entities.contains(e))
            .collect();
        if !fresh.is_empty() {
            self.requested_entities.extend(fresh.iter().copied());
            self.outbound
                .push(Packet::EntityRequest(EntityRequest { entities: fresh }));
        }
        true
    }

    /// Feed remote input components into the history at the snapshot time.
    fn insert_remote_inputs_to_history(&mut self, pools: &[PoolSnapshot], timestamp: f64) {
        let mut inputs = Vec::new();
        for snapshot in pools {
            if snapshot.pool.component_id() != ComponentId::BodyInput {
                continue;
            }
            let mut local = snapshot.pool.clone();
            local.retain_entities(|e| self.entity_map.has_remote(e));
            local.map_entities(&mut |e| self.entity_map.local_for(e).unwrap_or(e));
            if let ComponentPool::BodyInput(entries) = &local {
                inputs.extend(entries.iter().copied());
            }
        }
        self.input_history.emplace(InputFrame { timestamp, inputs });
    }

    fn snapshot_time(&self) -> f64 {
        now_seconds() - (self.server_playout_delay + self.settings.round_trip_time / 2.0)
    }

    #[allow(clippy::too_many_lines)]
    fn process_transient_snapshot(
        &mut self,
        world: &mut IslandCoordinator,
        snapshot: TransientSnapshot,
    ) {
        let contains_unknown = self.request_unknown_entities(&snapshot.pools);
        let snapshot_time = self.snapshot_time();

        // Other clients' inputs always feed the history; the server never
        // sends this client's own inputs back.
        self.insert_remote_inputs_to_history(&snapshot.pools, snapshot_time);

        if !self.settings.extrapolation_enabled {
            self.snap_to_snapshot(world, &snapshot);
            return;
        }

        if contains_unknown {
            // Extrapolating with missing pieces produces nonsense; wait for
            // the entity response.
            return;
        }
        if self.extrapolation_jobs.len() >= self.settings.max_concurrent_extrapolations {
            tracing::debug!("extrapolation budget exhausted, dropping snapshot");
            return;
        }

        // Translate into local space.
        let mut local_snapshot = snapshot;
        let map = self.entity_map.clone();
        local_snapshot.convert_entities(&mut |e| map.local_for(e));

        // The replica set: snapshot entities, the edges connecting them,
        // and the static environment.
        let snapshot_entities = local_snapshot.entities();
        let mut entities = snapshot_entities.clone();
        for entity in &snapshot_entities {
            let Some(node) = world.registry().get::<GraphNode>(*entity) else {
                continue;
            };
            let graph = world.graph();
            graph.visit_edges(node.index, |edge_index| {
                let Some((a, b)) = graph.edge_node_entities(edge_index) else {
                    return;
                };
                let other = if a == *entity { b } else { a };
                if snapshot_entities.contains(&other) {
                    if let Some(edge_entity) = graph.edge_entity(edge_index) {
                        if !entities.contains(&edge_entity) {
                            entities.push(edge_entity);
                        }
                    }
                }
            });
        }
        for entity in world.registry().entities_with::<StaticTag>() {
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }

        let mut builder = DeltaBuilder::new();
        for entity in &entities {
            if !world.registry().contains(*entity) {
                continue;
            }
            builder.created(*entity);
            builder.created_all(world.registry(), *entity);
        }

        let owned: Vec<Entity> = entities
            .iter()
            .copied()
            .filter(|e| self.owned_entities.contains(e))
            .collect();

        let input = ExtrapolationInput {
            entities,
            delta: builder.finish(),
            snapshot: local_snapshot,
            start_time: snapshot_time,
            owned,
            settings: world.settings().clone(),
            budget: self.settings.extrapolation_timeout,
        };
        self.extrapolation_jobs
            .push(ExtrapolationJob::spawn(input, self.input_history.clone()));
    }

    /// Extrapolation off: forward the snapshot to the affected islands,
    /// which snap and record discontinuities.
    fn snap_to_snapshot(&mut self, world: &mut IslandCoordinator, snapshot: &TransientSnapshot) {
        let mut local_snapshot = snapshot.clone();
        let map = self.entity_map.clone();
        local_snapshot.convert_entities(&mut |e| map.local_for(e));

        let entities = local_snapshot.entities();
        if entities.is_empty() {
            return;
        }
        let pools: Vec<ComponentPool> = local_snapshot
            .pools
            .iter()
            .map(|p| p.pool.clone())
            .collect();

        let islands = collect_islands_from_residents(world.registry(), entities);
        for island in islands {
            world.send_snapshot_to_island(island, pools.clone());
            world.wake_up_island(island);
        }
    }

    fn process_general_snapshot(&mut self, world: &mut IslandCoordinator, snapshot: &GeneralSnapshot) {
        let snapshot_time = self.snapshot_time();
        self.insert_remote_inputs_to_history(&snapshot.pools, snapshot_time);
        self.request_unknown_entities(&snapshot.pools);

        for pool_snapshot in &snapshot.pools {
            if let Err(e) = pool_snapshot.validate() {
                tracing::warn!(error = %e, "dropping malformed pool");
                continue;
            }
            let id = pool_snapshot.pool.component_id();

            let mut touched: HashMap<Entity, Entity> = HashMap::new();
            let map = &self.entity_map;
            pool_snapshot.pool.for_each_entity(|remote| {
                if let Some(local) = map.local_for(remote) {
                    touched.insert(remote, local);
                }
            });

            world.registry_mut().import_pool(
                &pool_snapshot.pool,
                &mut |remote| touched.get(&remote).copied(),
                &mut |remote| map.local_for(remote).unwrap_or(remote),
            );

            for local in touched.values() {
                if world.registry().contains(*local) {
                    world
                        .registry_mut()
                        .get_or_insert_default::<NetworkDirty>(*local)
                        .0
                        .mark_updated(id);
                }
            }
        }
    }
}

/// Merge import-time dirty markers into the regular dirty set so the
/// coordinator's next tick pushes them to workers.
fn merge_network_dirty_into_dirty(world: &mut IslandCoordinator) {
    let marked: Vec<(Entity, NetworkDirty)> = world
        .registry()
        .iter::<NetworkDirty>()
        .map(|(e, d)| (e, d.clone()))
        .collect();
    for (entity, network_dirty) in marked {
        world
            .registry_mut()
            .get_or_insert_default::<Dirty>(entity)
            .merge(&network_dirty.0);
    }
    world.registry_mut().clear::<NetworkDirty>();
}
