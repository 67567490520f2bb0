//! Server-side reconciliation.
//!
//! The server observes the coordinator's world and replicates it to clients:
//! each client has a region of interest whose membership drives entity
//! creation and destruction packets, a rate-limited transient snapshot of
//! continuously changing state, a general snapshot of dirty steady state,
//! and a playout delay derived from the worst round trip among the clients
//! it can see.
//!
//! Run [`NetworkServer::update`] before the coordinator's own tick so dirty
//! markers are observed before the coordinator drains them to workers.

use hashbrown::{HashMap, HashSet};

use skerry_core::{collect_islands_from_residents, now_seconds, IslandCoordinator};
use skerry_registry::EntityMap;
use skerry_types::comp::{
    ComponentPool, Dirty, EntityOwner, Island, NetworkDirty, NetworkedTag, SleepingTag, StaticTag,
};
use skerry_types::{Aabb, Entity};

use crate::clock::ClockSync;
use crate::packet::{
    export_all, export_component, sort_pools, ClientCreated, CreateEntity, DestroyEntity,
    EntityResponse, GeneralSnapshot, Packet, SetPlayoutDelay, TimeResponse, TransientSnapshot,
    UpdateEntityMap,
};
use crate::settings::ServerSettings;

/// Significance threshold for playout-delay updates, seconds.
const PLAYOUT_DELAY_EPSILON: f64 = 0.002;

struct TimedPacket {
    timestamp: f64,
    packet: Packet,
}

/// The entities a client can currently see.
#[derive(Debug, Default)]
struct AabbOfInterest {
    region: Aabb,
    entities: HashSet<Entity>,
    create_entities: Vec<Entity>,
    destroy_entities: Vec<Entity>,
}

/// Per-connection state for one remote client.
pub struct RemoteClient {
    /// The client's entity in server space.
    pub client_entity: Entity,
    /// Client-space → server-space map.
    entity_map: EntityMap,
    owned_entities: Vec<Entity>,
    packet_queue: Vec<TimedPacket>,
    clock_sync: ClockSync,
    /// Measured round-trip time, seconds.
    pub round_trip_time: f64,
    snapshot_rate: f64,
    last_snapshot_time: f64,
    playout_delay: f64,
    aabb_of_interest: AabbOfInterest,
}

impl RemoteClient {
    fn new(client_entity: Entity, snapshot_rate: f64, region: Aabb) -> Self {
        Self {
            client_entity,
            entity_map: EntityMap::new(),
            owned_entities: Vec::new(),
            packet_queue: Vec::new(),
            clock_sync: ClockSync::new(),
            round_trip_time: 0.0,
            snapshot_rate,
            last_snapshot_time: 0.0,
            playout_delay: 0.0,
            aabb_of_interest: AabbOfInterest {
                region,
                ..AabbOfInterest::default()
            },
        }
    }
}

/// Server network reconciliation over one coordinator world.
pub struct NetworkServer {
    settings: ServerSettings,
    clients: HashMap<Entity, RemoteClient>,
    client_order: Vec<Entity>,
    pending_created_clients: Vec<Entity>,
    outbound: Vec<(Entity, Packet)>,
}

impl NetworkServer {
    /// New server with the given settings.
    #[must_use]
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            clients: HashMap::new(),
            client_order: Vec::new(),
            pending_created_clients: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Register a client with a region of interest. The `client_created`
    /// packet goes out on the next update so the caller has a chance to wire
    /// up its transport first.
    pub fn make_client(&mut self, world: &mut IslandCoordinator, region: Aabb) -> Entity {
        let entity = world.registry_mut().create();
        self.clients.insert(
            entity,
            RemoteClient::new(entity, self.settings.snapshot_rate, region),
        );
        self.client_order.push(entity);
        self.pending_created_clients.push(entity);
        entity
    }

    /// Set a client's measured round-trip time.
    pub fn set_client_round_trip_time(&mut self, client: Entity, rtt: f64) {
        if let Some(state) = self.clients.get_mut(&client) {
            state.round_trip_time = rtt;
        }
    }

    /// Move a client's region of interest.
    pub fn set_client_region(&mut self, client: Entity, region: Aabb) {
        if let Some(state) = self.clients.get_mut(&client) {
            state.aabb_of_interest.region = region;
        }
    }

    /// Packets emitted since the last drain, `(client, packet)` pairs in
    /// emission order.
    pub fn drain_outbound(&mut self) -> Vec<(Entity, Packet)> {
        std::mem::take(&mut self.outbound)
    }

    /// One server tick. Call before the coordinator's `update`.
    pub fn update(&mut self, world: &mut IslandCoordinator) {
        let now = now_seconds();
        self.update_clock_sync(now);
        self.process_timed_packets(world, now);
        update_island_owners(world);
        self.update_aabbs_of_interest(world);
        self.process_regions(world, now);
        self.publish_pending_created_clients();
        merge_network_dirty_into_dirty(world);
    }

    /// Feed one packet received from a client. Timed packets are queued by
    /// adjusted timestamp; the rest are handled immediately.
    pub fn receive(&mut self, world: &mut IslandCoordinator, client: Entity, packet: Packet) {
        if !self.clients.contains_key(&client) {
            tracing::warn!(client = %client, "packet from unknown client");
            return;
        }
        match packet.timestamp() {
            Some(timestamp) => self.enqueue_timed(client, packet, timestamp),
            None => self.process_packet(world, client, packet),
        }
    }

    // ------------------------------------------------------------------
    // Tick phases
    // ------------------------------------------------------------------

    fn update_clock_sync(&mut self, now: f64) {
        for client in &self.client_order {
            if let Some(state) = self.clients.get_mut(client) {
                if let Some(probe) = state.clock_sync.update(now) {
                    self.outbound.push((*client, probe));
                }
            }
        }
    }

    fn enqueue_timed(&mut self, client: Entity, packet: Packet, timestamp: f64) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        let adjusted = state
            .clock_sync
            .adjust(timestamp)
            .unwrap_or_else(|| now_seconds() - state.round_trip_time / 2.0);
        let at = state
            .packet_queue
            .partition_point(|p| p.timestamp <= adjusted);
        state.packet_queue.insert(
            at,
            TimedPacket {
                timestamp: adjusted,
                packet,
            },
        );
    }

    fn process_timed_packets(&mut self, world: &mut IslandCoordinator, now: f64) {
        for client in self.client_order.clone() {
            loop {
                let packet = {
                    let Some(state) = self.clients.get_mut(&client) else {
                        break;
                    };
                    if state
                        .packet_queue
                        .first()
                        .is_some_and(|p| p.timestamp <= now)
                    {
                        Some(state.packet_queue.remove(0).packet)
                    } else {
                        None
                    }
                };
                match packet {
                    Some(packet) => self.process_packet(world, client, packet),
                    None => break,
                }
            }
        }
    }

    fn update_aabbs_of_interest(&mut self, world: &IslandCoordinator) {
        for client in &self.client_order {
            let Some(state) = self.clients.get_mut(client) else {
                continue;
            };
            let aabboi = &mut state.aabb_of_interest;

            let current: HashSet<Entity> = world
                .query_region(&aabboi.region)
                .into_iter()
                .filter(|e| world.registry().has::<NetworkedTag>(*e))
                .collect();

            for entity in current.difference(&aabboi.entities) {
                aabboi.create_entities.push(*entity);
            }
            for entity in aabboi.entities.difference(&current) {
                aabboi.destroy_entities.push(*entity);
            }
            aabboi.create_entities.sort_by_key(|e: &Entity| Entity::to_bits(*e));
            aabboi.destroy_entities.sort_by_key(|e: &Entity| Entity::to_bits(*e));
            aabboi.entities = current;
        }
    }

    fn process_regions(&mut self, world: &IslandCoordinator, now: f64) {
        for client in self.client_order.clone() {
            self.process_region_destroyed(world, client, now);
            self.process_region_created(world, client, now);
            self.maybe_publish_transient_snapshot(world, client, now);
            self.publish_dirty_components(world, client, now);
            self.calculate_playout_delay(world, client);
        }
    }

    fn process_region_destroyed(
        &mut self,
        world: &IslandCoordinator,
        client: Entity,
        now: f64,
    ) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        let exited = std::mem::take(&mut state.aabb_of_interest.destroy_entities);
        if exited.is_empty() {
            return;
        }

        let mut packet = DestroyEntity {
            timestamp: now,
            entities: Vec::new(),
        };
        for entity in exited {
            // Client-owned entities persist on the client side.
            let owned = world
                .registry()
                .get::<EntityOwner>(entity)
                .is_some_and(|o| o.client == Some(client));
            if owned {
                continue;
            }
            packet.entities.push(entity);
            // Forget the mapping; the entity gets a fresh one if it comes
            // back into the region.
            if state.entity_map.has_local(entity) {
                state.entity_map.erase_local(entity);
            }
        }
        if !packet.entities.is_empty() {
            self.outbound.push((client, Packet::DestroyEntity(packet)));
        }
    }

    fn process_region_created(&mut self, world: &IslandCoordinator, client: Entity, now: f64) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        let entered = std::mem::take(&mut state.aabb_of_interest.create_entities);
        if entered.is_empty() {
            return;
        }

        let mut packet = CreateEntity {
            timestamp: now,
            entities: Vec::new(),
            pools: Vec::new(),
        };
        for entity in entered {
            let owned = world
                .registry()
                .get::<EntityOwner>(entity)
                .is_some_and(|o| o.client == Some(client));
            if owned {
                continue;
            }
            packet.entities.push(entity);
            export_all(world.registry(), entity, &mut packet.pools);
        }
        if !packet.entities.is_empty() {
            sort_pools(&mut packet.pools);
            self.outbound.push((client, Packet::CreateEntity(packet)));
        }
    }

    fn maybe_publish_transient_snapshot(
        &mut self,
        world: &IslandCoordinator,
        client: Entity,
        now: f64,
    ) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        if now - state.last_snapshot_time < 1.0 / state.snapshot_rate {
            return;
        }
        state.last_snapshot_time = now;

        let mut packet = TransientSnapshot {
            timestamp: now,
            pools: Vec::new(),
            manifolds: Vec::new(),
        };

        let mut in_region: Vec<Entity> = state.aabb_of_interest.entities.iter().copied().collect();
        in_region.sort_by_key(|e: &Entity| Entity::to_bits(*e));
        for entity in in_region {
            if world.registry().has::<SleepingTag>(entity)
                || world.registry().has::<StaticTag>(entity)
            {
                continue;
            }
            if !world.registry().has::<NetworkedTag>(entity) {
                continue;
            }
            // The client has full control inside islands it wholly owns;
            // the server does not echo state for those.
            if is_fully_owned_by_client(world, client, entity) {
                continue;
            }
            crate::packet::export_transient(world.registry(), entity, &mut packet.pools);
        }

        if !packet.pools.is_empty() {
            sort_pools(&mut packet.pools);
            self.outbound
                .push((client, Packet::TransientSnapshot(packet)));
        }
    }

    fn publish_dirty_components(&mut self, world: &IslandCoordinator, client: Entity, now: f64) {
        let Some(state) = self.clients.get(&client) else {
            return;
        };
        let mut packet = GeneralSnapshot {
            timestamp: now,
            pools: Vec::new(),
        };

        let mut in_region: Vec<Entity> = state.aabb_of_interest.entities.iter().copied().collect();
        in_region.sort_by_key(|e: &Entity| Entity::to_bits(*e));
        for entity in in_region {
            if !world.registry().has::<NetworkedTag>(entity) {
                continue;
            }

            // Locally dirtied components go to everyone, including the
            // owner.
            if let Some(dirty) = world.registry().get::<Dirty>(entity) {
                for id in dirty.updated.clone() {
                    if id.is_networked() && !id.is_transient() {
                        export_component(world.registry(), entity, id, &mut packet.pools);
                    }
                }
            }

            // Components dirtied by another client's snapshot import go to
            // everyone except clients that own the island, so their own
            // state is not echoed back.
            if let Some(network_dirty) = world.registry().get::<NetworkDirty>(entity) {
                if !is_fully_owned_by_client(world, client, entity) {
                    for id in network_dirty.0.updated.clone() {
                        if id.is_networked() && !id.is_transient() {
                            export_component(world.registry(), entity, id, &mut packet.pools);
                        }
                    }
                }
            }
        }

        if !packet.pools.is_empty() {
            sort_pools(&mut packet.pools);
            self.outbound.push((client, Packet::GeneralSnapshot(packet)));
        }
    }

    fn calculate_playout_delay(&mut self, world: &IslandCoordinator, client: Entity) {
        let Some(state) = self.clients.get(&client) else {
            return;
        };
        let mut biggest_rtt = state.round_trip_time;
        for entity in &state.aabb_of_interest.entities {
            let Some(owner) = world.registry().get::<EntityOwner>(*entity) else {
                continue;
            };
            let Some(owner_client) = owner.client else {
                continue;
            };
            if let Some(other) = self.clients.get(&owner_client) {
                biggest_rtt = biggest_rtt.max(other.round_trip_time);
            }
        }

        let playout_delay = biggest_rtt / 2.0 * self.settings.playout_delay_multiplier;
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        if (playout_delay - state.playout_delay).abs() > PLAYOUT_DELAY_EPSILON {
            state.playout_delay = playout_delay;
            self.outbound.push((
                client,
                Packet::SetPlayoutDelay(SetPlayoutDelay {
                    value: playout_delay,
                }),
            ));
        }
    }

    fn publish_pending_created_clients(&mut self) {
        for client in std::mem::take(&mut self.pending_created_clients) {
            self.outbound.push((
                client,
                Packet::ClientCreated(ClientCreated {
                    client_entity: client,
                }),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn process_packet(&mut self, world: &mut IslandCoordinator, client: Entity, packet: Packet) {
        match packet {
            Packet::EntityRequest(request) => self.process_entity_request(world, client, &request.entities),
            // The original leaves the server's entity-response handler
            // unspecified; keep it a no-op.
            Packet::EntityResponse(_) => {}
            Packet::ClientCreated(_) | Packet::SetPlayoutDelay(_) => {}
            Packet::UpdateEntityMap(map) => {
                if let Some(state) = self.clients.get_mut(&client) {
                    for (mine, theirs) in map.pairs {
                        state.entity_map.insert(theirs, mine);
                    }
                }
            }
            Packet::TimeRequest(request) => {
                self.outbound.push((
                    client,
                    Packet::TimeResponse(TimeResponse {
                        id: request.id,
                        timestamp: now_seconds(),
                    }),
                ));
            }
            Packet::TimeResponse(response) => {
                if let Some(state) = self.clients.get_mut(&client) {
                    state.clock_sync.process_response(&response, now_seconds());
                }
            }
            Packet::CreateEntity(packet) => self.process_create_entity(world, client, packet),
            Packet::DestroyEntity(packet) => self.process_destroy_entity(world, client, &packet),
            Packet::TransientSnapshot(snapshot) => {
                self.process_transient_snapshot(world, client, snapshot);
            }
            Packet::GeneralSnapshot(snapshot) => {
                self.process_general_snapshot(world, client, &snapshot);
            }
        }
    }

    /// Reply with the requested entities plus everything in their islands,
    /// so dependent references resolve on the other end.
    fn process_entity_request(
        &mut self,
        world: &mut IslandCoordinator,
        client: Entity,
        entities: &[Entity],
    ) {
        let valid: Vec<Entity> = entities
            .iter()
            .copied()
            .filter(|e| world.registry().contains(*e))
            .collect();
        let islands = collect_islands_from_residents(world.registry(), valid.iter().copied());

        let mut all = Vec::new();
        for island in islands {
            let Some(island_comp) = world.registry().get::<Island>(island) else {
                continue;
            };
            for entity in island_comp.nodes.iter().chain(island_comp.edges.iter()) {
                if world.registry().has::<NetworkedTag>(*entity) && !all.contains(entity) {
                    all.push(*entity);
                }
            }
        }
        // Also requested entities that have no island (static environment).
        for entity in valid {
            if world.registry().has::<NetworkedTag>(entity) && !all.contains(&entity) {
                all.push(entity);
            }
        }

        // Owning clients' entities so owner references resolve.
        let mut owners = Vec::new();
        for entity in &all {
            if let Some(owner) = world.registry().get::<EntityOwner>(*entity) {
                if let Some(owner_client) = owner.client {
                    if !owners.contains(&owner_client) && !all.contains(&owner_client) {
                        owners.push(owner_client);
                    }
                }
            }
        }

        let mut response = EntityResponse {
            entities: all,
            pools: Vec::new(),
        };
        response.entities.extend(owners);

        for entity in &response.entities {
            export_all(world.registry(), *entity, &mut response.pools);
        }
        if !response.entities.is_empty() {
            sort_pools(&mut response.pools);
            self.outbound.push((client, Packet::EntityResponse(response)));
        }
    }

    fn process_create_entity(
        &mut self,
        world: &mut IslandCoordinator,
        client: Entity,
        packet: CreateEntity,
    ) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };

        world.begin_import();

        // Entities first; pools may reference them.
        let mut emap = UpdateEntityMap {
            pairs: Vec::new(),
            timestamp: now_seconds(),
        };
        let mut locals = Vec::new();
        for remote in &packet.entities {
            let local = match state.entity_map.local_for(*remote) {
                Some(local) => local,
                None => {
                    let local = world.registry_mut().create();
                    state.entity_map.insert(*remote, local);
                    // Receiver-space first: the client's own handle.
                    emap.pairs.push((*remote, local));
                    state.owned_entities.push(local);
                    local
                }
            };
            world
                .registry_mut()
                .insert(local, EntityOwner::owned_by(client));
            locals.push(local);
        }
        if !emap.pairs.is_empty() {
            self.outbound.push((client, Packet::UpdateEntityMap(emap)));
        }

        for snapshot in &packet.pools {
            if let Err(e) = snapshot.validate() {
                tracing::warn!(client = %client, error = %e, "dropping malformed pool");
                continue;
            }
            let map = &state.entity_map;
            world.registry_mut().import_pool(
                &snapshot.pool,
                &mut |remote| map.local_for(remote),
                &mut |remote| map.local_for(remote).unwrap_or(remote),
            );
        }

        for local in &locals {
            world.registry_mut().insert(*local, NetworkedTag);
        }
        world.finalize_imported_entities(&locals);
        world.end_import();
    }

    fn process_destroy_entity(
        &mut self,
        world: &mut IslandCoordinator,
        client: Entity,
        packet: &DestroyEntity,
    ) {
        for remote in &packet.entities {
            let Some(state) = self.clients.get_mut(&client) else {
                return;
            };
            let Some(local) = state.entity_map.local_for(*remote) else {
                continue;
            };
            if !world.registry().contains(local) {
                state.entity_map.erase_remote(*remote);
                continue;
            }
            // Clients may only destroy what they own.
            let owned = world
                .registry()
                .get::<EntityOwner>(local)
                .is_some_and(|o| o.client == Some(client));
            if !owned {
                tracing::warn!(client = %client, entity = %local, "destroy of unowned entity discarded");
                continue;
            }
            state.entity_map.erase_remote(*remote);
            state.owned_entities.retain(|e| *e != local);
            state.aabb_of_interest.entities.remove(&local);
            world.begin_import();
            world.destroy_entity(local);
            world.end_import();
        }
    }

    fn process_transient_snapshot(
        &mut self,
        world: &mut IslandCoordinator,
        client: Entity,
        snapshot: TransientSnapshot,
    ) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };

        // Translate into server space, dropping unknown entities.
        let mut local_snapshot = snapshot;
        let map = state.entity_map.clone();
        local_snapshot.convert_entities(&mut |e| map.local_for(e));

        let mut owned_pools: Vec<ComponentPool> = Vec::new();
        for pool_snapshot in &local_snapshot.pools {
            if let Err(e) = pool_snapshot.validate() {
                tracing::warn!(client = %client, error = %e, "dropping malformed pool");
                continue;
            }
            let id = pool_snapshot.pool.component_id();

            if id.is_input() {
                // Input components bypass the ownership check and are
                // applied to the main registry directly.
                let mut touched = Vec::new();
                pool_snapshot.pool.for_each_entity(|e| {
                    if world.registry().contains(e) {
                        touched.push(e);
                    }
                });
                let valid = touched.clone();
                world.registry_mut().import_pool(
                    &pool_snapshot.pool,
                    &mut |remote| valid.contains(&remote).then_some(remote),
                    &mut |remote| remote,
                );
                for entity in touched {
                    world
                        .registry_mut()
                        .get_or_insert_default::<Dirty>(entity)
                        .mark_updated(id);
                }
                continue;
            }

            // Everything else is accepted only for entities whose island is
            // fully owned by this client.
            let mut pool = pool_snapshot.pool.clone();
            pool.retain_entities(|e| is_fully_owned_by_client(world, client, e));
            if pool.is_empty() {
                continue;
            }
            owned_pools.push(pool);
        }

        if owned_pools.is_empty() {
            return;
        }

        // Hand the accepted state to the owning islands; they snap and the
        // values flow back through the normal sync path.
        let mut entities = Vec::new();
        for pool in &owned_pools {
            pool.for_each_entity(|e| {
                if !entities.contains(&e) {
                    entities.push(e);
                }
            });
        }
        let islands = collect_islands_from_residents(world.registry(), entities);
        for island in islands {
            world.send_snapshot_to_island(island, owned_pools.clone());
            world.wake_up_island(island);
        }
    }

    fn process_general_snapshot(
        &mut self,
        world: &mut IslandCoordinator,
        client: Entity,
        snapshot: &GeneralSnapshot,
    ) {
        let Some(state) = self.clients.get(&client) else {
            return;
        };
        let map = state.entity_map.clone();

        for pool_snapshot in &snapshot.pools {
            if let Err(e) = pool_snapshot.validate() {
                tracing::warn!(client = %client, error = %e, "dropping malformed pool");
                continue;
            }
            let id = pool_snapshot.pool.component_id();

            // Ownership is resolved in a pre-pass; the import itself holds
            // the registry mutably.
            let mut accepted: HashMap<Entity, Entity> = HashMap::new();
            let mut rejected = 0usize;
            pool_snapshot.pool.for_each_entity(|remote| {
                let Some(local) = map.local_for(remote) else {
                    return;
                };
                if id.is_input() || is_fully_owned_by_client(world, client, local) {
                    accepted.insert(remote, local);
                } else {
                    rejected += 1;
                }
            });
            if rejected > 0 {
                tracing::warn!(
                    client = %client,
                    component = id.name(),
                    rejected,
                    "discarding updates for entities the client does not own",
                );
            }
            if accepted.is_empty() {
                continue;
            }

            let locals: Vec<Entity> = accepted.values().copied().collect();
            world.registry_mut().import_pool(
                &pool_snapshot.pool,
                &mut |remote| accepted.get(&remote).copied(),
                &mut |remote| map.local_for(remote).unwrap_or(remote),
            );

            for local in locals {
                if id.is_input() {
                    world
                        .registry_mut()
                        .get_or_insert_default::<Dirty>(local)
                        .mark_updated(id);
                } else {
                    // Kept apart from `Dirty` so the next general snapshot
                    // does not echo this straight back to its author.
                    world
                        .registry_mut()
                        .get_or_insert_default::<NetworkDirty>(local)
                        .0
                        .mark_updated(id);
                }
            }
        }
    }
}

/// Whether an entity's island (or every island it touches) is owned by the
/// client. Entities outside any island count as owned.
#[must_use]
pub fn is_fully_owned_by_client(
    world: &IslandCoordinator,
    client: Entity,
    entity: Entity,
) -> bool {
    let islands = world.islands_of(entity);
    if islands.is_empty() {
        return true;
    }
    islands.iter().all(|island| {
        world
            .registry()
            .get::<EntityOwner>(*island)
            .is_some_and(|owner| owner.client == Some(client))
    })
}

/// Recompute island ownership: a client owns an island iff every owned
/// entity in it is owned by that client.
fn update_island_owners(world: &mut IslandCoordinator) {
    for island in world.island_entities() {
        let Some(island_comp) = world.registry().get::<Island>(island).cloned() else {
            continue;
        };

        let mut owner: Option<Entity> = None;
        let mut mixed = false;
        for entity in island_comp.nodes.iter().chain(island_comp.edges.iter()) {
            let Some(entity_owner) = world.registry().get::<EntityOwner>(*entity) else {
                continue;
            };
            let Some(client) = entity_owner.client else {
                continue;
            };
            match owner {
                None => owner = Some(client),
                Some(existing) if existing != client => {
                    mixed = true;
                    break;
                }
                Some(_) => {}
            }
        }

        let resolved = if mixed { None } else { owner };
        world
            .registry_mut()
            .insert(island, EntityOwner { client: resolved });
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
