//! Headless island simulation.
//!
//! [`IslandSim`] is one shard of the world: a private registry, the graph
//! restricted to the island, broad-phase pair bookkeeping and the fixed-step
//! pipeline. The island worker drives one of these from its job; the
//! client's extrapolation jobs drive another, seeded from a snapshot. Both
//! get identical stepping behavior, which is what makes speculative
//! re-simulation meaningful.

use hashbrown::HashMap;
use nalgebra::{Point3, UnitQuaternion};

use skerry_delta::Delta;
use skerry_graph::EntityGraph;
use skerry_registry::{EntityMap, Registry};
use skerry_types::comp::{
    AngVel, ComponentPool, Constraint, ContactManifold, Discontinuity, DynamicTag, ExternalTag,
    GraphEdge, GraphNode, IslandTimestamp, KinematicTag, LinVel, Orientation, Position,
    ProceduralTag, RotatedMeshCache, Shape, SleepingDisabledTag, SleepingTag, StaticTag, TreeView,
};
use skerry_types::{Aabb, Entity, SimSettings};

use crate::body::{refresh_derived_state, RigidBodyDesc};
use crate::broadphase::{pair_key, sweep_pairs, SweepEntry};
use crate::collide::{collide, merge_into_manifold, CollideInput, ContactCandidate};
use crate::messages::ExtrapolationResult;
use crate::solver;

/// Workload size above which the broad phase is worth running off-thread.
pub const BROADPHASE_ASYNC_THRESHOLD: usize = 64;
/// Workload size above which the narrow phase is worth running off-thread.
pub const NARROWPHASE_ASYNC_THRESHOLD: usize = 32;

/// Manifold entities created and destroyed by one broad-phase pass.
#[derive(Debug, Clone, Default)]
pub struct BroadphaseOutcome {
    /// Fresh manifold edge entities.
    pub created: Vec<Entity>,
    /// Manifold edge entities destroyed on separation.
    pub destroyed: Vec<Entity>,
}

impl BroadphaseOutcome {
    /// Whether the pass changed the island topology.
    #[must_use]
    pub fn changed_topology(&self) -> bool {
        !self.created.is_empty() || !self.destroyed.is_empty()
    }
}

/// What a delta import did to the island.
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    /// `(coordinator-space, local)` pairs for entities created here.
    pub created: Vec<(Entity, Entity)>,
    /// Local entities destroyed by the import.
    pub destroyed: Vec<Entity>,
    /// Whether any graph edge appeared or disappeared.
    pub topology_changed: bool,
}

/// One island's simulation state, independent of any thread or queue.
pub struct IslandSim {
    registry: Registry,
    graph: EntityGraph,
    /// Coordinator-space → local map for everything imported.
    map: EntityMap,
    settings: SimSettings,
    island_entity: Entity,
    pairs: HashMap<(Entity, Entity), Entity>,
    /// Entities whose polyhedral caches still need building.
    fresh_shapes: Vec<Entity>,
    /// Non-procedural nodes that may have lost their last procedural
    /// neighbor.
    possibly_dangling: Vec<Entity>,
}

impl IslandSim {
    /// New empty island with a local island entity.
    #[must_use]
    pub fn new(settings: SimSettings) -> Self {
        let mut registry = Registry::new();
        let island_entity = registry.create();
        registry.insert(island_entity, IslandTimestamp::default());
        registry.insert(island_entity, TreeView::default());
        Self {
            registry,
            graph: EntityGraph::new(),
            map: EntityMap::new(),
            settings,
            island_entity,
            pairs: HashMap::new(),
            fresh_shapes: Vec::new(),
            possibly_dangling: Vec::new(),
        }
    }

    /// The local island entity.
    #[must_use]
    pub fn island_entity(&self) -> Entity {
        self.island_entity
    }

    /// The island's registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The island's registry, mutable.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// The island's graph.
    #[must_use]
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    /// Coordinator-space → local entity map.
    #[must_use]
    pub fn entity_map(&self) -> &EntityMap {
        &self.map
    }

    /// Map the coordinator's island entity onto the local island entity.
    pub fn adopt_island_mapping(&mut self, coordinator_island: Entity) {
        self.map.insert(coordinator_island, self.island_entity);
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    /// Replace the settings.
    pub fn set_settings(&mut self, settings: SimSettings) {
        self.settings = settings;
    }

    /// The island's simulation time.
    #[must_use]
    pub fn island_time(&self) -> f64 {
        self.registry
            .get::<IslandTimestamp>(self.island_entity)
            .map_or(0.0, |t| t.value)
    }

    /// Set the island's simulation time.
    pub fn set_island_time(&mut self, value: f64) {
        self.registry
            .insert(self.island_entity, IslandTimestamp { value });
    }

    /// Whether the island is sleeping.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.registry.has::<SleepingTag>(self.island_entity)
    }

    /// Spawn a body directly into the island (tests and extrapolation; the
    /// worker receives its bodies via deltas).
    pub fn spawn_body(&mut self, desc: &RigidBodyDesc) -> Entity {
        let entity = self.registry.create();
        desc.insert_components(&mut self.registry, entity);
        let non_connecting = !self.registry.has::<ProceduralTag>(entity);
        let index = self.graph.insert_node(entity, non_connecting);
        self.registry.insert(entity, GraphNode { index });
        entity
    }

    /// Add a constraint edge between two resident bodies.
    pub fn add_constraint(&mut self, constraint: Constraint) -> skerry_types::Result<Entity> {
        let [a, b] = constraint.bodies();
        let node_a = self
            .registry
            .get::<GraphNode>(a)
            .ok_or(skerry_types::SimError::MissingGraphNode(a))?
            .index;
        let node_b = self
            .registry
            .get::<GraphNode>(b)
            .ok_or(skerry_types::SimError::MissingGraphNode(b))?
            .index;

        let entity = self.registry.create();
        self.registry.insert(entity, constraint);
        match self.graph.insert_edge(entity, node_a, node_b) {
            Ok(index) => {
                self.registry.insert(entity, GraphEdge { index });
                Ok(entity)
            }
            Err(_) => {
                self.registry.destroy(entity);
                Err(skerry_types::SimError::MissingGraphNode(a))
            }
        }
    }

    /// Destroy an entity with full cascade: destroying a body removes its
    /// node, which removes incident edges, which destroys the constraint and
    /// manifold entities bound to them. Returns every destroyed entity.
    pub fn destroy_entity(&mut self, entity: Entity) -> Vec<Entity> {
        let mut destroyed = Vec::new();
        self.destroy_inner(entity, &mut destroyed);
        destroyed
    }

    fn destroy_inner(&mut self, entity: Entity, destroyed: &mut Vec<Entity>) {
        if !self.registry.contains(entity) || destroyed.contains(&entity) {
            return;
        }

        if let Some(node) = self.registry.get::<GraphNode>(entity).copied() {
            let mut incident = Vec::new();
            self.graph.visit_edges(node.index, |edge_index| {
                incident.push(edge_index);
            });
            for edge_index in incident {
                if let Some(edge_entity) = self.graph.edge_entity(edge_index) {
                    self.destroy_inner(edge_entity, destroyed);
                }
            }
            self.graph.remove_node(node.index);
        } else if let Some(edge) = self.registry.get::<GraphEdge>(entity).copied() {
            if self.graph.edge_entity(edge.index) == Some(entity) {
                if let Some((a, b)) = self.graph.edge_node_entities(edge.index) {
                    for endpoint in [a, b] {
                        if !self.registry.has::<ProceduralTag>(endpoint)
                            && !self.possibly_dangling.contains(&endpoint)
                        {
                            self.possibly_dangling.push(endpoint);
                        }
                    }
                }
                self.graph.remove_edge(edge.index);
            }
            if let Some(manifold) = self.registry.get::<ContactManifold>(entity) {
                self.pairs.remove(&pair_key(manifold.body[0], manifold.body[1]));
            }
        }

        if let Some(remote) = self.map.remote_for(entity) {
            self.map.erase_remote(remote);
        }
        self.registry.destroy(entity);
        destroyed.push(entity);
    }

    /// Drop non-procedural nodes whose last procedural neighbor is gone.
    /// They still exist in the coordinator; this island just no longer needs
    /// a replica. Returns the destroyed entities.
    pub fn clear_dangling_nodes(&mut self) -> Vec<Entity> {
        let candidates = std::mem::take(&mut self.possibly_dangling);
        let mut removed = Vec::new();

        for entity in candidates {
            if !self.registry.contains(entity) || self.registry.has::<ProceduralTag>(entity) {
                continue;
            }
            let Some(node) = self.registry.get::<GraphNode>(entity).copied() else {
                continue;
            };

            let mut has_procedural_neighbor = false;
            self.graph.visit_edges(node.index, |edge_index| {
                if let Some((a, b)) = self.graph.edge_node_entities(edge_index) {
                    let other = if a == entity { b } else { a };
                    if self.registry.has::<ProceduralTag>(other) {
                        has_procedural_neighbor = true;
                    }
                }
            });

            if !has_procedural_neighbor {
                removed.extend(self.destroy_entity(entity));
            }
        }
        removed
    }

    // ------------------------------------------------------------------
    // Step pipeline
    // ------------------------------------------------------------------

    /// Pre-step work: build rotated caches for freshly imported polyhedra.
    pub fn begin_step(&mut self) {
        let fresh = std::mem::take(&mut self.fresh_shapes);
        for entity in fresh {
            if !self.registry.contains(entity) {
                continue;
            }
            let needs = self
                .registry
                .get::<Shape>(entity)
                .is_some_and(Shape::needs_rotated_cache);
            if needs && !self.registry.has::<RotatedMeshCache>(entity) {
                crate::body::update_rotated_cache(&mut self.registry, entity);
            }
        }
    }

    /// Whether the broad phase is large enough to be worth a parallel task.
    #[must_use]
    pub fn broadphase_parallelizable(&self) -> bool {
        self.registry.iter::<Aabb>().count() > BROADPHASE_ASYNC_THRESHOLD
    }

    /// Collect the sweep input. Pure; safe to hand to a parallel task.
    #[must_use]
    pub fn sweep_entries(&self) -> Vec<SweepEntry> {
        self.registry
            .iter::<Aabb>()
            .filter(|(entity, _)| self.registry.has::<GraphNode>(*entity))
            .map(|(entity, aabb)| SweepEntry {
                entity,
                aabb: *aabb,
                procedural: self.registry.has::<ProceduralTag>(entity),
            })
            .collect()
    }

    /// Candidate pairs for this step.
    #[must_use]
    pub fn candidate_pairs(&self) -> Vec<(Entity, Entity)> {
        sweep_pairs(&self.sweep_entries(), self.settings.contact_aabb_margin)
    }

    /// Apply a candidate set: create manifolds for new touching pairs,
    /// destroy manifolds whose AABBs separated.
    pub fn apply_broadphase(&mut self, candidates: &[(Entity, Entity)]) -> BroadphaseOutcome {
        let mut outcome = BroadphaseOutcome::default();

        for &(a, b) in candidates {
            let key = pair_key(a, b);
            if self.pairs.contains_key(&key) {
                continue;
            }
            if !self.registry.has::<Shape>(a) || !self.registry.has::<Shape>(b) {
                continue;
            }
            if let Some(entity) = self.create_manifold(key.0, key.1) {
                outcome.created.push(entity);
            }
        }

        // Separation check against the wider margin.
        let separation = self.settings.contact_aabb_separation;
        let mut dead = Vec::new();
        for (&(a, b), &edge) in &self.pairs {
            let separated = match (self.registry.get::<Aabb>(a), self.registry.get::<Aabb>(b)) {
                (Some(aabb_a), Some(aabb_b)) => {
                    !aabb_a.expanded(separation).overlaps(aabb_b)
                }
                _ => true,
            };
            if separated {
                dead.push(edge);
            }
        }
        // Deterministic destruction order.
        dead.sort_by_key(|e| e.to_bits());
        for edge in dead {
            let mut destroyed = self.destroy_entity(edge);
            outcome.destroyed.append(&mut destroyed);
        }

        outcome
    }

    /// Create a manifold edge for a touching pair.
    fn create_manifold(&mut self, a: Entity, b: Entity) -> Option<Entity> {
        let node_a = self.registry.get::<GraphNode>(a)?.index;
        let node_b = self.registry.get::<GraphNode>(b)?.index;

        let mut manifold = ContactManifold::new([a, b]);
        if let (Some(ma), Some(mb)) = (
            self.registry.get::<skerry_types::comp::Material>(a),
            self.registry.get::<skerry_types::comp::Material>(b),
        ) {
            let combined = ma.combine(mb);
            manifold.friction = combined.friction;
            manifold.restitution = combined.restitution;
        }

        let entity = self.registry.create();
        self.registry.insert(entity, manifold);
        match self.graph.insert_edge(entity, node_a, node_b) {
            Ok(index) => {
                self.registry.insert(entity, GraphEdge { index });
                self.pairs.insert(pair_key(a, b), entity);
                Some(entity)
            }
            Err(_) => {
                self.registry.destroy(entity);
                None
            }
        }
    }

    /// Whether the narrow phase is large enough to be worth a parallel task.
    #[must_use]
    pub fn narrowphase_parallelizable(&self) -> bool {
        self.registry.iter::<ContactManifold>().count() > NARROWPHASE_ASYNC_THRESHOLD
    }

    /// Compute fresh contact candidates for every manifold. Pure; the
    /// parallel path runs this on a rayon pool.
    #[must_use]
    pub fn compute_contacts(&self) -> Vec<(Entity, Vec<ContactCandidate>)> {
        use rayon::prelude::*;

        let manifolds: Vec<(Entity, [Entity; 2])> = self
            .registry
            .iter::<ContactManifold>()
            .map(|(e, m)| (e, m.body))
            .collect();

        let compute = |&(edge, body): &(Entity, [Entity; 2])| {
            let inputs = (
                self.collide_input(body[0]),
                self.collide_input(body[1]),
            );
            let candidates = match inputs {
                (Some(a), Some(b)) => collide(&a, &b),
                _ => Vec::new(),
            };
            (edge, candidates)
        };

        if manifolds.len() > NARROWPHASE_ASYNC_THRESHOLD {
            manifolds.par_iter().map(compute).collect()
        } else {
            manifolds.iter().map(compute).collect()
        }
    }

    fn collide_input(&self, entity: Entity) -> Option<CollideInput<'_>> {
        let shape = self.registry.get::<Shape>(entity)?;
        let orientation = self.registry.get::<Orientation>(entity)?;
        let position = self
            .registry
            .get::<skerry_types::comp::Origin>(entity)
            .map(|o| o.0)
            .or_else(|| self.registry.get::<Position>(entity).map(|p| p.0))?;
        Some(CollideInput {
            shape,
            position,
            orientation: orientation.0,
            cache: self.registry.get::<RotatedMeshCache>(entity),
        })
    }

    /// Fold computed candidates into the persistent manifolds.
    pub fn apply_contacts(&mut self, results: Vec<(Entity, Vec<ContactCandidate>)>) {
        for (edge, candidates) in results {
            let Some(body) = self
                .registry
                .get::<ContactManifold>(edge)
                .map(|m| m.body)
            else {
                continue;
            };
            let pose = |e: Entity| {
                let position = self
                    .registry
                    .get::<skerry_types::comp::Origin>(e)
                    .map(|o| o.0)
                    .or_else(|| self.registry.get::<Position>(e).map(|p| p.0))
                    .unwrap_or_else(Point3::origin);
                let orientation = self
                    .registry
                    .get::<Orientation>(e)
                    .map_or_else(UnitQuaternion::identity, |o| o.0);
                (position, orientation)
            };
            let pose_a = pose(body[0]);
            let pose_b = pose(body[1]);

            if let Some(manifold) = self.registry.get_mut::<ContactManifold>(edge) {
                merge_into_manifold(
                    manifold,
                    &candidates,
                    (&pose_a.0, &pose_a.1),
                    (&pose_b.0, &pose_b.1),
                );
            }
        }
    }

    /// Synchronous narrow phase.
    pub fn run_narrowphase(&mut self) {
        let results = self.compute_contacts();
        self.apply_contacts(results);
    }

    /// Run the solver over one fixed step, then decay discontinuities.
    pub fn run_solver(&mut self, dt: f64) {
        solver::step(&mut self.registry, &self.settings, dt);

        let rate = self.settings.discontinuity_decay_rate;
        for (_, discontinuity) in self.registry.iter_mut::<Discontinuity>() {
            discontinuity.decay(rate);
        }
    }

    /// One full fixed step, synchronously. The worker runs the same stages
    /// through its state machine; extrapolation and tests call this.
    pub fn full_step(&mut self, dt: f64) -> BroadphaseOutcome {
        self.begin_step();
        let candidates = self.candidate_pairs();
        let outcome = self.apply_broadphase(&candidates);
        self.run_narrowphase();
        self.run_solver(dt);
        outcome
    }

    /// Snapshot of the island's AABBs for the coordinator.
    #[must_use]
    pub fn tree_view(&self) -> TreeView {
        TreeView {
            entries: self
                .registry
                .iter::<Aabb>()
                .map(|(entity, aabb)| (entity, *aabb))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Sleeping
    // ------------------------------------------------------------------

    /// Whether every procedural body is below the sleep speed thresholds and
    /// nothing forbids sleeping.
    #[must_use]
    pub fn could_sleep(&self) -> bool {
        if self.registry.iter::<SleepingDisabledTag>().count() > 0 {
            return false;
        }

        let linear_sq = self.settings.island_linear_sleep_threshold
            * self.settings.island_linear_sleep_threshold;
        let angular_sq = self.settings.island_angular_sleep_threshold
            * self.settings.island_angular_sleep_threshold;

        for (entity, _) in self.registry.iter::<ProceduralTag>() {
            let linvel = self
                .registry
                .get::<LinVel>(entity)
                .map_or(0.0, |v| v.norm_squared());
            let angvel = self
                .registry
                .get::<AngVel>(entity)
                .map_or(0.0, |v| v.norm_squared());
            if linvel > linear_sq || angvel > angular_sq {
                return false;
            }
        }
        true
    }

    /// Put the island to sleep: zero velocities and tag the island plus
    /// every procedural body. Returns the tagged entities.
    pub fn go_to_sleep(&mut self) -> Vec<Entity> {
        let mut slept = vec![self.island_entity];
        self.registry.insert(self.island_entity, SleepingTag);

        let procedural: Vec<Entity> = self.registry.entities_with::<ProceduralTag>().collect();
        for entity in procedural {
            if let Some(v) = self.registry.get_mut::<LinVel>(entity) {
                v.0.fill(0.0);
            }
            if let Some(v) = self.registry.get_mut::<AngVel>(entity) {
                v.0.fill(0.0);
            }
            self.registry.insert(entity, SleepingTag);
            slept.push(entity);
        }
        slept
    }

    /// Wake the island. Returns the entities whose sleeping tag was removed.
    pub fn wake_up(&mut self, now: f64) -> Vec<Entity> {
        let sleeping: Vec<Entity> = self.registry.entities_with::<SleepingTag>().collect();
        for entity in &sleeping {
            self.registry.remove::<SleepingTag>(*entity);
        }
        if !sleeping.is_empty() {
            self.set_island_time(now);
        }
        sleeping
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    /// Import a coordinator delta, patching the graph and derived state.
    pub fn import_delta(&mut self, delta: &Delta) -> ImportSummary {
        let mut summary = ImportSummary::default();

        // Cascade-destroy first so graph cleanup sees the linkage.
        for remote in delta.destroyed_entities() {
            if let Some(local) = self.map.local_for(*remote) {
                let destroyed = self.destroy_entity(local);
                summary.topology_changed |= !destroyed.is_empty();
                summary.destroyed.extend(destroyed);
            }
        }

        let result = delta.import(&mut self.registry, &mut self.map);
        summary.created = result.created;

        // Nodes for every imported body kind.
        let mut new_nodes = Vec::new();
        for (remote, _) in delta.created_of::<DynamicTag>() {
            new_nodes.push(*remote);
        }
        for (remote, _) in delta.created_of::<StaticTag>() {
            new_nodes.push(*remote);
        }
        for (remote, _) in delta.created_of::<KinematicTag>() {
            new_nodes.push(*remote);
        }
        for (remote, _) in delta.created_of::<ExternalTag>() {
            new_nodes.push(*remote);
        }
        for remote in new_nodes {
            let Some(local) = self.map.local_for(remote) else {
                continue;
            };
            if self.registry.has::<GraphNode>(local) {
                continue;
            }
            let non_connecting = !self.registry.has::<ProceduralTag>(local);
            let index = self.graph.insert_node(local, non_connecting);
            self.registry.insert(local, GraphNode { index });
            summary.topology_changed = true;
        }

        // Edges for constraints and manifolds.
        let mut new_edges: Vec<Entity> = Vec::new();
        for (remote, _) in delta.created_of::<Constraint>() {
            new_edges.push(*remote);
        }
        for (remote, _) in delta.created_of::<ContactManifold>() {
            new_edges.push(*remote);
        }
        for remote in new_edges {
            let Some(local) = self.map.local_for(remote) else {
                continue;
            };
            if self.registry.has::<GraphEdge>(local) {
                continue;
            }
            // Body references inside the imported component are already
            // local; the delta's created list is not.
            let bodies = self
                .registry
                .get::<ContactManifold>(local)
                .map(|m| m.body)
                .or_else(|| {
                    self.registry
                        .get::<Constraint>(local)
                        .map(Constraint::bodies)
                });
            let Some([a, b]) = bodies else {
                continue;
            };
            let (Some(node_a), Some(node_b)) = (
                self.registry.get::<GraphNode>(a).map(|n| n.index),
                self.registry.get::<GraphNode>(b).map(|n| n.index),
            ) else {
                tracing::warn!(edge = %local, "imported edge references bodies without nodes");
                continue;
            };
            if let Ok(index) = self.graph.insert_edge(local, node_a, node_b) {
                self.registry.insert(local, GraphEdge { index });
                if self.registry.has::<ContactManifold>(local) {
                    self.pairs.insert(pair_key(a, b), local);
                }
                summary.topology_changed = true;
            }
        }

        // Derived state for transforms that changed outside the integrator.
        let mut touched = Vec::new();
        for (remote, _) in delta.updated_of::<Position>() {
            touched.push(*remote);
        }
        for (remote, _) in delta.updated_of::<Orientation>() {
            touched.push(*remote);
        }
        for (remote, _) in delta.updated_of::<skerry_types::comp::CenterOfMass>() {
            touched.push(*remote);
        }
        for remote in touched {
            if let Some(local) = self.map.local_for(remote) {
                refresh_derived_state(&mut self.registry, local);
            }
        }

        // Fresh shapes need caches before the next narrow phase; freshly
        // created bodies need their AABB et al.
        for (remote, _) in delta.created_of::<Shape>() {
            if let Some(local) = self.map.local_for(*remote) {
                self.fresh_shapes.push(local);
                refresh_derived_state(&mut self.registry, local);
            }
        }

        summary
    }

    /// Snap island state to snapshot pools (coordinator entity space),
    /// writing the difference into each body's discontinuity.
    pub fn apply_snapshot_pools(&mut self, pools: &[ComponentPool]) -> Vec<Entity> {
        let mut touched = Vec::new();
        for pool in pools {
            pool.for_each_entity(|remote| {
                if let Some(local) = self.map.local_for(remote) {
                    if !touched.contains(&local) {
                        touched.push(local);
                    }
                }
            });
        }

        let old_states: Vec<(Entity, Option<Position>, Option<Orientation>)> = touched
            .iter()
            .map(|e| {
                (
                    *e,
                    self.registry.get::<Position>(*e).copied(),
                    self.registry.get::<Orientation>(*e).copied(),
                )
            })
            .collect();

        for pool in pools {
            let map = &self.map;
            self.registry.import_pool(
                pool,
                &mut |remote| map.local_for(remote),
                &mut |remote| map.local_for(remote).unwrap_or(remote),
            );
        }

        for (entity, old_position, old_orientation) in old_states {
            let new_position = self.registry.get::<Position>(entity).copied();
            let new_orientation = self.registry.get::<Orientation>(entity).copied();
            if let Some(discontinuity) = self.registry.get_mut::<Discontinuity>(entity) {
                if let (Some(old), Some(new)) = (old_position, new_position) {
                    if let (Some(old_orn), Some(new_orn)) = (old_orientation, new_orientation) {
                        discontinuity.accumulate(&old.coords, &new.coords, &old_orn, &new_orn);
                    }
                }
            }
            refresh_derived_state(&mut self.registry, entity);
        }

        touched
    }

    /// Fold an extrapolation result into the island, writing discontinuities.
    pub fn apply_extrapolation_result(&mut self, result: &ExtrapolationResult) -> Vec<Entity> {
        let mut touched = Vec::new();
        for (remote, snapshot) in result.entities.iter().zip(&result.snapshots) {
            let Some(local) = self.map.local_for(*remote) else {
                continue;
            };
            if !self.registry.contains(local) {
                continue;
            }

            let old_position = self.registry.get::<Position>(local).copied();
            let old_orientation = self.registry.get::<Orientation>(local).copied();

            self.registry.insert(local, Position(snapshot.position));
            self.registry
                .insert(local, Orientation(snapshot.orientation));
            self.registry.insert(local, LinVel(snapshot.linvel));
            self.registry.insert(local, AngVel(snapshot.angvel));

            if let Some(discontinuity) = self.registry.get_mut::<Discontinuity>(local) {
                if let (Some(old_pos), Some(old_orn)) = (old_position, old_orientation) {
                    discontinuity.accumulate(
                        &old_pos.coords,
                        &snapshot.position.coords,
                        &old_orn,
                        &snapshot.orientation,
                    );
                }
            }
            refresh_derived_state(&mut self.registry, local);
            touched.push(local);
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use skerry_types::comp::Shape;

    fn settings() -> SimSettings {
        SimSettings::default()
    }

    fn ground(sim: &mut IslandSim) -> Entity {
        sim.spawn_body(
            &RigidBodyDesc::fixed(Point3::origin()).shape(Shape::plane(Vector3::y(), 0.0)),
        )
    }

    #[test]
    fn test_falling_sphere_lands_on_plane() {
        let mut sim = IslandSim::new(settings());
        ground(&mut sim);
        let ball = sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::new(0.0, 2.0, 0.0)).shape(Shape::sphere(0.5)),
        );

        let dt = sim.settings().fixed_dt;
        for _ in 0..240 {
            sim.full_step(dt);
        }

        let y = sim.registry().get::<Position>(ball).unwrap().y;
        assert_relative_eq!(y, 0.5, epsilon = 0.02);
        let speed = sim.registry().get::<LinVel>(ball).unwrap().norm();
        assert!(speed < 0.05, "ball still moving at {speed}");
    }

    #[test]
    fn test_broadphase_creates_and_destroys_manifolds() {
        let mut sim = IslandSim::new(settings());
        let a = sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::new(0.0, 0.0, 0.0)).shape(Shape::sphere(1.0)),
        );
        let b = sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::new(1.9, 0.0, 0.0)).shape(Shape::sphere(1.0)),
        );

        let candidates = sim.candidate_pairs();
        let outcome = sim.apply_broadphase(&candidates);
        assert_eq!(outcome.created.len(), 1);
        assert!(outcome.changed_topology());

        // Move b far away; the manifold dies on the next pass.
        sim.registry_mut()
            .insert(b, Position(Point3::new(10.0, 0.0, 0.0)));
        crate::body::refresh_derived_state(sim.registry_mut(), b);
        let candidates = sim.candidate_pairs();
        let outcome = sim.apply_broadphase(&candidates);
        assert_eq!(outcome.destroyed.len(), 1);
        assert!(!sim.graph().has_adjacency(
            sim.registry().get::<GraphNode>(a).unwrap().index,
            sim.registry().get::<GraphNode>(b).unwrap().index,
        ));
    }

    #[test]
    fn test_destroy_body_cascades_to_edges() {
        let mut sim = IslandSim::new(settings());
        let a = sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::new(0.0, 0.0, 0.0)).shape(Shape::sphere(1.0)),
        );
        let b = sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::new(1.5, 0.0, 0.0)).shape(Shape::sphere(1.0)),
        );
        let candidates = sim.candidate_pairs();
        let outcome = sim.apply_broadphase(&candidates);
        let manifold = outcome.created[0];

        let destroyed = sim.destroy_entity(a);
        assert!(destroyed.contains(&a));
        assert!(destroyed.contains(&manifold));
        assert!(sim.registry().contains(b));
    }

    #[test]
    fn test_sleep_cycle() {
        let mut sim = IslandSim::new(settings());
        let ball = sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::new(0.0, 0.5, 0.0)).shape(Shape::sphere(0.5)),
        );
        sim.registry_mut()
            .insert(ball, LinVel(Vector3::new(1.0, 0.0, 0.0)));
        assert!(!sim.could_sleep());

        sim.registry_mut().insert(ball, LinVel(Vector3::zeros()));
        assert!(sim.could_sleep());

        let slept = sim.go_to_sleep();
        assert!(slept.contains(&ball));
        assert!(sim.is_sleeping());

        let woken = sim.wake_up(1.0);
        assert_eq!(woken.len(), slept.len());
        assert!(!sim.is_sleeping());
        assert_relative_eq!(sim.island_time(), 1.0);
    }

    #[test]
    fn test_sleeping_disabled_blocks_sleep() {
        let mut sim = IslandSim::new(settings());
        sim.spawn_body(
            &RigidBodyDesc::dynamic(Point3::origin())
                .shape(Shape::sphere(0.5))
                .sleeping_disabled(),
        );
        assert!(!sim.could_sleep());
    }

    #[test]
    fn test_deterministic_two_runs() {
        let run = || {
            let mut sim = IslandSim::new(settings());
            ground(&mut sim);
            let a = sim.spawn_body(
                &RigidBodyDesc::dynamic(Point3::new(-0.4, 1.0, 0.0)).shape(Shape::sphere(0.5)),
            );
            let b = sim.spawn_body(
                &RigidBodyDesc::dynamic(Point3::new(0.4, 1.6, 0.1)).shape(Shape::sphere(0.5)),
            );
            let dt = sim.settings().fixed_dt;
            for _ in 0..120 {
                sim.full_step(dt);
            }
            (
                *sim.registry().get::<Position>(a).unwrap(),
                *sim.registry().get::<Orientation>(a).unwrap(),
                *sim.registry().get::<Position>(b).unwrap(),
                *sim.registry().get::<Orientation>(b).unwrap(),
            )
        };

        let first = run();
        let second = run();
        // Bitwise equality: same ops, same order, same results.
        assert_eq!(first.0 .0, second.0 .0);
        assert_eq!(first.1 .0, second.1 .0);
        assert_eq!(first.2 .0, second.2 .0);
        assert_eq!(first.3 .0, second.3 .0);
    }
}
