//! Wire packets.
//!
//! Every variant is serde-serializable; `bincode` is the reference codec.
//! Pools on the wire are addressed by the ordinal of their component kind in
//! the registered-networked-components list — both endpoints must derive the
//! same ordering from the catalog, and unknown ordinals are a protocol error
//! handled by dropping the packet.

use serde::{Deserialize, Serialize};

use skerry_registry::Registry;
use skerry_types::comp::{ComponentId, ComponentPool, ContactManifold};
use skerry_types::Entity;

use crate::error::NetError;

/// One component pool on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Ordinal into the registered-networked-components list.
    pub component_index: u16,
    /// The entries.
    pub pool: ComponentPool,
}

impl PoolSnapshot {
    /// Wrap a pool, rejecting non-networked kinds.
    pub fn new(pool: ComponentPool) -> Result<Self, NetError> {
        let id = pool.component_id();
        let component_index = id
            .wire_index()
            .ok_or(NetError::NotNetworked { id })?;
        Ok(Self {
            component_index,
            pool,
        })
    }

    /// The component kind, rejecting unknown or local ordinals.
    pub fn component_id(&self) -> Result<ComponentId, NetError> {
        ComponentId::from_wire_index(self.component_index).ok_or(NetError::UnknownComponentIndex {
            index: self.component_index,
        })
    }

    /// Validate that the ordinal matches the pool's actual kind.
    pub fn validate(&self) -> Result<(), NetError> {
        let id = self.component_id()?;
        if id == self.pool.component_id() {
            Ok(())
        } else {
            Err(NetError::PoolKindMismatch {
                index: self.component_index,
                actual: self.pool.component_id(),
            })
        }
    }
}

/// Clone one networked component of an entity into `pools`, creating the
/// pool on first use.
pub fn export_component(
    registry: &Registry,
    entity: Entity,
    id: ComponentId,
    pools: &mut Vec<PoolSnapshot>,
) {
    let Some(wire) = id.wire_index() else {
        return;
    };
    if let Some(snapshot) = pools.iter_mut().find(|p| p.component_index == wire) {
        registry.clone_into_pool(entity, &mut snapshot.pool);
        return;
    }
    let mut pool = ComponentPool::empty(id);
    if registry.clone_into_pool(entity, &mut pool) {
        pools.push(PoolSnapshot {
            component_index: wire,
            pool,
        });
    }
}

/// Clone every networked component of an entity into `pools`.
pub fn export_all(registry: &Registry, entity: Entity, pools: &mut Vec<PoolSnapshot>) {
    registry.for_each_present(entity, |id| {
        if id.is_networked() {
            export_component(registry, entity, id, pools);
        }
    });
}

/// Clone the transient components of an entity into `pools`.
pub fn export_transient(registry: &Registry, entity: Entity, pools: &mut Vec<PoolSnapshot>) {
    registry.for_each_present(entity, |id| {
        if id.is_networked() && id.is_transient() {
            export_component(registry, entity, id, pools);
        }
    });
}

/// Sort pools by component ordinal so receivers construct dependencies
/// before dependents.
pub fn sort_pools(pools: &mut [PoolSnapshot]) {
    pools.sort_by_key(|p| p.component_index);
}

/// The client entity assigned by the server on connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCreated {
    /// The client's entity in server space.
    pub client_entity: Entity,
}

/// New remote ↔ local pairs for the peer's entity map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntityMap {
    /// `(receiver-space, sender-space)` pairs: the receiver folds each in as
    /// "their handle `.1` is my entity `.0`".
    pub pairs: Vec<(Entity, Entity)>,
    /// Send time on the sender's clock.
    pub timestamp: f64,
}

/// Full replication of freshly created entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEntity {
    /// Send time on the sender's clock.
    pub timestamp: f64,
    /// The created entities, sender space.
    pub entities: Vec<Entity>,
    /// Their networked components, sorted by component ordinal.
    pub pools: Vec<PoolSnapshot>,
}

/// Destruction of entities the receiver knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyEntity {
    /// Send time on the sender's clock.
    pub timestamp: f64,
    /// The destroyed entities, sender space.
    pub entities: Vec<Entity>,
}

/// Per-tick state of continuously changing components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientSnapshot {
    /// Send time on the sender's clock.
    pub timestamp: f64,
    /// Transient component pools.
    pub pools: Vec<PoolSnapshot>,
    /// Contact manifolds of the covered islands.
    pub manifolds: Vec<(Entity, ContactManifold)>,
}

impl TransientSnapshot {
    /// Every entity referenced by the snapshot's pools.
    #[must_use]
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        for snapshot in &self.pools {
            snapshot.pool.for_each_entity(|e| {
                if !entities.contains(&e) {
                    entities.push(e);
                }
            });
        }
        entities
    }

    /// Rewrite every entity through `f`, dropping entries it rejects.
    pub fn convert_entities(&mut self, f: &mut dyn FnMut(Entity) -> Option<Entity>) {
        for snapshot in &mut self.pools {
            snapshot.pool.retain_entities(|e| f(e).is_some());
            snapshot
                .pool
                .map_entities(&mut |e| f(e).unwrap_or(e));
        }
        self.manifolds.retain_mut(|(entity, manifold)| {
            let Some(local) = f(*entity) else {
                return false;
            };
            *entity = local;
            let (Some(a), Some(b)) = (f(manifold.body[0]), f(manifold.body[1])) else {
                return false;
            };
            manifold.body = [a, b];
            true
        });
    }
}

/// State of dirty, non-transient components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSnapshot {
    /// Send time on the sender's clock.
    pub timestamp: f64,
    /// Dirty component pools.
    pub pools: Vec<PoolSnapshot>,
}

/// Request for entities the sender does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRequest {
    /// The unknown entities, receiver space.
    pub entities: Vec<Entity>,
}

/// Response to an [`EntityRequest`]: the entities plus everything in their
/// islands, fully replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResponse {
    /// The entities, sender space.
    pub entities: Vec<Entity>,
    /// Their networked components, sorted by component ordinal.
    pub pools: Vec<PoolSnapshot>,
}

/// Server-chosen playout delay for the client's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetPlayoutDelay {
    /// Seconds of delay.
    pub value: f64,
}

/// Clock-sync probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRequest {
    /// Correlates the response to this request.
    pub id: u32,
    /// Send time on the sender's clock.
    pub timestamp: f64,
}

/// Clock-sync reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeResponse {
    /// Echoed request id.
    pub id: u32,
    /// The responder's clock at reply time.
    pub timestamp: f64,
}

/// The closed set of wire packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Client entity assignment, server → client.
    ClientCreated(ClientCreated),
    /// Entity map maintenance.
    UpdateEntityMap(UpdateEntityMap),
    /// Entity creation with full pools.
    CreateEntity(CreateEntity),
    /// Entity destruction.
    DestroyEntity(DestroyEntity),
    /// Continuous state.
    TransientSnapshot(TransientSnapshot),
    /// Dirty steady state.
    GeneralSnapshot(GeneralSnapshot),
    /// Unknown-entity request.
    EntityRequest(EntityRequest),
    /// Unknown-entity response.
    EntityResponse(EntityResponse),
    /// Playout delay assignment, server → client.
    SetPlayoutDelay(SetPlayoutDelay),
    /// Clock probe.
    TimeRequest(TimeRequest),
    /// Clock reply.
    TimeResponse(TimeResponse),
}

impl Packet {
    /// Timed packets are queued by adjusted timestamp; the rest are
    /// processed on receipt.
    #[must_use]
    pub fn is_timed(&self) -> bool {
        self.timestamp().is_some()
    }

    /// The embedded send timestamp of timed packets.
    #[must_use]
    pub fn timestamp(&self) -> Option<f64> {
        match self {
            Self::CreateEntity(p) => Some(p.timestamp),
            Self::DestroyEntity(p) => Some(p.timestamp),
            Self::TransientSnapshot(p) => Some(p.timestamp),
            Self::GeneralSnapshot(p) => Some(p.timestamp),
            Self::ClientCreated(_)
            | Self::UpdateEntityMap(_)
            | Self::EntityRequest(_)
            | Self::EntityResponse(_)
            | Self::SetPlayoutDelay(_)
            | Self::TimeRequest(_)
            | Self::TimeResponse(_) => None,
        }
    }

    /// Encode with the reference codec.
    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        bincode::serialize(self).map_err(|e| NetError::Codec {
            reason: e.to_string(),
        })
    }

    /// Decode with the reference codec.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        bincode::deserialize(bytes).map_err(|e| NetError::Codec {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use skerry_types::comp::{PoolOps, Position};

    fn entity(index: u32) -> Entity {
        Entity::from_parts(index, 0)
    }

    #[test]
    fn test_every_variant_round_trips() {
        let mut pool = ComponentPool::empty(ComponentId::Position);
        PoolOps::<Position>::push(&mut pool, entity(1), Position(Point3::new(1.0, 2.0, 3.0)));
        let pools = vec![PoolSnapshot::new(pool).unwrap()];

        let packets = vec![
            Packet::ClientCreated(ClientCreated {
                client_entity: entity(9),
            }),
            Packet::UpdateEntityMap(UpdateEntityMap {
                pairs: vec![(entity(1), entity(2))],
                timestamp: 1.5,
            }),
            Packet::CreateEntity(CreateEntity {
                timestamp: 2.0,
                entities: vec![entity(1)],
                pools: pools.clone(),
            }),
            Packet::DestroyEntity(DestroyEntity {
                timestamp: 2.5,
                entities: vec![entity(1)],
            }),
            Packet::TransientSnapshot(TransientSnapshot {
                timestamp: 3.0,
                pools: pools.clone(),
                manifolds: vec![(entity(5), ContactManifold::new([entity(1), entity(2)]))],
            }),
            Packet::GeneralSnapshot(GeneralSnapshot {
                timestamp: 3.5,
                pools,
            }),
            Packet::EntityRequest(EntityRequest {
                entities: vec![entity(7)],
            }),
            Packet::EntityResponse(EntityResponse {
                entities: vec![entity(7)],
                pools: Vec::new(),
            }),
            Packet::SetPlayoutDelay(SetPlayoutDelay { value: 0.05 }),
            Packet::TimeRequest(TimeRequest {
                id: 4,
                timestamp: 10.0,
            }),
            Packet::TimeResponse(TimeResponse {
                id: 4,
                timestamp: 10.2,
            }),
        ];

        for packet in packets {
            let bytes = packet.encode().unwrap();
            let back = Packet::decode(&bytes).unwrap();
            assert_eq!(packet, back);
        }
    }

    #[test]
    fn test_timed_classification() {
        assert!(Packet::CreateEntity(CreateEntity {
            timestamp: 0.0,
            entities: Vec::new(),
            pools: Vec::new(),
        })
        .is_timed());
        assert!(!Packet::TimeRequest(TimeRequest {
            id: 0,
            timestamp: 0.0
        })
        .is_timed());
        assert!(!Packet::EntityRequest(EntityRequest {
            entities: Vec::new()
        })
        .is_timed());
    }

    #[test]
    fn test_pool_snapshot_rejects_local_kinds() {
        let pool = ComponentPool::empty(ComponentId::Aabb);
        assert!(PoolSnapshot::new(pool).is_err());
    }

    #[test]
    fn test_pool_snapshot_detects_mismatched_index() {
        let pool = ComponentPool::empty(ComponentId::Position);
        let mut snapshot = PoolSnapshot::new(pool).unwrap();
        snapshot.component_index = ComponentId::LinVel.wire_index().unwrap();
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_export_helpers() {
        let mut registry = Registry::new();
        let e = registry.create();
        registry.insert(e, Position(Point3::new(4.0, 0.0, 0.0)));
        registry.insert(e, skerry_types::comp::DynamicTag);
        registry.insert(e, skerry_types::comp::Shape::sphere(1.0));

        let mut pools = Vec::new();
        export_all(&registry, e, &mut pools);
        sort_pools(&mut pools);
        assert!(pools.len() >= 3);
        assert!(pools.windows(2).all(|w| w[0].component_index <= w[1].component_index));

        let mut transient = Vec::new();
        export_transient(&registry, e, &mut transient);
        assert_eq!(transient.len(), 1);
        assert_eq!(
            transient[0].component_id().unwrap(),
            ComponentId::Position
        );
    }
}
