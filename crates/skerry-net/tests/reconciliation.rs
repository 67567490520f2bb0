//! Reconciliation scenarios: snapshot snapping, extrapolation and the
//! entity-request round trip.

use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};

use skerry_core::{now_seconds, IslandCoordinator, IslandSim, RigidBodyDesc};
use skerry_delta::DeltaBuilder;
use skerry_net::{
    run_extrapolation, ClientSettings, ExtrapolationInput, InputFrame, InputHistory,
    NetworkClient, NetworkServer, Packet, ServerSettings,
};
use skerry_types::comp::{
    BodyInput, ComponentId, ComponentPool, Discontinuity, LinVel, NetworkedTag, PoolOps, Position,
    Shape,
};
use skerry_types::{Aabb, Entity, SimSettings};

fn zero_gravity_settings() -> SimSettings {
    SimSettings::default().gravity(Vector3::zeros())
}

fn wide_region() -> Aabb {
    Aabb::from_center(Point3::origin(), Vector3::new(100.0, 100.0, 100.0))
}

/// Route all pending traffic between one client and the server.
fn pump(
    server: &mut NetworkServer,
    server_world: &mut IslandCoordinator,
    server_side_client: Entity,
    client: &mut NetworkClient,
    client_world: &mut IslandCoordinator,
) {
    for packet in client.drain_outbound() {
        // The wire is real: everything round-trips through the codec.
        let bytes = packet.encode().unwrap();
        server.receive(server_world, server_side_client, Packet::decode(&bytes).unwrap());
    }
    for (target, packet) in server.drain_outbound() {
        if target == server_side_client {
            let bytes = packet.encode().unwrap();
            client.receive(client_world, Packet::decode(&bytes).unwrap());
        }
    }
}

/// Snapshot snapping with extrapolation off: the body snaps to the
/// authoritative state and the difference lands in its discontinuity, which
/// then decays multiplicatively.
#[test]
fn test_snap_writes_discontinuity_and_decays() {
    let mut settings = zero_gravity_settings();
    settings.discontinuity_decay_rate = 0.8;
    let mut sim = IslandSim::new(settings);

    // Replicate a body the way a worker receives one, so the sim has a
    // coordinator-space mapping for it.
    let mut source = skerry_registry::Registry::new();
    let remote = source.create();
    RigidBodyDesc::dynamic(Point3::new(0.9, 0.0, 0.0))
        .shape(Shape::sphere(0.5))
        .insert_components(&mut source, remote);
    let mut builder = DeltaBuilder::new();
    builder.created(remote);
    builder.created_all(&source, remote);
    sim.import_delta(&builder.finish());
    let local = sim.entity_map().local_for(remote).unwrap();

    // Authoritative state says x = 1.
    let mut pool = ComponentPool::empty(ComponentId::Position);
    PoolOps::<Position>::push(&mut pool, remote, Position(Point3::new(1.0, 0.0, 0.0)));
    sim.apply_snapshot_pools(&[pool]);

    assert_relative_eq!(sim.registry().get::<Position>(local).unwrap().x, 1.0);
    let offset = sim
        .registry()
        .get::<Discontinuity>(local)
        .unwrap()
        .position_offset;
    assert_relative_eq!(offset.x, -0.1, epsilon = 1e-9);

    // Presentation shows the old position, converging at the decay rate.
    let mut presented = Vec::new();
    for _ in 0..3 {
        let discontinuity = sim.registry().get::<Discontinuity>(local).unwrap();
        presented.push(1.0 + discontinuity.position_offset.x);
        sim.registry_mut()
            .get_mut::<Discontinuity>(local)
            .unwrap()
            .decay(0.8);
    }
    assert_relative_eq!(presented[0], 0.9, epsilon = 1e-9);
    assert_relative_eq!(presented[1], 1.0 - 0.1 * 0.8, epsilon = 1e-9);
    assert_relative_eq!(presented[2], 1.0 - 0.1 * 0.8 * 0.8, epsilon = 1e-9);
}

/// Extrapolation matches a reference integration of the same window.
#[test]
fn test_extrapolation_matches_reference_integration() {
    let settings = zero_gravity_settings();
    let dt = settings.fixed_dt;

    let mut source = skerry_registry::Registry::new();
    let remote = source.create();
    RigidBodyDesc::dynamic(Point3::new(1.0, 0.0, 0.0))
        .shape(Shape::sphere(0.5))
        .velocity(Vector3::new(0.6, 0.0, 0.0), Vector3::zeros())
        .insert_components(&mut source, remote);

    let mut builder = DeltaBuilder::new();
    builder.created(remote);
    builder.created_all(&source, remote);

    let mut position_pool = ComponentPool::empty(ComponentId::Position);
    PoolOps::<Position>::push(
        &mut position_pool,
        remote,
        Position(Point3::new(1.0, 0.0, 0.0)),
    );
    let mut velocity_pool = ComponentPool::empty(ComponentId::LinVel);
    PoolOps::<LinVel>::push(
        &mut velocity_pool,
        remote,
        LinVel(Vector3::new(0.6, 0.0, 0.0)),
    );

    let window = 6.0 * dt;
    let input = ExtrapolationInput {
        entities: vec![remote],
        delta: builder.finish(),
        snapshot: skerry_net::packet::TransientSnapshot {
            timestamp: 0.0,
            pools: vec![
                skerry_net::PoolSnapshot::new(position_pool).unwrap(),
                skerry_net::PoolSnapshot::new(velocity_pool).unwrap(),
            ],
            manifolds: Vec::new(),
        },
        start_time: now_seconds() - window,
        owned: Vec::new(),
        settings,
        budget: 1.0,
    };

    let result = run_extrapolation(&input, &InputHistory::new(16));
    assert!(!result.terminated_early);
    assert_eq!(result.entities, vec![remote]);

    // Reference: x = 1 + 0.6 · window. The job may take one extra step if
    // the wall clock moved while it ran.
    let expected = 1.0 + 0.6 * window;
    let actual = result.snapshots[0].position.x;
    assert!(
        (actual - expected).abs() < 0.6 * 2.0 * dt,
        "extrapolated {actual}, reference {expected}"
    );
}

/// Buffered inputs are replayed at their recorded sub-steps.
#[test]
fn test_extrapolation_replays_input_history() {
    let settings = zero_gravity_settings();
    let dt = settings.fixed_dt;

    let mut source = skerry_registry::Registry::new();
    let remote = source.create();
    RigidBodyDesc::dynamic(Point3::origin())
        .shape(Shape::sphere(0.5))
        .insert_components(&mut source, remote);

    let mut builder = DeltaBuilder::new();
    builder.created(remote);
    builder.created_all(&source, remote);

    let window = 12.0 * dt;
    let start_time = now_seconds() - window;

    // A constant 6 N push across the whole window.
    let history = InputHistory::new(64);
    for i in 0..12 {
        history.emplace(InputFrame {
            timestamp: start_time + f64::from(i) * dt + dt * 0.5,
            inputs: vec![(
                remote,
                BodyInput {
                    force: Vector3::new(6.0, 0.0, 0.0),
                    torque: Vector3::zeros(),
                },
            )],
        });
    }

    let input = ExtrapolationInput {
        entities: vec![remote],
        delta: builder.finish(),
        snapshot: skerry_net::packet::TransientSnapshot {
            timestamp: 0.0,
            pools: Vec::new(),
            manifolds: Vec::new(),
        },
        start_time,
        owned: vec![remote],
        settings,
        budget: 1.0,
    };

    let result = run_extrapolation(&input, &history);
    assert!(!result.terminated_early);
    // Δv ≈ F·t = 6 · 0.2 = 1.2 m/s, modulo one step of slack.
    let speed = result.snapshots[0].linvel.x;
    assert!(speed > 0.6, "input replay had no effect: {speed}");
}

/// The entity-request round trip: a snapshot referencing an unknown entity
/// triggers exactly one request; the response installs mappings; later
/// snapshots need no further requests.
#[test]
fn test_entity_request_round_trip() {
    let mut server_world =
        IslandCoordinator::new(zero_gravity_settings().paused(), 1).unwrap();
    let mut client_world =
        IslandCoordinator::new(zero_gravity_settings().paused(), 1).unwrap();
    let mut server = NetworkServer::new(ServerSettings::default());
    let mut client = NetworkClient::new(ClientSettings::default().without_extrapolation());

    // Region that sees nothing, so creation packets don't preempt the
    // request flow.
    let empty_region = Aabb::from_center(Point3::new(500.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
    let client_id = server.make_client(&mut server_world, empty_region);
    server.update(&mut server_world);
    pump(
        &mut server,
        &mut server_world,
        client_id,
        &mut client,
        &mut client_world,
    );
    assert!(client.client_entity().is_some());

    // A networked body the client has never heard of.
    let body = server_world.make_body(
        &RigidBodyDesc::dynamic(Point3::new(2.0, 0.0, 0.0))
            .shape(Shape::sphere(0.5))
            .networked(),
    );
    server_world.update();

    // Hand-deliver a transient snapshot referencing it.
    let mut pool = ComponentPool::empty(ComponentId::Position);
    PoolOps::<Position>::push(&mut pool, body, Position(Point3::new(2.0, 0.0, 0.0)));
    let snapshot = Packet::TransientSnapshot(skerry_net::packet::TransientSnapshot {
        timestamp: now_seconds(),
        pools: vec![skerry_net::PoolSnapshot::new(pool.clone()).unwrap()],
        manifolds: Vec::new(),
    });
    client.receive(&mut client_world, snapshot.clone());

    let outbound = client.drain_outbound();
    let requests: Vec<_> = outbound
        .iter()
        .filter(|p| matches!(p, Packet::EntityRequest(_)))
        .collect();
    assert_eq!(requests.len(), 1, "expected exactly one entity request");

    // Duplicate snapshot before the response: no duplicate request.
    client.receive(&mut client_world, snapshot.clone());
    assert!(client
        .drain_outbound()
        .iter()
        .all(|p| !matches!(p, Packet::EntityRequest(_))));

    // Deliver the request, pump the response back.
    for packet in outbound {
        server.receive(&mut server_world, client_id, packet);
    }
    let mut got_response = false;
    for (target, packet) in server.drain_outbound() {
        assert_eq!(target, client_id);
        if matches!(packet, Packet::EntityResponse(_)) {
            got_response = true;
            client.receive(&mut client_world, packet);
        }
    }
    assert!(got_response, "server never answered the request");

    // The response created a local replica: mapping installed, components
    // imported, and the replica tagged as networked.
    assert!(
        client.entity_map().has_remote(body),
        "response did not install a mapping"
    );
    let local = client.entity_map().local_for(body).unwrap();
    assert!(client_world.registry().contains(local));
    assert!(
        client_world.registry().has::<NetworkedTag>(local),
        "replica from entity response is not tagged networked"
    );
    assert_relative_eq!(
        client_world.registry().get::<Position>(local).unwrap().x,
        2.0,
        epsilon = 1e-9
    );

    // The client reported its fresh handle back so the server can address
    // it from now on.
    let replies = client.drain_outbound();
    let mapped_back = replies.iter().any(|p| match p {
        Packet::UpdateEntityMap(map) => map.pairs.contains(&(body, local)),
        _ => false,
    });
    assert!(mapped_back, "no entity-map reply for the new replica");
    for packet in replies {
        server.receive(&mut server_world, client_id, packet);
    }

    // From now on snapshots process without further requests.
    client.receive(&mut client_world, snapshot);
    assert!(client
        .drain_outbound()
        .iter()
        .all(|p| !matches!(p, Packet::EntityRequest(_))));

    server_world.shutdown().unwrap();
    client_world.shutdown().unwrap();
}

/// Full loop: a server-side body is replicated into the client's world and
/// transient snapshots keep the replica tracking the authoritative state.
#[test]
fn test_end_to_end_replication_tracks_server() {
    let mut server_world = IslandCoordinator::new(zero_gravity_settings(), 2).unwrap();
    let mut client_world = IslandCoordinator::new(zero_gravity_settings(), 2).unwrap();
    let mut server = NetworkServer::new(ServerSettings::default());
    let mut client = NetworkClient::new(ClientSettings::default().without_extrapolation());

    let client_id = server.make_client(&mut server_world, wide_region());

    let body = server_world.make_body(
        &RigidBodyDesc::dynamic(Point3::new(0.0, 1.0, 0.0))
            .shape(Shape::sphere(0.5))
            .velocity(Vector3::new(0.5, 0.0, 0.0), Vector3::zeros())
            .networked(),
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut tracked = false;
    while Instant::now() < deadline {
        server.update(&mut server_world);
        server_world.update();
        client.update(&mut client_world);
        client_world.update();
        pump(
            &mut server,
            &mut server_world,
            client_id,
            &mut client,
            &mut client_world,
        );

        if let Some(local) = client.entity_map().local_for(body) {
            let server_x = server_world.registry().get::<Position>(body).map(|p| p.x);
            let client_x = client_world.registry().get::<Position>(local).map(|p| p.x);
            if let (Some(server_x), Some(client_x)) = (server_x, client_x) {
                // The body drifts at 0.5 m/s; accept a generous tracking
                // window that still proves snapshots keep arriving.
                if server_x > 0.5 && (server_x - client_x).abs() < 0.5 {
                    tracked = true;
                    break;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(tracked, "replica never tracked the server state");

    server_world.shutdown().unwrap();
    client_world.shutdown().unwrap();
}

/// Ownership: a client may not overwrite state in islands it does not own,
/// but entities it created are fully under its control.
#[test]
fn test_server_discards_unowned_updates() {
    let mut server_world =
        IslandCoordinator::new(zero_gravity_settings().paused(), 1).unwrap();
    let mut client_world =
        IslandCoordinator::new(zero_gravity_settings().paused(), 1).unwrap();
    let mut server = NetworkServer::new(ServerSettings::default());
    let mut client = NetworkClient::new(ClientSettings::default().without_extrapolation());

    let client_id = server.make_client(&mut server_world, wide_region());
    server.update(&mut server_world);
    pump(
        &mut server,
        &mut server_world,
        client_id,
        &mut client,
        &mut client_world,
    );

    // A server-owned body replicated to the client.
    let server_body = server_world.make_body(
        &RigidBodyDesc::dynamic(Point3::new(0.0, 1.0, 0.0))
            .shape(Shape::sphere(0.5))
            .networked(),
    );
    server_world.update();
    server.update(&mut server_world);
    pump(
        &mut server,
        &mut server_world,
        client_id,
        &mut client,
        &mut client_world,
    );
    let local_replica = client
        .entity_map()
        .local_for(server_body)
        .expect("replica was not created");

    // The client tries to teleport the server's body.
    client_world
        .registry_mut()
        .insert(local_replica, Position(Point3::new(50.0, 0.0, 0.0)));
    client_world.refresh::<Position>(local_replica);
    client.update(&mut client_world);

    // Hand-build the malicious transient snapshot (position is transient).
    let mut pool = ComponentPool::empty(ComponentId::Position);
    PoolOps::<Position>::push(
        &mut pool,
        local_replica,
        Position(Point3::new(50.0, 0.0, 0.0)),
    );
    server.receive(
        &mut server_world,
        client_id,
        Packet::TransientSnapshot(skerry_net::packet::TransientSnapshot {
            timestamp: now_seconds(),
            pools: vec![skerry_net::PoolSnapshot::new(pool).unwrap()],
            manifolds: Vec::new(),
        }),
    );
    server.update(&mut server_world);
    server_world.update();

    // Give any (incorrectly) forwarded snapshot time to land.
    std::thread::sleep(Duration::from_millis(100));
    server_world.update();
    let x = server_world
        .registry()
        .get::<Position>(server_body)
        .unwrap()
        .x;
    assert_relative_eq!(x, 0.0, epsilon = 1e-6);

    server_world.shutdown().unwrap();
    client_world.shutdown().unwrap();
}
