//! End-to-end scenarios driving the coordinator with real worker threads.
//!
//! These poll the coordinator with generous timeouts: workers step on wall
//! clock, so assertions wait for conditions instead of counting ticks.

use std::time::{Duration, Instant};

use nalgebra::{Point3, Vector3};

use skerry_core::{IslandCoordinator, RigidBodyDesc};
use skerry_types::comp::{
    AngVel, Constraint, DistanceConstraint, GraphNode, LinVel, Position, ProceduralTag, Shape,
    SleepingTag,
};
use skerry_types::{Entity, SimSettings};

fn wait_until(
    coordinator: &mut IslandCoordinator,
    timeout: Duration,
    mut condition: impl FnMut(&IslandCoordinator) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        coordinator.update();
        if condition(coordinator) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn sphere(position: Point3<f64>, velocity: Vector3<f64>) -> RigidBodyDesc {
    RigidBodyDesc::dynamic(position)
        .shape(Shape::sphere(1.0))
        .velocity(velocity, Vector3::zeros())
}

/// Two dynamic unit cubes stacked on a static ground plane come to rest and
/// the island goes to sleep.
#[test]
fn test_stack_at_rest_sleeps() {
    let settings = SimSettings::default().sleep_thresholds(0.5, 0.05, 0.05);
    let mut coordinator = IslandCoordinator::new(settings, 2).unwrap();

    coordinator.make_body(
        &RigidBodyDesc::fixed(Point3::origin()).shape(Shape::plane(Vector3::y(), 0.0)),
    );
    let cube = Shape::cuboid(Vector3::new(0.5, 0.5, 0.5));
    let lower = coordinator
        .make_body(&RigidBodyDesc::dynamic(Point3::new(0.0, 0.5, 0.0)).shape(cube.clone()));
    let upper =
        coordinator.make_body(&RigidBodyDesc::dynamic(Point3::new(0.0, 1.5, 0.0)).shape(cube));

    let slept = wait_until(&mut coordinator, Duration::from_secs(20), |c| {
        c.island_entities()
            .iter()
            .any(|island| c.registry().has::<SleepingTag>(*island))
    });
    assert!(slept, "stack never went to sleep");

    for body in [lower, upper] {
        let linvel = coordinator.registry().get::<LinVel>(body).unwrap();
        let angvel = coordinator.registry().get::<AngVel>(body).unwrap();
        let energy = linvel.norm_squared() + angvel.norm_squared();
        assert!(energy < 1.0e-4, "body still moving: {energy}");
        assert!(coordinator.registry().has::<SleepingTag>(body));
    }

    coordinator.shutdown().unwrap();
}

/// Two separated spheres fly at each other; once a contact manifold exists
/// between them their islands merge into one.
#[test]
fn test_merge_on_contact() {
    let settings = SimSettings::default().gravity(Vector3::zeros());
    let mut coordinator = IslandCoordinator::new(settings, 2).unwrap();

    let left = coordinator.make_body(&sphere(
        Point3::new(-5.0, 1.0, 0.0),
        Vector3::new(5.0, 0.0, 0.0),
    ));
    let right = coordinator.make_body(&sphere(
        Point3::new(5.0, 1.0, 0.0),
        Vector3::new(-5.0, 0.0, 0.0),
    ));

    coordinator.update();
    assert_eq!(coordinator.island_entities().len(), 2);

    let merged = wait_until(&mut coordinator, Duration::from_secs(10), |c| {
        c.island_entities().len() == 1
    });
    assert!(merged, "islands never merged");

    // The surviving island holds both bodies; every procedural body resides
    // in exactly one island.
    let island = coordinator.island_entities()[0];
    let island_comp = coordinator
        .registry()
        .get::<skerry_types::comp::Island>(island)
        .unwrap();
    assert!(island_comp.nodes.contains(&left));
    assert!(island_comp.nodes.contains(&right));

    for body in [left, right] {
        let islands = coordinator.islands_of(body);
        assert_eq!(islands.len(), 1);
        assert_eq!(islands[0], island);
    }

    coordinator.shutdown().unwrap();
}

/// The inverse: a merged pair is pushed apart, and after the split debounce
/// the coordinator owns two islands whose node sets partition the original.
#[test]
fn test_split_on_separation() {
    let settings = SimSettings::default().gravity(Vector3::zeros());
    let mut coordinator = IslandCoordinator::new(settings, 2).unwrap();

    // Start touching so the first update merges them.
    let left = coordinator.make_body(&sphere(Point3::new(-0.99, 1.0, 0.0), Vector3::zeros()));
    let right = coordinator.make_body(&sphere(Point3::new(0.99, 1.0, 0.0), Vector3::zeros()));

    let merged = wait_until(&mut coordinator, Duration::from_secs(5), |c| {
        c.island_entities().len() == 1
    });
    assert!(merged, "setup never merged");

    // Impulse that breaks the contact.
    coordinator
        .registry_mut()
        .insert(left, LinVel(Vector3::new(-4.0, 0.0, 0.0)));
    coordinator.refresh::<LinVel>(left);
    coordinator
        .registry_mut()
        .insert(right, LinVel(Vector3::new(4.0, 0.0, 0.0)));
    coordinator.refresh::<LinVel>(right);

    let split = wait_until(&mut coordinator, Duration::from_secs(15), |c| {
        c.island_entities().len() == 2
    });
    assert!(split, "island never split");

    // Node sets partition the original pair.
    let mut seen: Vec<Entity> = Vec::new();
    for island in coordinator.island_entities() {
        let comp = coordinator
            .registry()
            .get::<skerry_types::comp::Island>(island)
            .unwrap();
        for node in &comp.nodes {
            assert!(!seen.contains(node), "body in two islands after split");
            seen.push(*node);
        }
    }
    assert!(seen.contains(&left));
    assert!(seen.contains(&right));

    coordinator.shutdown().unwrap();
}

/// Constraint edges keep their bodies alive in the graph: after arbitrary
/// create/destroy sequences, every remaining constraint references live
/// bodies that still have graph nodes.
#[test]
fn test_constraint_edges_reference_live_nodes() {
    let settings = SimSettings::default().gravity(Vector3::zeros()).paused();
    let mut coordinator = IslandCoordinator::new(settings, 1).unwrap();

    let a = coordinator.make_body(&sphere(Point3::new(0.0, 0.0, 0.0), Vector3::zeros()));
    let b = coordinator.make_body(&sphere(Point3::new(3.0, 0.0, 0.0), Vector3::zeros()));
    let c = coordinator.make_body(&sphere(Point3::new(6.0, 0.0, 0.0), Vector3::zeros()));

    let make_joint = |a: Entity, b: Entity| {
        Constraint::Distance(DistanceConstraint {
            body: [a, b],
            pivot: [Vector3::zeros(), Vector3::zeros()],
            distance: 3.0,
            impulse: 0.0,
        })
    };
    coordinator.make_constraint(make_joint(a, b)).unwrap();
    coordinator.make_constraint(make_joint(b, c)).unwrap();
    coordinator.update();

    // Destroying the middle body cascades to both joints.
    coordinator.destroy_entity(b);
    coordinator.update();

    for (_, constraint) in coordinator.registry().iter::<Constraint>() {
        for body in constraint.bodies() {
            assert!(coordinator.registry().contains(body));
            assert!(coordinator.registry().has::<GraphNode>(body));
        }
    }
    assert!(!coordinator.registry().contains(b));

    coordinator.shutdown().unwrap();
}

/// A constraint bridging two islands merges them; every procedural body ends
/// up resident in exactly one island.
#[test]
fn test_constraint_merges_islands() {
    let settings = SimSettings::default().gravity(Vector3::zeros()).paused();
    let mut coordinator = IslandCoordinator::new(settings, 1).unwrap();

    let a = coordinator.make_body(&sphere(Point3::new(0.0, 0.0, 0.0), Vector3::zeros()));
    let b = coordinator.make_body(&sphere(Point3::new(10.0, 0.0, 0.0), Vector3::zeros()));
    coordinator.update();
    assert_eq!(coordinator.island_entities().len(), 2);

    coordinator
        .make_constraint(Constraint::Distance(DistanceConstraint {
            body: [a, b],
            pivot: [Vector3::zeros(), Vector3::zeros()],
            distance: 10.0,
            impulse: 0.0,
        }))
        .unwrap();
    coordinator.update();

    assert_eq!(coordinator.island_entities().len(), 1);
    for body in [a, b] {
        assert!(coordinator.registry().has::<ProceduralTag>(body));
        assert_eq!(coordinator.islands_of(body).len(), 1);
    }

    coordinator.shutdown().unwrap();
}

/// Manual stepping while paused advances exactly when requested.
#[test]
fn test_paused_world_steps_on_request() {
    let settings = SimSettings::default().paused();
    let mut coordinator = IslandCoordinator::new(settings, 1).unwrap();

    let ball = coordinator.make_body(
        &RigidBodyDesc::dynamic(Point3::new(0.0, 10.0, 0.0)).shape(Shape::sphere(0.5)),
    );
    coordinator.update();

    // Give the worker a moment to import the body, then confirm it idles.
    std::thread::sleep(Duration::from_millis(100));
    coordinator.update();
    let before = coordinator.registry().get::<Position>(ball).unwrap().y;

    std::thread::sleep(Duration::from_millis(200));
    coordinator.update();
    let still = coordinator.registry().get::<Position>(ball).unwrap().y;
    assert_eq!(before, still, "paused body moved");

    coordinator.step_simulation();
    let moved = wait_until(&mut coordinator, Duration::from_secs(5), |c| {
        c.registry().get::<Position>(ball).unwrap().y < before
    });
    assert!(moved, "manual step had no effect");

    coordinator.shutdown().unwrap();
}

#[test]
fn test_shutdown_joins_workers() {
    let settings = SimSettings::default();
    let mut coordinator = IslandCoordinator::new(settings, 2).unwrap();
    for i in 0..4 {
        coordinator.make_body(
            &RigidBodyDesc::dynamic(Point3::new(f64::from(i) * 5.0, 1.0, 0.0))
                .shape(Shape::sphere(0.5)),
        );
    }
    coordinator.update();
    coordinator.shutdown().unwrap();
}
