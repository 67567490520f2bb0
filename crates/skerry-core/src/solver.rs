//! Sequential-impulse constraint solver and integrator.
//!
//! One step: external forces → row preparation (with warm starting from the
//! impulses accumulated on the constraint components) → a fixed number of
//! velocity iterations → impulse write-back → position integration → derived
//! state refresh. Fixed iteration counts keep a step deterministic for a
//! given registry state.

use hashbrown::HashMap;
use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

use skerry_registry::Registry;
use skerry_types::comp::{
    AngVel, BodyInput, Constraint, ContactManifold, DynamicTag, Inertia, KinematicTag, LinVel,
    Mass, Orientation, Origin, Position, SleepingTag,
};
use skerry_types::{Entity, SimSettings};

use crate::body::refresh_derived_state;

const BAUMGARTE: f64 = 0.2;
const PENETRATION_SLOP: f64 = 0.005;
const RESTITUTION_SPEED_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone)]
struct SolverBody {
    entity: Entity,
    position: Point3<f64>,
    orientation: UnitQuaternion<f64>,
    origin: Point3<f64>,
    linvel: Vector3<f64>,
    angvel: Vector3<f64>,
    inv_mass: f64,
    inv_inertia: Matrix3<f64>,
    dynamic: bool,
    kinematic: bool,
}

#[derive(Debug, Clone, Copy)]
enum RowKind {
    /// Linear jacobian along `dir` with lever arms from each center of mass.
    Linear {
        ra: Vector3<f64>,
        rb: Vector3<f64>,
    },
    /// Angular jacobian along `dir` only.
    Angular,
}

#[derive(Debug, Clone, Copy)]
enum RowSource {
    ContactNormal { edge: Entity, point: usize },
    ContactFriction { edge: Entity, point: usize, axis: usize },
    DistanceImpulse { edge: Entity },
    PointImpulse { edge: Entity, axis: usize },
    HingePoint { edge: Entity, axis: usize },
    HingeAngular { edge: Entity, axis: usize },
    GenericLinear { edge: Entity, axis: usize },
    GenericAngular { edge: Entity, axis: usize },
}

#[derive(Debug, Clone)]
struct Row {
    a: usize,
    b: usize,
    dir: Vector3<f64>,
    kind: RowKind,
    bias: f64,
    lower: f64,
    upper: f64,
    eff_mass: f64,
    impulse: f64,
    /// For friction rows: the row whose impulse bounds this one, and μ.
    friction_of: Option<(usize, f64)>,
    source: RowSource,
}

/// Run one fixed step over every awake body and constraint in the registry.
pub fn step(registry: &mut Registry, settings: &SimSettings, dt: f64) {
    let (mut bodies, index_of) = gather_bodies(registry);
    if bodies.is_empty() {
        return;
    }

    apply_external_forces(registry, &mut bodies, settings, dt);

    let mut rows = Vec::new();
    prepare_constraint_rows(registry, &mut bodies, &index_of, &mut rows, dt);
    prepare_contact_rows(registry, &bodies, &index_of, &mut rows, dt);

    warm_start(&mut bodies, &rows);

    for _ in 0..settings.velocity_iterations.max(1) {
        solve_iteration(&mut bodies, &mut rows);
    }

    write_back_impulses(registry, &rows);
    integrate_and_scatter(registry, &mut bodies, dt);
}

fn gather_bodies(registry: &Registry) -> (Vec<SolverBody>, HashMap<Entity, usize>) {
    let mut bodies = Vec::new();
    let mut index_of = HashMap::new();

    for (entity, position) in registry.iter::<Position>() {
        if registry.has::<SleepingTag>(entity) {
            continue;
        }
        let Some(orientation) = registry.get::<Orientation>(entity) else {
            continue;
        };
        let mass = registry.get::<Mass>(entity);
        let inertia = registry.get::<Inertia>(entity);
        let dynamic = registry.has::<DynamicTag>(entity);
        let kinematic = registry.has::<KinematicTag>(entity);

        let body = SolverBody {
            entity,
            position: position.0,
            orientation: orientation.0,
            origin: registry
                .get::<Origin>(entity)
                .map_or(position.0, |o| o.0),
            linvel: registry.get::<LinVel>(entity).map_or_else(Vector3::zeros, |v| v.0),
            angvel: registry.get::<AngVel>(entity).map_or_else(Vector3::zeros, |v| v.0),
            inv_mass: if dynamic { mass.map_or(1.0, |m| m.inv) } else { 0.0 },
            inv_inertia: if dynamic {
                inertia.map_or_else(Matrix3::identity, |i| i.inv_world)
            } else {
                Matrix3::zeros()
            },
            dynamic,
            kinematic,
        };
        index_of.insert(entity, bodies.len());
        bodies.push(body);
    }

    (bodies, index_of)
}

fn apply_external_forces(
    registry: &Registry,
    bodies: &mut [SolverBody],
    settings: &SimSettings,
    dt: f64,
) {
    for body in bodies.iter_mut() {
        if !body.dynamic {
            continue;
        }
        body.linvel += settings.gravity * dt;
        if let Some(input) = registry.get::<BodyInput>(body.entity) {
            body.linvel += input.force * body.inv_mass * dt;
            body.angvel += body.inv_inertia * input.torque * dt;
        }
    }
}

fn effective_mass(bodies: &[SolverBody], row: &Row) -> f64 {
    let a = &bodies[row.a];
    let b = &bodies[row.b];
    match row.kind {
        RowKind::Linear { ra, rb } => {
            let ta = ra.cross(&row.dir);
            let tb = rb.cross(&row.dir);
            a.inv_mass + b.inv_mass + ta.dot(&(a.inv_inertia * ta)) + tb.dot(&(b.inv_inertia * tb))
        }
        RowKind::Angular => {
            row.dir.dot(&(a.inv_inertia * row.dir)) + row.dir.dot(&(b.inv_inertia * row.dir))
        }
    }
}

fn relative_velocity(bodies: &[SolverBody], row: &Row) -> f64 {
    let a = &bodies[row.a];
    let b = &bodies[row.b];
    match row.kind {
        RowKind::Linear { ra, rb } => {
            let va = a.linvel + a.angvel.cross(&ra);
            let vb = b.linvel + b.angvel.cross(&rb);
            row.dir.dot(&(va - vb))
        }
        RowKind::Angular => row.dir.dot(&(a.angvel - b.angvel)),
    }
}

fn apply_impulse(bodies: &mut [SolverBody], row: &Row, lambda: f64) {
    match row.kind {
        RowKind::Linear { ra, rb } => {
            let impulse = row.dir * lambda;
            let a = &mut bodies[row.a];
            let (inv_mass_a, inv_inertia_a) = (a.inv_mass, a.inv_inertia);
            a.linvel += impulse * inv_mass_a;
            a.angvel += inv_inertia_a * ra.cross(&impulse);
            let b = &mut bodies[row.b];
            let (inv_mass_b, inv_inertia_b) = (b.inv_mass, b.inv_inertia);
            b.linvel -= impulse * inv_mass_b;
            b.angvel -= inv_inertia_b * rb.cross(&impulse);
        }
        RowKind::Angular => {
            let impulse = row.dir * lambda;
            let a = &mut bodies[row.a];
            let inv_inertia_a = a.inv_inertia;
            a.angvel += inv_inertia_a * impulse;
            let b = &mut bodies[row.b];
            let inv_inertia_b = b.inv_inertia;
            b.angvel -= inv_inertia_b * impulse;
        }
    }
}

fn push_row(rows: &mut Vec<Row>, bodies: &[SolverBody], mut row: Row) {
    row.eff_mass = effective_mass(bodies, &row);
    if row.eff_mass > 1.0e-12 {
        rows.push(row);
    }
}

fn tangent_basis(normal: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let t1 = if normal.x.abs() > 0.9 {
        Vector3::y().cross(normal).normalize()
    } else {
        Vector3::x().cross(normal).normalize()
    };
    let t2 = normal.cross(&t1);
    (t1, t2)
}

#[allow(clippy::too_many_lines)]
fn prepare_constraint_rows(
    registry: &mut Registry,
    bodies: &mut [SolverBody],
    index_of: &HashMap<Entity, usize>,
    rows: &mut Vec<Row>,
    dt: f64,
) {
    let edges: Vec<(Entity, Constraint)> = registry
        .iter::<Constraint>()
        .map(|(e, c)| (e, c.clone()))
        .collect();

    for (edge, constraint) in edges {
        let [body_a, body_b] = constraint.bodies();
        let (Some(&ia), Some(&ib)) = (index_of.get(&body_a), index_of.get(&body_b)) else {
            continue;
        };

        match constraint {
            Constraint::Null(_) | Constraint::Contact(_) => {}
            Constraint::Gravity(c) => {
                // Direct mutual attraction; no iterative row.
                let (pa, pb) = (bodies[ia].position, bodies[ib].position);
                let delta = pb - pa;
                let dist_sq = delta.norm_squared().max(1.0e-6);
                let dir = delta / dist_sq.sqrt();
                let accel = c.magnitude / dist_sq;
                if bodies[ia].dynamic {
                    bodies[ia].linvel += dir * accel * dt;
                }
                if bodies[ib].dynamic {
                    bodies[ib].linvel -= dir * accel * dt;
                }
            }
            Constraint::Distance(c) => {
                let (anchor_a, ra) = world_anchor(&bodies[ia], &c.pivot[0]);
                let (anchor_b, rb) = world_anchor(&bodies[ib], &c.pivot[1]);
                let delta = anchor_a - anchor_b;
                let length = delta.norm();
                let dir = if length > 1.0e-9 {
                    delta / length
                } else {
                    Vector3::y()
                };
                push_row(
                    rows,
                    bodies,
                    Row {
                        a: ia,
                        b: ib,
                        dir,
                        kind: RowKind::Linear { ra, rb },
                        bias: BAUMGARTE / dt * (length - c.distance),
                        lower: f64::NEG_INFINITY,
                        upper: f64::INFINITY,
                        eff_mass: 0.0,
                        impulse: c.impulse,
                        friction_of: None,
                        source: RowSource::DistanceImpulse { edge },
                    },
                );
            }
            Constraint::SoftDistance(c) => {
                // Spring-damper applied as a direct impulse at prepare time.
                let (anchor_a, ra) = world_anchor(&bodies[ia], &c.pivot[0]);
                let (anchor_b, rb) = world_anchor(&bodies[ib], &c.pivot[1]);
                let delta = anchor_a - anchor_b;
                let length = delta.norm();
                let dir = if length > 1.0e-9 {
                    delta / length
                } else {
                    Vector3::y()
                };
                let va = bodies[ia].linvel + bodies[ia].angvel.cross(&ra);
                let vb = bodies[ib].linvel + bodies[ib].angvel.cross(&rb);
                let speed = dir.dot(&(va - vb));
                let force = -c.stiffness * (length - c.distance) - c.damping * speed;
                let impulse = force * dt;

                let spring_row = Row {
                    a: ia,
                    b: ib,
                    dir,
                    kind: RowKind::Linear { ra, rb },
                    bias: 0.0,
                    lower: f64::NEG_INFINITY,
                    upper: f64::INFINITY,
                    eff_mass: 1.0,
                    impulse: 0.0,
                    friction_of: None,
                    source: RowSource::DistanceImpulse { edge },
                };
                apply_impulse(bodies, &spring_row, impulse);
                if let Some(Constraint::SoftDistance(stored)) =
                    registry.get_mut::<Constraint>(edge)
                {
                    stored.impulse = impulse;
                }
            }
            Constraint::Point(c) => {
                let (anchor_a, ra) = world_anchor(&bodies[ia], &c.pivot[0]);
                let (anchor_b, rb) = world_anchor(&bodies[ib], &c.pivot[1]);
                let error = anchor_a - anchor_b;
                for (axis, dir) in [Vector3::x(), Vector3::y(), Vector3::z()]
                    .into_iter()
                    .enumerate()
                {
                    push_row(
                        rows,
                        bodies,
                        Row {
                            a: ia,
                            b: ib,
                            dir,
                            kind: RowKind::Linear { ra, rb },
                            bias: BAUMGARTE / dt * error[axis],
                            lower: f64::NEG_INFINITY,
                            upper: f64::INFINITY,
                            eff_mass: 0.0,
                            impulse: c.applied_impulse[axis],
                            friction_of: None,
                            source: RowSource::PointImpulse { edge, axis },
                        },
                    );
                }
            }
            Constraint::Hinge(c) => {
                let (anchor_a, ra) = world_anchor(&bodies[ia], &c.pivot[0]);
                let (anchor_b, rb) = world_anchor(&bodies[ib], &c.pivot[1]);
                let error = anchor_a - anchor_b;
                for (axis, dir) in [Vector3::x(), Vector3::y(), Vector3::z()]
                    .into_iter()
                    .enumerate()
                {
                    push_row(
                        rows,
                        bodies,
                        Row {
                            a: ia,
                            b: ib,
                            dir,
                            kind: RowKind::Linear { ra, rb },
                            bias: BAUMGARTE / dt * error[axis],
                            lower: f64::NEG_INFINITY,
                            upper: f64::INFINITY,
                            eff_mass: 0.0,
                            impulse: c.applied_impulse[axis],
                            friction_of: None,
                            source: RowSource::HingePoint { edge, axis },
                        },
                    );
                }

                let axis_a = bodies[ia].orientation * c.axis[0];
                let axis_b = bodies[ib].orientation * c.axis[1];
                let misalign = axis_a.cross(&axis_b);
                let (t1, t2) = tangent_basis(&axis_a);
                for (axis, dir) in [t1, t2].into_iter().enumerate() {
                    push_row(
                        rows,
                        bodies,
                        Row {
                            a: ia,
                            b: ib,
                            dir,
                            kind: RowKind::Angular,
                            bias: -BAUMGARTE / dt * dir.dot(&misalign),
                            lower: f64::NEG_INFINITY,
                            upper: f64::INFINITY,
                            eff_mass: 0.0,
                            impulse: c.angular_impulse[axis],
                            friction_of: None,
                            source: RowSource::HingeAngular { edge, axis },
                        },
                    );
                }
            }
            Constraint::Generic(c) => {
                let (anchor_a, ra) = world_anchor(&bodies[ia], &c.pivot[0]);
                let (anchor_b, rb) = world_anchor(&bodies[ib], &c.pivot[1]);
                let error = anchor_a - anchor_b;
                let angular_error =
                    (bodies[ib].orientation * bodies[ia].orientation.inverse()).scaled_axis();
                for (axis, dir) in [Vector3::x(), Vector3::y(), Vector3::z()]
                    .into_iter()
                    .enumerate()
                {
                    push_row(
                        rows,
                        bodies,
                        Row {
                            a: ia,
                            b: ib,
                            dir,
                            kind: RowKind::Linear { ra, rb },
                            bias: BAUMGARTE / dt * error[axis],
                            lower: f64::NEG_INFINITY,
                            upper: f64::INFINITY,
                            eff_mass: 0.0,
                            impulse: c.linear_impulse[axis],
                            friction_of: None,
                            source: RowSource::GenericLinear { edge, axis },
                        },
                    );
                    push_row(
                        rows,
                        bodies,
                        Row {
                            a: ia,
                            b: ib,
                            dir,
                            kind: RowKind::Angular,
                            bias: BAUMGARTE / dt * angular_error[axis],
                            lower: f64::NEG_INFINITY,
                            upper: f64::INFINITY,
                            eff_mass: 0.0,
                            impulse: c.angular_impulse[axis],
                            friction_of: None,
                            source: RowSource::GenericAngular { edge, axis },
                        },
                    );
                }
            }
        }
    }
}

/// Anchor in world space plus the lever arm from the center of mass.
fn world_anchor(body: &SolverBody, pivot: &Vector3<f64>) -> (Point3<f64>, Vector3<f64>) {
    let anchor = body.origin + body.orientation * pivot;
    (anchor, anchor - body.position)
}

fn prepare_contact_rows(
    registry: &Registry,
    bodies: &[SolverBody],
    index_of: &HashMap<Entity, usize>,
    rows: &mut Vec<Row>,
    dt: f64,
) {
    for (edge, manifold) in registry.iter::<ContactManifold>() {
        let (Some(&ia), Some(&ib)) = (
            index_of.get(&manifold.body[0]),
            index_of.get(&manifold.body[1]),
        ) else {
            continue;
        };

        for (point_index, point) in manifold.points.iter().enumerate() {
            let a = &bodies[ia];
            let b = &bodies[ib];
            let normal = b.orientation * point.normal;
            let world_a = a.origin + a.orientation * point.local_pivot_a;
            let world_b = b.origin + b.orientation * point.local_pivot_b;
            let ra = world_a - a.position;
            let rb = world_b - b.position;

            let penetration = (-point.distance - PENETRATION_SLOP).max(0.0);
            let mut bias = -(BAUMGARTE / dt) * penetration;

            // Restitution on fast approaches only.
            let va = a.linvel + a.angvel.cross(&ra);
            let vb = b.linvel + b.angvel.cross(&rb);
            let approach = normal.dot(&(va - vb));
            if approach < -RESTITUTION_SPEED_THRESHOLD {
                bias += manifold.restitution * approach;
            }

            let normal_row_index = rows.len();
            push_row(
                rows,
                bodies,
                Row {
                    a: ia,
                    b: ib,
                    dir: normal,
                    kind: RowKind::Linear { ra, rb },
                    bias,
                    lower: 0.0,
                    upper: f64::INFINITY,
                    eff_mass: 0.0,
                    impulse: point.normal_impulse,
                    friction_of: None,
                    source: RowSource::ContactNormal {
                        edge,
                        point: point_index,
                    },
                },
            );
            if rows.len() == normal_row_index {
                // Degenerate normal row; friction has nothing to bound to.
                continue;
            }

            let (t1, t2) = tangent_basis(&normal);
            for (axis, dir) in [t1, t2].into_iter().enumerate() {
                push_row(
                    rows,
                    bodies,
                    Row {
                        a: ia,
                        b: ib,
                        dir,
                        kind: RowKind::Linear { ra, rb },
                        bias: 0.0,
                        lower: f64::NEG_INFINITY,
                        upper: f64::INFINITY,
                        eff_mass: 0.0,
                        impulse: point.friction_impulse[axis],
                        friction_of: Some((normal_row_index, manifold.friction)),
                        source: RowSource::ContactFriction {
                            edge,
                            point: point_index,
                            axis,
                        },
                    },
                );
            }
        }
    }
}

fn warm_start(bodies: &mut [SolverBody], rows: &[Row]) {
    for row in rows {
        if row.impulse != 0.0 {
            apply_impulse(bodies, row, row.impulse);
        }
    }
}

fn solve_iteration(bodies: &mut [SolverBody], rows: &mut [Row]) {
    for i in 0..rows.len() {
        let (lower, upper) = match rows[i].friction_of {
            Some((normal_index, friction)) => {
                let cap = friction * rows[normal_index].impulse.abs();
                (-cap, cap)
            }
            None => (rows[i].lower, rows[i].upper),
        };

        let row = &rows[i];
        let jv = relative_velocity(bodies, row);
        let lambda = -(jv + row.bias) / row.eff_mass;
        let accumulated = (rows[i].impulse + lambda).clamp(lower, upper);
        let delta = accumulated - rows[i].impulse;
        rows[i].impulse = accumulated;
        let row = rows[i].clone();
        apply_impulse(bodies, &row, delta);
    }
}

fn write_back_impulses(registry: &mut Registry, rows: &[Row]) {
    for row in rows {
        match row.source {
            RowSource::ContactNormal { edge, point } => {
                if let Some(manifold) = registry.get_mut::<ContactManifold>(edge) {
                    if let Some(p) = manifold.points.get_mut(point) {
                        p.normal_impulse = row.impulse;
                    }
                }
            }
            RowSource::ContactFriction { edge, point, axis } => {
                if let Some(manifold) = registry.get_mut::<ContactManifold>(edge) {
                    if let Some(p) = manifold.points.get_mut(point) {
                        p.friction_impulse[axis] = row.impulse;
                    }
                }
            }
            RowSource::DistanceImpulse { edge } => {
                if let Some(Constraint::Distance(c)) = registry.get_mut::<Constraint>(edge) {
                    c.impulse = row.impulse;
                }
            }
            RowSource::PointImpulse { edge, axis } => {
                if let Some(Constraint::Point(c)) = registry.get_mut::<Constraint>(edge) {
                    c.applied_impulse[axis] = row.impulse;
                }
            }
            RowSource::HingePoint { edge, axis } => {
                if let Some(Constraint::Hinge(c)) = registry.get_mut::<Constraint>(edge) {
                    c.applied_impulse[axis] = row.impulse;
                }
            }
            RowSource::HingeAngular { edge, axis } => {
                if let Some(Constraint::Hinge(c)) = registry.get_mut::<Constraint>(edge) {
                    c.angular_impulse[axis] = row.impulse;
                }
            }
            RowSource::GenericLinear { edge, axis } => {
                if let Some(Constraint::Generic(c)) = registry.get_mut::<Constraint>(edge) {
                    c.linear_impulse[axis] = row.impulse;
                }
            }
            RowSource::GenericAngular { edge, axis } => {
                if let Some(Constraint::Generic(c)) = registry.get_mut::<Constraint>(edge) {
                    c.angular_impulse[axis] = row.impulse;
                }
            }
        }
    }
}

fn integrate_and_scatter(registry: &mut Registry, bodies: &mut [SolverBody], dt: f64) {
    for body in bodies.iter_mut() {
        if body.dynamic || body.kinematic {
            body.position += body.linvel * dt;
            if body.angvel.norm_squared() > 0.0 {
                body.orientation =
                    UnitQuaternion::from_scaled_axis(body.angvel * dt) * body.orientation;
            }
        }

        registry.insert(body.entity, Position(body.position));
        registry.insert(body.entity, Orientation(body.orientation));
        if body.dynamic || body.kinematic {
            registry.insert(body.entity, LinVel(body.linvel));
            registry.insert(body.entity, AngVel(body.angvel));
        }
        if body.dynamic || body.kinematic {
            refresh_derived_state(registry, body.entity);
        }
    }
}
