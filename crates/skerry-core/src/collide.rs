//! Pairwise contact generation.
//!
//! Pure functions from `(shapes, transforms)` to contact points. The set of
//! supported pairs covers the primitives the engine ships with; exotic pairs
//! are external collaborators and produce no points here.
//!
//! Normals point from the second body toward the first. Distances are signed
//! separations: negative means penetration.

use nalgebra::{Point3, UnitQuaternion, Vector3};

use skerry_types::comp::{
    ContactManifold, ContactPoint, RotatedMeshCache, Shape, MAX_CONTACT_POINTS,
};

/// Separation beyond which a candidate is not worth keeping.
pub const CONTACT_CACHING_DISTANCE: f64 = 0.04;

/// Pivot drift beyond which a persistent point no longer matches.
const POINT_MATCH_DISTANCE: f64 = 0.04;

/// One fresh contact candidate in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactCandidate {
    /// Contact location on the first body's surface.
    pub point_a: Point3<f64>,
    /// Contact location on the second body's surface.
    pub point_b: Point3<f64>,
    /// Normal from the second body toward the first.
    pub normal: Vector3<f64>,
    /// Signed separation along the normal.
    pub distance: f64,
}

/// Shape and transform of one body entering collision.
#[derive(Debug, Clone, Copy)]
pub struct CollideInput<'a> {
    /// The collision shape.
    pub shape: &'a Shape,
    /// World position of the body origin used for collision (the geometric
    /// origin).
    pub position: Point3<f64>,
    /// World orientation.
    pub orientation: UnitQuaternion<f64>,
    /// Rotated-vertex cache for polyhedral shapes, when available.
    pub cache: Option<&'a RotatedMeshCache>,
}

/// Generate contact candidates between two bodies.
#[must_use]
pub fn collide(a: &CollideInput<'_>, b: &CollideInput<'_>) -> Vec<ContactCandidate> {
    match (a.shape, b.shape) {
        (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
            sphere_sphere(a.position, *ra, b.position, *rb)
        }
        (Shape::Sphere { radius }, Shape::Plane { normal, constant }) => {
            flip(plane_sphere(*normal, *constant, a.position, *radius))
        }
        (Shape::Plane { normal, constant }, Shape::Sphere { radius }) => {
            plane_sphere(*normal, *constant, b.position, *radius)
        }
        (Shape::Box { half_extents }, Shape::Plane { normal, constant }) => flip(plane_box(
            *normal,
            *constant,
            b.position,
            a.position,
            a.orientation,
            *half_extents,
        )),
        (Shape::Plane { normal, constant }, Shape::Box { half_extents }) => plane_box(
            *normal,
            *constant,
            a.position,
            b.position,
            b.orientation,
            *half_extents,
        ),
        (Shape::Sphere { radius }, Shape::Box { half_extents }) => {
            sphere_box(a.position, *radius, b.position, b.orientation, *half_extents)
        }
        (Shape::Box { half_extents }, Shape::Sphere { radius }) => flip(sphere_box(
            b.position,
            *radius,
            a.position,
            a.orientation,
            *half_extents,
        )),
        (Shape::Box { half_extents: ha }, Shape::Box { half_extents: hb }) => box_box(
            a.position,
            a.orientation,
            *ha,
            b.position,
            b.orientation,
            *hb,
        ),
        (
            Shape::Capsule {
                half_length,
                radius,
            },
            Shape::Plane { normal, constant },
        ) => flip(plane_capsule(
            *normal,
            *constant,
            a.position,
            a.orientation,
            *half_length,
            *radius,
        )),
        (
            Shape::Plane { normal, constant },
            Shape::Capsule {
                half_length,
                radius,
            },
        ) => plane_capsule(
            *normal,
            *constant,
            b.position,
            b.orientation,
            *half_length,
            *radius,
        ),
        (
            Shape::Capsule {
                half_length,
                radius: rc,
            },
            Shape::Sphere { radius: rs },
        ) => capsule_sphere(
            a.position,
            a.orientation,
            *half_length,
            *rc,
            b.position,
            *rs,
        ),
        (
            Shape::Sphere { radius: rs },
            Shape::Capsule {
                half_length,
                radius: rc,
            },
        ) => flip(capsule_sphere(
            b.position,
            b.orientation,
            *half_length,
            *rc,
            a.position,
            *rs,
        )),
        (Shape::Polyhedron { mesh }, Shape::Plane { normal, constant }) => {
            let rotated = a.cache.and_then(|c| c.meshes.first());
            flip(plane_polyhedron(
                *normal,
                *constant,
                a.position,
                a.orientation,
                &mesh.vertices,
                rotated,
            ))
        }
        (Shape::Plane { normal, constant }, Shape::Polyhedron { mesh }) => {
            let rotated = b.cache.and_then(|c| c.meshes.first());
            plane_polyhedron(
                *normal,
                *constant,
                b.position,
                b.orientation,
                &mesh.vertices,
                rotated,
            )
        }
        (Shape::Compound { children }, _) => {
            let mut out = Vec::new();
            for child in children {
                let child_input = CollideInput {
                    shape: &child.shape,
                    position: a.position + a.orientation * child.position,
                    orientation: a.orientation * child.orientation,
                    cache: None,
                };
                out.extend(collide(&child_input, b));
            }
            out
        }
        (_, Shape::Compound { children }) => {
            let mut out = Vec::new();
            for child in children {
                let child_input = CollideInput {
                    shape: &child.shape,
                    position: b.position + b.orientation * child.position,
                    orientation: b.orientation * child.orientation,
                    cache: None,
                };
                out.extend(collide(a, &child_input));
            }
            out
        }
        _ => {
            tracing::trace!("unsupported shape pair, no contacts generated");
            Vec::new()
        }
    }
}

fn flip(mut candidates: Vec<ContactCandidate>) -> Vec<ContactCandidate> {
    for c in &mut candidates {
        std::mem::swap(&mut c.point_a, &mut c.point_b);
        c.normal = -c.normal;
    }
    candidates
}

fn sphere_sphere(
    pa: Point3<f64>,
    ra: f64,
    pb: Point3<f64>,
    rb: f64,
) -> Vec<ContactCandidate> {
    let delta = pa - pb;
    let center_distance = delta.norm();
    let distance = center_distance - (ra + rb);
    if distance > CONTACT_CACHING_DISTANCE {
        return Vec::new();
    }
    let normal = if center_distance > 1.0e-9 {
        delta / center_distance
    } else {
        Vector3::y()
    };
    vec![ContactCandidate {
        point_a: pa - normal * ra,
        point_b: pb + normal * rb,
        normal,
        distance,
    }]
}

/// Plane is the first body.
fn plane_sphere(
    normal: Vector3<f64>,
    constant: f64,
    center: Point3<f64>,
    radius: f64,
) -> Vec<ContactCandidate> {
    let signed = normal.dot(&center.coords) - constant - radius;
    if signed > CONTACT_CACHING_DISTANCE {
        return Vec::new();
    }
    // Candidate normal points from the sphere (second body) to the plane, so
    // flip the plane normal.
    let point_on_sphere = center - normal * radius;
    let point_on_plane = point_on_sphere - normal * signed;
    vec![ContactCandidate {
        point_a: point_on_plane,
        point_b: point_on_sphere,
        normal: -normal,
        distance: signed,
    }]
}

/// Plane is the first body. `plane_origin` is unused beyond clarity.
fn plane_box(
    normal: Vector3<f64>,
    constant: f64,
    _plane_origin: Point3<f64>,
    box_position: Point3<f64>,
    box_orientation: UnitQuaternion<f64>,
    half_extents: Vector3<f64>,
) -> Vec<ContactCandidate> {
    let mut candidates = Vec::new();
    for sx in [-1.0, 1.0] {
        for sy in [-1.0, 1.0] {
            for sz in [-1.0, 1.0] {
                let local = Vector3::new(
                    sx * half_extents.x,
                    sy * half_extents.y,
                    sz * half_extents.z,
                );
                let vertex = box_position + box_orientation * local;
                let signed = normal.dot(&vertex.coords) - constant;
                if signed <= CONTACT_CACHING_DISTANCE {
                    candidates.push(ContactCandidate {
                        point_a: vertex - normal * signed,
                        point_b: vertex,
                        normal: -normal,
                        distance: signed,
                    });
                }
            }
        }
    }
    keep_deepest(candidates)
}

/// Sphere is the first body.
fn sphere_box(
    center: Point3<f64>,
    radius: f64,
    box_position: Point3<f64>,
    box_orientation: UnitQuaternion<f64>,
    half_extents: Vector3<f64>,
) -> Vec<ContactCandidate> {
    let local_center = box_orientation.inverse() * (center - box_position);
    let clamped = Vector3::new(
        local_center.x.clamp(-half_extents.x, half_extents.x),
        local_center.y.clamp(-half_extents.y, half_extents.y),
        local_center.z.clamp(-half_extents.z, half_extents.z),
    );
    let delta = local_center - clamped;
    let outside = delta.norm();

    let (local_normal, distance, local_closest) = if outside > 1.0e-9 {
        (delta / outside, outside - radius, clamped)
    } else {
        // Center inside the box: push out along the axis of least penetration.
        let depths = [
            half_extents.x - local_center.x.abs(),
            half_extents.y - local_center.y.abs(),
            half_extents.z - local_center.z.abs(),
        ];
        let axis = depths
            .iter()
            .enumerate()
            .min_by(|(_, l), (_, r)| l.partial_cmp(r).unwrap_or(std::cmp::Ordering::Equal))
            .map_or(1, |(i, _)| i);
        let mut n = Vector3::zeros();
        n[axis] = local_center[axis].signum();
        let mut closest = local_center;
        closest[axis] = half_extents[axis] * local_center[axis].signum();
        (n, -(depths[axis] + radius), closest)
    };

    if distance > CONTACT_CACHING_DISTANCE {
        return Vec::new();
    }

    let normal = box_orientation * local_normal;
    let point_b = box_position + box_orientation * local_closest;
    vec![ContactCandidate {
        point_a: center - normal * radius,
        point_b,
        normal,
        distance,
    }]
}

fn box_vertices(
    position: Point3<f64>,
    orientation: UnitQuaternion<f64>,
    half_extents: Vector3<f64>,
) -> [Point3<f64>; 8] {
    let mut out = [Point3::origin(); 8];
    let mut i = 0;
    for sx in [-1.0, 1.0] {
        for sy in [-1.0, 1.0] {
            for sz in [-1.0, 1.0] {
                let local = Vector3::new(
                    sx * half_extents.x,
                    sy * half_extents.y,
                    sz * half_extents.z,
                );
                out[i] = position + orientation * local;
                i += 1;
            }
        }
    }
    out
}

fn support_extent(orientation: UnitQuaternion<f64>, half: Vector3<f64>, axis: &Vector3<f64>) -> f64 {
    let r = orientation.to_rotation_matrix();
    (r.matrix().column(0).dot(axis)).abs() * half.x
        + (r.matrix().column(1).dot(axis)).abs() * half.y
        + (r.matrix().column(2).dot(axis)).abs() * half.z
}

fn point_in_box(
    point: Point3<f64>,
    position: Point3<f64>,
    orientation: UnitQuaternion<f64>,
    half: Vector3<f64>,
    slop: f64,
) -> bool {
    let local = orientation.inverse() * (point - position);
    local.x.abs() <= half.x + slop && local.y.abs() <= half.y + slop && local.z.abs() <= half.z + slop
}

#[allow(clippy::similar_names)]
fn box_box(
    pa: Point3<f64>,
    qa: UnitQuaternion<f64>,
    ha: Vector3<f64>,
    pb: Point3<f64>,
    qb: UnitQuaternion<f64>,
    hb: Vector3<f64>,
) -> Vec<ContactCandidate> {
    let ra = qa.to_rotation_matrix();
    let rb = qb.to_rotation_matrix();
    let center_delta = pa - pb;

    // Separating-axis test over face normals and edge cross products; keep
    // the axis of least overlap.
    let mut axes: Vec<Vector3<f64>> = Vec::with_capacity(15);
    for i in 0..3 {
        axes.push(ra.matrix().column(i).into_owned());
        axes.push(rb.matrix().column(i).into_owned());
    }
    for i in 0..3 {
        for j in 0..3 {
            let axis_a: Vector3<f64> = ra.matrix().column(i).into_owned();
            let axis_b: Vector3<f64> = rb.matrix().column(j).into_owned();
            let cross = axis_a.cross(&axis_b);
            if cross.norm_squared() > 1.0e-12 {
                axes.push(cross.normalize());
            }
        }
    }

    let mut best_axis = None;
    let mut best_overlap = f64::INFINITY;
    for axis in axes {
        let span = support_extent(qa, ha, &axis) + support_extent(qb, hb, &axis);
        let separation = center_delta.dot(&axis).abs() - span;
        if separation > CONTACT_CACHING_DISTANCE {
            return Vec::new();
        }
        let overlap = -separation;
        if overlap < best_overlap {
            best_overlap = overlap;
            // Orient from B toward A.
            best_axis = Some(if center_delta.dot(&axis) >= 0.0 {
                axis
            } else {
                -axis
            });
        }
    }
    let Some(normal) = best_axis else {
        return Vec::new();
    };

    let slop = CONTACT_CACHING_DISTANCE;
    let mut candidates = Vec::new();

    // Vertices of A at or inside B's face along the normal.
    let sb = support_extent(qb, hb, &normal);
    for vertex in box_vertices(pa, qa, ha) {
        if point_in_box(vertex, pb, qb, hb, slop) {
            let distance = (vertex - pb).dot(&normal) - sb;
            candidates.push(ContactCandidate {
                point_a: vertex,
                point_b: vertex - normal * distance,
                normal,
                distance,
            });
        }
    }

    // Vertices of B at or inside A's face along the normal.
    let sa = support_extent(qa, ha, &normal);
    for vertex in box_vertices(pb, qb, hb) {
        if point_in_box(vertex, pa, qa, ha, slop) {
            let distance = -((vertex - pa).dot(&normal) + sa);
            candidates.push(ContactCandidate {
                point_a: vertex - normal * distance,
                point_b: vertex,
                normal,
                distance,
            });
        }
    }

    if candidates.is_empty() && best_overlap >= 0.0 {
        // Degenerate edge-edge overlap: fall back to the midpoint between
        // the two centers projected on the axis.
        let mid = nalgebra::center(&pa, &pb);
        candidates.push(ContactCandidate {
            point_a: mid,
            point_b: mid,
            normal,
            distance: -best_overlap,
        });
    }

    keep_deepest(candidates)
}

/// Plane is the first body.
fn plane_capsule(
    normal: Vector3<f64>,
    constant: f64,
    position: Point3<f64>,
    orientation: UnitQuaternion<f64>,
    half_length: f64,
    radius: f64,
) -> Vec<ContactCandidate> {
    let axis = orientation * Vector3::new(0.0, 0.0, half_length);
    let mut candidates = Vec::new();
    for center in [position + axis, position - axis] {
        let signed = normal.dot(&center.coords) - constant - radius;
        if signed <= CONTACT_CACHING_DISTANCE {
            let on_capsule = center - normal * radius;
            candidates.push(ContactCandidate {
                point_a: on_capsule - normal * signed,
                point_b: on_capsule,
                normal: -normal,
                distance: signed,
            });
        }
    }
    candidates
}

/// Capsule is the first body.
fn capsule_sphere(
    position: Point3<f64>,
    orientation: UnitQuaternion<f64>,
    half_length: f64,
    capsule_radius: f64,
    center: Point3<f64>,
    sphere_radius: f64,
) -> Vec<ContactCandidate> {
    let axis = orientation * Vector3::new(0.0, 0.0, half_length);
    let a = position - axis;
    let b = position + axis;
    let ab = b - a;
    let t = ((center - a).dot(&ab) / ab.norm_squared()).clamp(0.0, 1.0);
    let closest = a + ab * t;
    sphere_sphere(closest, capsule_radius, center, sphere_radius)
}

/// Plane is the first body.
fn plane_polyhedron(
    normal: Vector3<f64>,
    constant: f64,
    position: Point3<f64>,
    orientation: UnitQuaternion<f64>,
    vertices: &[Point3<f64>],
    rotated: Option<&Vec<Point3<f64>>>,
) -> Vec<ContactCandidate> {
    let mut candidates = Vec::new();
    for (i, vertex) in vertices.iter().enumerate() {
        let world = match rotated.and_then(|r| r.get(i)) {
            Some(r) => position + r.coords,
            None => position + orientation * vertex.coords,
        };
        let signed = normal.dot(&world.coords) - constant;
        if signed <= CONTACT_CACHING_DISTANCE {
            candidates.push(ContactCandidate {
                point_a: world - normal * signed,
                point_b: world,
                normal: -normal,
                distance: signed,
            });
        }
    }
    keep_deepest(candidates)
}

fn keep_deepest(mut candidates: Vec<ContactCandidate>) -> Vec<ContactCandidate> {
    if candidates.len() > MAX_CONTACT_POINTS {
        candidates.sort_by(|l, r| {
            l.distance
                .partial_cmp(&r.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(MAX_CONTACT_POINTS);
    }
    candidates
}

/// Fold fresh candidates into a persistent manifold.
///
/// Points that match an existing one by body-space pivot keep their
/// accumulated impulses for warm starting; unmatched old points are dropped.
pub fn merge_into_manifold(
    manifold: &mut ContactManifold,
    candidates: &[ContactCandidate],
    pose_a: (&Point3<f64>, &UnitQuaternion<f64>),
    pose_b: (&Point3<f64>, &UnitQuaternion<f64>),
) {
    let old_points = std::mem::take(&mut manifold.points);

    for candidate in candidates {
        let local_pivot_a = pose_a.1.inverse() * (candidate.point_a - pose_a.0);
        let local_pivot_b = pose_b.1.inverse() * (candidate.point_b - pose_b.0);
        let local_normal = pose_b.1.inverse() * candidate.normal;

        let matched = old_points.iter().find(|p| {
            (p.local_pivot_a - local_pivot_a).norm_squared()
                < POINT_MATCH_DISTANCE * POINT_MATCH_DISTANCE
        });

        let point = match matched {
            Some(old) => ContactPoint {
                local_pivot_a,
                local_pivot_b,
                normal: local_normal,
                normal_impulse: old.normal_impulse,
                friction_impulse: old.friction_impulse,
                distance: candidate.distance,
                lifetime: old.lifetime.saturating_add(1),
            },
            None => ContactPoint {
                local_pivot_a,
                local_pivot_b,
                normal: local_normal,
                normal_impulse: 0.0,
                friction_impulse: [0.0; 2],
                distance: candidate.distance,
                lifetime: 0,
            },
        };
        manifold.insert_point(point);
    }
}
