//! Collision shapes.
//!
//! A [`Shape`] is a tagged variant over the primitive shapes plus compound
//! and triangle-mesh forms. Polyhedral shapes carry an immutable base mesh;
//! the per-instance rotated-vertex cache lives in a separate
//! [`RotatedMeshCache`] component so the shape itself can be shared over the
//! wire unchanged.

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::aabb::Aabb;

/// Immutable convex mesh: vertices in body space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvexMesh {
    /// Vertex positions in body space.
    pub vertices: Vec<Point3<f64>>,
}

impl ConvexMesh {
    /// Build a mesh from body-space vertices.
    #[must_use]
    pub fn new(vertices: Vec<Point3<f64>>) -> Self {
        Self { vertices }
    }

    /// Vertices rotated by the given orientation.
    #[must_use]
    pub fn rotated(&self, orientation: &UnitQuaternion<f64>) -> Vec<Point3<f64>> {
        self.vertices.iter().map(|v| orientation * v).collect()
    }
}

/// Immutable triangle mesh for static world geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    /// Vertex positions in body space.
    pub vertices: Vec<Point3<f64>>,
    /// Triangles as vertex index triples.
    pub indices: Vec<[u32; 3]>,
}

/// Child of a compound shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundChild {
    /// Child offset in the compound's body space.
    pub position: Vector3<f64>,
    /// Child orientation in the compound's body space.
    pub orientation: UnitQuaternion<f64>,
    /// Child shape. Compounds of compounds are not supported.
    pub shape: Shape,
}

/// Collision shape variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Sphere centered at the body origin.
    Sphere {
        /// Radius in meters.
        radius: f64,
    },
    /// Box centered at the body origin.
    Box {
        /// Half-extents along the body axes.
        half_extents: Vector3<f64>,
    },
    /// Capsule along the body Z axis.
    Capsule {
        /// Half the distance between the cap centers.
        half_length: f64,
        /// Cap radius.
        radius: f64,
    },
    /// Infinite plane `dot(normal, p) = constant`, for static geometry.
    Plane {
        /// Plane normal, unit length.
        normal: Vector3<f64>,
        /// Signed distance of the plane from the world origin.
        constant: f64,
    },
    /// Convex polyhedron.
    Polyhedron {
        /// Immutable base mesh.
        mesh: ConvexMesh,
    },
    /// Collection of child shapes at fixed offsets.
    Compound {
        /// Children in body space.
        children: Vec<CompoundChild>,
    },
    /// Triangle mesh, static-only.
    TriMesh {
        /// Immutable mesh data.
        mesh: TriangleMesh,
    },
}

impl Shape {
    /// Convenience constructor for a sphere.
    #[must_use]
    pub const fn sphere(radius: f64) -> Self {
        Self::Sphere { radius }
    }

    /// Convenience constructor for a box.
    #[must_use]
    pub const fn cuboid(half_extents: Vector3<f64>) -> Self {
        Self::Box { half_extents }
    }

    /// Convenience constructor for a ground plane with the given normal.
    #[must_use]
    pub const fn plane(normal: Vector3<f64>, constant: f64) -> Self {
        Self::Plane { normal, constant }
    }

    /// Whether this shape variant carries a polyhedral mesh whose rotated
    /// vertices need a per-instance cache.
    #[must_use]
    pub fn needs_rotated_cache(&self) -> bool {
        match self {
            Self::Polyhedron { .. } => true,
            Self::Compound { children } => children
                .iter()
                .any(|c| matches!(c.shape, Self::Polyhedron { .. })),
            _ => false,
        }
    }

    /// World-space AABB of the shape at the given transform.
    #[must_use]
    #[allow(clippy::similar_names)]
    pub fn aabb(&self, position: &Point3<f64>, orientation: &UnitQuaternion<f64>) -> Aabb {
        match self {
            Self::Sphere { radius } => {
                Aabb::from_center(*position, Vector3::new(*radius, *radius, *radius))
            }
            Self::Box { half_extents } => {
                // Projection of a rotated box: |R| * h per axis.
                let r = orientation.to_rotation_matrix();
                let m = r.matrix().abs();
                Aabb::from_center(*position, m * half_extents)
            }
            Self::Capsule {
                half_length,
                radius,
            } => {
                let axis = orientation * Vector3::new(0.0, 0.0, *half_length);
                let a = position + axis;
                let b = position - axis;
                Aabb::from_points([&a, &b].into_iter()).expanded(*radius)
            }
            Self::Plane { normal, constant } => {
                // Large slab straddling the plane; good enough for sweeps.
                const LARGE: f64 = 1.0e6;
                let p = Point3::from(normal * *constant);
                let mut half = Vector3::new(LARGE, LARGE, LARGE);
                if normal.x.abs() > 0.9 {
                    half.x = 0.01;
                } else if normal.y.abs() > 0.9 {
                    half.y = 0.01;
                } else {
                    half.z = 0.01;
                }
                Aabb::from_center(p, half)
            }
            Self::Polyhedron { mesh } => {
                let rotated: Vec<Point3<f64>> =
                    mesh.vertices.iter().map(|v| position + (orientation * v.coords)).collect();
                Aabb::from_points(rotated.iter())
            }
            Self::Compound { children } => {
                let mut result: Option<Aabb> = None;
                for child in children {
                    let child_pos = position + orientation * child.position;
                    let child_orn = orientation * child.orientation;
                    let child_aabb = child.shape.aabb(&child_pos, &child_orn);
                    result = Some(match result {
                        Some(acc) => acc.merged(&child_aabb),
                        None => child_aabb,
                    });
                }
                result.unwrap_or_default()
            }
            Self::TriMesh { mesh } => {
                let rotated: Vec<Point3<f64>> =
                    mesh.vertices.iter().map(|v| position + (orientation * v.coords)).collect();
                Aabb::from_points(rotated.iter())
            }
        }
    }
}

/// Per-instance cache of rotated polyhedron vertices, one list per polyhedral
/// child. Rebuilt whenever the orientation changes outside the integrator and
/// once per step inside it. Never replicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotatedMeshCache {
    /// Rotated world-direction vertices, one entry per polyhedron.
    pub meshes: Vec<Vec<Point3<f64>>>,
}

impl RotatedMeshCache {
    /// Rebuild the cache for a shape at the given orientation.
    #[must_use]
    pub fn build(shape: &Shape, orientation: &UnitQuaternion<f64>) -> Self {
        let mut meshes = Vec::new();
        match shape {
            Shape::Polyhedron { mesh } => meshes.push(mesh.rotated(orientation)),
            Shape::Compound { children } => {
                for child in children {
                    if let Shape::Polyhedron { mesh } = &child.shape {
                        meshes.push(mesh.rotated(&(orientation * child.orientation)));
                    }
                }
            }
            _ => {}
        }
        Self { meshes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sphere_aabb() {
        let shape = Shape::sphere(2.0);
        let aabb = shape.aabb(&Point3::new(5.0, 5.0, 5.0), &UnitQuaternion::identity());
        assert_eq!(aabb.min, Point3::new(3.0, 3.0, 3.0));
        assert_eq!(aabb.max, Point3::new(7.0, 7.0, 7.0));
    }

    #[test]
    fn test_rotated_box_aabb_grows() {
        let shape = Shape::cuboid(Vector3::new(1.0, 1.0, 1.0));
        let orn = UnitQuaternion::from_axis_angle(
            &Vector3::z_axis(),
            std::f64::consts::FRAC_PI_4,
        );
        let aabb = shape.aabb(&Point3::origin(), &orn);
        assert_relative_eq!(aabb.max.x, std::f64::consts::SQRT_2, epsilon = 1e-9);
        assert_relative_eq!(aabb.max.z, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_compound_aabb_merges_children() {
        let shape = Shape::Compound {
            children: vec![
                CompoundChild {
                    position: Vector3::new(-2.0, 0.0, 0.0),
                    orientation: UnitQuaternion::identity(),
                    shape: Shape::sphere(1.0),
                },
                CompoundChild {
                    position: Vector3::new(2.0, 0.0, 0.0),
                    orientation: UnitQuaternion::identity(),
                    shape: Shape::sphere(1.0),
                },
            ],
        };
        let aabb = shape.aabb(&Point3::origin(), &UnitQuaternion::identity());
        assert_eq!(aabb.min.x, -3.0);
        assert_eq!(aabb.max.x, 3.0);
    }

    #[test]
    fn test_rotated_cache_for_polyhedron() {
        let mesh = ConvexMesh::new(vec![
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 0.0, 0.0),
        ]);
        let shape = Shape::Polyhedron { mesh };
        assert!(shape.needs_rotated_cache());

        let orn =
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        let cache = RotatedMeshCache::build(&shape, &orn);
        assert_eq!(cache.meshes.len(), 1);
        assert_relative_eq!(cache.meshes[0][0].y, 1.0, epsilon = 1e-9);
    }
}
