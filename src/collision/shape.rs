// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains collision-shape primitives and pairwise intersection tests.
use nalgebra::{Isometry3, Point3, Vector3};

/// A closed set of collision primitives.
///
/// Mesh shapes are a future extension; requests for them are rejected at the
/// command boundary rather than represented here.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Sphere with radius in \[m\].
    Sphere { radius: f64 },
    /// Cylinder aligned with its local z axis, radius and length in \[m\].
    Cylinder { radius: f64, length: f64 },
    /// Axis-aligned box in its local frame, full side lengths in \[m\].
    Cuboid { scale: [f64; 3] },
}

impl Shape {
    /// Half extents of the oriented bounding box enclosing the shape.
    ///
    /// For spheres and cuboids the box is exact; for cylinders it
    /// circumscribes the shape, making cylinder tests conservative.
    pub fn half_extents(&self) -> Vector3<f64> {
        match *self {
            Shape::Sphere { radius } => Vector3::new(radius, radius, radius),
            Shape::Cylinder { radius, length } => Vector3::new(radius, radius, length / 2.),
            Shape::Cuboid { scale } => Vector3::new(scale[0] / 2., scale[1] / 2., scale[2] / 2.),
        }
    }
}

/// A primitive shape with a rigid-transform pose.
///
/// The pose is resolved relative to the owning link frame, or relative to the
/// base frame for dynamic objects injected at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionShape {
    pub shape: Shape,
    pub pose: Isometry3<f64>,
}

impl CollisionShape {
    pub fn new(shape: Shape, pose: Isometry3<f64>) -> Self {
        CollisionShape { shape, pose }
    }

    /// Resolves the shape pose into the world frame given the owning frame's
    /// world pose.
    pub fn world_pose(&self, frame: &Isometry3<f64>) -> Isometry3<f64> {
        frame * self.pose
    }
}

/// Tests two posed shapes for intersection.
///
/// Sphere/sphere and sphere/box tests are exact; box/box uses separating
/// axes. Cylinders are tested through their bounding box, so a cylinder test
/// may report an intersection slightly before the true surfaces touch. The
/// safety checks built on top only ever become more cautious through this.
pub fn shapes_intersect(
    pose_a: &Isometry3<f64>,
    shape_a: &Shape,
    pose_b: &Isometry3<f64>,
    shape_b: &Shape,
) -> bool {
    match (shape_a, shape_b) {
        (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
            let distance = (pose_a.translation.vector - pose_b.translation.vector).norm();
            distance <= ra + rb
        }
        (Shape::Sphere { radius }, _) => {
            sphere_box_intersect(&pose_a.translation.vector.into(), *radius, pose_b, shape_b)
        }
        (_, Shape::Sphere { radius }) => {
            sphere_box_intersect(&pose_b.translation.vector.into(), *radius, pose_a, shape_a)
        }
        (_, _) => box_box_intersect(pose_a, &shape_a.half_extents(), pose_b, &shape_b.half_extents()),
    }
}

/// Sphere against the oriented bounding box of `shape`: exact for cuboids.
fn sphere_box_intersect(
    center: &Point3<f64>,
    radius: f64,
    box_pose: &Isometry3<f64>,
    shape: &Shape,
) -> bool {
    let half = shape.half_extents();
    // Closest point on the box to the sphere center, in the box frame.
    let local = box_pose.inverse_transform_point(center);
    let clamped = Vector3::new(
        local.x.max(-half.x).min(half.x),
        local.y.max(-half.y).min(half.y),
        local.z.max(-half.z).min(half.z),
    );
    (local.coords - clamped).norm() <= radius
}

/// Oriented-box overlap via the separating-axis theorem (15 candidate axes).
fn box_box_intersect(
    pose_a: &Isometry3<f64>,
    half_a: &Vector3<f64>,
    pose_b: &Isometry3<f64>,
    half_b: &Vector3<f64>,
) -> bool {
    let rot_a = pose_a.rotation.to_rotation_matrix();
    let rot_b = pose_b.rotation.to_rotation_matrix();
    let axes_a: Vec<Vector3<f64>> = (0..3)
        .map(|i| rot_a.matrix().column(i).into_owned())
        .collect();
    let axes_b: Vec<Vector3<f64>> = (0..3)
        .map(|i| rot_b.matrix().column(i).into_owned())
        .collect();
    let delta = pose_b.translation.vector - pose_a.translation.vector;

    let mut axes: Vec<Vector3<f64>> = Vec::with_capacity(15);
    axes.extend(axes_a.iter().cloned());
    axes.extend(axes_b.iter().cloned());
    for a in &axes_a {
        for b in &axes_b {
            axes.push(a.cross(b));
        }
    }

    for axis in axes {
        let length = axis.norm();
        if length < 1e-9 {
            // Degenerate cross product of near-parallel edges.
            continue;
        }
        let axis = axis / length;
        let projection_a: f64 = (0..3).map(|i| (axes_a[i].dot(&axis) * half_a[i]).abs()).sum();
        let projection_b: f64 = (0..3).map(|i| (axes_b[i].dot(&axis) * half_b[i]).abs()).sum();
        if delta.dot(&axis).abs() > projection_a + projection_b {
            return false;
        }
    }
    true
}
