// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the kinematics seam the supervisor consumes.
//!
//! The crate does not implement forward kinematics, Jacobians or inverse
//! kinematics for real robots; a [`KinematicModel`] is supplied by the
//! integrator. All methods take the joint vector explicitly, so look-ahead
//! queries against a candidate state never disturb the live state.
use crate::link::LinkTree;
use nalgebra::{DMatrix, DVector, Isometry3};

/// Kinematic capability of one robot model.
///
/// Implementations must be pure over `q`: calling any method must not mutate
/// the model. The supervisor relies on this to evaluate hypothetical states
/// (ghost checks) by passing a candidate joint vector.
pub trait KinematicModel {
    /// Number of actuated joints.
    fn dof(&self) -> usize;

    /// Topology and per-link collision shapes.
    fn link_tree(&self) -> &LinkTree;

    /// Name of the end-effector link.
    fn end_effector(&self) -> &str;

    /// Pose of link `end` expressed in the frame of link `start` at joint
    /// configuration `q`.
    ///
    /// # Return
    /// `None` if either link name is unknown or `q` has the wrong length.
    fn forward_kinematics(
        &self,
        q: &DVector<f64>,
        start: &str,
        end: &str,
    ) -> Option<Isometry3<f64>>;

    /// Geometric Jacobian of the end-effector in the base frame, 6 rows
    /// (linear xyz, angular xyz) by [`dof`](`Self::dof`) columns.
    fn jacobian(&self, q: &DVector<f64>) -> DMatrix<f64>;

    /// Joint configuration reaching `pose` with the end-effector, seeded
    /// near `q0`, or `None` when the pose is unreachable.
    fn inverse_kinematics(&self, pose: &Isometry3<f64>, q0: &DVector<f64>)
        -> Option<DVector<f64>>;

    /// Yoshikawa manipulability measure at `q`.
    ///
    /// Computed as sqrt(det(JᵀJ)); approaches zero near singular
    /// configurations.
    fn manipulability(&self, q: &DVector<f64>) -> f64 {
        let jacobian = self.jacobian(q);
        let gram = jacobian.transpose() * jacobian;
        gram.determinant().max(0.).sqrt()
    }

    /// Pose of `link` in the base frame at configuration `q`.
    fn world_pose(&self, q: &DVector<f64>, link: &str) -> Option<Isometry3<f64>> {
        let base = self.link_tree().root().name.clone();
        self.forward_kinematics(q, &base, link)
    }
}

/// Planar two-revolute-joint arm in the xy plane.
///
/// Reference model used throughout the test suite; real deployments plug in
/// their own [`KinematicModel`]. Both links carry a midpoint collision sphere
/// so the collision pipeline can be exercised end to end.
#[derive(Debug, Clone)]
pub struct PlanarArm {
    length_1: f64,
    length_2: f64,
    tree: LinkTree,
}

impl PlanarArm {
    pub fn new(length_1: f64, length_2: f64) -> Self {
        use crate::collision::shape::{CollisionShape, Shape};
        use crate::link::Link;
        use nalgebra::{Translation3, UnitQuaternion};

        let midpoint_sphere = |length: f64| {
            vec![CollisionShape::new(
                Shape::Sphere { radius: 0.05 },
                Isometry3::from_parts(
                    Translation3::new(length / 2., 0., 0.),
                    UnitQuaternion::identity(),
                ),
            )]
        };
        let tree = LinkTree::new(vec![
            Link::new("base", None, None),
            Link::new("upper_arm", Some(0), Some(0)).with_shapes(midpoint_sphere(length_1)),
            Link::new("forearm", Some(1), Some(1)).with_shapes(midpoint_sphere(length_2)),
            Link::new("tool", Some(2), None).with_shapes(vec![CollisionShape::new(
                Shape::Sphere { radius: 0.05 },
                Isometry3::identity(),
            )]),
        ])
        .unwrap();
        PlanarArm {
            length_1,
            length_2,
            tree,
        }
    }

    fn link_pose_in_base(&self, q: &DVector<f64>, link: &str) -> Option<Isometry3<f64>> {
        use nalgebra::{Translation3, UnitQuaternion, Vector3};
        if q.len() != 2 {
            return None;
        }
        let (sin_1, cos_1) = q[0].sin_cos();
        let (sin_12, cos_12) = (q[0] + q[1]).sin_cos();
        let rotation = |angle: f64| UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle);
        match link {
            "base" => Some(Isometry3::identity()),
            "upper_arm" => Some(Isometry3::from_parts(
                Translation3::identity(),
                rotation(q[0]),
            )),
            "forearm" => Some(Isometry3::from_parts(
                Translation3::new(self.length_1 * cos_1, self.length_1 * sin_1, 0.),
                rotation(q[0] + q[1]),
            )),
            "tool" => Some(Isometry3::from_parts(
                Translation3::new(
                    self.length_1 * cos_1 + self.length_2 * cos_12,
                    self.length_1 * sin_1 + self.length_2 * sin_12,
                    0.,
                ),
                rotation(q[0] + q[1]),
            )),
            _ => None,
        }
    }
}

impl KinematicModel for PlanarArm {
    fn dof(&self) -> usize {
        2
    }

    fn link_tree(&self) -> &LinkTree {
        &self.tree
    }

    fn end_effector(&self) -> &str {
        "tool"
    }

    fn forward_kinematics(
        &self,
        q: &DVector<f64>,
        start: &str,
        end: &str,
    ) -> Option<Isometry3<f64>> {
        let start_pose = self.link_pose_in_base(q, start)?;
        let end_pose = self.link_pose_in_base(q, end)?;
        Some(start_pose.inverse() * end_pose)
    }

    fn jacobian(&self, q: &DVector<f64>) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(6, 2);
        if q.len() != 2 {
            return jacobian;
        }
        let (sin_1, cos_1) = q[0].sin_cos();
        let (sin_12, cos_12) = (q[0] + q[1]).sin_cos();
        jacobian[(0, 0)] = -self.length_1 * sin_1 - self.length_2 * sin_12;
        jacobian[(0, 1)] = -self.length_2 * sin_12;
        jacobian[(1, 0)] = self.length_1 * cos_1 + self.length_2 * cos_12;
        jacobian[(1, 1)] = self.length_2 * cos_12;
        jacobian[(5, 0)] = 1.;
        jacobian[(5, 1)] = 1.;
        jacobian
    }

    /// Translational manipulability, which is the meaningful measure for a
    /// planar positioning arm: l1*l2*|sin(q2)|, zero when stretched out.
    fn manipulability(&self, q: &DVector<f64>) -> f64 {
        let jacobian = self.jacobian(q);
        let translational = jacobian.rows(0, 2).into_owned();
        let gram = &translational * translational.transpose();
        gram.determinant().max(0.).sqrt()
    }

    fn inverse_kinematics(
        &self,
        pose: &Isometry3<f64>,
        q0: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        let x = pose.translation.vector.x;
        let y = pose.translation.vector.y;
        let cos_elbow = (x * x + y * y - self.length_1 * self.length_1
            - self.length_2 * self.length_2)
            / (2. * self.length_1 * self.length_2);
        if cos_elbow.abs() > 1. {
            return None;
        }
        let elbow = cos_elbow.acos();
        // Pick the elbow branch closer to the seed configuration.
        let seed_elbow = if q0.len() == 2 { q0[1] } else { 0. };
        let q2 = if (elbow - seed_elbow).abs() <= (-elbow - seed_elbow).abs() {
            elbow
        } else {
            -elbow
        };
        let q1 = y.atan2(x)
            - (self.length_2 * q2.sin()).atan2(self.length_1 + self.length_2 * q2.cos());
        Some(DVector::from_vec(vec![q1, q2]))
    }
}
