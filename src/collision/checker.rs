// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the narrow-phase collision checker.
//!
//! Checks run against a hypothetical joint configuration passed in by the
//! caller, so looking ahead along a trajectory never disturbs live state.
use crate::collision::index::{CollisionIndex, OverlapGraph};
use crate::collision::pruner::SpatialPruner;
use crate::collision::shape::shapes_intersect;
use crate::kinematics::KinematicModel;
use crate::link::SlicedLinkWindow;
use crate::trajectory::Trajectory;
use nalgebra::{DVector, Point3};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Narrow-phase checker over the pruned candidate sets.
pub struct CollisionChecker {
    /// Number of nearest candidates evaluated per checked link.
    pub fan_out: usize,
    /// Upper bound on interior trajectory samples evaluated per check.
    pub max_trajectory_checks: usize,
    /// When set, the candidate sets of the last state check are retained for
    /// inspection.
    pub debug: bool,
    last_candidates: BTreeMap<String, Vec<String>>,
}

impl Default for CollisionChecker {
    fn default() -> Self {
        CollisionChecker::new()
    }
}

impl CollisionChecker {
    pub fn new() -> Self {
        CollisionChecker {
            fan_out: SpatialPruner::DEFAULT_FAN_OUT,
            max_trajectory_checks: 10,
            debug: false,
            last_candidates: BTreeMap::new(),
        }
    }

    /// Candidate sets recorded by the last state check while
    /// [`debug`](`Self::debug`) was set.
    pub fn last_candidates(&self) -> &BTreeMap<String, Vec<String>> {
        &self.last_candidates
    }

    /// Tests one link against an explicit candidate list.
    ///
    /// Every shape of the link is tested against every shape of every
    /// candidate that is not the link itself and not in its exclusion set.
    /// Short-circuits on the first hit; no ordering guarantee beyond that.
    pub fn is_link_in_collision<M: KinematicModel>(
        &self,
        model: &M,
        index: &CollisionIndex,
        graph: &OverlapGraph,
        q: &DVector<f64>,
        link_name: &str,
        candidates: &[String],
    ) -> bool {
        let link_shapes = index.shapes_of(model, link_name);
        if link_shapes.is_empty() {
            return false;
        }
        let link_frame = match index.frame_of(model, q, link_name) {
            Some(frame) => frame,
            None => {
                debug!(link_name, "no frame for link, skipping check");
                return false;
            }
        };
        for candidate in candidates {
            if candidate == link_name || graph.overlaps(link_name, candidate) {
                continue;
            }
            let candidate_frame = match index.frame_of(model, q, candidate) {
                Some(frame) => frame,
                None => continue,
            };
            for link_shape in link_shapes {
                let link_pose = link_shape.world_pose(&link_frame);
                for candidate_shape in index.shapes_of(model, candidate) {
                    let candidate_pose = candidate_shape.world_pose(&candidate_frame);
                    if shapes_intersect(
                        &link_pose,
                        &link_shape.shape,
                        &candidate_pose,
                        &candidate_shape.shape,
                    ) {
                        warn!(link = link_name, against = %candidate, "collision detected");
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Tests the hypothetical configuration `q` for collisions over the
    /// sliced link window.
    ///
    /// A fresh pruning tree is built from the positions every entry would
    /// have at `q`, each window link queries its nearest candidates, and the
    /// narrow phase runs per link. Entries without shape data are skipped.
    pub fn is_state_in_collision<M: KinematicModel>(
        &mut self,
        model: &M,
        index: &CollisionIndex,
        graph: &OverlapGraph,
        window: &SlicedLinkWindow,
        q: &DVector<f64>,
    ) -> bool {
        if self.debug {
            self.last_candidates.clear();
        }
        for link_name in window.names() {
            if index.shapes_of(model, link_name).is_empty() {
                continue;
            }
            let origin = match index.frame_of(model, q, link_name) {
                Some(frame) => Point3::from(frame.translation.vector),
                None => continue,
            };
            let points: Vec<(String, Point3<f64>)> = index
                .entry_names(model)
                .into_iter()
                .filter(|name| {
                    name != link_name
                        && !graph.overlaps(link_name, name)
                        && !index.shapes_of(model, name).is_empty()
                })
                .filter_map(|name| {
                    index
                        .frame_of(model, q, &name)
                        .map(|frame| (name, Point3::from(frame.translation.vector)))
                })
                .collect();
            let pruner = SpatialPruner::build(points);
            let candidates: Vec<String> = pruner
                .nearest_candidates(&origin, self.fan_out)
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            if self.debug {
                self.last_candidates
                    .insert(link_name.clone(), candidates.clone());
            }
            if self.is_link_in_collision(model, index, graph, q, link_name, &candidates) {
                return true;
            }
        }
        false
    }

    /// Checks a trajectory for collisions before execution starts.
    ///
    /// The final sample is checked first, then interior samples at a fixed
    /// stride so at most [`max_trajectory_checks`](`Self::max_trajectory_checks`)
    /// of them are evaluated. States between checked samples are not
    /// evaluated; sampling density bounds the guarantee.
    pub fn is_trajectory_clear<M: KinematicModel>(
        &mut self,
        model: &M,
        index: &CollisionIndex,
        graph: &OverlapGraph,
        window: &SlicedLinkWindow,
        trajectory: &Trajectory,
    ) -> bool {
        let samples = trajectory.samples();
        let last = match samples.last() {
            Some(last) => last,
            None => return true,
        };
        if self.is_state_in_collision(model, index, graph, window, last) {
            warn!("trajectory end state is in collision");
            return false;
        }
        let interior = samples.len().saturating_sub(1);
        if interior == 0 {
            return true;
        }
        let stride = (interior + self.max_trajectory_checks - 1) / self.max_trajectory_checks;
        let stride = stride.max(1);
        let mut checked = 0;
        let mut position = 0;
        while position < interior && checked < self.max_trajectory_checks {
            if self.is_state_in_collision(model, index, graph, window, &samples[position]) {
                warn!(sample = position, "trajectory sample is in collision");
                return false;
            }
            checked += 1;
            position += stride;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collision::shape::{CollisionShape, Shape};
    use crate::kinematics::PlanarArm;
    use nalgebra::Isometry3;

    fn setup() -> (PlanarArm, CollisionIndex, OverlapGraph, SlicedLinkWindow) {
        let arm = PlanarArm::new(1.0, 0.5);
        let index = CollisionIndex::new();
        let q = DVector::from_vec(vec![0., 0.]);
        let graph = index.build_overlap_graph(&arm, &q);
        let window = SlicedLinkWindow::new(arm.link_tree(), "tool", None, None);
        (arm, index, graph, window)
    }

    fn ball(x: f64, y: f64, radius: f64) -> CollisionShape {
        CollisionShape::new(Shape::Sphere { radius }, Isometry3::translation(x, y, 0.))
    }

    #[test]
    fn free_state_is_not_in_collision() {
        let (arm, index, graph, window) = setup();
        let mut checker = CollisionChecker::new();
        let q = DVector::from_vec(vec![0., 0.]);
        assert!(!checker.is_state_in_collision(&arm, &index, &graph, &window, &q));
    }

    #[test]
    fn object_on_the_tool_is_a_collision() {
        let (arm, mut index, _, window) = setup();
        // Straight-out tool tip sits at (1.5, 0).
        index.add_dynamic("obstacle", ball(1.5, 0., 0.1), false).unwrap();
        // Graph built at a bent pose where the obstacle is clear of the arm.
        let bent = DVector::from_vec(vec![1.5, 1.5]);
        let graph = index.build_overlap_graph(&arm, &bent);
        let mut checker = CollisionChecker::new();
        let q = DVector::from_vec(vec![0., 0.]);
        assert!(checker.is_state_in_collision(&arm, &index, &graph, &window, &q));
        assert!(!checker.is_state_in_collision(&arm, &index, &graph, &window, &bent));
        // Removing the object and rebuilding the graph clears the report.
        index.remove_dynamic("obstacle").unwrap();
        let graph = index.build_overlap_graph(&arm, &bent);
        assert!(!checker.is_state_in_collision(&arm, &index, &graph, &window, &q));
    }

    #[test]
    fn expected_overlaps_are_not_reported() {
        let (arm, mut index, _, window) = setup();
        index.add_dynamic("gripper_pad", ball(1.5, 0., 0.1), false).unwrap();
        // Building the graph at the touching pose records the pair as an
        // expected overlap, so the same pose no longer reports a collision.
        let q = DVector::from_vec(vec![0., 0.]);
        let graph = index.build_overlap_graph(&arm, &q);
        let mut checker = CollisionChecker::new();
        assert!(!checker.is_state_in_collision(&arm, &index, &graph, &window, &q));
    }

    #[test]
    fn candidate_set_growth_is_monotone() {
        let (arm, mut index, _, _) = setup();
        index.add_dynamic("obstacle", ball(1.5, 0., 0.1), false).unwrap();
        let bent = DVector::from_vec(vec![1.5, 1.5]);
        let graph = index.build_overlap_graph(&arm, &bent);
        let checker = CollisionChecker::new();
        let q = DVector::from_vec(vec![0., 0.]);
        let subset = vec!["base".to_string()];
        let superset = vec!["base".to_string(), "obstacle".to_string()];
        let hit_subset =
            checker.is_link_in_collision(&arm, &index, &graph, &q, "tool", &subset);
        let hit_superset =
            checker.is_link_in_collision(&arm, &index, &graph, &q, "tool", &superset);
        assert!(!hit_subset);
        assert!(hit_superset);
    }

    #[test]
    fn trajectory_end_state_collision_is_caught() {
        let (arm, mut index, _, window) = setup();
        index.add_dynamic("obstacle", ball(1.5, 0., 0.1), false).unwrap();
        let bent = DVector::from_vec(vec![1.5, 1.5]);
        let graph = index.build_overlap_graph(&arm, &bent);
        let mut checker = CollisionChecker::new();
        // Moving from the bent pose straight into the obstacle.
        let trajectory = Trajectory::point_to_point(
            &bent,
            &DVector::from_vec(vec![0., 0.]),
            2.0,
            50,
        );
        assert!(!checker.is_trajectory_clear(&arm, &index, &graph, &window, &trajectory));
        // Staying clear of it passes.
        let trajectory = Trajectory::point_to_point(
            &bent,
            &DVector::from_vec(vec![1.5, 0.5]),
            2.0,
            50,
        );
        assert!(checker.is_trajectory_clear(&arm, &index, &graph, &window, &trajectory));
    }

    #[test]
    fn debug_mode_records_candidates() {
        let (arm, index, graph, window) = setup();
        let mut checker = CollisionChecker::new();
        checker.debug = true;
        let q = DVector::from_vec(vec![0., 0.]);
        checker.is_state_in_collision(&arm, &index, &graph, &window, &q);
        assert!(checker.last_candidates().contains_key("tool"));
    }
}
