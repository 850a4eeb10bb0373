// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the per-robot geometry index: link shapes, runtime collision
//! objects and the expected-overlap graph built from them.
use crate::collision::shape::{shapes_intersect, CollisionShape};
use crate::exception::{ArmException, ArmResult};
use crate::kinematics::KinematicModel;
use nalgebra::{DVector, Isometry3};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Pairs of entries whose shapes overlap in the reference configuration.
///
/// Adjacent links and deliberately nested objects touch permanently; without
/// this record every tick would report them as collisions. The graph is
/// rebuilt on structural changes only, never per tick, and building it twice
/// from the same topology yields an identical graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlapGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl OverlapGraph {
    fn insert(&mut self, a: &str, b: &str) {
        self.edges
            .entry(a.to_string())
            .or_insert_with(BTreeSet::new)
            .insert(b.to_string());
        self.edges
            .entry(b.to_string())
            .or_insert_with(BTreeSet::new)
            .insert(a.to_string());
    }

    /// Whether `a` and `b` are expected to overlap and must be excluded from
    /// collision reporting.
    pub fn overlaps(&self, a: &str, b: &str) -> bool {
        self.edges
            .get(a)
            .map(|set| set.contains(b))
            .unwrap_or(false)
    }

    /// The exclusion set of one entry, empty when it has none.
    pub fn excluded_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(|s| s.as_str()))
    }
}

/// Registry of everything that can collide: the shapes attached to robot
/// links (owned by the link tree) and dynamic objects added at runtime,
/// addressed by a caller-chosen key. Dynamic object poses are absolute in the
/// base frame.
#[derive(Debug, Clone, Default)]
pub struct CollisionIndex {
    dynamic: BTreeMap<String, CollisionShape>,
}

impl CollisionIndex {
    pub fn new() -> Self {
        CollisionIndex {
            dynamic: BTreeMap::new(),
        }
    }

    /// Registers a dynamic object under `key`.
    ///
    /// # Errors
    /// An existing key without `overwrite` is rejected and the registry is
    /// left unchanged.
    pub fn add_dynamic(
        &mut self,
        key: &str,
        object: CollisionShape,
        overwrite: bool,
    ) -> ArmResult<()> {
        if !overwrite && self.dynamic.contains_key(key) {
            return Err(ArmException::CommandException {
                message: format!(
                    "collision object {} already exists and overwrite was not requested",
                    key
                ),
            });
        }
        info!(key, "adding collision object");
        self.dynamic.insert(key.to_string(), object);
        Ok(())
    }

    /// Removes the dynamic object under `key`.
    ///
    /// # Errors
    /// An unknown key is a reported failure; nothing is mutated.
    pub fn remove_dynamic(&mut self, key: &str) -> ArmResult<CollisionShape> {
        match self.dynamic.remove(key) {
            Some(object) => {
                info!(key, "removed collision object");
                Ok(object)
            }
            None => Err(ArmException::UnknownCollisionObject {
                key: key.to_string(),
            }),
        }
    }

    pub fn dynamic_keys(&self) -> impl Iterator<Item = &str> {
        self.dynamic.keys().map(|key| key.as_str())
    }

    pub fn dynamic_objects(&self) -> impl Iterator<Item = (&str, &CollisionShape)> {
        self.dynamic
            .iter()
            .map(|(key, object)| (key.as_str(), object))
    }

    pub fn get_dynamic(&self, key: &str) -> Option<&CollisionShape> {
        self.dynamic.get(key)
    }

    /// Shapes registered for `name`, which may be a link or a dynamic key.
    ///
    /// An unknown name yields an empty slice; absence of collision data is
    /// not an error on the checking path.
    pub fn shapes_of<'a, M: KinematicModel>(
        &'a self,
        model: &'a M,
        name: &str,
    ) -> &'a [CollisionShape] {
        if let Some(link) = model.link_tree().get(name) {
            return &link.shapes;
        }
        if let Some(object) = self.dynamic.get(name) {
            return std::slice::from_ref(object);
        }
        debug!(name, "no collision data for entry");
        &[]
    }

    /// World pose of the frame that the shapes of `name` are posed in:
    /// the link frame for links, identity for dynamic objects (their poses
    /// are already absolute). `None` when the name is unknown.
    pub fn frame_of<M: KinematicModel>(
        &self,
        model: &M,
        q: &DVector<f64>,
        name: &str,
    ) -> Option<Isometry3<f64>> {
        if model.link_tree().contains(name) {
            return model.world_pose(q, name);
        }
        if self.dynamic.contains_key(name) {
            return Some(Isometry3::identity());
        }
        None
    }

    /// All entry names, links first, in deterministic order.
    pub fn entry_names<M: KinematicModel>(&self, model: &M) -> Vec<String> {
        let mut names: Vec<String> = model
            .link_tree()
            .names()
            .map(|name| name.to_string())
            .collect();
        names.extend(self.dynamic.keys().cloned());
        names
    }

    /// Builds the expected-overlap graph at configuration `q`.
    ///
    /// Every shape of every entry is tested against every shape of every
    /// other entry; intersecting pairs become exclusion edges. Runs at
    /// startup and after structural changes (object added or removed, link
    /// shapes reconfigured).
    pub fn build_overlap_graph<M: KinematicModel>(
        &self,
        model: &M,
        q: &DVector<f64>,
    ) -> OverlapGraph {
        let names = self.entry_names(model);
        let mut posed: Vec<(String, Vec<(Isometry3<f64>, CollisionShape)>)> = Vec::new();
        for name in names {
            let frame = match self.frame_of(model, q, &name) {
                Some(frame) => frame,
                None => continue,
            };
            let shapes: Vec<_> = self
                .shapes_of(model, &name)
                .iter()
                .map(|shape| (shape.world_pose(&frame), shape.clone()))
                .collect();
            if !shapes.is_empty() {
                posed.push((name, shapes));
            }
        }

        let mut graph = OverlapGraph::default();
        for i in 0..posed.len() {
            for j in (i + 1)..posed.len() {
                let hit = posed[i].1.iter().any(|(pose_a, shape_a)| {
                    posed[j].1.iter().any(|(pose_b, shape_b)| {
                        shapes_intersect(pose_a, &shape_a.shape, pose_b, &shape_b.shape)
                    })
                });
                if hit {
                    debug!(a = %posed[i].0, b = %posed[j].0, "expected overlap recorded");
                    graph.insert(&posed[i].0, &posed[j].0);
                }
            }
        }
        graph
    }
}
