// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the k-d tree used to prune collision candidates per tick.
//!
//! Narrow-phase intersection is only run against the few nearest candidate
//! entries of each checked link. The tree is rebuilt every tick from current
//! link and object positions; it holds points only, no shape data.
use nalgebra::Point3;

struct Node {
    name: String,
    point: Point3<f64>,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Three-dimensional k-d tree over named candidate positions.
pub struct SpatialPruner {
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl SpatialPruner {
    /// Fan-out used when the configuration does not override it.
    pub const DEFAULT_FAN_OUT: usize = 4;

    /// Builds the tree from named points. Duplicates by name are allowed and
    /// treated as distinct entries.
    pub fn build(points: Vec<(String, Point3<f64>)>) -> Self {
        let mut pruner = SpatialPruner {
            nodes: Vec::with_capacity(points.len()),
            root: None,
        };
        let mut entries = points;
        // Stable order before splitting keeps the tree shape deterministic
        // across rebuilds from the same positions.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        pruner.root = pruner.build_recursive(&mut entries[..], 0);
        pruner
    }

    fn build_recursive(
        &mut self,
        entries: &mut [(String, Point3<f64>)],
        depth: usize,
    ) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        let axis = depth % 3;
        entries.sort_by(|a, b| {
            a.1[axis]
                .partial_cmp(&b.1[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let median = entries.len() / 2;
        let (name, point) = entries[median].clone();
        let index = self.nodes.len();
        self.nodes.push(Node {
            name,
            point,
            axis,
            left: None,
            right: None,
        });
        let (lower, upper) = entries.split_at_mut(median);
        let left = self.build_recursive(lower, depth + 1);
        let right = self.build_recursive(&mut upper[1..], depth + 1);
        self.nodes[index].left = left;
        self.nodes[index].right = right;
        Some(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The up-to-`k` entries nearest to `origin`, ascending by distance.
    ///
    /// Fewer than `k` entries in the tree yields all of them. Distance ties
    /// break by name so the result is deterministic.
    pub fn nearest_candidates(&self, origin: &Point3<f64>, k: usize) -> Vec<(String, f64)> {
        if k == 0 {
            return Vec::new();
        }
        let mut best: Vec<(f64, &str)> = Vec::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search(root, origin, k, &mut best);
        }
        best.into_iter()
            .map(|(distance, name)| (name.to_string(), distance))
            .collect()
    }

    fn search<'a>(
        &'a self,
        index: usize,
        origin: &Point3<f64>,
        k: usize,
        best: &mut Vec<(f64, &'a str)>,
    ) {
        let node = &self.nodes[index];
        let distance = (node.point - origin).norm();
        let position = best
            .iter()
            .position(|(d, name)| {
                (distance, node.name.as_str()) < (*d, *name)
            })
            .unwrap_or(best.len());
        best.insert(position, (distance, &node.name));
        if best.len() > k {
            best.pop();
        }

        let delta = origin[node.axis] - node.point[node.axis];
        let (near, far) = if delta < 0. {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(near) = near {
            self.search(near, origin, k, best);
        }
        let worst = best.last().map(|(d, _)| *d).unwrap_or(f64::INFINITY);
        if let Some(far) = far {
            if best.len() < k || delta.abs() <= worst {
                self.search(far, origin, k, best);
            }
        }
    }
}
