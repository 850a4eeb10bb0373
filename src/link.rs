// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the kinematic link tree view used for collision bookkeeping.
//!
//! The tree does not compute kinematics; it records topology (name, parent,
//! joint index) and the collision shapes attached to each link. Forward
//! kinematics over the same links is a consumed capability, see
//! [`KinematicModel`](`crate::kinematics::KinematicModel`).
use crate::collision::shape::CollisionShape;
use crate::exception::{ArmException, ArmResult};
use std::collections::BTreeMap;
use tracing::warn;

/// A rigid body segment in the kinematic chain.
#[derive(Debug, Clone)]
pub struct Link {
    /// Unique name within a robot instance.
    pub name: String,
    /// Index of the parent link; `None` only for the root.
    pub parent: Option<usize>,
    /// Collision shapes attached to this link, posed in the link frame.
    pub shapes: Vec<CollisionShape>,
    /// Index into the joint vector, or `None` for fixed links.
    pub joint_index: Option<usize>,
}

impl Link {
    pub fn new(name: &str, parent: Option<usize>, joint_index: Option<usize>) -> Self {
        Link {
            name: name.to_string(),
            parent,
            shapes: Vec::new(),
            joint_index,
        }
    }

    pub fn with_shapes(mut self, shapes: Vec<CollisionShape>) -> Self {
        self.shapes = shapes;
        self
    }
}

/// Rooted tree of links stored as an arena with upward parent references.
#[derive(Debug, Clone)]
pub struct LinkTree {
    links: Vec<Link>,
    by_name: BTreeMap<String, usize>,
    root: usize,
}

impl LinkTree {
    /// Builds a tree from an arena of links.
    ///
    /// Link names must be unique, exactly one link must be parentless, and
    /// every parent index must refer into the arena. Violations are reported
    /// as configuration errors so the caller can abort construction or fall
    /// back to a previous valid model.
    pub fn new(links: Vec<Link>) -> ArmResult<Self> {
        if links.is_empty() {
            return Err(ArmException::ConfigurationError {
                message: "link tree is empty".to_string(),
            });
        }
        let mut by_name = BTreeMap::new();
        let mut root = None;
        for (index, link) in links.iter().enumerate() {
            if link.name.is_empty() {
                return Err(ArmException::ConfigurationError {
                    message: format!("link {} has an empty name", index),
                });
            }
            if by_name.insert(link.name.clone(), index).is_some() {
                return Err(ArmException::ConfigurationError {
                    message: format!("duplicate link name: {}", link.name),
                });
            }
            match link.parent {
                None => {
                    if root.is_some() {
                        return Err(ArmException::ConfigurationError {
                            message: format!("more than one root link, second is {}", link.name),
                        });
                    }
                    root = Some(index);
                }
                Some(parent) if parent >= links.len() => {
                    return Err(ArmException::ConfigurationError {
                        message: format!("link {} refers to missing parent {}", link.name, parent),
                    });
                }
                Some(_) => {}
            }
        }
        let root = root.ok_or_else(|| ArmException::ConfigurationError {
            message: "link tree has no root".to_string(),
        })?;
        Ok(LinkTree {
            links,
            by_name,
            root,
        })
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn root(&self) -> &Link {
        &self.links[self.root]
    }

    pub fn get(&self, name: &str) -> Option<&Link> {
        self.by_name.get(name).map(|&index| &self.links[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn parent_of(&self, name: &str) -> Option<&Link> {
        let link = self.get(name)?;
        link.parent.map(|index| &self.links[index])
    }

    pub fn children_of(&self, name: &str) -> Vec<&Link> {
        let parent_index = match self.by_name.get(name) {
            Some(&index) => index,
            None => return Vec::new(),
        };
        self.links
            .iter()
            .filter(|link| link.parent == Some(parent_index))
            .collect()
    }

    /// Names of all links, in deterministic (sorted) order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|name| name.as_str())
    }

    /// Chain of link names from `start` up to the root, `start` first.
    pub fn chain_to_root(&self, start: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.by_name.get(start).copied();
        while let Some(index) = current {
            chain.push(self.links[index].name.clone());
            current = self.links[index].parent;
        }
        chain
    }

    /// Resolves the end-effector link when none was configured: the first
    /// link whose parent carries more than one child (a mounting fork),
    /// otherwise the last link in the arena.
    pub fn resolve_end_effector(&self) -> &str {
        let mut seen: Vec<usize> = Vec::new();
        for link in &self.links {
            if let Some(parent) = link.parent {
                if seen.contains(&parent) {
                    return &self.links[parent].name;
                }
                seen.push(parent);
            }
        }
        &self.links[self.links.len() - 1].name
    }
}

/// The sub-chain of links actively checked for collisions.
///
/// Bounded by a start link (default: end-effector) and a stop link (default:
/// base); index 0 is the link nearest the stop link. Recomputed only when the
/// window bounds change, never per tick.
#[derive(Debug, Clone)]
pub struct SlicedLinkWindow {
    names: Vec<String>,
}

impl SlicedLinkWindow {
    /// Slices the chain between `start_link` and `stop_link` inclusive.
    ///
    /// An unknown bound, or a stop link that is not an ancestor of the start
    /// link, falls back to the full chain from `end_effector` to the root
    /// with a warning, matching configuration-error semantics (not fatal).
    pub fn new(
        tree: &LinkTree,
        end_effector: &str,
        start_link: Option<&str>,
        stop_link: Option<&str>,
    ) -> Self {
        let start = start_link.unwrap_or(end_effector);
        let stop = stop_link.unwrap_or_else(|| tree.root().name.as_str());

        if !tree.contains(start) || !tree.contains(stop) {
            warn!(
                start, stop,
                "invalid collision window bounds, defaulting to full link chain"
            );
            return SlicedLinkWindow::full_chain(tree, end_effector);
        }

        let chain = tree.chain_to_root(start);
        match chain.iter().position(|name| name == stop) {
            Some(stop_position) => {
                let mut names: Vec<String> = chain[..=stop_position].to_vec();
                names.reverse();
                SlicedLinkWindow { names }
            }
            None => {
                warn!(
                    start, stop,
                    "collision window stop link is not above the start link, \
                     defaulting to full link chain"
                );
                SlicedLinkWindow::full_chain(tree, end_effector)
            }
        }
    }

    fn full_chain(tree: &LinkTree, end_effector: &str) -> Self {
        let tip = if tree.contains(end_effector) {
            end_effector.to_string()
        } else {
            tree.resolve_end_effector().to_string()
        };
        let mut names = tree.chain_to_root(&tip);
        names.reverse();
        SlicedLinkWindow { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|candidate| candidate == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn three_link_tree() -> LinkTree {
        LinkTree::new(vec![
            Link::new("base", None, None),
            Link::new("upper", Some(0), Some(0)),
            Link::new("wrist", Some(1), Some(1)),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_names() {
        let result = LinkTree::new(vec![
            Link::new("base", None, None),
            Link::new("base", Some(0), Some(0)),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_two_roots() {
        let result = LinkTree::new(vec![
            Link::new("base", None, None),
            Link::new("floating", None, None),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn chain_walks_to_root() {
        let tree = three_link_tree();
        assert_eq!(tree.chain_to_root("wrist"), vec!["wrist", "upper", "base"]);
        assert_eq!(tree.parent_of("upper").unwrap().name, "base");
        assert_eq!(tree.children_of("base")[0].name, "upper");
    }

    #[test]
    fn window_index_zero_is_nearest_stop_link() {
        let tree = three_link_tree();
        let window = SlicedLinkWindow::new(&tree, "wrist", None, None);
        assert_eq!(window.names(), ["base", "upper", "wrist"]);
    }

    #[test]
    fn window_respects_explicit_bounds() {
        let tree = three_link_tree();
        let window = SlicedLinkWindow::new(&tree, "wrist", Some("wrist"), Some("upper"));
        assert_eq!(window.names(), ["upper", "wrist"]);
    }

    #[test]
    fn invalid_window_falls_back_to_full_chain() {
        let tree = three_link_tree();
        let window = SlicedLinkWindow::new(&tree, "wrist", Some("nonexistent"), None);
        assert_eq!(window.names(), ["base", "upper", "wrist"]);
        // Stop link below the start link is also invalid.
        let window = SlicedLinkWindow::new(&tree, "wrist", Some("upper"), Some("wrist"));
        assert_eq!(window.names(), ["base", "upper", "wrist"]);
    }

    #[test]
    fn end_effector_resolution_prefers_fork_parent() {
        let tree = LinkTree::new(vec![
            Link::new("base", None, None),
            Link::new("hand", Some(0), Some(0)),
            Link::new("finger_left", Some(1), None),
            Link::new("finger_right", Some(1), None),
        ])
        .unwrap();
        assert_eq!(tree.resolve_end_effector(), "hand");
    }
}
