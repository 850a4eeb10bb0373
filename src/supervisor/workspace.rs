// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the axis-aligned workspace gate applied to motion targets.
use crate::config::WorkspaceDocument;
use nalgebra::Point3;
use std::path::Path;
use tracing::{error, warn};

/// Gate that decides whether an end-effector target position is allowed.
///
/// Fails safe: a workspace document that exists but cannot be loaded or is
/// internally inconsistent rejects every target until it is fixed. No
/// document at all means no restriction.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceGate {
    /// No bounds configured; every target passes.
    Unbounded,
    /// Valid bounds; targets inside the box pass.
    Bounded(WorkspaceDocument),
    /// Bounds were configured but are unusable; every target is rejected.
    Invalid,
}

impl WorkspaceGate {
    /// Wraps a document, degrading inconsistent bounds (min above max) to
    /// the rejecting state.
    pub fn bounded(document: WorkspaceDocument) -> Self {
        let consistent = document.min_x <= document.max_x
            && document.min_y <= document.max_y
            && document.min_z <= document.max_z;
        let finite = [
            document.min_x,
            document.max_x,
            document.min_y,
            document.max_y,
            document.min_z,
            document.max_z,
        ]
        .iter()
        .all(|value| value.is_finite());
        if consistent && finite {
            WorkspaceGate::Bounded(document)
        } else {
            error!("workspace bounds are inconsistent, rejecting all targets");
            WorkspaceGate::Invalid
        }
    }

    /// Loads bounds from an optional document path.
    pub fn load(path: Option<&Path>) -> Self {
        match path {
            None => WorkspaceGate::Unbounded,
            Some(path) => match WorkspaceDocument::load(path) {
                Ok(document) => WorkspaceGate::bounded(document),
                Err(err) => {
                    warn!(path = %path.display(), error = %err,
                        "workspace document unusable, rejecting all targets");
                    WorkspaceGate::Invalid
                }
            },
        }
    }

    pub fn permits(&self, point: &Point3<f64>) -> bool {
        match self {
            WorkspaceGate::Unbounded => true,
            WorkspaceGate::Invalid => false,
            WorkspaceGate::Bounded(bounds) => {
                point.x >= bounds.min_x
                    && point.x <= bounds.max_x
                    && point.y >= bounds.min_y
                    && point.y <= bounds.max_y
                    && point.z >= bounds.min_z
                    && point.z <= bounds.max_z
            }
        }
    }
}

impl Default for WorkspaceGate {
    fn default() -> Self {
        WorkspaceGate::Unbounded
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bounds() -> WorkspaceDocument {
        WorkspaceDocument {
            min_x: -1.,
            max_x: 1.,
            min_y: -1.,
            max_y: 1.,
            min_z: 0.,
            max_z: 2.,
        }
    }

    #[test]
    fn unbounded_permits_everything() {
        let gate = WorkspaceGate::Unbounded;
        assert!(gate.permits(&Point3::new(1e6, -1e6, 0.)));
    }

    #[test]
    fn bounded_checks_each_axis() {
        let gate = WorkspaceGate::bounded(bounds());
        assert!(gate.permits(&Point3::new(0.5, -0.5, 1.)));
        assert!(!gate.permits(&Point3::new(1.5, 0., 1.)));
        assert!(!gate.permits(&Point3::new(0., 0., -0.1)));
    }

    #[test]
    fn inconsistent_bounds_reject_everything() {
        let mut document = bounds();
        document.min_x = 2.;
        let gate = WorkspaceGate::bounded(document);
        assert_eq!(gate, WorkspaceGate::Invalid);
        assert!(!gate.permits(&Point3::new(0., 0., 1.)));
    }

    #[test]
    fn missing_document_rejects_everything() {
        let gate = WorkspaceGate::load(Some(Path::new("/nonexistent/workspace.yaml")));
        assert!(!gate.permits(&Point3::origin()));
    }
}
