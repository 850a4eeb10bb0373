// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the YAML configuration documents: named poses, collision scenes
//! and workspace bounds.
//!
//! Parse failures are configuration errors returned to the caller; they never
//! panic and never clobber previously loaded state.
use crate::collision::shape::{CollisionShape, Shape};
use crate::exception::{ArmException, ArmResult};
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

fn configuration_error<E: std::fmt::Display>(context: &str, error: E) -> ArmException {
    ArmException::ConfigurationError {
        message: format!("{}: {}", context, error),
    }
}

/// Document holding named joint configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedPoseDocument {
    #[serde(default)]
    pub named_poses: BTreeMap<String, Vec<f64>>,
}

impl NamedPoseDocument {
    pub fn load(path: &Path) -> ArmResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| configuration_error("reading named pose document", e))?;
        serde_yaml::from_str(&text)
            .map_err(|e| configuration_error("parsing named pose document", e))
    }

    pub fn save(&self, path: &Path) -> ArmResult<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| configuration_error("serializing named pose document", e))?;
        std::fs::write(path, text)
            .map_err(|e| configuration_error("writing named pose document", e))
    }

    /// Merges several documents in order; the first occurrence of a name
    /// wins, so custom paths listed before the system path take precedence.
    /// Unreadable documents are skipped with a warning.
    pub fn load_merged(paths: &[&Path]) -> Self {
        let mut merged = NamedPoseDocument::default();
        for path in paths {
            match NamedPoseDocument::load(path) {
                Ok(document) => {
                    for (name, pose) in document.named_poses {
                        merged.named_poses.entry(name).or_insert(pose);
                    }
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping named pose document");
                }
            }
        }
        merged
    }
}

fn default_scale() -> f64 {
    1.
}

fn default_rotation_w() -> f64 {
    1.
}

/// One collision object in a scene document.
///
/// The flat field layout is the established scene file format; unknown shape
/// kinds fail to convert, they do not fail to parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollisionObjectRecord {
    pub shape: String,
    #[serde(default)]
    pub radius: f64,
    #[serde(default)]
    pub length: f64,
    #[serde(default = "default_scale")]
    pub scale_x: f64,
    #[serde(default = "default_scale")]
    pub scale_y: f64,
    #[serde(default = "default_scale")]
    pub scale_z: f64,
    #[serde(default)]
    pub pos_x: f64,
    #[serde(default)]
    pub pos_y: f64,
    #[serde(default)]
    pub pos_z: f64,
    #[serde(default = "default_rotation_w")]
    pub rot_w: f64,
    #[serde(default)]
    pub rot_x: f64,
    #[serde(default)]
    pub rot_y: f64,
    #[serde(default)]
    pub rot_z: f64,
}

impl CollisionObjectRecord {
    /// Converts the record to a posed shape.
    ///
    /// # Errors
    /// Mesh objects are rejected as not yet supported; unknown kinds and
    /// non-positive dimensions are configuration errors.
    pub fn to_collision_shape(&self) -> ArmResult<CollisionShape> {
        let shape = match self.shape.as_str() {
            "sphere" => {
                if self.radius <= 0. {
                    return Err(ArmException::ConfigurationError {
                        message: format!("sphere radius must be positive, got {}", self.radius),
                    });
                }
                Shape::Sphere {
                    radius: self.radius,
                }
            }
            "cylinder" => {
                if self.radius <= 0. || self.length <= 0. {
                    return Err(ArmException::ConfigurationError {
                        message: "cylinder radius and length must be positive".to_string(),
                    });
                }
                Shape::Cylinder {
                    radius: self.radius,
                    length: self.length,
                }
            }
            "cuboid" => {
                if self.scale_x <= 0. || self.scale_y <= 0. || self.scale_z <= 0. {
                    return Err(ArmException::ConfigurationError {
                        message: "cuboid scale must be positive".to_string(),
                    });
                }
                Shape::Cuboid {
                    scale: [self.scale_x, self.scale_y, self.scale_z],
                }
            }
            "mesh" => {
                return Err(ArmException::CommandException {
                    message: "mesh collision objects are not yet supported".to_string(),
                });
            }
            other => {
                return Err(ArmException::ConfigurationError {
                    message: format!("unknown collision shape kind: {}", other),
                });
            }
        };
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(
            self.rot_w, self.rot_x, self.rot_y, self.rot_z,
        ));
        let pose = Isometry3::from_parts(
            Translation3::new(self.pos_x, self.pos_y, self.pos_z),
            rotation,
        );
        Ok(CollisionShape::new(shape, pose))
    }

    pub fn from_collision_shape(object: &CollisionShape) -> Self {
        let mut record = CollisionObjectRecord {
            shape: String::new(),
            radius: 0.,
            length: 0.,
            scale_x: 1.,
            scale_y: 1.,
            scale_z: 1.,
            pos_x: object.pose.translation.vector.x,
            pos_y: object.pose.translation.vector.y,
            pos_z: object.pose.translation.vector.z,
            rot_w: object.pose.rotation.w,
            rot_x: object.pose.rotation.i,
            rot_y: object.pose.rotation.j,
            rot_z: object.pose.rotation.k,
        };
        match object.shape {
            Shape::Sphere { radius } => {
                record.shape = "sphere".to_string();
                record.radius = radius;
            }
            Shape::Cylinder { radius, length } => {
                record.shape = "cylinder".to_string();
                record.radius = radius;
                record.length = length;
            }
            Shape::Cuboid { scale } => {
                record.shape = "cuboid".to_string();
                record.scale_x = scale[0];
                record.scale_y = scale[1];
                record.scale_z = scale[2];
            }
        }
        record
    }
}

/// A collision scene is a map of object keys to records.
pub type CollisionSceneDocument = BTreeMap<String, CollisionObjectRecord>;

pub fn load_collision_scene(path: &Path) -> ArmResult<CollisionSceneDocument> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| configuration_error("reading collision scene", e))?;
    let scene = serde_yaml::from_str(&text)
        .map_err(|e| configuration_error("parsing collision scene", e))?;
    info!(path = %path.display(), "loaded collision scene");
    Ok(scene)
}

pub fn save_collision_scene(path: &Path, scene: &CollisionSceneDocument) -> ArmResult<()> {
    let text = serde_yaml::to_string(scene)
        .map_err(|e| configuration_error("serializing collision scene", e))?;
    std::fs::write(path, text).map_err(|e| configuration_error("writing collision scene", e))?;
    info!(path = %path.display(), "saved collision scene");
    Ok(())
}

/// Workspace bounds document: an axis-aligned box in the base frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceDocument {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl WorkspaceDocument {
    pub fn load(path: &Path) -> ArmResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| configuration_error("reading workspace document", e))?;
        serde_yaml::from_str(&text)
            .map_err(|e| configuration_error("parsing workspace document", e))
    }

    pub fn save(&self, path: &Path) -> ArmResult<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| configuration_error("serializing workspace document", e))?;
        std::fs::write(path, text)
            .map_err(|e| configuration_error("writing workspace document", e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collision::shape::Shape;

    #[test]
    fn sphere_record_round_trips() {
        let record = CollisionObjectRecord {
            shape: "sphere".to_string(),
            radius: 0.25,
            length: 0.,
            scale_x: 1.,
            scale_y: 1.,
            scale_z: 1.,
            pos_x: 1.,
            pos_y: 2.,
            pos_z: 3.,
            rot_w: 1.,
            rot_x: 0.,
            rot_y: 0.,
            rot_z: 0.,
        };
        let object = record.to_collision_shape().unwrap();
        assert_eq!(object.shape, Shape::Sphere { radius: 0.25 });
        assert_eq!(object.pose.translation.vector.y, 2.);
        let back = CollisionObjectRecord::from_collision_shape(&object);
        assert_eq!(back, record);
    }

    #[test]
    fn mesh_record_is_rejected() {
        let record = CollisionObjectRecord {
            shape: "mesh".to_string(),
            radius: 0.,
            length: 0.,
            scale_x: 1.,
            scale_y: 1.,
            scale_z: 1.,
            pos_x: 0.,
            pos_y: 0.,
            pos_z: 0.,
            rot_w: 1.,
            rot_x: 0.,
            rot_y: 0.,
            rot_z: 0.,
        };
        assert!(record.to_collision_shape().is_err());
    }

    #[test]
    fn scene_document_parses_from_yaml() {
        let yaml = "crate_1:\n  shape: cuboid\n  scale_x: 0.4\n  scale_y: 0.4\n  scale_z: 0.3\n  pos_x: 0.5\nball:\n  shape: sphere\n  radius: 0.1\n  pos_z: 1.0\n";
        let scene: CollisionSceneDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scene.len(), 2);
        let cuboid = scene["crate_1"].to_collision_shape().unwrap();
        assert_eq!(
            cuboid.shape,
            Shape::Cuboid {
                scale: [0.4, 0.4, 0.3]
            }
        );
        let ball = scene["ball"].to_collision_shape().unwrap();
        assert_eq!(ball.pose.translation.vector.z, 1.0);
    }

    #[test]
    fn invalid_dimensions_are_configuration_errors() {
        let yaml = "shape: sphere\nradius: -0.1\n";
        let record: CollisionObjectRecord = serde_yaml::from_str(yaml).unwrap();
        assert!(record.to_collision_shape().is_err());
    }

    #[test]
    fn named_pose_merge_prefers_earlier_documents() {
        let dir = std::env::temp_dir().join("armctl_named_pose_merge_test");
        std::fs::create_dir_all(&dir).unwrap();
        let custom = dir.join("custom.yaml");
        let system = dir.join("system.yaml");
        std::fs::write(&custom, "named_poses:\n  ready: [0.1, 0.2]\n").unwrap();
        std::fs::write(&system, "named_poses:\n  ready: [9.0, 9.0]\n  stowed: [0.0, 3.0]\n")
            .unwrap();
        let merged =
            NamedPoseDocument::load_merged(&[custom.as_path(), system.as_path()]);
        assert_eq!(merged.named_poses["ready"], vec![0.1, 0.2]);
        assert_eq!(merged.named_poses["stowed"], vec![0.0, 3.0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn workspace_document_parses() {
        let yaml = "min_x: -1.0\nmax_x: 1.0\nmin_y: -1.0\nmax_y: 1.0\nmin_z: 0.0\nmax_z: 2.0\n";
        let doc: WorkspaceDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.max_z, 2.0);
        // A truncated document must not parse into permissive defaults.
        let truncated: Result<WorkspaceDocument, _> = serde_yaml::from_str("min_x: -1.0\n");
        assert!(truncated.is_err());
    }
}
