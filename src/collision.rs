// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the collision safety pipeline: shape primitives, the per-robot
//! geometry index with its startup overlap graph, the per-tick spatial
//! pruner, and the narrow-phase checker.
pub mod checker;
pub mod index;
pub mod pruner;
pub mod shape;

pub use checker::CollisionChecker;
pub use index::{CollisionIndex, OverlapGraph};
pub use pruner::SpatialPruner;
pub use shape::{shapes_intersect, CollisionShape, Shape};
