// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the argument types of the supervisor command surface.
use nalgebra::Vector6;

/// A Cartesian velocity request.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityCommand {
    /// Twist as (linear xyz, angular xyz) in \[m/s\] and \[rad/s\].
    pub twist: Vector6<f64>,
    /// Link frame the twist is expressed in; `None` means the base frame.
    pub frame: Option<String>,
}

impl VelocityCommand {
    pub fn in_base_frame(twist: Vector6<f64>) -> Self {
        VelocityCommand { twist, frame: None }
    }

    pub fn in_frame(twist: Vector6<f64>, frame: &str) -> Self {
        VelocityCommand {
            twist,
            frame: Some(frame.to_string()),
        }
    }
}

/// Options shared by the discrete motion commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOptions {
    /// Total motion time in \[s\].
    pub duration: f64,
    /// Number of trajectory samples generated for the move.
    pub sample_count: usize,
    /// Skip the pre-execution trajectory collision check.
    pub collision_ignore: bool,
    /// Skip the workspace gate on the target.
    pub workspace_ignore: bool,
}

impl Default for MotionOptions {
    fn default() -> Self {
        MotionOptions {
            duration: 5.,
            sample_count: 100,
            collision_ignore: false,
            workspace_ignore: false,
        }
    }
}

impl MotionOptions {
    pub fn with_duration(duration: f64) -> Self {
        MotionOptions {
            duration,
            ..MotionOptions::default()
        }
    }
}
