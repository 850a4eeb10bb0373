// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! # armctl
//!
//! armctl is a real-time motion supervisor for serial-link robot arms. It
//! turns discrete motion goals and streamed velocity commands into per-tick
//! joint velocity commands, and guards both with collision, workspace and
//! singularity checks.
//!
//! The crate supplies no kinematics and no transport. An integrator plugs a
//! [`KinematicModel`] in, feeds live joint states, drives
//! [`MotionSupervisor::step`] at a fixed rate and publishes the returned
//! command. Blocking commands such as [`MotionSupervisor::move_to_joint_pose`]
//! can run on other threads; they synchronize with the control loop through
//! the [`TickGate`].
//!
//! ## Safety model
//! * Startup builds an expected-overlap graph so permanently touching
//!   geometry is never reported as a collision.
//! * Each tick checks the live state over a sliced window of links against
//!   the nearest few candidates from a spatial pruning tree; verified states
//!   feed a recovery ring buffer.
//! * Discrete motions pass a workspace gate, a singularity gate and a
//!   trajectory collision check before anything moves.
//! * Faults stop the robot and latch the error mode; velocity commands are
//!   rejected until an explicit recovery.
//!
//! ## Example
//! ```
//! use armctl::{MotionSupervisor, PlanarArm, SupervisorConfig};
//! use nalgebra::DVector;
//!
//! fn main() -> armctl::ArmResult<()> {
//!     let supervisor =
//!         MotionSupervisor::new(PlanarArm::new(1.0, 0.5), SupervisorConfig::default())?;
//!     supervisor.feed_joint_state(&DVector::from_vec(vec![0.3, 1.2]), &DVector::zeros(2))?;
//!     let command = supervisor.step(0.01);
//!     assert_eq!(command.len(), 2);
//!     Ok(())
//! }
//! ```
pub mod collision;
pub mod command;
pub mod config;
pub mod exception;
pub mod kinematics;
pub mod link;
pub mod supervisor;
pub mod trajectory;

pub use collision::{CollisionChecker, CollisionIndex, CollisionShape, OverlapGraph, Shape};
pub use command::{MotionOptions, VelocityCommand};
pub use config::{CollisionObjectRecord, NamedPoseDocument, WorkspaceDocument};
pub use exception::{ArmException, ArmResult, CommandOutcome};
pub use kinematics::{KinematicModel, PlanarArm};
pub use link::{Link, LinkTree, SlicedLinkWindow};
pub use supervisor::gate::TickGate;
pub use supervisor::safe_window::SafeStateWindow;
pub use supervisor::workspace::WorkspaceGate;
pub use supervisor::{ControlMode, MotionSupervisor, SupervisorConfig};
pub use trajectory::{Trajectory, TrajectoryExecutor};
