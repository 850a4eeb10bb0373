// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains exception and Result definitions
use thiserror::Error;

/// Represents all kinds of errors a motion supervisor can report to a caller.
///
/// The per-tick control path never surfaces these: hot-path helpers degrade to
/// "no data" semantics instead. Only command and configuration handlers return
/// them.
#[derive(Error, Debug)]
pub enum ArmException {
    /// ConfigurationError is raised for missing or invalid links, shapes,
    /// end-effector designations and malformed configuration documents. The
    /// supervisor keeps running in its previous valid state.
    #[error("configuration error: {message}")]
    ConfigurationError { message: String },

    /// KinematicError is raised when a goal is infeasible before any motion
    /// starts: no inverse-kinematics solution, or the target lies within the
    /// singularity threshold.
    #[error("kinematic error: {message}")]
    KinematicError { message: String },

    /// SafetyViolation is raised when a goal or trajectory fails a collision
    /// or workspace check, or when motion was preempted by a safety fault.
    #[error("safety violation: {message}")]
    SafetyViolation { message: String },

    /// CommandException is raised for malformed command input, for commands
    /// rejected while the supervisor is in the error control mode, and for
    /// duplicate-key insertions without an overwrite flag.
    #[error("{message}")]
    CommandException { message: String },

    /// UnknownNamedPose is raised when a request names a pose that is not in
    /// the named-pose store. No state is mutated.
    #[error("unknown named pose: {name}")]
    UnknownNamedPose { name: String },

    /// UnknownCollisionObject is raised when removal or lookup names a key
    /// that is not in the dynamic-object registry. No state is mutated.
    #[error("unknown collision object: {key}")]
    UnknownCollisionObject { key: String },

    /// TimeoutException is raised when a bounded wait elapses, for example
    /// while waiting on the control tick gate. Recoverable; the caller may
    /// retry.
    #[error("{message}")]
    TimeoutException { message: String },
}

/// creates a CommandException from a static string slice
pub(crate) fn create_command_exception(message: &'static str) -> ArmException {
    ArmException::CommandException {
        message: message.to_string(),
    }
}

/// Result type which can have ArmException as Error
pub type ArmResult<T> = Result<T, ArmException>;

/// Outcome of a discrete command at the external boundary: a success flag and
/// an optional human-readable reason. There is no partial-success state.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl CommandOutcome {
    pub fn succeeded() -> Self {
        CommandOutcome {
            success: true,
            reason: None,
        }
    }

    pub fn failed<S: Into<String>>(reason: S) -> Self {
        CommandOutcome {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

impl From<ArmResult<()>> for CommandOutcome {
    fn from(result: ArmResult<()>) -> Self {
        match result {
            Ok(()) => CommandOutcome::succeeded(),
            Err(error) => CommandOutcome::failed(error.to_string()),
        }
    }
}
