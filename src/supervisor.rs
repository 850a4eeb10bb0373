// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the motion supervisor: per-tick control, the command surface and
//! the safety gates around both.
//!
//! The supervisor owns no transport. A caller feeds it live joint states,
//! calls [`MotionSupervisor::step`] at a fixed rate and publishes the
//! returned joint velocity command. Blocking commands may run on other
//! threads; they synchronize with the control loop through the
//! [`TickGate`](`gate::TickGate`).
pub mod gate;
pub mod safe_window;
pub mod workspace;

use crate::collision::checker::CollisionChecker;
use crate::collision::index::{CollisionIndex, OverlapGraph};
use crate::command::{MotionOptions, VelocityCommand};
use crate::config::{
    load_collision_scene, save_collision_scene, CollisionObjectRecord, CollisionSceneDocument,
    NamedPoseDocument,
};
use crate::exception::{create_command_exception, ArmException, ArmResult, CommandOutcome};
use crate::kinematics::KinematicModel;
use crate::link::SlicedLinkWindow;
use crate::trajectory::{Trajectory, TrajectoryExecutor};
use gate::TickGate;
use nalgebra::{DVector, Isometry3, Point3, Translation3, UnitQuaternion, Vector3, Vector6};
use safe_window::SafeStateWindow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};
use workspace::WorkspaceGate;

/// Control mode of one supervised robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Joint-space velocity control, also used while an executor runs.
    Joints,
    /// Cartesian velocity tracking with pose-error feedback.
    Cartesian,
    /// Safety stop; velocity commands are rejected until recovery.
    Error,
}

/// Tunables of the supervisor. The defaults match the deployed values.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Manipulability at or below this value counts as singular.
    pub singularity_threshold: f64,
    /// Seconds without a fresh velocity command before decay starts.
    pub staleness_window: f64,
    /// Per-tick decay factor applied to stale velocity commands.
    pub velocity_decay: f64,
    /// Velocities below this magnitude snap to exactly zero.
    pub zero_snap: f64,
    /// Capacity of the verified-state history.
    pub safe_window_capacity: usize,
    /// Nearest-candidate fan-out of the collision pruner.
    pub fan_out: usize,
    /// Upper bound on interior samples evaluated by the pre-execution
    /// trajectory check.
    pub max_trajectory_checks: usize,
    /// Joint-space arrival cutoff of the executor.
    pub arrival_cutoff: f64,
    /// Gain on the Cartesian pose-error feedback.
    pub pose_tracking_gain: f64,
    /// Joint configuration of the home command; zeros when unset.
    pub home_configuration: Option<DVector<f64>>,
    /// Start link of the collision window; end-effector when unset.
    pub collision_start_link: Option<String>,
    /// Stop link of the collision window; base when unset.
    pub collision_stop_link: Option<String>,
    /// How long a blocking command waits for a single control tick.
    pub command_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            singularity_threshold: 0.02,
            staleness_window: 0.1,
            velocity_decay: 0.9,
            zero_snap: 1e-4,
            safe_window_capacity: SafeStateWindow::DEFAULT_CAPACITY,
            fan_out: crate::collision::pruner::SpatialPruner::DEFAULT_FAN_OUT,
            max_trajectory_checks: 10,
            arrival_cutoff: TrajectoryExecutor::DEFAULT_CUTOFF,
            pose_tracking_gain: 1.,
            home_configuration: None,
            collision_start_link: None,
            collision_stop_link: None,
            command_timeout: Duration::from_secs(1),
        }
    }
}

struct Inner {
    q: DVector<f64>,
    qd: DVector<f64>,
    mode: ControlMode,
    /// Commanded Cartesian twist in the base frame.
    e_v: Vector6<f64>,
    /// Target pose integrated from the commanded twist.
    e_p: Option<Isometry3<f64>>,
    /// Joint velocity command published each tick.
    j_v: DVector<f64>,
    /// Monotonic time of the last velocity command; 0 means none.
    last_update: f64,
    /// Monotonic seconds advanced by each tick.
    now: f64,
    executor: Option<TrajectoryExecutor>,
    executor_seq: u64,
    singularity_approached: bool,
    collision_approached: bool,
    preempted: bool,
    index: CollisionIndex,
    graph: OverlapGraph,
    window: SlicedLinkWindow,
    checker: CollisionChecker,
    safe_window: SafeStateWindow,
    workspace: WorkspaceGate,
    named_poses: BTreeMap<String, Vec<f64>>,
    guard_deadline: Option<f64>,
    last_rejection_log: f64,
}

/// Real-time motion supervisor around one kinematic model.
pub struct MotionSupervisor<M: KinematicModel> {
    model: M,
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    gate: TickGate,
}

impl<M: KinematicModel> MotionSupervisor<M> {
    /// Creates a supervisor in the joints mode at the zero configuration.
    ///
    /// # Errors
    /// A model without joints is a configuration error.
    pub fn new(model: M, config: SupervisorConfig) -> ArmResult<Self> {
        let dof = model.dof();
        if dof == 0 {
            return Err(ArmException::ConfigurationError {
                message: "kinematic model has no joints".to_string(),
            });
        }
        let end_effector = if model.link_tree().contains(model.end_effector()) {
            model.end_effector().to_string()
        } else {
            let fallback = model.link_tree().resolve_end_effector().to_string();
            warn!(
                configured = model.end_effector(),
                fallback = %fallback,
                "configured end-effector is not in the link tree"
            );
            fallback
        };
        let window = SlicedLinkWindow::new(
            model.link_tree(),
            &end_effector,
            config.collision_start_link.as_deref(),
            config.collision_stop_link.as_deref(),
        );
        let q = DVector::zeros(dof);
        let index = CollisionIndex::new();
        let graph = index.build_overlap_graph(&model, &q);
        let mut checker = CollisionChecker::new();
        checker.fan_out = config.fan_out;
        checker.max_trajectory_checks = config.max_trajectory_checks;
        let inner = Inner {
            qd: DVector::zeros(dof),
            j_v: DVector::zeros(dof),
            q,
            mode: ControlMode::Joints,
            e_v: Vector6::zeros(),
            e_p: None,
            last_update: 0.,
            now: 0.,
            executor: None,
            executor_seq: 0,
            singularity_approached: false,
            collision_approached: false,
            preempted: false,
            index,
            graph,
            window,
            checker,
            safe_window: SafeStateWindow::new(config.safe_window_capacity),
            workspace: WorkspaceGate::Unbounded,
            named_poses: BTreeMap::new(),
            guard_deadline: None,
            last_rejection_log: f64::NEG_INFINITY,
        };
        Ok(MotionSupervisor {
            model,
            config,
            inner: Mutex::new(inner),
            gate: TickGate::new(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Gate set at the end of every tick; blocking handlers wait on it.
    pub fn tick_gate(&self) -> &TickGate {
        &self.gate
    }

    /// Updates the live joint state from the robot feed.
    pub fn feed_joint_state(&self, q: &DVector<f64>, qd: &DVector<f64>) -> ArmResult<()> {
        if q.len() != self.model.dof() || qd.len() != self.model.dof() {
            return Err(create_command_exception(
                "joint state dimension does not match the model",
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.q = q.clone();
        inner.qd = qd.clone();
        Ok(())
    }

    pub fn mode(&self) -> ControlMode {
        self.inner.lock().unwrap().mode
    }

    pub fn is_preempted(&self) -> bool {
        self.inner.lock().unwrap().preempted
    }

    pub fn joint_state(&self) -> (DVector<f64>, DVector<f64>) {
        let inner = self.inner.lock().unwrap();
        (inner.q.clone(), inner.qd.clone())
    }

    /// Runs one control tick and returns the joint velocity command to
    /// publish.
    ///
    /// The pipeline: act on sticky safety flags, check the live state for
    /// singularity, expire the velocity guard, produce the command (executor
    /// first, otherwise mode-dependent), run the per-tick collision check to
    /// feed the safe-state history, and finally signal the tick gate.
    pub fn step(&self, dt: f64) -> DVector<f64> {
        let dof = self.model.dof();
        let command;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.now += dt;

            if inner.singularity_approached || inner.collision_approached {
                self.preempt_locked(inner);
            }
            if inner.mode != ControlMode::Error {
                let manipulability = self.model.manipulability(&inner.q);
                if manipulability <= self.config.singularity_threshold {
                    warn!(manipulability, "approaching a singularity, stopping");
                    inner.singularity_approached = true;
                    self.preempt_locked(inner);
                }
            }
            if let Some(deadline) = inner.guard_deadline {
                if inner.now >= deadline {
                    info!("guarded velocity duration elapsed, stopping");
                    inner.guard_deadline = None;
                    inner.e_v = Vector6::zeros();
                    inner.e_p = None;
                    inner.j_v = DVector::zeros(dof);
                    if inner.mode == ControlMode::Cartesian {
                        inner.mode = ControlMode::Joints;
                    }
                }
            }

            if inner.executor.is_some() {
                let q = inner.q.clone();
                let qd = inner.qd.clone();
                if let Some(executor) = inner.executor.as_mut() {
                    inner.j_v = executor.step(dt, &q, &qd);
                }
            } else {
                match inner.mode {
                    ControlMode::Error => inner.j_v = DVector::zeros(dof),
                    ControlMode::Cartesian => self.cartesian_tick(inner, dt),
                    ControlMode::Joints => {
                        if inner.now - inner.last_update >= self.config.staleness_window {
                            inner.j_v *= self.config.velocity_decay;
                            if inner.j_v.amax() < self.config.zero_snap {
                                inner.j_v = DVector::zeros(dof);
                            }
                        }
                    }
                }
            }
            command = inner.j_v.clone();

            // Recovery motions run while preempted; the faulted state is
            // neither latched as a new fault nor recorded as safe.
            if !inner.preempted {
                let q = inner.q.clone();
                let colliding = inner.checker.is_state_in_collision(
                    &self.model,
                    &inner.index,
                    &inner.graph,
                    &inner.window,
                    &q,
                );
                if colliding {
                    if !inner.collision_approached {
                        warn!("live state is in collision, stopping");
                    }
                    inner.collision_approached = true;
                } else {
                    inner.safe_window.push(q);
                }
            }
        }
        self.gate.set();
        command
    }

    fn cartesian_tick(&self, inner: &mut Inner, dt: f64) {
        let dof = self.model.dof();
        if inner.now - inner.last_update >= self.config.staleness_window {
            inner.e_v *= self.config.velocity_decay;
            if inner.e_v.amax() < self.config.zero_snap {
                inner.e_v = Vector6::zeros();
            }
            if inner.e_v == Vector6::zeros() {
                inner.mode = ControlMode::Joints;
                inner.e_p = None;
                inner.j_v = DVector::zeros(dof);
                return;
            }
        }
        let current = match self.model.world_pose(&inner.q, self.model.end_effector()) {
            Some(pose) => pose,
            None => {
                error!("end-effector pose unavailable, commanding zero");
                inner.j_v = DVector::zeros(dof);
                return;
            }
        };
        let previous_target = inner.e_p.unwrap_or(current);
        let linear = Vector3::new(inner.e_v[0], inner.e_v[1], inner.e_v[2]);
        let angular = Vector3::new(inner.e_v[3], inner.e_v[4], inner.e_v[5]);
        let target = Isometry3::from_parts(
            Translation3::from(previous_target.translation.vector + linear * dt),
            UnitQuaternion::from_scaled_axis(angular * dt) * previous_target.rotation,
        );
        inner.e_p = Some(target);

        let position_error = target.translation.vector - current.translation.vector;
        let orientation_error = (target.rotation * current.rotation.inverse()).scaled_axis();
        let mut total = inner.e_v;
        for axis in 0..3 {
            total[axis] += self.config.pose_tracking_gain * position_error[axis];
            total[axis + 3] += self.config.pose_tracking_gain * orientation_error[axis];
        }
        match self.model.jacobian(&inner.q).pseudo_inverse(1e-6) {
            Ok(pinv) => {
                let total = DVector::from_iterator(6, total.iter().cloned());
                inner.j_v = &pinv * total;
            }
            Err(reason) => {
                warn!(reason, "jacobian pseudo-inverse failed, commanding zero");
                inner.j_v = DVector::zeros(dof);
            }
        }
    }

    fn preempt_locked(&self, inner: &mut Inner) {
        if let Some(executor) = inner.executor.as_mut() {
            executor.abort();
        }
        if inner.singularity_approached {
            warn!("preempting: singularity was approached");
            inner.singularity_approached = false;
        }
        if inner.collision_approached {
            warn!("preempting: collision was approached");
            inner.collision_approached = false;
        }
        inner.preempted = true;
        inner.mode = ControlMode::Error;
        inner.e_v = Vector6::zeros();
        inner.e_p = None;
        inner.j_v = DVector::zeros(self.model.dof());
        inner.last_update = 0.;
        inner.guard_deadline = None;
    }

    /// Safety stop: aborts any motion, surfaces and clears the sticky safety
    /// flags and enters the error mode.
    pub fn preempt(&self) {
        let mut guard = self.inner.lock().unwrap();
        self.preempt_locked(&mut guard);
    }

    /// Lighter stop used when tracking should end without entering the error
    /// mode: aborts any motion and zeroes all velocity state.
    pub fn preempt_tracking(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(executor) = inner.executor.as_mut() {
            executor.abort();
        }
        inner.mode = ControlMode::Joints;
        inner.e_v = Vector6::zeros();
        inner.e_p = None;
        inner.j_v = DVector::zeros(self.model.dof());
        inner.last_update = 0.;
        inner.guard_deadline = None;
    }

    /// Leaves the error mode without moving.
    pub fn recover(&self) -> CommandOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == ControlMode::Error {
            info!("recovered from error mode");
            inner.mode = ControlMode::Joints;
        }
        inner.preempted = false;
        CommandOutcome::succeeded()
    }

    /// Rewinds to the oldest verified collision-free state, then recovers.
    ///
    /// The rewind motion skips the collision and workspace gates: the whole
    /// point is escaping a region those gates would reject.
    pub fn recover_move(&self, options: MotionOptions) -> CommandOutcome {
        let target = {
            let inner = self.inner.lock().unwrap();
            inner.safe_window.recovery_state().cloned()
        };
        let target = match target {
            Some(target) => target,
            None => return CommandOutcome::failed("no verified safe state recorded yet"),
        };
        let options = MotionOptions {
            collision_ignore: true,
            workspace_ignore: true,
            ..options
        };
        match self.general_executor(&target, options) {
            Ok(()) => self.recover(),
            Err(error) => CommandOutcome::failed(error.to_string()),
        }
    }

    fn reject_in_error_mode(&self, inner: &mut Inner) -> bool {
        if inner.mode != ControlMode::Error {
            return false;
        }
        // Velocity streams arrive at tick rate; log at most once a second.
        if inner.now - inner.last_rejection_log >= 1. {
            error!("velocity command rejected: supervisor is in the error mode");
            inner.last_rejection_log = inner.now;
        }
        true
    }

    /// Streams a Cartesian velocity command.
    ///
    /// Preempts any running motion, switches to the Cartesian mode and
    /// refreshes the staleness stamp. Rejected in the error mode.
    pub fn set_cartesian_velocity(&self, command: &VelocityCommand) -> CommandOutcome {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if self.reject_in_error_mode(inner) {
            return CommandOutcome::failed("velocity commands are rejected in the error mode");
        }
        let twist = match &command.frame {
            None => command.twist,
            Some(frame) => match self.model.world_pose(&inner.q, frame) {
                Some(pose) => {
                    let rotation = pose.rotation;
                    let linear =
                        rotation * Vector3::new(command.twist[0], command.twist[1], command.twist[2]);
                    let angular =
                        rotation * Vector3::new(command.twist[3], command.twist[4], command.twist[5]);
                    Vector6::new(
                        linear[0], linear[1], linear[2], angular[0], angular[1], angular[2],
                    )
                }
                None => {
                    return CommandOutcome::failed(format!("unknown twist frame: {}", frame));
                }
            },
        };
        if let Some(executor) = inner.executor.as_mut() {
            executor.abort();
        }
        inner.executor = None;
        inner.executor_seq += 1;
        inner.guard_deadline = None;
        inner.mode = ControlMode::Cartesian;
        inner.e_v = twist;
        inner.last_update = inner.now;
        CommandOutcome::succeeded()
    }

    /// Streams a raw joint velocity command.
    pub fn set_joint_velocity(&self, qd: &DVector<f64>) -> CommandOutcome {
        if qd.len() != self.model.dof() {
            return CommandOutcome::failed(format!(
                "joint velocity has {} entries, model has {} joints",
                qd.len(),
                self.model.dof()
            ));
        }
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if self.reject_in_error_mode(inner) {
            return CommandOutcome::failed("velocity commands are rejected in the error mode");
        }
        if let Some(executor) = inner.executor.as_mut() {
            executor.abort();
        }
        inner.executor = None;
        inner.executor_seq += 1;
        inner.guard_deadline = None;
        inner.mode = ControlMode::Joints;
        inner.e_v = Vector6::zeros();
        inner.e_p = None;
        inner.j_v = qd.clone();
        inner.last_update = inner.now;
        CommandOutcome::succeeded()
    }

    /// Streams a Cartesian velocity bounded by a duration guard; the command
    /// stops on its own once the guard elapses.
    pub fn set_guarded_velocity(
        &self,
        command: &VelocityCommand,
        duration: f64,
    ) -> CommandOutcome {
        if duration <= 0. || !duration.is_finite() {
            return CommandOutcome::failed("guard duration must be positive");
        }
        let outcome = self.set_cartesian_velocity(command);
        if outcome.success {
            let mut inner = self.inner.lock().unwrap();
            let deadline = inner.now + duration;
            inner.guard_deadline = Some(deadline);
        }
        outcome
    }

    /// Moves to a joint configuration, blocking until the motion ends.
    pub fn move_to_joint_pose(
        &self,
        target: &DVector<f64>,
        options: MotionOptions,
    ) -> CommandOutcome {
        if target.len() != self.model.dof() {
            return CommandOutcome::failed(format!(
                "target has {} entries, model has {} joints",
                target.len(),
                self.model.dof()
            ));
        }
        self.general_executor(target, options).into()
    }

    /// Moves the end-effector to a Cartesian pose, blocking until the motion
    /// ends.
    pub fn move_to_pose(&self, pose: &Isometry3<f64>, options: MotionOptions) -> CommandOutcome {
        let seed = self.inner.lock().unwrap().q.clone();
        match self.model.inverse_kinematics(pose, &seed) {
            Some(target) => self.general_executor(&target, options).into(),
            None => CommandOutcome::from(Err(ArmException::KinematicError {
                message: "no inverse kinematics solution for the requested pose".to_string(),
            })),
        }
    }

    /// Moves to a stored named pose, blocking until the motion ends.
    pub fn move_to_named_pose(&self, name: &str, options: MotionOptions) -> CommandOutcome {
        let target = {
            let inner = self.inner.lock().unwrap();
            inner.named_poses.get(name).cloned()
        };
        let target = match target {
            Some(values) => values,
            None => {
                return CommandOutcome::from(Err(ArmException::UnknownNamedPose {
                    name: name.to_string(),
                }))
            }
        };
        if target.len() != self.model.dof() {
            return CommandOutcome::failed(format!(
                "named pose {} has {} entries, model has {} joints",
                name,
                target.len(),
                self.model.dof()
            ));
        }
        self.general_executor(&DVector::from_vec(target), options).into()
    }

    /// Moves to the home configuration.
    ///
    /// Homing clears the error mode whether or not the motion itself goes
    /// through, so a rejected or failed homing attempt still leaves the arm
    /// ready for regular commands.
    pub fn home(&self, options: MotionOptions) -> CommandOutcome {
        let target = self
            .config
            .home_configuration
            .clone()
            .unwrap_or_else(|| DVector::zeros(self.model.dof()));
        let result = self.general_executor(&target, options);
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode == ControlMode::Error {
                info!("homing cleared the error mode");
                inner.mode = ControlMode::Joints;
            }
            inner.preempted = false;
        }
        result.into()
    }

    /// Plans and executes a move to `target`, blocking until it finishes.
    ///
    /// Gate order: workspace, singularity, trajectory generation, trajectory
    /// collision check, execution. A rejection leaves the control mode and
    /// all command state untouched.
    fn general_executor(&self, target: &DVector<f64>, options: MotionOptions) -> ArmResult<()> {
        let my_seq;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if !options.workspace_ignore {
                let point = self
                    .model
                    .world_pose(target, self.model.end_effector())
                    .map(|pose| Point3::from(pose.translation.vector));
                match point {
                    Some(point) if inner.workspace.permits(&point) => {}
                    Some(point) => {
                        return Err(ArmException::SafetyViolation {
                            message: format!(
                                "target end-effector position ({:.3}, {:.3}, {:.3}) is outside the workspace",
                                point.x, point.y, point.z
                            ),
                        });
                    }
                    None => {
                        return Err(ArmException::KinematicError {
                            message: "cannot resolve the end-effector pose of the target"
                                .to_string(),
                        });
                    }
                }
            }
            let manipulability = self.model.manipulability(target);
            if manipulability <= self.config.singularity_threshold {
                return Err(ArmException::KinematicError {
                    message: format!(
                        "target manipulability {:.4} is at or below the singularity threshold",
                        manipulability
                    ),
                });
            }
            let trajectory = Trajectory::point_to_point(
                &inner.q,
                target,
                options.duration.max(1e-3),
                options.sample_count,
            );
            if !options.collision_ignore
                && !inner.checker.is_trajectory_clear(
                    &self.model,
                    &inner.index,
                    &inner.graph,
                    &inner.window,
                    &trajectory,
                )
            {
                return Err(ArmException::SafetyViolation {
                    message: "planned trajectory is in collision".to_string(),
                });
            }
            if let Some(executor) = inner.executor.as_mut() {
                executor.abort();
            }
            let mut executor = TrajectoryExecutor::new(trajectory);
            executor.cutoff = self.config.arrival_cutoff;
            inner.executor = Some(executor);
            inner.executor_seq += 1;
            my_seq = inner.executor_seq;
            if inner.mode != ControlMode::Error {
                inner.mode = ControlMode::Joints;
            }
            inner.e_v = Vector6::zeros();
            inner.e_p = None;
            inner.guard_deadline = None;
            inner.last_update = inner.now;
        }

        loop {
            if let Err(error) = self.gate.wait_for_tick(self.config.command_timeout) {
                // The tick source went quiet. The executor installed above is
                // still ours unless a newer command replaced it, in which case
                // the replacement owns the cleanup.
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                if inner.executor_seq == my_seq {
                    if let Some(executor) = inner.executor.as_mut() {
                        executor.abort();
                    }
                    inner.executor = None;
                    inner.j_v = DVector::zeros(self.model.dof());
                }
                return Err(error);
            }
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.executor_seq != my_seq {
                return Err(create_command_exception(
                    "motion was preempted by a newer command",
                ));
            }
            let q = inner.q.clone();
            let done = match inner.executor.as_mut() {
                None => {
                    return Err(ArmException::SafetyViolation {
                        message: "motion was preempted".to_string(),
                    })
                }
                Some(executor) => executor.is_finished(&q),
            };
            if done {
                let succeeded = inner
                    .executor
                    .as_ref()
                    .map(|executor| executor.is_succeeded())
                    .unwrap_or(false);
                inner.executor = None;
                inner.j_v = DVector::zeros(self.model.dof());
                return if succeeded {
                    Ok(())
                } else {
                    Err(ArmException::SafetyViolation {
                        message: "trajectory execution did not complete successfully".to_string(),
                    })
                };
            }
        }
    }

    /// Adds a collision object and rebuilds the overlap graph.
    pub fn add_collision_object(
        &self,
        key: &str,
        record: &CollisionObjectRecord,
        overwrite: bool,
    ) -> CommandOutcome {
        let result = (|| {
            let object = record.to_collision_shape()?;
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.index.add_dynamic(key, object, overwrite)?;
            inner.graph = inner.index.build_overlap_graph(&self.model, &inner.q);
            Ok(())
        })();
        result.into()
    }

    /// Removes a collision object and rebuilds the overlap graph.
    pub fn remove_collision_object(&self, key: &str) -> CommandOutcome {
        let result = (|| {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.index.remove_dynamic(key)?;
            inner.graph = inner.index.build_overlap_graph(&self.model, &inner.q);
            Ok(())
        })();
        result.into()
    }

    pub fn collision_object_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.index.dynamic_keys().map(str::to_string).collect()
    }

    /// Writes the current dynamic objects as a scene document.
    pub fn save_collision_scene(&self, path: &Path) -> CommandOutcome {
        let scene: CollisionSceneDocument = {
            let inner = self.inner.lock().unwrap();
            inner
                .index
                .dynamic_objects()
                .map(|(key, object)| {
                    (
                        key.to_string(),
                        CollisionObjectRecord::from_collision_shape(object),
                    )
                })
                .collect()
        };
        save_collision_scene(path, &scene).into()
    }

    /// Loads a scene document, replacing objects under colliding keys, and
    /// rebuilds the overlap graph once at the end.
    pub fn load_collision_scene(&self, path: &Path) -> CommandOutcome {
        let result = (|| {
            let scene = load_collision_scene(path)?;
            let mut objects = Vec::with_capacity(scene.len());
            for (key, record) in &scene {
                objects.push((key.clone(), record.to_collision_shape()?));
            }
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            for (key, object) in objects {
                inner.index.add_dynamic(&key, object, true)?;
            }
            inner.graph = inner.index.build_overlap_graph(&self.model, &inner.q);
            Ok(())
        })();
        result.into()
    }

    pub fn set_collision_debug(&self, enabled: bool) {
        self.inner.lock().unwrap().checker.debug = enabled;
    }

    /// Candidate sets recorded by the last per-tick check while collision
    /// debug was enabled.
    pub fn collision_candidates(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.lock().unwrap().checker.last_candidates().clone()
    }

    /// Stores the current joint configuration under `name`.
    pub fn add_named_pose(&self, name: &str, overwrite: bool) -> CommandOutcome {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if !overwrite && inner.named_poses.contains_key(name) {
            return CommandOutcome::failed(format!(
                "named pose {} already exists and overwrite was not requested",
                name
            ));
        }
        let pose = inner.q.iter().cloned().collect();
        inner.named_poses.insert(name.to_string(), pose);
        info!(name, "stored named pose");
        CommandOutcome::succeeded()
    }

    pub fn remove_named_pose(&self, name: &str) -> CommandOutcome {
        let mut inner = self.inner.lock().unwrap();
        match inner.named_poses.remove(name) {
            Some(_) => CommandOutcome::succeeded(),
            None => CommandOutcome::from(Err(ArmException::UnknownNamedPose {
                name: name.to_string(),
            })),
        }
    }

    pub fn named_poses(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.named_poses.keys().cloned().collect()
    }

    /// Merges named poses from the given documents into the store; earlier
    /// paths take precedence, existing entries are kept.
    pub fn load_named_poses(&self, paths: &[&Path]) {
        let document = NamedPoseDocument::load_merged(paths);
        let mut inner = self.inner.lock().unwrap();
        for (name, pose) in document.named_poses {
            inner.named_poses.entry(name).or_insert(pose);
        }
    }

    pub fn save_named_poses(&self, path: &Path) -> CommandOutcome {
        let document = {
            let inner = self.inner.lock().unwrap();
            NamedPoseDocument {
                named_poses: inner.named_poses.clone(),
            }
        };
        document.save(path).into()
    }

    pub fn set_workspace(&self, workspace: WorkspaceGate) {
        self.inner.lock().unwrap().workspace = workspace;
    }

    pub fn load_workspace(&self, path: Option<&Path>) {
        let workspace = WorkspaceGate::load(path);
        self.set_workspace(workspace);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::WorkspaceDocument;
    use crate::kinematics::PlanarArm;
    use std::sync::Arc;
    use std::thread;

    fn vector(values: &[f64]) -> DVector<f64> {
        DVector::from_vec(values.to_vec())
    }

    fn make() -> MotionSupervisor<PlanarArm> {
        MotionSupervisor::new(PlanarArm::new(1.0, 0.5), SupervisorConfig::default()).unwrap()
    }

    /// Bent start configuration, well away from the stretched singularity.
    fn bent() -> DVector<f64> {
        vector(&[0.3, 1.2])
    }

    fn sphere_record(x: f64, y: f64, radius: f64) -> CollisionObjectRecord {
        CollisionObjectRecord {
            shape: "sphere".to_string(),
            radius,
            length: 0.,
            scale_x: 1.,
            scale_y: 1.,
            scale_z: 1.,
            pos_x: x,
            pos_y: y,
            pos_z: 0.,
            rot_w: 1.,
            rot_x: 0.,
            rot_y: 0.,
            rot_z: 0.,
        }
    }

    /// Ticks the supervisor while integrating a perfect velocity plant until
    /// the worker thread finishes.
    fn tick_until_finished(
        supervisor: &Arc<MotionSupervisor<PlanarArm>>,
        worker: &thread::JoinHandle<CommandOutcome>,
        start: DVector<f64>,
    ) -> DVector<f64> {
        let dt = 0.01;
        let mut q = start;
        let mut qd = vector(&[0., 0.]);
        while !worker.is_finished() {
            let command = supervisor.step(dt);
            q += &command * dt;
            qd = command;
            supervisor.feed_joint_state(&q, &qd).unwrap();
        }
        q
    }

    #[test]
    fn joint_move_completes_and_reports_success() {
        let supervisor = Arc::new(make());
        let start = bent();
        supervisor
            .feed_joint_state(&start, &vector(&[0., 0.]))
            .unwrap();
        let target = vector(&[0.8, 0.9]);
        let worker = {
            let supervisor = supervisor.clone();
            let target = target.clone();
            thread::spawn(move || {
                supervisor.move_to_joint_pose(
                    &target,
                    MotionOptions {
                        duration: 0.5,
                        sample_count: 50,
                        ..MotionOptions::default()
                    },
                )
            })
        };
        let q = tick_until_finished(&supervisor, &worker, start);
        let outcome = worker.join().unwrap();
        assert!(outcome.success, "move failed: {:?}", outcome.reason);
        assert!((&q - &target).norm() < 0.05);
        assert_eq!(supervisor.mode(), ControlMode::Joints);
    }

    #[test]
    fn move_into_an_obstacle_is_rejected_without_state_change() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        // The target puts the tool at roughly (0.63, 1.21); park an obstacle
        // there.
        let outcome =
            supervisor.add_collision_object("obstacle", &sphere_record(0.632, 1.213, 0.1), false);
        assert!(outcome.success);
        let outcome =
            supervisor.move_to_joint_pose(&vector(&[0.8, 0.9]), MotionOptions::default());
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("collision"));
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        // Ignoring the collision check lets the same motion through the
        // planning gates.
        let worker_supervisor = Arc::new(supervisor);
        let target = vector(&[0.8, 0.9]);
        let worker = {
            let supervisor = worker_supervisor.clone();
            let target = target.clone();
            thread::spawn(move || {
                supervisor.move_to_joint_pose(
                    &target,
                    MotionOptions {
                        duration: 0.3,
                        sample_count: 30,
                        collision_ignore: true,
                        ..MotionOptions::default()
                    },
                )
            })
        };
        tick_until_finished(&worker_supervisor, &worker, bent());
        // Execution itself may stop early once the live state actually
        // touches the obstacle; the gates must not have blocked it.
        let outcome = worker.join().unwrap();
        assert!(
            outcome.success
                || !outcome.reason.unwrap_or_default().contains("planned trajectory")
        );
    }

    #[test]
    fn stale_cartesian_command_decays_to_joints_mode() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        let outcome = supervisor.set_cartesian_velocity(&VelocityCommand::in_base_frame(
            Vector6::new(0.05, 0., 0., 0., 0., 0.),
        ));
        assert!(outcome.success);
        assert_eq!(supervisor.mode(), ControlMode::Cartesian);
        let first = supervisor.step(0.01);
        assert!(first.amax() > 0.);
        // No further commands arrive; the twist decays and the mode drops
        // back to joints.
        let mut last = first;
        for _ in 0..300 {
            last = supervisor.step(0.01);
        }
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        assert_eq!(last.amax(), 0.);
    }

    #[test]
    fn singular_target_is_rejected() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        let outcome =
            supervisor.move_to_joint_pose(&vector(&[0.5, 0.]), MotionOptions::default());
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("singularity"));
        assert_eq!(supervisor.mode(), ControlMode::Joints);
    }

    #[test]
    fn singular_live_state_preempts_into_error_mode() {
        let supervisor = make();
        // The stretched configuration is singular.
        supervisor
            .feed_joint_state(&vector(&[0.3, 0.]), &vector(&[0., 0.]))
            .unwrap();
        supervisor.step(0.01);
        assert_eq!(supervisor.mode(), ControlMode::Error);
        assert!(supervisor.is_preempted());
    }

    #[test]
    fn workspace_gate_rejects_targets_outside_the_box() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        supervisor.set_workspace(WorkspaceGate::bounded(WorkspaceDocument {
            min_x: -0.1,
            max_x: 0.1,
            min_y: -0.1,
            max_y: 0.1,
            min_z: -0.1,
            max_z: 0.1,
        }));
        let outcome =
            supervisor.move_to_joint_pose(&vector(&[0.8, 0.9]), MotionOptions::default());
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("workspace"));
        assert_eq!(supervisor.mode(), ControlMode::Joints);
    }

    #[test]
    fn velocity_commands_are_rejected_in_error_mode() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        supervisor.preempt();
        assert_eq!(supervisor.mode(), ControlMode::Error);
        let outcome = supervisor.set_joint_velocity(&vector(&[0.1, 0.1]));
        assert!(!outcome.success);
        let outcome = supervisor.set_cartesian_velocity(&VelocityCommand::in_base_frame(
            Vector6::new(0.1, 0., 0., 0., 0., 0.),
        ));
        assert!(!outcome.success);
        // Recovery re-enables them.
        assert!(supervisor.recover().success);
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        assert!(supervisor.set_joint_velocity(&vector(&[0.1, 0.1])).success);
    }

    #[test]
    fn joint_velocity_dimension_mismatch_is_rejected() {
        let supervisor = make();
        let outcome = supervisor.set_joint_velocity(&vector(&[0.1, 0.1, 0.1]));
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("entries"));
    }

    #[test]
    fn guarded_velocity_stops_after_its_duration() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        let outcome = supervisor.set_guarded_velocity(
            &VelocityCommand::in_base_frame(Vector6::new(0.05, 0., 0., 0., 0., 0.)),
            0.05,
        );
        assert!(outcome.success);
        let mut command = supervisor.step(0.01);
        assert!(command.amax() > 0.);
        for _ in 0..10 {
            command = supervisor.step(0.01);
        }
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        assert_eq!(command.amax(), 0.);
    }

    #[test]
    fn named_pose_round_trip() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        assert!(supervisor.add_named_pose("ready", false).success);
        assert!(!supervisor.add_named_pose("ready", false).success);
        assert!(supervisor.add_named_pose("ready", true).success);
        assert_eq!(supervisor.named_poses(), vec!["ready".to_string()]);
        let outcome = supervisor.move_to_named_pose("unknown", MotionOptions::default());
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("unknown named pose"));
        assert!(supervisor.remove_named_pose("ready").success);
        assert!(!supervisor.remove_named_pose("ready").success);
    }

    #[test]
    fn collision_scene_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join("armctl_scene_round_trip_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene.yaml");
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        supervisor
            .add_collision_object("crate_1", &sphere_record(2., 2., 0.2), false);
        assert!(supervisor.save_collision_scene(&path).success);

        let restored = make();
        restored
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        assert!(restored.load_collision_scene(&path).success);
        assert_eq!(restored.collision_object_keys(), vec!["crate_1".to_string()]);
        assert!(restored.remove_collision_object("crate_1").success);
        assert!(!restored.remove_collision_object("crate_1").success);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn recover_move_rewinds_to_the_oldest_safe_state() {
        let supervisor = Arc::new(make());
        let start = bent();
        supervisor
            .feed_joint_state(&start, &vector(&[0., 0.]))
            .unwrap();
        // Record the start as verified safe, then drift away and fault.
        supervisor.step(0.01);
        let drifted = vector(&[0.6, 1.0]);
        supervisor
            .feed_joint_state(&drifted, &vector(&[0., 0.]))
            .unwrap();
        supervisor.preempt();
        assert_eq!(supervisor.mode(), ControlMode::Error);

        let worker = {
            let supervisor = supervisor.clone();
            thread::spawn(move || {
                supervisor.recover_move(MotionOptions {
                    duration: 0.3,
                    sample_count: 30,
                    ..MotionOptions::default()
                })
            })
        };
        let q = tick_until_finished(&supervisor, &worker, drifted);
        let outcome = worker.join().unwrap();
        assert!(outcome.success, "recover failed: {:?}", outcome.reason);
        assert!((&q - &start).norm() < 0.05);
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        assert!(!supervisor.is_preempted());
    }

    #[test]
    fn recover_move_escapes_a_live_collision() {
        let supervisor = Arc::new(make());
        let start = bent();
        supervisor
            .feed_joint_state(&start, &vector(&[0., 0.]))
            .unwrap();
        // Record the start as verified safe before the obstacle appears.
        supervisor.step(0.01);
        let outcome =
            supervisor.add_collision_object("obstacle", &sphere_record(0.632, 1.213, 0.1), false);
        assert!(outcome.success);
        // Drift the arm onto the obstacle and let the per-tick check fault
        // it: one tick latches the contact, the next one preempts.
        let contact = vector(&[0.8, 0.9]);
        supervisor
            .feed_joint_state(&contact, &vector(&[0., 0.]))
            .unwrap();
        supervisor.step(0.01);
        supervisor.step(0.01);
        assert_eq!(supervisor.mode(), ControlMode::Error);
        assert!(supervisor.is_preempted());

        // The rewind must run even though the live state is still in
        // contact.
        let worker = {
            let supervisor = supervisor.clone();
            thread::spawn(move || {
                supervisor.recover_move(MotionOptions {
                    duration: 0.3,
                    sample_count: 30,
                    ..MotionOptions::default()
                })
            })
        };
        let q = tick_until_finished(&supervisor, &worker, contact);
        let outcome = worker.join().unwrap();
        assert!(outcome.success, "recover failed: {:?}", outcome.reason);
        assert!((&q - &start).norm() < 0.05);
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        assert!(!supervisor.is_preempted());
    }

    #[test]
    fn home_clears_the_error_mode_even_when_rejected() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        supervisor.preempt();
        assert_eq!(supervisor.mode(), ControlMode::Error);
        // The default home configuration is the stretched singularity, so
        // the motion is rejected at the gate; the error mode clears anyway.
        let outcome = supervisor.home(MotionOptions::default());
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("singularity"));
        assert_eq!(supervisor.mode(), ControlMode::Joints);
        assert!(!supervisor.is_preempted());
    }

    #[test]
    fn command_without_a_tick_source_times_out_and_clears_the_executor() {
        let config = SupervisorConfig {
            command_timeout: Duration::from_millis(20),
            ..SupervisorConfig::default()
        };
        let supervisor = MotionSupervisor::new(PlanarArm::new(1.0, 0.5), config).unwrap();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        // Nobody ticks the supervisor, so the blocking command times out.
        let outcome =
            supervisor.move_to_joint_pose(&vector(&[0.8, 0.9]), MotionOptions::default());
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("timed out"));
        // The abandoned executor must not keep driving the arm.
        let command = supervisor.step(0.01);
        assert_eq!(command.amax(), 0.);
    }

    #[test]
    fn unreachable_pose_goal_is_a_kinematic_failure() {
        let supervisor = make();
        supervisor
            .feed_joint_state(&bent(), &vector(&[0., 0.]))
            .unwrap();
        let outcome = supervisor.move_to_pose(
            &Isometry3::translation(5., 0., 0.),
            MotionOptions::default(),
        );
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("inverse kinematics"));
        assert_eq!(supervisor.mode(), ControlMode::Joints);
    }

    #[test]
    fn pose_goal_moves_the_end_effector() {
        let supervisor = Arc::new(make());
        let start = bent();
        supervisor
            .feed_joint_state(&start, &vector(&[0., 0.]))
            .unwrap();
        let goal_q = vector(&[0.8, 0.9]);
        let goal_pose = supervisor.model().world_pose(&goal_q, "tool").unwrap();
        let worker = {
            let supervisor = supervisor.clone();
            thread::spawn(move || {
                supervisor.move_to_pose(
                    &goal_pose,
                    MotionOptions {
                        duration: 0.5,
                        sample_count: 50,
                        ..MotionOptions::default()
                    },
                )
            })
        };
        let q = tick_until_finished(&supervisor, &worker, start);
        let outcome = worker.join().unwrap();
        assert!(outcome.success, "move failed: {:?}", outcome.reason);
        assert!((&q - &goal_q).norm() < 0.05);
    }

    #[test]
    fn mesh_collision_objects_are_rejected() {
        let supervisor = make();
        let mut record = sphere_record(1., 1., 0.1);
        record.shape = "mesh".to_string();
        let outcome = supervisor.add_collision_object("scan", &record, false);
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("mesh"));
        assert!(supervisor.collision_object_keys().is_empty());
    }
}
