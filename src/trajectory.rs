// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains joint-space trajectories and the closed-loop executor that
//! converts them to per-tick velocity commands.
use crate::exception::{ArmException, ArmResult};
use nalgebra::DVector;
use tracing::warn;

/// Position error bound above which execution is considered to have run
/// away from the plan.
const RUNAWAY_BOUND: f64 = 0.5;

/// An immutable joint-space plan.
///
/// Either time-parameterized (total duration given, samples interpolated over
/// normalized progress) or index-parameterized (one sample per tick).
/// Velocities are optional; when absent the executor differentiates the
/// samples.
#[derive(Debug, Clone)]
pub struct Trajectory {
    samples: Vec<DVector<f64>>,
    velocities: Option<Vec<DVector<f64>>>,
    duration: Option<f64>,
}

impl Trajectory {
    /// Wraps externally planned samples.
    ///
    /// # Errors
    /// Rejects empty plans, velocity lists whose length differs from the
    /// sample list, and samples of inconsistent dimension.
    pub fn from_samples(
        samples: Vec<DVector<f64>>,
        velocities: Option<Vec<DVector<f64>>>,
        duration: Option<f64>,
    ) -> ArmResult<Self> {
        if samples.is_empty() {
            return Err(ArmException::CommandException {
                message: "trajectory has no samples".to_string(),
            });
        }
        let dof = samples[0].len();
        if samples.iter().any(|sample| sample.len() != dof) {
            return Err(ArmException::CommandException {
                message: "trajectory samples have inconsistent dimensions".to_string(),
            });
        }
        if let Some(velocities) = &velocities {
            if velocities.len() != samples.len()
                || velocities.iter().any(|velocity| velocity.len() != dof)
            {
                return Err(ArmException::CommandException {
                    message: "trajectory velocities do not match samples".to_string(),
                });
            }
        }
        if let Some(duration) = duration {
            if duration <= 0. || !duration.is_finite() {
                return Err(ArmException::CommandException {
                    message: "trajectory duration must be positive".to_string(),
                });
            }
        }
        Ok(Trajectory {
            samples,
            velocities,
            duration,
        })
    }

    /// Generates a quintic point-to-point trajectory from `start` to `end`.
    ///
    /// Velocity and acceleration are zero at both ends; per-sample velocities
    /// are included.
    pub fn point_to_point(
        start: &DVector<f64>,
        end: &DVector<f64>,
        duration: f64,
        sample_count: usize,
    ) -> Self {
        let sample_count = sample_count.max(2);
        let delta = end - start;
        let mut samples = Vec::with_capacity(sample_count);
        let mut velocities = Vec::with_capacity(sample_count);
        for step in 0..sample_count {
            let tau = step as f64 / (sample_count - 1) as f64;
            let blend = tau * tau * tau * (10. - 15. * tau + 6. * tau * tau);
            let blend_rate = 30. * tau * tau * (1. - tau) * (1. - tau) / duration;
            samples.push(start + &delta * blend);
            velocities.push(&delta * blend_rate);
        }
        Trajectory {
            samples,
            velocities: Some(velocities),
            duration: Some(duration),
        }
    }

    pub fn samples(&self) -> &[DVector<f64>] {
        &self.samples
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn dof(&self) -> usize {
        self.samples[0].len()
    }

    /// Required position and velocity at normalized progress `tau` in [0, 1],
    /// linearly interpolated between samples.
    fn required_at(&self, tau: f64) -> (DVector<f64>, DVector<f64>) {
        let tau = tau.max(0.).min(1.);
        let span = (self.samples.len() - 1) as f64;
        let position = tau * span;
        let lower = (position.floor() as usize).min(self.samples.len() - 2);
        let fraction = position - lower as f64;
        let required_q = &self.samples[lower] * (1. - fraction) + &self.samples[lower + 1] * fraction;
        let required_qd = match &self.velocities {
            Some(velocities) => &velocities[lower] * (1. - fraction) + &velocities[lower + 1] * fraction,
            None => {
                let duration = self.duration.unwrap_or(span.max(1.));
                (&self.samples[lower + 1] - &self.samples[lower]) * (span / duration)
            }
        };
        (required_q, required_qd)
    }

    /// Sample and velocity at integer index `index` for index-parameterized
    /// plans.
    fn required_at_index(&self, index: usize) -> (DVector<f64>, DVector<f64>) {
        let index = index.min(self.samples.len() - 1);
        let required_q = self.samples[index].clone();
        let required_qd = match &self.velocities {
            Some(velocities) => velocities[index].clone(),
            None if index + 1 < self.samples.len() => {
                &self.samples[index + 1] - &self.samples[index]
            }
            None => DVector::zeros(self.dof()),
        };
        (required_q, required_qd)
    }
}

/// Executes one trajectory in closed loop, one velocity command per tick.
///
/// The executor owns no robot state; the caller feeds it the live joint
/// position and velocity each tick and publishes the returned command.
pub struct TrajectoryExecutor {
    trajectory: Trajectory,
    progress: f64,
    finished: bool,
    succeeded: bool,
    /// Joint-space distance to the final sample below which execution counts
    /// as arrived.
    pub cutoff: f64,
}

impl TrajectoryExecutor {
    pub const DEFAULT_CUTOFF: f64 = 0.01;

    pub fn new(trajectory: Trajectory) -> Self {
        TrajectoryExecutor {
            trajectory,
            progress: 0.,
            finished: false,
            succeeded: false,
            cutoff: TrajectoryExecutor::DEFAULT_CUTOFF,
        }
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Produces the joint velocity command for this tick.
    ///
    /// The required velocity is corrected against the live velocity:
    /// `actual_qd + (required_qd - actual_qd)`, commanding the planned
    /// velocity with the error measured against live state. Execution that
    /// has drifted more than the runaway bound from the plan in any joint is
    /// terminated as failed.
    ///
    /// # Arguments
    /// * `dt` - seconds since the previous tick
    /// * `actual_q` - live joint position
    /// * `actual_qd` - live joint velocity
    ///
    /// # Return
    /// The velocity to command; zero once finished.
    pub fn step(
        &mut self,
        dt: f64,
        actual_q: &DVector<f64>,
        actual_qd: &DVector<f64>,
    ) -> DVector<f64> {
        let dof = self.trajectory.dof();
        if self.is_finished(actual_q) {
            return DVector::zeros(dof);
        }
        let (required_q, required_qd) = match self.trajectory.duration() {
            Some(duration) => self.trajectory.required_at(self.progress / duration),
            None => self.trajectory.required_at_index(self.progress as usize),
        };

        let error = &required_q - actual_q;
        if error.amax() > RUNAWAY_BOUND {
            warn!(
                error = error.amax(),
                "trajectory tracking error exceeds runaway bound, aborting"
            );
            self.finished = true;
            self.succeeded = false;
            return DVector::zeros(dof);
        }

        let corrected = actual_qd + (&required_qd - actual_qd);
        match self.trajectory.duration() {
            Some(_) => self.progress += dt,
            None => self.progress += 1.,
        }
        corrected
    }

    /// Whether execution is over, latching the outcome.
    ///
    /// True when a previous tick already finished, when the plan has fewer
    /// than two samples, when the live position is within
    /// [`cutoff`](`Self::cutoff`) of the final sample, or when progress has
    /// consumed the plan. Arrival by proximity and arrival by exhausting the
    /// plan both count as success.
    pub fn is_finished(&mut self, actual_q: &DVector<f64>) -> bool {
        if self.finished {
            return true;
        }
        let samples = self.trajectory.samples();
        if samples.len() < 2 {
            self.finished = true;
            self.succeeded = true;
            return true;
        }
        let last = &samples[samples.len() - 1];
        if actual_q.len() == last.len() && (actual_q - last).norm() < self.cutoff {
            self.finished = true;
            self.succeeded = true;
            return true;
        }
        let exhausted = match self.trajectory.duration() {
            Some(duration) => self.progress >= duration,
            None => self.progress >= samples.len() as f64,
        };
        if exhausted {
            self.finished = true;
            self.succeeded = true;
            return true;
        }
        false
    }

    pub fn is_succeeded(&self) -> bool {
        self.finished && self.succeeded
    }

    /// Terminates execution as failed. Idempotent; a finished executor stays
    /// finished and an aborted one never reports success.
    pub fn abort(&mut self) {
        if !self.finished {
            warn!("trajectory execution aborted");
        }
        self.finished = true;
        self.succeeded = false;
    }
}
