// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the tick gate that synchronizes blocking command handlers with
//! the control loop.
use crate::exception::{ArmException, ArmResult};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Binary event set once per control tick.
///
/// Handlers that poll executor progress wait on the gate instead of spinning;
/// the control loop sets it at the end of every tick. The flag is cleared on
/// entry to each wait, so a wait always observes a tick that happened after
/// it started.
#[derive(Debug, Default)]
pub struct TickGate {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl TickGate {
    pub fn new() -> Self {
        TickGate {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Signals that a tick completed, waking all waiters.
    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.condvar.notify_all();
    }

    /// Blocks until the next tick or the timeout.
    ///
    /// # Errors
    /// A timeout is reported as a recoverable [`ArmException::TimeoutException`];
    /// the caller may retry.
    pub fn wait_for_tick(&self, timeout: Duration) -> ArmResult<()> {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock().unwrap();
        *flag = false;
        while !*flag {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ArmException::TimeoutException {
                    message: "timed out waiting for a control tick".to_string(),
                });
            }
            let (guard, _) = self.condvar.wait_timeout(flag, remaining).unwrap();
            flag = guard;
        }
        Ok(())
    }
}
