// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the ring buffer of recently verified collision-free states.
use nalgebra::DVector;
use std::collections::VecDeque;

/// Bounded history of joint states that passed the per-tick collision check.
///
/// The oldest retained state is the recovery target: it is the state furthest
/// back that is still known good, which matters after the robot has drifted
/// into a bad region.
#[derive(Debug, Clone)]
pub struct SafeStateWindow {
    capacity: usize,
    states: VecDeque<DVector<f64>>,
}

impl SafeStateWindow {
    pub const DEFAULT_CAPACITY: usize = 200;

    pub fn new(capacity: usize) -> Self {
        SafeStateWindow {
            capacity: capacity.max(1),
            states: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Appends a verified state, evicting the oldest entry when full.
    pub fn push(&mut self, q: DVector<f64>) {
        if self.states.len() == self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(q);
    }

    /// The oldest retained state, if any was recorded.
    pub fn recovery_state(&self) -> Option<&DVector<f64>> {
        self.states.front()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

impl Default for SafeStateWindow {
    fn default() -> Self {
        SafeStateWindow::new(SafeStateWindow::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state(value: f64) -> DVector<f64> {
        DVector::from_vec(vec![value, value])
    }

    #[test]
    fn recovery_state_is_oldest() {
        let mut window = SafeStateWindow::new(3);
        assert!(window.recovery_state().is_none());
        window.push(state(1.));
        window.push(state(2.));
        assert_eq!(window.recovery_state().unwrap()[0], 1.);
    }

    #[test]
    fn rolls_over_at_capacity() {
        let mut window = SafeStateWindow::new(3);
        for value in 0..5 {
            window.push(state(value as f64));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.recovery_state().unwrap()[0], 2.);
    }
}
