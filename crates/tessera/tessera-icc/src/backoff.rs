//! Progressive backoff for "wait until condition holds" loops.
//!
//! Three phases, measured in calls to [`Backoff::snooze`]:
//! - **spin** (`0..spin_limit / 10`): a single `spin_loop` hint
//! - **pause** (`..spin_limit`): growing bursts of `spin_loop` hints
//! - **yield** (`spin_limit..`): give the processor back to the scheduler
//!
//! The contract of the caller's wait is unchanged by the phase: it still
//! blocks until its condition holds.

use std::hint;
use std::thread;

#[derive(Debug, Clone)]
pub struct Backoff {
    step: u32,
    spin_limit: u32,
}

impl Backoff {
    pub const DEFAULT_SPIN_LIMIT: u32 = 1_000;

    pub fn new() -> Self {
        Self::with_spin_limit(Self::DEFAULT_SPIN_LIMIT)
    }

    /// `spin_limit = 0` yields on every call.
    pub fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            step: 0,
            spin_limit,
        }
    }

    #[inline]
    pub fn snooze(&mut self) {
        let i = self.step;
        if i < self.spin_limit / 10 {
            hint::spin_loop();
        } else if i < self.spin_limit {
            let pauses = ((i - self.spin_limit / 10) >> 3) + 1;
            for _ in 0..pauses.min(32) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }

    /// Past the spin phases; the next `snooze` yields.
    pub fn is_yielding(&self) -> bool {
        self.step >= self.spin_limit
    }

    pub fn steps(&self) -> u32 {
        self.step
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Snoozes until `done` returns `true`. Returns the number of snoozes.
    pub fn wait_until<F: FnMut() -> bool>(&mut self, mut done: F) -> u32 {
        let start = self.step;
        while !done() {
            self.snooze();
        }
        self.step - start
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn progresses_through_phases() {
        let mut backoff = Backoff::with_spin_limit(20);
        for _ in 0..19 {
            backoff.snooze();
        }
        assert!(!backoff.is_yielding());
        backoff.snooze();
        assert!(backoff.is_yielding());
        backoff.reset();
        assert_eq!(backoff.steps(), 0);
    }

    #[test]
    fn zero_limit_yields_immediately() {
        assert!(Backoff::with_spin_limit(0).is_yielding());
    }

    #[test]
    fn wait_until_returns_once_condition_holds() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.store(true, Ordering::Release))
        };
        Backoff::new().wait_until(|| flag.load(Ordering::Acquire));
        setter.join().unwrap();
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn wait_until_counts_snoozes() {
        let mut left = 3;
        let snoozes = Backoff::new().wait_until(|| {
            left -= 1;
            left == 0
        });
        assert_eq!(snoozes, 2);
    }
}
