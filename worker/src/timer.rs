//! The engine's single oneshot wake-up.
//!
//! The transfer engine asks for at most one deadline at a time through its
//! timer hook. `None` cancels the pending deadline; a zero delay is bumped
//! to one millisecond so the timeout action always runs from the reactor
//! loop and never re-enters the engine from inside its own hook.

use std::time::{Duration, Instant};

/// Smallest delay the timer will schedule.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct TimerState {
    deadline: Option<Instant>,
}

impl TimerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reschedule from `now`. `None` cancels.
    pub fn schedule(&mut self, delay: Option<Duration>, now: Instant) {
        self.deadline = delay.map(|d| now + d.max(MIN_DELAY));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Disarm the timer if its deadline has passed. Returns whether it fired.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
