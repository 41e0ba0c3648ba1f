//! Explicit timing primitives for throttles and expiries.
//!
//! Everything takes `now` from the caller and works on `tokio::time::Instant`,
//! so tests drive time with a paused runtime clock instead of sleeping.

use std::time::Duration;

use tokio::time::Instant;

/// A one-shot deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline unless it is already armed. Returns true if armed now.
    pub fn schedule(&mut self, now: Instant, after: Duration) -> bool {
        if self.at.is_some() {
            return false;
        }
        self.at = Some(now + after);
        true
    }

    /// True once `now` has reached the deadline. An unarmed deadline is never due.
    pub fn is_due(&self, now: Instant) -> bool {
        self.at.is_some_and(|at| now >= at)
    }
}

/// Leading-edge throttle: the first call fires, then at most one call per
/// `interval`.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    /// Returns true (and records `now`) if more than `interval` has passed
    /// since the last firing, or if it never fired.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) if now.saturating_duration_since(last) <= self.interval => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    /// Forget the last firing so the next call fires immediately.
    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}
