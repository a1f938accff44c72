//! One-shot deadline timers polled from the read loops
//!
//! The protocols never block on a timer: each loop iteration is bounded by
//! the socket read timeout and checks its deadlines afterwards.

use rand::Rng;
use std::time::{Duration, Instant};

/// A re-armable one-shot deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// Create a disarmed timer
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm (or re-arm) the timer to fire `after` from `now`
    pub fn fire_in(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    /// Disarm the timer
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Check whether the timer is armed
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Get the current deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once when the deadline has passed, disarming the timer
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Shorten `base` by a random amount of up to one eighth
///
/// Receivers sharing a group spread their keepalives so that usually only
/// one of them has to speak up.
pub fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 8;
    base - Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
