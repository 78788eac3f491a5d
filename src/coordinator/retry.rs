use backoff::backoff::Backoff;
use std::time::Duration;

/// Linear retry schedule: the wait after failed attempt `n` is `n * step`.
///
/// Yields `None` once `ceiling` attempts have been made.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    ceiling: u32,
    attempts: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, ceiling: u32) -> Self {
        Self {
            step,
            ceiling,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Backoff for LinearBackoff {
    /// Record one more failed attempt and return the wait before the next.
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.ceiling {
            return None;
        }
        Some(self.step.saturating_mul(self.attempts))
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}
