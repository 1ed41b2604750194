//! Bounded exponential backoff for reconnect loops.
//!
//! Delays double from `base` up to `max` and the sequence ends after
//! `max_attempts`, so a dead peer never causes a tight retry loop or an
//! endless one.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        let base = base.max(Duration::from_millis(1));
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            attempts: 0,
            max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }

        let delay = self.current;
        self.attempts += 1;
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    /// 1s, 2s, 4s, 8s, 8s
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(8), 5)
    }
}
