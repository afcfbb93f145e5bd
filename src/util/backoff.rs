//! Bounded exponential backoff for retrying backend calls.
//!
//! The schedule is `initial * multiplier^(n-1)` capped at `max_interval`,
//! and gives up after `max_attempts` tries or once the next sleep would
//! overrun `max_elapsed` since the first attempt.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Duration,
    max_attempts: u32,
    attempts: u32,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(cfg: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.initial_backoff_ms),
            multiplier: cfg.multiplier,
            max_interval: Duration::from_millis(cfg.max_backoff_ms),
            max_elapsed: Duration::from_millis(cfg.max_elapsed_ms),
            max_attempts: cfg.max_attempts,
            attempts: 0,
            started: Instant::now(),
        }
    }

    /// Attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `retry` (1-based), ignoring the budget.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial.as_millis() as f64 * factor).min(self.max_interval.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` when the retry budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        if self.started.elapsed() + delay > self.max_elapsed {
            return None;
        }
        Some(delay)
    }
}
