//! Exponential backoff with jitter for runtime retries.

use rand::Rng;
use std::time::Duration;

/// Stateful exponential backoff.
///
/// Delay for attempt `n` (1-based) is `base * 2^(n-1)` capped at `max`,
/// plus up to 10% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 2u32.saturating_pow(self.attempt - 1);
        let capped = self.base.saturating_mul(factor).min(self.max);

        let jitter_range = capped.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
