//! Reconnect policy — bounded exponential backoff for the watch loop.
//!
//! The hub keeps no reconnect history; retries are entirely the client's
//! business. Delays grow `base_delay * multiplier^(attempt - 1)` up to
//! `max_delay`, and the loop gives up after `max_attempts` consecutive
//! failures. A session that got as far as the welcome message resets the
//! counter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based), or `None`
    /// once the attempt budget is spent.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }

    pub fn apply_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rng.random_range(0.5..=1.0))
    }
}

/// Attempt counter driven by the watch loop.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advance to the next attempt and return how long to wait before it.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt.saturating_add(1))?;
        self.attempt += 1;
        Some(self.policy.apply_jitter(delay, rng))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
