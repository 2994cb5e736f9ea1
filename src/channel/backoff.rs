//! Reconnect delay schedule
//!
//! Exponential growth from the base delay with upward jitter, capped at the
//! configured maximum. Successive delays never shrink until `reset`, which
//! the channel calls whenever a connection opens.

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let random = rand::thread_rng().gen_range(0.0..1.0);
        self.next_delay_with(random)
    }

    /// `random` is a sample from `[0, 1)`
    pub(crate) fn next_delay_with(&mut self, random: f64) -> Duration {
        let exponent = self.attempt.min(32) as i32;
        let exponential = self.policy.base_delay_ms as f64 * self.policy.multiplier.powi(exponent);
        let jittered = exponential * (1.0 + random.clamp(0.0, 1.0) * self.policy.jitter_factor);
        let capped = jittered.min(self.policy.max_delay_ms as f64);

        let delay = Duration::from_millis(capped.round() as u64).max(self.last);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
