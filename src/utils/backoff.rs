use std::time::Duration;

use rand::Rng;

use crate::BackoffPolicy;

/// Exponential backoff with jitter driven by a [`BackoffPolicy`].
///
/// Delay for attempt `n` is `min(base * 2^n, max)` plus up to 10% jitter.
/// `next_delay` yields `None` once `max_retries` is exhausted; a policy with
/// `max_retries == 0` never gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_retries != 0 && self.attempt as usize >= self.policy.max_retries {
            return None;
        }
        let delay = self.ceiling_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (delay.as_millis() as u64) / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Some(delay + jitter)
    }

    /// Delay before jitter for `attempt`.
    pub(crate) fn ceiling_for(
        &self,
        attempt: u32,
    ) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay_ms = self.policy.base_delay_ms.saturating_mul(factor).min(self.policy.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}
