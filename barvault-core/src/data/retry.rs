//! Bounded retry policy with exponential backoff and jitter.

use super::DataError;
use rand::Rng;
use std::time::Duration;

/// How transient exchange failures are retried.
///
/// `max_attempts` counts the first try, so `max_attempts = 1` disables
/// retries. Delay before retry `n` (1-based) is `base_delay * 2^(n-1)`,
/// capped at `max_delay`, then scaled by a random factor in
/// `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping. Used by tests and benchmarks.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// True if another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }

    /// Deterministic backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Backoff with jitter applied. A rate-limit error's retry-after hint is
    /// honored when it is longer than the computed delay.
    pub fn delay_for<R: Rng>(&self, retry: u32, error: &DataError, rng: &mut R) -> Duration {
        let base = self.backoff(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && !base.is_zero() {
            let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
            base.mul_f64(factor).min(self.max_delay)
        } else {
            base
        };
        match error {
            DataError::RateLimited { retry_after_secs } => {
                jittered.max(Duration::from_secs(*retry_after_secs))
            }
            _ => jittered,
        }
    }
}
