//! Retry policy for failed exchange attempts.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with bounded jitter and a fixed attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total send attempts before a change fails permanently.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the base
    /// delay for the attempt. Kept within `0.0..=1.0`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based), without
    /// jitter: `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`RetryPolicy::delay_for`] plus up to `jitter_ratio` of extra delay,
    /// never past `max_delay`.
    ///
    /// With a ratio of at most 1 the result still never decreases from one
    /// attempt to the next, since the doubling outgrows the jitter.
    pub fn jittered_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let max_extra = delay.as_millis() as f64 * ratio;
        if max_extra < 1.0 {
            return delay;
        }
        let extra = rng.gen_range(0.0..=max_extra);
        (delay + Duration::from_millis(extra as u64)).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.jittered_delay_with(attempt, &mut rand::thread_rng())
    }

    /// True once `attempts` sends have been spent.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
