//! Retry delays for transient publish failures.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter.
///
/// After the n-th counted failure the nominal delay is `base * 2^(n-1)`,
/// clamped to `ceiling`. Up to a quarter of the nominal delay is added as
/// jitter so retries from a burst of failures spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Delay before jitter. `attempts_used` of zero is treated as one.
    pub fn nominal(&self, attempts_used: u32) -> Duration {
        let exponent = attempts_used.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    /// Largest jitter that may be added to `nominal(attempts_used)`.
    pub fn max_jitter(&self, attempts_used: u32) -> Duration {
        self.nominal(attempts_used) / 4
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay(&self, attempts_used: u32) -> Duration {
        self.delay_with(attempts_used, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempts_used: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempts_used);
        let fraction: f64 = rng.gen_range(0.0..=0.25);
        nominal + nominal.mul_f64(fraction)
    }

    /// Delay that also honours a platform-supplied `Retry-After`, capped at
    /// the ceiling.
    pub fn delay_honoring(&self, attempts_used: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay(attempts_used);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.ceiling)),
            None => delay,
        }
    }
}
