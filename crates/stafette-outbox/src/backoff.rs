//! Publish retry backoff policies.
//!
//! The store applies a policy when a publish attempt fails below the
//! retry ceiling. The default is the platform's historical linear ramp
//! (`count × 5 s`); exponential with jitter is available for deployments
//! where synchronized retries against a recovering broker matter.

use std::time::Duration;

use rand::Rng;

/// Strategy for computing the delay before the next publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay for every attempt.
    Fixed,

    /// Delay grows by the base amount per failed attempt.
    Linear,

    /// Delay doubles per failed attempt.
    Exponential,
}

/// Backoff configuration for dispatcher retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay unit.
    pub base_delay: Duration,

    /// Upper bound applied after strategy and jitter.
    pub max_delay: Duration,

    /// Randomization factor in `[0.0, 1.0]`; zero disables jitter.
    pub jitter_factor: f64,

    /// Delay growth strategy.
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl BackoffPolicy {
    /// Exponential preset with ±25% jitter for multi-producer deployments.
    pub fn exponential_with_jitter() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            jitter_factor: 0.25,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the next attempt, where `retry_count` is the number of
    /// failed publishes so far (≥ 1 when a retry is being scheduled).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let attempt = retry_count.max(1);

        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                // Cap the exponent so the multiplication cannot overflow.
                let exponent = (attempt - 1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped = raw.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;

    let mut rng = rand::rng();
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
