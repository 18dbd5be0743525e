use std::time::Duration;

use rand::Rng;

use crate::config::StreamConfig;

/// Exponential reconnect delay: base, doubling per attempt, capped, with
/// downward jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `0..=1` by which a delay may be shortened at random.
    pub jitter: f64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
        }
    }

    /// Delay before the capped, un-jittered attempt `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter <= 0.0 {
            return ceiling;
        }
        let cut = rng.gen_range(0.0..=self.jitter);
        ceiling.mul_f64(1.0 - cut)
    }

    /// Whether `retries` reconnect attempts have used up the budget.
    pub fn exhausted(&self, retries: u32) -> bool {
        self.max_retries.is_some_and(|max| retries >= max)
    }
}
