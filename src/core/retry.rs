//! Retry policy for failed step attempts.
//!
//! Delays grow exponentially from `initial_delay_ms`, are capped at
//! `max_delay_ms`, and are spread by a jitter fraction so that many
//! failing steps do not retry in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Longest delay any policy may ask for (one day)
pub const MAX_RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Retry policy declared on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt (None = engine default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the delay that is randomized, in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Policy with an explicit retry cap and otherwise default timings
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Default::default()
        }
    }

    /// Retry cap, falling back to the engine-wide default
    pub fn retry_limit(&self, default_limit: u32) -> u32 {
        self.max_retries.unwrap_or(default_limit)
    }

    /// Whether a failed attempt (1-indexed) may be retried
    pub fn should_retry(&self, attempt: u32, default_limit: u32) -> bool {
        attempt <= self.retry_limit(default_limit)
    }

    /// Settings that cannot produce a sane delay, as readable reasons
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(0.0..=1.0).contains(&self.jitter) {
            problems.push(format!("retry jitter must be within [0, 1], got {}", self.jitter));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            problems.push(format!(
                "retry backoff_multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay_ms > MAX_RETRY_DELAY_MS {
            problems.push(format!(
                "retry max_delay_ms must be at most {}, got {}",
                MAX_RETRY_DELAY_MS, self.max_delay_ms
            ));
        }
        problems
    }

    fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms.min(MAX_RETRY_DELAY_MS)
    }

    /// Un-jittered delay before retrying after `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_delay_ms = self.max_delay_ms();
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        // NaN and negative delays collapse to zero in the cast
        let capped = delay.min(max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay with jitter applied: uniformly drawn from
    /// `[delay * (1 - jitter), delay]`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = if self.jitter.is_nan() { 0.0 } else { self.jitter.clamp(0.0, 1.0) };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::rng().random_range((1.0 - jitter)..=1.0);
        base.mul_f64(factor)
    }
}
