use rand::random;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of delivery attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Multiplier for exponential backoff
    pub backoff_factor: f64,

    /// Maximum delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Upper bound of the random stretch applied to each delay, as a fraction of it
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Reject combinations that would break the monotonic backoff guarantee
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AgentError::config("delivery.max_attempts must be at least 1"));
        }
        if self.initial_backoff.is_zero() {
            return Err(AgentError::config("delivery.initial_backoff must be positive"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(AgentError::config(
                "delivery.max_backoff must not be shorter than delivery.initial_backoff",
            ));
        }
        if !(self.backoff_factor > 1.0) {
            return Err(AgentError::config("delivery.backoff_factor must be greater than 1"));
        }
        // A stretch of (1 + jitter) must stay below one growth step.
        if !(self.jitter >= 0.0 && self.jitter < self.backoff_factor - 1.0) {
            return Err(AgentError::config(format!(
                "delivery.jitter must be in [0, {}) for backoff_factor {}",
                self.backoff_factor - 1.0,
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Un-jittered delay after the given failed attempt (1-based), capped at `max_backoff`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay after the given failed attempt, with jitter applied
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, random::<f64>())
    }

    /// Delay with an explicit jitter sample in `[0, 1)`
    pub fn backoff_with(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let stretched = base.mul_f64(1.0 + self.jitter * sample.clamp(0.0, 1.0));
        if base >= self.max_backoff {
            // At the cap the stretch may not push past it
            stretched.min(self.max_backoff)
        } else {
            stretched
        }
    }

    /// Whether a record that has failed `attempts` times may be tried again
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Builder for custom retry configurations
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.config.initial_backoff = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.config.max_backoff = delay;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let config = RetryBuilder::new()
            .initial_backoff(Duration::from_millis(100))
            .backoff_factor(2.0)
            .max_backoff(Duration::from_millis(500))
            .build();

        assert_eq!(config.base_delay(1), Duration::from_millis(100));
        assert_eq!(config.base_delay(2), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(400));
        assert_eq!(config.base_delay(4), Duration::from_millis(500));
        assert_eq!(config.base_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jittered_backoff_strictly_increasing_below_cap() {
        let config = RetryBuilder::new()
            .initial_backoff(Duration::from_millis(100))
            .backoff_factor(2.0)
            .max_backoff(Duration::from_secs(60))
            .jitter(0.9)
            .build();
        config.validate().unwrap();

        // Worst case: maximal jitter on one attempt, none on the next.
        for attempt in 1..8 {
            let high = config.backoff_with(attempt, 0.999_999);
            let low_next = config.backoff_with(attempt + 1, 0.0);
            assert!(low_next > high, "attempt {attempt}: {low_next:?} <= {high:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryBuilder::new()
            .initial_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_secs(2))
            .build();
        assert_eq!(config.backoff_with(10, 0.99), Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_jitter_above_growth() {
        let config = RetryBuilder::new().backoff_factor(1.5).jitter(0.5).build();
        assert!(config.validate().is_err());

        let config = RetryBuilder::new().backoff_factor(1.5).jitter(0.4).build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_can_retry_respects_max_attempts() {
        let config = RetryBuilder::new().max_attempts(3).build();
        assert!(config.can_retry(1));
        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
    }
}
