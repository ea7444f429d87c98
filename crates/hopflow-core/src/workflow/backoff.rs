//! Exponential retry backoff.
//!
//! `delay(attempt) = min(initial_delay * multiplier^(attempt - 1), max_delay)`
//! computed in whole milliseconds with saturating arithmetic, so arbitrarily
//! large attempt numbers settle at `max_delay` instead of overflowing.
//!
//! The first attempt always waits exactly `initial_delay`, even when it is
//! configured above `max_delay`; the cap applies from the second attempt on.

use std::time::Duration;

use hopflow_types::config::RetryConfig;

/// Stateless delay schedule for step retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffCalculator {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl BackoffCalculator {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.initial_delay(), config.multiplier, config.max_delay())
    }

    /// Delay before the retry that follows `attempt` (1-based).
    pub fn calculate(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let scaled_ms = self.initial_delay.as_millis() as f64 * factor;

        if scaled_ms.is_nan() {
            return self.initial_delay.min(self.max_delay);
        }
        // Float-to-int casts saturate, so infinity lands on u64::MAX.
        Duration::from_millis(scaled_ms as u64).min(self.max_delay)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
