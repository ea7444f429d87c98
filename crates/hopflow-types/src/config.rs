//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `hopflow.toml` document. Every section and
//! field has a default, so an empty file is a valid configuration. Durations
//! are stored as integer milliseconds/seconds and exposed as `Duration`
//! through accessor methods.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, kinds};
use crate::message::DEFAULT_DLQ_SUFFIX;

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name stamped on messages started by this process.
    #[serde(default)]
    pub service_name: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dlq: DlqConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be >= 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must be >= retry.initial_delay_ms"));
        }

        let cb = &self.circuit_breaker;
        if !is_percentage(cb.failure_rate_threshold) {
            return Err(invalid(
                "circuit_breaker.failure_rate_threshold",
                "must be in (0, 100]",
            ));
        }
        if !is_percentage(cb.slow_call_rate_threshold) {
            return Err(invalid(
                "circuit_breaker.slow_call_rate_threshold",
                "must be in (0, 100]",
            ));
        }
        if cb.sliding_window_size == 0 {
            return Err(invalid("circuit_breaker.sliding_window_size", "must be at least 1"));
        }
        if cb.minimum_number_of_calls == 0 {
            return Err(invalid(
                "circuit_breaker.minimum_number_of_calls",
                "must be at least 1",
            ));
        }
        if cb.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(invalid(
                "circuit_breaker.permitted_number_of_calls_in_half_open_state",
                "must be at least 1",
            ));
        }

        if self.outbox.max_attempts == 0 {
            return Err(invalid("outbox.max_attempts", "must be at least 1"));
        }
        if self.outbox.batch_size == 0 {
            return Err(invalid("outbox.batch_size", "must be at least 1"));
        }
        if self.scheduler.check_interval_ms == 0 {
            return Err(invalid("scheduler.check_interval_ms", "must be at least 1"));
        }

        Ok(())
    }
}

fn is_percentage(value: f64) -> bool {
    value > 0.0 && value <= 100.0
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per step including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// `StepError` kinds that go straight to the dead-letter path.
    #[serde(default = "default_non_retryable")]
    pub non_retryable_kinds: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_non_retryable() -> Vec<String> {
    vec![kinds::INVALID_INPUT.to_string()]
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn is_non_retryable(&self, kind: &str) -> bool {
        self.non_retryable_kinds.iter().any(|k| k == kind)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            non_retryable_kinds: default_non_retryable(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dead-letter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_dlq_suffix")]
    pub suffix: String,
}

fn default_true() -> bool {
    true
}

fn default_dlq_suffix() -> String {
    DEFAULT_DLQ_SUFFIX.to_string()
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suffix: default_dlq_suffix(),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Percentage (0-100] of failed calls in the window that opens the circuit.
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    /// Percentage (0-100] of slow calls in the window that opens the circuit.
    #[serde(default = "default_slow_call_rate")]
    pub slow_call_rate_threshold: f64,

    #[serde(default = "default_slow_call_duration_ms")]
    pub slow_call_duration_threshold_ms: u64,

    /// Number of most recent calls considered (count-based window).
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,

    #[serde(default = "default_minimum_calls")]
    pub minimum_number_of_calls: usize,

    #[serde(default = "default_half_open_calls")]
    pub permitted_number_of_calls_in_half_open_state: usize,

    #[serde(default = "default_wait_open_ms")]
    pub wait_duration_in_open_state_ms: u64,

    #[serde(default = "default_true")]
    pub automatic_transition_from_open_to_half_open_enabled: bool,
}

fn default_failure_rate() -> f64 {
    50.0
}

fn default_slow_call_rate() -> f64 {
    100.0
}

fn default_slow_call_duration_ms() -> u64 {
    60_000
}

fn default_sliding_window_size() -> usize {
    100
}

fn default_minimum_calls() -> usize {
    10
}

fn default_half_open_calls() -> usize {
    10
}

fn default_wait_open_ms() -> u64 {
    60_000
}

impl CircuitBreakerConfig {
    pub fn slow_call_duration_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_threshold_ms)
    }

    pub fn wait_duration_in_open_state(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_state_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_rate_threshold: default_failure_rate(),
            slow_call_rate_threshold: default_slow_call_rate(),
            slow_call_duration_threshold_ms: default_slow_call_duration_ms(),
            sliding_window_size: default_sliding_window_size(),
            minimum_number_of_calls: default_minimum_calls(),
            permitted_number_of_calls_in_half_open_state: default_half_open_calls(),
            wait_duration_in_open_state_ms: default_wait_open_ms(),
            automatic_transition_from_open_to_half_open_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Step timeout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Apply `default_step_timeout_ms` to steps without their own timeout.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

impl TimeoutConfig {
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.enabled
            .then(|| Duration::from_millis(self.default_step_timeout_ms))
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_completed_ttl_secs")]
    pub completed_ttl_secs: u64,

    #[serde(default = "default_failed_ttl_secs")]
    pub failed_ttl_secs: u64,
}

fn default_completed_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_failed_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

impl RetentionConfig {
    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    pub fn failed_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_ttl_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_ttl_secs: default_completed_ttl_secs(),
            failed_ttl_secs: default_failed_ttl_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 60 * 1000
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: default_check_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Route resume messages through the outbox instead of a direct send.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_outbox_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_outbox_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_outbox_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_sent_retention_secs")]
    pub sent_retention_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_outbox_max_attempts() -> u32 {
    5
}

fn default_outbox_base_delay_ms() -> u64 {
    1_000
}

fn default_outbox_max_delay_ms() -> u64 {
    60_000
}

fn default_sent_retention_secs() -> u64 {
    24 * 60 * 60
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sent_retention(&self) -> Duration {
        Duration::from_secs(self.sent_retention_secs)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: default_outbox_max_attempts(),
            base_delay_ms: default_outbox_base_delay_ms(),
            max_delay_ms: default_outbox_max_delay_ms(),
            sent_retention_secs: default_sent_retention_secs(),
        }
    }
}
