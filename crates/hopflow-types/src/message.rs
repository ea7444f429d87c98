//! The `WorkflowMessage` envelope and the retry/error records it carries.
//!
//! A message is immutable per broker hop: every transition builds a new
//! message from the previous one rather than mutating it in place.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepError;
use crate::status::WorkflowStatus;

/// Error code stamped on dead-lettered messages.
pub const STEP_EXECUTION_FAILED: &str = "STEP_EXECUTION_FAILED";

/// Maximum stack trace length kept in `ErrorInfo` before truncation.
pub const MAX_STACK_TRACE_CHARS: usize = 2000;

pub const COMPLETED_SUFFIX: &str = ".completed";
pub const RETRY_SUFFIX: &str = ".retry";
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub fn completed_topic(topic: &str) -> String {
    format!("{topic}{COMPLETED_SUFFIX}")
}

pub fn retry_topic(topic: &str) -> String {
    format!("{topic}{RETRY_SUFFIX}")
}

pub fn dlq_topic(topic: &str, dlq_suffix: &str) -> String {
    format!("{topic}{dlq_suffix}")
}

/// Which of the well-known destinations a topic name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Base,
    Completed,
    Retry,
    DeadLetter,
}

/// Split a destination into its base topic and kind.
pub fn classify_topic<'a>(destination: &'a str, dlq_suffix: &str) -> (&'a str, TopicKind) {
    if let Some(base) = destination.strip_suffix(COMPLETED_SUFFIX) {
        (base, TopicKind::Completed)
    } else if let Some(base) = destination.strip_suffix(RETRY_SUFFIX) {
        (base, TopicKind::Retry)
    } else if let Some(base) = (!dlq_suffix.is_empty())
        .then(|| destination.strip_suffix(dlq_suffix))
        .flatten()
    {
        (base, TopicKind::DeadLetter)
    } else {
        (destination, TopicKind::Base)
    }
}

// ---------------------------------------------------------------------------
// RetryInfo
// ---------------------------------------------------------------------------

/// Retry bookkeeping carried on a message between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    /// 1-based attempt counter.
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RetryInfo {
    /// First attempt with the given budget.
    pub fn first(max_attempts: u32) -> Self {
        Self {
            attempt: 1,
            max_attempts,
            next_retry_at: None,
            last_error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Copy with `attempt + 1`, scheduled at `at`.
    pub fn next_attempt(&self, at: DateTime<Utc>, last_error: Option<String>) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            max_attempts: self.max_attempts,
            next_retry_at: Some(at),
            last_error,
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// Failure details attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub exception_type: String,
    pub stack_trace: Option<String>,
    pub step_id: Option<u32>,
    pub step_label: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    /// Describe a step failure with the `STEP_EXECUTION_FAILED` code.
    pub fn from_step_error(err: &StepError, step_id: u32, step_label: &str) -> Self {
        let trace = err.trace().map(str::to_owned).unwrap_or_else(|| err.to_string());
        Self {
            code: STEP_EXECUTION_FAILED.to_string(),
            message: err.message().to_string(),
            exception_type: err.kind().to_string(),
            stack_trace: Some(truncate_stack_trace(&trace)),
            step_id: Some(step_id),
            step_label: Some(step_label.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Cap a trace at `MAX_STACK_TRACE_CHARS` characters, appending `...` when cut.
pub fn truncate_stack_trace(trace: &str) -> String {
    match trace.char_indices().nth(MAX_STACK_TRACE_CHARS) {
        Some((cut, _)) => format!("{}...", &trace[..cut]),
        None => trace.to_string(),
    }
}

// ---------------------------------------------------------------------------
// WorkflowMessage
// ---------------------------------------------------------------------------

/// Envelope exchanged over every broker hop of an execution.
///
/// `1 <= current_step <= total_steps` once `total_steps` is known; a
/// `total_steps` of 0 marks a forwarded execution of unknown length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMessage {
    pub execution_id: String,
    pub correlation_id: String,
    /// Base topic of the workflow (never carries a `.retry`/`.dlq` suffix).
    pub topic: String,
    pub service_name: Option<String>,
    pub current_step: u32,
    pub total_steps: u32,
    pub current_step_label: Option<String>,
    pub status: WorkflowStatus,
    pub payload: Option<serde_json::Value>,
    /// Declared type tag used to resolve a typed payload view.
    pub payload_type: Option<String>,
    /// Opaque security token captured at start and restored per step.
    pub security_context: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub retry_info: Option<RetryInfo>,
    pub error_info: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMessage {
    /// Initial `PENDING` message for a fresh execution at step 1.
    pub fn new(topic: impl Into<String>, total_steps: u32) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7().to_string(),
            correlation_id: Uuid::now_v7().to_string(),
            topic: topic.into(),
            service_name: None,
            current_step: 1,
            total_steps,
            current_step_label: None,
            status: WorkflowStatus::Pending,
            payload: None,
            payload_type: None,
            security_context: None,
            metadata: HashMap::new(),
            retry_info: None,
            error_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn with_step_label(mut self, label: impl Into<String>) -> Self {
        self.current_step_label = Some(label.into());
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_security_context(mut self, token: Option<String>) -> Self {
        self.security_context = token;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Executions are partitioned by id so one execution's hops stay ordered.
    pub fn routing_key(&self) -> &str {
        &self.execution_id
    }

    pub fn is_last_step(&self) -> bool {
        self.total_steps > 0 && self.current_step >= self.total_steps
    }

    /// Advance to the following step. Retry and error info are dropped.
    pub fn next_step(&self, next_label: Option<String>) -> Self {
        Self {
            current_step: self.current_step.saturating_add(1),
            current_step_label: next_label,
            status: WorkflowStatus::InProgress,
            retry_info: None,
            error_info: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Advance to the following step carrying the handler's output.
    pub fn next_step_with_payload(
        &self,
        payload: serde_json::Value,
        next_label: Option<String>,
    ) -> Self {
        self.next_step(next_label).with_payload(payload)
    }

    /// Terminal success message. Retry info is dropped.
    pub fn complete(&self) -> Self {
        Self {
            status: WorkflowStatus::Completed,
            retry_info: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowMessage {
        WorkflowMessage::new("orders", 3)
            .with_payload(json!({"order_id": 7}))
            .with_payload_type("Order")
            .with_step_label("validate")
    }

    #[test]
    fn test_new_message_starts_pending_at_step_one() {
        let msg = WorkflowMessage::new("orders", 3);
        assert_eq!(msg.status, WorkflowStatus::Pending);
        assert_eq!(msg.current_step, 1);
        assert_eq!(msg.total_steps, 3);
        assert_ne!(msg.execution_id, msg.correlation_id);
        assert_eq!(msg.routing_key(), msg.execution_id);
    }

    #[test]
    fn test_next_step_drops_retry_info() {
        let mut msg = sample();
        msg.retry_info = Some(RetryInfo::first(3));
        let next = msg.next_step(Some("charge".to_string()));
        assert_eq!(next.current_step, 2);
        assert_eq!(next.status, WorkflowStatus::InProgress);
        assert_eq!(next.current_step_label.as_deref(), Some("charge"));
        assert!(next.retry_info.is_none());
        assert_eq!(next.execution_id, msg.execution_id);
        assert_eq!(next.payload, msg.payload);
    }

    #[test]
    fn test_next_step_with_payload_replaces_payload() {
        let next = sample().next_step_with_payload(json!({"order_id": 7, "ok": true}), None);
        assert_eq!(next.payload, Some(json!({"order_id": 7, "ok": true})));
        assert_eq!(next.payload_type.as_deref(), Some("Order"));
    }

    #[test]
    fn test_complete_keeps_step_and_payload() {
        let mut msg = sample();
        msg.current_step = 3;
        msg.retry_info = Some(RetryInfo::first(3));
        let done = msg.complete();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.current_step, 3);
        assert!(done.retry_info.is_none());
        assert_eq!(done.payload, msg.payload);
    }

    #[test]
    fn test_is_last_step() {
        let mut msg = sample();
        assert!(!msg.is_last_step());
        msg.current_step = 3;
        assert!(msg.is_last_step());
        msg.total_steps = 0;
        assert!(!msg.is_last_step());
    }

    #[test]
    fn test_retry_info_exhaustion() {
        let info = RetryInfo::first(3);
        assert!(!info.is_exhausted());
        let at = Utc::now();
        let second = info.next_attempt(at, Some("boom".to_string()));
        assert_eq!(second.attempt, 2);
        assert_eq!(second.next_retry_at, Some(at));
        assert_eq!(second.last_error.as_deref(), Some("boom"));
        assert!(!second.is_exhausted());
        assert!(second.next_attempt(at, None).is_exhausted());
    }

    #[test]
    fn test_truncate_stack_trace_long() {
        let trace = "x".repeat(5000);
        let truncated = truncate_stack_trace(&trace);
        assert_eq!(truncated.chars().count(), 2003);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_truncate_stack_trace_exact_limit_untouched() {
        let trace = "y".repeat(MAX_STACK_TRACE_CHARS);
        assert_eq!(truncate_stack_trace(&trace), trace);
    }

    #[test]
    fn test_truncate_stack_trace_multibyte() {
        let trace = "é".repeat(2500);
        let truncated = truncate_stack_trace(&trace);
        assert_eq!(truncated.chars().count(), 2003);
    }

    #[test]
    fn test_error_info_from_step_error() {
        let err = StepError::new("payment_declined", "card declined").with_trace("x".repeat(3000));
        let info = ErrorInfo::from_step_error(&err, 2, "charge");
        assert_eq!(info.code, STEP_EXECUTION_FAILED);
        assert_eq!(info.exception_type, "payment_declined");
        assert_eq!(info.message, "card declined");
        assert_eq!(info.step_id, Some(2));
        assert_eq!(info.step_label.as_deref(), Some("charge"));
        assert_eq!(info.stack_trace.unwrap().len(), 2003);
    }

    #[test]
    fn test_classify_topic() {
        assert_eq!(classify_topic("orders", ".dlq"), ("orders", TopicKind::Base));
        assert_eq!(
            classify_topic("orders.retry", ".dlq"),
            ("orders", TopicKind::Retry)
        );
        assert_eq!(
            classify_topic("orders.completed", ".dlq"),
            ("orders", TopicKind::Completed)
        );
        assert_eq!(
            classify_topic("orders.dead", ".dead"),
            ("orders", TopicKind::DeadLetter)
        );
        assert_eq!(dlq_topic("orders", DEFAULT_DLQ_SUFFIX), "orders.dlq");
    }

    #[test]
    fn test_message_json_shape() {
        let msg = sample();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["current_step"], 1);
        let back: WorkflowMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
