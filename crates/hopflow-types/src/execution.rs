//! Persisted execution aggregate.
//!
//! `WorkflowExecution` is the durable view of one run. It is mutated by the
//! execution recorder (message path) and by the operator command services,
//! always under an optimistic `version` check.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ErrorInfo, RetryInfo, WorkflowMessage};
use crate::status::WorkflowStatus;

/// One field-level payload edit made by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadChange {
    /// Dotted/bracketed path, e.g. `order.items[0].sku`.
    pub field_path: String,
    /// `None` when the field did not exist before the edit.
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
    /// Shallowest missing ancestor the edit had to create, e.g. `shipping`
    /// for a first write to `shipping.address.city`. Restoring removes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_path: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub changed_by: String,
    pub reason: Option<String>,
}

/// History entry for a single step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: u32,
    pub step_label: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub attempt: Option<u32>,
}

/// One pass over the workflow: the initial run or an operator resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub attempt_number: u32,
    pub start_step: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_step: Option<u32>,
    /// Terminal status the attempt ended with.
    pub result: Option<WorkflowStatus>,
    pub error_message: Option<String>,
    pub resumed_by: Option<String>,
    #[serde(default)]
    pub payload_changes: Vec<PayloadChange>,
}

impl ExecutionAttempt {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Durable state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    /// Optimistic concurrency stamp; `None` until first stored.
    pub version: Option<u64>,
    pub correlation_id: String,
    pub topic: String,
    pub service_name: Option<String>,
    pub status: WorkflowStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub current_step_label: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub payload_type: Option<String>,
    pub security_context: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub retry_info: Option<RetryInfo>,
    pub error_info: Option<ErrorInfo>,
    #[serde(default)]
    pub step_history: Vec<StepExecution>,
    #[serde(default)]
    pub execution_attempts: Vec<ExecutionAttempt>,
    /// Operator edits not yet attributed to an attempt.
    #[serde(default)]
    pub payload_history: Vec<PayloadChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub initiated_by: Option<String>,
    pub duration_ms: Option<i64>,
}

impl WorkflowExecution {
    /// Seed an aggregate from the first message observed for an execution.
    ///
    /// Opens attempt 1 at the message's step.
    pub fn from_message(msg: &WorkflowMessage) -> Self {
        let now = Utc::now();
        Self {
            execution_id: msg.execution_id.clone(),
            version: None,
            correlation_id: msg.correlation_id.clone(),
            topic: msg.topic.clone(),
            service_name: msg.service_name.clone(),
            status: msg.status,
            current_step: msg.current_step,
            total_steps: msg.total_steps,
            current_step_label: msg.current_step_label.clone(),
            payload: msg.payload.clone(),
            payload_type: msg.payload_type.clone(),
            security_context: msg.security_context.clone(),
            metadata: msg.metadata.clone(),
            retry_info: msg.retry_info.clone(),
            error_info: msg.error_info.clone(),
            step_history: Vec::new(),
            execution_attempts: vec![ExecutionAttempt {
                attempt_number: 1,
                start_step: msg.current_step,
                started_at: msg.created_at,
                ended_at: None,
                end_step: None,
                result: None,
                error_message: None,
                resumed_by: None,
                payload_changes: Vec::new(),
            }],
            payload_history: Vec::new(),
            created_at: msg.created_at,
            updated_at: now,
            completed_at: None,
            initiated_by: msg
                .metadata
                .get("initiated_by")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            duration_ms: None,
        }
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_info.as_ref().and_then(|r| r.next_retry_at)
    }

    pub fn current_attempt(&self) -> Option<&ExecutionAttempt> {
        self.execution_attempts.last()
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut ExecutionAttempt> {
        self.execution_attempts.last_mut()
    }

    /// Open a new attempt, moving pending payload edits into it.
    ///
    /// Any attempt still open is closed with the execution's current status.
    pub fn begin_attempt(
        &mut self,
        start_step: u32,
        resumed_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> u32 {
        let status = self.status;
        let current_step = self.current_step;
        if let Some(open) = self.current_attempt_mut().filter(|a| a.is_open()) {
            open.ended_at = Some(now);
            open.end_step = Some(current_step);
            open.result = Some(status);
        }

        let attempt_number = self.execution_attempts.len() as u32 + 1;
        self.execution_attempts.push(ExecutionAttempt {
            attempt_number,
            start_step,
            started_at: now,
            ended_at: None,
            end_step: None,
            result: None,
            error_message: None,
            resumed_by: Some(resumed_by.into()),
            payload_changes: std::mem::take(&mut self.payload_history),
        });
        self.updated_at = now;
        attempt_number
    }

    /// Stamp a terminal status: completion time, total duration, and the
    /// outcome of the open attempt.
    pub fn finalize(&mut self, status: WorkflowStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.duration_ms = Some((now - self.created_at).num_milliseconds().max(0));

        let current_step = self.current_step;
        let error_message = self.error_info.as_ref().map(|e| e.message.clone());
        if let Some(open) = self.current_attempt_mut().filter(|a| a.is_open()) {
            open.ended_at = Some(now);
            open.end_step = Some(current_step);
            open.result = Some(status);
            if status == WorkflowStatus::Failed {
                open.error_message = error_message;
            }
        }
    }
}
