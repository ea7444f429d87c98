//! Applies observed workflow messages to the persisted execution aggregate.
//!
//! Every hop the engine emits ends up here (via the consumer), so the
//! stored execution tracks status, current step, retry/error details and a
//! per-step history. Writes go through the repository's compare-and-swap;
//! a lost race reloads and re-applies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hopflow_types::error::RepositoryError;
use hopflow_types::execution::{StepExecution, WorkflowExecution};
use hopflow_types::message::WorkflowMessage;
use hopflow_types::status::WorkflowStatus;

use crate::repository::execution::ExecutionRepository;

const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Saved(WorkflowExecution),
    /// The stored execution is cancelled or completed; left untouched.
    Ignored(WorkflowStatus),
}

pub struct ExecutionRecorder<R: ExecutionRepository> {
    repository: Arc<R>,
    max_conflict_retries: u32,
}

impl<R: ExecutionRepository> ExecutionRecorder<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub async fn record(&self, message: &WorkflowMessage) -> Result<RecordOutcome, RepositoryError> {
        let mut conflicts = 0;
        loop {
            let mut execution = match self.repository.find_by_id(&message.execution_id).await? {
                Some(existing) if existing.status.halts_processing() => {
                    tracing::debug!(
                        execution_id = %message.execution_id,
                        stored_status = %existing.status,
                        message_status = %message.status,
                        "execution already {}, not recording",
                        existing.status
                    );
                    return Ok(RecordOutcome::Ignored(existing.status));
                }
                Some(existing) => existing,
                None => WorkflowExecution::from_message(message),
            };

            apply_message(&mut execution, message, Utc::now());

            match self.repository.save(&execution).await {
                Ok(stored) => {
                    tracing::debug!(
                        execution_id = %message.execution_id,
                        step = message.current_step,
                        status = %message.status,
                        "recorded workflow message"
                    );
                    return Ok(RecordOutcome::Saved(stored));
                }
                Err(RepositoryError::OptimisticLock { .. }) if conflicts < self.max_conflict_retries => {
                    conflicts += 1;
                    tracing::debug!(
                        execution_id = %message.execution_id,
                        attempt = conflicts,
                        "version conflict while recording, reloading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fold one message into the aggregate.
pub fn apply_message(execution: &mut WorkflowExecution, message: &WorkflowMessage, now: DateTime<Utc>) {
    let status = message.status;
    execution.status = status;
    execution.current_step = message.current_step;
    execution.total_steps = message.total_steps;
    if message.current_step_label.is_some() {
        execution.current_step_label = message.current_step_label.clone();
    }
    if message.payload.is_some() {
        execution.payload = message.payload.clone();
    }
    execution.retry_info = message.retry_info.clone();
    execution.error_info = message.error_info.clone();
    execution.updated_at = now;

    if matches!(
        status,
        WorkflowStatus::Pending
            | WorkflowStatus::InProgress
            | WorkflowStatus::RetryPending
            | WorkflowStatus::Completed
            | WorkflowStatus::Failed
    ) {
        record_step(execution, message, now);
    }

    if status.is_terminal() {
        execution.finalize(status, now);
    } else {
        // A resumed execution is running again.
        execution.completed_at = None;
        execution.duration_ms = None;
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

fn record_step(execution: &mut WorkflowExecution, message: &WorkflowMessage, now: DateTime<Utc>) {
    let step_id = message.current_step;

    for earlier in execution.step_history.iter_mut().filter(|s| {
        s.step_id < step_id && matches!(s.status, WorkflowStatus::Pending | WorkflowStatus::InProgress)
    }) {
        earlier.status = WorkflowStatus::Passed;
        earlier.completed_at = Some(now);
        earlier.duration_ms = Some(elapsed_ms(earlier.started_at, now));
    }

    let index = match execution.step_history.iter().rposition(|s| s.step_id == step_id) {
        Some(index) => index,
        None => {
            execution.step_history.push(StepExecution {
                step_id,
                step_label: message.current_step_label.clone(),
                status: message.status,
                started_at: now,
                completed_at: None,
                duration_ms: None,
                error_message: None,
                attempt: Some(1),
            });
            execution.step_history.len() - 1
        }
    };

    let entry = &mut execution.step_history[index];
    entry.status = message.status;
    if entry.step_label.is_none() {
        entry.step_label = message.current_step_label.clone();
    }
    if matches!(message.status, WorkflowStatus::Completed | WorkflowStatus::Failed) {
        entry.completed_at = Some(now);
        entry.duration_ms = Some(elapsed_ms(entry.started_at, now));
    }
    if let Some(error) = &message.error_info {
        entry.error_message = Some(error.message.clone());
    }
    if let Some(retry) = &message.retry_info {
        entry.attempt = Some(retry.attempt);
    }
}
