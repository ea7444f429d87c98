//! Consumer-side routing of broker deliveries.
//!
//! Every delivery is recorded. Base-topic deliveries then run the step,
//! unless the stored execution is already cancelled or completed, in which
//! case the delivery is acknowledged and dropped.
//!
//! When the broker refuses the transition a step produced, the refused
//! message is recorded instead. Running states are parked as `RETRY_PENDING`
//! so the retry sweep redelivers them; nothing is left `IN_PROGRESS` with
//! no message in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use hopflow_types::config::RetryConfig;
use hopflow_types::error::{BrokerError, RepositoryError};
use hopflow_types::message::{RetryInfo, TopicKind, WorkflowMessage, classify_topic};
use hopflow_types::status::WorkflowStatus;

use crate::broker::{DeliveryHandler, MessageBroker};
use crate::repository::execution::ExecutionRepository;

use super::executor::{EngineError, StepExecutor, StepOutcome};
use super::recorder::{ExecutionRecorder, RecordOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Executed(StepOutcome),
    /// Completion, retry, or dead-letter delivery persisted.
    Recorded(TopicKind),
    /// Stored execution halts processing.
    Skipped(WorkflowStatus),
    /// The step ran but its transition was refused; the execution was
    /// stored with this status instead.
    Parked(WorkflowStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct WorkflowConsumer<R: ExecutionRepository, B: MessageBroker> {
    executor: Arc<StepExecutor<B>>,
    recorder: ExecutionRecorder<R>,
    dlq_suffix: String,
    redelivery_delay: Duration,
    max_attempts: u32,
}

impl<R: ExecutionRepository, B: MessageBroker> WorkflowConsumer<R, B> {
    pub fn new(executor: Arc<StepExecutor<B>>, recorder: ExecutionRecorder<R>, dlq_suffix: impl Into<String>) -> Self {
        Self {
            executor,
            recorder,
            dlq_suffix: dlq_suffix.into(),
            redelivery_delay: RetryConfig::default().initial_delay(),
            max_attempts: RetryConfig::default().max_attempts,
        }
    }

    /// Delay and retry budget for executions parked after a refused dispatch.
    pub fn with_redelivery(mut self, retry: &RetryConfig) -> Self {
        self.redelivery_delay = retry.initial_delay();
        self.max_attempts = retry.max_attempts;
        self
    }

    pub async fn handle(&self, destination: &str, message: &WorkflowMessage) -> Result<ConsumeOutcome, ConsumeError> {
        let (_, kind) = classify_topic(destination, &self.dlq_suffix);

        match self.recorder.record(message).await? {
            RecordOutcome::Ignored(status) => {
                tracing::info!(
                    execution_id = %message.execution_id,
                    %destination,
                    %status,
                    "execution is {status}, skipping delivery"
                );
                Ok(ConsumeOutcome::Skipped(status))
            }
            RecordOutcome::Saved(_) if kind == TopicKind::Base => {
                match self.executor.execute(message).await {
                    Ok(outcome) => Ok(ConsumeOutcome::Executed(outcome)),
                    Err(EngineError::Dispatch {
                        destination,
                        message: refused,
                        source,
                        ..
                    }) => self.park(&destination, *refused, &source).await,
                }
            }
            RecordOutcome::Saved(_) => Ok(ConsumeOutcome::Recorded(kind)),
        }
    }

    async fn park(
        &self,
        destination: &str,
        mut refused: WorkflowMessage,
        source: &BrokerError,
    ) -> Result<ConsumeOutcome, ConsumeError> {
        if matches!(refused.status, WorkflowStatus::Pending | WorkflowStatus::InProgress) {
            let mut retry_info = refused
                .retry_info
                .take()
                .unwrap_or_else(|| RetryInfo::first(self.max_attempts));
            retry_info.next_retry_at = Some(redelivery_at(Utc::now(), self.redelivery_delay));
            retry_info.last_error = Some(source.to_string());
            refused.retry_info = Some(retry_info);
            refused.status = WorkflowStatus::RetryPending;
        }

        let status = refused.status;
        tracing::warn!(
            execution_id = %refused.execution_id,
            %destination,
            step = refused.current_step,
            %status,
            "dispatch refused, parking execution: {source}"
        );
        match self.recorder.record(&refused).await? {
            RecordOutcome::Saved(_) => Ok(ConsumeOutcome::Parked(status)),
            RecordOutcome::Ignored(stored) => Ok(ConsumeOutcome::Skipped(stored)),
        }
    }
}

fn redelivery_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

impl<R, B> DeliveryHandler for WorkflowConsumer<R, B>
where
    R: ExecutionRepository + 'static,
    B: MessageBroker + 'static,
{
    fn deliver<'a>(&'a self, destination: &'a str, message: WorkflowMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.handle(destination, &message).await {
                tracing::error!(
                    execution_id = %message.execution_id,
                    %destination,
                    "failed to process delivery: {e}"
                );
            }
        })
    }
}
