//! Resume and cancel commands over persisted executions.

use std::sync::Arc;

use chrono::Utc;
use hopflow_types::config::OutboxConfig;
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::outbox::{OutboxMessage, OutboxMessageType};
use hopflow_types::status::WorkflowStatus;

use crate::broker::MessageBroker;
use crate::repository::execution::ExecutionRepository;
use crate::repository::outbox::OutboxRepository;
use crate::workflow::factory::MessageFactory;

use super::CommandError;

pub struct CommandService<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    /// `Some(max_attempts)` routes resume messages through the outbox.
    outbox_max_attempts: Option<u32>,
}

impl<S, B> CommandService<S, B>
where
    S: ExecutionRepository + OutboxRepository,
    B: MessageBroker,
{
    pub fn new(store: Arc<S>, broker: Arc<B>) -> Self {
        Self {
            store,
            broker,
            outbox_max_attempts: None,
        }
    }

    pub fn with_outbox(mut self, config: &OutboxConfig) -> Self {
        self.outbox_max_attempts = config.enabled.then_some(config.max_attempts);
        self
    }

    async fn load(&self, execution_id: &str) -> Result<WorkflowExecution, CommandError> {
        self.store
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| CommandError::NotFound(execution_id.to_string()))
    }

    /// Restart a failed, paused, or retry-pending execution at `from_step`
    /// (default: its current step).
    ///
    /// A new attempt is recorded and persisted before the resume message is
    /// dispatched. If the direct send fails the attempt stays recorded and
    /// `ResumeFailed` is returned; the operator resumes again.
    pub async fn resume(
        &self,
        execution_id: &str,
        from_step: Option<u32>,
        resumed_by: &str,
    ) -> Result<WorkflowExecution, CommandError> {
        let mut execution = self.load(execution_id).await?;
        if !execution.status.is_resumable() {
            return Err(CommandError::invalid_status(execution_id, "resume", execution.status));
        }

        let resume_step = from_step.unwrap_or(execution.current_step);
        if resume_step == 0 || resume_step > execution.total_steps {
            return Err(CommandError::InvalidState {
                execution_id: execution_id.to_string(),
                operation: "resume",
                reason: format!(
                    "step {resume_step} is outside 1..={}",
                    execution.total_steps
                ),
            });
        }

        let attempt = execution.begin_attempt(resume_step, resumed_by, Utc::now());
        let message = MessageFactory::create_resume_message(&execution, resume_step);

        if let Some(max_attempts) = self.outbox_max_attempts {
            let record = OutboxMessage::new(
                execution.topic.clone(),
                message,
                OutboxMessageType::Resume,
                max_attempts,
            );
            let stored = self
                .store
                .save_with_outbox(&execution, &record)
                .await
                .map_err(|e| CommandError::from_save(execution_id, e))?;
            tracing::info!(
                %execution_id,
                step = resume_step,
                attempt,
                outbox_id = %record.id,
                "resume queued in outbox"
            );
            return Ok(stored);
        }

        let stored = self
            .store
            .save(&execution)
            .await
            .map_err(|e| CommandError::from_save(execution_id, e))?;

        self.broker
            .send_sync(&stored.topic, &message)
            .await
            .map_err(|source| {
                tracing::error!(
                    %execution_id,
                    attempt,
                    broker = self.broker.broker_type(),
                    "failed to send resume message: {source}"
                );
                CommandError::ResumeFailed {
                    execution_id: execution_id.to_string(),
                    attempt,
                    broker_type: self.broker.broker_type().to_string(),
                    source,
                }
            })?;

        tracing::info!(%execution_id, step = resume_step, attempt, %resumed_by, "resumed workflow");
        Ok(stored)
    }

    /// Mark an execution cancelled. No message is emitted; consumers skip
    /// further deliveries for it.
    pub async fn cancel(&self, execution_id: &str) -> Result<WorkflowExecution, CommandError> {
        let mut execution = self.load(execution_id).await?;
        if matches!(
            execution.status,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled
        ) {
            return Err(CommandError::invalid_status(execution_id, "cancel", execution.status));
        }

        execution.finalize(WorkflowStatus::Cancelled, Utc::now());
        let stored = self
            .store
            .save(&execution)
            .await
            .map_err(|e| CommandError::from_save(execution_id, e))?;
        tracing::info!(%execution_id, "cancelled workflow");
        Ok(stored)
    }
}
