//! Failure path for a step that returned an error.
//!
//! Decision order: continue past the failure when the step allows it and is
//! not the last one, otherwise retry while the budget lasts and the error
//! kind is retryable, otherwise dead-letter and run `on_failure`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hopflow_types::config::{DlqConfig, RetryConfig};
use hopflow_types::error::StepError;
use hopflow_types::message::{RetryInfo, WorkflowMessage, dlq_topic, retry_topic};

use crate::broker::MessageBroker;

use super::backoff::BackoffCalculator;
use super::definition::{StepDefinition, WorkflowDefinition};
use super::executor::{EngineError, StepOutcome, dispatch, run_callback};
use super::factory::MessageFactory;

pub struct FailureHandler<B: MessageBroker> {
    broker: Arc<B>,
    retry: RetryConfig,
    dlq: DlqConfig,
    backoff: BackoffCalculator,
}

impl<B: MessageBroker> FailureHandler<B> {
    pub fn new(broker: Arc<B>, retry: RetryConfig, dlq: DlqConfig) -> Self {
        Self {
            backoff: BackoffCalculator::from_config(&retry),
            broker,
            retry,
            dlq,
        }
    }

    pub async fn handle(
        &self,
        message: &WorkflowMessage,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        err: StepError,
    ) -> Result<StepOutcome, EngineError> {
        if step.continue_on_failure && !definition.is_last_step(step.id) {
            let next_label = definition.get_step(step.id + 1).map(|s| s.label.clone());
            let next = message.next_step(next_label);
            dispatch(&*self.broker, &message.topic, &next).await?;
            tracing::warn!(
                execution_id = %message.execution_id,
                topic = %message.topic,
                step = step.id,
                next_step = next.current_step,
                "step failed, continuing past failure: {err}"
            );
            return Ok(StepOutcome::ContinuedPastFailure {
                next_step: next.current_step,
            });
        }

        let retry_info = message
            .retry_info
            .clone()
            .unwrap_or_else(|| RetryInfo::first(self.retry.max_attempts));
        let retryable = !self.retry.is_non_retryable(err.kind());

        if retryable && !retry_info.is_exhausted() {
            return self.schedule_retry(message, &retry_info, &err).await;
        }

        if !retryable {
            tracing::warn!(
                execution_id = %message.execution_id,
                kind = %err.kind(),
                "error kind is not retryable, skipping retries"
            );
        }
        self.dead_letter(message, definition, step, err, retry_info.attempt)
            .await
    }

    async fn schedule_retry(
        &self,
        message: &WorkflowMessage,
        retry_info: &RetryInfo,
        err: &StepError,
    ) -> Result<StepOutcome, EngineError> {
        let delay = self.backoff.calculate(retry_info.attempt);
        let now = Utc::now();
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let next = retry_info.next_attempt(next_retry_at, Some(err.message().to_string()));
        let attempt = next.attempt;
        let retry = MessageFactory::create_retry_message(message, next);
        dispatch(&*self.broker, &retry_topic(&message.topic), &retry).await?;

        tracing::info!(
            execution_id = %message.execution_id,
            topic = %message.topic,
            step = message.current_step,
            attempt,
            max_attempts = retry_info.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduled retry"
        );
        Ok(StepOutcome::RetryScheduled {
            attempt,
            next_retry_at,
        })
    }

    async fn dead_letter(
        &self,
        message: &WorkflowMessage,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        err: StepError,
        attempts: u32,
    ) -> Result<StepOutcome, EngineError> {
        let error_info = MessageFactory::create_error_info(&err, step);
        let dlq_message = MessageFactory::create_dlq_message(message, error_info);

        let sent = if self.dlq.enabled {
            let destination = dlq_topic(&message.topic, &self.dlq.suffix);
            let result = dispatch(&*self.broker, &destination, &dlq_message).await;
            if result.is_ok() {
                tracing::error!(
                    execution_id = %message.execution_id,
                    topic = %message.topic,
                    step = step.id,
                    attempts,
                    %destination,
                    "workflow failed, sent to dead-letter topic"
                );
            }
            Some(result)
        } else {
            tracing::error!(
                execution_id = %message.execution_id,
                topic = %message.topic,
                step = step.id,
                attempts,
                "workflow failed, dead-letter topic disabled"
            );
            None
        };

        if let Some(callback) = &definition.on_failure {
            run_callback("on_failure", &message.execution_id, || {
                callback.invoke(message, &err)
            })
            .await;
        }

        match sent {
            Some(result) => result.map(|()| StepOutcome::DeadLettered { dlq_sent: true }),
            None => Ok(StepOutcome::DeadLettered { dlq_sent: false }),
        }
    }
}
