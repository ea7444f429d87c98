//! Step execution engine.
//!
//! [`StepExecutor::execute`] drives one `WorkflowMessage` through one step:
//! resolve the definition, restore the security context, deserialize the
//! payload, run the handler, then emit exactly one message (advance or
//! complete on success; retry, continue, or dead-letter via the
//! [`FailureHandler`] on failure). Unknown topics and steps are logged and
//! dropped without emitting anything.
//!
//! The executor holds no per-call mutable state and may be shared across
//! concurrent consumer tasks.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use hopflow_types::config::EngineConfig;
use hopflow_types::error::{BrokerError, StepError};
use hopflow_types::message::{WorkflowMessage, completed_topic};

use crate::broker::MessageBroker;

use super::definition::{CallbackResult, StepContext, StepDefinition, WorkflowDefinition};
use super::failure::FailureHandler;
use super::payload::{PayloadDeserializer, RawPayloadDeserializer};
use super::registry::WorkflowRegistry;
use super::security::{NoopSecurityPropagator, SecurityContextPropagator, SecurityScope};

/// What a single `execute` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Emitted the next step to the base topic.
    Advanced { next_step: u32 },
    /// Emitted the completion to `{topic}.completed`.
    Completed,
    /// Emitted a `RETRY_PENDING` message to `{topic}.retry`.
    RetryScheduled {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// The step failed but is flagged to continue; emitted the next step.
    ContinuedPastFailure { next_step: u32 },
    /// Retries exhausted or error not retryable. `dlq_sent` is false when
    /// the dead-letter topic is disabled.
    DeadLettered { dlq_sent: bool },
    /// Nothing emitted.
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnknownTopic(String),
    UnknownStep { topic: String, step: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Emitting the transition message failed (including circuit-open
    /// rejections and backpressure). The failure path is not entered for
    /// dispatch errors; `message` is the transition the broker refused.
    #[error("failed to dispatch execution '{execution_id}' to '{destination}': {source}")]
    Dispatch {
        execution_id: String,
        destination: String,
        message: Box<WorkflowMessage>,
        #[source]
        source: BrokerError,
    },
}

/// Emit a transition, waiting for the transport to accept it.
pub(crate) async fn dispatch<B: MessageBroker>(
    broker: &B,
    destination: &str,
    message: &WorkflowMessage,
) -> Result<(), EngineError> {
    broker
        .send_sync(destination, message)
        .await
        .map_err(|source| EngineError::Dispatch {
            execution_id: message.execution_id.clone(),
            destination: destination.to_string(),
            message: Box::new(message.clone()),
            source,
        })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a user callback, logging and swallowing errors and panics.
pub(crate) async fn run_callback<F>(kind: &'static str, execution_id: &str, start: F)
where
    F: FnOnce() -> BoxFuture<'static, CallbackResult>,
{
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(fut) => fut,
        Err(panic) => {
            tracing::error!(%execution_id, callback = kind, "callback panicked: {}", panic_message(&*panic));
            return;
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(%execution_id, callback = kind, "callback failed: {err}"),
        Err(panic) => {
            tracing::error!(%execution_id, callback = kind, "callback panicked: {}", panic_message(&*panic))
        }
    }
}

pub struct StepExecutor<B: MessageBroker> {
    registry: Arc<WorkflowRegistry>,
    broker: Arc<B>,
    deserializer: Arc<dyn PayloadDeserializer>,
    security: Arc<dyn SecurityContextPropagator>,
    failure_handler: FailureHandler<B>,
    default_timeout: Option<Duration>,
}

impl<B: MessageBroker> StepExecutor<B> {
    /// Executor with raw payloads and no security propagation.
    pub fn new(registry: Arc<WorkflowRegistry>, broker: Arc<B>, config: &EngineConfig) -> Self {
        Self {
            failure_handler: FailureHandler::new(
                Arc::clone(&broker),
                config.retry.clone(),
                config.dlq.clone(),
            ),
            registry,
            broker,
            deserializer: Arc::new(RawPayloadDeserializer),
            security: Arc::new(NoopSecurityPropagator),
            default_timeout: config.timeout.default_step_timeout(),
        }
    }

    pub fn with_deserializer(mut self, deserializer: Arc<dyn PayloadDeserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityContextPropagator>) -> Self {
        self.security = security;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub async fn execute(&self, message: &WorkflowMessage) -> Result<StepOutcome, EngineError> {
        let Some(definition) = self.registry.get(&message.topic) else {
            tracing::error!(
                execution_id = %message.execution_id,
                topic = %message.topic,
                "unknown workflow topic, dropping message"
            );
            return Ok(StepOutcome::Dropped(DropReason::UnknownTopic(message.topic.clone())));
        };
        let Some(step) = definition.get_step(message.current_step) else {
            tracing::error!(
                execution_id = %message.execution_id,
                topic = %message.topic,
                step = message.current_step,
                "unknown step, dropping message"
            );
            return Ok(StepOutcome::Dropped(DropReason::UnknownStep {
                topic: message.topic.clone(),
                step: message.current_step,
            }));
        };

        tracing::info!(
            execution_id = %message.execution_id,
            topic = %message.topic,
            step = step.id,
            total_steps = definition.total_steps(),
            label = %step.label,
            "executing step"
        );

        let mut message = message.clone();
        message.current_step_label = Some(step.label.clone());

        // Released when this call returns, whichever path it takes.
        let scope = SecurityScope::enter(
            Arc::clone(&self.security),
            message.security_context.as_deref(),
        );
        let security = scope.context().cloned();

        let result = match self.deserializer.deserialize(&message) {
            Ok(payload) => {
                let ctx = StepContext {
                    execution_id: message.execution_id.clone(),
                    correlation_id: message.correlation_id.clone(),
                    topic: message.topic.clone(),
                    step_id: step.id,
                    step_label: step.label.clone(),
                    attempt: message.retry_info.as_ref().map_or(1, |r| r.attempt),
                    payload,
                    metadata: message.metadata.clone(),
                    security,
                };
                self.invoke(&definition, step, ctx).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(output) => self.on_success(&message, &definition, step, output).await,
            Err(err) => {
                tracing::error!(
                    execution_id = %message.execution_id,
                    topic = %message.topic,
                    step = step.id,
                    label = %step.label,
                    kind = %err.kind(),
                    "step failed: {}",
                    err.message()
                );
                self.failure_handler
                    .handle(&message, &definition, step, err)
                    .await
            }
        }
    }

    /// Run the handler, turning panics and timeouts into step errors.
    async fn invoke(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> Result<serde_json::Value, StepError> {
        let handler = &step.handler;
        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(ctx)))
            .map_err(|panic| StepError::panic(panic_message(&*panic)))?;
        let guarded = AssertUnwindSafe(fut).catch_unwind();

        let outcome = match definition.step_timeout(step).or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| StepError::timeout(limit))?,
            None => guarded.await,
        };
        outcome.map_err(|panic| StepError::panic(panic_message(&*panic)))?
    }

    async fn on_success(
        &self,
        message: &WorkflowMessage,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        output: serde_json::Value,
    ) -> Result<StepOutcome, EngineError> {
        if definition.is_last_step(step.id) {
            let completed = message.complete().with_payload(output);
            if let Some(callback) = &definition.on_success {
                run_callback("on_success", &message.execution_id, || callback.invoke(&completed)).await;
            }
            dispatch(&*self.broker, &completed_topic(&message.topic), &completed).await?;
            tracing::info!(
                execution_id = %message.execution_id,
                topic = %message.topic,
                "workflow completed"
            );
            return Ok(StepOutcome::Completed);
        }

        let next_label = definition.get_step(step.id + 1).map(|s| s.label.clone());
        let next = message.next_step_with_payload(output, next_label);
        dispatch(&*self.broker, &message.topic, &next).await?;
        tracing::info!(
            execution_id = %message.execution_id,
            topic = %message.topic,
            step = next.current_step,
            total_steps = definition.total_steps(),
            "advanced to next step"
        );
        Ok(StepOutcome::Advanced {
            next_step: next.current_step,
        })
    }
}
