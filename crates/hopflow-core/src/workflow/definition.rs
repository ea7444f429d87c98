//! Workflow and step definitions, built explicitly and registered at startup.
//!
//! Handlers and callbacks are bound once, when the definition is built, as
//! one of a small fixed set of closure shapes. The engine never inspects a
//! handler's signature per call.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use hopflow_types::error::{StepError, kinds};
use hopflow_types::message::WorkflowMessage;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::security::SecurityContext;

pub type StepResult = Result<serde_json::Value, StepError>;
pub type CallbackResult = Result<(), StepError>;

type PayloadFn = dyn Fn(serde_json::Value) -> BoxFuture<'static, StepResult> + Send + Sync;
type ContextFn = dyn Fn(StepContext) -> BoxFuture<'static, StepResult> + Send + Sync;

/// Everything a contextual handler can see about the running step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub correlation_id: String,
    pub topic: String,
    pub step_id: u32,
    pub step_label: String,
    /// 1 on the first run, then the retry attempt number.
    pub attempt: u32,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub security: Option<SecurityContext>,
}

/// Step body. The returned value becomes the payload of the next hop.
#[derive(Clone)]
pub enum StepHandler {
    /// Receives only the deserialized payload.
    Payload(Arc<PayloadFn>),
    /// Receives the payload with execution context.
    Contextual(Arc<ContextFn>),
}

impl StepHandler {
    pub fn payload<F, Fut>(f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        StepHandler::Payload(Arc::new(move |payload| -> BoxFuture<'static, StepResult> {
            Box::pin(f(payload))
        }))
    }

    pub fn contextual<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        StepHandler::Contextual(Arc::new(move |ctx| -> BoxFuture<'static, StepResult> {
            Box::pin(f(ctx))
        }))
    }

    /// Handler over a typed payload. A payload that does not decode as `T`
    /// fails the step with kind `invalid_input`.
    pub fn typed<T, R, F, Fut>(f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, StepError>> + Send + 'static,
    {
        let f = Arc::new(f);
        StepHandler::Payload(Arc::new(move |payload| -> BoxFuture<'static, StepResult> {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let input: T = serde_json::from_value(payload).map_err(|e| {
                    StepError::new(kinds::INVALID_INPUT, format!("payload does not match handler input: {e}"))
                })?;
                let output = f(input).await?;
                Ok(serde_json::to_value(output)?)
            })
        }))
    }

    pub(crate) fn invoke(&self, ctx: StepContext) -> BoxFuture<'static, StepResult> {
        match self {
            StepHandler::Payload(f) => f(ctx.payload),
            StepHandler::Contextual(f) => f(ctx),
        }
    }
}

impl fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepHandler::Payload(_) => f.write_str("StepHandler::Payload"),
            StepHandler::Contextual(_) => f.write_str("StepHandler::Contextual"),
        }
    }
}

/// Invoked once an execution completes, before the completion is emitted.
#[derive(Clone)]
pub enum SuccessCallback {
    /// Receives the completion message (payload = final handler output).
    Message(Arc<dyn Fn(WorkflowMessage) -> BoxFuture<'static, CallbackResult> + Send + Sync>),
    /// Receives only the final payload.
    Payload(Arc<dyn Fn(Option<serde_json::Value>) -> BoxFuture<'static, CallbackResult> + Send + Sync>),
}

impl SuccessCallback {
    pub fn message<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        SuccessCallback::Message(Arc::new(move |msg| -> BoxFuture<'static, CallbackResult> {
            Box::pin(f(msg))
        }))
    }

    pub fn payload<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        SuccessCallback::Payload(Arc::new(move |payload| -> BoxFuture<'static, CallbackResult> {
            Box::pin(f(payload))
        }))
    }

    pub(crate) fn invoke(&self, message: &WorkflowMessage) -> BoxFuture<'static, CallbackResult> {
        match self {
            SuccessCallback::Message(f) => f(message.clone()),
            SuccessCallback::Payload(f) => f(message.payload.clone()),
        }
    }
}

/// Invoked once an execution is dead-lettered.
#[derive(Clone)]
pub enum FailureCallback {
    /// Receives the failing message as it arrived.
    Message(Arc<dyn Fn(WorkflowMessage) -> BoxFuture<'static, CallbackResult> + Send + Sync>),
    /// Receives the failing message and the causal error.
    MessageAndError(
        Arc<dyn Fn(WorkflowMessage, StepError) -> BoxFuture<'static, CallbackResult> + Send + Sync>,
    ),
}

impl FailureCallback {
    pub fn message<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        FailureCallback::Message(Arc::new(move |msg| -> BoxFuture<'static, CallbackResult> {
            Box::pin(f(msg))
        }))
    }

    pub fn with_error<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowMessage, StepError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        FailureCallback::MessageAndError(Arc::new(
            move |msg, err| -> BoxFuture<'static, CallbackResult> { Box::pin(f(msg, err)) },
        ))
    }

    pub(crate) fn invoke(
        &self,
        message: &WorkflowMessage,
        err: &StepError,
    ) -> BoxFuture<'static, CallbackResult> {
        match self {
            FailureCallback::Message(f) => f(message.clone()),
            FailureCallback::MessageAndError(f) => f(message.clone(), err.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// One step of a workflow. `id` fixes its position (1-based, contiguous).
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: u32,
    pub label: String,
    pub description: Option<String>,
    pub handler: StepHandler,
    /// Reported in step listings for operators; the engine always runs the step.
    pub skippable: bool,
    /// Advance past a failure instead of retrying (ignored on the last step).
    pub continue_on_failure: bool,
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    pub fn new(id: u32, label: impl Into<String>, handler: StepHandler) -> Self {
        Self {
            id,
            label: label.into(),
            description: None,
            handler,
            skippable: false,
            continue_on_failure: false,
            timeout: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    pub fn continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Errors from [`WorkflowDefinitionBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow topic must not be empty")]
    EmptyTopic,

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("workflow '{topic}' declares step {id} more than once")]
    DuplicateStep { topic: String, id: u32 },

    #[error("workflow '{topic}' step ids must be 1..=n without gaps: expected {expected}, found {found}")]
    NonContiguous {
        topic: String,
        expected: u32,
        found: u32,
    },
}

/// A named, ordered sequence of steps keyed by topic.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub topic: String,
    pub description: Option<String>,
    /// Sorted by id; `steps[i].id == i + 1`.
    steps: Vec<StepDefinition>,
    pub on_success: Option<SuccessCallback>,
    pub on_failure: Option<FailureCallback>,
    /// Applies to steps without their own timeout.
    pub timeout: Option<Duration>,
    /// Broker topology hint.
    pub partitions: u32,
    /// Broker topology hint.
    pub replication: u16,
}

impl WorkflowDefinition {
    pub fn builder(topic: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            topic: topic.into(),
            description: None,
            steps: Vec::new(),
            on_success: None,
            on_failure: None,
            timeout: None,
            partitions: 1,
            replication: 1,
        }
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn get_step(&self, id: u32) -> Option<&StepDefinition> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.steps.get(index)
    }

    pub fn is_last_step(&self, id: u32) -> bool {
        id == self.total_steps()
    }

    /// Effective timeout for a step: its own, else the workflow's.
    pub fn step_timeout(&self, step: &StepDefinition) -> Option<Duration> {
        step.timeout.or(self.timeout)
    }

    /// Handler-free view of every step, in order.
    pub fn step_summaries(&self) -> Vec<StepSummary> {
        self.steps
            .iter()
            .map(|step| StepSummary {
                id: step.id,
                label: step.label.clone(),
                description: step.description.clone(),
                skippable: step.skippable,
                continue_on_failure: step.continue_on_failure,
                timeout_ms: self.step_timeout(step).map(|t| t.as_millis() as u64),
            })
            .collect()
    }
}

/// Step metadata as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub id: u32,
    pub label: String,
    pub description: Option<String>,
    pub skippable: bool,
    pub continue_on_failure: bool,
    /// Effective timeout, including the workflow default.
    pub timeout_ms: Option<u64>,
}

impl fmt::Debug for SuccessCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessCallback::Message(_) => f.write_str("SuccessCallback::Message"),
            SuccessCallback::Payload(_) => f.write_str("SuccessCallback::Payload"),
        }
    }
}

impl fmt::Debug for FailureCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCallback::Message(_) => f.write_str("FailureCallback::Message"),
            FailureCallback::MessageAndError(_) => f.write_str("FailureCallback::MessageAndError"),
        }
    }
}

pub struct WorkflowDefinitionBuilder {
    topic: String,
    description: Option<String>,
    steps: Vec<StepDefinition>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    timeout: Option<Duration>,
    partitions: u32,
    replication: u16,
}

impl WorkflowDefinitionBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn on_success(mut self, callback: SuccessCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn replication(mut self, replication: u16) -> Self {
        self.replication = replication;
        self
    }

    pub fn build(mut self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.topic.trim().is_empty() {
            return Err(DefinitionError::EmptyTopic);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.topic));
        }

        self.steps.sort_by_key(|s| s.id);
        for pair in self.steps.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(DefinitionError::DuplicateStep {
                    topic: self.topic,
                    id: pair[0].id,
                });
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.id != expected {
                return Err(DefinitionError::NonContiguous {
                    topic: self.topic,
                    expected,
                    found: step.id,
                });
            }
        }

        Ok(WorkflowDefinition {
            topic: self.topic,
            description: self.description,
            steps: self.steps,
            on_success: self.on_success,
            on_failure: self.on_failure,
            timeout: self.timeout,
            partitions: self.partitions,
            replication: self.replication,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn echo() -> StepHandler {
        StepHandler::payload(|p| async move { Ok(p) })
    }

    fn ctx(payload: serde_json::Value) -> StepContext {
        StepContext {
            execution_id: "e".into(),
            correlation_id: "c".into(),
            topic: "orders".into(),
            step_id: 1,
            step_label: "validate".into(),
            attempt: 1,
            payload,
            metadata: HashMap::new(),
            security: None,
        }
    }

    #[test]
    fn test_build_sorts_steps() {
        let def = WorkflowDefinition::builder("orders")
            .step(StepDefinition::new(2, "charge", echo()))
            .step(StepDefinition::new(1, "validate", echo()))
            .build()
            .unwrap();
        assert_eq!(def.total_steps(), 2);
        assert_eq!(def.get_step(1).unwrap().label, "validate");
        assert_eq!(def.get_step(2).unwrap().label, "charge");
        assert!(def.get_step(0).is_none());
        assert!(def.get_step(3).is_none());
        assert!(def.is_last_step(2));
        assert!(!def.is_last_step(1));
    }

    #[test]
    fn test_build_rejects_invalid_definitions() {
        assert!(matches!(
            WorkflowDefinition::builder(" ").step(StepDefinition::new(1, "a", echo())).build(),
            Err(DefinitionError::EmptyTopic)
        ));
        assert!(matches!(
            WorkflowDefinition::builder("orders").build(),
            Err(DefinitionError::NoSteps(_))
        ));
        assert!(matches!(
            WorkflowDefinition::builder("orders")
                .step(StepDefinition::new(1, "a", echo()))
                .step(StepDefinition::new(1, "b", echo()))
                .build(),
            Err(DefinitionError::DuplicateStep { id: 1, .. })
        ));
        assert!(matches!(
            WorkflowDefinition::builder("orders")
                .step(StepDefinition::new(1, "a", echo()))
                .step(StepDefinition::new(3, "c", echo()))
                .build(),
            Err(DefinitionError::NonContiguous { expected: 2, found: 3, .. })
        ));
    }

    #[test]
    fn test_step_timeout_falls_back_to_workflow() {
        let def = WorkflowDefinition::builder("orders")
            .timeout(Duration::from_secs(10))
            .step(StepDefinition::new(1, "a", echo()))
            .step(StepDefinition::new(2, "b", echo()).timeout(Duration::from_secs(2)))
            .build()
            .unwrap();
        assert_eq!(def.step_timeout(def.get_step(1).unwrap()), Some(Duration::from_secs(10)));
        assert_eq!(def.step_timeout(def.get_step(2).unwrap()), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_step_summaries_report_flags() {
        let def = WorkflowDefinition::builder("orders")
            .timeout(Duration::from_secs(10))
            .step(StepDefinition::new(1, "validate", echo()).description("check input"))
            .step(StepDefinition::new(2, "notify", echo()).skippable(true).continue_on_failure(true))
            .build()
            .unwrap();

        let summaries = def.step_summaries();
        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].skippable);
        assert_eq!(summaries[0].description.as_deref(), Some("check input"));
        assert_eq!(summaries[0].timeout_ms, Some(10_000));
        assert!(summaries[1].skippable);
        assert!(summaries[1].continue_on_failure);

        let value = serde_json::to_value(&summaries[1]).unwrap();
        assert_eq!(value["skippable"], json!(true));
        assert_eq!(value["label"], json!("notify"));
    }

    #[tokio::test]
    async fn test_contextual_handler_sees_context() {
        let handler = StepHandler::contextual(|ctx: StepContext| async move {
            Ok(json!({"step": ctx.step_label, "attempt": ctx.attempt}))
        });
        let out = handler.invoke(ctx(json!({}))).await.unwrap();
        assert_eq!(out, json!({"step": "validate", "attempt": 1}));
    }

    #[derive(Deserialize, Serialize)]
    struct Order {
        quantity: u32,
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_and_encodes() {
        let handler = StepHandler::typed(|mut order: Order| async move {
            order.quantity *= 2;
            Ok(order)
        });
        let out = handler.invoke(ctx(json!({"quantity": 2}))).await.unwrap();
        assert_eq!(out, json!({"quantity": 4}));

        let err = handler.invoke(ctx(json!({"qty": "x"}))).await.unwrap_err();
        assert_eq!(err.kind(), kinds::INVALID_INPUT);
    }

    #[tokio::test]
    async fn test_callback_shapes() {
        let msg = WorkflowMessage::new("orders", 1).with_payload(json!({"ok": true}));
        let on_success = SuccessCallback::payload(|payload| async move {
            assert_eq!(payload, Some(json!({"ok": true})));
            Ok(())
        });
        on_success.invoke(&msg).await.unwrap();

        let on_failure = FailureCallback::with_error(|_msg, err| async move {
            Err(StepError::new("callback", err.message().to_string()))
        });
        let err = on_failure
            .invoke(&msg, &StepError::new("x", "boom"))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "boom");
    }
}
