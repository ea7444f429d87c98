//! Entry point for launching new executions.

use std::collections::HashMap;
use std::sync::Arc;

use hopflow_types::message::WorkflowMessage;
use serde::Serialize;

use crate::broker::MessageBroker;

use super::executor::{EngineError, dispatch};
use super::payload::type_tag;
use super::registry::WorkflowRegistry;
use super::security::{NoopSecurityPropagator, SecurityContextPropagator};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no workflow registered for topic '{0}'")]
    UnknownTopic(String),
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Dispatch(#[from] EngineError),
}

pub struct WorkflowStarter<B: MessageBroker> {
    registry: Arc<WorkflowRegistry>,
    broker: Arc<B>,
    security: Arc<dyn SecurityContextPropagator>,
    service_name: Option<String>,
}

impl<B: MessageBroker> WorkflowStarter<B> {
    pub fn new(registry: Arc<WorkflowRegistry>, broker: Arc<B>) -> Self {
        Self {
            registry,
            broker,
            security: Arc::new(NoopSecurityPropagator),
            service_name: None,
        }
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityContextPropagator>) -> Self {
        self.security = security;
        self
    }

    pub fn with_service_name(mut self, service_name: Option<String>) -> Self {
        self.service_name = service_name;
        self
    }

    /// Emit the initial `PENDING` message for `topic` and return it.
    pub async fn start(
        &self,
        topic: &str,
        payload: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowMessage, StartError> {
        self.launch(topic, payload, None, metadata).await
    }

    /// Like [`start`](Self::start), tagging the payload with `T`'s type so a
    /// typed deserializer can normalize it on each hop.
    pub async fn start_typed<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowMessage, StartError> {
        let value = serde_json::to_value(payload)?;
        self.launch(topic, value, Some(type_tag::<T>()), metadata).await
    }

    async fn launch(
        &self,
        topic: &str,
        payload: serde_json::Value,
        payload_type: Option<&str>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowMessage, StartError> {
        let definition = self
            .registry
            .get(topic)
            .ok_or_else(|| StartError::UnknownTopic(topic.to_string()))?;

        let mut message = WorkflowMessage::new(topic, definition.total_steps())
            .with_payload(payload)
            .with_metadata(metadata)
            .with_security_context(self.security.capture());
        if let Some(first) = definition.get_step(1) {
            message = message.with_step_label(first.label.clone());
        }
        if let Some(name) = &self.service_name {
            message = message.with_service_name(name.clone());
        }
        if let Some(tag) = payload_type {
            message = message.with_payload_type(tag);
        }

        dispatch(&*self.broker, topic, &message).await?;
        tracing::info!(
            execution_id = %message.execution_id,
            %topic,
            total_steps = message.total_steps,
            "started workflow"
        );
        Ok(message)
    }
}
