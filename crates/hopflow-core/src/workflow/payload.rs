//! Payload deserialization keyed by the message's declared type tag.

use std::sync::Arc;

use dashmap::DashMap;
use hopflow_types::error::{StepError, kinds};
use hopflow_types::message::WorkflowMessage;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Resolve a message's payload into the value handed to the step handler.
pub trait PayloadDeserializer: Send + Sync {
    /// An unresolvable type tag is not an error: implementations fall back
    /// to the raw payload. An `Err` means the payload is unusable and fails
    /// the step.
    fn deserialize(&self, message: &WorkflowMessage) -> Result<serde_json::Value, StepError>;
}

/// Hands the raw payload through untouched (`null` when absent).
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPayloadDeserializer;

impl PayloadDeserializer for RawPayloadDeserializer {
    fn deserialize(&self, message: &WorkflowMessage) -> Result<serde_json::Value, StepError> {
        Ok(message.payload.clone().unwrap_or(serde_json::Value::Null))
    }
}

/// Default tag for a Rust payload type.
pub fn type_tag<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}

type Normalizer = dyn Fn(serde_json::Value) -> Result<serde_json::Value, serde_json::Error> + Send + Sync;

/// Deserializer that validates payloads against registered Rust types.
///
/// A registered tag round-trips the payload through its type, which
/// normalizes it (defaults applied, unknown fields per the type's serde
/// rules). Unregistered tags fall back to the raw payload with a warning.
#[derive(Default)]
pub struct TypedPayloadDeserializer {
    types: DashMap<String, Arc<Normalizer>>,
}

impl TypedPayloadDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its [`type_tag`].
    pub fn register<T>(&self) -> &Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.register_as::<T>(type_tag::<T>())
    }

    /// Register `T` under an explicit tag.
    pub fn register_as<T>(&self, tag: impl Into<String>) -> &Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        let normalize: Arc<Normalizer> = Arc::new(|value| {
            let typed: T = serde_json::from_value(value)?;
            serde_json::to_value(typed)
        });
        self.types.insert(tag.into(), normalize);
        self
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.types.contains_key(tag)
    }
}

impl PayloadDeserializer for TypedPayloadDeserializer {
    fn deserialize(&self, message: &WorkflowMessage) -> Result<serde_json::Value, StepError> {
        let Some(payload) = message.payload.clone() else {
            return Ok(serde_json::Value::Null);
        };
        let Some(tag) = message.payload_type.as_deref() else {
            return Ok(payload);
        };
        let Some(normalize) = self.types.get(tag).map(|n| Arc::clone(&n)) else {
            tracing::warn!(
                execution_id = %message.execution_id,
                payload_type = %tag,
                "unknown payload type, using raw payload"
            );
            return Ok(payload);
        };

        normalize(payload).map_err(|e| {
            StepError::new(
                kinds::PAYLOAD_DESERIALIZATION,
                format!("payload does not match type '{tag}': {e}"),
            )
        })
    }
}

impl std::fmt::Debug for TypedPayloadDeserializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<String> = self.types.iter().map(|t| t.key().clone()).collect();
        tags.sort();
        f.debug_struct("TypedPayloadDeserializer")
            .field("types", &tags)
            .finish()
    }
}
