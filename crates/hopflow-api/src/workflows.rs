//! Workflows registered by the `hopflow` binary.
//!
//! `orders` is a three-step order pipeline used by `hopflow start` and the
//! operator commands. Its payload knobs make every engine path reachable
//! from the command line:
//!
//! - a missing `sku` fails validation as `invalid_input` (dead-lettered),
//! - `fail_reserve_times = n` fails the reservation step on its first `n`
//!   attempts (retried with backoff).

use std::time::Duration;

use hopflow_core::workflow::definition::{
    DefinitionError, FailureCallback, StepContext, StepDefinition, StepHandler, SuccessCallback,
    WorkflowDefinition,
};
use hopflow_infra::runtime::EngineRuntimeBuilder;
use hopflow_types::error::StepError;
use serde_json::{Value, json};

pub const ORDERS_TOPIC: &str = "orders";

/// Register every bundled workflow.
pub fn register(builder: EngineRuntimeBuilder) -> Result<EngineRuntimeBuilder, DefinitionError> {
    Ok(builder.workflow(orders()?))
}

fn orders() -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowDefinition::builder(ORDERS_TOPIC)
        .description("Validate, reserve stock for, and ship an order")
        .step(
            StepDefinition::new(1, "validate", StepHandler::payload(validate))
                .description("Reject orders without a SKU"),
        )
        .step(
            StepDefinition::new(2, "reserve", StepHandler::contextual(reserve))
                .description("Reserve inventory"),
        )
        .step(
            StepDefinition::new(3, "ship", StepHandler::payload(ship))
                .description("Hand the order to the carrier")
                .timeout(Duration::from_secs(5)),
        )
        .on_success(SuccessCallback::message(|message| async move {
            tracing::info!(execution_id = %message.execution_id, "order shipped");
            Ok(())
        }))
        .on_failure(FailureCallback::with_error(|message, err| async move {
            tracing::warn!(
                execution_id = %message.execution_id,
                step = message.current_step,
                kind = err.kind(),
                "order dead-lettered"
            );
            Ok(())
        }))
        .build()
}

async fn validate(payload: Value) -> Result<Value, StepError> {
    match payload.get("sku").and_then(Value::as_str) {
        Some(sku) if !sku.trim().is_empty() => Ok(payload),
        _ => Err(StepError::invalid_input("order has no sku")),
    }
}

async fn reserve(ctx: StepContext) -> Result<Value, StepError> {
    let fail_times = ctx
        .payload
        .get("fail_reserve_times")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if u64::from(ctx.attempt) <= fail_times {
        return Err(StepError::new(
            "inventory_unavailable",
            format!("inventory service unavailable (attempt {})", ctx.attempt),
        ));
    }

    let mut payload = ctx.payload;
    if let Some(fields) = payload.as_object_mut() {
        let short_id: String = ctx.execution_id.chars().take(8).collect();
        fields.insert("reservation_id".to_string(), json!(format!("res-{short_id}")));
    }
    Ok(payload)
}

async fn ship(mut payload: Value) -> Result<Value, StepError> {
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("shipped".to_string(), json!(true));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx(attempt: u32, payload: Value) -> StepContext {
        StepContext {
            execution_id: "0190aaaa-bbbb-7ccc-8ddd-eeeeffff0000".to_string(),
            correlation_id: "corr".to_string(),
            topic: ORDERS_TOPIC.to_string(),
            step_id: 2,
            step_label: "reserve".to_string(),
            attempt,
            payload,
            metadata: HashMap::new(),
            security: None,
        }
    }

    #[test]
    fn test_orders_definition_shape() {
        let def = orders().unwrap();
        assert_eq!(def.total_steps(), 3);
        assert_eq!(def.get_step(3).unwrap().timeout, Some(Duration::from_secs(5)));
        assert!(def.on_success.is_some());
        assert!(def.on_failure.is_some());
    }

    #[tokio::test]
    async fn test_validate_requires_sku() {
        let err = validate(json!({"sku": "  "})).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(validate(json!({"sku": "A-1"})).await.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_fails_for_configured_attempts() {
        let payload = json!({"sku": "A-1", "fail_reserve_times": 1});
        let err = reserve(ctx(1, payload.clone())).await.unwrap_err();
        assert_eq!(err.kind(), "inventory_unavailable");

        let out = reserve(ctx(2, payload)).await.unwrap();
        assert_eq!(out["reservation_id"], json!("res-0190aaaa"));
    }

    #[tokio::test]
    async fn test_ship_marks_payload() {
        let out = ship(json!({"sku": "A-1"})).await.unwrap();
        assert_eq!(out["shipped"], json!(true));
    }
}
