//! Builders for the messages emitted outside the happy path.
//!
//! Stateless: every function derives a new message from an existing message
//! or persisted execution. The happy-path transitions (`next_step`,
//! `complete`) live on `WorkflowMessage` itself.

use chrono::Utc;
use hopflow_types::error::StepError;
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::message::{ErrorInfo, RetryInfo, WorkflowMessage};
use hopflow_types::status::WorkflowStatus;

use super::definition::StepDefinition;

pub struct MessageFactory;

impl MessageFactory {
    /// `RETRY_PENDING` copy of `message` carrying the advanced retry info.
    ///
    /// Payload, metadata, and security context are preserved.
    pub fn create_retry_message(message: &WorkflowMessage, retry_info: RetryInfo) -> WorkflowMessage {
        WorkflowMessage {
            status: WorkflowStatus::RetryPending,
            retry_info: Some(retry_info),
            error_info: None,
            updated_at: Utc::now(),
            ..message.clone()
        }
    }

    /// Resubmission of a persisted `RETRY_PENDING` execution at its current
    /// step. The retry info travels along so the attempt count keeps rising.
    pub fn create_retry_resubmission(execution: &WorkflowExecution) -> WorkflowMessage {
        let mut message = Self::from_execution(execution, execution.current_step);
        message.current_step_label = execution.current_step_label.clone();
        message.retry_info = execution.retry_info.clone();
        message
    }

    /// Operator resume at `from_step` with a fresh retry budget.
    pub fn create_resume_message(execution: &WorkflowExecution, from_step: u32) -> WorkflowMessage {
        let mut message = Self::from_execution(execution, from_step);
        if from_step == execution.current_step {
            message.current_step_label = execution.current_step_label.clone();
        }
        message
    }

    /// `FAILED` copy of `message` for the dead-letter topic.
    pub fn create_dlq_message(message: &WorkflowMessage, error_info: ErrorInfo) -> WorkflowMessage {
        WorkflowMessage {
            status: WorkflowStatus::Failed,
            error_info: Some(error_info),
            updated_at: Utc::now(),
            ..message.clone()
        }
    }

    pub fn create_error_info(err: &StepError, step: &StepDefinition) -> ErrorInfo {
        ErrorInfo::from_step_error(err, step.id, &step.label)
    }

    fn from_execution(execution: &WorkflowExecution, step: u32) -> WorkflowMessage {
        WorkflowMessage {
            execution_id: execution.execution_id.clone(),
            correlation_id: execution.correlation_id.clone(),
            topic: execution.topic.clone(),
            service_name: execution.service_name.clone(),
            current_step: step,
            total_steps: execution.total_steps,
            current_step_label: None,
            status: WorkflowStatus::InProgress,
            payload: execution.payload.clone(),
            payload_type: execution.payload_type.clone(),
            security_context: execution.security_context.clone(),
            metadata: execution.metadata.clone(),
            retry_info: None,
            error_info: None,
            created_at: execution.created_at,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::StepHandler;
    use hopflow_types::message::STEP_EXECUTION_FAILED;
    use serde_json::json;

    fn message() -> WorkflowMessage {
        let mut msg = WorkflowMessage::new("orders", 3)
            .with_payload(json!({"id": 1}))
            .with_security_context(Some("token-abc".to_string()));
        msg.metadata.insert("tenant".to_string(), json!("acme"));
        msg.current_step = 2;
        msg
    }

    fn failed_execution() -> WorkflowExecution {
        let mut exec = WorkflowExecution::from_message(&message());
        exec.status = WorkflowStatus::RetryPending;
        exec.current_step_label = Some("charge".to_string());
        exec.retry_info = Some(RetryInfo::first(3).next_attempt(Utc::now(), None));
        exec
    }

    #[test]
    fn test_retry_message_preserves_context() {
        let msg = message();
        let info = RetryInfo::first(3).next_attempt(Utc::now(), Some("boom".into()));
        let retry = MessageFactory::create_retry_message(&msg, info.clone());
        assert_eq!(retry.status, WorkflowStatus::RetryPending);
        assert_eq!(retry.retry_info, Some(info));
        assert_eq!(retry.current_step, 2);
        assert_eq!(retry.payload, msg.payload);
        assert_eq!(retry.security_context.as_deref(), Some("token-abc"));
        assert_eq!(retry.metadata.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn test_retry_resubmission_keeps_retry_info() {
        let exec = failed_execution();
        let msg = MessageFactory::create_retry_resubmission(&exec);
        assert_eq!(msg.status, WorkflowStatus::InProgress);
        assert_eq!(msg.current_step, 2);
        assert_eq!(msg.current_step_label.as_deref(), Some("charge"));
        assert_eq!(msg.retry_info.as_ref().map(|r| r.attempt), Some(2));
        assert_eq!(msg.execution_id, exec.execution_id);
    }

    #[test]
    fn test_resume_message_drops_retry_info() {
        let exec = failed_execution();
        let msg = MessageFactory::create_resume_message(&exec, 1);
        assert_eq!(msg.status, WorkflowStatus::InProgress);
        assert_eq!(msg.current_step, 1);
        assert!(msg.retry_info.is_none());
        assert!(msg.current_step_label.is_none());
        assert_eq!(msg.payload, exec.payload);
    }

    #[test]
    fn test_dlq_message_and_error_info() {
        let step = StepDefinition::new(2, "charge", StepHandler::payload(|p| async move { Ok(p) }));
        let err = StepError::new("payment_declined", "card declined");
        let info = MessageFactory::create_error_info(&err, &step);
        assert_eq!(info.code, STEP_EXECUTION_FAILED);
        assert_eq!(info.step_label.as_deref(), Some("charge"));

        let dlq = MessageFactory::create_dlq_message(&message(), info);
        assert_eq!(dlq.status, WorkflowStatus::Failed);
        assert_eq!(dlq.error_info.unwrap().exception_type, "payment_declined");
    }
}
