//! Transactional outbox records.
//!
//! An outbox message is written in the same transaction as the execution
//! change that produced it and dispatched later by the outbox relay.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::WorkflowMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxMessageType {
    Resume,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message awaiting relay to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub destination: String,
    pub execution_id: String,
    pub message_type: OutboxMessageType,
    pub message: WorkflowMessage,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Relay skips the record until this instant. `None` means ready now.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        destination: impl Into<String>,
        message: WorkflowMessage,
        message_type: OutboxMessageType,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            destination: destination.into(),
            execution_id: message.execution_id.clone(),
            message_type,
            message,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_outbox_message_is_ready() {
        let msg = WorkflowMessage::new("orders", 2);
        let record = OutboxMessage::new("orders", msg.clone(), OutboxMessageType::Resume, 5);
        assert_eq!(record.execution_id, msg.execution_id);
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.is_ready(Utc::now()));
    }

    #[test]
    fn test_backed_off_record_not_ready() {
        let msg = WorkflowMessage::new("orders", 2);
        let mut record = OutboxMessage::new("orders", msg, OutboxMessageType::Retry, 5);
        let now = Utc::now();
        record.next_retry_at = Some(now + chrono::Duration::seconds(10));
        assert!(!record.is_ready(now));
        assert!(record.is_ready(now + chrono::Duration::seconds(10)));
        record.status = OutboxStatus::Sent;
        assert!(!record.is_ready(now + chrono::Duration::seconds(60)));
    }
}
