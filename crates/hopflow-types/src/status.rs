use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by messages, executions, and step history entries.
///
/// `Passed` marks a step that was superseded once the execution advanced
/// past it. `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    RetryPending,
    Paused,
    Passed,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 8] = [
        WorkflowStatus::Pending,
        WorkflowStatus::InProgress,
        WorkflowStatus::RetryPending,
        WorkflowStatus::Paused,
        WorkflowStatus::Passed,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ];

    /// Wire/storage representation (`RETRY_PENDING`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::InProgress => "IN_PROGRESS",
            WorkflowStatus::RetryPending => "RETRY_PENDING",
            WorkflowStatus::Paused => "PAUSED",
            WorkflowStatus::Passed => "PASSED",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Statuses an operator may resume or patch the payload of.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Failed | WorkflowStatus::Paused | WorkflowStatus::RetryPending
        )
    }

    /// Statuses the consumer refuses to execute further.
    pub fn halts_processing(&self) -> bool {
        matches!(self, WorkflowStatus::Cancelled | WorkflowStatus::Completed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('-', "_");
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| format!("unknown workflow status: '{s}'"))
    }
}
