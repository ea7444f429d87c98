//! Operator-facing services: resume/cancel, payload correction, the retry
//! and retention sweeps, and the outbox relay.

pub mod command;
pub mod outbox;
pub mod path;
pub mod payload;
pub mod scheduler;

use hopflow_types::error::{BrokerError, RepositoryError};
use hopflow_types::status::WorkflowStatus;
use thiserror::Error;

pub use command::CommandService;
pub use outbox::OutboxRelay;
pub use path::{NestedPathResolver, PathError, PathResolver};
pub use payload::PayloadService;
pub use scheduler::RetryScheduler;

/// Errors surfaced to operator commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("execution '{0}' not found")]
    NotFound(String),

    #[error("cannot {operation} execution '{execution_id}': {reason}")]
    InvalidState {
        execution_id: String,
        operation: &'static str,
        reason: String,
    },

    /// Another writer changed the execution since it was read. Reload and
    /// retry; nothing was written.
    #[error("execution '{0}' was modified concurrently")]
    ConcurrentModification(String),

    /// Attempt bookkeeping was persisted but the resume message was not sent.
    #[error("resume of execution '{execution_id}' (attempt {attempt}) via {broker_type} failed: {source}")]
    ResumeFailed {
        execution_id: String,
        attempt: u32,
        broker_type: String,
        #[source]
        source: BrokerError,
    },

    #[error("invalid field path: {0}")]
    Path(#[from] path::PathError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl CommandError {
    fn invalid_status(execution_id: &str, operation: &'static str, status: WorkflowStatus) -> Self {
        CommandError::InvalidState {
            execution_id: execution_id.to_string(),
            operation,
            reason: format!("status is {status}"),
        }
    }

    /// Map a write failure, turning version conflicts into
    /// `ConcurrentModification`.
    fn from_save(execution_id: &str, err: RepositoryError) -> Self {
        match err {
            RepositoryError::OptimisticLock { .. } => {
                tracing::warn!(%execution_id, "concurrent modification detected");
                CommandError::ConcurrentModification(execution_id.to_string())
            }
            other => CommandError::Repository(other),
        }
    }
}

impl From<RepositoryError> for CommandError {
    fn from(err: RepositoryError) -> Self {
        CommandError::Repository(err)
    }
}

/// Statuses in which an operator may resume or edit the payload.
pub fn is_editable(status: WorkflowStatus) -> bool {
    status.is_resumable()
}
