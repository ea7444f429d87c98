use chrono::{DateTime, Utc};
use hopflow_types::error::RepositoryError;
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::outbox::{OutboxMessage, OutboxStats};

/// Repository trait for the transactional outbox.
///
/// Implemented by the same store as [`super::execution::ExecutionRepository`]
/// so an execution change and its outgoing message commit together.
pub trait OutboxRepository: Send + Sync {
    /// Save the execution (same compare-and-swap rules as
    /// `ExecutionRepository::save`) and enqueue `message` atomically. On a
    /// version conflict nothing is written.
    fn save_with_outbox(
        &self,
        execution: &WorkflowExecution,
        message: &OutboxMessage,
    ) -> impl std::future::Future<Output = Result<WorkflowExecution, RepositoryError>> + Send;

    fn enqueue(
        &self,
        message: &OutboxMessage,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// `PENDING` records due at `now`, oldest first.
    fn find_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send;

    /// Overwrite a record's delivery state (status, attempts, timestamps).
    fn update(
        &self,
        message: &OutboxMessage,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove `SENT` records processed before `cutoff`.
    fn delete_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn stats(&self) -> impl std::future::Future<Output = Result<OutboxStats, RepositoryError>> + Send;
}
