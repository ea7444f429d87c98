use chrono::{DateTime, Utc};
use hopflow_types::error::RepositoryError;
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::status::WorkflowStatus;

/// Optional narrowing for [`ExecutionRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<WorkflowStatus>,
    pub topic: Option<String>,
    pub limit: Option<usize>,
}

/// Repository trait for persisted workflow executions.
///
/// Every write is a compare-and-swap on `WorkflowExecution::version`:
/// - `version == None` inserts and fails if the id already exists.
/// - `version == Some(v)` updates only if the stored version is still `v`.
///
/// A lost race is reported as `RepositoryError::OptimisticLock`; the stored
/// record is never blindly overwritten. Successful saves return the stored
/// copy carrying its new version.
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
pub trait ExecutionRepository: Send + Sync {
    fn find_by_id(
        &self,
        execution_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    fn save(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<WorkflowExecution, RepositoryError>> + Send;

    /// `RETRY_PENDING` executions whose `next_retry_at` is at or before `now`.
    fn find_pending_retries(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// `COMPLETED` executions that completed before `cutoff`.
    fn find_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// `FAILED` executions that completed before `cutoff`.
    fn find_failed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Delete the given executions, returning how many existed.
    fn delete_all(
        &self,
        execution_ids: &[String],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Executions ordered by creation time, newest first.
    fn list(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;
}
