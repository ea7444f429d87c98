//! In-memory execution and outbox store.
//!
//! Same compare-and-swap contract as the SQLite store. Executions and the
//! outbox share one lock so `save_with_outbox` is atomic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hopflow_core::repository::execution::{ExecutionFilter, ExecutionRepository};
use hopflow_core::repository::outbox::OutboxRepository;
use hopflow_types::error::RepositoryError;
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::outbox::{OutboxMessage, OutboxStats, OutboxStatus};
use hopflow_types::status::WorkflowStatus;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    executions: HashMap<String, WorkflowExecution>,
    outbox: Vec<OutboxMessage>,
}

impl State {
    fn compare_and_swap(
        &mut self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution, RepositoryError> {
        let actual = self
            .executions
            .get(&execution.execution_id)
            .and_then(|e| e.version);
        let exists = self.executions.contains_key(&execution.execution_id);

        let accepted = match execution.version {
            None => !exists,
            Some(expected) => actual == Some(expected),
        };
        if !accepted {
            return Err(RepositoryError::OptimisticLock {
                execution_id: execution.execution_id.clone(),
                expected: execution.version,
                actual,
            });
        }

        let mut stored = execution.clone();
        stored.version = Some(execution.version.map_or(1, |v| v + 1));
        self.executions
            .insert(stored.execution_id.clone(), stored.clone());
        Ok(stored)
    }

    fn matching(&self, pred: impl Fn(&WorkflowExecution) -> bool) -> Vec<WorkflowExecution> {
        self.executions.values().filter(|e| pred(e)).cloned().collect()
    }
}

/// Process-local store. Contents are lost on shutdown.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    state: RwLock<State>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.executions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn finished_before(
    state: &State,
    status: WorkflowStatus,
    cutoff: DateTime<Utc>,
) -> Vec<WorkflowExecution> {
    let mut found =
        state.matching(|e| e.status == status && e.completed_at.is_some_and(|at| at < cutoff));
    found.sort_by_key(|e| e.completed_at);
    found
}

impl ExecutionRepository for InMemoryExecutionStore {
    async fn find_by_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.state.read().await.executions.get(execution_id).cloned())
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<WorkflowExecution, RepositoryError> {
        self.state.write().await.compare_and_swap(execution)
    }

    async fn find_pending_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.state.read().await;
        let mut due = state.matching(|e| {
            e.status == WorkflowStatus::RetryPending && e.next_retry_at().is_some_and(|at| at <= now)
        });
        due.sort_by_key(|e| e.next_retry_at());
        Ok(due)
    }

    async fn find_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.state.read().await;
        Ok(finished_before(&state, WorkflowStatus::Completed, cutoff))
    }

    async fn find_failed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.state.read().await;
        Ok(finished_before(&state, WorkflowStatus::Failed, cutoff))
    }

    async fn delete_all(&self, execution_ids: &[String]) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let deleted = execution_ids
            .iter()
            .filter(|id| state.executions.remove(id.as_str()).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.state.read().await;
        let mut found = state.matching(|e| {
            filter.status.is_none_or(|s| e.status == s)
                && filter.topic.as_deref().is_none_or(|t| e.topic == t)
        });
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

impl OutboxRepository for InMemoryExecutionStore {
    async fn save_with_outbox(
        &self,
        execution: &WorkflowExecution,
        message: &OutboxMessage,
    ) -> Result<WorkflowExecution, RepositoryError> {
        let mut state = self.state.write().await;
        let stored = state.compare_and_swap(execution)?;
        state.outbox.push(message.clone());
        Ok(stored)
    }

    async fn enqueue(&self, message: &OutboxMessage) -> Result<(), RepositoryError> {
        self.state.write().await.outbox.push(message.clone());
        Ok(())
    }

    async fn find_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, RepositoryError> {
        let state = self.state.read().await;
        // Insertion order is creation order.
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.is_ready(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, message: &OutboxMessage) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let slot = state
            .outbox
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = message.clone();
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state.outbox.retain(|m| {
            !(m.status == OutboxStatus::Sent && m.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.outbox.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats, RepositoryError> {
        let state = self.state.read().await;
        let mut stats = OutboxStats::default();
        for m in &state.outbox {
            match m.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopflow_types::message::WorkflowMessage;
    use hopflow_types::outbox::OutboxMessageType;

    fn sample_execution() -> WorkflowExecution {
        WorkflowExecution::from_message(&WorkflowMessage::new("orders", 2))
    }

    #[tokio::test]
    async fn test_versions_and_conflicts() {
        let store = InMemoryExecutionStore::new();
        let exec = sample_execution();

        let v1 = store.save(&exec).await.unwrap();
        assert_eq!(v1.version, Some(1));
        assert!(matches!(
            store.save(&exec).await,
            Err(RepositoryError::OptimisticLock { expected: None, actual: Some(1), .. })
        ));

        let v2 = store.save(&v1).await.unwrap();
        assert_eq!(v2.version, Some(2));
        assert!(matches!(
            store.save(&v1).await,
            Err(RepositoryError::OptimisticLock { expected: Some(1), actual: Some(2), .. })
        ));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_outbox_rides_on_successful_save_only() {
        let store = InMemoryExecutionStore::new();
        let v1 = store.save(&sample_execution()).await.unwrap();
        let record = OutboxMessage::new(
            "orders",
            WorkflowMessage::new("orders", 2),
            OutboxMessageType::Resume,
            3,
        );

        store.save_with_outbox(&v1, &record).await.unwrap();
        assert!(store.save_with_outbox(&v1, &record).await.is_err());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(store.find_ready(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_respects_filter_and_limit() {
        let store = InMemoryExecutionStore::new();
        for _ in 0..3 {
            store.save(&sample_execution()).await.unwrap();
        }
        let mut failed = sample_execution();
        failed.finalize(WorkflowStatus::Failed, Utc::now());
        store.save(&failed).await.unwrap();

        let only_failed = store
            .list(&ExecutionFilter {
                status: Some(WorkflowStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_failed.len(), 1);

        let limited = store
            .list(&ExecutionFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
