//! In-crate test doubles for the broker and repository ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use hopflow_types::error::{BrokerError, RepositoryError};
use hopflow_types::execution::WorkflowExecution;
use hopflow_types::message::WorkflowMessage;
use hopflow_types::outbox::{OutboxMessage, OutboxStats, OutboxStatus};
use hopflow_types::status::WorkflowStatus;

use crate::broker::{DeliveryReceipt, MessageBroker};
use crate::repository::execution::{ExecutionFilter, ExecutionRepository};
use crate::repository::outbox::OutboxRepository;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker that records every accepted message.
#[derive(Default)]
pub struct RecordingBroker {
    sent: Mutex<Vec<(String, WorkflowMessage)>>,
    failing: AtomicBool,
}

impl RecordingBroker {
    pub fn sent(&self) -> Vec<(String, WorkflowMessage)> {
        lock(&self.sent).clone()
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("recording broker offline".to_string()));
        }
        lock(&self.sent).push((destination.to_string(), message.clone()));
        Ok(())
    }
}

impl MessageBroker for RecordingBroker {
    fn broker_type(&self) -> &str {
        "recording"
    }

    async fn send(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        self.record(destination, message)
    }

    async fn send_sync(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        self.record(destination, message)
    }

    fn send_async(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt {
        DeliveryReceipt::ready(self.record(destination, &message))
    }

    fn is_available(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}

/// Execution and outbox store with version compare-and-swap.
#[derive(Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<String, WorkflowExecution>>,
    outbox: Mutex<Vec<OutboxMessage>>,
    saves: AtomicUsize,
    /// Number of upcoming saves to reject as if another writer got there first.
    conflicts: AtomicUsize,
}

impl MemoryStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn inject_conflicts(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, execution_id: &str) -> Option<WorkflowExecution> {
        lock(&self.executions).get(execution_id).cloned()
    }

    pub fn outbox(&self) -> Vec<OutboxMessage> {
        lock(&self.outbox).clone()
    }

    /// Insert or overwrite without any version check.
    pub fn put(&self, mut execution: WorkflowExecution) -> WorkflowExecution {
        let mut map = lock(&self.executions);
        let version = map
            .get(&execution.execution_id)
            .and_then(|e| e.version)
            .map_or(1, |v| v + 1);
        execution.version = Some(version);
        map.insert(execution.execution_id.clone(), execution.clone());
        execution
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn cas(&self, execution: &WorkflowExecution) -> Result<WorkflowExecution, RepositoryError> {
        let mut map = lock(&self.executions);
        let actual = map.get(&execution.execution_id).and_then(|e| e.version);
        if self.take_conflict() {
            // Simulate a concurrent writer bumping the stored version.
            if let Some(stored) = map.get_mut(&execution.execution_id) {
                stored.version = stored.version.map(|v| v + 1);
            }
            return Err(RepositoryError::OptimisticLock {
                execution_id: execution.execution_id.clone(),
                expected: execution.version,
                actual: actual.map(|v| v + 1),
            });
        }
        let exists = map.contains_key(&execution.execution_id);
        let ok = match execution.version {
            None => !exists,
            Some(v) => actual == Some(v),
        };
        if !ok {
            return Err(RepositoryError::OptimisticLock {
                execution_id: execution.execution_id.clone(),
                expected: execution.version,
                actual,
            });
        }
        let mut stored = execution.clone();
        stored.version = Some(execution.version.map_or(1, |v| v + 1));
        map.insert(stored.execution_id.clone(), stored.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn filter_by(&self, pred: impl Fn(&WorkflowExecution) -> bool) -> Vec<WorkflowExecution> {
        lock(&self.executions).values().filter(|e| pred(e)).cloned().collect()
    }
}

impl ExecutionRepository for MemoryStore {
    async fn find_by_id(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.get(execution_id))
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<WorkflowExecution, RepositoryError> {
        self.cas(execution)
    }

    async fn find_pending_retries(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self.filter_by(|e| {
            e.status == WorkflowStatus::RetryPending && e.next_retry_at().is_some_and(|at| at <= now)
        }))
    }

    async fn find_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self.filter_by(|e| {
            e.status == WorkflowStatus::Completed && e.completed_at.is_some_and(|at| at < cutoff)
        }))
    }

    async fn find_failed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self.filter_by(|e| {
            e.status == WorkflowStatus::Failed && e.completed_at.is_some_and(|at| at < cutoff)
        }))
    }

    async fn delete_all(&self, execution_ids: &[String]) -> Result<u64, RepositoryError> {
        let mut map = lock(&self.executions);
        Ok(execution_ids.iter().filter(|id| map.remove(*id).is_some()).count() as u64)
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut all = self.filter_by(|e| {
            filter.status.is_none_or(|s| e.status == s)
                && filter.topic.as_deref().is_none_or(|t| e.topic == t)
        });
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            all.truncate(limit);
        }
        Ok(all)
    }
}

impl OutboxRepository for MemoryStore {
    async fn save_with_outbox(
        &self,
        execution: &WorkflowExecution,
        message: &OutboxMessage,
    ) -> Result<WorkflowExecution, RepositoryError> {
        let stored = self.cas(execution)?;
        lock(&self.outbox).push(message.clone());
        Ok(stored)
    }

    async fn enqueue(&self, message: &OutboxMessage) -> Result<(), RepositoryError> {
        lock(&self.outbox).push(message.clone());
        Ok(())
    }

    async fn find_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxMessage>, RepositoryError> {
        let mut ready: Vec<_> = lock(&self.outbox)
            .iter()
            .filter(|m| m.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|m| m.created_at);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn update(&self, message: &OutboxMessage) -> Result<(), RepositoryError> {
        let mut outbox = lock(&self.outbox);
        let slot = outbox
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = message.clone();
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut outbox = lock(&self.outbox);
        let before = outbox.len();
        outbox.retain(|m| !(m.status == OutboxStatus::Sent && m.processed_at.is_some_and(|at| at < cutoff)));
        Ok((before - outbox.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats, RepositoryError> {
        let outbox = lock(&self.outbox);
        let mut stats = OutboxStats::default();
        for m in outbox.iter() {
            match m.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
