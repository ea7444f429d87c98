//! Periodic retry resubmission and retention cleanup.
//!
//! Both sweeps are skip-if-busy: a cycle that starts while the previous one
//! of the same kind is still running returns immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use hopflow_types::config::{RetentionConfig, SchedulerConfig};
use hopflow_types::error::RepositoryError;
use hopflow_types::execution::WorkflowExecution;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::MessageBroker;
use crate::repository::execution::ExecutionRepository;
use crate::workflow::factory::MessageFactory;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub resubmitted: usize,
    pub failed: usize,
    /// The previous sweep was still running.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub completed_deleted: u64,
    pub failed_deleted: u64,
    pub skipped: bool,
}

/// Clears the busy flag on every exit path.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct RetryScheduler<R, B> {
    repository: Arc<R>,
    broker: Arc<B>,
    retention: RetentionConfig,
    config: SchedulerConfig,
    retry_busy: AtomicBool,
    cleanup_busy: AtomicBool,
}

/// Join handles of the two background sweeps.
pub struct SchedulerHandles {
    pub retries: JoinHandle<()>,
    pub cleanup: JoinHandle<()>,
}

impl<R, B> RetryScheduler<R, B>
where
    R: ExecutionRepository + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(repository: Arc<R>, broker: Arc<B>, retention: RetentionConfig, config: SchedulerConfig) -> Self {
        Self {
            repository,
            broker,
            retention,
            config,
            retry_busy: AtomicBool::new(false),
            cleanup_busy: AtomicBool::new(false),
        }
    }

    pub async fn process_pending_retries(&self) -> Result<SweepReport, RepositoryError> {
        self.process_pending_retries_at(Utc::now()).await
    }

    /// Resubmit every `RETRY_PENDING` execution due at `now` to its base
    /// topic. A failing item is logged and does not stop the others.
    pub async fn process_pending_retries_at(&self, now: DateTime<Utc>) -> Result<SweepReport, RepositoryError> {
        let Some(_guard) = BusyGuard::acquire(&self.retry_busy) else {
            tracing::debug!("previous retry sweep still running, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        let due = self.repository.find_pending_retries(now).await?;
        if due.is_empty() {
            return Ok(SweepReport::default());
        }
        tracing::info!(count = due.len(), "processing pending retries");

        let results = join_all(due.iter().map(|execution| self.resubmit(execution))).await;
        let resubmitted = results.iter().filter(|ok| **ok).count();
        Ok(SweepReport {
            due: due.len(),
            resubmitted,
            failed: due.len() - resubmitted,
            skipped: false,
        })
    }

    async fn resubmit(&self, execution: &WorkflowExecution) -> bool {
        let message = MessageFactory::create_retry_resubmission(execution);
        let attempt = execution.retry_info.as_ref().map_or(1, |r| r.attempt);
        match self.broker.send_sync(&execution.topic, &message).await {
            Ok(()) => {
                tracing::info!(
                    execution_id = %execution.execution_id,
                    topic = %execution.topic,
                    step = execution.current_step,
                    attempt,
                    "resubmitted retry"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    execution_id = %execution.execution_id,
                    topic = %execution.topic,
                    attempt,
                    "failed to resubmit retry: {e}"
                );
                false
            }
        }
    }

    pub async fn cleanup_old_executions(&self) -> Result<CleanupReport, RepositoryError> {
        self.cleanup_old_executions_at(Utc::now()).await
    }

    /// Delete completed and failed executions past their retention windows.
    pub async fn cleanup_old_executions_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, RepositoryError> {
        let Some(_guard) = BusyGuard::acquire(&self.cleanup_busy) else {
            tracing::debug!("previous cleanup still running, skipping");
            return Ok(CleanupReport {
                skipped: true,
                ..CleanupReport::default()
            });
        };

        let completed = self
            .repository
            .find_completed_before(cutoff(now, self.retention.completed_ttl()))
            .await?;
        let completed_deleted = self.delete(&completed).await?;
        if completed_deleted > 0 {
            tracing::info!(count = completed_deleted, "deleted old completed executions");
        }

        let failed = self
            .repository
            .find_failed_before(cutoff(now, self.retention.failed_ttl()))
            .await?;
        let failed_deleted = self.delete(&failed).await?;
        if failed_deleted > 0 {
            tracing::info!(count = failed_deleted, "deleted old failed executions");
        }

        Ok(CleanupReport {
            completed_deleted,
            failed_deleted,
            skipped: false,
        })
    }

    async fn delete(&self, executions: &[WorkflowExecution]) -> Result<u64, RepositoryError> {
        if executions.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = executions.iter().map(|e| e.execution_id.clone()).collect();
        self.repository.delete_all(&ids).await
    }

    /// Run both sweeps on their configured intervals until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> SchedulerHandles {
        let retries = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.check_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = this.process_pending_retries().await {
                                tracing::error!("retry sweep failed: {e}");
                            }
                        }
                    }
                }
                tracing::debug!("retry sweep stopped");
            })
        };

        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cleanup_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.cleanup_old_executions().await {
                            tracing::error!("retention cleanup failed: {e}");
                        }
                    }
                }
            }
            tracing::debug!("retention cleanup stopped");
        });

        SchedulerHandles { retries, cleanup }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, RecordingBroker};
    use hopflow_types::message::{RetryInfo, WorkflowMessage};
    use hopflow_types::status::WorkflowStatus;
    use serde_json::json;

    fn scheduler() -> (
        Arc<RetryScheduler<MemoryStore, RecordingBroker>>,
        Arc<MemoryStore>,
        Arc<RecordingBroker>,
    ) {
        let store = Arc::new(MemoryStore::default());
        let broker = Arc::new(RecordingBroker::default());
        let scheduler = RetryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            RetentionConfig::default(),
            SchedulerConfig::default(),
        );
        (Arc::new(scheduler), store, broker)
    }

    fn retry_pending(store: &MemoryStore, topic: &str, due: DateTime<Utc>) -> WorkflowExecution {
        let msg = WorkflowMessage::new(topic, 3).with_payload(json!({"n": 1}));
        let mut exec = WorkflowExecution::from_message(&msg);
        exec.status = WorkflowStatus::RetryPending;
        exec.current_step = 2;
        exec.current_step_label = Some("charge".to_string());
        exec.retry_info = Some(RetryInfo::first(3).next_attempt(due, Some("boom".to_string())));
        store.put(exec)
    }

    fn finished(store: &MemoryStore, status: WorkflowStatus, at: DateTime<Utc>) -> WorkflowExecution {
        let mut exec = WorkflowExecution::from_message(&WorkflowMessage::new("orders", 1));
        exec.finalize(status, at);
        store.put(exec)
    }

    #[tokio::test]
    async fn test_due_retries_are_resubmitted() {
        let (scheduler, store, broker) = scheduler();
        let now = Utc::now();
        let due = retry_pending(&store, "orders", now - chrono::Duration::seconds(5));
        retry_pending(&store, "orders", now + chrono::Duration::minutes(5));

        let report = scheduler.process_pending_retries_at(now).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.resubmitted, 1);

        let sent = broker.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "orders");
        let msg = &sent[0].1;
        assert_eq!(msg.execution_id, due.execution_id);
        assert_eq!(msg.status, WorkflowStatus::InProgress);
        assert_eq!(msg.current_step, 2);
        assert_eq!(msg.retry_info.as_ref().unwrap().attempt, 2);
        assert_eq!(msg.payload, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_failed_item_does_not_abort_batch() {
        let (scheduler, store, broker) = scheduler();
        let now = Utc::now();
        retry_pending(&store, "orders", now - chrono::Duration::seconds(1));
        retry_pending(&store, "billing", now - chrono::Duration::seconds(1));
        broker.fail_sends(true);

        let report = scheduler.process_pending_retries_at(now).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.failed, 2);
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let (scheduler, _store, _broker) = scheduler();
        scheduler.retry_busy.store(true, Ordering::SeqCst);
        let report = scheduler.process_pending_retries().await.unwrap();
        assert!(report.skipped);

        scheduler.retry_busy.store(false, Ordering::SeqCst);
        let report = scheduler.process_pending_retries().await.unwrap();
        assert!(!report.skipped);
        assert!(!scheduler.retry_busy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_uses_separate_windows() {
        let (scheduler, store, _broker) = scheduler();
        let now = Utc::now();
        let old_completed = finished(&store, WorkflowStatus::Completed, now - chrono::Duration::days(8));
        let recent_completed = finished(&store, WorkflowStatus::Completed, now - chrono::Duration::days(1));
        let old_failed = finished(&store, WorkflowStatus::Failed, now - chrono::Duration::days(31));
        let recent_failed = finished(&store, WorkflowStatus::Failed, now - chrono::Duration::days(8));

        let report = scheduler.cleanup_old_executions_at(now).await.unwrap();
        assert_eq!(report.completed_deleted, 1);
        assert_eq!(report.failed_deleted, 1);

        assert!(store.get(&old_completed.execution_id).is_none());
        assert!(store.get(&old_failed.execution_id).is_none());
        assert!(store.get(&recent_completed.execution_id).is_some());
        assert!(store.get(&recent_failed.execution_id).is_some());
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_to_delete() {
        let (scheduler, _store, _broker) = scheduler();
        let report = scheduler.cleanup_old_executions().await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeps_stop_on_cancel() {
        let (scheduler, store, broker) = scheduler();
        retry_pending(&store, "orders", Utc::now() - chrono::Duration::seconds(1));

        let cancel = CancellationToken::new();
        let handles = Arc::clone(&scheduler).spawn(cancel.clone());
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.sent().len(), 1);

        cancel.cancel();
        handles.retries.await.unwrap();
        handles.cleanup.await.unwrap();
    }
}
