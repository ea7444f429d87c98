//! Relay for the transactional outbox.
//!
//! Records written by `save_with_outbox` are picked up here and sent with
//! `send_sync`. A failed send backs the record off exponentially until it
//! runs out of attempts and is parked as `FAILED`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hopflow_types::config::OutboxConfig;
use hopflow_types::error::RepositoryError;
use hopflow_types::outbox::{OutboxStats, OutboxStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::MessageBroker;
use crate::repository::outbox::OutboxRepository;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct OutboxRelay<R, B> {
    repository: Arc<R>,
    broker: Arc<B>,
    config: OutboxConfig,
}

impl<R, B> OutboxRelay<R, B>
where
    R: OutboxRepository + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(repository: Arc<R>, broker: Arc<B>, config: OutboxConfig) -> Self {
        Self {
            repository,
            broker,
            config,
        }
    }

    /// `base_delay * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.config.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    pub async fn process_outbox(&self) -> Result<RelayReport, RepositoryError> {
        self.process_outbox_at(Utc::now()).await
    }

    /// Send one batch of ready records.
    pub async fn process_outbox_at(&self, now: DateTime<Utc>) -> Result<RelayReport, RepositoryError> {
        let ready = self.repository.find_ready(now, self.config.batch_size).await?;
        let mut report = RelayReport::default();

        for mut record in ready {
            record.attempts = record.attempts.saturating_add(1);
            match self.broker.send_sync(&record.destination, &record.message).await {
                Ok(()) => {
                    record.status = OutboxStatus::Sent;
                    record.processed_at = Some(now);
                    record.last_error = None;
                    report.sent += 1;
                    tracing::debug!(
                        outbox_id = %record.id,
                        execution_id = %record.execution_id,
                        destination = %record.destination,
                        "relayed outbox message"
                    );
                }
                Err(e) => {
                    record.last_error = Some(e.to_string());
                    if record.attempts >= record.max_attempts {
                        record.status = OutboxStatus::Failed;
                        record.processed_at = Some(now);
                        report.failed += 1;
                        tracing::error!(
                            outbox_id = %record.id,
                            execution_id = %record.execution_id,
                            attempts = record.attempts,
                            "outbox message failed permanently: {e}"
                        );
                    } else {
                        let delay = self.backoff(record.attempts);
                        record.next_retry_at = chrono::Duration::from_std(delay)
                            .ok()
                            .and_then(|d| now.checked_add_signed(d));
                        report.retried += 1;
                        tracing::warn!(
                            outbox_id = %record.id,
                            execution_id = %record.execution_id,
                            attempts = record.attempts,
                            delay_ms = delay.as_millis() as u64,
                            "outbox send failed, backing off: {e}"
                        );
                    }
                }
            }
            // A bookkeeping failure leaves the record PENDING for the next poll.
            if let Err(e) = self.repository.update(&record).await {
                tracing::error!(outbox_id = %record.id, "failed to update outbox record: {e}");
            }
        }
        Ok(report)
    }

    /// Remove `SENT` records older than the retention window.
    pub async fn cleanup_sent(&self) -> Result<u64, RepositoryError> {
        let cutoff = chrono::Duration::from_std(self.config.sent_retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.repository.delete_sent_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(count = deleted, "deleted relayed outbox messages");
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<OutboxStats, RepositoryError> {
        self.repository.stats().await
    }

    /// Poll the outbox until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.process_outbox().await {
                            tracing::error!("outbox relay failed: {e}");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, RecordingBroker};
    use hopflow_types::message::WorkflowMessage;
    use hopflow_types::outbox::{OutboxMessage, OutboxMessageType};

    fn relay(config: OutboxConfig) -> (OutboxRelay<MemoryStore, RecordingBroker>, Arc<MemoryStore>, Arc<RecordingBroker>) {
        let store = Arc::new(MemoryStore::default());
        let broker = Arc::new(RecordingBroker::default());
        (
            OutboxRelay::new(Arc::clone(&store), Arc::clone(&broker), config),
            store,
            broker,
        )
    }

    async fn enqueue(store: &MemoryStore, max_attempts: u32) -> OutboxMessage {
        let record = OutboxMessage::new(
            "orders",
            WorkflowMessage::new("orders", 2),
            OutboxMessageType::Resume,
            max_attempts,
        );
        store.enqueue(&record).await.unwrap();
        record
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let (relay, _, _) = relay(OutboxConfig {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            ..OutboxConfig::default()
        });
        assert_eq!(relay.backoff(1), Duration::from_millis(1000));
        assert_eq!(relay.backoff(2), Duration::from_millis(2000));
        assert_eq!(relay.backoff(3), Duration::from_millis(4000));
        assert_eq!(relay.backoff(4), Duration::from_millis(5000));
        assert_eq!(relay.backoff(200), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_ready_records_are_sent() {
        let (relay, store, broker) = relay(OutboxConfig::default());
        let record = enqueue(&store, 5).await;

        let report = relay.process_outbox().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(broker.sent()[0].0, "orders");

        let stored = &store.outbox()[0];
        assert_eq!(stored.id, record.id);
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.attempts, 1);
        assert!(stored.processed_at.is_some());

        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_failed_send_backs_off_then_fails() {
        let (relay, store, broker) = relay(OutboxConfig {
            base_delay_ms: 1000,
            ..OutboxConfig::default()
        });
        enqueue(&store, 2).await;
        broker.fail_sends(true);

        let now = Utc::now();
        let report = relay.process_outbox_at(now).await.unwrap();
        assert_eq!(report.retried, 1);
        let stored = store.outbox()[0].clone();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.next_retry_at, Some(now + chrono::Duration::seconds(1)));
        assert!(stored.last_error.is_some());

        // Not ready until the backoff elapses.
        let report = relay.process_outbox_at(now).await.unwrap();
        assert_eq!(report, RelayReport::default());

        let later = now + chrono::Duration::seconds(2);
        let report = relay.process_outbox_at(later).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = store.outbox()[0].clone();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(relay.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_sent_records() {
        let (relay, store, _broker) = relay(OutboxConfig::default());
        let mut old = enqueue(&store, 5).await;
        old.status = OutboxStatus::Sent;
        old.processed_at = Some(Utc::now() - chrono::Duration::days(2));
        store.update(&old).await.unwrap();
        enqueue(&store, 5).await;

        assert_eq!(relay.cleanup_sent().await.unwrap(), 1);
        assert_eq!(store.outbox().len(), 1);
    }
}
