//! Partitioned in-process broker transport.
//!
//! Messages are routed to one of N bounded `mpsc` partitions by hashing
//! their routing key, and each partition is drained by a single worker task
//! that hands messages to the subscribed [`DeliveryHandler`] one at a time.
//! Messages sharing a routing key therefore arrive in send order; nothing is
//! promised across keys.
//!
//! Messages sent before [`InMemoryBroker::start`] stay buffered in their
//! partition until the workers come up.
//!
//! `send` fails immediately on a full partition. `send_sync` and
//! `send_async` wait for room, but only up to the send timeout: a partition
//! worker emitting into its own full queue would otherwise wait forever.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use hopflow_core::broker::{DeliveryHandler, DeliveryReceipt, MessageBroker};
use hopflow_types::error::BrokerError;
use hopflow_types::message::WorkflowMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Partition count used by [`InMemoryBroker::new`].
pub const DEFAULT_PARTITIONS: usize = 4;

/// Buffer size for each partition queue.
pub const PARTITION_BUFFER: usize = 256;

/// How long `send_sync` waits for room in a full partition.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

struct Envelope {
    destination: String,
    message: WorkflowMessage,
}

/// In-memory [`MessageBroker`] with per-key FIFO delivery.
pub struct InMemoryBroker {
    partitions: Vec<mpsc::Sender<Envelope>>,
    /// Taken once by `start`.
    receivers: Mutex<Option<Vec<mpsc::Receiver<Envelope>>>>,
    /// Accepted message count per destination.
    published: Arc<DashMap<String, u64>>,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS, PARTITION_BUFFER)
    }

    /// `partitions` and `buffer` are clamped to at least 1.
    pub fn with_partitions(partitions: usize, buffer: usize) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions.max(1))
            .map(|_| mpsc::channel(buffer.max(1)))
            .unzip();
        Self {
            partitions: senders,
            receivers: Mutex::new(Some(receivers)),
            published: Arc::new(DashMap::new()),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition index for a routing key.
    pub fn partition_for(&self, routing_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Number of messages accepted for `destination` so far.
    pub fn published(&self, destination: &str) -> u64 {
        self.published.get(destination).map_or(0, |c| *c)
    }

    /// Spawn one worker per partition delivering to `handler` until `cancel`
    /// fires. Fails if the broker was already started.
    pub fn start(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BrokerError::Unavailable("in-memory broker already started".to_string()))?;

        info!(partitions = receivers.len(), "in-memory broker started");
        Ok(receivers
            .into_iter()
            .enumerate()
            .map(|(index, rx)| {
                tokio::spawn(run_partition(index, rx, Arc::clone(&handler), cancel.clone()))
            })
            .collect())
    }

    /// Stop accepting messages. Already queued messages are still delivered.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("in-memory broker closed");
        }
    }

    fn route(&self, destination: &str, message: WorkflowMessage) -> Result<(&mpsc::Sender<Envelope>, Envelope), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("in-memory broker is closed".to_string()));
        }
        let index = self.partition_for(message.routing_key());
        let envelope = Envelope {
            destination: destination.to_string(),
            message,
        };
        Ok((&self.partitions[index], envelope))
    }
}

fn count(published: &DashMap<String, u64>, destination: &str) {
    *published.entry(destination.to_string()).or_insert(0) += 1;
}

fn closed_partition(destination: &str) -> BrokerError {
    BrokerError::Send {
        destination: destination.to_string(),
        reason: "partition worker stopped".to_string(),
    }
}

async fn send_within(
    tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
    timeout: Duration,
) -> Result<(), BrokerError> {
    let destination = envelope.destination.clone();
    tx.send_timeout(envelope, timeout).await.map_err(|e| match e {
        mpsc::error::SendTimeoutError::Timeout(_) => BrokerError::Backpressure { destination },
        mpsc::error::SendTimeoutError::Closed(_) => closed_partition(&destination),
    })
}

async fn run_partition(
    index: usize,
    mut rx: mpsc::Receiver<Envelope>,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => handler.deliver(&envelope.destination, envelope.message).await,
                None => break,
            },
        }
    }
    debug!(partition = index, "partition worker stopped");
}

impl MessageBroker for InMemoryBroker {
    fn broker_type(&self) -> &str {
        "memory"
    }

    async fn send(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        let (tx, envelope) = self.route(destination, message.clone())?;
        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::Backpressure {
                destination: destination.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => closed_partition(destination),
        })?;
        count(&self.published, destination);
        Ok(())
    }

    async fn send_sync(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        let (tx, envelope) = self.route(destination, message.clone())?;
        send_within(tx, envelope, self.send_timeout).await?;
        count(&self.published, destination);
        Ok(())
    }

    fn send_async(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt {
        let (tx, envelope) = match self.route(destination, message) {
            Ok((tx, envelope)) => (tx.clone(), envelope),
            Err(e) => return DeliveryReceipt::ready(Err(e)),
        };
        let published = Arc::clone(&self.published);
        let timeout = self.send_timeout;
        DeliveryReceipt::spawn(async move {
            let destination = envelope.destination.clone();
            send_within(&tx, envelope, timeout).await?;
            count(&published, &destination);
            Ok(())
        })
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
