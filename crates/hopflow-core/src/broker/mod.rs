//! Message broker port and the circuit-breaker-guarded dispatch around it.
//!
//! `MessageBroker` is the send capability every emitting component uses.
//! Infrastructure provides the transport (in-memory, Kafka, ...); core
//! decorates it with [`resilient::ResilientBroker`].

pub mod box_broker;
pub mod circuit_breaker;
pub mod resilient;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use hopflow_types::error::BrokerError;
use hopflow_types::message::WorkflowMessage;
use tokio::sync::oneshot;

/// Send capability for workflow messages.
///
/// Implementations must keep FIFO order for messages that share a routing
/// key (`WorkflowMessage::routing_key`). Nothing is guaranteed across keys.
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
pub trait MessageBroker: Send + Sync {
    /// Short transport identifier, e.g. `"memory"` or `"kafka"`.
    fn broker_type(&self) -> &str;

    /// Hand the message to the transport without waiting for acknowledgement.
    fn send(
        &self,
        destination: &str,
        message: &WorkflowMessage,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Send and wait until the transport has accepted the message.
    fn send_sync(
        &self,
        destination: &str,
        message: &WorkflowMessage,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Start a send and return immediately with a receipt for its outcome.
    fn send_async(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt;

    /// Whether the transport currently accepts messages.
    fn is_available(&self) -> bool;
}

/// Receiving side of a transport: called once per delivered message.
///
/// Object-safe so transports can hold `Arc<dyn DeliveryHandler>`.
pub trait DeliveryHandler: Send + Sync {
    fn deliver<'a>(&'a self, destination: &'a str, message: WorkflowMessage) -> BoxFuture<'a, ()>;
}

/// Pending outcome of a [`MessageBroker::send_async`] call.
///
/// Awaiting the receipt yields the send result. Dropping it does not cancel
/// the send.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<Result<(), BrokerError>>,
}

impl DeliveryReceipt {
    /// A receipt plus the sender that resolves it.
    pub fn pending() -> (oneshot::Sender<Result<(), BrokerError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// An already-resolved receipt.
    pub fn ready(result: Result<(), BrokerError>) -> Self {
        let (tx, receipt) = Self::pending();
        let _ = tx.send(result);
        receipt
    }

    /// Drive `fut` on the runtime and resolve the receipt with its output.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        let (tx, receipt) = Self::pending();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        receipt
    }
}

impl Future for DeliveryReceipt {
    type Output = Result<(), BrokerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BrokerError::ReceiptDropped)))
    }
}
