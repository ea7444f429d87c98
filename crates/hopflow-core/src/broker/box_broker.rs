//! BoxMessageBroker -- object-safe dynamic dispatch wrapper for MessageBroker.
//!
//! 1. Define an object-safe `MessageBrokerDyn` trait with boxed futures
//! 2. Blanket-impl `MessageBrokerDyn` for all `T: MessageBroker`
//! 3. `BoxMessageBroker` wraps `Box<dyn MessageBrokerDyn>` and delegates
//!
//! `BoxMessageBroker` itself implements `MessageBroker`, so it can sit under
//! `ResilientBroker` when the transport is chosen at runtime.

use std::future::Future;
use std::pin::Pin;

use hopflow_types::error::BrokerError;
use hopflow_types::message::WorkflowMessage;

use super::{DeliveryReceipt, MessageBroker};

type BoxSendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;

/// Object-safe version of [`MessageBroker`] with boxed futures.
pub trait MessageBrokerDyn: Send + Sync {
    fn broker_type(&self) -> &str;

    fn send_boxed<'a>(
        &'a self,
        destination: &'a str,
        message: &'a WorkflowMessage,
    ) -> BoxSendFuture<'a>;

    fn send_sync_boxed<'a>(
        &'a self,
        destination: &'a str,
        message: &'a WorkflowMessage,
    ) -> BoxSendFuture<'a>;

    fn send_async_dyn(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt;

    fn is_available(&self) -> bool;
}

/// Blanket implementation: any `MessageBroker` automatically implements `MessageBrokerDyn`.
impl<T: MessageBroker> MessageBrokerDyn for T {
    fn broker_type(&self) -> &str {
        MessageBroker::broker_type(self)
    }

    fn send_boxed<'a>(
        &'a self,
        destination: &'a str,
        message: &'a WorkflowMessage,
    ) -> BoxSendFuture<'a> {
        Box::pin(self.send(destination, message))
    }

    fn send_sync_boxed<'a>(
        &'a self,
        destination: &'a str,
        message: &'a WorkflowMessage,
    ) -> BoxSendFuture<'a> {
        Box::pin(self.send_sync(destination, message))
    }

    fn send_async_dyn(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt {
        self.send_async(destination, message)
    }

    fn is_available(&self) -> bool {
        MessageBroker::is_available(self)
    }
}

/// Type-erased message broker for runtime transport selection.
pub struct BoxMessageBroker {
    inner: Box<dyn MessageBrokerDyn + Send + Sync>,
}

impl BoxMessageBroker {
    /// Wrap a concrete `MessageBroker` in a type-erased box.
    pub fn new<T: MessageBroker + 'static>(broker: T) -> Self {
        Self {
            inner: Box::new(broker),
        }
    }
}

impl MessageBroker for BoxMessageBroker {
    fn broker_type(&self) -> &str {
        self.inner.broker_type()
    }

    async fn send(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        self.inner.send_boxed(destination, message).await
    }

    async fn send_sync(
        &self,
        destination: &str,
        message: &WorkflowMessage,
    ) -> Result<(), BrokerError> {
        self.inner.send_sync_boxed(destination, message).await
    }

    fn send_async(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt {
        self.inner.send_async_dyn(destination, message)
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

impl std::fmt::Debug for BoxMessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxMessageBroker")
            .field("broker_type", &self.inner.broker_type())
            .finish()
    }
}
