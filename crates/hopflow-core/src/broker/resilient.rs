//! Circuit-breaker decorator for any [`MessageBroker`].
//!
//! One breaker per broker type, named `broker-{type}` and obtained from a
//! [`CircuitBreakerRegistry`]. While the breaker rejects calls, every send
//! fails fast with `BrokerError::CircuitOpen` and the underlying transport is
//! never touched. With the breaker disabled in config, calls pass straight
//! through.
//!
//! Backpressure is local queue pressure, not a transport fault, so it hands
//! the permit back without counting against the breaker.

use std::sync::Arc;

use hopflow_types::error::BrokerError;
use hopflow_types::message::WorkflowMessage;

use super::circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use super::{DeliveryReceipt, MessageBroker};

/// Name of the breaker guarding a broker type.
pub fn breaker_name(broker_type: &str) -> String {
    format!("broker-{broker_type}")
}

/// Broker decorator that routes every call through a circuit breaker.
pub struct ResilientBroker<B: MessageBroker> {
    inner: B,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl<B: MessageBroker> ResilientBroker<B> {
    /// Wrap `inner`, registering its breaker in `registry` unless the
    /// registry's configuration disables circuit breaking.
    pub fn new(inner: B, registry: &CircuitBreakerRegistry) -> Self {
        let breaker = registry
            .config()
            .enabled
            .then(|| registry.breaker(&breaker_name(inner.broker_type())));

        match &breaker {
            Some(cb) => tracing::info!(
                broker_type = %inner.broker_type(),
                breaker = %cb.name(),
                "resilient broker initialized"
            ),
            None => tracing::info!(
                broker_type = %inner.broker_type(),
                "circuit breaker disabled, broker calls pass through"
            ),
        }

        Self {
            inner,
            breaker,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Breaker state, or `None` when circuit breaking is disabled.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(|cb| cb.state())
    }

    async fn guarded<F, Fut>(&self, destination: &str, call: F) -> Result<(), BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), BrokerError>>,
    {
        let Some(cb) = &self.breaker else {
            return call().await;
        };

        let permit = match cb.acquire() {
            Ok(permit) => permit,
            Err(err) => {
                tracing::warn!(%destination, breaker = %cb.name(), "dispatch rejected: {err}");
                return Err(err);
            }
        };

        let result = call().await;
        settle(permit, &result);
        result
    }
}

fn settle(permit: CallPermit, result: &Result<(), BrokerError>) {
    match result {
        Err(BrokerError::Backpressure { .. }) => permit.release(),
        other => permit.record(other.is_ok()),
    }
}

impl<B: MessageBroker> MessageBroker for ResilientBroker<B> {
    fn broker_type(&self) -> &str {
        self.inner.broker_type()
    }

    async fn send(&self, destination: &str, message: &WorkflowMessage) -> Result<(), BrokerError> {
        self.guarded(destination, || self.inner.send(destination, message))
            .await
    }

    async fn send_sync(
        &self,
        destination: &str,
        message: &WorkflowMessage,
    ) -> Result<(), BrokerError> {
        self.guarded(destination, || self.inner.send_sync(destination, message))
            .await
    }

    fn send_async(&self, destination: &str, message: WorkflowMessage) -> DeliveryReceipt {
        let Some(cb) = self.breaker.clone() else {
            return self.inner.send_async(destination, message);
        };

        let permit = match cb.acquire() {
            Ok(permit) => permit,
            Err(err) => {
                tracing::warn!(%destination, breaker = %cb.name(), "async dispatch rejected: {err}");
                return DeliveryReceipt::ready(Err(err));
            }
        };

        let receipt = self.inner.send_async(destination, message);
        DeliveryReceipt::spawn(async move {
            let result = receipt.await;
            settle(permit, &result);
            result
        })
    }

    /// False while the circuit is open, otherwise whatever the transport says.
    fn is_available(&self) -> bool {
        if self
            .breaker
            .as_ref()
            .is_some_and(|cb| cb.state() == CircuitState::Open)
        {
            return false;
        }
        self.inner.is_available()
    }
}
