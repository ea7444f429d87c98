//! Engine runtime wiring all components together.
//!
//! `EngineRuntime` pins the core services to the in-memory broker (behind the
//! circuit breaker) and a caller-chosen execution store, then owns the
//! background tasks: partition workers, the retry/retention sweeps, and the
//! outbox relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use hopflow_core::broker::circuit_breaker::CircuitBreakerRegistry;
use hopflow_core::broker::resilient::ResilientBroker;
use hopflow_core::broker::DeliveryHandler;
use hopflow_core::repository::execution::ExecutionRepository;
use hopflow_core::repository::outbox::OutboxRepository;
use hopflow_core::service::{CommandService, OutboxRelay, PayloadService, RetryScheduler};
use hopflow_core::workflow::definition::WorkflowDefinition;
use hopflow_core::workflow::payload::PayloadDeserializer;
use hopflow_core::workflow::security::SecurityContextPropagator;
use hopflow_core::workflow::starter::StartError;
use hopflow_core::workflow::{
    ExecutionRecorder, StepExecutor, WorkflowConsumer, WorkflowRegistry, WorkflowStarter,
};
use hopflow_types::config::EngineConfig;
use hopflow_types::error::BrokerError;
use hopflow_types::message::WorkflowMessage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::memory::InMemoryBroker;
use crate::store::memory::InMemoryExecutionStore;

/// The broker every runtime component sends through.
pub type RuntimeBroker = ResilientBroker<InMemoryBroker>;

/// Builder for [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    config: EngineConfig,
    registry: Arc<WorkflowRegistry>,
    broker: Option<InMemoryBroker>,
    deserializer: Option<Arc<dyn PayloadDeserializer>>,
    security: Option<Arc<dyn SecurityContextPropagator>>,
}

impl EngineRuntimeBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(WorkflowRegistry::new()),
            broker: None,
            deserializer: None,
            security: None,
        }
    }

    pub fn workflow(self, definition: WorkflowDefinition) -> Self {
        self.registry.register(definition);
        self
    }

    pub fn broker(mut self, broker: InMemoryBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn deserializer(mut self, deserializer: Arc<dyn PayloadDeserializer>) -> Self {
        self.deserializer = Some(deserializer);
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityContextPropagator>) -> Self {
        self.security = Some(security);
        self
    }

    /// Wire every service over a fresh in-memory store.
    pub fn build_in_memory(self) -> EngineRuntime<InMemoryExecutionStore> {
        self.build(Arc::new(InMemoryExecutionStore::new()))
    }

    /// Wire every service over `store`. Nothing runs until
    /// [`EngineRuntime::start`].
    pub fn build<S>(self, store: Arc<S>) -> EngineRuntime<S>
    where
        S: ExecutionRepository + OutboxRepository + 'static,
    {
        let config = self.config;
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let broker = Arc::new(ResilientBroker::new(
            self.broker.unwrap_or_default(),
            &breakers,
        ));

        let mut executor = StepExecutor::new(Arc::clone(&self.registry), Arc::clone(&broker), &config);
        let mut starter = WorkflowStarter::new(Arc::clone(&self.registry), Arc::clone(&broker))
            .with_service_name(config.service_name.clone());
        if let Some(deserializer) = self.deserializer {
            executor = executor.with_deserializer(deserializer);
        }
        if let Some(security) = self.security {
            executor = executor.with_security(Arc::clone(&security));
            starter = starter.with_security(security);
        }

        let consumer = Arc::new(WorkflowConsumer::new(
            Arc::new(executor),
            ExecutionRecorder::new(Arc::clone(&store)),
            config.dlq.suffix.clone(),
        )
        .with_redelivery(&config.retry));
        let commands = CommandService::new(Arc::clone(&store), Arc::clone(&broker))
            .with_outbox(&config.outbox);
        let payloads = PayloadService::new(Arc::clone(&store));
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            config.retention.clone(),
            config.scheduler.clone(),
        ));
        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            config.outbox.clone(),
        ));

        EngineRuntime {
            config,
            registry: self.registry,
            breakers,
            broker,
            store,
            consumer,
            starter,
            commands,
            payloads,
            scheduler,
            relay,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// A fully wired engine over store `S`.
pub struct EngineRuntime<S>
where
    S: ExecutionRepository + OutboxRepository + 'static,
{
    config: EngineConfig,
    registry: Arc<WorkflowRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    broker: Arc<RuntimeBroker>,
    store: Arc<S>,
    consumer: Arc<WorkflowConsumer<S, RuntimeBroker>>,
    starter: WorkflowStarter<RuntimeBroker>,
    commands: CommandService<S, RuntimeBroker>,
    payloads: PayloadService<S>,
    scheduler: Arc<RetryScheduler<S, RuntimeBroker>>,
    relay: Arc<OutboxRelay<S, RuntimeBroker>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> EngineRuntime<S>
where
    S: ExecutionRepository + OutboxRepository + 'static,
{
    /// Start broker delivery only. Sweeps are left to the caller, e.g. a
    /// one-shot `process_pending_retries`.
    pub fn start_delivery(&self) -> Result<(), BrokerError> {
        let handler: Arc<dyn DeliveryHandler> = self.consumer.clone();
        let handles = self.broker.inner().start(handler, self.cancel.child_token())?;
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        Ok(())
    }

    /// Start delivery plus the sweeps enabled in config.
    pub fn start(&self) -> Result<(), BrokerError> {
        self.start_delivery()?;
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        if self.config.scheduler.enabled {
            let handles = Arc::clone(&self.scheduler).spawn(self.cancel.child_token());
            tasks.push(handles.retries);
            tasks.push(handles.cleanup);
        }
        if self.config.outbox.enabled {
            tasks.push(Arc::clone(&self.relay).spawn(self.cancel.child_token()));
        }

        tracing::info!(
            workflows = self.registry.len(),
            scheduler = self.config.scheduler.enabled,
            outbox = self.config.outbox.enabled,
            "engine runtime started"
        );
        Ok(())
    }

    /// Stop accepting messages, cancel every background task, and wait for
    /// them to finish.
    pub async fn shutdown(&self) {
        self.broker.inner().close();
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {e}");
            }
        }
        tracing::info!("engine runtime stopped");
    }

    /// Convenience for [`WorkflowStarter::start`].
    pub async fn start_workflow(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<WorkflowMessage, StartError> {
        self.starter.start(topic, payload, HashMap::new()).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn broker(&self) -> &Arc<RuntimeBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn consumer(&self) -> &Arc<WorkflowConsumer<S, RuntimeBroker>> {
        &self.consumer
    }

    pub fn starter(&self) -> &WorkflowStarter<RuntimeBroker> {
        &self.starter
    }

    pub fn commands(&self) -> &CommandService<S, RuntimeBroker> {
        &self.commands
    }

    pub fn payloads(&self) -> &PayloadService<S> {
        &self.payloads
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler<S, RuntimeBroker>> {
        &self.scheduler
    }

    pub fn relay(&self) -> &Arc<OutboxRelay<S, RuntimeBroker>> {
        &self.relay
    }
}
