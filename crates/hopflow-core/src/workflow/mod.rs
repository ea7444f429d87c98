//! Workflow engine: definitions, step execution, failure routing, and the
//! consumer-side bookkeeping that persists each hop.

pub mod backoff;
pub mod consumer;
pub mod definition;
pub mod executor;
pub mod factory;
pub mod failure;
pub mod payload;
pub mod recorder;
pub mod registry;
pub mod security;
pub mod starter;

pub use backoff::BackoffCalculator;
pub use consumer::WorkflowConsumer;
pub use definition::{
    FailureCallback, StepContext, StepDefinition, StepHandler, SuccessCallback, WorkflowDefinition,
};
pub use executor::{DropReason, EngineError, StepExecutor, StepOutcome};
pub use factory::MessageFactory;
pub use failure::FailureHandler;
pub use recorder::ExecutionRecorder;
pub use registry::WorkflowRegistry;
pub use starter::WorkflowStarter;
