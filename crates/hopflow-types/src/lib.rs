//! Shared domain types for hopflow.
//!
//! This crate contains the data model used across the workflow engine:
//! the `WorkflowMessage` envelope, retry/error records, the persisted
//! `WorkflowExecution` aggregate, outbox records, engine configuration,
//! and the error types shared by the core ports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod message;
pub mod outbox;
pub mod status;
