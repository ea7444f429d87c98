//! Workflow engine logic and repository trait definitions for hopflow.
//!
//! This crate defines the "ports" (broker and repository traits) that the
//! infrastructure layer implements, plus the engine itself: step execution,
//! failure policy, circuit-breaker-guarded dispatch, retry scheduling, and
//! the operator command services. It depends only on `hopflow-types` --
//! never on `hopflow-infra` or any database/IO crate.

pub mod broker;
pub mod repository;
pub mod service;
#[cfg(test)]
pub(crate) mod testing;
pub mod workflow;
