//! Infrastructure layer for hopflow.
//!
//! Contains implementations of the ports defined in `hopflow-core`:
//! SQLite and in-memory execution/outbox storage, the partitioned in-memory
//! broker transport, the engine config loader, and the runtime that wires
//! them together.

pub mod broker;
pub mod config;
pub mod runtime;
pub mod sqlite;
pub mod store;
