//! Non-durable storage, for tests, demos, and single-process runs.

pub mod memory;
