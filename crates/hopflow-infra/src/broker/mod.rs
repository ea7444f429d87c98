//! Broker transports.

pub mod memory;
