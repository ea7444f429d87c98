pub mod execution;
pub mod outbox;
