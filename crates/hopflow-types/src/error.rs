use thiserror::Error;

/// Errors from repository operations (used by trait definitions in hopflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A compare-and-swap on the execution version lost the race.
    #[error(
        "optimistic lock failure on execution '{execution_id}': expected version {expected:?}, found {actual:?}"
    )]
    OptimisticLock {
        execution_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
}

/// Errors surfaced by message broker implementations and the circuit breaker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The breaker rejected the call without reaching the transport.
    #[error("circuit breaker '{name}' is {state} and does not permit further calls")]
    CircuitOpen { name: String, state: String },

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker queue full for destination '{destination}'")]
    Backpressure { destination: String },

    #[error("send to '{destination}' failed: {reason}")]
    Send { destination: String, reason: String },

    #[error("delivery receipt dropped before completion")]
    ReceiptDropped,
}

impl BrokerError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BrokerError::CircuitOpen { .. })
    }
}

/// Well-known `StepError` kinds produced by the engine itself.
pub mod kinds {
    /// Default non-retryable kind: the input can never succeed as-is.
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const STEP_TIMEOUT: &str = "step_timeout";
    pub const PANIC: &str = "panic";
    pub const PAYLOAD_DESERIALIZATION: &str = "payload_deserialization";
}

/// Failure raised by a step handler.
///
/// `kind` is the type identifier the failure handler matches against the
/// configured non-retryable set (exact string equality). `trace` carries a
/// rendered diagnostic (error source chain, panic message, ...) that ends up
/// truncated in `ErrorInfo::stack_trace`.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    kind: String,
    message: String,
    trace: Option<String>,
}

impl StepError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(kinds::INVALID_INPUT, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            kinds::STEP_TIMEOUT,
            format!("step did not finish within {}ms", after.as_millis()),
        )
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(kinds::PANIC, message)
    }

    /// Wrap any error, using its Rust type name as the kind and its source
    /// chain as the trace.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error,
    {
        let mut trace = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            trace: Some(trace),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::from_error(&err)
    }
}

/// Engine configuration rejected by `EngineConfig::validate`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}
