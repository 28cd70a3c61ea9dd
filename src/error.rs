//! evalrun error types

use std::time::Duration;

use crate::limits::LimitExceeded;

/// evalrun error types
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    // Upstream generation errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("empty response from model")]
    EmptyResponse,

    // Shared resource errors
    /// Sandbox/subprocess failure. `transient` marks intermittent failures
    /// (container restarts, pool exhaustion) that are worth retrying.
    #[error("sandbox error: {message}")]
    Sandbox { message: String, transient: bool },

    // Storage errors
    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration / input errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Control flow
    /// A resource ceiling was crossed. Not a failure: the sample exits early
    /// with whatever output it has.
    #[error("{0}")]
    LimitExceeded(LimitExceeded),

    /// The run is aborting and the sample observed the cancellation flag.
    #[error("sample cancelled")]
    Cancelled,

    // Terminal sample errors
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<EvalError> },

    #[error("{0}")]
    Fatal(String),
}

impl EvalError {
    /// Whether this error is worth retrying.
    ///
    /// Rate limits, network failures, 5xx responses, empty responses and
    /// intermittent sandbox failures are transient. Everything else,
    /// including limit exits and cancellation, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            EvalError::RateLimited { .. } | EvalError::Http(_) | EvalError::EmptyResponse => true,
            EvalError::Api { status, .. } => *status == 408 || *status >= 500,
            EvalError::Sandbox { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Provider-supplied delay hint for rate-limited requests.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EvalError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether the sample state is still usable after this error.
    ///
    /// Generation errors are raised before the conversation is mutated, so
    /// the next attempt can continue from the current state. Sandbox errors
    /// may leave tool side effects half-applied and force a rollback to the
    /// last checkpoint.
    pub fn leaves_state_consistent(&self) -> bool {
        !matches!(self, EvalError::Sandbox { .. } | EvalError::Io(_))
    }

    /// The limit this error carries, if it is a limit exit.
    pub fn as_limit_exceeded(&self) -> Option<&LimitExceeded> {
        match self {
            EvalError::LimitExceeded(limit) => Some(limit),
            _ => None,
        }
    }

    /// Short machine-readable category for logs, metrics and error records.
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::Http(_) => "http",
            EvalError::Api { .. } => "api",
            EvalError::RateLimited { .. } => "rate_limited",
            EvalError::AuthenticationFailed => "authentication",
            EvalError::ModelNotFound(_) => "model_not_found",
            EvalError::EmptyResponse => "empty_response",
            EvalError::Sandbox { .. } => "sandbox",
            EvalError::Cache(_) => "cache",
            EvalError::Io(_) => "io",
            EvalError::Json(_) => "json",
            EvalError::Configuration(_) => "configuration",
            EvalError::InvalidInput(_) => "invalid_input",
            EvalError::LimitExceeded(_) => "limit_exceeded",
            EvalError::Cancelled => "cancelled",
            EvalError::RetriesExhausted { .. } => "retries_exhausted",
            EvalError::Fatal(_) => "fatal",
        }
    }
}

impl From<LimitExceeded> for EvalError {
    fn from(limit: LimitExceeded) -> Self {
        EvalError::LimitExceeded(limit)
    }
}

/// Result type alias for evalrun operations
pub type Result<T> = std::result::Result<T, EvalError>;
