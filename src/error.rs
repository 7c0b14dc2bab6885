//! Pipeline error types with failure classification and retry strategies.
//!
//! # Error Handling Philosophy
//!
//! Every failure that crosses the pipeline carries enough structure for the
//! resilience layer to act on it without inspecting message strings:
//!
//! 1. **Classified**: backend failures map onto a closed [`FailureKind`] set
//! 2. **Attributable**: throttling and breaker denials name the backend
//! 3. **Aggregated**: the fallback router reports one reason per backend
//!
//! # Common Errors and Solutions
//!
//! | Error | Cause | Solution |
//! |-------|-------|----------|
//! | `Throttled` | Limiter or provider throttled the call | Wait for `retry_after` |
//! | `CircuitOpen` | Backend failed repeatedly | Wait for recovery timeout |
//! | `BackendUnavailable` | Network or 5xx class failure | Retry or fall back |
//! | `InvalidRequest` | Caller input rejected | Fix the request, never retried |
//! | `AggregateFallback` | Every configured backend failed | Inspect per-backend reasons |
//!
//! # Breaker Accounting
//!
//! Only backend-originated failures (`Throttled`, `BackendUnavailable`,
//! `Timeout`) count toward a circuit breaker threshold. Caller defects,
//! tool failures and local gate denials never do.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// Failure Classification
// ============================================================================

/// Classification of a backend adapter failure.
///
/// The classification, not the raw error, drives breaker, limiter and
/// fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Provider or local limiter signaled throttling.
    Throttled,
    /// Network failure or 5xx-equivalent.
    Unavailable,
    /// Caller input was rejected.
    InvalidRequest,
    /// The call did not complete in time.
    Timeout,
}

impl FailureKind {
    /// Whether this kind of failure counts toward a breaker threshold.
    pub fn is_backend_originated(&self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Throttled => "throttled",
            Self::Unavailable => "unavailable",
            Self::InvalidRequest => "invalid_request",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Retry Strategy
// ============================================================================

/// Strategy for retrying failed pipeline operations.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff (for transient errors).
    ExponentialBackoff {
        /// Initial delay before first retry.
        base_delay: Duration,
        /// Maximum delay between retries.
        max_delay: Duration,
        /// Maximum number of attempts, including the first one.
        max_attempts: u32,
    },

    /// Wait for a specific duration then retry once (for throttling).
    WaitAndRetry {
        /// Duration to wait before retrying.
        wait: Duration,
    },

    /// Do not retry at all (permanent error).
    NoRetry,
}

impl RetryStrategy {
    /// Standard exponential backoff for network errors.
    pub fn network_backoff() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_millis(125),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    /// Standard exponential backoff for server errors.
    pub fn server_backoff() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    /// Check if this strategy allows retrying.
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::NoRetry)
    }
}

// ============================================================================
// Tool Errors
// ============================================================================

/// Errors raised on the agent side while resolving or invoking tools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// No tool with this name is registered.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// A tool with this name is already registered.
    #[error("Tool already registered: {0}")]
    Duplicate(String),

    /// Arguments did not match the tool's expectations.
    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    /// The tool ran and failed (local or remote).
    #[error("Tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },
}

impl ToolError {
    /// Name of the tool this error refers to.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::NotFound(name) | Self::Duplicate(name) => name,
            Self::InvalidArguments { tool, .. } | Self::Execution { tool, .. } => tool,
        }
    }
}

// ============================================================================
// Fallback Failure Report
// ============================================================================

/// One backend's failure inside a fallback attempt sequence.
#[derive(Debug)]
pub struct BackendFailure {
    /// Backend identifier.
    pub backend: String,
    /// The failure observed for this backend.
    pub error: PipelineError,
}

impl BackendFailure {
    /// Create a new failure record.
    pub fn new(backend: impl Into<String>, error: PipelineError) -> Self {
        Self {
            backend: backend.into(),
            error,
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)
    }
}

fn format_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Pipeline Error Types
// ============================================================================

/// Errors that can occur while orchestrating a request.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Throttled by a local rate limiter or by the provider.
    #[error("Throttled by '{backend}'")]
    Throttled {
        backend: String,
        retry_after: Option<Duration>,
    },

    /// Circuit breaker is open; no network attempt was made.
    #[error("Circuit open for '{backend}'")]
    CircuitOpen { backend: String },

    /// Network or 5xx-class failure.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Caller input rejected; never retried or counted toward a breaker.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// Agent-side tool failure.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Every backend in a fallback chain failed.
    #[error("All backends failed: {}", format_failures(.0))]
    AggregateFallback(Vec<BackendFailure>),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation not supported by this component.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Unexpected internal failure (e.g. a panicking batch item).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Timeout
        } else if err.is_connect() {
            PipelineError::BackendUnavailable(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            PipelineError::BackendUnavailable(format!("Malformed response: {}", err))
        } else {
            PipelineError::BackendUnavailable(err.to_string())
        }
    }
}

impl PipelineError {
    /// Create a throttling error without a retry hint.
    pub fn throttled(backend: impl Into<String>) -> Self {
        Self::Throttled {
            backend: backend.into(),
            retry_after: None,
        }
    }

    /// Classify this error as a backend failure kind, if it is one.
    ///
    /// Local gate denials (`CircuitOpen`), tool, config and aggregate errors
    /// have no classification.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Throttled { .. } => Some(FailureKind::Throttled),
            Self::BackendUnavailable(_) => Some(FailureKind::Unavailable),
            Self::InvalidRequest(_) => Some(FailureKind::InvalidRequest),
            Self::Timeout => Some(FailureKind::Timeout),
            _ => None,
        }
    }

    /// Whether this error counts toward a circuit breaker threshold.
    pub fn counts_toward_breaker(&self) -> bool {
        self.failure_kind()
            .map(|kind| kind.is_backend_originated())
            .unwrap_or(false)
    }

    /// Whether the fallback router must stop and surface this error.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    /// Get the appropriate retry strategy for this error.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::BackendUnavailable(_) | Self::Timeout => RetryStrategy::network_backoff(),

            Self::Throttled { retry_after, .. } => RetryStrategy::WaitAndRetry {
                wait: retry_after.unwrap_or(Duration::from_secs(60)),
            },

            Self::InvalidRequest(_)
            | Self::CircuitOpen { .. }
            | Self::Tool(_)
            | Self::AggregateFallback(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::NotSupported(_)
            | Self::Internal(_) => RetryStrategy::NoRetry,
        }
    }

    /// Check if this error is recoverable (can be retried).
    pub fn is_recoverable(&self) -> bool {
        self.retry_strategy().should_retry()
    }

    /// Get a user-friendly description of the error with suggested action.
    pub fn user_description(&self) -> String {
        match self {
            Self::Throttled {
                backend,
                retry_after,
            } => match retry_after {
                Some(wait) => format!(
                    "Backend '{}' is throttling requests. Retry in {}s.",
                    backend,
                    wait.as_secs()
                ),
                None => format!("Backend '{}' is throttling requests.", backend),
            },
            Self::CircuitOpen { backend } => format!(
                "Backend '{}' is failing repeatedly and is temporarily disabled.",
                backend
            ),
            Self::BackendUnavailable(_) => {
                "Unable to reach the backend. Check connectivity or try another backend."
                    .to_string()
            }
            Self::InvalidRequest(msg) => {
                format!("Invalid request: {}. Check your parameters.", msg)
            }
            Self::Timeout => "Request timed out. The backend may be overloaded.".to_string(),
            Self::Tool(err) => format!("Tool error: {}", err),
            Self::AggregateFallback(failures) => format!(
                "All {} backends failed. First failure: {}",
                failures.len(),
                failures
                    .first()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "none recorded".to_string())
            ),
            Self::Config(msg) => format!("Configuration error: {}.", msg),
            Self::Serialization(_) => {
                "Failed to parse backend data. This may be a temporary issue.".to_string()
            }
            Self::NotSupported(feature) => {
                format!("Feature '{}' is not supported by this component.", feature)
            }
            Self::Internal(msg) => format!("An unexpected error occurred: {}", msg),
        }
    }
}
