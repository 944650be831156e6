//! Error types for callback delivery and request submission.
//!
//! `DeliveryError` classifies a single delivery attempt so the dispatcher can
//! decide between retrying and terminalizing. `SubmitError` is what callers
//! of the request lifecycle see.

use std::fmt;

use hookwork_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering a callback.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection refused, reset, DNS failure, or another transport error.
    #[error("network error: {message}")]
    Network {
        /// Underlying failure text.
        message: String,
    },

    /// The receiver did not answer within the attempt timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The receiver answered with a non-2xx status.
    #[error("HTTP {status_code}")]
    HttpStatus {
        /// Response status code.
        status_code: u16,
        /// Truncated response body.
        body: String,
    },

    /// The callback guard rejected the target.
    #[error("target became unsafe: {reason}")]
    UnsafeTarget {
        /// Deny reason from the guard.
        reason: String,
    },

    /// Every attempt failed.
    #[error("max attempts ({attempts}) exhausted: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },

    /// Persisting delivery state failed.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying store error text.
        message: String,
    },

    /// Invalid client or dispatcher configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// The dispatcher is shutting down.
    #[error("dispatcher shutdown requested")]
    ShutdownRequested,

    /// In-flight deliveries did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout_ms}ms")]
    ShutdownTimeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates an HTTP status error.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates an unsafe-target error.
    pub fn unsafe_target(reason: impl Into<String>) -> Self {
        Self::UnsafeTarget { reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns true for failures that count as an attempt and may be retried.
    ///
    /// Every non-2xx status is retried, 4xx included; the receiver may be
    /// mid-deploy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::HttpStatus { .. } => true,
            Self::UnsafeTarget { .. }
            | Self::RetriesExhausted { .. }
            | Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}

/// Coarse error category used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// Non-2xx responses.
    Http,
    /// Guard rejections.
    Guard,
    /// Store failures.
    Storage,
    /// Configuration, exhaustion, and shutdown.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::UnsafeTarget { .. } => Self::Guard,
            DeliveryError::Storage { .. } => Self::Storage,
            DeliveryError::RetriesExhausted { .. }
            | DeliveryError::Configuration { .. }
            | DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Http => "http",
            Self::Guard => "guard",
            Self::Storage => "storage",
            Self::Internal => "internal",
        })
    }
}

/// Errors returned to callers submitting work.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Input failed validation; nothing was persisted.
    #[error("{0}")]
    Validation(String),

    /// The callback URL was rejected by the guard; nothing was persisted.
    #[error("unsafe callback url: {0}")]
    UnsafeCallback(String),

    /// The request store failed.
    #[error("store error: {0}")]
    Store(#[source] CoreError),

    /// The work executor failed; the record is marked failed.
    #[error("execution failed: {0}")]
    Execution(String),
}

impl SubmitError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UnsafeCallback(_) => "unsafe_callback",
            Self::Store(_) => "store_error",
            Self::Execution(_) => "execution_error",
        }
    }
}

impl From<CoreError> for SubmitError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(message) => Self::Validation(message),
            other => Self::Store(other),
        }
    }
}
