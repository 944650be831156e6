//! Error types and result handling for core operations.
//!
//! Separates caller-visible validation failures from storage and state
//! machine errors so the API layer can map each to the right response.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for validation, state transitions and storage.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-supplied input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A patch would move a record backwards or out of a terminal state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Stored JSON could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Creates a validation error from a message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an invalid transition error from a message.
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    /// Returns true if this error was caused by the caller's input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
