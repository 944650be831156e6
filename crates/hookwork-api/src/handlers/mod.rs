//! HTTP handlers.
//!
//! - `work` - sync and async submission
//! - `requests` - record lookup and listing
//! - `health` - liveness and store connectivity
//!
//! Every failure is rendered as `{"error": {"code", "message"}}` through
//! `ApiError`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookwork_core::CoreError;
use hookwork_delivery::SubmitError;
use serde::{Deserialize, Serialize};
use tracing::error;

pub mod health;
pub mod requests;
pub mod work;

pub use health::{health_check, liveness_check};
pub use requests::{get_request, list_requests};
pub use work::{submit_async, submit_sync};

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Machine-readable code plus description.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Handler error carrying its status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Creates an error response.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    /// 422 for malformed input.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
    }

    /// 400 for bad query parameters or identifiers.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// Status code this error renders with.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail { code: self.code.to_string(), message: self.message },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        let status = match &err {
            SubmitError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SubmitError::UnsafeCallback(_) => StatusCode::BAD_REQUEST,
            SubmitError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "submission failed");
        }
        let message = match &err {
            SubmitError::Validation(message) => message.clone(),
            other => other.to_string(),
        };
        Self::new(status, err.code(), message)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            CoreError::Validation(message) => Self::bad_request(message),
            other => {
                error!(error = %other, "store operation failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string())
            },
        }
    }
}
