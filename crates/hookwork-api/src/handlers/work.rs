//! Work submission handlers.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookwork_core::WorkInput;
use hookwork_delivery::{AsyncAck, SyncOutcome};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::ApiError;
use crate::AppState;

/// Body of `POST /async`.
#[derive(Debug, Deserialize)]
pub struct AsyncWorkBody {
    /// Work input.
    #[serde(flatten)]
    pub input: WorkInput,
    /// Where the result is POSTed.
    pub callback_url: String,
}

/// Computes the request inline.
///
/// # Errors
///
/// - 422: malformed body or invalid input
/// - 503: store unavailable
#[instrument(name = "submit_sync", skip_all)]
pub async fn submit_sync(
    State(state): State<AppState>,
    body: Result<Json<WorkInput>, JsonRejection>,
) -> Result<Json<SyncOutcome>, ApiError> {
    let Json(input) = body.map_err(|e| ApiError::validation(e.body_text()))?;
    debug!(chars = input.text.chars().count(), count = input.count, "sync submission");

    let outcome = state.lifecycle.submit_sync(input).await?;
    Ok(Json(outcome))
}

/// Accepts the request and returns 202 before computing it.
///
/// # Errors
///
/// - 422: malformed body or invalid input
/// - 400: callback URL rejected by the SSRF guard
/// - 503: store unavailable
#[instrument(name = "submit_async", skip_all)]
pub async fn submit_async(
    State(state): State<AppState>,
    body: Result<Json<AsyncWorkBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(AsyncWorkBody { input, callback_url }) =
        body.map_err(|e| ApiError::validation(e.body_text()))?;

    let ack: AsyncAck = state.lifecycle.submit_async(input, callback_url).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}
