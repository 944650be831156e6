//! Request lookup and listing.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use hookwork_core::{RequestFilter, RequestId, RequestPage, WorkRequest};
use tracing::instrument;

use super::ApiError;
use crate::AppState;

/// Returns one record, callback state included.
///
/// # Errors
///
/// - 400: malformed identifier
/// - 404: unknown identifier
#[instrument(name = "get_request", skip(state))]
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkRequest>, ApiError> {
    let id: RequestId =
        id.parse().map_err(|_| ApiError::bad_request(format!("invalid request id: {id}")))?;
    Ok(Json(state.lifecycle.get(id).await?))
}

/// Lists records newest first.
///
/// Query parameters: `mode`, `status`, `callback_status`, `limit`, `offset`.
///
/// # Errors
///
/// - 400: unknown enum value or `limit` outside 1..=100
#[instrument(name = "list_requests", skip_all)]
pub async fn list_requests(
    State(state): State<AppState>,
    query: Result<Query<RequestFilter>, QueryRejection>,
) -> Result<Json<RequestPage>, ApiError> {
    let Query(filter) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(state.lifecycle.list(filter).await?))
}
