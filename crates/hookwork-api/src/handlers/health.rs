//! Health check handlers.
//!
//! `/healthz` only proves the process answers. `/health` also pings the
//! store and reports callback dispatcher counters.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::AppState;

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything reachable.
    Healthy,
    /// The store is unreachable.
    Unhealthy,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Store connectivity.
    pub database: ComponentHealth,
    /// Callback dispatcher counters.
    pub callbacks: CallbackCounters,
    /// Service version.
    pub version: String,
}

/// One component's status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// `up` or `down`.
    pub status: String,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Check latency.
    pub response_time_ms: u64,
}

/// Snapshot of `DispatcherStats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackCounters {
    /// Waiting for a delivery task.
    pub queued: u64,
    /// Being delivered or in backoff.
    pub in_flight: u64,
    /// Delivered.
    pub sent: u64,
    /// Gave up after the attempt budget.
    pub failed: u64,
    /// Terminalized by the guard.
    pub unsafe_rejections: u64,
}

/// Liveness probe.
#[instrument(name = "liveness_check", skip_all)]
pub async fn liveness_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Store connectivity check; 503 when the store is down.
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let started = state.clock.now();
    let check = state.lifecycle.health_check().await;
    let response_time_ms =
        u64::try_from(state.clock.now().saturating_duration_since(started).as_millis())
            .unwrap_or(u64::MAX);

    let (status, database) = match check {
        Ok(()) => (HealthStatus::Healthy, ComponentHealth {
            status: "up".to_string(),
            message: None,
            response_time_ms,
        }),
        Err(e) => {
            error!(error = %e, "store health check failed");
            (HealthStatus::Unhealthy, ComponentHealth {
                status: "down".to_string(),
                message: Some(e.to_string()),
                response_time_ms,
            })
        },
    };

    let stats = state.lifecycle.dispatcher().stats().await;
    let body = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        database,
        callbacks: CallbackCounters {
            queued: stats.queued,
            in_flight: stats.in_flight,
            sent: stats.sent,
            failed: stats.permanent_failures,
            unsafe_rejections: stats.unsafe_rejections,
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    debug!(status = ?body.status, "health check completed");
    let code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(body)).into_response()
}
