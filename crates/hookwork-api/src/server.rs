//! HTTP server setup and routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation (`x-request-id` on every response)
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! On SIGINT or SIGTERM the server stops accepting connections and drains
//! in-flight requests; the caller then shuts the lifecycle down.

use std::{future::Future, net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::{handlers, AppState};

/// Header carrying the per-request trace ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the router with the default request timeout.
pub fn create_router(state: AppState) -> Router {
    create_router_with_timeout(state, DEFAULT_REQUEST_TIMEOUT)
}

/// Builds the router with every route and middleware.
pub fn create_router_with_timeout(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/healthz", get(handlers::liveness_check))
        .route("/health", get(handlers::health_check));

    let api_routes = Router::new()
        .route("/sync", post(handlers::submit_sync))
        .route("/async", post(handlers::submit_async))
        .route("/requests", get(handlers::list_requests))
        .route("/requests/{id}", get(handlers::get_request));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Serves `router` on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Resolves on CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}
