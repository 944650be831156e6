//! Hookwork service.
//!
//! Loads configuration, opens the request store, resumes callbacks left
//! pending by a previous run, and serves the HTTP API until SIGINT or
//! SIGTERM. Shutdown drains HTTP requests first, then background
//! computations and in-flight callbacks.

use std::sync::Arc;

use anyhow::{Context, Result};
use hookwork_api::{create_router_with_timeout, serve, shutdown_signal, AppState, Config};
use hookwork_core::{Clock, RealClock, SqliteRequestStore};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_filter)?;

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        worker_count = config.worker_count,
        allow_loopback_callbacks = config.allow_loopback_callbacks,
        "configuration loaded"
    );
    if config.allow_loopback_callbacks {
        warn!("loopback callbacks are allowed; do not use this setting in production");
    }

    let store = SqliteRequestStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("failed to open request store")?;
    info!("request store ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let state = AppState::from_config(&config, Arc::new(store.clone()), clock)?;
    let lifecycle = state.lifecycle.clone();

    match lifecycle.dispatcher().resume_pending().await {
        Ok(0) => {},
        Ok(resumed) => info!(resumed, "resumed pending callbacks"),
        Err(e) => error!(error = %e, "failed to resume pending callbacks"),
    }

    let addr = config.parse_server_addr()?;
    let router = create_router_with_timeout(state, config.request_timeout());
    if let Err(e) = serve(router, addr, shutdown_signal()).await {
        error!(error = %e, "HTTP server failed");
    }

    if let Err(e) = lifecycle.shutdown(config.shutdown_timeout()).await {
        warn!(error = %e, "unfinished callbacks stay pending until the next start");
    }

    store.pool().close().await;
    info!("hookwork stopped");
    Ok(())
}

fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}
