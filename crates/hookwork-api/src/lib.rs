//! Hookwork HTTP API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::{Context, Result};
use hookwork_core::{Clock, RequestStore, WorkExecutor};
use hookwork_delivery::{
    CallbackDispatcher, CallbackGuard, DispatcherDeps, HttpTransport, LifecycleDeps,
    RequestLifecycle, SystemResolver,
};

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, create_router_with_timeout, serve, shutdown_signal};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Entry point for every request operation.
    pub lifecycle: RequestLifecycle,
    /// Timestamps and health-check latency.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wraps an already wired lifecycle.
    pub fn new(lifecycle: RequestLifecycle, clock: Arc<dyn Clock>) -> Self {
        Self { lifecycle, clock }
    }

    /// Wires guard, transport, dispatcher and lifecycle from `config`.
    ///
    /// Starts the dispatcher, so it must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or dispatcher cannot be built.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn RequestStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let guard = CallbackGuard::new(config.to_ssrf_policy(), Arc::new(SystemResolver));
        let transport = HttpTransport::new(config.to_client_config())
            .context("failed to build callback client")?;

        let dispatcher = CallbackDispatcher::start(
            config.to_dispatcher_config(),
            config.to_retry_policy(),
            DispatcherDeps {
                store: store.clone(),
                guard: guard.clone(),
                transport: Arc::new(transport),
                clock: clock.clone(),
            },
        )
        .context("failed to start callback dispatcher")?;

        let lifecycle = RequestLifecycle::new(
            LifecycleDeps {
                store,
                executor: WorkExecutor::new(clock.clone()).with_delay(config.work_delay()),
                guard,
                dispatcher: Arc::new(dispatcher),
                clock: clock.clone(),
            },
            config.to_lifecycle_config(),
        );

        Ok(Self::new(lifecycle, clock))
    }
}
