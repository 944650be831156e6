//! Test infrastructure for hookwork.
//!
//! `TestEnv` wires a real lifecycle and dispatcher over an in-memory SQLite
//! store, a virtual `TestClock`, a `StaticResolver`, and a wiremock receiver.
//! Backoff sleeps complete instantly on the virtual clock, so a full
//! five-attempt delivery runs in milliseconds while the recorded sleep
//! schedule stays assertable.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookwork_core::{
    DeliveryStatus, RequestId, RequestStatus, RequestStore, SqliteRequestStore, TestClock,
    WorkRequest,
};
use hookwork_delivery::{CallbackDispatcher, RequestLifecycle, StaticResolver};

pub mod env;
pub mod fixtures;
pub mod transport;

pub use env::TestEnvBuilder;
pub use transport::{ScriptedResponse, ScriptedTransport};
pub use wiremock::MockServer;

/// How often the wait helpers poll the store.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default deadline for the wait helpers.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Fully wired test environment.
pub struct TestEnv {
    /// In-memory request store shared by every component.
    pub store: Arc<SqliteRequestStore>,
    /// Virtual clock driving timestamps and callback backoff.
    pub clock: TestClock,
    /// Virtual clock the work executor sleeps and measures on.
    pub compute_clock: TestClock,
    /// Resolver behind the guard; tests point hostnames at addresses.
    pub resolver: StaticResolver,
    /// HTTP receiver for callbacks.
    pub http_mock: MockServer,
    /// Dispatcher delivering callbacks.
    pub dispatcher: Arc<CallbackDispatcher>,
    /// Lifecycle under test.
    pub lifecycle: RequestLifecycle,
}

impl TestEnv {
    /// Creates an environment with default settings.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Builder for customized environments.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Absolute URL on the mock receiver.
    pub fn callback_url(&self, path: &str) -> String {
        format!("{}{}", self.http_mock.uri(), path)
    }

    /// Polls until the request reaches `status`.
    pub async fn wait_for_status(
        &self,
        id: RequestId,
        status: RequestStatus,
        timeout: Duration,
    ) -> Result<WorkRequest> {
        self.wait_until(id, timeout, |r| r.status == status)
            .await
            .with_context(|| format!("request {id} never reached status '{status}'"))
    }

    /// Polls until the request's callback delivery reaches `status`.
    pub async fn wait_for_delivery(
        &self,
        id: RequestId,
        status: DeliveryStatus,
        timeout: Duration,
    ) -> Result<WorkRequest> {
        self.wait_until(id, timeout, |r| r.delivery.as_ref().is_some_and(|d| d.status == status))
            .await
            .with_context(|| format!("delivery for {id} never reached '{status}'"))
    }

    async fn wait_until(
        &self,
        id: RequestId,
        timeout: Duration,
        done: impl Fn(&WorkRequest) -> bool,
    ) -> Result<WorkRequest> {
        let started = std::time::Instant::now();
        loop {
            match self.store.get(id).await {
                Ok(request) if done(&request) => return Ok(request),
                Ok(_) => {},
                Err(e) => tracing::debug!("request lookup failed: {e}"),
            }

            if started.elapsed() > timeout {
                let current = self.store.get(id).await.context("request not found")?;
                anyhow::bail!(
                    "timed out after {timeout:?}; status '{}', delivery {:?}",
                    current.status,
                    current.delivery
                );
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Backoff waits taken by the dispatcher, in order.
    pub fn backoff_sleeps(&self) -> Vec<Duration> {
        self.clock.sleeps()
    }

    /// Shuts the lifecycle and dispatcher down.
    pub async fn shutdown(&self) -> Result<()> {
        self.lifecycle.shutdown(Duration::from_secs(5)).await.context("shutdown failed")
    }
}
