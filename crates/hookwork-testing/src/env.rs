//! `TestEnv` construction.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookwork_core::{Clock, SqliteRequestStore, TestClock, WorkExecutor};
use hookwork_delivery::{
    CallbackDispatcher, CallbackGuard, CallbackTransport, ClientConfig, DispatcherConfig,
    DispatcherDeps, HttpTransport, LifecycleConfig, LifecycleDeps, RequestLifecycle, RetryPolicy,
    SsrfPolicy, StaticResolver,
};

use crate::{MockServer, TestEnv};

/// Builder for `TestEnv`.
pub struct TestEnvBuilder {
    policy: SsrfPolicy,
    retry_policy: RetryPolicy,
    dispatcher_config: DispatcherConfig,
    client_timeout: Duration,
    work_delay: Duration,
    transport: Option<Arc<dyn CallbackTransport>>,
    resolver: StaticResolver,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            // wiremock listens on 127.0.0.1
            policy: SsrfPolicy::default().allowing_loopback(),
            retry_policy: RetryPolicy::default(),
            dispatcher_config: DispatcherConfig {
                shutdown_timeout: Duration::from_secs(5),
                ..DispatcherConfig::default()
            },
            client_timeout: Duration::from_secs(2),
            work_delay: Duration::ZERO,
            transport: None,
            resolver: StaticResolver::new(),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with test defaults: loopback allowed, no compute
    /// delay, real HTTP transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the SSRF policy.
    #[must_use]
    pub fn policy(mut self, policy: SsrfPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the number of concurrent callback attempts.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.dispatcher_config.worker_count = count;
        self
    }

    /// Sets the per-attempt HTTP timeout.
    #[must_use]
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Sets the virtual compute delay (default: none).
    #[must_use]
    pub fn work_delay(mut self, delay: Duration) -> Self {
        self.work_delay = delay;
        self
    }

    /// Delivers through `transport` instead of real HTTP.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn CallbackTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses a resolver the test keeps a handle to.
    #[must_use]
    pub fn resolver(mut self, resolver: StaticResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Builds the environment and starts the dispatcher.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let store =
            Arc::new(SqliteRequestStore::in_memory().await.context("failed to open test store")?);
        let clock = TestClock::new();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let compute_clock = TestClock::starting_at(clock.now_utc());
        let http_mock = MockServer::start().await;
        let guard = CallbackGuard::new(self.policy, Arc::new(self.resolver.clone()));

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(ClientConfig {
                    timeout: self.client_timeout,
                    ..ClientConfig::default()
                })
                .context("failed to build HTTP transport")?,
            ),
        };

        let dispatcher = Arc::new(
            CallbackDispatcher::start(self.dispatcher_config, self.retry_policy, DispatcherDeps {
                store: store.clone(),
                guard: guard.clone(),
                transport,
                clock: clock_arc.clone(),
            })
            .context("failed to start dispatcher")?,
        );

        let lifecycle = RequestLifecycle::new(
            LifecycleDeps {
                store: store.clone(),
                executor: WorkExecutor::new(Arc::new(compute_clock.clone()))
                    .with_delay(self.work_delay),
                guard,
                dispatcher: dispatcher.clone(),
                clock: clock_arc,
            },
            LifecycleConfig::default(),
        );

        Ok(TestEnv {
            store,
            clock,
            compute_clock,
            resolver: self.resolver,
            http_mock,
            dispatcher,
            lifecycle,
        })
    }
}
