//! Request lifecycle orchestration.
//!
//! The sync path computes inline and returns the result. The async path
//! persists the request, acknowledges it, and computes in a tracked
//! background task that hands the result to the dispatcher only after
//! `completed` is durable.

use std::{fmt, sync::Arc, time::Duration};

use hookwork_core::{
    CallbackDelivery, Clock, RequestFilter, RequestId, RequestPage, RequestPatch, RequestStatus,
    RequestStore, WorkExecutor, WorkInput, WorkRequest, WorkResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    dispatcher::{CallbackDispatcher, DispatchJob},
    error::{DeliveryError, SubmitError},
    guard::{CallbackGuard, Verdict},
};

/// Acknowledgement text returned for async submissions.
pub const ASYNC_ACK_MESSAGE: &str = "Request accepted. Result will be sent to callback URL.";

/// Result of a synchronous submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Identifier of the stored request.
    pub request_id: RequestId,
    /// Always `completed`.
    pub status: RequestStatus,
    /// Computed result.
    pub result: WorkResult,
}

/// Acknowledgement of an asynchronous submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncAck {
    /// Identifier echoed in the callback.
    pub request_id: RequestId,
    /// Always `pending`.
    pub status: RequestStatus,
    /// Human-readable note.
    pub message: String,
}

/// Lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Background computations allowed to run at once.
    pub compute_concurrency: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { compute_concurrency: 64 }
    }
}

/// Components the lifecycle drives.
#[derive(Clone)]
pub struct LifecycleDeps {
    /// Durable request records.
    pub store: Arc<dyn RequestStore>,
    /// Computes results.
    pub executor: WorkExecutor,
    /// Vets callback URLs at submission.
    pub guard: CallbackGuard,
    /// Delivers async results.
    pub dispatcher: Arc<CallbackDispatcher>,
    /// Timestamps.
    pub clock: Arc<dyn Clock>,
}

/// Orchestrates sync and async requests end to end.
#[derive(Clone)]
pub struct RequestLifecycle {
    inner: Arc<Inner>,
    tracker: TaskTracker,
}

impl fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("executor", &self.inner.deps.executor)
            .field("background_tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

struct Inner {
    deps: LifecycleDeps,
    compute_permits: Arc<Semaphore>,
}

impl RequestLifecycle {
    /// Creates a lifecycle over the given components.
    pub fn new(deps: LifecycleDeps, config: LifecycleConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                compute_permits: Arc::new(Semaphore::new(config.compute_concurrency.max(1))),
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Computes `input` and returns the result inline.
    ///
    /// The request is persisted through `pending`, `processing`, and
    /// `completed`. Invalid input is rejected before anything is stored.
    ///
    /// # Errors
    ///
    /// - `SubmitError::Validation` for invalid input, nothing persisted
    /// - `SubmitError::Execution` if computation fails; the record is `failed`
    /// - `SubmitError::Store` if a write fails; the record is `failed` when
    ///   the store still accepts that write
    pub async fn submit_sync(&self, input: WorkInput) -> Result<SyncOutcome, SubmitError> {
        input.validate()?;
        let deps = &self.inner.deps;

        let request = WorkRequest::new_sync(input.clone(), deps.clock.now_utc());
        let request_id = request.id;
        deps.store.create(request).await?;
        self.inner.advance(request_id, RequestPatch::processing()).await?;

        match deps.executor.execute(&input).await {
            Ok(result) => {
                let patch = RequestPatch::completed(result.clone(), deps.clock.now_utc());
                self.inner.advance(request_id, patch).await?;
                info!(%request_id, mode = "sync", "request completed");
                Ok(SyncOutcome { request_id, status: RequestStatus::Completed, result })
            },
            Err(e) => {
                let message = e.to_string();
                self.inner.mark_failed(request_id, &message).await;
                Err(SubmitError::Execution(message))
            },
        }
    }

    /// Accepts `input` for background computation and callback delivery.
    ///
    /// Returns once the `pending` record is durable, before computation
    /// starts.
    ///
    /// # Errors
    ///
    /// - `SubmitError::Validation` for invalid input, nothing persisted
    /// - `SubmitError::UnsafeCallback` if the guard rejects the URL or its
    ///   host cannot be resolved, nothing persisted
    /// - `SubmitError::Store` if the initial write fails
    pub async fn submit_async(
        &self,
        input: WorkInput,
        callback_url: String,
    ) -> Result<AsyncAck, SubmitError> {
        input.validate()?;
        let deps = &self.inner.deps;

        match deps.guard.check(&callback_url).await {
            Verdict::Allow { .. } => {},
            Verdict::Deny(reason) | Verdict::Unresolvable(reason) => {
                warn!(callback_url = %callback_url, reason = %reason, "callback url rejected");
                return Err(SubmitError::UnsafeCallback(reason));
            },
        }

        let request =
            WorkRequest::new_async(input.clone(), callback_url.clone(), deps.clock.now_utc());
        let request_id = request.id;
        deps.store.create(request).await?;

        let inner = self.inner.clone();
        let span = info_span!("async_request", %request_id);
        self.tracker.spawn(
            async move {
                let Ok(_permit) = inner.compute_permits.clone().acquire_owned().await else {
                    return;
                };
                inner.process_async(request_id, input, callback_url).await;
            }
            .instrument(span),
        );

        info!(%request_id, mode = "async", "request accepted");
        Ok(AsyncAck {
            request_id,
            status: RequestStatus::Pending,
            message: ASYNC_ACK_MESSAGE.to_string(),
        })
    }

    /// Fetches one request.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown IDs.
    pub async fn get(&self, id: RequestId) -> hookwork_core::Result<WorkRequest> {
        self.inner.deps.store.get(id).await
    }

    /// Lists requests, newest first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for an out-of-range limit.
    pub async fn list(&self, filter: RequestFilter) -> hookwork_core::Result<RequestPage> {
        self.inner.deps.store.list(filter).await
    }

    /// Checks store connectivity.
    ///
    /// # Errors
    ///
    /// Returns the store's error when it is unreachable.
    pub async fn health_check(&self) -> hookwork_core::Result<()> {
        self.inner.deps.store.health_check().await
    }

    /// The dispatcher this lifecycle hands results to.
    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.inner.deps.dispatcher
    }

    /// Waits for background computations, then shuts the dispatcher down.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if computations are still
    /// running after `timeout`, or the dispatcher's shutdown error.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DeliveryError> {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(
                timeout_ms,
                remaining = self.tracker.len(),
                "background computations still running"
            );
            return Err(DeliveryError::ShutdownTimeout { timeout_ms });
        }
        self.inner.deps.dispatcher.shutdown().await
    }
}

impl Inner {
    async fn process_async(&self, request_id: RequestId, input: WorkInput, callback_url: String) {
        let deps = &self.deps;

        if self.advance(request_id, RequestPatch::processing()).await.is_err() {
            return;
        }

        let result = match deps.executor.execute(&input).await {
            Ok(result) => result,
            Err(e) => {
                self.mark_failed(request_id, &e.to_string()).await;
                return;
            },
        };

        let delivery = CallbackDelivery::new();
        let patch = RequestPatch::completed(result.clone(), deps.clock.now_utc())
            .with_delivery(delivery.clone());
        if self.advance(request_id, patch).await.is_err() {
            return;
        }
        info!(mode = "async", "request completed");

        let job = DispatchJob { request_id, callback_url, result, delivery };
        if let Err(e) = deps.dispatcher.dispatch(job).await {
            warn!(error = %e, "callback not queued, left pending for resume");
        }
    }

    // A rejected lifecycle write marks the record `failed` instead of
    // leaving it `pending` or `processing`.
    async fn advance(
        &self,
        request_id: RequestId,
        patch: RequestPatch,
    ) -> hookwork_core::Result<()> {
        match self.deps.store.update(request_id, patch).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.mark_failed(request_id, &format!("failed to persist request state: {e}"))
                    .await;
                Err(e)
            },
        }
    }

    async fn mark_failed(&self, request_id: RequestId, message: &str) {
        error!(%request_id, error = %message, "request failed");
        let patch = RequestPatch::failed(message, self.deps.clock.now_utc());
        if let Err(e) = self.deps.store.update(request_id, patch).await {
            error!(%request_id, error = %e, "failed to mark request failed");
        }
    }
}
