//! Callback dispatcher with fixed-table retries.
//!
//! `dispatch` hands a job to a bounded queue and returns. A supervisor task
//! pulls jobs and spawns one tracked delivery task per job, bounded by
//! `max_in_flight`. Each task walks the delivery state machine:
//!
//! 1. re-check the target with the guard (deny terminalizes, no POST);
//! 2. take an attempt permit and POST the payload;
//! 3. persist `sent`, or persist the failure and either sleep for the
//!    backoff or terminalize once the attempt budget is spent.
//!
//! Attempt permits are released before sleeping, so a request waiting out
//! its backoff never occupies an HTTP slot. Every state change is written
//! to the store before the next step.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hookwork_core::{
    CallbackDelivery, Clock, RequestId, RequestMode, RequestPatch, RequestStatus, RequestStore,
    WorkRequest, WorkResult,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, RwLock, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    client::{CallbackRequest, CallbackTransport},
    error::{DeliveryError, ErrorCategory, Result},
    guard::{CallbackGuard, Verdict},
    retry::{RetryDecision, RetryPolicy},
};

/// Dispatcher sizing and shutdown behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Concurrent HTTP attempts across all deliveries.
    pub worker_count: usize,
    /// Concurrent delivery tasks, including those sleeping in backoff.
    pub max_in_flight: usize,
    /// Jobs buffered between `dispatch` and the supervisor.
    pub queue_capacity: usize,
    /// How long `shutdown` waits for in-flight attempts.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            max_in_flight: 256,
            queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Rejects zero sizes.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("worker_count", self.worker_count),
            ("max_in_flight", self.max_in_flight),
            ("queue_capacity", self.queue_capacity),
        ] {
            if value == 0 {
                return Err(DeliveryError::configuration(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Body POSTed to the callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// Request the result belongs to.
    pub request_id: RequestId,
    /// Always `completed`.
    pub status: RequestStatus,
    /// Work result.
    pub result: WorkResult,
    /// When the payload was built.
    pub timestamp: DateTime<Utc>,
}

/// A delivery to perform or resume.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    /// Request being notified.
    pub request_id: RequestId,
    /// Target URL.
    pub callback_url: String,
    /// Result to deliver.
    pub result: WorkResult,
    /// Delivery state to resume from.
    pub delivery: CallbackDelivery,
}

impl DispatchJob {
    /// Builds a job from a stored record.
    ///
    /// Returns `None` unless the record is a completed async request whose
    /// delivery is still pending.
    pub fn from_request(request: &WorkRequest) -> Option<Self> {
        if request.mode != RequestMode::Async || request.status != RequestStatus::Completed {
            return None;
        }
        let delivery = request.delivery.clone().filter(|d| !d.is_terminal())?;

        Some(Self {
            request_id: request.id,
            callback_url: request.callback_url.clone()?,
            result: request.result.clone()?,
            delivery,
        })
    }
}

/// Counters for dispatcher monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Jobs accepted and not yet picked up by the supervisor.
    pub queued: u64,
    /// Delivery tasks currently running, sleeping included.
    pub in_flight: u64,
    /// Deliveries acknowledged with 2xx.
    pub sent: u64,
    /// Individual failed attempts.
    pub attempt_failures: u64,
    /// Deliveries terminalized after exhausting their attempts.
    pub permanent_failures: u64,
    /// Deliveries terminalized because the target became unsafe.
    pub unsafe_rejections: u64,
}

/// Components a dispatcher delivers with.
#[derive(Clone)]
pub struct DispatcherDeps {
    /// Durable delivery state.
    pub store: Arc<dyn RequestStore>,
    /// Re-checks targets before each attempt.
    pub guard: CallbackGuard,
    /// Sends the POSTs.
    pub transport: Arc<dyn CallbackTransport>,
    /// Backoff timing.
    pub clock: Arc<dyn Clock>,
}

/// Delivers completed async results to their callback URLs.
pub struct CallbackDispatcher {
    sender: mpsc::Sender<DispatchJob>,
    inner: Arc<Inner>,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("policy", &self.inner.policy)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

struct Inner {
    store: Arc<dyn RequestStore>,
    guard: CallbackGuard,
    transport: Arc<dyn CallbackTransport>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    attempt_permits: Semaphore,
    stats: RwLock<DispatcherStats>,
}

impl CallbackDispatcher {
    /// Validates the configuration and starts the supervisor task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for invalid sizing or policy.
    pub fn start(
        config: DispatcherConfig,
        policy: RetryPolicy,
        deps: DispatcherDeps,
    ) -> Result<Self> {
        config.validate()?;
        policy.validate()?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let inner = Arc::new(Inner {
            store: deps.store,
            guard: deps.guard,
            transport: deps.transport,
            clock: deps.clock,
            policy,
            attempt_permits: Semaphore::new(config.worker_count),
            stats: RwLock::new(DispatcherStats::default()),
        });
        let cancellation_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let supervisor = tokio::spawn(supervise(
            inner.clone(),
            receiver,
            Arc::new(Semaphore::new(config.max_in_flight)),
            cancellation_token.clone(),
            tracker.clone(),
        ));

        info!(
            worker_count = config.worker_count,
            max_in_flight = config.max_in_flight,
            queue_capacity = config.queue_capacity,
            "callback dispatcher started"
        );

        Ok(Self {
            sender,
            inner,
            cancellation_token,
            tracker,
            supervisor: std::sync::Mutex::new(Some(supervisor)),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Queues a delivery and returns without waiting for it.
    ///
    /// Waits only when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownRequested` once shutdown has begun.
    pub async fn dispatch(&self, job: DispatchJob) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::ShutdownRequested);
        }

        let request_id = job.request_id;
        self.inner.stats.write().await.queued += 1;
        if self.sender.send(job).await.is_err() {
            self.inner.stats.write().await.queued -= 1;
            return Err(DeliveryError::ShutdownRequested);
        }

        debug!(%request_id, "callback queued");
        Ok(())
    }

    /// Re-queues completed async requests whose callback is still pending.
    ///
    /// Deliveries resume at their recorded attempt count; the backoff clock
    /// restarts. Returns the number of jobs queued.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the scan fails, or
    /// `ShutdownRequested` if shutdown begins midway.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.inner.store.pending_deliveries().await?;
        let mut resumed = 0;

        for request in &pending {
            if let Some(job) = DispatchJob::from_request(request) {
                self.dispatch(job).await?;
                resumed += 1;
            }
        }

        if resumed > 0 {
            info!(resumed, "resumed pending callback deliveries");
        }
        Ok(resumed)
    }

    /// Current counters.
    pub async fn stats(&self) -> DispatcherStats {
        self.inner.stats.read().await.clone()
    }

    /// Stops accepting jobs, cancels backoff waits, and waits for in-flight
    /// attempts up to the configured timeout.
    ///
    /// Unfinished deliveries stay `pending` in the store.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if tasks are still running
    /// when the timeout elapses.
    pub async fn shutdown(&self) -> Result<()> {
        info!(timeout_ms = self.shutdown_timeout.as_millis(), "shutting down callback dispatcher");
        self.cancellation_token.cancel();

        let supervisor = self.supervisor.lock().ok().and_then(|mut handle| handle.take());
        let drain = async {
            if let Some(handle) = supervisor {
                if let Err(e) = handle.await {
                    error!(error = %e, "dispatcher supervisor panicked");
                }
            }
            self.tracker.close();
            self.tracker.wait().await;
        };

        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            let timeout_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(timeout_ms, remaining = self.tracker.len(), "dispatcher shutdown timed out");
            return Err(DeliveryError::ShutdownTimeout { timeout_ms });
        }

        info!("callback dispatcher stopped");
        Ok(())
    }
}

async fn supervise(
    inner: Arc<Inner>,
    mut receiver: mpsc::Receiver<DispatchJob>,
    in_flight: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let permit = tokio::select! {
            () = cancellation_token.cancelled() => break,
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            () = cancellation_token.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        {
            let mut stats = inner.stats.write().await;
            stats.queued = stats.queued.saturating_sub(1);
            stats.in_flight += 1;
        }

        let inner = inner.clone();
        let token = cancellation_token.clone();
        let span = info_span!("callback_delivery", request_id = %job.request_id);
        tracker.spawn(
            async move {
                inner.deliver(job, &token).await;
                inner.stats.write().await.in_flight -= 1;
                drop(permit);
            }
            .instrument(span),
        );
    }

    debug!("dispatcher supervisor stopped");
}

impl Inner {
    async fn deliver(&self, job: DispatchJob, cancellation_token: &CancellationToken) {
        let DispatchJob { request_id, callback_url, result, mut delivery } = job;

        let payload = CallbackPayload {
            request_id,
            status: RequestStatus::Completed,
            result,
            timestamp: self.clock.now_utc(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                error!(error = %e, "failed to encode callback payload");
                return;
            },
        };

        while !delivery.is_terminal() {
            if cancellation_token.is_cancelled() {
                info!(attempts = delivery.attempts, "shutdown requested, delivery left pending");
                return;
            }

            if !delivery.has_budget() {
                let reason = DeliveryError::RetriesExhausted {
                    attempts: delivery.attempts,
                    last_error: delivery.last_error.clone().unwrap_or_default(),
                };
                if delivery.terminate(reason.to_string()).is_ok() {
                    self.persist(request_id, &delivery).await;
                }
                return;
            }

            let attempt = delivery.attempts + 1;

            let outcome = match self.guard.check(&callback_url).await {
                Verdict::Deny(reason) => {
                    let err = DeliveryError::unsafe_target(reason);
                    error!(
                        attempt,
                        error = %err,
                        category = %ErrorCategory::from(&err),
                        "callback target rejected"
                    );
                    if delivery.terminate(err.to_string()).is_ok() {
                        self.persist(request_id, &delivery).await;
                    }
                    self.stats.write().await.unsafe_rejections += 1;
                    return;
                },
                Verdict::Unresolvable(reason) => Err(DeliveryError::network(reason)),
                Verdict::Allow { addrs } => {
                    let permit = tokio::select! {
                        () = cancellation_token.cancelled() => None,
                        permit = self.attempt_permits.acquire() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        info!(attempt, "shutdown requested, delivery left pending");
                        return;
                    };

                    let request = CallbackRequest {
                        request_id,
                        url: callback_url.clone(),
                        body: body.clone(),
                        attempt,
                        addrs,
                    };
                    self.attempt(&request).await
                },
            };

            let now = self.clock.now_utc();
            match outcome {
                Ok(()) => {
                    if let Err(e) = delivery.record_success(now) {
                        error!(error = %e, "delivery state rejected success");
                        return;
                    }
                    if !self.persist(request_id, &delivery).await {
                        return;
                    }
                    info!(attempt, "callback delivered");
                    self.stats.write().await.sent += 1;
                },
                Err(err) => {
                    self.stats.write().await.attempt_failures += 1;
                    match self.policy.decide(attempt, &err, now) {
                        RetryDecision::Retry { delay, next_attempt_at } => {
                            warn!(
                                attempt,
                                error = %err,
                                category = %ErrorCategory::from(&err),
                                delay_ms = delay.as_millis(),
                                "callback attempt failed, retrying"
                            );
                            let recorded = delivery.record_retry(err.to_string(), next_attempt_at);
                            if let Err(e) = recorded {
                                error!(error = %e, "delivery state rejected retry");
                                return;
                            }
                            if !self.persist(request_id, &delivery).await {
                                return;
                            }

                            tokio::select! {
                                () = cancellation_token.cancelled() => {
                                    info!(attempt, "shutdown during backoff, left pending");
                                    return;
                                },
                                () = self.clock.sleep(delay) => {},
                            }
                        },
                        RetryDecision::GiveUp { reason } => {
                            error!(attempt, error = %err, "callback delivery failed permanently");
                            if let Err(e) = delivery.record_exhausted(reason) {
                                error!(error = %e, "delivery state rejected exhaustion");
                                return;
                            }
                            if self.persist(request_id, &delivery).await {
                                self.stats.write().await.permanent_failures += 1;
                            }
                        },
                    }
                },
            }
        }
    }

    // Every transport failure counts as an attempt; only the guard and the
    // attempt budget terminalize a delivery.
    async fn attempt(&self, request: &CallbackRequest) -> Result<()> {
        let response = match self.transport.post(request).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => return Err(DeliveryError::network(e.to_string())),
        };
        if response.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::http_status(response.status_code, response.body))
        }
    }

    // A failed write stops the task; the record keeps its last durable state
    // and is picked up again by `resume_pending`.
    async fn persist(&self, request_id: RequestId, delivery: &CallbackDelivery) -> bool {
        match self.store.update(request_id, RequestPatch::delivery(delivery.clone())).await {
            Ok(_) => true,
            Err(e) => {
                error!(%request_id, error = %e, "failed to persist delivery state");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwork_core::WorkInput;

    fn result() -> WorkResult {
        WorkResult {
            input_hash: "abcdabcdabcdabcd".to_string(),
            word_count: 1,
            character_count: 3,
            processed_text: "ABC".to_string(),
            iterations: 1,
            processing_time_ms: 200.0,
        }
    }

    #[test]
    fn config_rejects_zero_sizes() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(DispatcherConfig { worker_count: 0, ..Default::default() }.validate().is_err());
        assert!(DispatcherConfig { queue_capacity: 0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn job_only_built_for_completed_async_with_pending_delivery() {
        let now = Utc::now();
        let mut request =
            WorkRequest::new_async(WorkInput::new("abc", 1), "https://example.com/hook", now);
        assert!(DispatchJob::from_request(&request).is_none());

        request.apply(RequestPatch::processing()).unwrap();
        request
            .apply(RequestPatch::completed(result(), now).with_delivery(CallbackDelivery::new()))
            .unwrap();
        let job = DispatchJob::from_request(&request).unwrap();
        assert_eq!(job.callback_url, "https://example.com/hook");
        assert_eq!(job.delivery.attempts, 0);

        let mut sent = CallbackDelivery::new();
        sent.record_success(now).unwrap();
        request.apply(RequestPatch::delivery(sent)).unwrap();
        assert!(DispatchJob::from_request(&request).is_none());
    }

    #[test]
    fn payload_shape() {
        let payload = CallbackPayload {
            request_id: RequestId::new(),
            status: RequestStatus::Completed,
            result: result(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["status"], "completed");
        assert_eq!(json["request_id"], payload.request_id.to_string());
        assert_eq!(json["result"]["processed_text"], "ABC");
        assert!(json["timestamp"].as_str().is_some());
    }
}
