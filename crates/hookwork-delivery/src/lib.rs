//! Request lifecycle and callback delivery.
//!
//! Sync requests are computed inline. Async requests are acknowledged as
//! soon as they are stored, computed in the background, and their results
//! POSTed to the caller's callback URL by the dispatcher.
//!
//! # Architecture
//!
//! 1. **Guard** - callback URLs are checked against an SSRF policy at
//!    submission and again before every attempt
//! 2. **Lifecycle** - persists `pending`, `processing`, `completed` and
//!    hands completed async results to the dispatcher
//! 3. **Dispatcher** - bounded queue, tracked delivery tasks, fixed backoff
//!    of 1, 2, 4, 8, 16 seconds, at most 5 attempts
//! 4. **Transport** - `reqwest` POST without redirects, pinned to the
//!    addresses the guard vetted
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookwork_core::{RealClock, SqliteRequestStore, WorkExecutor, WorkInput};
//! use hookwork_delivery::{
//!     CallbackDispatcher, CallbackGuard, DispatcherConfig, DispatcherDeps, HttpTransport,
//!     LifecycleConfig, LifecycleDeps, RequestLifecycle, RetryPolicy,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(SqliteRequestStore::in_memory().await?);
//! let clock = Arc::new(RealClock::new());
//! let guard = CallbackGuard::default();
//!
//! let dispatcher = Arc::new(CallbackDispatcher::start(
//!     DispatcherConfig::default(),
//!     RetryPolicy::default(),
//!     DispatcherDeps {
//!         store: store.clone(),
//!         guard: guard.clone(),
//!         transport: Arc::new(HttpTransport::with_defaults()?),
//!         clock: clock.clone(),
//!     },
//! )?);
//!
//! let lifecycle = RequestLifecycle::new(
//!     LifecycleDeps {
//!         store,
//!         executor: WorkExecutor::new(clock.clone()),
//!         guard,
//!         dispatcher,
//!         clock,
//!     },
//!     LifecycleConfig::default(),
//! );
//!
//! let ack = lifecycle
//!     .submit_async(WorkInput::new("Hello world", 3), "https://example.com/hook".into())
//!     .await?;
//! println!("accepted {}", ack.request_id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod retry;

pub use client::{CallbackRequest, CallbackTransport, ClientConfig, DeliveryResponse, HttpTransport};
pub use dispatcher::{
    CallbackDispatcher, CallbackPayload, DispatchJob, DispatcherConfig, DispatcherDeps,
    DispatcherStats,
};
pub use error::{DeliveryError, Result, SubmitError};
pub use guard::{
    CallbackGuard, CidrBlock, HostPattern, Resolver, SsrfPolicy, StaticResolver, SystemResolver,
    Verdict,
};
pub use lifecycle::{
    AsyncAck, LifecycleConfig, LifecycleDeps, RequestLifecycle, SyncOutcome, ASYNC_ACK_MESSAGE,
};
pub use retry::{RetryDecision, RetryPolicy};

/// Default number of concurrent callback attempts.
pub const DEFAULT_WORKER_COUNT: usize = 4;
