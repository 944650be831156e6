//! Clock abstraction shared by the work executor and the callback dispatcher.
//!
//! Every time-dependent path (the simulated compute delay, processing-time
//! measurement, timestamps, and retry backoff) goes through `Clock`, so tests
//! can run the whole lifecycle on virtual time.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of monotonic time, wall-clock timestamps, and sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock timestamp for persisted records.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the OS and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// `sleep` advances time instantly and remembers the requested duration, so
/// tests can assert on the exact backoff schedule without waiting for it.
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_utc: start,
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a test clock starting at the given Unix timestamp in seconds.
    pub fn at_unix(secs: i64) -> Self {
        Self::starting_at(Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.base_utc + elapsed
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
