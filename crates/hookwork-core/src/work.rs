//! Deterministic work executor shared by the sync and async paths.

use std::{fmt, sync::Arc, time::Duration};

use sha2::{Digest, Sha256};

use crate::{
    error::Result,
    models::{WorkInput, WorkResult},
    time::{Clock, RealClock},
};

/// Default artificial compute latency.
pub const DEFAULT_WORK_DELAY: Duration = Duration::from_millis(200);

/// Number of hex characters kept from the SHA-256 digest.
const HASH_PREFIX_LEN: usize = 16;

/// Runs the text computation behind both request modes.
///
/// Every output field except `processing_time_ms` depends only on the input,
/// so a retried callback always carries the same result. The artificial delay
/// is awaited through the injected clock and never blocks the runtime.
#[derive(Clone)]
pub struct WorkExecutor {
    clock: Arc<dyn Clock>,
    delay: Duration,
}

impl fmt::Debug for WorkExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkExecutor").field("delay", &self.delay).finish_non_exhaustive()
    }
}

impl Default for WorkExecutor {
    fn default() -> Self {
        Self::new(Arc::new(RealClock::new()))
    }
}

impl WorkExecutor {
    /// Creates an executor with the default delay.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, delay: DEFAULT_WORK_DELAY }
    }

    /// Overrides the artificial delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Configured artificial delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Validates `input` and computes its result.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the input violates its bounds; no
    /// delay is awaited in that case.
    pub async fn execute(&self, input: &WorkInput) -> Result<WorkResult> {
        input.validate()?;

        let started = self.clock.now();
        if !self.delay.is_zero() {
            self.clock.sleep(self.delay).await;
        }

        let processed_text = transform_case(&input.text, input.count);
        let elapsed = self.clock.now().saturating_duration_since(started);

        Ok(WorkResult {
            input_hash: input_hash(&input.text, input.count),
            word_count: input.text.split_whitespace().count() as u64,
            character_count: input.text.chars().count() as u64,
            processed_text,
            iterations: input.count,
            processing_time_ms: round_ms(elapsed),
        })
    }
}

/// First 16 hex characters of SHA-256 over `"{text}:{count}"`.
pub fn input_hash(text: &str, count: u32) -> String {
    let digest = Sha256::digest(format!("{text}:{count}").as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_PREFIX_LEN);
    hash
}

// Upper on even iterations, lower on odd. Applied step by step since case
// mapping is not an involution outside ASCII.
fn transform_case(text: &str, count: u32) -> String {
    let mut out = text.to_string();
    for i in 0..count {
        out = if i % 2 == 0 { out.to_uppercase() } else { out.to_lowercase() };
    }
    out
}

fn round_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestClock;

    fn executor() -> (WorkExecutor, TestClock) {
        let clock = TestClock::new();
        (WorkExecutor::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn hello_world_three_iterations() {
        let (executor, _) = executor();

        let result = executor.execute(&WorkInput::new("Hello world", 3)).await.unwrap();

        assert_eq!(result.word_count, 2);
        assert_eq!(result.character_count, 11);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.processed_text, "HELLO WORLD");
        assert_eq!(result.input_hash, input_hash("Hello world", 3));
        assert_eq!(result.input_hash.len(), 16);
    }

    #[tokio::test]
    async fn even_count_lowercases() {
        let (executor, _) = executor();

        let result = executor.execute(&WorkInput::new("MiXeD Case", 2)).await.unwrap();

        assert_eq!(result.processed_text, "mixed case");
    }

    #[tokio::test]
    async fn delay_is_awaited_on_the_clock() {
        let (executor, clock) = executor();

        let result = executor.execute(&WorkInput::new("abc", 1)).await.unwrap();

        assert_eq!(clock.sleeps(), vec![DEFAULT_WORK_DELAY]);
        assert!((result.processing_time_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn invalid_input_skips_delay() {
        let (executor, clock) = executor();

        let err = executor.execute(&WorkInput::new("", 1)).await.unwrap_err();

        assert!(err.is_validation());
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn characters_counted_not_bytes() {
        let (executor, _) = executor();

        let result = executor.execute(&WorkInput::new("héllo wörld", 1)).await.unwrap();

        assert_eq!(result.character_count, 11);
    }

    #[test]
    fn hash_depends_on_count() {
        assert_ne!(input_hash("abc", 1), input_hash("abc", 2));
        assert_eq!(input_hash("abc", 1), input_hash("abc", 1));
    }

    #[test]
    fn rounding_keeps_two_decimals() {
        assert!((round_ms(Duration::from_micros(1_234_567)) - 1234.57).abs() < 1e-9);
    }
}
