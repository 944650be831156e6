//! Property-based tests for the work executor and the request state machine.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::Utc;
use hookwork_core::{
    models::MAX_DELIVERY_ATTEMPTS, CallbackDelivery, RequestPatch, RequestStatus, TestClock,
    WorkExecutor, WorkInput, WorkRequest, WorkResult,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn sample_result() -> WorkResult {
    WorkResult {
        input_hash: "0000000000000000".to_string(),
        word_count: 1,
        character_count: 1,
        processed_text: "X".to_string(),
        iterations: 1,
        processing_time_ms: 0.0,
    }
}

#[derive(Debug, Clone)]
enum Step {
    Processing,
    Completed,
    Failed,
    Retry,
    Exhausted,
    Sent,
    Unsafe,
    ResetDelivery,
}

fn step_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop::sample::select(vec![
            Step::Processing,
            Step::Completed,
            Step::Failed,
            Step::Retry,
            Step::Exhausted,
            Step::Sent,
            Step::Unsafe,
            Step::ResetDelivery,
        ]),
        1..24,
    )
}

fn patch_for(step: &Step, request: &WorkRequest) -> Option<RequestPatch> {
    let now = Utc::now();
    let mut delivery = request.delivery.clone().unwrap_or_default();
    let patch = match step {
        Step::Processing => RequestPatch::processing(),
        Step::Completed => {
            RequestPatch::completed(sample_result(), now).with_delivery(CallbackDelivery::new())
        },
        Step::Failed => RequestPatch::failed("boom", now),
        Step::Retry => {
            delivery.record_retry("HTTP 500", now).ok()?;
            RequestPatch::delivery(delivery)
        },
        Step::Exhausted => {
            delivery.record_exhausted("HTTP 500").ok()?;
            RequestPatch::delivery(delivery)
        },
        Step::Sent => {
            delivery.record_success(now).ok()?;
            RequestPatch::delivery(delivery)
        },
        Step::Unsafe => {
            delivery.terminate("target became unsafe: loopback").ok()?;
            RequestPatch::delivery(delivery)
        },
        Step::ResetDelivery => RequestPatch::delivery(CallbackDelivery::new()),
    };
    Some(patch)
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Identical input yields identical output apart from timing.
    #[test]
    fn executor_is_deterministic(text in "[a-zA-Z0-9 éß]{1,200}", count in 1u32..=100) {
        let rt = runtime();
        let input = WorkInput::new(text.clone(), count);
        let executor = WorkExecutor::new(Arc::new(TestClock::new()));

        let first = rt.block_on(executor.execute(&input)).unwrap();
        let second = rt.block_on(executor.execute(&input)).unwrap();

        prop_assert!(first.same_output(&second));
        prop_assert_eq!(first.iterations, count);
        prop_assert_eq!(first.character_count, text.chars().count() as u64);
        prop_assert_eq!(first.word_count, text.split_whitespace().count() as u64);
    }

    /// Casing depends only on the parity of the iteration count for ASCII.
    #[test]
    fn ascii_casing_follows_count_parity(text in "[a-zA-Z ]{1,80}", count in 1u32..=100) {
        let rt = runtime();
        let executor = WorkExecutor::new(Arc::new(TestClock::new()));

        let result = rt.block_on(executor.execute(&WorkInput::new(text.clone(), count))).unwrap();

        let expected = if count % 2 == 1 { text.to_uppercase() } else { text.to_lowercase() };
        prop_assert_eq!(result.processed_text, expected);
    }

    /// No sequence of patches regresses the status or reopens a delivery.
    #[test]
    fn lifecycle_is_monotonic(async_mode in any::<bool>(), steps in step_strategy()) {
        let now = Utc::now();
        let input = WorkInput::new("abc", 1);
        let mut request = if async_mode {
            WorkRequest::new_async(input, "https://example.com/hook", now)
        } else {
            WorkRequest::new_sync(input, now)
        };

        for step in &steps {
            let before = request.clone();
            let Some(patch) = patch_for(step, &request) else { continue };

            if request.apply(patch).is_err() {
                prop_assert_eq!(&request, &before);
                continue;
            }

            prop_assert!(request.status.stage() >= before.status.stage());
            prop_assert_eq!(request.result.is_some(), request.status == RequestStatus::Completed);

            if let (Some(old), Some(new)) = (&before.delivery, &request.delivery) {
                if old.is_terminal() {
                    prop_assert_eq!(old, new);
                }
                prop_assert!(new.attempts >= old.attempts);
            }
            if let Some(delivery) = &request.delivery {
                prop_assert!(delivery.attempts <= MAX_DELIVERY_ATTEMPTS);
            }
        }
    }
}
