//! Integration tests for callback retries, re-validation and resume.

#![allow(clippy::unwrap_used)]

use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use hookwork_core::{Clock, DeliveryStatus, RequestStatus, RequestStore, WorkInput};
use hookwork_delivery::{
    CallbackRequest, CallbackTransport, DeliveryError, DeliveryResponse, DispatchJob,
};
use hookwork_testing::{fixtures, ScriptedResponse, ScriptedTransport, TestEnv, DEFAULT_WAIT};
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}

#[tokio::test]
async fn always_failing_receiver_gets_exactly_five_attempts() -> Result<()> {
    let env = TestEnv::new().await?;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&env.http_mock)
        .await;

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 3), env.callback_url("/hook"))
        .await?;

    let record =
        env.wait_for_delivery(ack.request_id, DeliveryStatus::Failed, DEFAULT_WAIT).await?;
    let delivery = record.delivery.unwrap();

    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(delivery.attempts, 5);
    assert_eq!(delivery.last_error.as_deref(), Some("max attempts (5) exhausted: HTTP 500"));
    assert!(delivery.next_attempt_at.is_none());
    assert_eq!(env.backoff_sleeps(), secs(&[1, 2, 4, 8]));

    let stats = env.dispatcher.stats().await;
    assert_eq!(stats.attempt_failures, 5);
    assert_eq!(stats.permanent_failures, 1);

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn success_after_transient_failures_stops_retrying() -> Result<()> {
    let transport = ScriptedTransport::scripted([
        ScriptedResponse::Status(503),
        ScriptedResponse::NetworkError("connection refused".into()),
    ]);
    let env = TestEnv::builder().transport(Arc::new(transport.clone())).build().await?;

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 1), env.callback_url("/hook"))
        .await?;

    let record = env.wait_for_delivery(ack.request_id, DeliveryStatus::Sent, DEFAULT_WAIT).await?;
    let delivery = record.delivery.unwrap();

    assert_eq!(delivery.attempts, 3);
    assert!(delivery.last_error.is_none());
    assert!(delivery.sent_at.is_some());
    assert_eq!(env.backoff_sleeps(), secs(&[1, 2]));

    let attempts: Vec<u32> = transport.requests().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn rebinding_to_private_address_terminalizes_without_another_post() -> Result<()> {
    let transport = ScriptedTransport::always(500);
    let env = TestEnv::builder().transport(Arc::new(transport.clone())).build().await?;
    let public: IpAddr = "93.184.216.34".parse()?;
    env.resolver.set("hooks.example.com", vec![public]);

    let resolver = env.resolver.clone();
    transport.on_attempt(1, move || {
        resolver.set("hooks.example.com", vec!["10.0.0.5".parse().unwrap()]);
    });

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 1), "https://hooks.example.com/cb".into())
        .await?;

    let record =
        env.wait_for_delivery(ack.request_id, DeliveryStatus::Failed, DEFAULT_WAIT).await?;
    let delivery = record.delivery.unwrap();

    assert_eq!(transport.call_count(), 1);
    assert_eq!(delivery.attempts, 1);
    let reason = delivery.last_error.unwrap();
    assert!(reason.starts_with("target became unsafe:"), "unexpected reason: {reason}");
    assert!(reason.contains("10.0.0.0/8"));
    assert_eq!(env.dispatcher.stats().await.unsafe_rejections, 1);

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn vetted_addresses_are_passed_to_the_transport() -> Result<()> {
    let transport = ScriptedTransport::new();
    let env = TestEnv::builder().transport(Arc::new(transport.clone())).build().await?;
    env.resolver.set("hooks.example.com", vec!["93.184.216.34".parse()?]);

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 1), "https://hooks.example.com/cb".into())
        .await?;
    env.wait_for_delivery(ack.request_id, DeliveryStatus::Sent, DEFAULT_WAIT).await?;

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].addrs, vec!["93.184.216.34:443".parse::<std::net::SocketAddr>()?]);

    let payload = fixtures::decode_payload(&requests[0].body)?;
    assert_eq!(payload["request_id"], ack.request_id.to_string());
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["result"]["processed_text"], "HELLO WORLD");

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn host_vanishing_from_dns_counts_as_failed_attempts() -> Result<()> {
    let transport = ScriptedTransport::always(500);
    let env = TestEnv::builder().transport(Arc::new(transport.clone())).build().await?;
    env.resolver.set("hooks.example.com", vec!["93.184.216.34".parse()?]);

    let resolver = env.resolver.clone();
    transport.on_attempt(1, move || resolver.remove("hooks.example.com"));

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 1), "https://hooks.example.com/cb".into())
        .await?;

    let record =
        env.wait_for_delivery(ack.request_id, DeliveryStatus::Failed, DEFAULT_WAIT).await?;
    let delivery = record.delivery.unwrap();

    assert_eq!(transport.call_count(), 1);
    assert_eq!(delivery.attempts, 5);
    let reason = delivery.last_error.unwrap();
    assert!(reason.contains("failed to resolve hooks.example.com"), "unexpected reason: {reason}");

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn resume_pending_redelivers_completed_requests() -> Result<()> {
    let env = TestEnv::new().await?;

    Mock::given(method("POST"))
        .and(path("/resume"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let seeded = fixtures::seed_completed_async(
        env.store.as_ref(),
        &env.callback_url("/resume"),
        env.clock.now_utc(),
    )
    .await?;

    assert_eq!(env.dispatcher.resume_pending().await?, 1);

    let record = env.wait_for_delivery(seeded.id, DeliveryStatus::Sent, DEFAULT_WAIT).await?;
    assert_eq!(record.delivery.unwrap().attempts, 1);
    assert!(env.store.pending_deliveries().await?.is_empty());

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn dispatch_after_shutdown_leaves_delivery_pending() -> Result<()> {
    let transport = ScriptedTransport::new();
    let env = TestEnv::builder().transport(Arc::new(transport.clone())).build().await?;

    let seeded = fixtures::seed_completed_async(
        env.store.as_ref(),
        "https://hooks.example.com/cb",
        env.clock.now_utc(),
    )
    .await?;

    env.dispatcher.shutdown().await?;

    let job = DispatchJob::from_request(&seeded).unwrap();
    let err = env.dispatcher.dispatch(job).await.unwrap_err();
    assert!(matches!(err, DeliveryError::ShutdownRequested));

    let record = env.store.get(seeded.id).await?;
    let delivery = record.delivery.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempts, 0);
    assert_eq!(transport.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_are_delivered_independently() -> Result<()> {
    let env = TestEnv::new().await?;

    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(8)
        .mount(&env.http_mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(502))
        .expect(5)
        .mount(&env.http_mock)
        .await;

    let broken = env
        .lifecycle
        .submit_async(WorkInput::new("slow", 1), env.callback_url("/broken"))
        .await?;

    let mut ids = Vec::new();
    for i in 0..8 {
        let ack = env
            .lifecycle
            .submit_async(WorkInput::new(format!("request {i}"), 2), env.callback_url("/ok"))
            .await?;
        ids.push(ack.request_id);
    }

    for id in ids {
        let record = env.wait_for_delivery(id, DeliveryStatus::Sent, DEFAULT_WAIT).await?;
        assert_eq!(record.delivery.unwrap().attempts, 1);
    }
    let record =
        env.wait_for_delivery(broken.request_id, DeliveryStatus::Failed, DEFAULT_WAIT).await?;
    assert_eq!(record.delivery.unwrap().attempts, 5);

    env.shutdown().await?;
    Ok(())
}

/// Transport that fails every attempt before sending anything.
#[derive(Debug)]
struct MisconfiguredTransport;

#[async_trait]
impl CallbackTransport for MisconfiguredTransport {
    async fn post(
        &self,
        _request: &CallbackRequest,
    ) -> hookwork_delivery::Result<DeliveryResponse> {
        Err(DeliveryError::configuration("client certificate unreadable"))
    }
}

#[tokio::test]
async fn transport_side_errors_use_the_full_attempt_budget() -> Result<()> {
    let env = TestEnv::builder().transport(Arc::new(MisconfiguredTransport)).build().await?;

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 1), env.callback_url("/hook"))
        .await?;

    let record =
        env.wait_for_delivery(ack.request_id, DeliveryStatus::Failed, DEFAULT_WAIT).await?;
    let delivery = record.delivery.unwrap();

    assert_eq!(delivery.attempts, 5);
    let last_error = delivery.last_error.unwrap();
    assert!(last_error.starts_with("max attempts (5) exhausted:"), "{last_error}");
    assert!(last_error.contains("client certificate unreadable"), "{last_error}");
    assert_eq!(env.backoff_sleeps(), secs(&[1, 2, 4, 8]));

    env.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn backoff_waits_are_reported_apart_from_compute_delay() -> Result<()> {
    let transport = ScriptedTransport::scripted([ScriptedResponse::Status(500)]);
    let env = TestEnv::builder()
        .work_delay(Duration::from_secs(1))
        .transport(Arc::new(transport))
        .build()
        .await?;

    let ack = env
        .lifecycle
        .submit_async(WorkInput::new("Hello world", 1), env.callback_url("/hook"))
        .await?;
    let record = env.wait_for_delivery(ack.request_id, DeliveryStatus::Sent, DEFAULT_WAIT).await?;

    let result = record.result.unwrap();
    assert!((result.processing_time_ms - 1000.0).abs() < f64::EPSILON);
    assert_eq!(env.backoff_sleeps(), secs(&[1]));
    assert_eq!(env.compute_clock.sleeps(), secs(&[1]));

    env.shutdown().await?;
    Ok(())
}
