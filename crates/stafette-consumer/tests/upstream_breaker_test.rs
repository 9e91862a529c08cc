//! Circuit breaker against a flaky HTTP upstream.
//!
//! Models the decision-service call made from the email handler: repeated
//! 5xx responses trip the breaker, short-circuited calls map to a
//! conservative "unknown" verdict, and two successful probes after the
//! open timeout close the circuit again.

use std::{sync::Arc, time::Duration};

use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use stafette_consumer::{
    dedup::retry_key, CircuitBreaker, CircuitConfig, CircuitError, CircuitState, MemoryTtlStore,
    RetryCounter, UpstreamClient, UpstreamConfig,
};
use stafette_core::classify;

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "agent-upstream",
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(200),
            half_open_max_requests: 2,
        },
    ))
}

fn upstream(server: &MockServer) -> UpstreamClient {
    UpstreamClient::new(UpstreamConfig::new(server.uri())).expect("client should build")
}

async fn decide(client: &UpstreamClient) -> Result<String, reqwest::Error> {
    let body: serde_json::Value = client
        .post_json("/decide", &serde_json::json!({"email_id": 42, "subject": "invoice overdue"}))
        .await?;

    Ok(body["verdict"].as_str().unwrap_or("unknown").to_string())
}

/// The handler-side shape: breaker-guarded call with a degraded fallback.
async fn decide_with_fallback(
    breaker: &CircuitBreaker,
    client: &UpstreamClient,
) -> Result<String, reqwest::Error> {
    match breaker.execute(|| decide(client)).await {
        Ok(verdict) => Ok(verdict),
        Err(CircuitError::Open(_)) => Ok("unknown".to_string()),
        Err(CircuitError::Inner(e)) => Err(e),
    }
}

#[tokio::test]
async fn repeated_upstream_failures_trip_the_breaker_then_recovery_closes_it() {
    let server = MockServer::start().await;

    // First three calls fail with 500; everything after succeeds.
    Mock::given(method("POST"))
        .and(path("/decide"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/decide"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"verdict": "task"})),
        )
        .mount(&server)
        .await;

    let breaker = breaker();
    let client = upstream(&server);

    // Three consecutive 5xx responses open the circuit.
    for _ in 0..3 {
        let err = breaker.execute(|| decide(&client)).await.unwrap_err();
        match err {
            CircuitError::Inner(inner) => {
                let classified = classify(&anyhow::Error::new(inner));
                assert!(classified.is_retryable());
                assert_eq!(classified.label, "upstream_server_error");
            },
            CircuitError::Open(_) => panic!("circuit opened too early"),
        }
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, calls never reach the wire and the handler degrades to a
    // conservative verdict.
    let verdict = decide_with_fallback(&breaker, &client).await.unwrap();
    assert_eq!(verdict, "unknown");
    assert_eq!(breaker.state(), CircuitState::Open);

    // After the open timeout, two successful probes close the circuit and
    // real verdicts flow again.
    tokio::time::sleep(Duration::from_millis(250)).await;

    for _ in 0..2 {
        let verdict = decide_with_fallback(&breaker, &client).await.unwrap();
        assert_eq!(verdict, "task");
    }
    assert_eq!(breaker.state(), CircuitState::Closed);

    // The 500 mock saw exactly its three calls; the short-circuited call
    // never hit the server.
    server.verify().await;
}

#[tokio::test]
async fn retry_counter_caps_second_chances_with_a_degraded_verdict() {
    let server = MockServer::start().await;

    // The upstream never recovers within this delivery's lifetime.
    Mock::given(method("POST"))
        .and(path("/decide"))
        .respond_with(ResponseTemplate::new(503).set_body_string("still down"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTtlStore::new());
    let counter = RetryCounter::new(store, Duration::from_secs(60));
    let key = retry_key("agent", 42);
    let client = upstream(&server);

    const MAX_ATTEMPTS: i64 = 5;

    // Each redelivery increments the counter before calling upstream; once
    // the ceiling is passed the handler writes the conservative verdict
    // and acknowledges instead of burning further redeliveries.
    let mut verdict = None;
    for _ in 0..=MAX_ATTEMPTS {
        let attempt = counter.increment_and_get(&key).await.unwrap();

        if attempt > MAX_ATTEMPTS {
            verdict = Some("unknown".to_string());
            counter.reset(&key).await;
            break;
        }

        assert!(decide(&client).await.is_err(), "upstream should still be failing");
    }

    assert_eq!(verdict.as_deref(), Some("unknown"));

    // The reset cleared the slate for the next event about this entity.
    assert_eq!(counter.increment_and_get(&key).await.unwrap(), 1);
}

#[tokio::test]
async fn client_errors_do_not_deserve_retries() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/decide"))
        .respond_with(ResponseTemplate::new(422).set_body_string("malformed request"))
        .expect(1)
        .mount(&server)
        .await;

    let client = upstream(&server);
    let err = decide(&client).await.unwrap_err();

    let classified = classify(&anyhow::Error::new(err));
    assert!(!classified.is_retryable());
    assert_eq!(classified.label, "upstream_client_error");
}
