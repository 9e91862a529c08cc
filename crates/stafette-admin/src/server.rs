//! Admin HTTP server: routing, middleware, graceful shutdown.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{handlers, AppState};

/// Builds the admin router.
///
/// Routes:
/// - `POST /admin/outbox/replay?id=<int>`
/// - `POST /admin/outbox/replay-failed?limit=<int>`
/// - `POST /admin/outbox/requeue?id=<int>`
/// - `GET /readyz`, `GET /livez`
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/admin/outbox/replay", post(handlers::replay_one))
        .route("/admin/outbox/replay-failed", post(handlers::replay_failed))
        .route("/admin/outbox/requeue", post(handlers::requeue))
        .route("/readyz", get(handlers::readiness))
        .route("/livez", get(handlers::liveness))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Stamps every response with an `X-Request-Id` for log correlation.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the admin router until `shutdown` fires, then drains in-flight
/// requests.
///
/// # Errors
///
/// Returns `std::io::Error` when the port cannot be bound or the
/// listener fails.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("admin server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use stafette_broker::memory::MemoryBroker;
    use stafette_core::NewEvent;
    use stafette_outbox::{store::mock::MemoryOutboxStore, OutboxStore};

    struct TestEnv {
        store: Arc<MemoryOutboxStore>,
        broker: MemoryBroker,
        router: Router,
    }

    fn test_env() -> TestEnv {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();
        broker.bind_queue("email.received.q", "email.received");

        let state = AppState::new(store.clone(), Arc::new(broker.clone()), 5);
        let router = create_router(state, Duration::from_secs(5));

        TestEnv { store, broker, router }
    }

    async fn failed_event(env: &TestEnv) -> i64 {
        let event = env.store.append(
            NewEvent::new(
                "email",
                Some(1),
                "email.received",
                &serde_json::json!({"email_id": 1}),
            )
            .unwrap(),
        );
        env.store.mark_failed_attempt(event.id, 1).await.unwrap();
        event.id.0
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn replay_republishes_a_failed_event() {
        let env = test_env();
        let id = failed_event(&env).await;

        let (status, body) =
            send(env.router.clone(), post_req(&format!("/admin/outbox/replay?id={id}"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "replayed");
        assert_eq!(env.broker.queue_depth("email.received.q"), 1);
    }

    #[tokio::test]
    async fn replay_without_id_is_a_bad_request() {
        let env = test_env();

        let (status, body) = send(env.router.clone(), post_req("/admin/outbox/replay")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("id"));
    }

    #[tokio::test]
    async fn replay_of_unknown_id_is_a_bad_request() {
        let env = test_env();

        let (status, _) =
            send(env.router.clone(), post_req("/admin/outbox/replay?id=4040")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn replay_surfaces_broker_failure_as_500() {
        let env = test_env();
        let id = failed_event(&env).await;
        env.broker.set_connected(false);

        let (status, _) =
            send(env.router.clone(), post_req(&format!("/admin/outbox/replay?id={id}"))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn replay_failed_reports_the_success_count() {
        let env = test_env();
        failed_event(&env).await;
        failed_event(&env).await;

        let (status, body) =
            send(env.router.clone(), post_req("/admin/outbox/replay-failed?limit=10")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success_count"], 2);
        assert_eq!(body["limit"], 10);
        assert_eq!(env.broker.queue_depth("email.received.q"), 2);
    }

    #[tokio::test]
    async fn requeue_resets_a_failed_event_without_touching_the_broker() {
        let env = test_env();
        let id = failed_event(&env).await;

        // Broker outage: replay would 500, requeue still works.
        env.broker.set_connected(false);

        let (status, body) =
            send(env.router.clone(), post_req(&format!("/admin/outbox/requeue?id={id}"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "requeued");
        assert_eq!(env.broker.queue_depth("email.received.q"), 0);

        // The event is pending again, ready for the next dispatcher tick.
        let snapshot = env.store.event(stafette_core::EventId(id)).unwrap();
        assert_eq!(snapshot.status, stafette_core::EventStatus::Pending);
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn requeue_of_unknown_id_is_a_bad_request() {
        let env = test_env();

        let (status, _) =
            send(env.router.clone(), post_req("/admin/outbox/requeue?id=4040")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requeue_without_id_is_a_bad_request() {
        let env = test_env();

        let (status, body) = send(env.router.clone(), post_req("/admin/outbox/requeue")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("id"));
    }

    #[tokio::test]
    async fn readiness_passes_when_both_dependencies_are_up() {
        let env = test_env();

        let (status, body) = send(env.router.clone(), get_req("/readyz")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn readiness_fails_when_the_broker_is_down() {
        let env = test_env();
        env.broker.set_connected(false);

        let (status, body) = send(env.router.clone(), get_req("/readyz")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "not_ready");
        assert!(body["reasons"][0].as_str().unwrap().contains("broker"));
    }

    #[tokio::test]
    async fn liveness_always_answers() {
        let env = test_env();

        let (status, body) = send(env.router.clone(), get_req("/livez")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let env = test_env();

        let response = env.router.clone().oneshot(get_req("/livez")).await.unwrap();
        assert!(response.headers().contains_key("X-Request-Id"));
    }
}
