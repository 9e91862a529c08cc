//! Liveness and readiness probes.
//!
//! Readiness is the backbone's single most important external health
//! signal: it gates traffic on both the database and the broker being
//! reachable, each within a one-second deadline.

use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, error, instrument};

use crate::AppState;

const READINESS_DEADLINE: Duration = Duration::from_secs(1);

/// `GET /readyz`
///
/// 200 iff the database ping and the broker connection both pass within
/// the deadline; 500 with a reason otherwise.
#[instrument(name = "readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> Response {
    let database = match tokio::time::timeout(READINESS_DEADLINE, state.outbox.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("database ping failed: {e}")),
        Err(_) => Err("database ping timed out".to_string()),
    };

    let broker = if state.broker.is_connected() {
        Ok(())
    } else {
        Err("broker connection lost".to_string())
    };

    match (database, broker) {
        (Ok(()), Ok(())) => {
            debug!("readiness check passed");
            (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response()
        },
        (database, broker) => {
            let reasons: Vec<String> =
                [database.err(), broker.err()].into_iter().flatten().collect();
            error!(reasons = ?reasons, "readiness check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"status": "not_ready", "reasons": reasons})),
            )
                .into_response()
        },
    }
}

/// `GET /livez`
///
/// Process-alive check with no dependency probing.
#[instrument(name = "liveness", skip(state))]
pub async fn liveness(State(state): State<AppState>) -> Response {
    let _ = &state;
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"}))).into_response()
}
