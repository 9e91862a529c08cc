//! Operator replay endpoints.
//!
//! Replay re-enters the pipeline at the broker fan-out point, so every
//! subscriber sees the event again; idempotent handlers absorb the
//! repeat. These routes sit behind the deployment's admin ingress.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::AppState;
use stafette_core::{CoreError, EventId};
use stafette_outbox::ReplayError;

const DEFAULT_REPLAY_FAILED_LIMIT: usize = 100;

/// Query parameters for `POST /admin/outbox/replay`.
#[derive(Debug, Deserialize)]
pub struct ReplayParams {
    /// The outbox event to republish.
    pub id: Option<i64>,
}

/// Query parameters for `POST /admin/outbox/replay-failed`.
#[derive(Debug, Deserialize)]
pub struct ReplayFailedParams {
    /// Maximum number of failed events to replay.
    pub limit: Option<usize>,
}

/// `POST /admin/outbox/replay?id=<int>`
///
/// 200 when replayed, 400 on a missing/unknown id, 500 when the broker
/// refuses the publish.
#[instrument(name = "admin_replay_one", skip(state))]
pub async fn replay_one(
    State(state): State<AppState>,
    Query(params): Query<ReplayParams>,
) -> Response {
    let Some(id) = params.id else {
        return error_response(StatusCode::BAD_REQUEST, "missing required query parameter: id");
    };

    info!(event_id = id, "replay requested");

    match state.replay.replay_one(EventId(id)).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "replayed", "id": id})),
        )
            .into_response(),
        Err(ReplayError::Store(CoreError::NotFound(message))) => {
            warn!(event_id = id, "replay target not found");
            error_response(StatusCode::BAD_REQUEST, &message)
        },
        Err(e) => {
            warn!(event_id = id, error = %e, "replay failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        },
    }
}

/// `POST /admin/outbox/replay-failed?limit=<int>`
///
/// Replays up to `limit` failed events and reports how many succeeded.
#[instrument(name = "admin_replay_failed", skip(state))]
pub async fn replay_failed(
    State(state): State<AppState>,
    Query(params): Query<ReplayFailedParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_REPLAY_FAILED_LIMIT);

    match state.replay.replay_failed(limit).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            warn!(error = %e, "bulk replay failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        },
    }
}

/// `POST /admin/outbox/requeue?id=<int>`
///
/// Resets a failed event to pending so the dispatcher republishes it on
/// its next tick. Unlike replay, this never touches the broker, so it is
/// the recovery path of choice while the broker itself is down.
#[instrument(name = "admin_requeue", skip(state))]
pub async fn requeue(
    State(state): State<AppState>,
    Query(params): Query<ReplayParams>,
) -> Response {
    let Some(id) = params.id else {
        return error_response(StatusCode::BAD_REQUEST, "missing required query parameter: id");
    };

    info!(event_id = id, "requeue requested");

    match state.outbox.requeue_for_replay(EventId(id)).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "requeued", "id": id})),
        )
            .into_response(),
        Err(CoreError::NotFound(message)) => {
            warn!(event_id = id, "requeue target not found");
            error_response(StatusCode::BAD_REQUEST, &message)
        },
        Err(e) => {
            warn!(event_id = id, error = %e, "requeue failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        },
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}
