//! Admin endpoint handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::service::HealthState;

/// Records returned by `/dead-letters` when `limit` is absent.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

/// Returns lifecycle state, in-flight jobs (total and per queue), and uptime.
///
/// Always 200; the `state` field tells draining apart from down.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "in_flight_by_queue": state.shutdown.in_flight_by_queue(),
        "uptime_secs": state.shutdown.uptime().as_secs(),
    }))
}

/// Liveness check -- always 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check -- 200 only while the dispatcher is claiming jobs.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Per-queue job counts from the store.
pub async fn queues_handler(State(state): State<AppState>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            warn!(error = %err, "queue stats unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    limit: Option<usize>,
}

/// Most recent dead-letter records, newest first.
pub async fn dead_letters_handler(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    Json(json!({
        "total": state.dead_letters.total_recorded(),
        "records": state.dead_letters.recent(limit),
    }))
}
