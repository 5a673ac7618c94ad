use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// POST /api/control/stop: Pause execution. Intents wait in the queue.
pub async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    state.pause_flag.store(true, Ordering::SeqCst);
    tracing::warn!("Execution PAUSED via control API");
    (StatusCode::OK, Json(json!({ "status": "paused" })))
}

/// POST /api/control/resume: Resume execution.
pub async fn resume(State(state): State<AppState>) -> impl IntoResponse {
    state.pause_flag.store(false, Ordering::SeqCst);
    tracing::info!("Execution RESUMED via control API");
    (StatusCode::OK, Json(json!({ "status": "running" })))
}

/// GET /api/control/status: Current system status.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let mode = if state.config.live_trading() { "live" } else { "dry_run" };
    let halted = state.dispatcher.as_ref().is_some_and(|d| d.is_halted());

    Json(json!({
        "mode": mode,
        "paused": state.is_paused(),
        "halted": halted,
        "watched_entities": state.registry.entity_count(),
        "guard_entries": state.guard.len(),
    }))
}
