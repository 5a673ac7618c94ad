use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::ApiResponse;
use crate::errors::AppError;
use crate::models::{ExecutionAttempt, Fingerprint};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// GET /api/executions?limit=: Recent execution attempts, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<ExecutionAttempt>>>, AppError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let attempts = state.store.recent_attempts(limit).await?;
    Ok(ApiResponse::ok(attempts))
}

/// GET /api/executions/:fingerprint
pub async fn detail(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<ApiResponse<ExecutionAttempt>>, AppError> {
    let fp = Fingerprint::from_hex(&fingerprint)
        .ok_or_else(|| AppError::BadRequest(format!("invalid fingerprint: {fingerprint}")))?;
    let attempt = state
        .store
        .get_attempt(&fp)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("execution {fp}")))?;
    Ok(ApiResponse::ok(attempt))
}
