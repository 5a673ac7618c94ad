use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::ApiResponse;
use crate::db::FeedGap;
use crate::errors::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GapsQuery {
    pub limit: Option<i64>,
}

/// GET /api/feeds/gaps: Most recent sequence gaps, newest first.
pub async fn gaps(
    State(state): State<AppState>,
    Query(q): Query<GapsQuery>,
) -> Result<Json<ApiResponse<Vec<FeedGap>>>, AppError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let gaps = state.store.recent_gaps(limit).await?;
    Ok(ApiResponse::ok(gaps))
}
