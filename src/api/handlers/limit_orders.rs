use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use super::ApiResponse;
use crate::errors::AppError;
use crate::models::LimitOrder;
use crate::services::subscriptions::NewLimitOrder;
use crate::AppState;

/// POST /api/limit-orders
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<NewLimitOrder>,
) -> Result<(StatusCode, Json<ApiResponse<LimitOrder>>), AppError> {
    let order = state.subscriptions.place_limit_order(body).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(order)))
}

/// GET /api/limit-orders/:id
pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<LimitOrder>>, AppError> {
    let order = state
        .store
        .get_limit_order(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("limit order {id}")))?;
    Ok(ApiResponse::ok(order))
}

/// POST /api/limit-orders/:id/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<LimitOrder>>, AppError> {
    let order = state.subscriptions.cancel_limit_order(id).await?;
    Ok(ApiResponse::ok(order))
}
