use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiResponse;
use crate::errors::AppError;
use crate::models::{CopyTradeConfig, UserId, WalletSubscription};
use crate::services::subscriptions::CopyConfigInput;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub owner_user_id: UserId,
    pub watched_address: String,
    pub chain_id: String,
    #[serde(default)]
    pub config: Option<CopyConfigInput>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: WalletSubscription,
    pub config: Option<CopyTradeConfig>,
}

/// POST /api/subscriptions
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SubscriptionView>>), AppError> {
    let (subscription, config) = state
        .subscriptions
        .subscribe(body.owner_user_id, &body.watched_address, &body.chain_id, body.config)
        .await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(SubscriptionView {
            subscription,
            config,
        }),
    ))
}

/// DELETE /api/subscriptions/:id
pub async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    let changed = state.subscriptions.unsubscribe(id).await?;
    Ok(ApiResponse::ok(changed))
}

/// PUT /api/subscriptions/:id/config
pub async fn upsert_config(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CopyConfigInput>,
) -> Result<Json<ApiResponse<CopyTradeConfig>>, AppError> {
    let config = state.subscriptions.upsert_config(id, body).await?;
    Ok(ApiResponse::ok(config))
}

/// GET /api/users/:user_id/subscriptions
pub async fn list_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<ApiResponse<Vec<SubscriptionView>>>, AppError> {
    let subs = state
        .subscriptions
        .list_subscriptions(user_id)
        .await?
        .into_iter()
        .map(|(subscription, config)| SubscriptionView {
            subscription,
            config,
        })
        .collect();
    Ok(ApiResponse::ok(subs))
}
