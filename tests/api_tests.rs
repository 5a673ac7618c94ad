mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use copytrade::api::create_router;
use copytrade::db::FeedGap;

const TOKEN: &str = "test-token";

fn build_test_app() -> axum::Router {
    create_router(common::test_state(""))
}

async fn send(app: axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (status, json) = send(build_test_app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_metrics_endpoint_is_public() {
    let app = create_router(common::test_state(TOKEN));
    let resp = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_protected_routes_require_bearer_token() {
    let state = common::test_state(TOKEN);

    let resp = create_router(state.clone())
        .oneshot(get("/api/executions"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/executions")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let resp = create_router(state.clone()).oneshot(wrong).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/api/executions")
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let resp = create_router(state).oneshot(right).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_and_list_subscriptions() {
    let state = common::test_state("");

    let (status, created) = send(
        create_router(state.clone()),
        post_json(
            "/api/subscriptions",
            json!({
                "owner_user_id": 42,
                "watched_address": "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU",
                "chain_id": "solana",
                "config": {
                    "sizing_rule": { "kind": "proportional", "percent": "50" },
                    "per_trade_capital_limit": "2.5",
                    "cooldown_seconds": 30
                }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["owner_user_id"], 42);
    assert_eq!(created["data"]["config"]["max_slippage_bps"], 100);
    assert_eq!(state.registry.entity_count(), 1);

    let (status, listed) = send(create_router(state), get("/api/users/42/subscriptions")).await;
    assert_eq!(status, StatusCode::OK);
    let subs = listed["data"].as_array().unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0]["config"]["cooldown_seconds"], 30);
}

#[tokio::test]
async fn test_invalid_copy_config_is_rejected() {
    let state = common::test_state("");

    let (status, body) = send(
        create_router(state.clone()),
        post_json(
            "/api/subscriptions",
            json!({
                "owner_user_id": 42,
                "watched_address": "leader",
                "chain_id": "solana",
                "config": {
                    "sizing_rule": { "kind": "fixed", "amount": "1" },
                    "per_trade_capital_limit": "5",
                    "max_slippage_bps": 20000
                }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(state.registry.entity_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_removes_watcher() {
    let state = common::test_state("");
    let (_, created) = send(
        create_router(state.clone()),
        post_json(
            "/api/subscriptions",
            json!({
                "owner_user_id": 1,
                "watched_address": "leader",
                "chain_id": "solana",
                "config": {
                    "sizing_rule": { "kind": "fixed", "amount": "1" },
                    "per_trade_capital_limit": "5"
                }
            }),
        ),
    )
    .await;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/api/subscriptions/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(create_router(state.clone()), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], true);
    assert_eq!(state.registry.entity_count(), 0);

    let missing = Request::builder()
        .method("DELETE")
        .uri(format!("/api/subscriptions/{}", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let resp = create_router(state).oneshot(missing).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_limit_order_create_cancel_and_double_cancel() {
    let state = common::test_state("");
    let expiry = Utc::now() + Duration::hours(2);

    let (status, created) = send(
        create_router(state.clone()),
        post_json(
            "/api/limit-orders",
            json!({
                "owner_user_id": 5,
                "chain_id": "solana",
                "instrument": "BONK",
                "side": "sell",
                "trigger_price": "0.00003",
                "amount": "10",
                "expiry": expiry,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["status"], "open");
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, detail) = send(create_router(state.clone()), get(&format!("/api/limit-orders/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["data"]["instrument"], "BONK");

    let cancel = format!("/api/limit-orders/{id}/cancel");
    let (status, cancelled) = send(create_router(state.clone()), post_json(&cancel, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["data"]["status"], "cancelled");
    assert_eq!(state.registry.entity_count(), 0);

    let (status, _) = send(create_router(state), post_json(&cancel, json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_limit_order_with_past_expiry_is_rejected() {
    let (status, _) = send(
        build_test_app(),
        post_json(
            "/api/limit-orders",
            json!({
                "owner_user_id": 5,
                "chain_id": "solana",
                "instrument": "BONK",
                "side": "buy",
                "trigger_price": "1",
                "amount": "1",
                "expiry": Utc::now() - Duration::minutes(1),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_execution_detail_validates_fingerprint() {
    let (status, _) = send(build_test_app(), get("/api/executions/not-hex")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = "a".repeat(64);
    let (status, _) = send(build_test_app(), get(&format!("/api/executions/{unknown}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_feed_gaps_are_listed() {
    let state = common::test_state("");
    state
        .store
        .record_gap(&FeedGap {
            id: Uuid::new_v4(),
            source_id: "wallets".into(),
            expected_seq: 10,
            resumed_seq: 25,
            detected_at: Utc::now(),
        })
        .await
        .unwrap();

    let (status, body) = send(create_router(state), get("/api/feeds/gaps?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    let gaps = body["data"].as_array().unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0]["expected_seq"], 10);
    assert_eq!(gaps[0]["resumed_seq"], 25);
}
