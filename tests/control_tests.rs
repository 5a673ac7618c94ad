mod common;

use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use copytrade::api::create_router;
use copytrade::AppState;

fn build_test_app() -> (axum::Router, AppState) {
    let state = common::test_state("");
    (create_router(state.clone()), state)
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_control_stop() {
    let (app, state) = build_test_app();

    let resp = app.oneshot(post("/api/control/stop")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "paused");
    assert!(state.pause_flag.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_control_resume() {
    let (app, state) = build_test_app();
    state.pause_flag.store(true, Ordering::SeqCst);

    let resp = app.oneshot(post("/api/control/resume")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "running");
    assert!(!state.pause_flag.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_control_status() {
    let (app, state) = build_test_app();
    state.pause_flag.store(true, Ordering::SeqCst);

    let req = Request::builder()
        .uri("/api/control/status")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["mode"], "dry_run");
    assert_eq!(json["paused"], true);
    assert_eq!(json["halted"], false);
    assert_eq!(json["watched_entities"], 0);
}
