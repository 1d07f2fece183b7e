//! HTTP tests for the pixtag-cp router
//!
//! Tests cover:
//! - Health endpoint (no token required)
//! - Task token checking on POST /
//! - Status codes for task outcomes

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use pixtag_common::api::auth::{now_ms, sign_callback, AuthWindow};
use pixtag_common::db::init_memory_database;
use pixtag_common::results::ResultsStore;
use pixtag_common::schema::{compile, TypeDescription};
use pixtag_cp::fetch::HttpImageFetcher;
use pixtag_cp::model::FakeInvoker;
use pixtag_cp::{build_router, AppState, ClassificationWorker};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt; // for `oneshot` method

const SECRET: i64 = 987654321;

async fn setup_state(shared_secret: i64) -> AppState {
    let description = TypeDescription::from_toml_str(
        r#"
        name = "LabeledImage"
        [enums]
        ImageType = ["silo", "lifestyle", "unknown"]
        [[fields]]
        name = "type"
        type = "ImageType"
        "#,
    )
    .unwrap();
    let pool = init_memory_database().await.unwrap();
    let store = ResultsStore::provision(pool, "labeled_images", compile(&description).unwrap())
        .await
        .unwrap();

    let worker = ClassificationWorker::new(
        Arc::new(HttpImageFetcher::new("pixtag-test", Duration::from_secs(2)).unwrap()),
        Arc::new(FakeInvoker::labeling(json!({ "type": "silo" }))),
        store,
        "Classify.".to_string(),
        Duration::from_secs(10),
    );
    AppState::new(worker, shared_secret, AuthWindow::default())
}

/// Task with no images: succeeds without touching the network
fn empty_task() -> Value {
    json!({
        "offer_id": "offer-1",
        "merchant_id": 1,
        "aggregator_id": 2,
        "title": "Chair",
        "product_type": null,
        "brand": null,
        "image_link": null,
        "additional_image_links": []
    })
}

fn post_task(body: &Value, token: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

#[tokio::test]
async fn test_health_no_token_required() {
    let app = build_router(setup_state(SECRET).await);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["module"], "pixtag-cp");
    assert_eq!(body["model"], "fake");
    assert_eq!(body["results_table"], "labeled_images");
}

#[tokio::test]
async fn test_signed_task_is_processed() {
    let app = build_router(setup_state(SECRET).await);
    let body = empty_task();
    let token = sign_callback(&body, SECRET, now_ms());

    let response = app.oneshot(post_task(&body, Some(token))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let summary = extract_json(response.into_body()).await;
    assert_eq!(summary["offer_id"], "offer-1");
    assert_eq!(summary["rows_written"], 0);
    assert_eq!(summary["images_skipped"], 0);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = build_router(setup_state(SECRET).await);
    let response = app.oneshot(post_task(&empty_task(), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_wrong_secret_and_stale_token_are_unauthorized() {
    let state = setup_state(SECRET).await;
    let body = empty_task();

    let forged = sign_callback(&body, SECRET + 1, now_ms());
    let response = build_router(state.clone())
        .oneshot(post_task(&body, Some(forged)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let stale = sign_callback(&body, SECRET, now_ms() - 10 * 60 * 1000);
    let response = build_router(state)
        .oneshot(post_task(&body, Some(stale)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_tampered_body_is_unauthorized() {
    let app = build_router(setup_state(SECRET).await);
    let body = empty_task();
    let token = sign_callback(&body, SECRET, now_ms());

    let mut tampered = body.clone();
    tampered["title"] = json!("Different chair");
    let response = app.oneshot(post_task(&tampered, Some(token))).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_zero_secret_disables_checking() {
    let app = build_router(setup_state(0).await);
    let response = app.oneshot(post_task(&empty_task(), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_task_is_bad_request() {
    let app = build_router(setup_state(0).await);
    let response = app
        .oneshot(post_task(&json!({ "offer_id": 5 }), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_images_fail_with_bad_gateway() {
    let state = setup_state(0).await;
    let mut body = empty_task();
    // Port 9 (discard) on loopback refuses connections
    body["image_link"] = json!("http://127.0.0.1:9/a.jpg");

    let response = build_router(state.clone())
        .oneshot(post_task(&body, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let error = extract_json(response.into_body()).await;
    assert_eq!(error["error"]["code"], "FETCH_FAILED");

    let health = build_router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health = extract_json(health.into_body()).await;
    assert!(health["last_error"].as_str().unwrap().starts_with("offer-1"));
}
