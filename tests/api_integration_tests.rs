//! Integration Tests for API Endpoints
//!
//! Tests full request/response cycle for each endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use sturdy_cache::{
    api::{create_router, RecordSource},
    AppState, CacheOptions, Client, StatsRecorder, TestClock,
};
use tower::ServiceExt;

// == Helper Functions ==

const TTL: Duration = Duration::from_secs(60);

fn create_test_state(clock: &TestClock) -> AppState {
    let stats = Arc::new(StatsRecorder::new());
    let cache = Client::new(
        100,
        4,
        TTL,
        10,
        CacheOptions::new()
            .with_clock(Arc::new(clock.clone()))
            .with_metrics(stats.clone())
            .with_missing_record_storage(),
    )
    .unwrap();
    let source = Arc::new(RecordSource::with_records(Duration::ZERO, 10));
    AppState::new(cache, source, stats)
}

fn create_test_app() -> Router {
    create_router(create_test_state(&TestClock::default()))
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// == GET Endpoint Tests ==

#[tokio::test]
async fn test_get_record_success() {
    let app = create_test_app();

    let response = app.oneshot(get("/records/3")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["id"], "3");
    assert_eq!(json["value"], "record-3");
}

#[tokio::test]
async fn test_get_record_not_found() {
    let app = create_test_app();

    let response = app.oneshot(get("/records/nonexistent")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_to_json(response.into_body()).await;
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn test_repeated_reads_hit_the_cache() {
    let state = create_test_state(&TestClock::default());
    let app = create_router(state.clone());

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/records/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(state.source.calls(), 1);
}

// == BATCH Endpoint Tests ==

#[tokio::test]
async fn test_batch_endpoint() {
    let state = create_test_state(&TestClock::default());
    let app = create_router(state.clone());

    let response = app
        .oneshot(json_request(
            "POST",
            "/records/batch",
            r#"{"ids":["1","2","2","77"]}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["records"]["1"], "record-1");
    assert_eq!(json["records"]["2"], "record-2");
    assert_eq!(json["missing"], serde_json::json!(["77"]));
    assert_eq!(state.source.calls(), 1);
}

#[tokio::test]
async fn test_batch_endpoint_rejects_empty_ids() {
    let app = create_test_app();

    let response = app
        .oneshot(json_request("POST", "/records/batch", r#"{"ids":[]}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// == PUT Endpoint Tests ==

#[tokio::test]
async fn test_write_then_read() {
    let state = create_test_state(&TestClock::default());
    let app = create_router(state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/records",
            r#"{"id":"new","value":"fresh"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert!(json["message"].as_str().unwrap().contains("new"));
    assert_eq!(json["forced_eviction"], false);

    let response = app.oneshot(get("/records/new")).await.unwrap();
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["value"], "fresh");
    assert_eq!(state.source.calls(), 0);
}

#[tokio::test]
async fn test_empty_id_request() {
    let app = create_test_app();

    let response = app
        .oneshot(json_request("PUT", "/records", r#"{"id":"","value":"v"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_json_request() {
    let app = create_test_app();

    let response = app
        .oneshot(json_request("PUT", "/records", "not json"))
        .await
        .unwrap();

    // Axum rejects malformed bodies before the handler runs
    assert!(response.status().is_client_error());
}

// == DELETE Endpoint Tests ==

#[tokio::test]
async fn test_delete_endpoint() {
    let state = create_test_state(&TestClock::default());
    let app = create_router(state.clone());

    app.clone().oneshot(get("/records/1")).await.unwrap();
    let response = Request::builder()
        .method("DELETE")
        .uri("/records/1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(response).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Gone from the source; the miss is now cached
    let response = app.oneshot(get("/records/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(state.source.calls(), 2);
}

#[tokio::test]
async fn test_delete_endpoint_not_found() {
    let app = create_test_app();

    let request = Request::builder()
        .method("DELETE")
        .uri("/records/nonexistent")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// == STATS Endpoint Tests ==

#[tokio::test]
async fn test_stats_endpoint() {
    let app = create_test_app();

    // Miss then hit
    app.clone().oneshot(get("/records/1")).await.unwrap();
    app.clone().oneshot(get("/records/1")).await.unwrap();

    let response = app.oneshot(get("/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["hits"], 1);
    assert_eq!(json["misses"], 1);
    assert_eq!(json["total_entries"], 1);
    assert_eq!(json["source_fetches"], 1);
    assert_eq!(json["num_shards"], 4);
    assert!((json["hit_rate"].as_f64().unwrap() - 0.5).abs() < 0.001);
}

// == HEALTH Endpoint Tests ==

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "healthy");
    assert!(json.get("timestamp").is_some());
}

// == TTL Expiration via API Tests ==

#[tokio::test]
async fn test_ttl_expiration_via_api() {
    let clock = TestClock::default();
    let state = create_test_state(&clock);
    let app = create_router(state.clone());

    app.clone().oneshot(get("/records/5")).await.unwrap();
    assert_eq!(state.source.calls(), 1);

    // Still cached just before expiry
    clock.add(TTL - Duration::from_secs(1));
    app.clone().oneshot(get("/records/5")).await.unwrap();
    assert_eq!(state.source.calls(), 1);

    // Expired entries are refetched
    clock.add(Duration::from_secs(1));
    let response = app.oneshot(get("/records/5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.source.calls(), 2);
}
