//! Integration tests for the validation endpoints
//!
//! Drives the axum router directly with in-memory backends. Detached side
//! effects are given a short settling pause before assertion.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use tower::util::ServiceExt; // for `oneshot`

use coordcheck_common::events::EventBus;
use coordcheck_common::model::{Anchor, AnchorKind, DeviceLastPosition, SourceRef};
use coordcheck_common::params::{ConfigRegistry, Settings};
use coordcheck_common::time;
use coordcheck_server::analytics::{AnalyticsStore, MemoryAnalytics};
use coordcheck_server::catalog::{KvCache, MemoryCache};
use coordcheck_server::{build_router, AppState};

struct TestApp {
    state: AppState,
    analytics: Arc<MemoryAnalytics>,
}

fn setup(mutate: impl FnOnce(&mut Settings)) -> TestApp {
    let kv: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
    let analytics = Arc::new(MemoryAnalytics::new());
    let mut settings = Settings::from_env();
    settings.analytics_batch_size = 1;
    settings.analytics_flush_interval_secs = 1;
    mutate(&mut settings);
    let config = Arc::new(ConfigRegistry::new(settings));
    let bus = EventBus::new(64);

    let state = AppState::new(
        kv,
        analytics.clone() as Arc<dyn AnalyticsStore>,
        config,
        bus,
    );
    TestApp { state, analytics }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("should read body");
    serde_json::from_slice(&bytes).expect("should parse JSON")
}

fn report(timestamp: i64) -> Value {
    json!({
        "device_id": "dev-1",
        "latitude": 55.75,
        "longitude": 37.62,
        "accuracy": 20.0,
        "timestamp": timestamp,
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "coordcheck-server");
    assert!(body["version"].is_string());
}

// =============================================================================
// Layered validation verdicts
// =============================================================================

#[tokio::test]
async fn test_future_timestamp_rejected() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(post_json("/validate", report(time::unix_now() + 10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["verdict"], "INVALID");
    assert_eq!(body["confidence"], 0.0);
    assert!(body["reason"]
        .as_str()
        .unwrap()
        .contains("future timestamp"));
}

#[tokio::test]
async fn test_stale_timestamp_rejected() {
    let app = setup(|s| s.max_time_diff_hours = 12);
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(post_json("/validate", report(time::unix_now() - 13 * 3600)))
        .await
        .unwrap();

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["verdict"], "INVALID");
    assert!(body["reason"].as_str().unwrap().contains("too old"));
}

#[tokio::test]
async fn test_impossible_speed_rejected() {
    let app = setup(|_| {});
    let now = time::unix_now();

    app.state
        .catalog
        .put_last_position(
            "dev-1",
            &DeviceLastPosition {
                lat: 55.75,
                lon: 37.62,
                timestamp: now - 60,
                wall_time: time::now(),
            },
        )
        .await
        .unwrap();

    let mut r = report(now);
    r["longitude"] = json!(38.62);

    let router = build_router(app.state.clone());
    let response = router.oneshot(post_json("/validate", r)).await.unwrap();

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["verdict"], "INVALID");
    assert!(body["reason"]
        .as_str()
        .unwrap()
        .contains("impossible speed"));
}

#[tokio::test]
async fn test_bare_report_is_valid_with_full_confidence() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(post_json("/validate", report(time::unix_now())))
        .await
        .unwrap();

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["verdict"], "VALID");
    assert_eq!(body["confidence"], 1.0);
    assert_eq!(body["estimated_accuracy"], 20.0);
}

// =============================================================================
// Side effects
// =============================================================================

#[tokio::test]
async fn test_valid_report_updates_last_known() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());
    let now = time::unix_now();

    router
        .oneshot(post_json("/validate", report(now)))
        .await
        .unwrap();
    settle().await;

    let last = app
        .state
        .catalog
        .get_last_position("dev-1")
        .await
        .unwrap()
        .expect("last position should be written");
    assert_eq!(last.lat, 55.75);
    assert_eq!(last.timestamp, now);
}

#[tokio::test]
async fn test_invalid_report_leaves_no_trace() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());

    let mut r = report(time::unix_now() + 100);
    r["wifi"] = json!([{"bssid": "AA:BB:CC:DD:EE:FF"}]);

    router.oneshot(post_json("/validate", r)).await.unwrap();
    settle().await;

    assert!(app
        .state
        .catalog
        .get_last_position("dev-1")
        .await
        .unwrap()
        .is_none());
    assert!(app
        .state
        .catalog
        .get_anchor(&SourceRef::wifi("aa:bb:cc:dd:ee:ff"))
        .await
        .unwrap()
        .is_none());
    assert!(app.analytics.verdicts().is_empty());
}

#[tokio::test]
async fn test_unknown_wifi_learned_in_background() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());

    let mut r = report(time::unix_now());
    r["wifi"] = json!([{"bssid": "AA:BB:CC:DD:EE:FF", "ssid": "cafe", "rssi": -61}]);

    let response = router.oneshot(post_json("/validate", r)).await.unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["verdict"], "VALID");
    settle().await;

    let anchor = app
        .state
        .catalog
        .get_anchor(&SourceRef::wifi("aa:bb:cc:dd:ee:ff"))
        .await
        .unwrap()
        .expect("anchor should be seeded");
    assert_eq!(anchor.version, 1);
    assert_eq!(anchor.observation_count, 1);
    assert_eq!(anchor.confidence, 0.3);
    assert_eq!(anchor.lat, 55.75);

    // Point stats row emitted for the fresh source
    let stats = app.analytics.point_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].source_id, "aa:bb:cc:dd:ee:ff");
}

#[tokio::test]
async fn test_corroborated_report_records_verdict() {
    let app = setup(|_| {});

    let source = SourceRef::wifi("aa:bb:cc:dd:ee:ff");
    let mut anchor = Anchor::seed(55.75, 37.62, time::now(), AnchorKind::Wifi { ssid: None });
    anchor.confidence = 0.8;
    app.state.catalog.put_anchor(&source, &anchor).await.unwrap();

    let mut r = report(time::unix_now());
    r["wifi"] = json!([{"bssid": "aa:bb:cc:dd:ee:ff"}]);

    let router = build_router(app.state.clone());
    let response = router.oneshot(post_json("/validate", r)).await.unwrap();
    let body = extract_json(response.into_body()).await;

    assert_eq!(body["verdict"], "VALID");
    assert_eq!(body["confidence"], 1.0);
    // Accuracy attenuated by (1 - confidence * 0.5)
    assert_eq!(body["estimated_accuracy"], 10.0);

    // Batch size 1 in tests: the record flushes as soon as it is received
    settle().await;

    let verdicts = app.analytics.verdicts();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].device_id, "dev-1");
    assert!(verdicts[0].has_wifi);
    assert_eq!(verdicts[0].flow_type, "refinement");
}

// =============================================================================
// Batch streaming
// =============================================================================

#[tokio::test]
async fn test_batch_responses_in_report_order() {
    let app = setup(|_| {});
    let router = build_router(app.state.clone());
    let now = time::unix_now();

    let lines = format!(
        "{}\n{}\nnot json at all\n",
        report(now),
        report(now + 100_000) // future: INVALID
    );

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/validate/batch")
                .header("content-type", "application/x-ndjson")
                .body(Body::from(lines))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let rows: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["verdict"], "VALID");
    assert_eq!(rows[1]["verdict"], "INVALID");
    assert!(rows[1]["reason"].as_str().unwrap().contains("future"));
    assert_eq!(rows[2]["verdict"], "INVALID");
    assert!(rows[2]["reason"].as_str().unwrap().contains("malformed"));
}
