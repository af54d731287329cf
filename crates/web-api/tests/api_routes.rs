//! Route-level tests for the REST surface.
//!
//! Runs the full router against an engine backed by an empty paper market,
//! so every request goes through the real handlers and error mapping.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use options_guard_core::AppConfig;
use options_guard_gateway::{PaperBroker, PaperMarketData};
use options_guard_manager::types::ChannelKind;
use options_guard_manager::{
    EngineApi, EngineContext, EngineService, InAppFeed, LogChannel, NotificationChannel,
};
use options_guard_web_api::ApiServer;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;
use uuid::Uuid;

// ============================================================================
// Test Fixtures
// ============================================================================

fn create_app() -> Router {
    let (_tx, rx) = watch::channel(AppConfig::default());
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        Arc::new(InAppFeed::new()) as Arc<dyn NotificationChannel>,
        Arc::new(LogChannel::new(ChannelKind::Push)) as Arc<dyn NotificationChannel>,
    ];
    let ctx = EngineContext::new(
        rx,
        Arc::new(PaperMarketData::new()),
        Arc::new(PaperBroker::default()),
        channels,
        None,
    );
    let (service, _worker) = EngineService::start(ctx);
    ApiServer::new(EngineApi::new(service)).router()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn fund(app: &Router, user: &str) {
    let (status, _) = send(
        app,
        Method::PUT,
        &format!("/api/users/{user}/account"),
        Some(json!({ "equity": "50000", "risk_tolerance": "medium" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

fn short_put_request() -> Value {
    json!({
        "ticker": "spy",
        "strategy": "custom",
        "contracts": 2,
        "target_delta": 0.1,
        "legs": [{
            "contract": {
                "symbol": "SPY",
                "expiry": "2099-01-16",
                "strike": "450",
                "right": "put"
            },
            "quantity": -1,
            "entry_price": "3.20"
        }]
    })
}

// ============================================================================
// Accounts
// ============================================================================

#[tokio::test]
async fn test_account_round_trip() {
    let app = create_app();
    fund(&app, "u1").await;

    let (status, body) = send(&app, Method::GET, "/api/users/u1/account", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["risk_tolerance"], "medium");
}

#[tokio::test]
async fn test_unknown_account_is_not_found() {
    let app = create_app();
    let (status, body) = send(&app, Method::GET, "/api/users/ghost/account", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["retryable"], false);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

// ============================================================================
// Positions
// ============================================================================

#[tokio::test]
async fn test_positions_start_empty() {
    let app = create_app();
    let (status, body) = send(&app, Method::GET, "/api/users/u1/positions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_add_position_requires_account() {
    let app = create_app();
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/users/u1/positions",
        Some(short_put_request()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_recheck_without_market_data_reports_data_issue() {
    let app = create_app();
    fund(&app, "u1").await;

    let (status, position) = send(
        &app,
        Method::POST,
        "/api/users/u1/positions",
        Some(short_put_request()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(position["ticker"], "SPY");
    let id = position["id"].as_str().unwrap().to_string();

    let (status, result) = send(&app, Method::POST, &format!("/api/positions/{id}/recheck"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["data_issue"], true);
    assert_eq!(result["status"], "red");

    let (status, history) = send(&app, Method::GET, &format!("/api/positions/{id}/health"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!history.as_array().unwrap().is_empty());

    // no chain was ever cached for SPY
    let (status, health) = send(&app, Method::GET, "/api/data/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["sources"][0]["source"], "SPY");
}

#[tokio::test]
async fn test_unknown_position_is_not_found() {
    let app = create_app();
    let uri = format!("/api/positions/{}", Uuid::new_v4());
    let (status, _) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Plans and entries
// ============================================================================

#[tokio::test]
async fn test_unknown_plan_cannot_be_accepted_or_rejected() {
    let app = create_app();
    let id = Uuid::new_v4();

    let (status, _) = send(&app, Method::POST, &format!("/api/plans/{id}/accept"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/plans/{id}/reject"),
        Some(json!({ "reason": "not now" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::GET, &format!("/api/plans/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_entry_without_market_data_is_retryable() {
    let app = create_app();
    fund(&app, "u1").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/users/u1/entries",
        Some(json!({ "ticker": "SPY" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_regime_starts_normal() {
    let app = create_app();
    let (status, body) = send(&app, Method::GET, "/api/regime", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["regime"], "Normal");
}
