//! Router tests driven through `tower::ServiceExt::oneshot`

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use fairplay::api::build_app;
use fairplay::config::ApiConfig;
use fairplay::storage::MemoryStorage;
use fairplay::{EngineConfig, GameEngine};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin";

fn app() -> Router {
    let config = ApiConfig {
        admin_token: Some(ADMIN_TOKEN.to_string()),
        ..ApiConfig::default()
    };
    let engine = Arc::new(GameEngine::new(EngineConfig::default(), Arc::new(MemoryStorage::new())));
    build_app(engine, &config, true)
}

async fn send(app: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let headers: Vec<(&str, &str)> = user.map(|u| ("x-user-id", u)).into_iter().collect();
    send_with(app, method, uri, &headers, body).await
}

async fn admin(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send_with(app, "POST", uri, &[("x-admin-token", ADMIN_TOKEN)], Some(body)).await
}

async fn send_with(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_user(app: &Router, name: &str, balance: u64) -> String {
    let (status, body) = admin(app, "/admin/users", json!({ "username": name, "initial_balance": balance })).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_and_request_id() {
    let app = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "trace-42");
}

#[tokio::test]
async fn test_dice_session_lifecycle() {
    let app = app();
    let user = create_user(&app, "api-player", 1_000).await;

    let (status, session) = send(
        &app,
        "POST",
        "/sessions",
        Some(&user),
        Some(json!({ "game_type": "DICE", "bet_amount": 100, "client_seed": "lucky" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "playing");
    assert!(session.get("server_seed").is_none());
    let id = session["id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "GET", &format!("/sessions/{}/verify", id), Some(&user), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, played) = send(
        &app,
        "POST",
        &format!("/sessions/{}/play", id),
        Some(&user),
        Some(json!({ "action": "roll" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(played["session"]["status"], "resolved");
    assert!(played["session"]["server_seed"].is_string());

    let (status, verification) = send(&app, "GET", &format!("/sessions/{}/verify", id), Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["commitment_valid"], true);
    assert_eq!(verification["outcomes"][0]["matches"], true);

    // Stateless recomputation agrees with the recorded roll
    let (status, recomputed) = send(
        &app,
        "POST",
        "/verify",
        None,
        Some(json!({
            "server_seed": verification["server_seed"],
            "client_seed": "lucky",
            "nonce": 1,
            "params": verification["params"],
            "server_seed_hash": verification["server_seed_hash"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(recomputed["outcome"], played["outcome"]);
    assert_eq!(recomputed["commitment_valid"], true);

    let (status, error) = send(
        &app,
        "POST",
        &format!("/sessions/{}/play", id),
        Some(&user),
        Some(json!({ "action": "roll" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["code"], "INVALID_STATE");

    let (status, events) = send(&app, "GET", &format!("/sessions/{}/events", id), Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events["events"].as_array().unwrap().len(), 3);

    let (status, report) = send(&app, "GET", &format!("/users/{}/reconcile", user), Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["strict"], true);
}

#[tokio::test]
async fn test_caller_identity_is_required_and_scoped() {
    let app = app();
    let owner = create_user(&app, "owner", 1_000).await;
    let other = create_user(&app, "other", 1_000).await;

    let body = json!({ "game_type": "TILES", "bet_amount": 10, "client_seed": "x" });
    let (status, error) = send(&app, "POST", "/sessions", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["code"], "UNAUTHORIZED");

    let (status, _) = send(&app, "POST", "/sessions", Some("not-a-uuid"), Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, session) = send(&app, "POST", "/sessions", Some(&owner), Some(body)).await;
    let id = session["id"].as_str().unwrap();

    let (status, _) = send(&app, "GET", &format!("/sessions/{}", id), Some(&other), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", &format!("/sessions/{}/cancel", id), Some(&other), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", &format!("/users/{}", owner), Some(&other), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, cancelled) = send(&app, "POST", &format!("/sessions/{}/cancel", id), Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
}

#[tokio::test]
async fn test_validation_errors_map_to_4xx() {
    let app = app();
    let user = create_user(&app, "poor", 50).await;

    let (status, error) = send(
        &app,
        "POST",
        "/sessions",
        Some(&user),
        Some(json!({ "game_type": "DICE", "bet_amount": 51, "client_seed": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["error"]["code"], "INSUFFICIENT_BALANCE");
    assert_eq!(error["error"]["details"]["available"], 50);

    let (status, error) = send(
        &app,
        "POST",
        "/sessions",
        Some(&user),
        Some(json!({ "game_type": "DICE", "bet_amount": 0, "client_seed": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["code"], "INVALID_BET");

    let (status, _) = send(&app, "GET", "/sessions/not-an-id", Some(&user), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, error) = admin(&app, "/admin/users", json!({ "username": "POOR", "initial_balance": 1 })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["code"], "USER_EXISTS");
}

#[tokio::test]
async fn test_adjust_and_transaction_history() {
    let app = app();
    let user = create_user(&app, "saver", 100).await;

    let (status, adjusted) = admin(
        &app,
        &format!("/admin/users/{}/adjust", user),
        json!({ "amount": 400, "reason": "deposit" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(adjusted["user"]["balance"], 500);
    assert_eq!(adjusted["transaction"]["type"], "ADJUSTMENT");

    let (status, _) = admin(
        &app,
        &format!("/admin/users/{}/adjust", user),
        json!({ "amount": -501, "reason": "too much" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, page) = send(
        &app,
        "GET",
        &format!("/users/{}/transactions?limit=10", user),
        Some(&user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert!(page.get("next_cursor").is_none());
}

#[tokio::test]
async fn test_metrics_exposed() {
    let app = app();
    let user = create_user(&app, "counted", 1_000).await;
    send(
        &app,
        "POST",
        "/sessions",
        Some(&user),
        Some(json!({ "game_type": "MINESWEEPER", "bet_amount": 10, "client_seed": "m" })),
    )
    .await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("fairplay_sessions_created_total 1"));
    assert!(text.contains("fairplay_wagered_total 10"));
}

#[tokio::test]
async fn test_admin_routes_need_token() {
    let app = app();
    let user = create_user(&app, "guarded", 100).await;
    let uri = format!("/admin/users/{}/adjust", user);
    let body = json!({ "amount": 1_000, "reason": "free money" });

    let (status, error) = send(&app, "POST", &uri, Some(&user), Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["code"], "UNAUTHORIZED");

    let (status, _) = send_with(&app, "POST", &uri, &[("x-admin-token", "guess")], Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Balance routes are gone from the player surface
    let (status, _) = send(&app, "POST", &format!("/users/{}/adjust", user), Some(&user), Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, current) = send(&app, "GET", &format!("/users/{}", user), Some(&user), None).await;
    assert_eq!(current["balance"], 100);
}

#[tokio::test]
async fn test_admin_routes_unmounted_without_token() {
    let engine = Arc::new(GameEngine::new(EngineConfig::default(), Arc::new(MemoryStorage::new())));
    let app = build_app(engine, &ApiConfig::default(), false);

    let (status, _) = send_with(
        &app,
        "POST",
        "/admin/users",
        &[("x-admin-token", ADMIN_TOKEN)],
        Some(json!({ "username": "nobody", "initial_balance": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retried_create_and_play_apply_once() {
    let app = app();
    let user = create_user(&app, "retrier", 1_000).await;
    let body = json!({
        "game_type": "DICE",
        "bet_amount": 100,
        "client_seed": "again",
        "idempotency_key": "order-7",
    });

    let (status, first) = send(&app, "POST", "/sessions", Some(&user), Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = send(&app, "POST", "/sessions", Some(&user), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["id"], second["id"]);

    let (_, account) = send(&app, "GET", &format!("/users/{}", user), Some(&user), None).await;
    assert_eq!(account["balance"], 900);

    let id = first["id"].as_str().unwrap();
    let uri = format!("/sessions/{}/play?expected_nonce=1", id);
    let (status, played) = send(&app, "POST", &uri, Some(&user), Some(json!({ "action": "roll" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, after_first) = send(&app, "GET", &format!("/users/{}", user), Some(&user), None).await;

    let (status, replayed) = send(&app, "POST", &uri, Some(&user), Some(json!({ "action": "roll" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed["outcome"], played["outcome"]);
    assert_eq!(replayed["nonce"], 1);

    let (_, after_repeat) = send(&app, "GET", &format!("/users/{}", user), Some(&user), None).await;
    assert_eq!(after_repeat["balance"], after_first["balance"]);

    let (status, txs) = send(&app, "GET", &format!("/sessions/{}/transactions", id), Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(txs.as_array().unwrap().len(), 2);
}
