//! Tests de router en proceso vía `tower::ServiceExt::oneshot`, gateados
//! por `DATABASE_URL` (el estado real requiere pool).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use xyn_persistence::config::DbConfig;
use xyn_persistence::pg::{build_pool, PgPool};
use xyn_server::{build_router, AppState, RuntimeConfig};

static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    let cfg = DbConfig::from_env().ok()?;
    build_pool(&cfg.url, 1, 4).ok()
});

fn test_state(pool: PgPool) -> Arc<AppState> {
    let mut config = RuntimeConfig::from_env();
    config.env_id = format!("router-test-{}", uuid::Uuid::new_v4().simple());
    let state = AppState::new(pool, config);
    xyn_packs::seed_builtin_packs(&state.installs).unwrap();
    state
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

macro_rules! require_pool {
    () => {
        match TEST_POOL.as_ref().cloned() {
            Some(pool) => pool,
            None => {
                eprintln!("skip (no DATABASE_URL)");
                return;
            }
        }
    };
}

#[tokio::test]
async fn health_reports_shape() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let response = app.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());
    assert!(body["now"].is_string());
}

#[tokio::test]
async fn submit_run_inserts_queued_row() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let request = Request::post("/api/v1/runs").header("content-type", "application/json")
                                               .body(Body::from(json!({"name": "s1", "inputs": {}}).to_string()))
                                               .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let run = body_json(response).await;
    assert_eq!(run["status"], "queued");
    assert_eq!(run["attempt"], 0);
    assert!(run["correlation_id"].is_string());

    // GET /runs/{id} devuelve la misma fila.
    let id = run["id"].as_str().unwrap();
    let response = app.oneshot(Request::get(format!("/api/v1/runs/{id}")).body(Body::empty()).unwrap())
                      .await
                      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], run["id"]);
}

#[tokio::test]
async fn unknown_blueprint_is_rejected_eagerly() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let request = Request::post("/api/v1/runs")
        .header("content-type", "application/json")
        .body(Body::from(json!({"name": "x", "blueprint_ref": "no.such", "inputs": {}}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "blueprint_not_found");
}

#[tokio::test]
async fn missing_run_is_404() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let response = app.oneshot(Request::get(format!("/api/v1/runs/{}", uuid::Uuid::new_v4()))
                                   .body(Body::empty())
                                   .unwrap())
                      .await
                      .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_is_idempotent_over_http() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let request = Request::post("/api/v1/runs").header("content-type", "application/json")
                                               .body(Body::from(json!({"name": "to-cancel", "inputs": {}}).to_string()))
                                               .unwrap();
    let run = body_json(app.clone().oneshot(request).await.unwrap()).await;
    let id = run["id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = app.clone()
                          .oneshot(Request::post(format!("/api/v1/runs/{id}/cancel")).body(Body::empty()).unwrap())
                          .await
                          .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cancelled = body_json(response).await;
        assert_eq!(cancelled["status"], "cancelled");
        assert!(cancelled["completed_at"].is_string());
    }
}

#[tokio::test]
async fn concurrent_installs_produce_one_winner_and_one_409() {
    let pool = require_pool!();
    let state = test_state(pool);
    let app = build_router(state);
    let install = || {
        app.clone()
           .oneshot(Request::post("/api/v1/packs/test.locking@v1/install").body(Body::empty()).unwrap())
    };
    let (a, b) = tokio::join!(install(), install());
    let (a, b) = (a.unwrap(), b.unwrap());
    let statuses = [a.status(), b.status()];
    assert!(statuses.contains(&StatusCode::CREATED), "{statuses:?}");
    assert!(statuses.contains(&StatusCode::CONFLICT), "{statuses:?}");

    let conflict = if a.status() == StatusCode::CONFLICT { a } else { b };
    let body = body_json(conflict).await;
    assert_eq!(body["detail"]["error"], "installation_in_progress");
    assert!(body["detail"]["existing_installation_id"].is_string());
}

#[tokio::test]
async fn pack_status_reports_available_when_not_installed() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let response = app.oneshot(Request::get("/api/v1/packs/core.domain@v1/status").body(Body::empty()).unwrap())
                      .await
                      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "available");
    assert!(body["installation"].is_null());
}

#[tokio::test]
async fn unknown_pack_install_is_404() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let response = app.oneshot(Request::post("/api/v1/packs/ghost.pack@v9/install").body(Body::empty()).unwrap())
                      .await
                      .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_exposition_has_prometheus_content_type() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let response = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap().to_string();
    assert_eq!(content_type, "text/plain; version=0.0.4");
}

#[tokio::test]
async fn events_pagination_round_trips_cursor() {
    let pool = require_pool!();
    let app = build_router(test_state(pool));
    let correlation = uuid::Uuid::new_v4();
    for n in 0..4 {
        let request = Request::post("/api/v1/events")
            .header("content-type", "application/json")
            .body(Body::from(json!({"event_name": "xyn.test.page",
                                    "data": {"n": n},
                                    "correlation_id": correlation})
                                 .to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let url = format!("/api/v1/events?correlation_id={correlation}&limit=3");
    let first = body_json(app.clone().oneshot(Request::get(&url).body(Body::empty()).unwrap()).await.unwrap()).await;
    assert_eq!(first["items"].as_array().unwrap().len(), 3);
    let cursor = first["next_cursor"].as_str().unwrap().to_string();

    let url = format!("/api/v1/events?correlation_id={correlation}&limit=3&cursor={cursor}");
    let second = body_json(app.oneshot(Request::get(&url).body(Body::empty()).unwrap()).await.unwrap()).await;
    assert_eq!(second["items"].as_array().unwrap().len(), 1);
    assert!(second["next_cursor"].is_null());
}
