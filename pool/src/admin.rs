//! Admin HTTP/JSON surface (§6): `xdag_poolConfig`, `xdag_updatePoolConfig`
//! (authenticated), `xdag_getPoolWorkers`, plus the ambient `/health` and
//! `/metrics` endpoints and a small whitelisted static-asset server.
//!
//! Follows `main.rs`'s axum wiring style (`ApiState`, `api_health`,
//! `api_metrics` handlers, `axum::Router::new().route(...).with_state(...)`)
//! trimmed to the named methods this admin surface actually carries.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::context::PoolContext;
use crate::metrics;

/// Files this pool will actually serve out of `./www`. A deliberately small
/// allowlist rather than a general static-file server (§6: "a small number
/// of whitelisted paths").
const WHITELISTED_STATIC_FILES: &[&str] = &["index.html", "style.css", "app.js", "favicon.ico"];

pub fn router(ctx: Arc<PoolContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/xdag_poolConfig", post(pool_config))
        .route("/xdag_updatePoolConfig", post(update_pool_config))
        .route("/xdag_getPoolWorkers", post(get_pool_workers))
        .route("/www/:file", get(static_asset))
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<PoolContext>>) -> Json<serde_json::Value> {
    let redis_ok = {
        let mut conn = ctx.redis_conn().await;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    };
    metrics::set_redis_up(redis_ok);
    Json(json!({ "status": "ok", "redis": redis_ok }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

/// `xdag_poolConfig`: the pool's current, publicly visible ration/threshold
/// configuration. No authentication — a read-only surface.
async fn pool_config(State(ctx): State<Arc<PoolContext>>) -> Json<serde_json::Value> {
    let cfg = ctx.config_snapshot().await;
    Json(json!({
        "reward_mode": match cfg.reward_mode {
            crate::config::RewardMode::Solo => "solo",
            crate::config::RewardMode::Equal => "equal",
        },
        "pool_ration_percent": cfg.pool_ration_percent,
        "fund_ration_percent": cfg.fund_ration_percent,
        "reward_ration_percent": cfg.reward_ration_percent,
        "direct_ration_percent": cfg.direct_ration_percent,
        "payout_threshold": cfg.payout_threshold,
        "payout_interval_secs": cfg.payout_interval_secs,
        "difficulty": cfg.difficulty,
    }))
}

#[derive(Debug, Deserialize)]
struct UpdatePoolConfigRequest {
    password: String,
    #[serde(default)]
    pool_ration_percent: Option<f64>,
    #[serde(default)]
    fund_ration_percent: Option<f64>,
    #[serde(default)]
    reward_ration_percent: Option<f64>,
    #[serde(default)]
    direct_ration_percent: Option<f64>,
    #[serde(default)]
    payout_threshold: Option<f64>,
}

/// `xdag_updatePoolConfig`: authenticated with the security password set at
/// startup (§6).
async fn update_pool_config(
    State(ctx): State<Arc<PoolContext>>,
    Json(req): Json<UpdatePoolConfigRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !ctx.check_admin_password(&req.password) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "ok": false, "error": "bad password" })));
    }

    match ctx
        .update_rations(
            req.pool_ration_percent,
            req.fund_ration_percent,
            req.reward_ration_percent,
            req.direct_ration_percent,
            req.payout_threshold,
        )
        .await
    {
        Ok(cfg) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "pool_ration_percent": cfg.pool_ration_percent,
                "fund_ration_percent": cfg.fund_ration_percent,
                "reward_ration_percent": cfg.reward_ration_percent,
                "direct_ration_percent": cfg.direct_ration_percent,
                "payout_threshold": cfg.payout_threshold,
            })),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": e.to_string() }))),
    }
}

/// `xdag_getPoolWorkers`: a snapshot row per live uid.
async fn get_pool_workers(State(ctx): State<Arc<PoolContext>>) -> Json<serde_json::Value> {
    let workers = ctx.sessions.worker_snapshot().await;
    Json(json!({ "ok": true, "workers": workers }))
}

async fn static_asset(Path(file): Path<String>) -> impl IntoResponse {
    if !WHITELISTED_STATIC_FILES.contains(&file.as_str()) {
        return (StatusCode::NOT_FOUND, "not found".to_string()).into_response();
    }
    match tokio::fs::read_to_string(format!("www/{}", file)).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found".to_string()).into_response(),
    }
}
