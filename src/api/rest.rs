// =============================================================================
// REST API Endpoints — Axum 0.7 (spec §6)
// =============================================================================
//
// Every endpoint is authenticated via `TenantAuth`; a caller's bearer token
// resolves directly to the `TenantId` it acts on (§1/§6 scope per-tenant
// credential issuance as an external concern, so this crate never brokers
// logins of its own). Only one canonical path per operation is exposed —
// `/api/hft/start`, not duplicated `/update`/`/connect` variants.
//
// CORS is permissive, following the teacher's `api/rest.rs` convention.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::TenantAuth;
use crate::config::EngineConfig;
use crate::engine_manager::EngineManager;
use crate::errors::EngineError;
use crate::types::Symbol;

const MAX_LOG_LIMIT: usize = 500;

pub fn router(manager: Arc<EngineManager>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/hft/start", post(start_hft))
        .route("/api/hft/stop", post(stop_hft))
        .route("/api/hft/status", get(hft_status))
        .route("/api/hft/logs", get(hft_logs))
        .route("/api/auto-trade/toggle", post(auto_trade_toggle))
        .route("/api/research/run", post(research_run))
        .route("/api/engine/config", post(upsert_engine_config))
        .route("/ws", get(crate::api::ws::user_ws_handler))
        .route("/ws/admin", get(crate::api::ws::admin_ws_handler))
        .layer(cors)
        .with_state(manager)
}

/// Maps an `EngineError` onto the `{error: string}` HTTP shape (spec §6):
/// 400 for validation/registry-state problems, 401 for auth, 500 for
/// anything the control plane can't attribute to caller input.
fn error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        EngineError::Validation(_) | EngineError::NotFound(_) | EngineError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
        EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
        EngineError::Exchange { .. } | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

// =============================================================================
// /api/hft/start, /api/hft/stop
// =============================================================================

async fn start_hft(TenantAuth(tenant): TenantAuth, State(manager): State<Arc<EngineManager>>) -> impl IntoResponse {
    match manager.start_hft(&tenant, None) {
        Ok(()) => (StatusCode::OK, Json(json!({ "running": true }))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stop_hft(TenantAuth(tenant): TenantAuth, State(manager): State<Arc<EngineManager>>) -> impl IntoResponse {
    // Idempotent per spec §6 — stopping an already-stopped or nonexistent
    // engine is still a 200, not an error.
    if manager.stop_hft(&tenant).await.is_err() {
        warn!(tenant = %tenant, "stop_hft called with no engine registered");
    }
    (StatusCode::OK, Json(json!({ "running": false })))
}

// =============================================================================
// /api/hft/status
// =============================================================================

#[derive(Serialize)]
struct HftStatusResponse {
    running: bool,
    has_engine: bool,
    engine_status: Option<EngineStatusView>,
}

#[derive(Serialize)]
struct EngineStatusView {
    symbol: Symbol,
    config: EngineConfig,
    inventory: Decimal,
    balance: Decimal,
    auto_trade_enabled: bool,
}

async fn hft_status(TenantAuth(tenant): TenantAuth, State(manager): State<Arc<EngineManager>>) -> impl IntoResponse {
    match manager.get_engine(&tenant) {
        Ok(engine) => {
            let config = engine.config();
            let status = HftStatusResponse {
                running: engine.is_hft_running(),
                has_engine: true,
                engine_status: Some(EngineStatusView {
                    symbol: config.symbol.clone(),
                    config,
                    inventory: engine.inventory(),
                    balance: engine.balance(),
                    auto_trade_enabled: engine.auto_trade_enabled(),
                }),
            };
            (StatusCode::OK, Json(status)).into_response()
        }
        Err(_) => {
            let status = HftStatusResponse { running: false, has_engine: false, engine_status: None };
            (StatusCode::OK, Json(status)).into_response()
        }
    }
}

// =============================================================================
// /api/hft/logs
// =============================================================================

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn hft_logs(TenantAuth(tenant): TenantAuth, State(manager): State<Arc<EngineManager>>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).min(MAX_LOG_LIMIT);

    match manager.get_engine(&tenant) {
        Ok(engine) => {
            let logs = engine.datastore().get_hft_execution_logs(&tenant, limit).await;
            (StatusCode::OK, Json(logs)).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

// =============================================================================
// /api/auto-trade/toggle
// =============================================================================

#[derive(Deserialize)]
struct AutoTradeToggleRequest {
    enabled: bool,
}

async fn auto_trade_toggle(
    TenantAuth(tenant): TenantAuth,
    State(manager): State<Arc<EngineManager>>,
    Json(req): Json<AutoTradeToggleRequest>,
) -> impl IntoResponse {
    let result = if req.enabled { manager.start_auto_trade(&tenant) } else { manager.stop_auto_trade(&tenant) };
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "enabled": req.enabled }))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// =============================================================================
// /api/research/run
// =============================================================================

#[derive(Deserialize)]
struct ResearchRunRequest {
    symbol: String,
}

async fn research_run(
    TenantAuth(tenant): TenantAuth,
    State(manager): State<Arc<EngineManager>>,
    Json(req): Json<ResearchRunRequest>,
) -> impl IntoResponse {
    let symbol = Symbol::new(&req.symbol);
    if symbol.is_empty() {
        return bad_request("symbol must not be empty").into_response();
    }

    let engine = match manager.get_engine(&tenant) {
        Ok(engine) => engine,
        Err(e) => return error_response(e).into_response(),
    };

    let orderbook = match engine.adapter().get_orderbook(&symbol, 20).await {
        Ok(ob) => ob,
        Err(e) => return error_response(e).into_response(),
    };

    let result = manager.research().run(&symbol, &orderbook).await;
    (StatusCode::OK, Json(result)).into_response()
}

// =============================================================================
// /api/engine/config
// =============================================================================

fn default_testnet() -> bool {
    true
}

/// Upsert body (spec §6 "body matches §3"): `EngineConfig`'s own fields,
/// plus credentials that are only consulted when no engine exists yet for
/// this tenant (`EngineManager::createEngine`, spec §4.1).
#[derive(Deserialize)]
struct EngineConfigUpsertRequest {
    #[serde(flatten)]
    config: EngineConfig,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default = "default_testnet")]
    testnet: bool,
}

async fn upsert_engine_config(
    TenantAuth(tenant): TenantAuth,
    State(manager): State<Arc<EngineManager>>,
    Json(req): Json<EngineConfigUpsertRequest>,
) -> impl IntoResponse {
    if let Err(e) = req.config.validate() {
        return error_response(e).into_response();
    }

    match manager.update_config(&tenant, req.config.clone()) {
        Ok(()) => (StatusCode::OK, Json(json!({ "updated": true }))).into_response(),
        Err(EngineError::NotFound(_)) => {
            let (api_key, api_secret) = match (&req.api_key, &req.api_secret) {
                (Some(k), Some(s)) => (k.clone(), s.clone()),
                _ => return bad_request("no engine exists for this tenant yet; api_key and api_secret are required to create one").into_response(),
            };
            match manager.create_engine(tenant, req.config, &api_key, &api_secret, req.testnet, false).await {
                Ok(_) => (StatusCode::OK, Json(json!({ "created": true }))).into_response(),
                Err(e) => error_response(e).into_response(),
            }
        }
        Err(e) => error_response(e).into_response(),
    }
}
