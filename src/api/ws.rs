// =============================================================================
// WebSocket Handlers — EventBus-backed push (spec §4.10, §6)
// =============================================================================
//
// `/ws?token=…` is the per-tenant user channel; `/ws/admin?token=…` mirrors
// every tenant's events onto one socket. Unlike the teacher's polling
// snapshot-diff loop (`app_state::AppState` recomputed every 500ms), both
// routes here just relay `EngineEvent`s off the `EventBus` broadcast channel
// as they're published — there's no snapshot to diff against. The
// ping/pong/close handling and disconnect cleanup keep the teacher's shape.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::auth::validate_admin_token;
use crate::engine_manager::EngineManager;
use crate::event_bus::EngineEvent;
use crate::types::TenantId;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `/ws` — the token *is* the tenant id, same as the `TenantAuth` HTTP
/// extractor; a WebSocket upgrade request has no room for an `Authorization`
/// header from a browser client, so the token travels as a query parameter
/// instead.
pub async fn user_ws_handler(ws: WebSocketUpgrade, State(manager): State<Arc<EngineManager>>, Query(query): Query<WsQuery>) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if token.is_empty() {
        warn!("user websocket connection rejected: missing token");
        return (axum::http::StatusCode::UNAUTHORIZED, "missing token").into_response();
    }

    let tenant = TenantId::new(token);
    let rx = manager.event_bus().subscribe_user(&tenant);
    info!(tenant = %tenant, "user websocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, rx, Some(tenant))).into_response()
}

/// `/ws/admin` — gated by the same `ADMIN_TOKEN` env var as `AdminAuth`.
pub async fn admin_ws_handler(ws: WebSocketUpgrade, State(manager): State<Arc<EngineManager>>, Query(query): Query<WsQuery>) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_admin_token(&token) {
        warn!("admin websocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "invalid or missing token").into_response();
    }

    let rx = manager.event_bus().subscribe_admin();
    info!("admin websocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, rx, None)).into_response()
}

/// Drives one connection: relay bus events out, handle ping/pong/close in.
/// A lagging receiver (`RecvError::Lagged`) is treated as backpressure
/// eviction (spec §4.10) — the connection is dropped rather than resumed
/// mid-stream.
async fn handle_connection(socket: WebSocket, mut rx: broadcast::Receiver<EngineEvent>, tenant: Option<TenantId>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if let Err(e) = sender.send(Message::Text(json.into())).await {
                                    debug!(error = %e, "websocket send failed — disconnecting");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialize engine event"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket subscriber lagged — evicting");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if let Err(e) = sender.send(Message::Text("pong".into())).await {
                            debug!(error = %e, "failed to send pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        debug!("websocket text message ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("websocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(tenant = ?tenant, "websocket connection closed");
}
