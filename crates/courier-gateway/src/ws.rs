// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket transport — turns sockets into fan-out subscribers.
//!
//! # Handshake
//!
//! The first frame must be `{"id", "method": "auth", "params": {"token"}}`
//! within five seconds; anything else closes the socket.  Browsers are
//! additionally gated by an Origin allow-list (native clients send no
//! Origin header and pass).
//!
//! After auth the connection is registered with the fan-out: outbound
//! frames come from the subscriber queue (already batched and
//! backpressure-managed), inbound text frames are RPC requests answered
//! in place.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::rpc::{self, ClientState, RpcState};
use crate::token::GatewayToken;

/// Auth must arrive within this window.
const AUTH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct GatewayState {
    pub rpc: RpcState,
    pub token: GatewayToken,
    pub allowed_origins: Vec<String>,
    pub started_at: std::time::Instant,
    pub tls: bool,
}

/// HTTP handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    // Native clients send no Origin; browsers must be on the allow-list.
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        if !state.allowed_origins.iter().any(|o| o == origin) {
            warn!(origin, "rejecting browser connection from unknown origin");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// HTTP handler for `GET /health`.
pub async fn health_handler(State(state): State<Arc<GatewayState>>) -> Response {
    axum::Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "tls": state.tls,
    }))
    .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<GatewayState>) {
    // ── Auth handshake ───────────────────────────────────────────────────────
    let auth = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await;
    let auth_frame = match auth {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            debug!("socket closed before auth");
            return;
        }
        Err(_) => {
            debug!("auth timeout, closing socket");
            let _ = socket
                .send(Message::Text(
                    json!({"error": "authentication timeout"}).to_string(),
                ))
                .await;
            return;
        }
    };

    let request: Value = match serde_json::from_str(&auth_frame) {
        Ok(v) => v,
        Err(_) => {
            let _ = socket
                .send(Message::Text(json!({"error": "invalid JSON"}).to_string()))
                .await;
            return;
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let provided = request
        .pointer("/params/token")
        .and_then(|t| t.as_str())
        .unwrap_or("");

    if request.get("method").and_then(|m| m.as_str()) != Some("auth")
        || !state.token.verify(provided)
    {
        warn!("subscriber failed authentication");
        let _ = socket
            .send(Message::Text(
                json!({"id": id, "error": "authentication failed"}).to_string(),
            ))
            .await;
        return;
    }

    let ctx = state.rpc.dispatcher.ctx();
    let active_runs = ctx.registry.get_active_run_keys().await;
    let _ = socket
        .send(Message::Text(
            json!({"id": id, "result": {"ok": true, "activeRuns": active_runs}}).to_string(),
        ))
        .await;

    // ── Registered subscriber loop ───────────────────────────────────────────
    let mut sub = ctx.bus.register().await;
    let sub_id = sub.shared.id;
    let mut client = ClientState::default();
    info!(subscriber = sub_id, "client authenticated");

    // Connect-time status for immediate rendering.
    let _ = socket
        .send(Message::Text(
            json!({"event": "status.update", "data": {"activeRuns": active_runs}}).to_string(),
        ))
        .await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_request(&state, &sub.shared, &mut client, &text).await;
                        if socket.send(Message::Text(response.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(subscriber = sub_id, "socket recv error: {e}");
                        break;
                    }
                }
            }
            frame = sub.next_frame() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────
    ctx.bus.unregister(sub_id).await;
    for path in client.watch_refs.drain(..) {
        state.rpc.watches.stop(&path);
    }
    info!(subscriber = sub_id, "client disconnected");
}

async fn handle_request(
    state: &GatewayState,
    sub: &Arc<courier_core::fanout::SubscriberShared>,
    client: &mut ClientState,
    text: &str,
) -> Value {
    let request: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return json!({"id": null, "error": format!("invalid JSON: {e}")}),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return json!({"id": id, "error": "missing method"});
    };
    let params = request.get("params").cloned().unwrap_or(json!({}));

    match rpc::dispatch(&state.rpc, sub, client, method, &params).await {
        Ok(result) => json!({"id": id, "result": result}),
        Err(error) => json!({"id": id, "error": error}),
    }
}
