//! WebSocket handling for entity subscriptions
//!
//! Sockets register with the target entity's hub (tagged with an agent
//! identity for exclude-sender broadcast) and speak the JSON envelope
//! `{type, payload, timestamp}`. A Coordinator connect implicitly marks
//! the agent active; a disconnect marks it offline.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use coord_core::request::{EntityRequest, Method};
use coord_core::runtime::registry::EntityKind;

use crate::state::AppState;

pub fn upgrade(
    state: AppState,
    kind: EntityKind,
    name: String,
    identity: Option<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, kind, name, identity, socket))
}

async fn handle_socket(
    state: AppState,
    kind: EntityKind,
    name: String,
    identity: Option<String>,
    socket: WebSocket,
) {
    info!(
        kind = kind.as_str(),
        name = %name,
        identity = identity.as_deref().unwrap_or("-"),
        "WebSocket connected"
    );

    if kind == EntityKind::Coordinator {
        if let Some(agent_id) = &identity {
            let req = EntityRequest::new(Method::Post, "/agents")
                .with_body(json!({ "agentId": agent_id, "status": "active" }));
            state.registry().dispatch(kind, &name, req).await;
        }
    }

    let hub = match state.registry().hub(kind, &name).await {
        Ok(hub) => hub,
        Err(err) => {
            warn!("Failed to resolve socket hub: {}", err);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let connection_id = hub.register(identity.clone(), tx.clone()).await;

    // Forward hub broadcasts (and direct replies) out to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                handle_client_message(&state, kind, &name, identity.as_deref(), &text, &tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("WebSocket receive error: {}", err);
                break;
            }
        }
    }

    hub.unregister(connection_id).await;
    send_task.abort();

    if kind == EntityKind::Coordinator {
        if let Some(agent_id) = &identity {
            let req = EntityRequest::new(Method::Post, "/agents")
                .with_body(json!({ "agentId": agent_id, "status": "offline" }));
            state.registry().dispatch(kind, &name, req).await;
        }
    }
    info!(kind = kind.as_str(), name = %name, "WebSocket disconnected");
}

async fn handle_client_message(
    state: &AppState,
    kind: EntityKind,
    name: &str,
    identity: Option<&str>,
    text: &str,
    tx: &mpsc::Sender<String>,
) {
    let envelope: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            debug!("Ignoring malformed socket message: {}", err);
            return;
        }
    };
    let message_type = envelope["type"].as_str().unwrap_or("");
    let payload = envelope["payload"].clone();

    match (kind, message_type) {
        (_, "ping") => {
            reply(tx, "pong", json!({})).await;
        }
        (EntityKind::Coordinator, "chat") => {
            let mut body = if payload.is_object() { payload } else { json!({}) };
            if body["author"].is_null() {
                if let Some(identity) = identity {
                    body["author"] = json!(identity);
                }
            }
            let req = EntityRequest::new(Method::Post, "/chat").with_body(body);
            let response = state.registry().dispatch(kind, name, req).await;
            if !response.is_success() {
                reply(tx, "error", response.body).await;
            }
        }
        (EntityKind::Coordinator, "agent-update") => {
            let mut body = if payload.is_object() { payload } else { json!({}) };
            if body["agentId"].is_null() {
                if let Some(identity) = identity {
                    body["agentId"] = json!(identity);
                }
            }
            let req = EntityRequest::new(Method::Post, "/agents").with_body(body);
            let response = state.registry().dispatch(kind, name, req).await;
            if !response.is_success() {
                reply(tx, "error", response.body).await;
            }
        }
        (EntityKind::Agent, "checkpoint-save") => {
            let req = EntityRequest::new(Method::Post, "/checkpoint").with_body(payload);
            let response = state.registry().dispatch(kind, name, req).await;
            if response.is_success() {
                reply(tx, "ack", json!({ "saved": true })).await;
            } else {
                reply(tx, "error", response.body).await;
            }
        }
        (_, other) => {
            debug!("Ignoring unrecognized socket message type: {}", other);
        }
    }
}

async fn reply(tx: &mpsc::Sender<String>, message_type: &str, payload: Value) {
    let envelope = json!({
        "type": message_type,
        "payload": payload,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let _ = tx.send(envelope.to_string()).await;
}
