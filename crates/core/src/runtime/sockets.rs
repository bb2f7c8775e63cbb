//! Per-entity WebSocket fan-out hub
//!
//! The hub is the runtime's source of truth for fan-out membership: the
//! live client set is enumerated at broadcast time, never mirrored into
//! entity state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::runtime::storage::now_rfc3339;

/// Event pushed to subscribed clients, JSON-encoded on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: String,
}

impl SocketEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: now_rfc3339(),
        }
    }
}

struct SocketClient {
    identity: Option<String>,
    tx: mpsc::Sender<String>,
}

/// Fan-out hub for one entity instance. Sockets register with an opaque
/// identity tag used for exclude-sender broadcast.
#[derive(Default)]
pub struct SocketHub {
    clients: RwLock<HashMap<u64, SocketClient>>,
    next_id: AtomicU64,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket's outbound channel; returns the connection id used
    /// to unregister on close.
    pub async fn register(&self, identity: Option<String>, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .write()
            .await
            .insert(id, SocketClient { identity, tx });
        id
    }

    pub async fn unregister(&self, id: u64) {
        self.clients.write().await.remove(&id);
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Identities of currently-connected sockets (deduplicated, unordered).
    pub async fn identities(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut seen: Vec<String> = Vec::new();
        for client in clients.values() {
            if let Some(identity) = &client.identity {
                if !seen.iter().any(|existing| existing == identity) {
                    seen.push(identity.clone());
                }
            }
        }
        seen
    }

    /// Broadcast an event to every live socket, excluding the sender tag
    /// when given. Clients whose channel is gone are dropped from the set.
    pub async fn broadcast(&self, event: &SocketEvent, exclude_identity: Option<&str>) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                debug!("Failed to serialize socket event: {}", err);
                return;
            }
        };

        // Snapshot the live set, send outside the lock.
        let targets: Vec<(u64, mpsc::Sender<String>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, client)| match (exclude_identity, &client.identity) {
                    (Some(excluded), Some(identity)) => identity != excluded,
                    _ => true,
                })
                .map(|(id, client)| (*id, client.tx.clone()))
                .collect()
        };

        let mut dead: Vec<u64> = Vec::new();
        for (id, tx) in targets {
            if tx.send(text.clone()).await.is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dead {
                clients.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_excludes_sender_identity() {
        let hub = SocketHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.register(Some("phoenix".to_string()), tx_a).await;
        hub.register(Some("raven".to_string()), tx_b).await;

        let event = SocketEvent::new("chat", json!({ "message": "hi" }));
        hub.broadcast(&event, Some("phoenix")).await;

        assert!(rx_a.try_recv().is_err());
        let received = rx_b.try_recv().unwrap();
        assert!(received.contains("\"type\":\"chat\""));
    }

    #[tokio::test]
    async fn broadcast_drops_closed_clients() {
        let hub = SocketHub::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        hub.register(Some("ghost".to_string()), tx).await;
        assert_eq!(hub.connection_count().await, 1);

        let event = SocketEvent::new("agent-update", json!({}));
        hub.broadcast(&event, None).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn identities_deduplicate() {
        let hub = SocketHub::new();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);
        hub.register(Some("phoenix".to_string()), tx_a).await;
        hub.register(Some("phoenix".to_string()), tx_b).await;
        assert_eq!(hub.identities().await, vec!["phoenix".to_string()]);
    }
}
