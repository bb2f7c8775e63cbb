//! Entity runtime
//!
//! Every entity instance is a single-threaded actor: a tokio task owning a
//! private SQLite connection, a fan-out hub, and at most one pending alarm.
//! Requests arrive over an mpsc channel and are processed strictly in
//! arrival order; the alarm fires under the same serialization.

pub mod registry;
pub mod sockets;
pub mod storage;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::error::Error;
use crate::request::{EntityRequest, EntityResponse};
use crate::Result;
use registry::Peers;
use sockets::SocketHub;

const REQUEST_QUEUE_DEPTH: usize = 256;

/// Everything the runtime injects into an entity at creation.
pub struct EntityContext {
    pub name: String,
    pub conn: Connection,
    pub hub: Arc<SocketHub>,
    pub alarm: AlarmHandle,
    pub peers: Peers,
    pub github_token: Option<String>,
}

impl EntityContext {
    pub fn new(name: impl Into<String>, conn: Connection) -> Self {
        Self {
            name: name.into(),
            conn,
            hub: Arc::new(SocketHub::new()),
            alarm: AlarmHandle::new(),
            peers: Peers::disconnected(),
            github_token: None,
        }
    }

    pub fn with_hub(mut self, hub: Arc<SocketHub>) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_alarm(mut self, alarm: AlarmHandle) -> Self {
        self.alarm = alarm;
        self
    }

    pub fn with_peers(mut self, peers: Peers) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_github_token(mut self, token: Option<String>) -> Self {
        self.github_token = token;
        self
    }
}

/// Handle to the single pending alarm of an entity instance. Scheduling
/// replaces any prior deadline; cancelling removes it.
#[derive(Clone)]
pub struct AlarmHandle {
    inner: Arc<AlarmInner>,
}

struct AlarmInner {
    pending: Mutex<Option<DateTime<Utc>>>,
    changed: Notify,
}

impl AlarmHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AlarmInner {
                pending: Mutex::new(None),
                changed: Notify::new(),
            }),
        }
    }

    pub fn schedule(&self, at: DateTime<Utc>) {
        *self.inner.pending.lock().unwrap() = Some(at);
        self.inner.changed.notify_one();
    }

    pub fn cancel(&self) {
        *self.inner.pending.lock().unwrap() = None;
        self.inner.changed.notify_one();
    }

    pub fn pending(&self) -> Option<DateTime<Utc>> {
        *self.inner.pending.lock().unwrap()
    }

    /// Clear without waking the actor loop; used by the loop itself right
    /// before running the alarm handler so the handler can re-arm.
    fn take(&self) {
        *self.inner.pending.lock().unwrap() = None;
    }

    async fn changed(&self) {
        self.inner.changed.notified().await;
    }
}

impl Default for AlarmHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Behaviour shared by all entity kinds.
#[async_trait]
pub trait Entity: Send + 'static {
    fn kind() -> &'static str
    where
        Self: Sized;

    /// Build the entity, running its idempotent schema bootstrap.
    fn create(ctx: EntityContext) -> Result<Self>
    where
        Self: Sized;

    async fn handle(&mut self, req: EntityRequest) -> Result<EntityResponse>;

    async fn on_alarm(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Envelope {
    req: EntityRequest,
    reply: oneshot::Sender<EntityResponse>,
}

/// Cheap handle to a running entity instance.
#[derive(Clone)]
pub struct EntityHandle {
    tx: mpsc::Sender<Envelope>,
    hub: Arc<SocketHub>,
}

impl EntityHandle {
    pub async fn request(&self, req: EntityRequest) -> EntityResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            req,
            reply: reply_tx,
        };
        if self.tx.send(envelope).await.is_err() {
            return Error::Internal("Entity is no longer running".to_string()).into();
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Error::Internal("Entity dropped the request".to_string()).into())
    }

    pub fn hub(&self) -> Arc<SocketHub> {
        Arc::clone(&self.hub)
    }
}

/// Spawn the actor loop for an entity instance.
pub fn spawn_entity<E: Entity>(
    mut entity: E,
    alarm: AlarmHandle,
    hub: Arc<SocketHub>,
    kind: &'static str,
    name: String,
) -> EntityHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(REQUEST_QUEUE_DEPTH);

    tokio::spawn(async move {
        loop {
            let deadline = alarm.pending();
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(envelope) => {
                        let response = match entity.handle(envelope.req).await {
                            Ok(response) => response,
                            Err(err) => {
                                if err.status() >= 500 {
                                    warn!(kind, name = %name, "Handler error: {}", err);
                                }
                                err.into()
                            }
                        };
                        let _ = envelope.reply.send(response);
                    }
                    None => {
                        debug!(kind, name = %name, "Entity channel closed, stopping");
                        break;
                    }
                },
                _ = alarm.changed() => {
                    // Deadline changed; loop around and re-evaluate.
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    alarm.take();
                    if let Err(err) = entity.on_alarm().await {
                        warn!(kind, name = %name, "Alarm handler error: {}", err);
                    }
                }
            }
        }
    });

    EntityHandle { tx, hub }
}

async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    let Some(at) = deadline else {
        return;
    };
    let remaining = (at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tokio::time::sleep(remaining).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Entity for Echo {
        fn kind() -> &'static str {
            "echo"
        }

        fn create(_ctx: EntityContext) -> Result<Self> {
            Ok(Self)
        }

        async fn handle(&mut self, req: EntityRequest) -> Result<EntityResponse> {
            Ok(EntityResponse::ok(json!({ "path": req.path })))
        }
    }

    #[tokio::test]
    async fn requests_round_trip_through_the_actor() {
        let ctx = EntityContext::new("main", storage::open_in_memory().unwrap());
        let alarm = ctx.alarm.clone();
        let hub = Arc::clone(&ctx.hub);
        let entity = Echo::create(ctx).unwrap();
        let handle = spawn_entity(entity, alarm, hub, "echo", "main".to_string());

        let response = handle
            .request(EntityRequest::new(crate::request::Method::Get, "/ping"))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["path"], "/ping");
    }

    #[tokio::test]
    async fn alarm_schedule_replaces_prior_deadline() {
        let alarm = AlarmHandle::new();
        let first = Utc::now() + chrono::Duration::minutes(5);
        let second = Utc::now() + chrono::Duration::minutes(1);
        alarm.schedule(first);
        alarm.schedule(second);
        assert_eq!(alarm.pending(), Some(second));
        alarm.cancel();
        assert_eq!(alarm.pending(), None);
    }
}
