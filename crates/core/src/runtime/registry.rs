//! Entity registry: stable-name addressing and lazy instance spawn

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::info;

use crate::agent::AgentState;
use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::gittree::GitTree;
use crate::lock::ResourceLock;
use crate::request::{EntityRequest, EntityResponse};
use crate::runtime::sockets::SocketHub;
use crate::runtime::{spawn_entity, storage, AlarmHandle, Entity, EntityContext, EntityHandle};
use crate::vmpool::VmPool;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Coordinator,
    Agent,
    Lock,
    VmPool,
    GitTree,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Coordinator,
        EntityKind::Agent,
        EntityKind::Lock,
        EntityKind::VmPool,
        EntityKind::GitTree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Agent => "agent",
            Self::Lock => "lock",
            Self::VmPool => "vmpool",
            Self::GitTree => "gittree",
        }
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "agent" => Ok(Self::Agent),
            "lock" => Ok(Self::Lock),
            "vmpool" => Ok(Self::VmPool),
            "gittree" => Ok(Self::GitTree),
            other => Err(Error::not_found(format!("Unknown entity kind: {}", other))),
        }
    }
}

/// Name used for the two singleton entities.
pub const SINGLETON: &str = "main";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub data_dir: PathBuf,
    pub github_token: Option<String>,
}

/// Process-wide registry mapping (kind, name) to a running instance.
/// Instances are spawned lazily on first contact and stay resident; all
/// durable state lives in their SQLite files.
pub struct EntityRegistry {
    config: RegistryConfig,
    entities: RwLock<HashMap<(EntityKind, String), EntityHandle>>,
    self_ref: Weak<EntityRegistry>,
}

impl EntityRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            entities: RwLock::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Forward a request to the named entity, spawning it if needed.
    pub async fn dispatch(&self, kind: EntityKind, name: &str, req: EntityRequest) -> EntityResponse {
        match self.ensure(kind, name).await {
            Ok(handle) => handle.request(req).await,
            Err(err) => err.into(),
        }
    }

    /// Socket hub of the named entity, for WebSocket registration.
    pub async fn hub(&self, kind: EntityKind, name: &str) -> Result<Arc<SocketHub>> {
        Ok(self.ensure(kind, name).await?.hub())
    }

    async fn ensure(&self, kind: EntityKind, name: &str) -> Result<EntityHandle> {
        let key = (kind, name.to_string());
        if let Some(handle) = self.entities.read().await.get(&key) {
            return Ok(handle.clone());
        }

        let mut entities = self.entities.write().await;
        if let Some(handle) = entities.get(&key) {
            return Ok(handle.clone());
        }

        let handle = self.spawn_instance(kind, name)?;
        entities.insert(key, handle.clone());
        Ok(handle)
    }

    fn spawn_instance(&self, kind: EntityKind, name: &str) -> Result<EntityHandle> {
        info!(kind = kind.as_str(), name, "Spawning entity instance");
        let conn = storage::open_database(&self.config.data_dir, kind.as_str(), name)?;
        let hub = Arc::new(SocketHub::new());
        let alarm = AlarmHandle::new();
        let ctx = EntityContext::new(name, conn)
            .with_hub(Arc::clone(&hub))
            .with_alarm(alarm.clone())
            .with_peers(Peers {
                registry: self.self_ref.clone(),
            })
            .with_github_token(self.config.github_token.clone());

        let handle = match kind {
            EntityKind::Coordinator => spawn_entity(
                Coordinator::create(ctx)?,
                alarm,
                hub,
                kind.as_str(),
                name.to_string(),
            ),
            EntityKind::Agent => spawn_entity(
                AgentState::create(ctx)?,
                alarm,
                hub,
                kind.as_str(),
                name.to_string(),
            ),
            EntityKind::Lock => spawn_entity(
                ResourceLock::create(ctx)?,
                alarm,
                hub,
                kind.as_str(),
                name.to_string(),
            ),
            EntityKind::VmPool => spawn_entity(
                VmPool::create(ctx)?,
                alarm,
                hub,
                kind.as_str(),
                name.to_string(),
            ),
            EntityKind::GitTree => spawn_entity(
                GitTree::create(ctx)?,
                alarm,
                hub,
                kind.as_str(),
                name.to_string(),
            ),
        };
        Ok(handle)
    }
}

/// Internal RPC path between entities. The Coordinator uses this during
/// onboarding to read an agent's soul, checkpoint, and dashboard; the call
/// enqueues on the target's actor channel, so the target's serialization
/// is preserved.
#[derive(Clone)]
pub struct Peers {
    registry: Weak<EntityRegistry>,
}

impl Peers {
    /// A handle wired to nothing; peer calls fail. Used by tests and by
    /// entities that never call out.
    pub fn disconnected() -> Self {
        Self {
            registry: Weak::new(),
        }
    }

    pub async fn call(
        &self,
        kind: EntityKind,
        name: &str,
        req: EntityRequest,
    ) -> Result<EntityResponse> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::Internal("Registry is gone".to_string()))?;
        Ok(registry.dispatch(kind, name, req).await)
    }
}
