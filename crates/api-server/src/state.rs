//! Application state

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use coord_core::runtime::registry::{EntityRegistry, RegistryConfig};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<EntityRegistry>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(data_dir: PathBuf, github_token: Option<String>) -> Self {
        let registry = EntityRegistry::new(RegistryConfig {
            data_dir,
            github_token,
        });
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.inner.registry
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }
}
