//! Persistence layer for sweeping outputs

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteSweepingOutputBackend;

use crate::core::config::{EngineConfig, SweepingOutputBackendKind};
use crate::core::context::Visibility;
use crate::core::error::SweepingOutputError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One stored output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepingOutputEntry {
    /// Scope key the output was written under
    pub scope: String,

    /// Output name, unique within its scope
    pub name: String,

    /// Visibility the output was published with
    pub visibility: Visibility,

    /// Serialized JSON payload
    pub payload: String,

    /// When the output was written
    pub created_at: DateTime<Utc>,
}

impl SweepingOutputEntry {
    pub fn new(scope: impl Into<String>, name: impl Into<String>, visibility: Visibility, payload: String) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            visibility,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Trait for sweeping output backends
///
/// Writes are once per (scope, name): a second insert for the same key must
/// fail with [`SweepingOutputError::AlreadyExists`].
#[async_trait::async_trait]
pub trait SweepingOutputBackend: Send + Sync {
    /// Store a new output
    async fn insert(&self, entry: SweepingOutputEntry) -> Result<(), SweepingOutputError>;

    /// Load an output, `None` when absent
    async fn get(&self, scope: &str, name: &str) -> Result<Option<SweepingOutputEntry>, SweepingOutputError>;

    /// List all outputs of a scope, oldest first
    async fn list(&self, scope: &str) -> Result<Vec<SweepingOutputEntry>, SweepingOutputError>;
}

/// In-memory backend (for testing or ephemeral use)
pub struct InMemorySweepingOutputBackend {
    entries: RwLock<HashMap<(String, String), SweepingOutputEntry>>,
}

impl InMemorySweepingOutputBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySweepingOutputBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SweepingOutputBackend for InMemorySweepingOutputBackend {
    async fn insert(&self, entry: SweepingOutputEntry) -> Result<(), SweepingOutputError> {
        let mut entries = self.entries.write().await;
        let key = (entry.scope.clone(), entry.name.clone());
        if entries.contains_key(&key) {
            return Err(SweepingOutputError::AlreadyExists {
                scope: entry.scope,
                name: entry.name,
            });
        }
        entries.insert(key, entry);
        Ok(())
    }

    async fn get(&self, scope: &str, name: &str) -> Result<Option<SweepingOutputEntry>, SweepingOutputError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(scope.to_string(), name.to_string())).cloned())
    }

    async fn list(&self, scope: &str) -> Result<Vec<SweepingOutputEntry>, SweepingOutputError> {
        let entries = self.entries.read().await;
        let mut result: Vec<SweepingOutputEntry> = entries
            .values()
            .filter(|e| e.scope == scope)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(result)
    }
}

/// Open the backend selected by the engine configuration
pub async fn open_backend(config: &EngineConfig) -> Result<Arc<dyn SweepingOutputBackend>> {
    match config.sweeping_output.backend {
        SweepingOutputBackendKind::Memory => Ok(Arc::new(InMemorySweepingOutputBackend::new())),
        #[cfg(feature = "sqlite")]
        SweepingOutputBackendKind::Sqlite => {
            let backend = match &config.sweeping_output.path {
                Some(path) => SqliteSweepingOutputBackend::new(path).await?,
                None => SqliteSweepingOutputBackend::with_default_path().await?,
            };
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "sqlite"))]
        SweepingOutputBackendKind::Sqlite => {
            anyhow::bail!("The sqlite sweeping output backend requires the `sqlite` feature")
        }
    }
}
