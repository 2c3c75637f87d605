//! Typed access to the sweeping output store

use crate::core::context::{Ambiance, Visibility};
use crate::core::error::SweepingOutputError;
use crate::persistence::{SweepingOutputBackend, SweepingOutputEntry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Write-once, scoped key/value channel between plan nodes.
///
/// Outputs are written under the scope their visibility selects and found by
/// searching the reader's scopes from the innermost outwards.
#[derive(Clone)]
pub struct SweepingOutputService {
    backend: Arc<dyn SweepingOutputBackend>,
}

impl SweepingOutputService {
    pub fn new(backend: Arc<dyn SweepingOutputBackend>) -> Self {
        Self { backend }
    }

    /// Store `value` under `name`. Returns the scope key it was written to.
    pub async fn consume<T: Serialize + ?Sized>(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: &T,
        visibility: Visibility,
    ) -> Result<String, SweepingOutputError> {
        let scope = ambiance.scope_key(visibility);
        let payload = serde_json::to_string(value).map_err(|e| SweepingOutputError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Consuming sweeping output {} in {}", name, scope);
        self.backend
            .insert(SweepingOutputEntry::new(scope.clone(), name, visibility, payload))
            .await?;
        Ok(scope)
    }

    /// Find `name` from the reader's position. Absence is `Ok(None)`; only a
    /// payload that does not decode is an error.
    pub async fn resolve_optional<T: DeserializeOwned>(
        &self,
        ambiance: &Ambiance,
        name: &str,
    ) -> Result<Option<T>, SweepingOutputError> {
        for scope in ambiance.lookup_scopes() {
            if let Some(entry) = self.backend.get(&scope, name).await? {
                let value = serde_json::from_str(&entry.payload).map_err(|e| SweepingOutputError::Corrupt {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub async fn resolve<T: DeserializeOwned>(&self, ambiance: &Ambiance, name: &str) -> Result<T, SweepingOutputError> {
        self.resolve_optional(ambiance, name)
            .await?
            .ok_or_else(|| SweepingOutputError::NotFound(name.to_string()))
    }

    pub async fn list(&self, scope: &str) -> Result<Vec<SweepingOutputEntry>, SweepingOutputError> {
        self.backend.list(scope).await
    }
}
