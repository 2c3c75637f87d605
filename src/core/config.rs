//! Engine configuration from YAML

use crate::core::context::Scope;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where sweeping outputs are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepingOutputBackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepingOutputConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: SweepingOutputBackendKind,

    /// Database file for the sqlite backend (defaults under the local data dir)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Top-level engine configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Account / org / project used when a request does not name one
    #[serde(default)]
    pub scope: Scope,

    /// Sweeping output storage
    #[serde(default)]
    pub sweeping_output: SweepingOutputConfig,

    /// Timeout for remote tasks (in seconds)
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Selectors applied to artifact tasks that declare none
    #[serde(default)]
    pub default_delegate_selectors: Vec<String>,

    /// Permits of the infrastructure resource constraint
    #[serde(default = "default_resource_permits")]
    pub resource_constraint_permits: u32,
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_resource_permits() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            sweeping_output: SweepingOutputConfig::default(),
            task_timeout_secs: default_task_timeout_secs(),
            default_delegate_selectors: Vec::new(),
            resource_constraint_permits: default_resource_permits(),
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse engine configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the engine configuration
    pub fn validate(&self) -> Result<()> {
        if self.scope.account_id.trim().is_empty() {
            anyhow::bail!("Scope account id must not be empty");
        }
        if self.scope.project_id.is_some() && self.scope.org_id.is_none() {
            anyhow::bail!("A project scope requires an org id");
        }
        if self.task_timeout_secs == 0 {
            anyhow::bail!("task_timeout_secs must be greater than zero");
        }
        if self.resource_constraint_permits == 0 {
            anyhow::bail!("resource_constraint_permits must be greater than zero");
        }
        if self.sweeping_output.backend == SweepingOutputBackendKind::Memory
            && self.sweeping_output.path.is_some()
        {
            anyhow::bail!("sweeping_output.path is only valid with the sqlite backend");
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.task_timeout_secs)
    }
}
