//! Services, environments, infrastructures and the resolver that finds them

use crate::core::artifact::ArtifactListConfig;
use crate::core::context::Scope;
use crate::core::error::PlanError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Scope level an entity is defined at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Account,
    Org,
    #[default]
    Project,
}

/// A `serviceRef` / `environmentRef` string split into level and identifier.
///
/// `org.x` and `account.x` address entities above the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedRef {
    pub level: ScopeLevel,
    pub identifier: String,
}

impl ScopedRef {
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        if let Some(identifier) = reference.strip_prefix("org.") {
            Self {
                level: ScopeLevel::Org,
                identifier: identifier.to_string(),
            }
        } else if let Some(identifier) = reference.strip_prefix("account.") {
            Self {
                level: ScopeLevel::Account,
                identifier: identifier.to_string(),
            }
        } else {
            Self {
                level: ScopeLevel::Project,
                identifier: reference.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NGVariable {
    pub name: String,
    #[serde(rename = "type", default = "default_variable_type")]
    pub variable_type: String,
    #[serde(default)]
    pub value: Value,
}

fn default_variable_type() -> String {
    "String".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfigWrapper {
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    pub identifier: String,
    #[serde(rename = "type")]
    pub manifest_type: String,
    #[serde(default)]
    pub spec: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactListConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<ManifestConfigWrapper>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<NGVariable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Deployment type, e.g. `Kubernetes`
    #[serde(rename = "type", default)]
    pub deployment_type: String,
    #[serde(default)]
    pub spec: ServiceSpec,
}

/// Patch applied on top of a service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<NGVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<ManifestConfigWrapper>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactListConfig>,
}

impl OverrideSpec {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.manifests.is_empty() && self.artifacts.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntity {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scope: ScopeLevel,
    #[serde(default)]
    pub git_ops_enabled: bool,
    #[serde(default)]
    pub service_definition: ServiceDefinition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnvironmentType {
    Production,
    #[default]
    PreProduction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentEntity {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scope: ScopeLevel,
    #[serde(rename = "type", default)]
    pub environment_type: EnvironmentType,
    #[serde(default)]
    pub variables: Vec<NGVariable>,
    /// Global override applied to every service deployed here
    #[serde(default)]
    pub overrides: Option<OverrideSpec>,
    #[serde(default)]
    pub git_ops_clusters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentGroupEntity {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scope: ScopeLevel,
    #[serde(default)]
    pub env_identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureEntity {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub environment_ref: String,
    #[serde(rename = "type")]
    pub infrastructure_type: String,
    #[serde(default)]
    pub deployment_type: Option<String>,
    #[serde(default)]
    pub allow_simultaneous_deployments: bool,
    #[serde(default)]
    pub spec: Value,
}

/// Environment-scoped override for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOverrideEntity {
    pub environment_ref: String,
    pub service_ref: String,
    #[serde(default)]
    pub overrides: OverrideSpec,
}

/// Looks up entity documents by reference.
///
/// Lookups return `None` for absence. The `require_*` variants turn absence
/// into a fatal planning error for callers where a missing entity makes the
/// pipeline structurally invalid.
pub trait EntityResolver: Send + Sync {
    fn service(&self, scope: &Scope, reference: &str) -> Option<ServiceEntity>;

    fn environment(&self, scope: &Scope, reference: &str) -> Option<EnvironmentEntity>;

    fn environment_group(&self, scope: &Scope, reference: &str) -> Option<EnvironmentGroupEntity>;

    fn infrastructure(&self, scope: &Scope, environment_ref: &str, reference: &str) -> Option<InfrastructureEntity>;

    fn infrastructures(&self, scope: &Scope, environment_ref: &str) -> Vec<InfrastructureEntity>;

    fn service_override(&self, scope: &Scope, environment_ref: &str, service_ref: &str) -> Option<ServiceOverrideEntity>;

    fn require_service(&self, scope: &Scope, reference: &str) -> Result<ServiceEntity, PlanError> {
        self.service(scope, reference)
            .ok_or_else(|| PlanError::not_found("Service", reference))
    }

    fn require_environment(&self, scope: &Scope, reference: &str) -> Result<EnvironmentEntity, PlanError> {
        self.environment(scope, reference)
            .ok_or_else(|| PlanError::not_found("Environment", reference))
    }

    fn require_environment_group(&self, scope: &Scope, reference: &str) -> Result<EnvironmentGroupEntity, PlanError> {
        self.environment_group(scope, reference)
            .ok_or_else(|| PlanError::not_found("Environment group", reference))
    }

    fn require_infrastructure(
        &self,
        scope: &Scope,
        environment_ref: &str,
        reference: &str,
    ) -> Result<InfrastructureEntity, PlanError> {
        self.infrastructure(scope, environment_ref, reference)
            .ok_or_else(|| PlanError::not_found("Infrastructure", format!("{}/{}", environment_ref, reference)))
    }
}

/// Entity documents loaded from a YAML catalog file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCatalog {
    #[serde(default)]
    pub services: Vec<ServiceEntity>,
    #[serde(default)]
    pub environments: Vec<EnvironmentEntity>,
    #[serde(default)]
    pub environment_groups: Vec<EnvironmentGroupEntity>,
    #[serde(default)]
    pub infrastructures: Vec<InfrastructureEntity>,
    #[serde(default)]
    pub service_overrides: Vec<ServiceOverrideEntity>,
}

impl EntityCatalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read entity catalog {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: EntityCatalog = serde_yaml::from_str(yaml)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for env in &self.environments {
            if !seen.insert((env.scope, env.identifier.as_str())) {
                anyhow::bail!("Duplicate environment identifier: {}", env.identifier);
            }
        }
        for infra in &self.infrastructures {
            let env = ScopedRef::parse(&infra.environment_ref);
            if !self
                .environments
                .iter()
                .any(|e| e.identifier == env.identifier && e.scope == env.level)
            {
                anyhow::bail!(
                    "Infrastructure '{}' references non-existent environment '{}'",
                    infra.identifier,
                    infra.environment_ref
                );
            }
        }
        Ok(())
    }

    pub fn with_service(mut self, service: ServiceEntity) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentEntity) -> Self {
        self.environments.push(environment);
        self
    }

    pub fn with_infrastructure(mut self, infrastructure: InfrastructureEntity) -> Self {
        self.infrastructures.push(infrastructure);
        self
    }
}

fn matches_ref(level: ScopeLevel, identifier: &str, reference: &ScopedRef) -> bool {
    level == reference.level && identifier == reference.identifier
}

impl EntityResolver for EntityCatalog {
    fn service(&self, _scope: &Scope, reference: &str) -> Option<ServiceEntity> {
        let reference = ScopedRef::parse(reference);
        self.services
            .iter()
            .find(|s| matches_ref(s.scope, &s.identifier, &reference))
            .cloned()
    }

    fn environment(&self, _scope: &Scope, reference: &str) -> Option<EnvironmentEntity> {
        let reference = ScopedRef::parse(reference);
        self.environments
            .iter()
            .find(|e| matches_ref(e.scope, &e.identifier, &reference))
            .cloned()
    }

    fn environment_group(&self, _scope: &Scope, reference: &str) -> Option<EnvironmentGroupEntity> {
        let reference = ScopedRef::parse(reference);
        self.environment_groups
            .iter()
            .find(|g| matches_ref(g.scope, &g.identifier, &reference))
            .cloned()
    }

    fn infrastructure(&self, scope: &Scope, environment_ref: &str, reference: &str) -> Option<InfrastructureEntity> {
        self.infrastructures(scope, environment_ref)
            .into_iter()
            .find(|i| i.identifier == reference)
    }

    fn infrastructures(&self, _scope: &Scope, environment_ref: &str) -> Vec<InfrastructureEntity> {
        let env = ScopedRef::parse(environment_ref);
        self.infrastructures
            .iter()
            .filter(|i| ScopedRef::parse(&i.environment_ref) == env)
            .cloned()
            .collect()
    }

    fn service_override(&self, _scope: &Scope, environment_ref: &str, service_ref: &str) -> Option<ServiceOverrideEntity> {
        let env = ScopedRef::parse(environment_ref);
        let service = ScopedRef::parse(service_ref);
        self.service_overrides
            .iter()
            .find(|o| ScopedRef::parse(&o.environment_ref) == env && ScopedRef::parse(&o.service_ref) == service)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
services:
  - identifier: nginx
    serviceDefinition:
      type: Kubernetes
  - identifier: shared
    scope: org
environments:
  - identifier: prod
    type: Production
  - identifier: qa
infrastructures:
  - identifier: k8s-prod
    environmentRef: prod
    type: KubernetesDirect
    spec:
      namespace: prod
"#;

    #[test]
    fn test_scoped_ref_parsing() {
        assert_eq!(ScopedRef::parse("org.shared").level, ScopeLevel::Org);
        assert_eq!(ScopedRef::parse("account.x").identifier, "x");
        assert_eq!(ScopedRef::parse("nginx").level, ScopeLevel::Project);
    }

    #[test]
    fn test_catalog_lookups() {
        let catalog = EntityCatalog::from_yaml(CATALOG).unwrap();
        let scope = Scope::default();

        assert!(catalog.service(&scope, "nginx").is_some());
        assert!(catalog.service(&scope, "shared").is_none());
        assert!(catalog.service(&scope, "org.shared").is_some());
        assert_eq!(catalog.infrastructures(&scope, "prod").len(), 1);
        assert!(catalog.infrastructures(&scope, "qa").is_empty());

        let err = catalog.require_environment(&scope, "staging").unwrap_err();
        assert!(matches!(err, PlanError::NotFound { kind: "Environment", .. }));
    }

    #[test]
    fn test_catalog_rejects_orphan_infrastructure() {
        let yaml = r#"
infrastructures:
  - identifier: k8s
    environmentRef: missing
    type: KubernetesDirect
"#;
        assert!(EntityCatalog::from_yaml(yaml).is_err());
    }
}
