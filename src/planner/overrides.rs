//! Environment and service override resolution
//!
//! Plan-time lookups turn an environment (or environment group) reference into
//! the configuration a service node needs: the environment's global override,
//! the environment-scoped override of the deployed service, and the
//! infrastructures or gitops clusters being targeted. The overrides are kept
//! apart so the consumer can apply them independently.

use crate::core::artifact::ArtifactListConfig;
use crate::core::context::Scope;
use crate::core::entity::{
    EntityResolver, EnvironmentType, InfrastructureEntity, NGVariable, OverrideSpec, ServiceDefinition,
};
use crate::core::error::PlanError;
use crate::core::parameter::ParameterField;
use crate::core::stage::{EnvironmentGroupYaml, EnvironmentYamlV2};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Resolved environment handed to environment and service nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPlanCreatorConfig {
    pub environment_ref: String,
    pub identifier: String,
    pub name: String,
    pub environment_type: EnvironmentType,
    #[serde(default)]
    pub variables: Vec<NGVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_override: Option<OverrideSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_override: Option<OverrideSpec>,
    #[serde(default)]
    pub infrastructure_definitions: Vec<InfrastructureEntity>,
    #[serde(default)]
    pub git_ops_clusters: Vec<String>,
    #[serde(default)]
    pub deploy_to_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvGroupPlanCreatorConfig {
    pub env_group_ref: String,
    pub identifier: String,
    pub name: String,
    pub deploy_to_all: bool,
    pub environments: Vec<EnvironmentPlanCreatorConfig>,
}

/// Overrides threaded from the stage to its service node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridesFromEnvironment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_override_config: Option<OverrideSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_global_override: Option<OverrideSpec>,
    pub env_identifier: String,
}

impl From<&EnvironmentPlanCreatorConfig> for OverridesFromEnvironment {
    fn from(config: &EnvironmentPlanCreatorConfig) -> Self {
        Self {
            service_override_config: config.service_override.clone(),
            environment_global_override: config.global_override.clone(),
            env_identifier: config.identifier.clone(),
        }
    }
}

/// True for refs bound per iteration by a matrix (`<+matrix.serviceRef>` ...)
pub fn is_matrix_placeholder(field: &ParameterField<String>) -> bool {
    field
        .expression()
        .is_some_and(|e| e.trim_start().starts_with("<+matrix."))
}

/// A `deployToAll` flag must be concrete when given
pub fn deploy_to_all(field: &Option<ParameterField<bool>>) -> Result<bool, PlanError> {
    match field {
        None => Ok(false),
        Some(ParameterField::Value(value)) => Ok(*value),
        Some(ParameterField::Expression(_)) => Err(PlanError::invalid_request(
            "Value for deploy to all must be provided",
        )),
    }
}

pub struct OverrideResolver<'a> {
    entities: &'a dyn EntityResolver,
    scope: &'a Scope,
}

impl<'a> OverrideResolver<'a> {
    pub fn new(entities: &'a dyn EntityResolver, scope: &'a Scope) -> Self {
        Self { entities, scope }
    }

    /// Resolve one environment for `service_ref`
    pub fn resolve(
        &self,
        service_ref: Option<&ParameterField<String>>,
        environment: &EnvironmentYamlV2,
        git_ops_enabled: bool,
    ) -> Result<EnvironmentPlanCreatorConfig, PlanError> {
        let environment_ref = environment
            .environment_ref
            .as_ref()
            .ok_or_else(|| PlanError::invalid_request("Environment ref must be provided"))?
            .concrete("environmentRef")?;
        let entity = self.entities.require_environment(self.scope, environment_ref)?;
        let deploy_to_all = deploy_to_all(&environment.deploy_to_all)?;

        let mut infrastructure_definitions = Vec::new();
        let mut git_ops_clusters = Vec::new();
        if git_ops_enabled {
            if deploy_to_all {
                git_ops_clusters = entity.git_ops_clusters.clone();
            } else if let Some(clusters) = &environment.git_ops_clusters {
                for cluster in clusters.concrete("gitOpsClusters")? {
                    git_ops_clusters.push(cluster.identifier.concrete("gitOpsClusters.identifier")?.clone());
                }
            }
        } else if deploy_to_all {
            infrastructure_definitions = self.entities.infrastructures(self.scope, environment_ref);
        } else {
            let refs = environment.infrastructure_refs();
            if refs.is_empty() {
                return Err(PlanError::invalid_request(format!(
                    "No infrastructure definitions provided for environment [{}]",
                    environment_ref
                )));
            }
            for reference in refs {
                let reference = reference.concrete("infrastructureDefinitions.identifier")?;
                infrastructure_definitions.push(self.entities.require_infrastructure(
                    self.scope,
                    environment_ref,
                    reference,
                )?);
            }
        }

        let service_override = match service_ref {
            Some(service_ref) => {
                let service_ref = service_ref.concrete("serviceRef")?;
                self.entities
                    .service_override(self.scope, environment_ref, service_ref)
                    .map(|o| o.overrides)
                    .filter(|o| !o.is_empty())
            }
            None => None,
        };
        debug!(
            "Resolved environment {} ({} infrastructure(s), service override: {})",
            environment_ref,
            infrastructure_definitions.len(),
            service_override.is_some()
        );

        Ok(EnvironmentPlanCreatorConfig {
            environment_ref: environment_ref.clone(),
            identifier: entity.identifier.clone(),
            name: if entity.name.is_empty() { entity.identifier.clone() } else { entity.name.clone() },
            environment_type: entity.environment_type,
            variables: entity.variables.clone(),
            global_override: entity.overrides.clone().filter(|o| !o.is_empty()),
            service_override,
            infrastructure_definitions,
            git_ops_clusters,
            deploy_to_all,
        })
    }

    /// Resolve every environment an environment group deploys to
    pub fn resolve_group(
        &self,
        service_ref: Option<&ParameterField<String>>,
        group: &EnvironmentGroupYaml,
        git_ops_enabled: bool,
    ) -> Result<EnvGroupPlanCreatorConfig, PlanError> {
        let group_ref = group.env_group_ref.concrete("envGroupRef")?;
        let entity = self.entities.require_environment_group(self.scope, group_ref)?;
        let deploy_to_all = deploy_to_all(&group.deploy_to_all)?;

        let targets: Vec<EnvironmentYamlV2> = if deploy_to_all {
            entity
                .env_identifiers
                .iter()
                .map(|identifier| EnvironmentYamlV2 {
                    environment_ref: Some(ParameterField::Value(identifier.clone())),
                    deploy_to_all: Some(ParameterField::Value(true)),
                    ..Default::default()
                })
                .collect()
        } else {
            let environments = group.environments.as_ref().ok_or_else(|| {
                PlanError::invalid_request(format!(
                    "Environments must be provided for environment group [{}] when deployToAll is false",
                    group_ref
                ))
            })?;
            environments.concrete("environmentGroup.environments")?.clone()
        };

        let mut environments = Vec::with_capacity(targets.len());
        for target in &targets {
            let config = self.resolve(service_ref, target, git_ops_enabled)?;
            if !entity.env_identifiers.contains(&config.identifier) {
                return Err(PlanError::invalid_request(format!(
                    "Environment [{}] is not part of environment group [{}]",
                    config.identifier, group_ref
                )));
            }
            environments.push(config);
        }

        Ok(EnvGroupPlanCreatorConfig {
            env_group_ref: group_ref.clone(),
            identifier: entity.identifier.clone(),
            name: if entity.name.is_empty() { entity.identifier.clone() } else { entity.name.clone() },
            deploy_to_all,
            environments,
        })
    }
}

fn apply_override(definition: &mut ServiceDefinition, patch: &OverrideSpec) {
    let spec = &mut definition.spec;

    for variable in &patch.variables {
        match spec.variables.iter_mut().find(|v| v.name == variable.name) {
            Some(existing) => *existing = variable.clone(),
            None => spec.variables.push(variable.clone()),
        }
    }

    for wrapper in &patch.manifests {
        match spec
            .manifests
            .iter_mut()
            .find(|m| m.manifest.identifier == wrapper.manifest.identifier)
        {
            Some(existing) => *existing = wrapper.clone(),
            None => spec.manifests.push(wrapper.clone()),
        }
    }

    if let Some(patch_artifacts) = &patch.artifacts {
        let artifacts = spec.artifacts.get_or_insert_with(ArtifactListConfig::default);
        if patch_artifacts.primary.is_some() {
            artifacts.primary = patch_artifacts.primary.clone();
        }
        for wrapper in &patch_artifacts.sidecars {
            match artifacts
                .sidecars
                .iter_mut()
                .find(|s| s.sidecar.identifier == wrapper.sidecar.identifier)
            {
                Some(existing) => *existing = wrapper.clone(),
                None => artifacts.sidecars.push(wrapper.clone()),
            }
        }
    }
}

/// Effective service definition: stage overrides, then the environment's
/// global override, then the environment's override for this service.
pub fn merge_effective_service_config(
    base: &ServiceDefinition,
    stage_overrides: Option<&OverrideSpec>,
    overrides: Option<&OverridesFromEnvironment>,
) -> ServiceDefinition {
    let mut merged = base.clone();
    if let Some(stage_overrides) = stage_overrides {
        apply_override(&mut merged, stage_overrides);
    }
    if let Some(overrides) = overrides {
        if let Some(global) = &overrides.environment_global_override {
            apply_override(&mut merged, global);
        }
        if let Some(service) = &overrides.service_override_config {
            apply_override(&mut merged, service);
        }
    }
    merged
}
