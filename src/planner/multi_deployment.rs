//! Multi-deployment spawner
//!
//! A stage that lists several services, several environments or an
//! environment group is planned once, against matrix placeholders, and
//! wrapped by a spawner node. At runtime the spawner expands into one child
//! run per (service, environment, infrastructure) combination.

use crate::core::context::Scope;
use crate::core::entity::EntityResolver;
use crate::core::error::PlanError;
use crate::core::parameter::ParameterField;
use crate::core::plan::{
    AdviserObtainment, FacilitatorType, PlanNode, StepOutcomeGroup, StepParameters, StepType,
};
use crate::core::stage::{
    DeploymentStageConfig, EnvironmentGroupYaml, EnvironmentYamlV2, EnvironmentsYaml, ServiceYamlV2,
    ServicesYaml,
};
use crate::planner::overrides::deploy_to_all;
use crate::planner::strategy::cartesian;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const SERVICE_REF_EXPRESSION: &str = "<+matrix.serviceRef>";
pub const SERVICE_INPUTS_EXPRESSION: &str = "<+matrix.serviceInputs>";
pub const ENVIRONMENT_REF_EXPRESSION: &str = "<+matrix.environmentRef>";
pub const INFRASTRUCTURE_REF_EXPRESSION: &str = "<+matrix.identifier>";
pub const IDENTIFIER_POSTFIX_EXPRESSION: &str = "<+strategy.identifierPostFix>";

/// Which axis varies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultiDeploymentSubType {
    MultiServiceDeployment,
    MultiEnvDeployment,
    MultiServiceEnvDeployment,
}

impl MultiDeploymentSubType {
    /// Classify from which of the `services` / `environments` lists is set.
    /// An environment group is not an environments list, so a stage without
    /// `environments` is a multi-service deployment.
    pub fn classify(has_services: bool, has_environments: bool) -> Self {
        match (has_services, has_environments) {
            (true, true) => MultiDeploymentSubType::MultiServiceEnvDeployment,
            (false, true) => MultiDeploymentSubType::MultiEnvDeployment,
            (_, false) => MultiDeploymentSubType::MultiServiceDeployment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiDeploymentStepParameters {
    pub child_node_id: String,
    pub subtype: MultiDeploymentSubType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<EnvironmentsYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_group: Option<EnvironmentGroupYaml>,
    /// The fixed side when only one axis varies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceYamlV2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentYamlV2>,
    pub git_ops_enabled: bool,
}

impl MultiDeploymentStepParameters {
    pub fn from_stage(stage: &DeploymentStageConfig, child_node_id: impl Into<String>) -> Result<Self, PlanError> {
        if !stage.is_multi_deployment() {
            return Err(PlanError::invalid_request("Stage is not a multi deployment stage"));
        }
        let subtype = MultiDeploymentSubType::classify(stage.services.is_some(), stage.environments.is_some());

        Ok(Self {
            child_node_id: child_node_id.into(),
            subtype,
            services: stage.services.clone(),
            environments: stage.environments.clone(),
            environment_group: stage.environment_group.clone(),
            service: stage.service.clone(),
            environment: stage.environment.clone(),
            git_ops_enabled: stage.git_ops_enabled,
        })
    }

    /// Runs in parallel unless an axis sets `metadata.parallel: false`
    pub fn is_parallel(&self) -> bool {
        let flags = [
            self.services.as_ref().and_then(|s| s.metadata.as_ref()),
            self.environments.as_ref().and_then(|e| e.metadata.as_ref()),
            self.environment_group.as_ref().and_then(|g| g.metadata.as_ref()),
        ];
        !flags
            .iter()
            .flatten()
            .any(|metadata| metadata.parallel == Some(false))
    }
}

/// Empty value lists are rejected at plan time. Expressions pass through
/// and are checked when the spawner expands.
pub fn validate_lists(stage: &DeploymentStageConfig) -> Result<(), PlanError> {
    if let Some(services) = &stage.services {
        match &services.values {
            None => return Err(no_services()),
            Some(ParameterField::Value(values)) if values.is_empty() => return Err(no_services()),
            _ => {}
        }
    }
    if let Some(environments) = &stage.environments {
        match &environments.values {
            None => return Err(no_environments()),
            Some(ParameterField::Value(values)) if values.is_empty() => return Err(no_environments()),
            _ => {}
        }
    }
    Ok(())
}

fn no_services() -> PlanError {
    PlanError::invalid_request(
        "No values of services provided. Please provide at least one service for deployment",
    )
}

fn no_environments() -> PlanError {
    PlanError::invalid_request(
        "No values of environments provided. Please provide at least one environment for deployment",
    )
}

/// The spawner node. It takes the stage's outer id and advisers.
pub fn create_spawner_node(
    uuid: &str,
    identifier: &str,
    name: &str,
    parameters: MultiDeploymentStepParameters,
    advisers: Vec<AdviserObtainment>,
) -> PlanNode {
    PlanNode::new(uuid, identifier, StepType::MultiDeployment, FacilitatorType::Children)
        .with_name(name)
        .with_group(StepOutcomeGroup::Strategy)
        .with_parameters(StepParameters::MultiDeployment(parameters))
        .with_advisers(advisers)
}

/// One concrete child run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiDeploymentCombination {
    pub index: usize,
    pub service_ref: String,
    #[serde(default)]
    pub service_inputs: Option<Value>,
    #[serde(default)]
    pub environment_ref: Option<String>,
    #[serde(default)]
    pub infrastructure_ref: Option<String>,
    pub identifier_postfix: String,
}

impl MultiDeploymentCombination {
    /// Values bound to the `<+matrix.*>` placeholders for this run
    pub fn matrix_bindings(&self) -> IndexMap<String, Value> {
        let mut bindings = IndexMap::new();
        bindings.insert("serviceRef".to_string(), json!(self.service_ref));
        bindings.insert(
            "serviceInputs".to_string(),
            self.service_inputs.clone().unwrap_or(Value::Null),
        );
        if let Some(environment_ref) = &self.environment_ref {
            bindings.insert("environmentRef".to_string(), json!(environment_ref));
        }
        if let Some(infrastructure_ref) = &self.infrastructure_ref {
            bindings.insert("identifier".to_string(), json!(infrastructure_ref));
        }
        bindings
    }
}

/// Expansion of a spawner node once every list is concrete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiDeploymentExpansion {
    pub combinations: Vec<MultiDeploymentCombination>,
    pub max_concurrency: usize,
}

pub struct MultiDeploymentSpawner<'a> {
    entities: &'a dyn EntityResolver,
    scope: &'a Scope,
}

impl<'a> MultiDeploymentSpawner<'a> {
    pub fn new(entities: &'a dyn EntityResolver, scope: &'a Scope) -> Self {
        Self { entities, scope }
    }

    pub fn expand(&self, parameters: &MultiDeploymentStepParameters) -> Result<MultiDeploymentExpansion, PlanError> {
        let services = self.service_axis(parameters)?;
        let targets = self.environment_axis(parameters)?;

        let axes = vec![
            ("service".to_string(), services),
            ("target".to_string(), targets),
        ];
        let combinations: Vec<MultiDeploymentCombination> = cartesian(&axes)
            .into_iter()
            .enumerate()
            .map(|(index, binding)| {
                let service = &binding["service"];
                let target = &binding["target"];
                MultiDeploymentCombination {
                    index,
                    service_ref: service["serviceRef"].as_str().unwrap_or_default().to_string(),
                    service_inputs: service.get("serviceInputs").filter(|v| !v.is_null()).cloned(),
                    environment_ref: target["environmentRef"].as_str().map(str::to_string),
                    infrastructure_ref: target["identifier"].as_str().map(str::to_string),
                    identifier_postfix: format!("_{}", index),
                }
            })
            .collect();

        let max_concurrency = if parameters.is_parallel() {
            combinations.len().max(1)
        } else {
            1
        };
        Ok(MultiDeploymentExpansion {
            combinations,
            max_concurrency,
        })
    }

    fn service_axis(&self, parameters: &MultiDeploymentStepParameters) -> Result<Vec<Value>, PlanError> {
        let services: Vec<ServiceYamlV2> = match (&parameters.services, &parameters.service) {
            (Some(services), _) => match &services.values {
                Some(values) => values.concrete("services.values")?.clone(),
                None => return Err(no_services()),
            },
            (None, Some(service)) => vec![service.clone()],
            (None, None) => return Err(PlanError::invalid_request("Service must be provided")),
        };
        if services.is_empty() {
            return Err(no_services());
        }
        services
            .iter()
            .map(|service| {
                let service_ref = service
                    .service_ref
                    .as_ref()
                    .ok_or_else(|| PlanError::invalid_request("Service ref must be provided"))?
                    .concrete("serviceRef")?;
                Ok(json!({
                    "serviceRef": service_ref,
                    "serviceInputs": service.service_inputs.clone().unwrap_or(Value::Null),
                }))
            })
            .collect()
    }

    fn environment_axis(&self, parameters: &MultiDeploymentStepParameters) -> Result<Vec<Value>, PlanError> {
        let environments: Vec<EnvironmentYamlV2> =
            match (&parameters.environments, &parameters.environment_group, &parameters.environment) {
                (Some(environments), _, _) => match &environments.values {
                    Some(values) => values.concrete("environments.values")?.clone(),
                    None => return Err(no_environments()),
                },
                (None, Some(group), _) => self.group_environments(group)?,
                (None, None, Some(environment)) => vec![environment.clone()],
                (None, None, None) => {
                    return Err(PlanError::invalid_request(
                        "Infrastructure Or Environment or Environment Group section is missing",
                    ))
                }
            };
        if environments.is_empty() {
            return Err(no_environments());
        }

        let mut targets = Vec::new();
        for environment in &environments {
            let environment_ref = environment
                .environment_ref
                .as_ref()
                .ok_or_else(|| PlanError::invalid_request("Environment ref must be provided"))?
                .concrete("environmentRef")?;

            if parameters.git_ops_enabled {
                targets.push(json!({ "environmentRef": environment_ref }));
                continue;
            }

            let infrastructure_refs: Vec<String> = if deploy_to_all(&environment.deploy_to_all)? {
                self.entities
                    .infrastructures(self.scope, environment_ref)
                    .into_iter()
                    .map(|i| i.identifier)
                    .collect()
            } else {
                environment
                    .infrastructure_refs()
                    .iter()
                    .map(|r| r.concrete("infrastructureDefinitions.identifier").cloned())
                    .collect::<Result<_, _>>()?
            };
            if infrastructure_refs.is_empty() {
                return Err(PlanError::invalid_request(format!(
                    "No infrastructure definitions provided for environment [{}]",
                    environment_ref
                )));
            }
            for infrastructure_ref in infrastructure_refs {
                targets.push(json!({
                    "environmentRef": environment_ref,
                    "identifier": infrastructure_ref,
                }));
            }
        }
        Ok(targets)
    }

    fn group_environments(&self, group: &EnvironmentGroupYaml) -> Result<Vec<EnvironmentYamlV2>, PlanError> {
        let group_ref = group.env_group_ref.concrete("envGroupRef")?;
        if deploy_to_all(&group.deploy_to_all)? {
            let entity = self.entities.require_environment_group(self.scope, group_ref)?;
            return Ok(entity
                .env_identifiers
                .into_iter()
                .map(|identifier| EnvironmentYamlV2 {
                    environment_ref: Some(ParameterField::Value(identifier)),
                    deploy_to_all: Some(ParameterField::Value(true)),
                    ..Default::default()
                })
                .collect());
        }
        match &group.environments {
            Some(environments) => Ok(environments.concrete("environmentGroup.environments")?.clone()),
            None => Err(no_environments()),
        }
    }
}
