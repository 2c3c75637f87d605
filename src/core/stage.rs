//! Deployment stage configuration as written in pipeline YAML

use crate::core::entity::{NGVariable, OverrideSpec, ServiceDefinition};
use crate::core::error::PlanError;
use crate::core::parameter::ParameterField;
use crate::core::yaml::UUID_FIELD_NAME;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `stage` wrapper of a deployment stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStageNode {
    #[serde(rename = "__uuid", default)]
    pub uuid: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub when: Option<StageWhenCondition>,
    #[serde(default)]
    pub skip_condition: Option<ParameterField<String>>,
    #[serde(default)]
    pub failure_strategies: Vec<FailureStrategyConfig>,
    #[serde(default)]
    pub timeout: Option<ParameterField<String>>,
    #[serde(default)]
    pub variables: Vec<NGVariable>,
    #[serde(default)]
    pub spec: DeploymentStageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Success,
    Failure,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageWhenCondition {
    pub pipeline_status: PipelineStatus,
    #[serde(default)]
    pub condition: Option<ParameterField<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepWhenCondition {
    pub stage_status: PipelineStatus,
    #[serde(default)]
    pub condition: Option<ParameterField<String>>,
}

fn with_condition(base: &str, condition: &Option<ParameterField<String>>) -> String {
    match condition {
        Some(c) if !c.is_blank() => format!("{} && ({})", base, c.as_str()),
        _ => base.to_string(),
    }
}

/// Run condition of a stage. Without a `when`, a stage runs on pipeline success.
pub fn stage_run_condition(when: &Option<StageWhenCondition>) -> String {
    match when {
        None => "<+OnPipelineSuccess>".to_string(),
        Some(when) => {
            let base = match when.pipeline_status {
                PipelineStatus::Success => "<+OnPipelineSuccess>",
                PipelineStatus::Failure => "<+OnPipelineFailure>",
                PipelineStatus::All => "<+Always>",
            };
            with_condition(base, &when.condition)
        }
    }
}

/// Run condition of a step. Without a `when`, a step runs on stage success.
pub fn step_run_condition(when: &Option<StepWhenCondition>) -> String {
    match when {
        None => "<+OnStageSuccess>".to_string(),
        Some(when) => {
            let base = match when.stage_status {
                PipelineStatus::Success => "<+OnStageSuccess>",
                PipelineStatus::Failure => "<+OnStageFailure>",
                PipelineStatus::All => "<+Always>",
            };
            with_condition(base, &when.condition)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    AllErrors,
    Unknown,
    Authentication,
    Authorization,
    Connectivity,
    Timeout,
    Verification,
    DelegateProvisioning,
    PolicyEvaluationFailure,
    InputTimeoutError,
    ApprovalRejection,
    DelegateRestart,
    UserMarkedFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStrategyAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailureConfig {
    #[serde(default)]
    pub errors: Vec<FailureType>,
    pub action: FailureStrategyAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStrategyConfig {
    pub on_failure: OnFailureConfig,
}

/// A stage needs a failure strategy whose only error type is `AllErrors`
pub fn validate_failure_strategies(strategies: &[FailureStrategyConfig]) -> Result<(), PlanError> {
    if strategies.is_empty() {
        return Err(PlanError::invalid_request(
            "There should be at least one failure strategy configured at stage level.",
        ));
    }
    let has_catch_all = strategies
        .iter()
        .any(|s| s.on_failure.errors == [FailureType::AllErrors]);
    if !has_catch_all {
        return Err(PlanError::invalid_request(
            "There should be a Failure strategy that contains one error type as AllErrors, with no other error type along with it in that Failure Strategy.",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStageConfig {
    #[serde(default)]
    pub deployment_type: Option<String>,
    #[serde(default)]
    pub git_ops_enabled: bool,
    #[serde(default)]
    pub service: Option<ServiceYamlV2>,
    #[serde(default)]
    pub services: Option<ServicesYaml>,
    #[serde(default)]
    pub service_config: Option<ServiceConfig>,
    #[serde(default)]
    pub environment: Option<EnvironmentYamlV2>,
    #[serde(default)]
    pub environments: Option<EnvironmentsYaml>,
    #[serde(default)]
    pub environment_group: Option<EnvironmentGroupYaml>,
    #[serde(default)]
    pub infrastructure: Option<PipelineInfrastructure>,
    #[serde(default)]
    pub execution: Option<Value>,
}

impl DeploymentStageConfig {
    /// True when the stage fans out over several services or environments
    pub fn is_multi_deployment(&self) -> bool {
        self.services.is_some() || self.environments.is_some() || self.environment_group.is_some()
    }

    /// Exactly one service source and at most one environment source may be set
    pub fn validate_exclusive_fields(&self) -> Result<(), PlanError> {
        if self.service.is_some() && self.services.is_some() {
            return Err(PlanError::invalid_request(
                "Only one of service or services can be present in a stage",
            ));
        }
        let environment_sources = [
            self.environment.is_some(),
            self.environments.is_some(),
            self.environment_group.is_some(),
        ];
        if environment_sources.iter().filter(|set| **set).count() > 1 {
            return Err(PlanError::invalid_request(
                "Only one of environment, environments or environmentGroup can be present in a stage",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUseFromStageV2 {
    pub stage: String,
}

/// `service` block of the current stage format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceYamlV2 {
    #[serde(rename = "__uuid", default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<ParameterField<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_from_stage: Option<ServiceUseFromStageV2>,
    /// Set once the referenced service has been inlined during planning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_definition: Option<ServiceDefinition>,
}

impl ServiceYamlV2 {
    /// A concrete (non-blank) service reference
    pub fn has_service_ref(&self) -> bool {
        matches!(&self.service_ref, Some(r) if !r.is_blank())
    }

    pub fn uses_other_stage(&self) -> bool {
        self.use_from_stage
            .as_ref()
            .is_some_and(|u| !u.stage.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    #[serde(default)]
    pub parallel: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicesYaml {
    #[serde(default)]
    pub values: Option<ParameterField<Vec<ServiceYamlV2>>>,
    #[serde(default)]
    pub metadata: Option<DeploymentMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraStructureDefinitionYaml {
    pub identifier: ParameterField<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterYaml {
    pub identifier: ParameterField<String>,
}

/// `environment` block of the current stage format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentYamlV2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<ParameterField<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_to_all: Option<ParameterField<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_definitions: Option<ParameterField<Vec<InfraStructureDefinitionYaml>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_definition: Option<ParameterField<InfraStructureDefinitionYaml>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_clusters: Option<ParameterField<Vec<ClusterYaml>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_inputs: Option<Value>,
}

impl EnvironmentYamlV2 {
    /// Infrastructure references, single and list forms combined
    pub fn infrastructure_refs(&self) -> Vec<ParameterField<String>> {
        let mut refs = Vec::new();
        if let Some(ParameterField::Value(single)) = &self.infrastructure_definition {
            refs.push(single.identifier.clone());
        }
        if let Some(ParameterField::Value(list)) = &self.infrastructure_definitions {
            refs.extend(list.iter().map(|d| d.identifier.clone()));
        }
        refs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentsYaml {
    #[serde(default)]
    pub values: Option<ParameterField<Vec<EnvironmentYamlV2>>>,
    #[serde(default)]
    pub metadata: Option<DeploymentMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentGroupYaml {
    pub env_group_ref: ParameterField<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<ParameterField<Vec<EnvironmentYamlV2>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_to_all: Option<ParameterField<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DeploymentMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUseFromStage {
    pub stage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverrides {
    #[serde(flatten)]
    pub overrides: OverrideSpec,
}

/// `serviceConfig` block of the legacy stage format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(rename = "__uuid", default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<ParameterField<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_definition: Option<ServiceDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_from_stage: Option<ServiceUseFromStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_overrides: Option<StageOverrides>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureDef {
    #[serde(rename = "type")]
    pub infrastructure_type: String,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<Value>,
}

/// `infrastructure` block of the legacy stage format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInfrastructure {
    #[serde(default)]
    pub environment_ref: Option<ParameterField<String>>,
    #[serde(default)]
    pub infrastructure_definition: Option<InfrastructureDef>,
    #[serde(default)]
    pub allow_simultaneous_deployments: bool,
    #[serde(default)]
    pub infrastructure_key: Option<String>,
}

/// Remove `__uuid` keys from a JSON document lifted out of the yaml tree
pub fn strip_node_ids(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(UUID_FIELD_NAME);
            map.values_mut().for_each(strip_node_ids);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_node_ids),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(errors: Vec<FailureType>) -> FailureStrategyConfig {
        FailureStrategyConfig {
            on_failure: OnFailureConfig {
                errors,
                action: FailureStrategyAction {
                    action_type: "StageRollback".to_string(),
                    spec: None,
                },
            },
        }
    }

    #[test]
    fn test_failure_strategy_validation() {
        let err = validate_failure_strategies(&[]).unwrap_err();
        assert!(err.to_string().contains("at least one failure strategy"));

        let err = validate_failure_strategies(&[strategy(vec![
            FailureType::AllErrors,
            FailureType::Timeout,
        ])])
        .unwrap_err();
        assert!(err.to_string().contains("AllErrors"));

        validate_failure_strategies(&[
            strategy(vec![FailureType::Timeout]),
            strategy(vec![FailureType::AllErrors]),
        ])
        .unwrap();
    }

    #[test]
    fn test_run_conditions() {
        assert_eq!(stage_run_condition(&None), "<+OnPipelineSuccess>");
        assert_eq!(step_run_condition(&None), "<+OnStageSuccess>");

        let when = StageWhenCondition {
            pipeline_status: PipelineStatus::All,
            condition: Some(ParameterField::Value("<+x> == 1".to_string())),
        };
        assert_eq!(stage_run_condition(&Some(when)), "<+Always> && (<+x> == 1)");
    }

    #[test]
    fn test_exclusive_fields() {
        let config: DeploymentStageConfig = serde_yaml::from_str(
            r#"
service: { serviceRef: a }
services: { values: [ { serviceRef: b } ] }
"#,
        )
        .unwrap();
        assert!(config.validate_exclusive_fields().is_err());

        let config: DeploymentStageConfig = serde_yaml::from_str(
            r#"
environment: { environmentRef: e }
environmentGroup: { envGroupRef: g }
"#,
        )
        .unwrap();
        assert!(config.validate_exclusive_fields().is_err());
        assert!(config.is_multi_deployment());
    }

    #[test]
    fn test_environment_infrastructure_refs() {
        let env: EnvironmentYamlV2 = serde_yaml::from_str(
            r#"
environmentRef: prod
infrastructureDefinitions:
  - identifier: k8s-a
  - identifier: <+input>
"#,
        )
        .unwrap();
        let refs = env.infrastructure_refs();
        assert_eq!(refs.len(), 2);
        assert!(refs[1].is_expression());
    }
}
