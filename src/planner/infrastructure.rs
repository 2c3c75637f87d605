//! Infrastructure nodes: the infrastructure task, its legacy section wrapper
//! and the resource constraint that serializes deployments to one target

use crate::core::error::PlanError;
use crate::core::parameter::ParameterField;
use crate::core::plan::{
    AdviserObtainment, AdviserType, FacilitatorType, PlanCreationResponse, PlanNode, ResourceConstraintParameters,
    StepParameters, StepType,
};
use crate::core::stage::{DeploymentStageConfig, InfrastructureDef};
use crate::planner::multi_deployment::{ENVIRONMENT_REF_EXPRESSION, INFRASTRUCTURE_REF_EXPRESSION};
use crate::planner::overrides::{deploy_to_all, EnvironmentPlanCreatorConfig};
use serde::{Deserialize, Serialize};

/// Resource unit held while a stage deploys to an infrastructure
pub const INFRA_RESOURCE_UNIT: &str = "<+INFRA_KEY>";
pub const RESOURCE_CONSTRAINT_NAME: &str = "Queuing";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStepParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_group_ref: Option<String>,
    #[serde(default)]
    pub infrastructure_refs: Vec<String>,
    #[serde(default)]
    pub deploy_to_all: bool,
    /// Inline definition of the legacy `infrastructure` section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure: Option<InfrastructureDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_key: Option<String>,
    #[serde(default)]
    pub allow_simultaneous_deployments: bool,
    #[serde(default)]
    pub git_ops_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<String>,
}

impl InfrastructureStepParameters {
    /// Parameters of the single infrastructure step of the new flow. Multi
    /// environment stages are planned against matrix placeholders.
    pub fn for_stage(stage: &DeploymentStageConfig) -> Result<Self, PlanError> {
        let mut parameters = InfrastructureStepParameters {
            git_ops_enabled: stage.git_ops_enabled,
            deployment_type: stage.deployment_type.clone(),
            ..Default::default()
        };

        if stage.environments.is_some() || stage.environment_group.is_some() {
            parameters.environment_ref = Some(ENVIRONMENT_REF_EXPRESSION.to_string());
            parameters.infrastructure_refs = vec![INFRASTRUCTURE_REF_EXPRESSION.to_string()];
            parameters.environment_group_ref = stage
                .environment_group
                .as_ref()
                .map(|g| g.env_group_ref.as_str().to_string());
            return Ok(parameters);
        }

        let environment = stage.environment.as_ref().ok_or_else(|| {
            PlanError::invalid_request("Infrastructure Or Environment or Environment Group section is missing")
        })?;
        parameters.environment_ref = environment
            .environment_ref
            .as_ref()
            .map(|r| r.as_str().to_string());
        parameters.deploy_to_all = deploy_to_all(&environment.deploy_to_all)?;
        parameters.infrastructure_refs = environment
            .infrastructure_refs()
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();
        if !stage.git_ops_enabled && !parameters.deploy_to_all && parameters.infrastructure_refs.is_empty() {
            return Err(PlanError::invalid_request(format!(
                "No infrastructure definitions provided for environment [{}]",
                parameters.environment_ref.as_deref().unwrap_or_default()
            )));
        }
        Ok(parameters)
    }

    /// Parameters for the legacy flow, from either the inline `infrastructure`
    /// section or a resolved environment
    pub fn for_legacy_stage(
        stage: &DeploymentStageConfig,
        environment: Option<&EnvironmentPlanCreatorConfig>,
    ) -> Self {
        let mut parameters = InfrastructureStepParameters {
            git_ops_enabled: stage.git_ops_enabled,
            deployment_type: stage.deployment_type.clone(),
            ..Default::default()
        };
        if let Some(infrastructure) = &stage.infrastructure {
            parameters.environment_ref = infrastructure
                .environment_ref
                .as_ref()
                .map(ParameterField::as_str)
                .map(str::to_string);
            parameters.infrastructure = infrastructure.infrastructure_definition.clone();
            parameters.infrastructure_key = infrastructure.infrastructure_key.clone();
            parameters.allow_simultaneous_deployments = infrastructure.allow_simultaneous_deployments;
        }
        if let Some(environment) = environment {
            parameters.environment_ref = Some(environment.environment_ref.clone());
            parameters.deploy_to_all = environment.deploy_to_all;
            parameters.infrastructure_refs = environment
                .infrastructure_definitions
                .iter()
                .map(|i| i.identifier.clone())
                .collect();
            parameters.allow_simultaneous_deployments = environment
                .infrastructure_definitions
                .iter()
                .all(|i| i.allow_simultaneous_deployments)
                && !environment.infrastructure_definitions.is_empty();
        }
        parameters
    }
}

/// Infrastructure task node followed by `next_node_id`
pub fn create_infrastructure_task_node(
    uuid: &str,
    parameters: InfrastructureStepParameters,
    next_node_id: Option<&str>,
) -> PlanNode {
    let node = PlanNode::new(uuid, "infrastructure", StepType::InfrastructureTask, FacilitatorType::Task)
        .with_name("Infrastructure")
        .with_parameters(StepParameters::Infrastructure(parameters));
    match next_node_id {
        Some(next) => node.with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, next)),
        None => node,
    }
}

pub fn create_resource_constraint_node(uuid: &str, permits: u32, next_node_id: &str) -> PlanNode {
    PlanNode::new(uuid, "rc", StepType::ResourceConstraint, FacilitatorType::ResourceRestraint)
        .with_name("Resource Constraint")
        .with_parameters(StepParameters::ResourceConstraint(ResourceConstraintParameters {
            resource_unit: INFRA_RESOURCE_UNIT.to_string(),
            name: RESOURCE_CONSTRAINT_NAME.to_string(),
            permits,
            hold_across_stages: false,
        }))
        .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, next_node_id))
}

/// Legacy infrastructure section: section -> definition -> [provisioner] ->
/// task. The section hands over to `next_node_id` once the chain is done.
pub fn create_legacy_infrastructure_nodes(
    section_id: &str,
    parameters: InfrastructureStepParameters,
    next_node_id: &str,
    response: &mut PlanCreationResponse,
) -> Result<(), PlanError> {
    let definition_id = format!("infrastructureDefinition-{}", section_id);
    let provisioner_id = format!("provisioner-{}", section_id);
    let task_id = format!("infrastructureTask-{}", section_id);
    let provisioner = parameters
        .infrastructure
        .as_ref()
        .and_then(|i| i.provisioner.clone())
        .filter(|p| !p.is_null());

    response.add_node(
        PlanNode::new(section_id, "infrastructureSection", StepType::InfrastructureSection, FacilitatorType::Child)
            .with_name("Infrastructure Section")
            .with_parameters(StepParameters::section(definition_id.clone()))
            .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, next_node_id)),
    )?;

    let definition_child = if provisioner.is_some() {
        provisioner_id.clone()
    } else {
        task_id.clone()
    };
    response.add_node(
        PlanNode::new(
            definition_id,
            "infrastructureDefinition",
            StepType::InfrastructureDefinition,
            FacilitatorType::Child,
        )
        .with_name("Infrastructure Definition")
        .with_parameters(StepParameters::section(definition_child)),
    )?;

    if provisioner.is_some() {
        response.add_node(
            PlanNode::new(provisioner_id, "provisioner", StepType::Provisioner, FacilitatorType::Sync)
                .with_name("Provisioner")
                .with_adviser(AdviserObtainment::next(AdviserType::NextStep, task_id.clone())),
        )?;
    }

    response.add_node(create_infrastructure_task_node(&task_id, parameters, None))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(yaml: &str) -> DeploymentStageConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parameters_for_single_environment() {
        let parameters = InfrastructureStepParameters::for_stage(&stage(
            "environment: { environmentRef: prod, infrastructureDefinitions: [ { identifier: k8s } ] }\n",
        ))
        .unwrap();
        assert_eq!(parameters.environment_ref.as_deref(), Some("prod"));
        assert_eq!(parameters.infrastructure_refs, vec!["k8s"]);
    }

    #[test]
    fn test_parameters_for_multi_environment_use_placeholders() {
        let parameters = InfrastructureStepParameters::for_stage(&stage(
            "environmentGroup: { envGroupRef: all, deployToAll: true }\n",
        ))
        .unwrap();
        assert_eq!(parameters.environment_ref.as_deref(), Some(ENVIRONMENT_REF_EXPRESSION));
        assert_eq!(parameters.environment_group_ref.as_deref(), Some("all"));
    }

    #[test]
    fn test_missing_infrastructure_definitions() {
        let err = InfrastructureStepParameters::for_stage(&stage("environment: { environmentRef: prod }\n"))
            .unwrap_err();
        assert!(err.to_string().contains("No infrastructure definitions"));
    }

    #[test]
    fn test_legacy_chain_with_provisioner() {
        let stage = stage(
            r#"
infrastructure:
  environmentRef: prod
  infrastructureDefinition:
    type: KubernetesDirect
    spec: { namespace: default }
    provisioner:
      steps: []
"#,
        );
        let mut response = PlanCreationResponse::new();
        create_legacy_infrastructure_nodes(
            "infra",
            InfrastructureStepParameters::for_legacy_stage(&stage, None),
            "execution",
            &mut response,
        )
        .unwrap();

        let ids: Vec<&str> = response.nodes.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec![
                "infra",
                "infrastructureDefinition-infra",
                "provisioner-infra",
                "infrastructureTask-infra"
            ]
        );
        assert_eq!(response.nodes["infra"].advisers[0].next_node_id.as_deref(), Some("execution"));
    }
}
