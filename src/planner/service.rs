//! Service nodes for both stage flows
//!
//! The new flow emits a single `ServiceV3` node whose overrides are resolved
//! when it runs. The legacy flow resolves the service definition while
//! planning, writes it back into the pipeline yaml and hands it to the service
//! creator through dependency metadata.

use crate::core::entity::{OverrideSpec, ServiceDefinition};
use crate::core::error::PlanError;
use crate::core::parameter::ParameterField;
use crate::core::plan::{
    AdviserObtainment, AdviserType, FacilitatorType, PlanCreationResponse, PlanNode, StepParameters, StepType,
};
use crate::core::stage::{DeploymentStageConfig, ServiceConfig, ServiceYamlV2};
use crate::core::yaml::{assign_uuids, YamlNode, YamlTree, UUID_FIELD_NAME};
use crate::planner::environment::create_environment_node;
use crate::planner::multi_deployment::{
    ENVIRONMENT_REF_EXPRESSION, SERVICE_INPUTS_EXPRESSION, SERVICE_REF_EXPRESSION,
};
use crate::planner::overrides::{
    merge_effective_service_config, EnvironmentPlanCreatorConfig, OverridesFromEnvironment,
};
use crate::planner::{deserialize_clean, PlanCreationContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Dependency metadata key carrying [`LegacyServiceMetadata`]
pub const LEGACY_SERVICE_METADATA: &str = "legacyServiceMetadata";

/// Parameters of a service node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStepParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_from_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_group_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_node_id: Option<String>,
    /// Effective definition, set by the legacy flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_definition: Option<ServiceDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<OverridesFromEnvironment>,
}

/// Find a deployment stage anywhere in the pipeline, parallel blocks included
pub fn find_stage<'a>(tree: &'a YamlTree, identifier: &str) -> Option<YamlNode<'a>> {
    let stages = tree.root().field("pipeline")?.field("stages")?;
    for wrapped in stages.wrapped_children(&["stage", "parallel"]) {
        let candidates = if wrapped.name() == "parallel" {
            wrapped.wrapped_children(&["stage"])
        } else {
            vec![wrapped]
        };
        if let Some(stage) = candidates.into_iter().find(|s| s.identifier() == Some(identifier)) {
            return Some(stage);
        }
    }
    None
}

fn propagation_source<'a>(
    tree: &'a YamlTree,
    current_stage: Option<&str>,
    referenced: &str,
    field: &str,
) -> Result<YamlNode<'a>, PlanError> {
    if current_stage == Some(referenced) {
        return Err(PlanError::invalid_request(format!(
            "Stage [{}] cannot propagate service from itself",
            referenced
        )));
    }
    let stage = find_stage(tree, referenced).ok_or_else(|| {
        PlanError::invalid_request(format!(
            "Stage with identifier [{}] given for service propagation does not exist.",
            referenced
        ))
    })?;
    stage
        .field("spec")
        .and_then(|spec| spec.field(field))
        .ok_or_else(|| {
            PlanError::invalid_request(format!(
                "Could not find service in stage [{}], hence not possible to propagate service from that stage",
                referenced
            ))
        })
}

impl ServiceStepParameters {
    /// Parameters of the `ServiceV3` node of the new flow
    pub fn for_stage(
        tree: &YamlTree,
        stage_identifier: &str,
        stage: &DeploymentStageConfig,
    ) -> Result<Self, PlanError> {
        let mut parameters = ServiceStepParameters {
            deployment_type: stage.deployment_type.clone(),
            ..Default::default()
        };

        if stage.services.is_some() {
            parameters.service_ref = Some(SERVICE_REF_EXPRESSION.to_string());
            parameters.service_inputs = Some(Value::String(SERVICE_INPUTS_EXPRESSION.to_string()));
        } else if let Some(service) = &stage.service {
            if service.uses_other_stage() {
                let referenced = service
                    .use_from_stage
                    .as_ref()
                    .map(|u| u.stage.clone())
                    .unwrap_or_default();
                let source = propagation_source(tree, Some(stage_identifier), &referenced, "service")?;
                let source: ServiceYamlV2 = deserialize_clean(&source)?;
                if source.uses_other_stage() {
                    return Err(PlanError::invalid_request(format!(
                        "Invalid identifier [{}] given in useFromStage. Cannot reference a stage which also has useFromStage parameter",
                        referenced
                    )));
                }
                parameters.service_ref = source.service_ref.as_ref().map(|r| r.as_str().to_string());
                parameters.service_inputs = source.service_inputs;
                parameters.use_from_stage = Some(referenced);
            } else {
                parameters.service_ref = service.service_ref.as_ref().map(|r| r.as_str().to_string());
                parameters.service_inputs = service.service_inputs.clone();
            }
        }

        if let Some(environment) = &stage.environment {
            parameters.environment_ref = environment
                .environment_ref
                .as_ref()
                .map(|r| r.as_str().to_string());
        } else if stage.environments.is_some() || stage.environment_group.is_some() {
            parameters.environment_ref = Some(ENVIRONMENT_REF_EXPRESSION.to_string());
        }
        parameters.environment_group_ref = stage
            .environment_group
            .as_ref()
            .map(|g| g.env_group_ref.as_str().to_string());

        Ok(parameters)
    }
}

/// `Artifacts` (async) followed by `Manifests`. Returns the artifacts id.
fn add_artifacts_chain(service_node_id: &str, response: &mut PlanCreationResponse) -> Result<String, PlanError> {
    let artifacts_id = format!("artifacts-{}", service_node_id);
    let manifests_id = format!("manifests-{}", service_node_id);
    response.add_node(
        PlanNode::new(artifacts_id.clone(), "artifacts", StepType::Artifacts, FacilitatorType::Async)
            .with_name("Artifacts")
            .with_adviser(AdviserObtainment::next(AdviserType::NextStep, manifests_id.clone())),
    )?;
    response.add_node(
        PlanNode::new(manifests_id, "manifests", StepType::Manifests, FacilitatorType::Sync).with_name("Manifests"),
    )?;
    Ok(artifacts_id)
}

fn add_definition_section(
    service_node_id: &str,
    child_node_id: String,
    response: &mut PlanCreationResponse,
) -> Result<String, PlanError> {
    let definition_id = format!("serviceDefinition-{}", service_node_id);
    response.add_node(
        PlanNode::new(
            definition_id.clone(),
            "serviceDefinition",
            StepType::ServiceDefinition,
            FacilitatorType::Child,
        )
        .with_name("Service Definition")
        .with_parameters(StepParameters::section(child_node_id)),
    )?;
    Ok(definition_id)
}

/// New flow: `ServiceV3` -> definition section -> artifacts -> manifests
pub fn create_service_nodes_v3(
    service_node_id: &str,
    mut parameters: ServiceStepParameters,
    next_node_id: &str,
    response: &mut PlanCreationResponse,
) -> Result<(), PlanError> {
    let artifacts_id = add_artifacts_chain(service_node_id, response)?;
    let definition_id = add_definition_section(service_node_id, artifacts_id, response)?;
    parameters.child_node_id = Some(definition_id);
    response.add_node(
        PlanNode::new(service_node_id, "service", StepType::ServiceV3, FacilitatorType::Child)
            .with_name("Service")
            .with_parameters(StepParameters::Service(parameters))
            .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, next_node_id)),
    )?;
    Ok(())
}

/// What the legacy stage flow resolved for its service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyServiceMetadata {
    #[serde(default)]
    pub service_ref: Option<String>,
    pub service_definition: ServiceDefinition,
    #[serde(default)]
    pub stage_overrides: Option<OverrideSpec>,
    #[serde(default)]
    pub overrides: Option<OverridesFromEnvironment>,
    /// Set when an environment node sits between definition and spec
    #[serde(default)]
    pub environment: Option<EnvironmentPlanCreatorConfig>,
    pub next_node_id: String,
    #[serde(default)]
    pub deployment_type: Option<String>,
}

/// Service resolved by the legacy flow, before overrides are attached
pub struct ResolvedLegacyService<'a> {
    /// Yaml node the service creator is dispatched on
    pub anchor: YamlNode<'a>,
    pub service_ref: Option<ParameterField<String>>,
    pub service_definition: ServiceDefinition,
    pub stage_overrides: Option<OverrideSpec>,
}

fn write_back<T: Serialize>(anchor: &YamlNode<'_>, resolved: &T, response: &mut PlanCreationResponse) -> Result<(), PlanError> {
    let mut value = serde_yaml::to_value(resolved)?;
    if let serde_yaml::Value::Mapping(map) = &mut value {
        map.insert(
            serde_yaml::Value::String(UUID_FIELD_NAME.to_string()),
            serde_yaml::Value::String(anchor.uuid().to_string()),
        );
    }
    assign_uuids(&mut value);
    response.add_yaml_update(anchor.yaml_path(), serde_yaml::to_string(&value)?);
    Ok(())
}

/// Resolve the service of a legacy stage. `useFromStage` and catalog refs
/// are inlined and the result is written back through a yaml update.
pub fn resolve_legacy_service<'a>(
    ctx: &PlanCreationContext<'a>,
    spec_node: &YamlNode<'a>,
    stage_identifier: &str,
    stage: &DeploymentStageConfig,
    response: &mut PlanCreationResponse,
) -> Result<ResolvedLegacyService<'a>, PlanError> {
    if let Some(anchor) = spec_node.field("serviceConfig") {
        let current: ServiceConfig = deserialize_clean(&anchor)?;
        let mut resolved = current.clone();

        if let Some(use_from) = current.use_from_stage.as_ref().filter(|u| !u.stage.trim().is_empty()) {
            let source = propagation_source(ctx.tree, Some(stage_identifier), &use_from.stage, "serviceConfig")?;
            let source: ServiceConfig = deserialize_clean(&source)?;
            if source.use_from_stage.is_some() {
                return Err(PlanError::invalid_request(format!(
                    "Invalid identifier [{}] given in useFromStage. Cannot reference a stage which also has useFromStage parameter",
                    use_from.stage
                )));
            }
            resolved.service_ref = source.service_ref;
            resolved.service_definition = source.service_definition;
            resolved.use_from_stage = None;
        }

        if resolved.service_definition.is_none() {
            let service_ref = resolved
                .service_ref
                .as_ref()
                .ok_or_else(|| PlanError::invalid_request("Service ref or service definition must be provided"))?
                .concrete("serviceRef")?;
            let entity = ctx.entities.require_service(ctx.scope, service_ref)?;
            resolved.service_definition = Some(entity.service_definition);
        }

        if resolved != current {
            debug!("Writing resolved service config back to {}", anchor.yaml_path());
            write_back(&anchor, &resolved, response)?;
        }

        return Ok(ResolvedLegacyService {
            anchor,
            service_ref: resolved.service_ref,
            service_definition: resolved.service_definition.unwrap_or_default(),
            stage_overrides: resolved.stage_overrides.map(|o| o.overrides),
        });
    }

    if let Some(anchor) = spec_node.field("service") {
        let current: ServiceYamlV2 = deserialize_clean(&anchor)?;
        let mut resolved = current.clone();
        if current.uses_other_stage() {
            let referenced = current
                .use_from_stage
                .as_ref()
                .map(|u| u.stage.clone())
                .unwrap_or_default();
            let source = propagation_source(ctx.tree, Some(stage_identifier), &referenced, "service")?;
            let source: ServiceYamlV2 = deserialize_clean(&source)?;
            if source.uses_other_stage() {
                return Err(PlanError::invalid_request(format!(
                    "Invalid identifier [{}] given in useFromStage. Cannot reference a stage which also has useFromStage parameter",
                    referenced
                )));
            }
            resolved.service_ref = source.service_ref;
            resolved.service_inputs = source.service_inputs;
            resolved.use_from_stage = None;
        }

        let service_ref = resolved
            .service_ref
            .as_ref()
            .ok_or_else(|| PlanError::invalid_request("Service ref must be provided"))?
            .concrete("serviceRef")?
            .clone();
        let entity = ctx.entities.require_service(ctx.scope, &service_ref)?;
        resolved.service_definition = Some(entity.service_definition);
        if resolved != current {
            write_back(&anchor, &resolved, response)?;
        }

        return Ok(ResolvedLegacyService {
            anchor,
            service_ref: resolved.service_ref,
            service_definition: resolved.service_definition.unwrap_or_default(),
            stage_overrides: None,
        });
    }

    if let Some(anchor) = spec_node.field("services") {
        return Ok(ResolvedLegacyService {
            anchor,
            service_ref: Some(ParameterField::Expression(SERVICE_REF_EXPRESSION.to_string())),
            service_definition: ServiceDefinition {
                deployment_type: stage.deployment_type.clone().unwrap_or_default(),
                ..Default::default()
            },
            stage_overrides: None,
        });
    }

    Err(PlanError::invalid_request(
        "Service or Services or ServiceConfig section is missing in the stage",
    ))
}

/// Legacy service section:
/// section -> definition -> [environment] -> spec -> artifacts -> manifests
pub(crate) fn create_legacy_service_plan(
    ctx: &PlanCreationContext<'_>,
    node: YamlNode<'_>,
) -> Result<PlanCreationResponse, PlanError> {
    let metadata: LegacyServiceMetadata = ctx.require_metadata(LEGACY_SERVICE_METADATA)?;
    let service_node_id = node.uuid().to_string();
    let spec_id = format!("serviceSpec-{}", service_node_id);
    let environment_id = format!("environment-{}", service_node_id);
    debug!(
        "Creating legacy service nodes for {}",
        metadata.service_ref.as_deref().unwrap_or("<inline>")
    );

    let mut response = PlanCreationResponse::new();
    let artifacts_id = add_artifacts_chain(&service_node_id, &mut response)?;
    response.add_node(
        PlanNode::new(spec_id.clone(), "serviceSpec", StepType::ServiceSpec, FacilitatorType::Child)
            .with_name("Service Spec")
            .with_parameters(StepParameters::section(artifacts_id)),
    )?;

    let definition_child = match metadata.environment.clone() {
        Some(environment) => {
            response.add_node(create_environment_node(&environment_id, environment, &spec_id))?;
            environment_id
        }
        None => spec_id,
    };
    let definition_id = add_definition_section(&service_node_id, definition_child, &mut response)?;

    let effective = merge_effective_service_config(
        &metadata.service_definition,
        metadata.stage_overrides.as_ref(),
        metadata.overrides.as_ref(),
    );
    let parameters = ServiceStepParameters {
        service_ref: metadata.service_ref.clone(),
        environment_ref: metadata.environment.as_ref().map(|e| e.environment_ref.clone()),
        deployment_type: metadata.deployment_type.clone(),
        child_node_id: Some(definition_id),
        service_definition: Some(effective),
        overrides: metadata.overrides.clone(),
        ..Default::default()
    };
    response.add_node(
        PlanNode::new(service_node_id, "service", StepType::ServiceSection, FacilitatorType::Child)
            .with_name("Service")
            .with_parameters(StepParameters::Service(parameters))
            .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, metadata.next_node_id)),
    )?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
pipeline:
  stages:
    - stage:
        identifier: build
        type: Deployment
        spec:
          service:
            serviceRef: api
            serviceInputs:
              tag: v1
    - parallel:
        - stage:
            identifier: deploy
            type: Deployment
            spec:
              service:
                useFromStage:
                  stage: build
"#;

    #[test]
    fn test_find_stage_inside_parallel() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let stage = find_stage(&tree, "deploy").unwrap();
        assert_eq!(stage.yaml_path(), "pipeline/stages/[1]/parallel/[0]/stage");
        assert!(find_stage(&tree, "missing").is_none());
    }

    #[test]
    fn test_service_parameters_follow_use_from_stage() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let stage: DeploymentStageConfig = find_stage(&tree, "deploy")
            .and_then(|s| s.field("spec"))
            .unwrap()
            .deserialize()
            .unwrap();

        let parameters = ServiceStepParameters::for_stage(&tree, "deploy", &stage).unwrap();
        assert_eq!(parameters.service_ref.as_deref(), Some("api"));
        assert_eq!(parameters.use_from_stage.as_deref(), Some("build"));
        assert_eq!(parameters.service_inputs.unwrap()["tag"], "v1");
    }

    #[test]
    fn test_use_from_unknown_stage_fails() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let stage: DeploymentStageConfig =
            serde_yaml::from_str("service:\n  useFromStage:\n    stage: nowhere\n").unwrap();
        let err = ServiceStepParameters::for_stage(&tree, "deploy", &stage).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_v3_chain() {
        let mut response = PlanCreationResponse::new();
        create_service_nodes_v3("svc", ServiceStepParameters::default(), "infra", &mut response).unwrap();

        let service = &response.nodes["svc"];
        assert_eq!(service.step_type, StepType::ServiceV3);
        assert_eq!(service.referenced_node_ids(), vec!["serviceDefinition-svc", "infra"]);
        assert_eq!(response.nodes["artifacts-svc"].facilitator.facilitator_type, FacilitatorType::Async);
        assert_eq!(
            response.nodes["artifacts-svc"].advisers[0].next_node_id.as_deref(),
            Some("manifests-svc")
        );
    }
}
