//! Deployment stage creator
//!
//! A deployment stage is compiled along one of two flows. The new flow
//! (`service` by reference or `services`, with `environment*`) emits a
//! `ServiceV3` node that resolves overrides at run time, then infrastructure,
//! resource constraint and execution. The legacy flow (`serviceConfig`,
//! pipeline `infrastructure`, gitops) resolves the service and environments
//! while planning and hands them to the service creator.
//!
//! Stages that fan out over services or environments are planned once and
//! wrapped by a multi-deployment spawner; stages with a `strategy` are
//! wrapped by a strategy node. When both apply the strategy sits inside the
//! spawner. The stage node moves to an inner id and the next-stage adviser
//! moves to the outermost wrapper.

use crate::core::error::PlanError;
use crate::core::parameter::{string_of, ParameterField};
use crate::core::plan::{
    AdviserObtainment, Dependency, EdgeLayoutList, FacilitatorType, GraphLayoutNode, PlanCreationResponse,
    PlanNode, StageElementParameters, StepOutcomeGroup, StepParameters, StepType,
};
use crate::core::stage::{stage_run_condition, validate_failure_strategies, DeploymentStageConfig, DeploymentStageNode};
use crate::core::yaml::YamlNode;
use crate::planner::environment::{
    create_environment_group_node, create_git_ops_clusters_node, GitOpsClustersStepParameters,
};
use crate::planner::infrastructure::{
    create_infrastructure_task_node, create_legacy_infrastructure_nodes, create_resource_constraint_node,
    InfrastructureStepParameters,
};
use crate::planner::multi_deployment::{
    create_spawner_node, validate_lists, MultiDeploymentStepParameters, IDENTIFIER_POSTFIX_EXPRESSION,
};
use crate::planner::overrides::{is_matrix_placeholder, EnvironmentPlanCreatorConfig, OverrideResolver, OverridesFromEnvironment};
use crate::planner::service::{
    create_service_nodes_v3, resolve_legacy_service, LegacyServiceMetadata, ServiceStepParameters,
    LEGACY_SERVICE_METADATA,
};
use crate::planner::strategy::{wrap_with_strategy, StrategyConfig};
use crate::planner::{
    deserialize_clean, failure_strategy_advisers, next_sibling_adviser, PlanCreationContext, STAGE_SIBLINGS,
};
use indexmap::IndexMap;
use tracing::{debug, info};

const PARENT_NODE_SUFFIX: &str = "parentNode";

/// True when the stage is compiled along the new service/environment flow
pub fn use_new_flow(spec: &DeploymentStageConfig) -> bool {
    if spec.git_ops_enabled || spec.infrastructure.is_some() {
        return false;
    }
    spec.services.is_some()
        || spec
            .service
            .as_ref()
            .is_some_and(|s| s.has_service_ref() || s.uses_other_stage())
}

/// Fan out through the spawner. Gitops stages sync every environment from a
/// single run instead.
fn spawns_deployments(spec: &DeploymentStageConfig) -> bool {
    spec.is_multi_deployment() && !spec.git_ops_enabled
}

/// Ids the stage is split into
struct StageIds {
    /// Id of the outermost node, the one siblings point at
    outer: String,
    /// Id of the strategy node, when the stage declares one. It sits inside
    /// the spawner when both are present.
    strategy: Option<String>,
    /// Id of the `DeploymentStage` node itself
    stage: String,
    wrapped: bool,
}

pub struct DeploymentStagePlanCreator<'c, 'a> {
    ctx: &'c PlanCreationContext<'a>,
}

impl<'c, 'a> DeploymentStagePlanCreator<'c, 'a> {
    pub fn new(ctx: &'c PlanCreationContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn create(&self, node: YamlNode<'_>) -> Result<PlanCreationResponse, PlanError> {
        let stage: DeploymentStageNode = deserialize_clean(&node)?;
        self.validate(&node, &stage)?;
        info!("Creating plan for deployment stage {}", stage.identifier);

        let mut response = self.create_plan_for_parent_node(&node, &stage)?;
        for (_, child) in self.create_plan_for_children_nodes(&node, &stage)? {
            response.merge(child)?;
        }
        for layout in self.layout_node_info(&node, &stage) {
            response.add_layout_node(layout);
        }
        Ok(response)
    }

    fn validate(&self, node: &YamlNode<'_>, stage: &DeploymentStageNode) -> Result<(), PlanError> {
        let spec = &stage.spec;
        validate_failure_strategies(&stage.failure_strategies)?;
        spec.validate_exclusive_fields()?;
        validate_lists(spec)?;

        if spec.execution.is_none() {
            return Err(PlanError::invalid_yaml("Execution section cannot be absent in a pipeline"));
        }
        if spec.infrastructure.is_some() && spec.environment.is_some() {
            return Err(PlanError::invalid_request(
                "Infrastructure and Environment cannot be siblings of each other",
            ));
        }
        if spec.infrastructure.is_none()
            && spec.environment.is_none()
            && spec.environments.is_none()
            && spec.environment_group.is_none()
        {
            return Err(PlanError::invalid_request(
                "Infrastructure Or Environment or Environment Group section is missing",
            ));
        }
        Ok(())
    }

    fn stage_ids(&self, node: &YamlNode<'_>, stage: &DeploymentStageNode) -> StageIds {
        let outer = node.uuid().to_string();
        let strategy = node.field("strategy");
        match (spawns_deployments(&stage.spec), strategy) {
            (true, Some(strategy)) => StageIds {
                strategy: Some(format!("{}{}", outer, PARENT_NODE_SUFFIX)),
                stage: strategy.uuid().to_string(),
                outer,
                wrapped: true,
            },
            (true, None) => StageIds {
                strategy: None,
                stage: format!("{}{}", outer, PARENT_NODE_SUFFIX),
                outer,
                wrapped: true,
            },
            (false, Some(strategy)) => StageIds {
                strategy: Some(outer.clone()),
                stage: strategy.uuid().to_string(),
                outer,
                wrapped: true,
            },
            (false, None) => StageIds {
                strategy: None,
                stage: outer.clone(),
                outer,
                wrapped: false,
            },
        }
    }

    /// The stage node plus whatever wraps it
    pub fn create_plan_for_parent_node(
        &self,
        node: &YamlNode<'_>,
        stage: &DeploymentStageNode,
    ) -> Result<PlanCreationResponse, PlanError> {
        let spec_node = node
            .field("spec")
            .ok_or_else(|| PlanError::invalid_yaml(format!("Stage [{}] has no spec", stage.identifier)))?;
        let ids = self.stage_ids(node, stage);
        let next: Vec<AdviserObtainment> = next_sibling_adviser(node).into_iter().collect();
        let name = if stage.name.is_empty() {
            stage.identifier.clone()
        } else {
            stage.name.clone()
        };

        let mut response = PlanCreationResponse::new();
        if spawns_deployments(&stage.spec) {
            let child = ids.strategy.clone().unwrap_or_else(|| ids.stage.clone());
            let parameters = MultiDeploymentStepParameters::from_stage(&stage.spec, child)?;
            debug!("Stage {} spawns {:?} deployments", stage.identifier, parameters.subtype);
            response.add_node(create_spawner_node(&ids.outer, &stage.identifier, &name, parameters, next.clone()))?;
            if let Some(strategy_id) = &ids.strategy {
                wrap_with_strategy(node, strategy_id, &stage.identifier, &name, &[], &mut response)?;
            }
        } else {
            wrap_with_strategy(node, &ids.outer, &stage.identifier, &name, &next, &mut response)?;
        }

        let (identifier, display_name, advisers) = if ids.wrapped {
            (
                format!("{}{}", stage.identifier, IDENTIFIER_POSTFIX_EXPRESSION),
                format!("{}{}", name, IDENTIFIER_POSTFIX_EXPRESSION),
                Vec::new(),
            )
        } else {
            (stage.identifier.clone(), name.clone(), next)
        };

        let parameters = StageElementParameters {
            identifier: stage.identifier.clone(),
            name,
            stage_type: stage.stage_type.clone(),
            description: stage.description.clone(),
            child_node_id: spec_node.uuid().to_string(),
            timeout: string_of(&stage.timeout).map(str::to_string),
            variables: stage
                .variables
                .iter()
                .map(|v| (v.name.clone(), v.value.clone()))
                .collect(),
        };
        response.add_node(
            PlanNode::new(ids.stage, identifier, StepType::DeploymentStage, FacilitatorType::Child)
                .with_name(display_name)
                .with_group(StepOutcomeGroup::Stage)
                .with_parameters(StepParameters::Stage(parameters))
                .with_when_condition(Some(stage_run_condition(&stage.when)))
                .with_skip_condition(string_of(&stage.skip_condition).map(str::to_string))
                .with_timeout(string_of(&stage.timeout).map(str::to_string))
                .with_advisers(failure_strategy_advisers(&stage.failure_strategies))
                .with_advisers(advisers),
        )?;
        Ok(response)
    }

    /// Spec node, service, environment and infrastructure nodes, keyed by the
    /// id of the first node of each group
    pub fn create_plan_for_children_nodes(
        &self,
        node: &YamlNode<'_>,
        stage: &DeploymentStageNode,
    ) -> Result<IndexMap<String, PlanCreationResponse>, PlanError> {
        let spec_node = node
            .field("spec")
            .ok_or_else(|| PlanError::invalid_yaml(format!("Stage [{}] has no spec", stage.identifier)))?;
        let execution = spec_node
            .field("execution")
            .ok_or_else(|| PlanError::invalid_yaml("Execution section cannot be absent in a pipeline"))?;

        let mut children = IndexMap::new();
        let mut chain = PlanCreationResponse::new();
        let service_node_id = if use_new_flow(&stage.spec) {
            debug!("Stage {} uses the service/environment flow", stage.identifier);
            self.create_new_flow_nodes(&spec_node, &execution, stage, &mut chain)?
        } else {
            debug!("Stage {} uses the legacy flow", stage.identifier);
            self.create_legacy_flow_nodes(&spec_node, &execution, stage, &mut chain)?
        };

        let mut spec_response = PlanCreationResponse::new();
        spec_response.add_node(
            PlanNode::new(spec_node.uuid(), "spec", StepType::StageSpec, FacilitatorType::Child)
                .with_name("Stage Spec")
                .with_parameters(StepParameters::section(service_node_id)),
        )?;
        spec_response.add_dependency(Dependency::new(&execution));

        children.insert(spec_node.uuid().to_string(), spec_response);
        children.insert(execution.uuid().to_string(), chain);
        Ok(children)
    }

    /// ServiceV3 -> infrastructure task -> resource constraint -> execution.
    /// Returns the service node id.
    fn create_new_flow_nodes(
        &self,
        spec_node: &YamlNode<'_>,
        execution: &YamlNode<'_>,
        stage: &DeploymentStageNode,
        response: &mut PlanCreationResponse,
    ) -> Result<String, PlanError> {
        let service_field = spec_node
            .field("services")
            .or_else(|| spec_node.field("service"))
            .ok_or_else(|| PlanError::invalid_request("Service or Services section is missing in the stage"))?;
        let environment_field = ["environment", "environments", "environmentGroup"]
            .iter()
            .find_map(|name| spec_node.field(name))
            .ok_or_else(|| {
                PlanError::invalid_request("Infrastructure Or Environment or Environment Group section is missing")
            })?;

        let infrastructure_id = environment_field.uuid();
        let constraint_id = format!("resourceConstraint-{}", spec_node.uuid());
        response.add_node(create_resource_constraint_node(
            &constraint_id,
            self.ctx.options.resource_constraint_permits,
            execution.uuid(),
        ))?;
        response.add_node(create_infrastructure_task_node(
            infrastructure_id,
            InfrastructureStepParameters::for_stage(&stage.spec)?,
            Some(&constraint_id),
        ))?;

        let parameters = ServiceStepParameters::for_stage(self.ctx.tree, &stage.identifier, &stage.spec)?;
        create_service_nodes_v3(service_field.uuid(), parameters, infrastructure_id, response)?;
        Ok(service_field.uuid().to_string())
    }

    /// Service section (through a dependency), then environment group,
    /// gitops clusters or infrastructure section, then execution. Returns
    /// the service node id.
    fn create_legacy_flow_nodes(
        &self,
        spec_node: &YamlNode<'_>,
        execution: &YamlNode<'_>,
        stage: &DeploymentStageNode,
        response: &mut PlanCreationResponse,
    ) -> Result<String, PlanError> {
        let spec = &stage.spec;
        let resolved = resolve_legacy_service(self.ctx, spec_node, &stage.identifier, spec, response)?;
        let resolver = OverrideResolver::new(self.ctx.entities, self.ctx.scope);
        // Service overrides are looked up per environment only for a concrete service
        let service_ref = resolved.service_ref.as_ref().filter(|r| !is_matrix_placeholder(r));

        let mut environment: Option<EnvironmentPlanCreatorConfig> = None;
        let next_node_id = if let Some(infrastructure) = spec_node.field("infrastructure") {
            let parameters = InfrastructureStepParameters::for_legacy_stage(spec, None);
            self.add_legacy_infrastructure(infrastructure.uuid(), spec_node, execution, parameters, response)?
        } else if spawns_deployments(spec) {
            // Environments are bound per spawned child
            let environment_field = ["environments", "environmentGroup"]
                .iter()
                .find_map(|name| spec_node.field(name))
                .ok_or_else(|| PlanError::invalid_yaml("Invalid environments section"))?;
            response.add_node(create_infrastructure_task_node(
                environment_field.uuid(),
                InfrastructureStepParameters::for_stage(spec)?,
                Some(execution.uuid()),
            ))?;
            environment_field.uuid().to_string()
        } else if let Some(group_field) = spec_node.field("environmentGroup") {
            let group = spec
                .environment_group
                .as_ref()
                .ok_or_else(|| PlanError::invalid_yaml("Invalid environmentGroup section"))?;
            let resolved_group = resolver.resolve_group(service_ref, group, spec.git_ops_enabled)?;
            let clusters_id = format!("gitOpsClusters-{}", group_field.uuid());
            response.add_node(create_git_ops_clusters_node(
                &clusters_id,
                GitOpsClustersStepParameters::for_group(&resolved_group),
                execution.uuid(),
            ))?;
            response.add_node(create_environment_group_node(group_field.uuid(), resolved_group, &clusters_id)?)?;
            group_field.uuid().to_string()
        } else if let Some(environments_field) = spec_node.field("environments") {
            let values = spec
                .environments
                .as_ref()
                .and_then(|e| e.values.as_ref())
                .ok_or_else(|| PlanError::invalid_yaml("Invalid environments section"))?
                .concrete("environments.values")?;
            let mut parameters = GitOpsClustersStepParameters::default();
            for value in values {
                let config = resolver.resolve(service_ref, value, true)?;
                parameters
                    .clusters_by_environment
                    .insert(config.identifier.clone(), config.git_ops_clusters);
            }
            response.add_node(create_git_ops_clusters_node(
                environments_field.uuid(),
                parameters,
                execution.uuid(),
            ))?;
            environments_field.uuid().to_string()
        } else if let Some(environment_field) = spec_node.field("environment") {
            let environment_yaml = spec
                .environment
                .as_ref()
                .ok_or_else(|| PlanError::invalid_yaml("Invalid environment section"))?;
            let placeholder = environment_yaml
                .environment_ref
                .as_ref()
                .is_some_and(is_matrix_placeholder);

            if placeholder {
                debug!("Environment of stage {} is bound per iteration", stage.identifier);
                if spec.git_ops_enabled {
                    let environment_ref = environment_yaml
                        .environment_ref
                        .as_ref()
                        .map(ParameterField::as_str)
                        .unwrap_or_default();
                    response.add_node(create_git_ops_clusters_node(
                        environment_field.uuid(),
                        GitOpsClustersStepParameters::for_placeholder(environment_ref),
                        execution.uuid(),
                    ))?;
                } else {
                    response.add_node(create_infrastructure_task_node(
                        environment_field.uuid(),
                        InfrastructureStepParameters::for_stage(spec)?,
                        Some(execution.uuid()),
                    ))?;
                }
                environment_field.uuid().to_string()
            } else {
                let config = resolver.resolve(service_ref, environment_yaml, spec.git_ops_enabled)?;
                let next = if spec.git_ops_enabled {
                    response.add_node(create_git_ops_clusters_node(
                        environment_field.uuid(),
                        GitOpsClustersStepParameters::for_environment(&config),
                        execution.uuid(),
                    ))?;
                    environment_field.uuid().to_string()
                } else {
                    let section_id = format!("infrastructure-{}", environment_field.uuid());
                    let parameters = InfrastructureStepParameters::for_legacy_stage(spec, Some(&config));
                    self.add_legacy_infrastructure(&section_id, spec_node, execution, parameters, response)?
                };
                environment = Some(config);
                next
            }
        } else {
            return Err(PlanError::invalid_request(
                "Infrastructure Or Environment or Environment Group section is missing",
            ));
        };

        let metadata = LegacyServiceMetadata {
            service_ref: resolved.service_ref.as_ref().map(|r| r.as_str().to_string()),
            service_definition: resolved.service_definition,
            stage_overrides: resolved.stage_overrides,
            overrides: environment.as_ref().map(OverridesFromEnvironment::from),
            environment,
            next_node_id,
            deployment_type: spec.deployment_type.clone(),
        };
        response.add_dependency(
            Dependency::new(&resolved.anchor).with_metadata(LEGACY_SERVICE_METADATA, &metadata)?,
        );
        Ok(resolved.anchor.uuid().to_string())
    }

    /// Infrastructure section chain, queued behind a resource constraint
    /// unless the target allows simultaneous deployments. Returns the id the
    /// service hands over to.
    fn add_legacy_infrastructure(
        &self,
        section_id: &str,
        spec_node: &YamlNode<'_>,
        execution: &YamlNode<'_>,
        parameters: InfrastructureStepParameters,
        response: &mut PlanCreationResponse,
    ) -> Result<String, PlanError> {
        let after_infrastructure = if parameters.allow_simultaneous_deployments {
            execution.uuid().to_string()
        } else {
            let constraint_id = format!("resourceConstraint-{}", spec_node.uuid());
            response.add_node(create_resource_constraint_node(
                &constraint_id,
                self.ctx.options.resource_constraint_permits,
                execution.uuid(),
            ))?;
            constraint_id
        };
        create_legacy_infrastructure_nodes(section_id, parameters, &after_infrastructure, response)?;
        Ok(section_id.to_string())
    }

    /// Graph layout entries of the stage. Wrapped stages get a strategy
    /// layout node around the stage itself.
    pub fn layout_node_info(&self, node: &YamlNode<'_>, stage: &DeploymentStageNode) -> Vec<GraphLayoutNode> {
        let ids = self.stage_ids(node, stage);
        let next_ids = if node.enclosing_array_name() == Some("stages") {
            node.next_sibling_from_parent_array(STAGE_SIBLINGS)
                .map(|sibling| vec![sibling.uuid().to_string()])
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let name = if stage.name.is_empty() {
            stage.identifier.clone()
        } else {
            stage.name.clone()
        };
        let stage_layout = |uuid: &str, next_ids: Vec<String>| GraphLayoutNode {
            node_uuid: uuid.to_string(),
            node_identifier: stage.identifier.clone(),
            node_type: stage.stage_type.clone(),
            name: name.clone(),
            node_group: "STAGE".to_string(),
            edge_layout_list: EdgeLayoutList {
                current_node_children: Vec::new(),
                next_ids,
            },
        };

        if !ids.wrapped {
            return vec![stage_layout(&ids.outer, next_ids)];
        }

        let node_type = if spawns_deployments(&stage.spec) {
            "MATRIX".to_string()
        } else {
            node.field("strategy")
                .and_then(|s| StrategyConfig::from_node(&s).ok())
                .map(|c| format!("{:?}", c.strategy_type()).to_uppercase())
                .unwrap_or_else(|| "STRATEGY".to_string())
        };
        vec![
            GraphLayoutNode {
                node_uuid: ids.outer.clone(),
                node_identifier: stage.identifier.clone(),
                node_type,
                name: name.clone(),
                node_group: "STRATEGY".to_string(),
                edge_layout_list: EdgeLayoutList {
                    current_node_children: vec![ids.stage.clone()],
                    next_ids,
                },
            },
            stage_layout(&ids.stage, Vec::new()),
        ]
    }
}
