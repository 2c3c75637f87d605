//! Plan creation: compiles a pipeline yaml tree into a plan graph
//!
//! The driver keeps a queue of [`Dependency`] work items. Each item names a
//! yaml subtree; the subtree's field name selects a [`PlanCreatorKind`], the
//! creator emits nodes plus further dependencies, and any yaml rewrites it
//! asks for are applied before the next item is taken. Planning is strictly
//! sequential and either yields a complete, validated [`Plan`] or fails.

pub mod environment;
pub mod execution;
pub mod infrastructure;
pub mod multi_deployment;
pub mod overrides;
pub mod pipeline;
pub mod service;
pub mod stage;
pub mod strategy;

use crate::core::config::EngineConfig;
use crate::core::context::Scope;
use crate::core::entity::EntityResolver;
use crate::core::error::PlanError;
use crate::core::plan::{
    AdviserObtainment, AdviserType, Dependency, Plan, PlanCreationResponse,
};
use crate::core::stage::FailureStrategyConfig;
use crate::core::yaml::{strip_uuids, YamlNode, YamlTree};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Wrapper keys that can appear as siblings in a `stages` array
pub const STAGE_SIBLINGS: &[&str] = &["stage", "parallel"];
/// Wrapper keys that can appear as siblings in a `steps` array
pub const STEP_SIBLINGS: &[&str] = &["step", "stepGroup", "parallel"];

/// Knobs the planner takes from engine configuration
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    pub resource_constraint_permits: u32,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            resource_constraint_permits: 1,
        }
    }
}

impl From<&EngineConfig> for PlannerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            resource_constraint_permits: config.resource_constraint_permits,
        }
    }
}

/// Everything a creator may read. Creators never see mutable state.
pub struct PlanCreationContext<'a> {
    pub tree: &'a YamlTree,
    pub scope: &'a Scope,
    pub entities: &'a dyn EntityResolver,
    pub options: &'a PlannerOptions,
    pub dependency: &'a Dependency,
}

impl<'a> PlanCreationContext<'a> {
    pub fn metadata<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PlanError> {
        self.dependency.metadata(key)
    }

    pub fn require_metadata<T: DeserializeOwned>(&self, key: &str) -> Result<T, PlanError> {
        self.metadata(key)?.ok_or_else(|| {
            PlanError::invalid_request(format!(
                "Dependency [{}] is missing metadata [{}]",
                self.dependency.yaml_path, key
            ))
        })
    }
}

/// Creator selected for a yaml subtree, keyed by its field name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanCreatorKind {
    Pipeline,
    Stages,
    Parallel,
    Stage,
    Service,
    Execution,
    Step,
    StepGroup,
    Strategy,
}

impl PlanCreatorKind {
    pub fn classify(node: &YamlNode<'_>) -> Result<Self, PlanError> {
        match node.name() {
            "pipeline" => Ok(PlanCreatorKind::Pipeline),
            "stages" => Ok(PlanCreatorKind::Stages),
            "parallel" => Ok(PlanCreatorKind::Parallel),
            "stage" => match node.node_type() {
                Some("Deployment") => Ok(PlanCreatorKind::Stage),
                other => Err(PlanError::UnsupportedStageType(
                    other.unwrap_or("<missing>").to_string(),
                )),
            },
            "serviceConfig" | "service" | "services" => Ok(PlanCreatorKind::Service),
            "execution" => Ok(PlanCreatorKind::Execution),
            "step" => Ok(PlanCreatorKind::Step),
            "stepGroup" => Ok(PlanCreatorKind::StepGroup),
            "strategy" => Ok(PlanCreatorKind::Strategy),
            other => Err(PlanError::invalid_request(format!(
                "No plan creator registered for yaml field [{}]",
                other
            ))),
        }
    }

    fn create(&self, ctx: &PlanCreationContext<'_>, node: YamlNode<'_>) -> Result<PlanCreationResponse, PlanError> {
        match self {
            PlanCreatorKind::Pipeline => pipeline::create_pipeline_plan(ctx, node),
            PlanCreatorKind::Stages => pipeline::create_stages_plan(ctx, node),
            PlanCreatorKind::Parallel => pipeline::create_parallel_plan(ctx, node),
            PlanCreatorKind::Stage => stage::DeploymentStagePlanCreator::new(ctx).create(node),
            PlanCreatorKind::Service => service::create_legacy_service_plan(ctx, node),
            PlanCreatorKind::Execution => execution::create_execution_plan(ctx, node),
            PlanCreatorKind::Step => execution::create_step_plan(ctx, node),
            PlanCreatorKind::StepGroup => execution::create_step_group_plan(ctx, node),
            PlanCreatorKind::Strategy => strategy::create_strategy_plan(ctx, node),
        }
    }
}

/// Result of a planning pass
#[derive(Debug, Clone)]
pub struct PlanResult {
    pub plan: Plan,
    /// The pipeline tree with every yaml update applied
    pub tree: YamlTree,
    /// All yaml updates issued during planning
    pub yaml_updates: std::collections::BTreeMap<String, String>,
}

/// Drives the creators over a pipeline tree
pub struct PlanCreator<'a> {
    entities: &'a dyn EntityResolver,
    scope: Scope,
    options: PlannerOptions,
}

impl<'a> PlanCreator<'a> {
    pub fn new(entities: &'a dyn EntityResolver, scope: Scope) -> Self {
        Self {
            entities,
            scope,
            options: PlannerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PlannerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn create_plan(&self, yaml: &str) -> Result<PlanResult, PlanError> {
        self.create_plan_for_tree(YamlTree::parse(yaml)?)
    }

    pub fn create_plan_for_tree(&self, tree: YamlTree) -> Result<PlanResult, PlanError> {
        let mut tree = tree;
        let pipeline = tree
            .root()
            .field("pipeline")
            .ok_or_else(|| PlanError::invalid_yaml("Yaml does not contain a pipeline"))?;
        let start_node_id = pipeline.uuid().to_string();

        let mut queue = VecDeque::from([Dependency::new(&pipeline)]);
        let mut accumulated = PlanCreationResponse::new();
        let mut yaml_updates = std::collections::BTreeMap::new();

        while let Some(dependency) = queue.pop_front() {
            let mut response = {
                let node = tree
                    .node_by_uuid(&dependency.node_id)
                    .or_else(|| tree.node_by_path(&dependency.yaml_path))
                    .ok_or_else(|| {
                        PlanError::invalid_yaml(format!(
                            "Yaml node [{}] for dependency [{}] no longer exists",
                            dependency.yaml_path, dependency.node_id
                        ))
                    })?;
                let kind = PlanCreatorKind::classify(&node)?;
                debug!("Resolving dependency {} with {:?} creator", node.yaml_path(), kind);

                let ctx = PlanCreationContext {
                    tree: &tree,
                    scope: &self.scope,
                    entities: self.entities,
                    options: &self.options,
                    dependency: &dependency,
                };
                kind.create(&ctx, node)?
            };

            queue.extend(std::mem::take(&mut response.dependencies).into_values());
            let updates = std::mem::take(&mut response.yaml_updates);
            accumulated.merge(response)?;

            if !updates.is_empty() {
                debug!("Applying {} yaml update(s)", updates.len());
                tree = tree.apply_updates(&updates)?;
                yaml_updates.extend(updates);
            }
        }

        let plan = Plan {
            start_node_id,
            nodes: accumulated.nodes,
            layout_nodes: accumulated.layout_nodes,
        };
        plan.validate()?;
        info!("Created plan with {} node(s)", plan.nodes.len());

        Ok(PlanResult {
            plan,
            tree,
            yaml_updates,
        })
    }
}

/// Deserialize a yaml subtree with its node ids dropped
pub(crate) fn deserialize_clean<T: DeserializeOwned>(node: &YamlNode<'_>) -> Result<T, PlanError> {
    let mut value = node.value().clone();
    strip_uuids(&mut value);
    serde_yaml::from_value(value)
        .map_err(|e| PlanError::invalid_yaml(format!("Invalid yaml at [{}]: {}", node.yaml_path(), e)))
}

/// `NextStage` / `NextStep` adviser towards the following element of the
/// enclosing `stages` or `steps` array. Elements of a `parallel` block get none.
pub fn next_sibling_adviser(node: &YamlNode<'_>) -> Option<AdviserObtainment> {
    let (siblings, adviser_type) = match node.enclosing_array_name()? {
        "stages" => (STAGE_SIBLINGS, AdviserType::NextStage),
        "steps" => (STEP_SIBLINGS, AdviserType::NextStep),
        _ => return None,
    };
    node.next_sibling_from_parent_array(siblings)
        .map(|sibling| AdviserObtainment::next(adviser_type, sibling.uuid()))
}

/// Advisers carrying the failure strategies declared on a stage or step
pub fn failure_strategy_advisers(strategies: &[FailureStrategyConfig]) -> Vec<AdviserObtainment> {
    strategies
        .iter()
        .map(|strategy| {
            let adviser_type = match strategy.on_failure.action.action_type.as_str() {
                "Retry" => AdviserType::Retry,
                "Abort" => AdviserType::Abort,
                "Ignore" => AdviserType::Ignore,
                "MarkAsSuccess" => AdviserType::MarkSuccess,
                "ManualIntervention" => AdviserType::ManualIntervention,
                _ => AdviserType::OnFail,
            };
            AdviserObtainment {
                adviser_type,
                next_node_id: None,
                parameters: serde_json::to_value(&strategy.on_failure).ok(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_field_name() {
        let tree = YamlTree::parse(
            r#"
pipeline:
  stages:
    - stage:
        identifier: a
        type: Deployment
    - stage:
        identifier: b
        type: Approval
"#,
        )
        .unwrap();

        let pipeline = tree.node_by_path("pipeline").unwrap();
        assert_eq!(PlanCreatorKind::classify(&pipeline).unwrap(), PlanCreatorKind::Pipeline);

        let deployment = tree.node_by_path("pipeline/stages/[0]/stage").unwrap();
        assert_eq!(PlanCreatorKind::classify(&deployment).unwrap(), PlanCreatorKind::Stage);

        let approval = tree.node_by_path("pipeline/stages/[1]/stage").unwrap();
        assert!(matches!(
            PlanCreatorKind::classify(&approval),
            Err(PlanError::UnsupportedStageType(t)) if t == "Approval"
        ));
    }

    #[test]
    fn test_next_sibling_adviser() {
        let tree = YamlTree::parse(
            r#"
pipeline:
  stages:
    - stage: { identifier: a, type: Deployment }
    - parallel:
        - stage: { identifier: b, type: Deployment }
        - stage: { identifier: c, type: Deployment }
"#,
        )
        .unwrap();

        let first = tree.node_by_path("pipeline/stages/[0]/stage").unwrap();
        let parallel = tree.node_by_path("pipeline/stages/[1]/parallel").unwrap();
        let adviser = next_sibling_adviser(&first).unwrap();
        assert_eq!(adviser.adviser_type, AdviserType::NextStage);
        assert_eq!(adviser.next_node_id.as_deref(), Some(parallel.uuid()));

        let in_parallel = tree.node_by_path("pipeline/stages/[1]/parallel/[0]/stage").unwrap();
        assert!(next_sibling_adviser(&in_parallel).is_none());
        assert!(next_sibling_adviser(&parallel).is_none());
    }
}
