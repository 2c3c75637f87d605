//! Plan graph model: nodes, dependencies and the per-creator response
//!
//! Nodes refer to each other by id string. Forward references are allowed
//! while creators run; [`Plan::validate`] checks that every referenced id was
//! eventually allocated.

use crate::core::error::PlanError;
use crate::core::step::{StepEnvelope, StepKind};
use crate::core::yaml::YamlNode;
use crate::planner::environment::GitOpsClustersStepParameters;
use crate::planner::infrastructure::InfrastructureStepParameters;
use crate::planner::multi_deployment::MultiDeploymentStepParameters;
use crate::planner::overrides::{EnvGroupPlanCreatorConfig, EnvironmentPlanCreatorConfig};
use crate::planner::service::ServiceStepParameters;
use crate::planner::strategy::StrategyStepParameters;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcomeGroup {
    Pipeline,
    Stages,
    Stage,
    Execution,
    StepGroup,
    Step,
    Strategy,
}

/// How the orchestrator runs a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Child,
    Children,
    ChildChain,
    Sync,
    Async,
    Task,
    TaskChain,
    ResourceRestraint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorObtainment {
    #[serde(rename = "type")]
    pub facilitator_type: FacilitatorType,
}

/// What the orchestrator does once a node completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    NextStep,
    NextStage,
    OnSuccess,
    OnFail,
    Retry,
    Abort,
    Ignore,
    MarkSuccess,
    ManualIntervention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub adviser_type: AdviserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl AdviserObtainment {
    pub fn next(adviser_type: AdviserType, next_node_id: impl Into<String>) -> Self {
        Self {
            adviser_type,
            next_node_id: Some(next_node_id.into()),
            parameters: None,
        }
    }
}

/// Closed set of node types the orchestrator dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    Pipeline,
    Stages,
    Parallel,
    DeploymentStage,
    StageSpec,
    ServiceSection,
    ServiceV3,
    ServiceDefinition,
    ServiceSpec,
    Artifacts,
    Manifests,
    Environment,
    EnvironmentGroup,
    GitOpsClusters,
    InfrastructureSection,
    InfrastructureDefinition,
    InfrastructureTask,
    Provisioner,
    ResourceConstraint,
    Execution,
    StepGroup,
    Strategy,
    MultiDeployment,
    Step(StepKind),
}

/// Single-child section node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionStepParameters {
    pub child_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStepParameters {
    pub child_node_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageElementParameters {
    pub identifier: String,
    pub name: String,
    pub stage_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub child_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConstraintParameters {
    pub resource_unit: String,
    pub name: String,
    pub permits: u32,
    pub hold_across_stages: bool,
}

/// Serialized step parameters, tagged by payload kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "parameterType")]
pub enum StepParameters {
    Empty,
    Section(SectionStepParameters),
    Parallel(ParallelStepParameters),
    Stage(StageElementParameters),
    Service(ServiceStepParameters),
    Environment(EnvironmentPlanCreatorConfig),
    EnvironmentGroup(EnvGroupPlanCreatorConfig),
    GitOpsClusters(GitOpsClustersStepParameters),
    Infrastructure(InfrastructureStepParameters),
    Step(StepEnvelope),
    Strategy(StrategyStepParameters),
    MultiDeployment(MultiDeploymentStepParameters),
    ResourceConstraint(ResourceConstraintParameters),
}

impl StepParameters {
    pub fn section(child_node_id: impl Into<String>) -> Self {
        StepParameters::Section(SectionStepParameters {
            child_node_id: child_node_id.into(),
            log_message: None,
        })
    }

    pub fn child_node_ids(&self) -> Vec<&str> {
        match self {
            StepParameters::Section(p) => vec![p.child_node_id.as_str()],
            StepParameters::Parallel(p) => p.child_node_ids.iter().map(String::as_str).collect(),
            StepParameters::Stage(p) => vec![p.child_node_id.as_str()],
            StepParameters::Service(p) => p.child_node_id.as_deref().into_iter().collect(),
            StepParameters::Strategy(p) => vec![p.child_node_id.as_str()],
            StepParameters::MultiDeployment(p) => vec![p.child_node_id.as_str()],
            _ => Vec::new(),
        }
    }
}

/// A vertex of the plan graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub group: Option<StepOutcomeGroup>,
    pub step_type: StepType,
    pub step_parameters: StepParameters,
    #[serde(default)]
    pub skip_condition: Option<String>,
    #[serde(default)]
    pub when_condition: Option<String>,
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
    pub facilitator: FacilitatorObtainment,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub execution_input_template: Option<String>,
}

impl PlanNode {
    pub fn new(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
        facilitator_type: FacilitatorType,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            group: None,
            step_type,
            step_parameters: StepParameters::Empty,
            skip_condition: None,
            when_condition: None,
            advisers: Vec::new(),
            facilitator: FacilitatorObtainment { facilitator_type },
            timeout: None,
            execution_input_template: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_group(mut self, group: StepOutcomeGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_parameters(mut self, parameters: StepParameters) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_advisers(mut self, advisers: impl IntoIterator<Item = AdviserObtainment>) -> Self {
        self.advisers.extend(advisers);
        self
    }

    pub fn with_skip_condition(mut self, condition: Option<String>) -> Self {
        self.skip_condition = condition;
        self
    }

    pub fn with_when_condition(mut self, condition: Option<String>) -> Self {
        self.when_condition = condition;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<String>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_execution_input_template(mut self, template: Option<String>) -> Self {
        self.execution_input_template = template;
        self
    }

    /// Ids this node points at, through its parameters or its advisers
    pub fn referenced_node_ids(&self) -> Vec<&str> {
        let mut ids = self.step_parameters.child_node_ids();
        ids.extend(self.advisers.iter().filter_map(|a| a.next_node_id.as_deref()));
        ids
    }

    /// Opaque payload handed to the executor of this node
    pub fn step_parameters_blob(&self) -> Result<Vec<u8>, PlanError> {
        Ok(serde_json::to_vec(&self.step_parameters)?)
    }
}

/// A yaml subtree still waiting to be compiled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub node_id: String,
    pub yaml_path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Vec<u8>>,
}

impl Dependency {
    pub fn new(node: &YamlNode<'_>) -> Self {
        Self {
            node_id: node.uuid().to_string(),
            yaml_path: node.yaml_path().to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata<T: Serialize>(mut self, key: &str, value: &T) -> Result<Self, PlanError> {
        self.metadata.insert(key.to_string(), serde_json::to_vec(value)?);
        Ok(self)
    }

    pub fn metadata<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PlanError> {
        match self.metadata.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeLayoutList {
    pub current_node_children: Vec<String>,
    pub next_ids: Vec<String>,
}

/// Node of the UI graph layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphLayoutNode {
    pub node_uuid: String,
    pub node_identifier: String,
    pub node_type: String,
    pub name: String,
    pub node_group: String,
    pub edge_layout_list: EdgeLayoutList,
}

/// What one creator invocation produced
#[derive(Debug, Clone, Default)]
pub struct PlanCreationResponse {
    pub nodes: IndexMap<String, PlanNode>,
    pub dependencies: IndexMap<String, Dependency>,
    /// Yaml path -> replacement yaml
    pub yaml_updates: BTreeMap<String, String>,
    pub layout_nodes: IndexMap<String, GraphLayoutNode>,
    pub start_node_id: Option<String>,
}

impl PlanCreationResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: PlanNode) -> Result<(), PlanError> {
        if self.nodes.contains_key(&node.uuid) {
            return Err(PlanError::invalid_request(format!(
                "Duplicate plan node id [{}]",
                node.uuid
            )));
        }
        self.nodes.insert(node.uuid.clone(), node);
        Ok(())
    }

    pub fn add_dependency(&mut self, dependency: Dependency) {
        self.dependencies.insert(dependency.node_id.clone(), dependency);
    }

    pub fn add_yaml_update(&mut self, yaml_path: impl Into<String>, yaml: impl Into<String>) {
        self.yaml_updates.insert(yaml_path.into(), yaml.into());
    }

    pub fn add_layout_node(&mut self, node: GraphLayoutNode) {
        self.layout_nodes.insert(node.node_uuid.clone(), node);
    }

    pub fn merge(&mut self, other: PlanCreationResponse) -> Result<(), PlanError> {
        for (_, node) in other.nodes {
            self.add_node(node)?;
        }
        self.dependencies.extend(other.dependencies);
        self.yaml_updates.extend(other.yaml_updates);
        self.layout_nodes.extend(other.layout_nodes);
        if self.start_node_id.is_none() {
            self.start_node_id = other.start_node_id;
        }
        Ok(())
    }
}

/// The compiled plan: an arena of nodes keyed by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub start_node_id: String,
    pub nodes: IndexMap<String, PlanNode>,
    #[serde(default)]
    pub layout_nodes: IndexMap<String, GraphLayoutNode>,
}

impl Plan {
    /// Every child / next reference must name a node of this plan
    pub fn validate(&self) -> Result<(), PlanError> {
        if !self.nodes.contains_key(&self.start_node_id) {
            return Err(PlanError::DanglingReference {
                from: "<start>".to_string(),
                to: self.start_node_id.clone(),
            });
        }
        for node in self.nodes.values() {
            for id in node.referenced_node_ids() {
                if !self.nodes.contains_key(id) {
                    return Err(PlanError::DanglingReference {
                        from: node.uuid.clone(),
                        to: id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, uuid: &str) -> Option<&PlanNode> {
        self.nodes.get(uuid)
    }

    pub fn nodes_of_type(&self, step_type: StepType) -> Vec<&PlanNode> {
        self.nodes.values().filter(|n| n.step_type == step_type).collect()
    }

    /// Ids not reachable from the start node
    pub fn unreachable_node_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.start_node_id.as_str()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.referenced_node_ids());
            }
        }
        self.nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !seen.contains(id))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(uuid: &str) -> PlanNode {
        PlanNode::new(uuid, uuid, StepType::Execution, FacilitatorType::Child)
    }

    #[test]
    fn test_duplicate_node_ids_are_rejected() {
        let mut response = PlanCreationResponse::new();
        response.add_node(node("a")).unwrap();
        assert!(response.add_node(node("a")).is_err());

        let mut other = PlanCreationResponse::new();
        other.add_node(node("a")).unwrap();
        assert!(response.merge(other).is_err());
    }

    #[test]
    fn test_validate_reports_dangling_reference() {
        let mut nodes = IndexMap::new();
        nodes.insert(
            "a".to_string(),
            node("a").with_parameters(StepParameters::section("b")),
        );
        let plan = Plan {
            start_node_id: "a".to_string(),
            nodes,
            layout_nodes: IndexMap::new(),
        };

        let err = plan.validate().unwrap_err();
        assert!(matches!(err, PlanError::DanglingReference { ref to, .. } if to == "b"));
    }

    #[test]
    fn test_reachability_follows_children_and_advisers() {
        let mut nodes = IndexMap::new();
        nodes.insert(
            "a".to_string(),
            node("a").with_parameters(StepParameters::section("b")),
        );
        nodes.insert(
            "b".to_string(),
            node("b").with_adviser(AdviserObtainment::next(AdviserType::NextStep, "c")),
        );
        nodes.insert("c".to_string(), node("c"));
        nodes.insert("orphan".to_string(), node("orphan"));
        let plan = Plan {
            start_node_id: "a".to_string(),
            nodes,
            layout_nodes: IndexMap::new(),
        };

        plan.validate().unwrap();
        assert_eq!(plan.unreachable_node_ids(), vec!["orphan"]);
    }

    #[test]
    fn test_parameters_round_trip_through_blob() {
        let node = node("a").with_parameters(StepParameters::section("b"));
        let blob = node.step_parameters_blob().unwrap();
        let parsed: StepParameters = serde_json::from_slice(&blob).unwrap();
        assert_eq!(parsed, node.step_parameters);
    }
}
