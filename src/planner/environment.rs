//! Environment, environment group and gitops cluster nodes of the legacy flow

use crate::core::error::PlanError;
use crate::core::plan::{AdviserObtainment, AdviserType, FacilitatorType, PlanNode, StepParameters, StepType};
use crate::planner::overrides::{EnvGroupPlanCreatorConfig, EnvironmentPlanCreatorConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which gitops clusters to sync, per environment. An empty list means all
/// clusters of that environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsClustersStepParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_group_ref: Option<String>,
    #[serde(default)]
    pub clusters_by_environment: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub deploy_to_all: bool,
}

impl GitOpsClustersStepParameters {
    pub fn for_environment(environment: &EnvironmentPlanCreatorConfig) -> Self {
        Self {
            env_group_ref: None,
            clusters_by_environment: BTreeMap::from([(
                environment.identifier.clone(),
                environment.git_ops_clusters.clone(),
            )]),
            deploy_to_all: environment.deploy_to_all,
        }
    }

    pub fn for_group(group: &EnvGroupPlanCreatorConfig) -> Self {
        Self {
            env_group_ref: Some(group.env_group_ref.clone()),
            clusters_by_environment: group
                .environments
                .iter()
                .map(|e| (e.identifier.clone(), e.git_ops_clusters.clone()))
                .collect(),
            deploy_to_all: group.deploy_to_all,
        }
    }

    /// Target unknown until a matrix binds the environment
    pub fn for_placeholder(environment_ref: &str) -> Self {
        Self {
            env_group_ref: None,
            clusters_by_environment: BTreeMap::from([(environment_ref.to_string(), Vec::new())]),
            deploy_to_all: false,
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters_by_environment.values().map(Vec::len).sum()
    }
}

/// Environment node that sits between the service definition and the
/// service spec
pub fn create_environment_node(
    uuid: &str,
    environment: EnvironmentPlanCreatorConfig,
    next_node_id: &str,
) -> PlanNode {
    PlanNode::new(uuid, environment.identifier.clone(), StepType::Environment, FacilitatorType::Sync)
        .with_name(environment.name.clone())
        .with_parameters(StepParameters::Environment(environment))
        .with_adviser(AdviserObtainment::next(AdviserType::NextStep, next_node_id))
}

pub fn create_environment_group_node(
    uuid: &str,
    group: EnvGroupPlanCreatorConfig,
    next_node_id: &str,
) -> Result<PlanNode, PlanError> {
    if group.environments.is_empty() {
        return Err(PlanError::invalid_request(format!(
            "Environment group [{}] has no environments to deploy to",
            group.env_group_ref
        )));
    }
    Ok(
        PlanNode::new(uuid, group.identifier.clone(), StepType::EnvironmentGroup, FacilitatorType::Sync)
            .with_name(group.name.clone())
            .with_parameters(StepParameters::EnvironmentGroup(group))
            .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, next_node_id)),
    )
}

pub fn create_git_ops_clusters_node(
    uuid: &str,
    parameters: GitOpsClustersStepParameters,
    next_node_id: &str,
) -> PlanNode {
    PlanNode::new(uuid, "GitopsClusters", StepType::GitOpsClusters, FacilitatorType::Sync)
        .with_name("GitOps Clusters")
        .with_parameters(StepParameters::GitOpsClusters(parameters))
        .with_adviser(AdviserObtainment::next(AdviserType::OnSuccess, next_node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EnvironmentType;

    fn environment(identifier: &str, clusters: &[&str]) -> EnvironmentPlanCreatorConfig {
        EnvironmentPlanCreatorConfig {
            environment_ref: identifier.to_string(),
            identifier: identifier.to_string(),
            name: identifier.to_string(),
            environment_type: EnvironmentType::PreProduction,
            variables: Vec::new(),
            global_override: None,
            service_override: None,
            infrastructure_definitions: Vec::new(),
            git_ops_clusters: clusters.iter().map(|c| c.to_string()).collect(),
            deploy_to_all: false,
        }
    }

    #[test]
    fn test_group_clusters_are_keyed_by_environment() {
        let group = EnvGroupPlanCreatorConfig {
            env_group_ref: "all".to_string(),
            identifier: "all".to_string(),
            name: "All".to_string(),
            deploy_to_all: false,
            environments: vec![environment("qa", &["c1"]), environment("prod", &["c2", "c3"])],
        };
        let parameters = GitOpsClustersStepParameters::for_group(&group);
        assert_eq!(parameters.cluster_count(), 3);
        assert_eq!(parameters.clusters_by_environment["prod"], vec!["c2", "c3"]);
        assert_eq!(parameters.env_group_ref.as_deref(), Some("all"));
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let group = EnvGroupPlanCreatorConfig {
            env_group_ref: "none".to_string(),
            identifier: "none".to_string(),
            name: "None".to_string(),
            deploy_to_all: true,
            environments: Vec::new(),
        };
        assert!(create_environment_group_node("g", group, "next").is_err());
    }

    #[test]
    fn test_environment_node_points_at_service_spec() {
        let node = create_environment_node("env-1", environment("qa", &[]), "serviceSpec-1");
        assert_eq!(node.step_type, StepType::Environment);
        assert_eq!(node.advisers[0].adviser_type, AdviserType::NextStep);
        assert_eq!(node.referenced_node_ids(), vec!["serviceSpec-1"]);
    }
}
