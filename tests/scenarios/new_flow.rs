//! Test: stages in the current format plan into the service -> infra ->
//! resource constraint -> execution chain

use crate::helpers::*;
use stageplan::core::plan::{AdviserType, FacilitatorType, StepType};
use stageplan::core::yaml::YamlTree;
use stageplan::{PlanCreator, Scope};

#[test]
fn test_single_service_single_environment() {
    let yaml = pipeline_with_spec(
        r#"          deploymentType: Kubernetes
          service:
            serviceRef: api
          environment:
            environmentRef: qa
            infrastructureDefinitions:
              - identifier: k8s-qa"#,
    );

    let result = plan(&yaml).unwrap();
    let plan = &result.plan;

    let services = plan.nodes_of_type(StepType::ServiceV3);
    assert_eq!(services.len(), 1);
    let service = services[0];

    let infra_id = service.advisers[0].next_node_id.clone().unwrap();
    let infra = plan.node(&infra_id).unwrap();
    assert_eq!(infra.step_type, StepType::InfrastructureTask);

    let constraint_id = infra.advisers[0].next_node_id.clone().unwrap();
    assert!(constraint_id.starts_with("resourceConstraint-"));
    let constraint = plan.node(&constraint_id).unwrap();
    let execution = plan.node(constraint.advisers[0].next_node_id.as_deref().unwrap()).unwrap();
    assert_eq!(execution.step_type, StepType::Execution);

    let artifacts = plan.nodes_of_type(StepType::Artifacts);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].facilitator.facilitator_type, FacilitatorType::Async);
    assert_eq!(artifacts[0].advisers[0].adviser_type, AdviserType::NextStep);

    assert!(plan.unreachable_node_ids().is_empty());
}

#[test]
fn test_every_reference_resolves() {
    let yaml = pipeline_with_spec(
        r#"          service:
            serviceRef: api
          environment:
            environmentRef: prod
            deployToAll: true"#,
    );

    let result = plan(&yaml).unwrap();
    for node in result.plan.nodes.values() {
        for id in node.referenced_node_ids() {
            assert!(result.plan.nodes.contains_key(id), "{} -> {} dangles", node.uuid, id);
        }
    }
}

#[test]
fn test_planning_is_repeatable() {
    let yaml = pipeline_with_spec(
        r#"          service:
            serviceRef: api
          environment:
            environmentRef: qa
            deployToAll: true"#,
    );
    let tree = YamlTree::parse(&yaml).unwrap();
    let catalog = catalog();
    let creator = PlanCreator::new(&catalog, Scope::default());

    let first = creator.create_plan_for_tree(tree.clone()).unwrap();
    let second = creator.create_plan_for_tree(tree).unwrap();

    assert_eq!(first.plan.to_json().unwrap(), second.plan.to_json().unwrap());
}

#[test]
fn test_unknown_service_is_not_found() {
    let yaml = pipeline_with_spec(
        r#"          serviceConfig:
            serviceRef: ghost
          infrastructure:
            environmentRef: qa
            infrastructureDefinition:
              type: KubernetesDirect
              spec: {}"#,
    );

    let err = plan(&yaml).unwrap_err();
    assert_eq!(err.to_string(), "Service [ghost] not found");
    assert!(!err.is_retryable());
}

#[test]
fn test_unsupported_stage_type() {
    let yaml = r#"
pipeline:
  stages:
    - stage:
        identifier: approve
        type: Approval
        spec: {}
"#;
    let err = plan(yaml).unwrap_err();
    assert!(err.to_string().contains("Approval"));
}
