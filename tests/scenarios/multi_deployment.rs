//! Test: stages that fan out over services and environments

use crate::helpers::*;
use stageplan::core::plan::{StepParameters, StepType};
use stageplan::planner::multi_deployment::{MultiDeploymentSpawner, MultiDeploymentSubType};
use stageplan::Scope;

fn subtype_of(spec: &str) -> MultiDeploymentSubType {
    let result = plan(&pipeline_with_spec(spec)).unwrap();
    let spawners = result.plan.nodes_of_type(StepType::MultiDeployment);
    assert_eq!(spawners.len(), 1);
    match &spawners[0].step_parameters {
        StepParameters::MultiDeployment(parameters) => parameters.subtype,
        other => panic!("unexpected parameters {:?}", other),
    }
}

#[test]
fn test_services_with_single_environment() {
    let subtype = subtype_of(
        r#"          services:
            values:
              - serviceRef: api
              - serviceRef: web
          environment:
            environmentRef: qa
            deployToAll: true"#,
    );
    assert_eq!(subtype, MultiDeploymentSubType::MultiServiceDeployment);
}

#[test]
fn test_services_with_environments() {
    let subtype = subtype_of(
        r#"          services:
            values:
              - serviceRef: api
              - serviceRef: web
          environments:
            values:
              - environmentRef: qa
                deployToAll: true
              - environmentRef: prod
                deployToAll: true"#,
    );
    assert_eq!(subtype, MultiDeploymentSubType::MultiServiceEnvDeployment);
}

#[test]
fn test_single_service_with_environments() {
    let subtype = subtype_of(
        r#"          service:
            serviceRef: api
          environments:
            values:
              - environmentRef: qa
                deployToAll: true
              - environmentRef: prod
                deployToAll: true"#,
    );
    assert_eq!(subtype, MultiDeploymentSubType::MultiEnvDeployment);
}

#[test]
fn test_spawner_expands_every_combination() {
    let result = plan(&pipeline_with_spec(
        r#"          services:
            values:
              - serviceRef: api
              - serviceRef: web
            metadata:
              parallel: false
          environmentGroup:
            envGroupRef: everywhere
            deployToAll: true"#,
    ))
    .unwrap();

    let spawner = result.plan.nodes_of_type(StepType::MultiDeployment)[0];
    let StepParameters::MultiDeployment(parameters) = &spawner.step_parameters else {
        panic!("spawner without multi deployment parameters");
    };
    // an environment group does not make the environments an axis of the subtype
    assert_eq!(parameters.subtype, MultiDeploymentSubType::MultiServiceDeployment);

    let catalog = catalog();
    let scope = Scope::default();
    let expansion = MultiDeploymentSpawner::new(&catalog, &scope).expand(parameters).unwrap();

    // 2 services x (qa, prod) with one infrastructure each
    assert_eq!(expansion.combinations.len(), 4);
    assert_eq!(expansion.max_concurrency, 1);
    let postfixes: Vec<&str> = expansion
        .combinations
        .iter()
        .map(|c| c.identifier_postfix.as_str())
        .collect();
    assert_eq!(postfixes, vec!["_0", "_1", "_2", "_3"]);
    assert_eq!(expansion.combinations[0].service_ref, "api");
    assert_eq!(expansion.combinations[3].service_ref, "web");
}

#[test]
fn test_multi_deployment_layout_is_matrix() {
    let result = plan(&pipeline_with_spec(
        r#"          services:
            values:
              - serviceRef: api
              - serviceRef: web
          environment:
            environmentRef: qa
            deployToAll: true"#,
    ))
    .unwrap();

    let matrix: Vec<_> = result
        .plan
        .layout_nodes
        .values()
        .filter(|n| n.node_type == "MATRIX")
        .collect();
    assert_eq!(matrix.len(), 1);
    assert_eq!(matrix[0].edge_layout_list.current_node_children.len(), 1);
}

#[test]
fn test_strategy_composes_with_multi_deployment() {
    let yaml = r#"
pipeline:
  identifier: p1
  stages:
    - stage:
        identifier: deploy
        type: Deployment
        failureStrategies:
          - onFailure:
              errors: [AllErrors]
              action: { type: Abort }
        strategy:
          repeat:
            times: 2
        spec:
          services:
            values:
              - serviceRef: api
              - serviceRef: web
          environment:
            environmentRef: qa
            deployToAll: true
          execution:
            steps:
              - step: { identifier: wait, type: Wait, spec: {} }
"#;
    let result = plan(yaml).unwrap();
    let plan = &result.plan;

    let spawner = plan.nodes_of_type(StepType::MultiDeployment)[0];
    let strategy_id = spawner.step_parameters.child_node_ids()[0];
    let strategy = plan.node(strategy_id).unwrap();
    assert_eq!(strategy.step_type, StepType::Strategy);
    assert!(strategy.advisers.is_empty());

    let stage = plan.node(strategy.step_parameters.child_node_ids()[0]).unwrap();
    assert_eq!(stage.step_type, StepType::DeploymentStage);
    assert_eq!(plan.nodes_of_type(StepType::DeploymentStage).len(), 1);

    assert!(plan.validate().is_ok());
    assert!(plan.unreachable_node_ids().is_empty());
}
