//! Test: legacy `serviceConfig` / `infrastructure` stages and the
//! structural checks every stage goes through

use crate::helpers::*;
use stageplan::core::plan::StepType;

#[test]
fn test_legacy_chain_with_resource_constraint() {
    let yaml = pipeline_with_spec(
        r#"          serviceConfig:
            serviceRef: api
          infrastructure:
            environmentRef: qa
            infrastructureDefinition:
              type: KubernetesDirect
              spec:
                namespace: qa"#,
    );

    let result = plan(&yaml).unwrap();
    let plan = &result.plan;

    assert_eq!(plan.nodes_of_type(StepType::ServiceSection).len(), 1);
    assert_eq!(plan.nodes_of_type(StepType::ServiceSpec).len(), 1);
    assert_eq!(plan.nodes_of_type(StepType::Artifacts).len(), 1);
    assert_eq!(plan.nodes_of_type(StepType::InfrastructureSection).len(), 1);
    assert_eq!(plan.nodes_of_type(StepType::ResourceConstraint).len(), 1);
    assert!(plan.unreachable_node_ids().is_empty());
}

#[test]
fn test_infrastructure_and_environment_are_siblings() {
    let yaml = pipeline_with_spec(
        r#"          serviceConfig:
            serviceRef: api
          environment:
            environmentRef: qa
            deployToAll: true
          infrastructure:
            environmentRef: qa
            infrastructureDefinition:
              type: KubernetesDirect"#,
    );

    let err = plan(&yaml).unwrap_err();
    assert!(err.to_string().contains("cannot be siblings"));
}

#[test]
fn test_missing_environment_section() {
    let yaml = pipeline_with_spec(
        r#"          service:
            serviceRef: api"#,
    );

    let err = plan(&yaml).unwrap_err();
    assert!(err
        .to_string()
        .contains("Infrastructure Or Environment or Environment Group section is missing"));
}

#[test]
fn test_service_and_services_are_exclusive() {
    let yaml = pipeline_with_spec(
        r#"          service:
            serviceRef: api
          services:
            values:
              - serviceRef: web
          environment:
            environmentRef: qa
            deployToAll: true"#,
    );

    let err = plan(&yaml).unwrap_err();
    assert!(err.to_string().contains("Only one of service or services"));
}

#[test]
fn test_use_from_stage_cannot_point_at_itself() {
    let yaml = pipeline_with_spec(
        r#"          serviceConfig:
            useFromStage:
              stage: deploy
          infrastructure:
            environmentRef: qa
            infrastructureDefinition:
              type: KubernetesDirect"#,
    );

    let err = plan(&yaml).unwrap_err();
    assert!(err.to_string().contains("cannot propagate service from itself"));
}
