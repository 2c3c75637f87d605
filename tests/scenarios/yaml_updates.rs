//! Test: services resolved during planning are written back into the yaml

use crate::helpers::*;
use stageplan::core::entity::{EntityResolver, ServiceDefinition};
use stageplan::core::yaml::YamlTree;
use stageplan::Scope;

const SERVICE_CONFIG_PATH: &str = "pipeline/stages/[0]/stage/spec/serviceConfig";

fn legacy(service_config: &str) -> String {
    pipeline_with_spec(&format!(
        r#"          serviceConfig:
{}
          infrastructure:
            environmentRef: qa
            infrastructureDefinition:
              type: KubernetesDirect
              spec:
                namespace: qa"#,
        service_config
    ))
}

#[test]
fn test_service_ref_is_inlined() {
    let yaml = legacy("            serviceRef: api");
    let result = plan(&yaml).unwrap();

    assert_eq!(result.yaml_updates.len(), 1);
    assert!(result.yaml_updates.contains_key(SERVICE_CONFIG_PATH));

    let node = result
        .tree
        .node_by_path(&format!("{}/serviceDefinition", SERVICE_CONFIG_PATH))
        .unwrap();
    let inlined: ServiceDefinition = serde_yaml::from_str(&node.to_clean_yaml_string().unwrap()).unwrap();
    let expected = catalog().service(&Scope::default(), "api").unwrap().service_definition;
    assert_eq!(inlined, expected);

    // the ref survives next to the inlined definition
    let config = result.tree.node_by_path(SERVICE_CONFIG_PATH).unwrap();
    assert_eq!(config.string_field("serviceRef"), Some("api"));
}

#[test]
fn test_updates_replay_onto_original_tree() {
    let yaml = legacy("            serviceRef: api");
    let result = plan(&yaml).unwrap();

    let original = YamlTree::parse(&yaml).unwrap();
    let replayed = original.apply_updates(&result.yaml_updates).unwrap();

    let replayed = replayed.node_by_path(SERVICE_CONFIG_PATH).unwrap();
    let planned = result.tree.node_by_path(SERVICE_CONFIG_PATH).unwrap();
    assert_eq!(
        replayed.to_clean_yaml_string().unwrap(),
        planned.to_clean_yaml_string().unwrap()
    );
}

#[test]
fn test_inline_definition_needs_no_update() {
    let yaml = legacy(
        r#"            serviceDefinition:
              type: Kubernetes
              spec:
                variables:
                  - name: replicas
                    value: 2"#,
    );
    let result = plan(&yaml).unwrap();

    assert!(result.yaml_updates.is_empty());
}

#[test]
fn test_use_from_stage_copies_previous_service() {
    let yaml = r#"
pipeline:
  identifier: p1
  stages:
    - stage:
        identifier: qa
        type: Deployment
        failureStrategies:
          - onFailure:
              errors: [AllErrors]
              action: { type: Abort }
        spec:
          serviceConfig:
            serviceRef: api
          infrastructure:
            environmentRef: qa
            infrastructureDefinition:
              type: KubernetesDirect
          execution:
            steps:
              - step: { identifier: wait, type: Wait, spec: {} }
    - stage:
        identifier: prod
        type: Deployment
        failureStrategies:
          - onFailure:
              errors: [AllErrors]
              action: { type: Abort }
        spec:
          serviceConfig:
            useFromStage:
              stage: qa
          infrastructure:
            environmentRef: prod
            infrastructureDefinition:
              type: KubernetesDirect
          execution:
            steps:
              - step: { identifier: wait, type: Wait, spec: {} }
"#;
    let result = plan(yaml).unwrap();

    let copied = result
        .tree
        .node_by_path("pipeline/stages/[1]/stage/spec/serviceConfig")
        .unwrap();
    assert_eq!(copied.string_field("serviceRef"), Some("api"));
    assert!(!copied.has_field("useFromStage"));
    assert!(copied.has_field("serviceDefinition"));
}
