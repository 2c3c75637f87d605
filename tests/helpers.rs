//! Test utilities shared by the scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use stageplan::core::error::DispatchError;
use stageplan::core::plan::StepOutcomeGroup;
use stageplan::execution::{ArtifactTaskResponse, RemoteTaskDispatcher, ResponseData, TaskRequest, TaskResponseJoin};
use stageplan::{Ambiance, EntityCatalog, PlanCreator, PlanError, PlanResult, Scope};
use stageplan::core::context::Level;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Catalog with two services, two environments and one group
pub const CATALOG: &str = r#"
services:
  - identifier: api
    serviceDefinition:
      type: Kubernetes
      spec:
        variables:
          - name: tag
            value: "1.0"
        artifacts:
          primary:
            type: DockerRegistry
            spec:
              connectorRef: dockerhub
              imagePath: acme/api
              tag: <+serviceVariables.tag>
          sidecars:
            - sidecar:
                identifier: config
                type: CustomArtifact
                spec:
                  version: v3
  - identifier: web
    serviceDefinition:
      type: Kubernetes
environments:
  - identifier: qa
  - identifier: prod
    type: Production
    overrides:
      variables:
        - name: tag
          value: "2.0"
environmentGroups:
  - identifier: everywhere
    envIdentifiers: [qa, prod]
infrastructures:
  - identifier: k8s-qa
    environmentRef: qa
    type: KubernetesDirect
  - identifier: k8s-prod
    environmentRef: prod
    type: KubernetesDirect
"#;

pub fn catalog() -> EntityCatalog {
    EntityCatalog::from_yaml(CATALOG).expect("catalog fixture parses")
}

pub fn plan(yaml: &str) -> Result<PlanResult, PlanError> {
    let catalog = catalog();
    PlanCreator::new(&catalog, Scope::default()).create_plan(yaml)
}

/// Single deployment stage with the given `spec` body (indented by 10)
pub fn pipeline_with_spec(spec: &str) -> String {
    format!(
        r#"
pipeline:
  identifier: p1
  stages:
    - stage:
        identifier: deploy
        name: Deploy
        type: Deployment
        failureStrategies:
          - onFailure:
              errors: [AllErrors]
              action: {{ type: Abort }}
        spec:
{}
          execution:
            steps:
              - step:
                  identifier: rollout
                  type: K8sRollingDeploy
                  spec: {{}}
"#,
        spec
    )
}

/// Ambiance positioned at a stage, ready for step levels
pub fn stage_ambiance() -> Ambiance {
    Ambiance::new(uuid::Uuid::new_v4().to_string(), Scope::default())
        .with_level(Level::new("pipeline", "p1", Some(StepOutcomeGroup::Pipeline)))
        .with_level(Level::new("stage", "deploy", Some(StepOutcomeGroup::Stage)))
}

pub fn step_ambiance(stage: &Ambiance, node_id: &str, identifier: &str) -> Ambiance {
    stage.with_level(Level::new(node_id, identifier, Some(StepOutcomeGroup::Step)))
}

/// Records every submitted task and hands out sequential ids
#[derive(Default)]
pub struct RecordingDispatcher {
    pub requests: Mutex<Vec<TaskRequest>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteTaskDispatcher for RecordingDispatcher {
    async fn submit_async(&self, request: TaskRequest) -> Result<String, DispatchError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        Ok(format!("task-{}", requests.len()))
    }
}

/// Join that answers from a script. Unscripted ids succeed with
/// `{"taskId": id}` as details.
#[derive(Default, Clone)]
pub struct ScriptedJoin {
    script: Arc<Mutex<HashMap<String, ResponseData>>>,
}

impl ScriptedJoin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, task_id: &str, response: ResponseData) {
        self.script.lock().unwrap().insert(task_id.to_string(), response);
    }

    pub fn fail(&self, task_id: &str, message: &str) {
        self.respond(
            task_id,
            ResponseData::ArtifactTask(ArtifactTaskResponse::failure(message)),
        );
    }
}

#[async_trait]
impl TaskResponseJoin for ScriptedJoin {
    async fn await_all(&self, task_ids: &[String]) -> Result<BTreeMap<String, ResponseData>, DispatchError> {
        let script = self.script.lock().unwrap();
        Ok(task_ids
            .iter()
            .map(|id| {
                let response = script.get(id).cloned().unwrap_or_else(|| {
                    ResponseData::ArtifactTask(ArtifactTaskResponse::success(json!({ "taskId": id })))
                });
                (id.clone(), response)
            })
            .collect())
    }
}
