//! Test: a planned stage's service and artifacts nodes run end to end

use crate::helpers::*;
use stageplan::core::artifact::ArtifactsOutcome;
use stageplan::core::plan::StepType;
use stageplan::core::state::{Status, StepPhase};
use stageplan::execution::{
    Executable, InMemoryLogSink, ResponseData, StepOutcome, StepRegistry, ARTIFACTS,
};
use stageplan::{
    AbortSignal, Ambiance, AsyncStepRunner, ExecutionEvent, InMemorySweepingOutputBackend, PlanResult,
    SweepingOutputService,
};
use std::sync::{Arc, Mutex};

struct Harness {
    registry: StepRegistry,
    dispatcher: Arc<RecordingDispatcher>,
    outputs: SweepingOutputService,
    logs: Arc<InMemoryLogSink>,
    join: ScriptedJoin,
    stage: Ambiance,
}

fn harness() -> Harness {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let outputs = SweepingOutputService::new(Arc::new(InMemorySweepingOutputBackend::new()));
    let logs = Arc::new(InMemoryLogSink::new());
    let registry = StepRegistry::new(dispatcher.clone(), Arc::new(catalog()), outputs.clone(), logs.clone());
    Harness {
        registry,
        dispatcher,
        outputs,
        logs,
        join: ScriptedJoin::new(),
        stage: stage_ambiance(),
    }
}

fn planned(environment: &str) -> PlanResult {
    plan(&pipeline_with_spec(&format!(
        r#"          service:
            serviceRef: api
          environment:
            environmentRef: {}
            deployToAll: true"#,
        environment
    )))
    .unwrap()
}

/// Runs the service node, then the artifacts node, the way the
/// orchestrator would
async fn run_stage(harness: &Harness, result: &PlanResult) -> (StepOutcome, Ambiance) {
    let runner = AsyncStepRunner::new(Arc::new(harness.join.clone()));
    let signal = AbortSignal::new();

    let service = result.plan.nodes_of_type(StepType::ServiceV3)[0];
    let Ok(Some(Executable::Sync(step))) = harness.registry.executable_for(service) else {
        panic!("service node should be sync");
    };
    let ambiance = step_ambiance(&harness.stage, &service.uuid, &service.identifier);
    let outcome = runner.run_sync(&service.uuid, step.as_ref(), &ambiance, &signal).await;
    assert_eq!(outcome.status, Status::Succeeded);

    let artifacts = result.plan.nodes_of_type(StepType::Artifacts)[0];
    let Ok(Some(Executable::Async(step))) = harness.registry.executable_for(artifacts) else {
        panic!("artifacts node should be async");
    };
    let ambiance = step_ambiance(&harness.stage, &artifacts.uuid, &artifacts.identifier);
    let outcome = runner.run(&artifacts.uuid, step.as_ref(), &ambiance, &signal).await;
    (outcome, ambiance)
}

#[tokio::test]
async fn test_primary_fetched_sidecar_resolved_locally() {
    let harness = harness();
    let (outcome, ambiance) = run_stage(&harness, &planned("qa")).await;

    assert_eq!(outcome.status, Status::Succeeded);
    assert_eq!(outcome.callback_ids, vec!["task-1".to_string()]);
    assert_eq!(
        outcome.phases,
        vec![
            StepPhase::Dispatched,
            StepPhase::AwaitingResponses,
            StepPhase::Aggregating,
            StepPhase::Succeeded
        ]
    );

    let requests = harness.dispatcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].parameters["spec"]["tag"], "1.0");

    let artifacts: ArtifactsOutcome = harness.outputs.resolve(&ambiance, ARTIFACTS).await.unwrap();
    let primary = artifacts.primary.unwrap();
    assert_eq!(primary.details.unwrap()["taskId"], "task-1");
    let sidecar = &artifacts.sidecars["config"];
    assert!(sidecar.details.is_none());

    let logs = harness.logs.texts_for(&ambiance.scope_key(stageplan::Visibility::Step));
    assert!(logs.contains(&"Processing primary artifact...".to_string()));
    assert!(logs.contains(&"Processing sidecar artifact [config]...".to_string()));
    assert!(logs.contains(&"Fetched details of primary artifact [status:SUCCESS]".to_string()));
    assert!(logs.contains(&"Fetched details of sidecar artifact [config] [status: SUCCESS]".to_string()));
}

#[tokio::test]
async fn test_environment_override_reaches_artifact() {
    let harness = harness();
    let (outcome, _) = run_stage(&harness, &planned("prod")).await;

    assert_eq!(outcome.status, Status::Succeeded);
    let requests = harness.dispatcher.requests();
    assert_eq!(requests[0].parameters["spec"]["tag"], "2.0");
}

#[tokio::test]
async fn test_failed_fetch_fails_the_step() {
    let harness = harness();
    harness.join.fail("task-1", "image not found");

    let events = Arc::new(Mutex::new(Vec::new()));
    let (outcome, ambiance) = {
        let runner_events = events.clone();
        let runner = AsyncStepRunner::new(Arc::new(harness.join.clone()));
        runner
            .add_event_handler(move |event| runner_events.lock().unwrap().push(event))
            .await;

        let result = planned("qa");
        let service = result.plan.nodes_of_type(StepType::ServiceV3)[0];
        let Ok(Some(Executable::Sync(step))) = harness.registry.executable_for(service) else {
            panic!("service node should be sync");
        };
        let signal = AbortSignal::new();
        let ambiance = step_ambiance(&harness.stage, &service.uuid, &service.identifier);
        runner.run_sync(&service.uuid, step.as_ref(), &ambiance, &signal).await;

        let artifacts = result.plan.nodes_of_type(StepType::Artifacts)[0];
        let Ok(Some(Executable::Async(step))) = harness.registry.executable_for(artifacts) else {
            panic!("artifacts node should be async");
        };
        let ambiance = step_ambiance(&harness.stage, &artifacts.uuid, &artifacts.identifier);
        (runner.run(&artifacts.uuid, step.as_ref(), &ambiance, &signal).await, ambiance)
    };

    assert_eq!(outcome.status, Status::Failed);
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.message, "Artifact delegate task failed: image not found");
    assert!(!failure.internal);

    let unpublished: Option<ArtifactsOutcome> =
        harness.outputs.resolve_optional(&ambiance, ARTIFACTS).await.unwrap();
    assert!(unpublished.is_none());

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepFailed { internal: false, .. }
    )));
}

#[tokio::test]
async fn test_error_notify_is_reported() {
    let harness = harness();
    harness.join.respond(
        "task-1",
        ResponseData::ErrorNotify {
            error_message: "delegate lost".to_string(),
        },
    );

    let (outcome, _) = run_stage(&harness, &planned("qa")).await;

    assert_eq!(outcome.status, Status::Failed);
    assert_eq!(
        outcome.failure.unwrap().message,
        "Failed to fetch artifacts. delegate lost"
    );
}

#[tokio::test]
async fn test_abort_before_start() {
    let harness = harness();
    let result = planned("qa");
    let runner = AsyncStepRunner::new(Arc::new(harness.join.clone()));
    let signal = AbortSignal::new();
    signal.abort();

    let artifacts = result.plan.nodes_of_type(StepType::Artifacts)[0];
    let Ok(Some(Executable::Async(step))) = harness.registry.executable_for(artifacts) else {
        panic!("artifacts node should be async");
    };
    let ambiance = step_ambiance(&harness.stage, &artifacts.uuid, &artifacts.identifier);
    let outcome = runner.run(&artifacts.uuid, step.as_ref(), &ambiance, &signal).await;

    assert_eq!(outcome.status, Status::Aborted);
    assert!(harness.dispatcher.requests().is_empty());
    let logs = harness.logs.texts_for(&ambiance.scope_key(stageplan::Visibility::Step));
    assert_eq!(logs, vec!["Artifacts Step was aborted".to_string()]);
}
