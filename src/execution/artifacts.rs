//! Artifacts step: fetches primary and sidecar artifact details through
//! delegate tasks and publishes them for the rest of the stage

use crate::core::artifact::{ArtifactConfig, ArtifactOutcome, ArtifactsOutcome};
use crate::core::config::EngineConfig;
use crate::core::context::{Ambiance, Visibility};
use crate::core::error::{ExpressionError, StepError};
use crate::core::expression::{ExpressionContext, ExpressionResolver, VariablesFunctor};
use crate::core::state::StepResponse;
use crate::execution::delegate::{
    ArtifactTaskResponse, CommandExecutionStatus, RemoteTaskDispatcher, ResponseData, TaskRequest,
};
use crate::execution::log::{LogLevel, LogSink};
use crate::execution::service::{ServiceOutcome, SERVICE};
use crate::execution::step::{AsyncExecutable, AsyncExecutableResponse};
use crate::execution::sweeping::SweepingOutputService;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Step-scoped output carrying dispatch state to the response half
pub const ARTIFACTS_STEP_V2: &str = "artifacts_step_v2";
/// Stage-visible output holding the fetched artifacts
pub const ARTIFACTS: &str = "artifacts";

/// What the dispatch half recorded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsStepOutput {
    #[serde(default)]
    pub primary_artifact_task_id: Option<String>,
    #[serde(default)]
    pub artifact_configs_by_task_id: BTreeMap<String, ArtifactConfig>,
    /// Artifacts resolved in place, without a remote task
    #[serde(default)]
    pub artifact_configs_without_task: Vec<ArtifactConfig>,
}

pub struct ArtifactsStep {
    dispatcher: Arc<dyn RemoteTaskDispatcher>,
    outputs: SweepingOutputService,
    log_sink: Arc<dyn LogSink>,
    resolver: ExpressionResolver,
    context: ExpressionContext,
    task_timeout: Duration,
    default_selectors: Vec<String>,
}

impl ArtifactsStep {
    pub fn new(
        dispatcher: Arc<dyn RemoteTaskDispatcher>,
        outputs: SweepingOutputService,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Self, ExpressionError> {
        Ok(Self {
            dispatcher,
            outputs,
            log_sink,
            resolver: ExpressionResolver::new()?,
            context: ExpressionContext::new(),
            task_timeout: Duration::from_secs(60),
            default_selectors: Vec::new(),
        })
    }

    pub fn with_expression_context(mut self, context: ExpressionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_default_selectors(mut self, selectors: Vec<String>) -> Self {
        self.default_selectors = selectors;
        self
    }

    /// Take timeout and selectors from engine configuration
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_task_timeout(config.task_timeout())
            .with_default_selectors(config.default_delegate_selectors.clone())
    }

    fn log(&self, ambiance: &Ambiance, level: LogLevel, text: &str) {
        self.log_sink
            .append_line(&ambiance.scope_key(Visibility::Step), level, text);
    }

    /// Artifact configs of the service, with the primary source selected
    /// and expressions resolved
    fn artifact_configs(&self, service: &ServiceOutcome) -> Result<Vec<ArtifactConfig>, StepError> {
        let Some(mut artifacts) = service.service_definition.spec.artifacts.clone() else {
            return Ok(Vec::new());
        };
        artifacts.select_primary_source();

        let variables: HashMap<String, Value> = service
            .service_definition
            .spec
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();
        let context = self
            .context
            .clone()
            .with_functor("serviceVariables", Arc::new(VariablesFunctor::new(variables)));

        let mut configs = Vec::new();
        for config in artifacts.artifact_configs() {
            let (rendered, unresolved) = self.resolver.render(&context, &config)?;
            if !unresolved.is_empty() {
                warn!(
                    "Artifact [{}] has unresolved expressions: {}",
                    config.identifier,
                    unresolved.join(", ")
                );
            }
            configs.push(rendered);
        }
        Ok(configs)
    }

    fn task_request(&self, ambiance: &Ambiance, config: &ArtifactConfig) -> TaskRequest {
        let mut selectors = config.delegate_selectors();
        if selectors.is_empty() {
            selectors = self.default_selectors.clone();
        }
        TaskRequest {
            task_type: config.source_type.task_type().to_string(),
            parameters: json!({
                "identifier": config.identifier,
                "sourceType": config.source_type,
                "spec": config.spec,
            }),
            selectors,
            account_id: ambiance.account_id().to_string(),
            timeout_secs: self.task_timeout.as_secs(),
        }
    }

    fn log_fetched(&self, ambiance: &Ambiance, config: &ArtifactConfig, status: &str) {
        let text = if config.primary_artifact {
            format!("Fetched details of primary artifact [status:{}]", status)
        } else {
            format!(
                "Fetched details of sidecar artifact [{}] [status: {}]",
                config.identifier, status
            )
        };
        self.log(ambiance, LogLevel::Info, &text);
    }
}

/// Failure message of a response, `None` when it succeeded
fn failure_message(response: &ResponseData) -> Option<String> {
    match response {
        ResponseData::ErrorNotify { error_message } => {
            Some(format!("Failed to fetch artifacts. {}", error_message))
        }
        ResponseData::ArtifactTask(task) => match task.command_execution_status {
            CommandExecutionStatus::Success => None,
            CommandExecutionStatus::Failure => Some(format!(
                "Artifact delegate task failed: {}",
                task.error_message.as_deref().unwrap_or_default()
            )),
            other => Some(format!("Unhandled command execution status: {}", other)),
        },
    }
}

fn status_label(response: &ResponseData) -> String {
    match response {
        ResponseData::ErrorNotify { .. } => CommandExecutionStatus::Failure.to_string(),
        ResponseData::ArtifactTask(task) => task.command_execution_status.to_string(),
    }
}

fn details(task: &ArtifactTaskResponse) -> Option<Value> {
    task.artifact_delegate_responses.first().cloned()
}

fn place(outcome: &mut ArtifactsOutcome, artifact: ArtifactOutcome) {
    if artifact.primary_artifact {
        outcome.primary = Some(artifact);
    } else {
        outcome.sidecars.insert(artifact.identifier.clone(), artifact);
    }
}

#[async_trait]
impl AsyncExecutable for ArtifactsStep {
    async fn execute_async(&self, ambiance: &Ambiance) -> Result<AsyncExecutableResponse, StepError> {
        let service: Option<ServiceOutcome> = self.outputs.resolve_optional(ambiance, SERVICE).await?;
        let configs = match &service {
            Some(service) => self.artifact_configs(service)?,
            None => {
                warn!("No service output found, nothing to fetch");
                Vec::new()
            }
        };

        let mut output = ArtifactsStepOutput::default();
        let mut callback_ids = Vec::new();

        if configs.is_empty() {
            self.log(ambiance, LogLevel::Info, "No artifact configuration found");
        }

        for config in configs {
            if config.primary_artifact {
                self.log(ambiance, LogLevel::Info, "Processing primary artifact...");
                self.log(
                    ambiance,
                    LogLevel::Info,
                    &format!("Primary artifact info: {}", config.log_info()),
                );
            } else {
                self.log(
                    ambiance,
                    LogLevel::Info,
                    &format!("Processing sidecar artifact [{}]...", config.identifier),
                );
                self.log(
                    ambiance,
                    LogLevel::Info,
                    &format!("Sidecar artifact [{}] info: {}", config.identifier, config.log_info()),
                );
            }

            if !config.needs_remote_fetch() {
                debug!("Artifact [{}] resolved without a delegate task", config.identifier);
                output.artifact_configs_without_task.push(config);
                continue;
            }

            if config.primary_artifact {
                self.log(
                    ambiance,
                    LogLevel::Info,
                    "Starting delegate task to fetch details of primary artifact",
                );
            }
            let task_id = self.dispatcher.submit_async(self.task_request(ambiance, &config)).await?;
            debug!("Artifact [{}] dispatched as task {}", config.identifier, task_id);
            if config.primary_artifact {
                output.primary_artifact_task_id = Some(task_id.clone());
            }
            output.artifact_configs_by_task_id.insert(task_id.clone(), config);
            callback_ids.push(task_id);
        }

        self.outputs
            .consume(ambiance, ARTIFACTS_STEP_V2, &output, Visibility::Step)
            .await?;
        info!("Artifacts step dispatched {} task(s)", callback_ids.len());

        Ok(AsyncExecutableResponse::new(callback_ids))
    }

    async fn handle_async_response(
        &self,
        ambiance: &Ambiance,
        responses: BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse, StepError> {
        let output: ArtifactsStepOutput = self
            .outputs
            .resolve_optional(ambiance, ARTIFACTS_STEP_V2)
            .await?
            .ok_or_else(|| StepError::Internal("Unable to read artifacts".to_string()))?;

        if responses.is_empty()
            && output.artifact_configs_by_task_id.is_empty()
            && output.artifact_configs_without_task.is_empty()
        {
            return Ok(StepResponse::skipped());
        }

        if let Some(missing) = output
            .artifact_configs_by_task_id
            .keys()
            .find(|id| !responses.contains_key(*id))
        {
            return Err(StepError::Internal(format!(
                "No response received for artifact task [{}]",
                missing
            )));
        }

        let mut first_failure = None;
        for (task_id, response) in &responses {
            match output.artifact_configs_by_task_id.get(task_id) {
                Some(config) => self.log_fetched(ambiance, config, &status_label(response)),
                None => warn!("Response for unknown artifact task {}", task_id),
            }
            if first_failure.is_none() {
                first_failure = failure_message(response);
            }
        }
        if let Some(message) = first_failure {
            return Err(StepError::ArtifactServer(message));
        }

        let mut outcome = ArtifactsOutcome::default();
        for (task_id, response) in &responses {
            let (Some(config), ResponseData::ArtifactTask(task)) =
                (output.artifact_configs_by_task_id.get(task_id), response)
            else {
                continue;
            };
            let mut artifact = ArtifactOutcome::from_config(config, details(task));
            artifact.primary_artifact = output.primary_artifact_task_id.as_deref() == Some(task_id.as_str());
            place(&mut outcome, artifact);
        }
        for config in &output.artifact_configs_without_task {
            self.log_fetched(ambiance, config, &CommandExecutionStatus::Success.to_string());
            place(&mut outcome, ArtifactOutcome::from_config(config, None));
        }

        self.outputs
            .consume(ambiance, ARTIFACTS, &outcome, Visibility::Stage)
            .await?;
        Ok(StepResponse::succeeded())
    }

    async fn handle_abort(&self, ambiance: &Ambiance) {
        self.log(ambiance, LogLevel::Error, "Artifacts Step was aborted");
    }
}
