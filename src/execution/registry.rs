//! Maps plan node types to the executables that run them

use crate::core::config::EngineConfig;
use crate::core::entity::EntityResolver;
use crate::core::error::StepError;
use crate::core::expression::ExpressionContext;
use crate::core::plan::{PlanNode, StepParameters, StepType};
use crate::execution::artifacts::ArtifactsStep;
use crate::execution::delegate::RemoteTaskDispatcher;
use crate::execution::log::LogSink;
use crate::execution::service::ServiceStep;
use crate::execution::step::{AsyncExecutable, SyncExecutable};
use crate::execution::sweeping::SweepingOutputService;
use std::sync::Arc;

/// Executable built for one node
pub enum Executable {
    Async(Box<dyn AsyncExecutable>),
    Sync(Box<dyn SyncExecutable>),
}

/// Collaborators shared by every executable. Built once at startup.
#[derive(Clone)]
pub struct StepRegistry {
    dispatcher: Arc<dyn RemoteTaskDispatcher>,
    entities: Arc<dyn EntityResolver>,
    outputs: SweepingOutputService,
    log_sink: Arc<dyn LogSink>,
    config: EngineConfig,
    expressions: ExpressionContext,
}

impl StepRegistry {
    pub fn new(
        dispatcher: Arc<dyn RemoteTaskDispatcher>,
        entities: Arc<dyn EntityResolver>,
        outputs: SweepingOutputService,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            dispatcher,
            entities,
            outputs,
            log_sink,
            config: EngineConfig::default(),
            expressions: ExpressionContext::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_expression_context(mut self, context: ExpressionContext) -> Self {
        self.expressions = context;
        self
    }

    /// Executable for `node`, or `None` for structural nodes the orchestrator
    /// handles itself (sections, stages, strategies ...)
    pub fn executable_for(&self, node: &PlanNode) -> Result<Option<Executable>, StepError> {
        match (node.step_type, &node.step_parameters) {
            (StepType::ServiceV3 | StepType::ServiceSection, StepParameters::Service(parameters)) => {
                Ok(Some(Executable::Sync(Box::new(ServiceStep::new(
                    parameters.clone(),
                    self.entities.clone(),
                    self.outputs.clone(),
                    self.log_sink.clone(),
                )))))
            }
            (StepType::ServiceV3 | StepType::ServiceSection, _) => Err(StepError::InvalidRequest(format!(
                "Service node [{}] has no service parameters",
                node.uuid
            ))),
            (StepType::Artifacts, _) => {
                let step = ArtifactsStep::new(self.dispatcher.clone(), self.outputs.clone(), self.log_sink.clone())?
                    .with_config(&self.config)
                    .with_expression_context(self.expressions.clone());
                Ok(Some(Executable::Async(Box::new(step))))
            }
            _ => Ok(None),
        }
    }
}
