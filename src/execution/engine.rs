//! Async step runner - drives one node through dispatch, join and aggregation

use crate::core::context::Ambiance;
use crate::core::error::StepError;
use crate::core::state::{FailureInfo, Status, StepPhase, StepResponse};
use crate::execution::delegate::TaskResponseJoin;
use crate::execution::step::{AsyncExecutable, SyncExecutable};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Events that can occur while a step runs
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    StepStarted {
        node_id: String,
    },
    PhaseChanged {
        node_id: String,
        phase: StepPhase,
    },
    TasksDispatched {
        node_id: String,
        task_ids: Vec<String>,
    },
    StepCompleted {
        node_id: String,
        status: Status,
    },
    StepFailed {
        node_id: String,
        error: String,
        internal: bool,
    },
    StepAborted {
        node_id: String,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Cooperative cancellation shared between the orchestrator and a run
#[derive(Clone)]
pub struct AbortSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn abort(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn check(&self) -> Result<(), StepError> {
        if self.is_aborted() {
            Err(StepError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolves once [`abort`](Self::abort) has been called
    pub async fn aborted(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns on abort
        let _ = receiver.wait_for(|aborted| *aborted).await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub node_id: String,
    pub status: Status,
    pub failure: Option<FailureInfo>,
    /// Phases in the order they were entered
    pub phases: Vec<StepPhase>,
    pub callback_ids: Vec<String>,
}

impl StepOutcome {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: Status::Running,
            failure: None,
            phases: Vec::new(),
            callback_ids: Vec::new(),
        }
    }
}

/// Runs async and sync steps on behalf of the orchestrator
pub struct AsyncStepRunner {
    join: Arc<dyn TaskResponseJoin>,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl AsyncStepRunner {
    pub fn new(join: Arc<dyn TaskResponseJoin>) -> Self {
        Self {
            join,
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    async fn enter(&self, outcome: &mut StepOutcome, phase: StepPhase) {
        info!("Step {} entered {:?}", outcome.node_id, phase);
        outcome.phases.push(phase);
        self.emit_event(ExecutionEvent::PhaseChanged {
            node_id: outcome.node_id.clone(),
            phase,
        })
        .await;
    }

    /// Run an async step to a terminal status
    pub async fn run(
        &self,
        node_id: &str,
        step: &dyn AsyncExecutable,
        ambiance: &Ambiance,
        signal: &AbortSignal,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::new(node_id);
        self.emit_event(ExecutionEvent::StepStarted {
            node_id: node_id.to_string(),
        })
        .await;

        if signal.is_aborted() {
            return self.abort(outcome, step, ambiance).await;
        }

        let dispatched = match step.execute_async(ambiance).await {
            Ok(dispatched) => dispatched,
            Err(e) => return self.fail(outcome, e).await,
        };
        self.enter(&mut outcome, StepPhase::Dispatched).await;
        outcome.callback_ids = dispatched.callback_ids.clone();
        self.emit_event(ExecutionEvent::TasksDispatched {
            node_id: node_id.to_string(),
            task_ids: dispatched.callback_ids.clone(),
        })
        .await;

        self.enter(&mut outcome, StepPhase::AwaitingResponses).await;
        let responses = if dispatched.callback_ids.is_empty() {
            Ok(Default::default())
        } else {
            tokio::select! {
                biased;
                _ = signal.aborted() => return self.abort(outcome, step, ambiance).await,
                responses = self.join.await_all(&dispatched.callback_ids) => responses,
            }
        };
        let responses = match responses {
            Ok(responses) => responses,
            Err(e) => return self.fail(outcome, e.into()).await,
        };

        if signal.is_aborted() {
            return self.abort(outcome, step, ambiance).await;
        }

        self.enter(&mut outcome, StepPhase::Aggregating).await;
        match step.handle_async_response(ambiance, responses).await {
            Ok(response) => self.finish(outcome, response).await,
            Err(StepError::Aborted) => self.abort(outcome, step, ambiance).await,
            Err(e) => self.fail(outcome, e).await,
        }
    }

    /// Run a sync step to a terminal status
    pub async fn run_sync(
        &self,
        node_id: &str,
        step: &dyn SyncExecutable,
        ambiance: &Ambiance,
        signal: &AbortSignal,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::new(node_id);
        self.emit_event(ExecutionEvent::StepStarted {
            node_id: node_id.to_string(),
        })
        .await;

        if let Err(e) = signal.check() {
            warn!("Step {} not started: {}", node_id, e);
            outcome.status = Status::Aborted;
            outcome.phases.push(StepPhase::Aborted);
            self.emit_event(ExecutionEvent::StepAborted {
                node_id: node_id.to_string(),
            })
            .await;
            return outcome;
        }

        match step.execute_sync(ambiance).await {
            Ok(response) => self.finish(outcome, response).await,
            Err(e) => self.fail(outcome, e).await,
        }
    }

    async fn finish(&self, mut outcome: StepOutcome, response: StepResponse) -> StepOutcome {
        let phase = match response.status {
            Status::Succeeded => StepPhase::Succeeded,
            Status::Skipped => StepPhase::Skipped,
            Status::Aborted => StepPhase::Aborted,
            Status::Failed => StepPhase::Failed,
            Status::Running | Status::AsyncWaiting => {
                return self
                    .fail(
                        outcome,
                        StepError::Internal(format!("Step returned non-terminal status {:?}", response.status)),
                    )
                    .await;
            }
        };
        self.enter(&mut outcome, phase).await;
        outcome.status = response.status;
        outcome.failure = response.failure;
        self.emit_event(ExecutionEvent::StepCompleted {
            node_id: outcome.node_id.clone(),
            status: outcome.status,
        })
        .await;
        outcome
    }

    async fn fail(&self, mut outcome: StepOutcome, e: StepError) -> StepOutcome {
        let internal = e.is_internal();
        error!("Step {} failed: {}", outcome.node_id, e);
        self.enter(&mut outcome, StepPhase::Failed).await;
        outcome.status = Status::Failed;
        outcome.failure = Some(FailureInfo {
            message: e.to_string(),
            internal,
        });
        self.emit_event(ExecutionEvent::StepFailed {
            node_id: outcome.node_id.clone(),
            error: e.to_string(),
            internal,
        })
        .await;
        outcome
    }

    async fn abort(&self, mut outcome: StepOutcome, step: &dyn AsyncExecutable, ambiance: &Ambiance) -> StepOutcome {
        warn!("Step {} aborted", outcome.node_id);
        step.handle_abort(ambiance).await;
        self.enter(&mut outcome, StepPhase::Aborted).await;
        outcome.status = Status::Aborted;
        self.emit_event(ExecutionEvent::StepAborted {
            node_id: outcome.node_id.clone(),
        })
        .await;
        outcome
    }
}
