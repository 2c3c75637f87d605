//! Step execution status models

use serde::{Deserialize, Serialize};

/// Terminal and in-flight status of a node run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Running,
    AsyncWaiting,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Skipped | Status::Aborted
        )
    }
}

/// Phase of an async step, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    Dispatched,
    AwaitingResponses,
    Aggregating,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub message: String,
    /// Lost-state failures point at the orchestrator rather than the pipeline
    pub internal: bool,
}

/// Result of running a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: Status::Skipped,
            failure: None,
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: Status::Aborted,
            failure: None,
        }
    }

    pub fn failed(message: impl Into<String>, internal: bool) -> Self {
        Self {
            status: Status::Failed,
            failure: Some(FailureInfo {
                message: message.into(),
                internal,
            }),
        }
    }
}
