//! Error types shared across planning and execution

use thiserror::Error;

/// Errors raised while compiling a pipeline into a plan.
///
/// Every planning error is fatal for the stage being planned: there is no
/// partial plan and nothing here is worth retrying.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid yaml: {0}")]
    InvalidYaml(String),

    #[error("{kind} [{reference}] not found")]
    NotFound { kind: &'static str, reference: String },

    #[error("Value for {field} must be a concrete value, found expression [{expression}]")]
    UnresolvedExpression { field: String, expression: String },

    #[error("Plan node [{from}] references node [{to}] which is not part of the plan")]
    DanglingReference { from: String, to: String },

    #[error("Stage type [{0}] is not supported")]
    UnsupportedStageType(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PlanError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        PlanError::InvalidRequest(message.into())
    }

    pub fn invalid_yaml(message: impl Into<String>) -> Self {
        PlanError::InvalidYaml(message.into())
    }

    pub fn not_found(kind: &'static str, reference: impl Into<String>) -> Self {
        PlanError::NotFound {
            kind,
            reference: reference.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<serde_yaml::Error> for PlanError {
    fn from(e: serde_yaml::Error) -> Self {
        PlanError::InvalidYaml(e.to_string())
    }
}

impl From<serde_json::Error> for PlanError {
    fn from(e: serde_json::Error) -> Self {
        PlanError::Serialization(e.to_string())
    }
}

/// Errors raised by the sweeping output store
#[derive(Debug, Error)]
pub enum SweepingOutputError {
    #[error("Sweeping output [{name}] already exists in scope [{scope}]")]
    AlreadyExists { scope: String, name: String },

    #[error("Sweeping output [{name}] is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Sweeping output [{0}] not found")]
    NotFound(String),

    #[error("Sweeping output backend error: {0}")]
    Backend(String),
}

/// Errors raised while resolving `<+...>` expressions
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("Unresolved expressions: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("Invalid expression pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by remote task collaborators
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to submit task: {0}")]
    Submit(String),

    #[error("Unknown task [{0}]")]
    UnknownTask(String),

    #[error("Task [{0}] was dropped before it responded")]
    Dropped(String),

    #[error("Task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors raised by a step during dispatch or response handling
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    ArtifactServer(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// State that should have round-tripped between dispatch and response
    /// was lost. This points at the orchestrator, not the pipeline.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Step was aborted")]
    Aborted,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    SweepingOutput(#[from] SweepingOutputError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl StepError {
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            StepError::Internal(_)
                | StepError::SweepingOutput(SweepingOutputError::Corrupt { .. })
                | StepError::SweepingOutput(SweepingOutputError::Backend(_))
        )
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_error_messages() {
        let err = PlanError::not_found("Environment", "prod");
        assert_eq!(err.to_string(), "Environment [prod] not found");
        assert!(!err.is_retryable());

        let err = PlanError::UnresolvedExpression {
            field: "serviceRef".to_string(),
            expression: "<+input>".to_string(),
        };
        assert!(err.to_string().contains("<+input>"));
    }

    #[test]
    fn test_step_error_internal_classification() {
        assert!(StepError::Internal("Unable to read artifacts".to_string()).is_internal());
        assert!(!StepError::ArtifactServer("boom".to_string()).is_internal());
        assert!(StepError::from(SweepingOutputError::Corrupt {
            name: "x".to_string(),
            reason: "truncated".to_string()
        })
        .is_internal());
    }
}
