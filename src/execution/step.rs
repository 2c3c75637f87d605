//! Executable step contracts

use crate::core::context::Ambiance;
use crate::core::error::StepError;
use crate::core::state::StepResponse;
use crate::execution::delegate::ResponseData;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// What the dispatch half of an async step hands back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsyncExecutableResponse {
    /// Correlation ids the step waits on, in dispatch order
    pub callback_ids: Vec<String>,
}

impl AsyncExecutableResponse {
    pub fn new(callback_ids: Vec<String>) -> Self {
        Self { callback_ids }
    }
}

/// A step that dispatches remote tasks and finishes once they all reply.
///
/// The two halves may run on different workers, so nothing may be kept on
/// `self` between them. State that must survive goes through the sweeping
/// output store.
#[async_trait]
pub trait AsyncExecutable: Send + Sync {
    async fn execute_async(&self, ambiance: &Ambiance) -> Result<AsyncExecutableResponse, StepError>;

    async fn handle_async_response(
        &self,
        ambiance: &Ambiance,
        responses: BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse, StepError>;

    /// Best-effort cleanup. In-flight tasks are not cancelled.
    async fn handle_abort(&self, ambiance: &Ambiance);
}

/// A step that completes in a single call
#[async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(&self, ambiance: &Ambiance) -> Result<StepResponse, StepError>;
}
