//! stageplan - compiles deployment stage YAML into an execution plan graph
//! and drives the async steps of that plan

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod planner;

// Re-export commonly used types
pub use crate::core::config::EngineConfig;
pub use crate::core::entity::{EntityCatalog, EntityResolver};
pub use crate::core::{Ambiance, Plan, PlanError, PlanNode, Scope, Status, StepError, Visibility};
pub use execution::{
    AbortSignal, ArtifactsStep, AsyncStepRunner, ExecutionEvent, LocalDelegate, StepRegistry, SweepingOutputService,
};
pub use persistence::{open_backend, InMemorySweepingOutputBackend, SweepingOutputBackend};
pub use planner::{PlanCreator, PlanResult, PlannerOptions};
