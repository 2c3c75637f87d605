//! Step execution: remote task collaborators, sweeping outputs, the
//! artifacts and service steps, and the runner that drives them

pub mod artifacts;
pub mod delegate;
pub mod engine;
pub mod log;
pub mod registry;
pub mod service;
pub mod step;
pub mod sweeping;

pub use artifacts::{ArtifactsStep, ArtifactsStepOutput, ARTIFACTS, ARTIFACTS_STEP_V2};
pub use delegate::{
    ArtifactTaskResponse, CommandExecutionStatus, LocalDelegate, RemoteTaskDispatcher, ResponseData, TaskRequest,
    TaskResponseJoin,
};
pub use engine::{AbortSignal, AsyncStepRunner, EventHandler, ExecutionEvent, StepOutcome};
pub use log::{InMemoryLogSink, LogLevel, LogSink, TracingLogSink};
pub use registry::{Executable, StepRegistry};
pub use service::{ServiceOutcome, ServiceStep, SERVICE};
pub use step::{AsyncExecutable, AsyncExecutableResponse, SyncExecutable};
pub use sweeping::SweepingOutputService;
