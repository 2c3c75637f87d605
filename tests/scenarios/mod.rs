//! Scenario-based tests for stageplan

mod artifacts_step;
mod legacy_flow;
mod multi_deployment;
mod new_flow;
mod yaml_updates;
