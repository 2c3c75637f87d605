//! Core domain models
//!
//! This module defines the yaml tree, the stage and entity documents, the
//! plan graph, and the context values threaded through planning and execution.

pub mod artifact;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod expression;
pub mod parameter;
pub mod plan;
pub mod stage;
pub mod state;
pub mod step;
pub mod yaml;

pub use context::*;
pub use error::*;
pub use plan::*;
pub use state::*;
