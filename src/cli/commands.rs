//! CLI command definitions

use clap::Args;

/// Compile a pipeline into a plan
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Entity catalog (services, environments, infrastructures)
    #[arg(long)]
    pub catalog: Option<String>,

    /// Engine configuration file
    #[arg(long)]
    pub config: Option<String>,

    /// Print the full plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// Check that a pipeline plans cleanly
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Entity catalog (services, environments, infrastructures)
    #[arg(long)]
    pub catalog: Option<String>,
}

/// Show the UI graph layout of a pipeline
#[derive(Debug, Args, Clone)]
pub struct LayoutCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Entity catalog (services, environments, infrastructures)
    #[arg(long)]
    pub catalog: Option<String>,
}

/// List stored sweeping outputs of a scope
#[derive(Debug, Args, Clone)]
pub struct OutputsCommand {
    /// Sqlite database (defaults under the local data dir)
    #[arg(long)]
    pub db: Option<String>,

    /// Scope key, e.g. a plan execution id
    #[arg(long)]
    pub scope: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
