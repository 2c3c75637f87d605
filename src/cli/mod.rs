//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{LayoutCommand, OutputsCommand, PlanCommand, ValidateCommand};
use std::ffi::OsString;

/// Deployment stage plan compiler
#[derive(Debug, Parser, Clone)]
#[command(name = "stageplan")]
#[command(version = "0.1.0")]
#[command(about = "Compiles deployment stage YAML into an execution plan graph", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Compile a pipeline into a plan
    Plan(PlanCommand),

    /// Check that a pipeline plans cleanly
    Validate(ValidateCommand),

    /// Show the UI graph layout of a pipeline
    Layout(LayoutCommand),

    /// List stored sweeping outputs of a scope
    Outputs(OutputsCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_command() {
        let cli = Cli::try_parse_from([
            "stageplan",
            "plan",
            "--file",
            "pipeline.yaml",
            "--catalog",
            "entities.yaml",
            "--json",
        ])
        .unwrap();

        match cli.command {
            Command::Plan(cmd) => {
                assert_eq!(cmd.file, "pipeline.yaml");
                assert_eq!(cmd.catalog.as_deref(), Some("entities.yaml"));
                assert!(cmd.json);
                assert!(cmd.config.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_verbose_is_global() {
        let cli = Cli::try_parse_from(["stageplan", "outputs", "--scope", "exec1", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Outputs(ref cmd) if cmd.scope == "exec1"));
    }

    #[test]
    fn test_file_is_required() {
        assert!(Cli::try_parse_from(["stageplan", "validate"]).is_err());
    }
}
