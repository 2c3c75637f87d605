use anyhow::{Context, Result};
use stageplan::cli::commands::{LayoutCommand, OutputsCommand, PlanCommand, ValidateCommand};
use stageplan::cli::output::*;
use stageplan::cli::{Cli, Command};
use stageplan::core::config::{SweepingOutputBackendKind, SweepingOutputConfig};
use stageplan::{open_backend, EngineConfig, EntityCatalog, PlanCreator, PlanResult, PlannerOptions};
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Plan(cmd) => plan_pipeline(cmd)?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Layout(cmd) => show_layout(cmd)?,
        Command::Outputs(cmd) => list_outputs(cmd).await?,
    }

    Ok(())
}

fn load_catalog(path: Option<&str>) -> Result<EntityCatalog> {
    match path {
        Some(path) => EntityCatalog::from_file(path).context("Failed to load entity catalog"),
        None => Ok(EntityCatalog::default()),
    }
}

fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path).context("Failed to load engine config"),
        None => Ok(EngineConfig::default()),
    }
}

fn compile(file: &str, catalog: &EntityCatalog, config: &EngineConfig) -> Result<PlanResult> {
    let yaml = std::fs::read_to_string(file).with_context(|| format!("Failed to read pipeline {}", file))?;
    let result = PlanCreator::new(catalog, config.scope.clone())
        .with_options(PlannerOptions::from(config))
        .create_plan(&yaml)?;
    Ok(result)
}

fn plan_pipeline(cmd: &PlanCommand) -> Result<()> {
    let catalog = load_catalog(cmd.catalog.as_deref())?;
    let config = load_config(cmd.config.as_deref())?;

    println!("{} Planning {}", ROCKET, style(&cmd.file).bold());
    let result = compile(&cmd.file, &catalog, &config)?;

    if cmd.json {
        println!("{}", result.plan.to_json()?);
        return Ok(());
    }

    println!("{}", format_plan_summary(&result.plan));
    for node in result.plan.nodes.values() {
        println!("  {}", format_plan_node(node));
    }
    if !result.yaml_updates.is_empty() {
        println!(
            "{} {} yaml update(s) applied during planning",
            INFO,
            style(result.yaml_updates.len()).cyan()
        );
    }
    let unreachable = result.plan.unreachable_node_ids();
    if !unreachable.is_empty() {
        println!("{} Unreachable nodes: {}", WARN, unreachable.join(", "));
    }

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);
    let catalog = load_catalog(cmd.catalog.as_deref())?;

    match compile(&cmd.file, &catalog, &EngineConfig::default()) {
        Ok(result) => {
            println!("{} Pipeline is valid!", CHECK);
            println!("  Nodes: {}", style(result.plan.nodes.len()).cyan());
            println!("  Yaml updates: {}", style(result.yaml_updates.len()).cyan());
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(&e).red());
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn show_layout(cmd: &LayoutCommand) -> Result<()> {
    let catalog = load_catalog(cmd.catalog.as_deref())?;
    let result = compile(&cmd.file, &catalog, &EngineConfig::default())?;

    if result.plan.layout_nodes.is_empty() {
        println!("{} No layout nodes", INFO);
        return Ok(());
    }
    for node in result.plan.layout_nodes.values() {
        println!("  {}", format_layout_node(node));
    }
    Ok(())
}

async fn list_outputs(cmd: &OutputsCommand) -> Result<()> {
    let config = EngineConfig {
        sweeping_output: SweepingOutputConfig {
            backend: SweepingOutputBackendKind::Sqlite,
            path: cmd.db.as_ref().map(Into::into),
        },
        ..EngineConfig::default()
    };
    let backend = open_backend(&config).await?;
    let entries = backend.list(&cmd.scope).await?;

    if entries.is_empty() {
        println!("{} No outputs found in {}", INFO, style(&cmd.scope).bold());
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "outputs": entries });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Outputs in {}:", INFO, style(&cmd.scope).bold());
        for entry in &entries {
            println!("  {}", format_output_entry(entry));
        }
    }

    Ok(())
}
