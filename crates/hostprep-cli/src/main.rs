//! hostprep - idempotent host provisioning CLI
//!
//! ## Commands
//!
//! - `run`: Execute the plan, skipping steps whose effect already exists
//! - `steps`: List the plan's steps in execution order
//! - `render-config`: Print the configuration document the plan would write

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostprep_core::{
    CancelFlag, ExecutionEngine, Plan, RunOptions, RunReport, StepContext, StepOutcome,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "hostprep")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Idempotent host provisioning", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and a JSON run report
    #[arg(long, global = true)]
    json: bool,

    /// Plan file (TOML). Uses the built-in storage-node plan when omitted
    #[arg(long, global = true, env = "HOSTPREP_PLAN")]
    plan: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the host
    Run {
        /// Evaluate checks and report what would run, without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Start at the named step, skipping all earlier steps
        #[arg(long)]
        from_step: Option<String>,
    },

    /// List the plan's steps in execution order
    Steps,

    /// Print the rendered configuration document
    RenderConfig,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    hostprep_core::init_tracing(cli.json, level);

    let plan = load_plan(cli.plan.as_deref())?;

    match cli.command {
        Commands::Run { dry_run, from_step } => {
            let options = RunOptions { dry_run, from_step };
            cmd_run(&plan, &options, cli.json).await
        }
        Commands::Steps => cmd_steps(&plan),
        Commands::RenderConfig => cmd_render_config(&plan),
    }
}

fn load_plan(path: Option<&Path>) -> Result<Plan> {
    match path {
        Some(path) => {
            Plan::load(path).with_context(|| format!("Failed to load plan {}", path.display()))
        }
        None => Plan::builtin().context("Built-in plan is invalid"),
    }
}

async fn cmd_run(plan: &Plan, options: &RunOptions, json: bool) -> Result<()> {
    let registry = plan.build_registry()?;
    let mut engine = ExecutionEngine::new(registry);

    let cancel = CancelFlag::new();
    let ctx = plan.step_context(StepContext::system().with_cancel(cancel.clone()));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    info!(plan = %plan.name, "Provisioning host");
    let mut report = engine.run(&ctx, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&plan.name, &report);
    }

    // Launched daemons are left running for the host.
    if !engine.handles().is_empty() {
        info!(daemons = engine.handles().len(), "Daemons left running");
    }

    match report.error.take() {
        Some(err) => Err(anyhow::Error::new(err).context(match report.failed_step() {
            Some(step) => format!("Step '{}' failed", step.step_name),
            None => "Provisioning run interrupted".to_string(),
        })),
        None => Ok(()),
    }
}

fn print_report(plan_name: &str, report: &RunReport) {
    println!("Plan: {}", plan_name);
    println!("Run ID: {}", report.run_id);
    if report.dry_run {
        println!("Mode: dry run");
    }
    println!();

    for result in &report.results {
        let marker = match result.outcome {
            StepOutcome::Skipped => "-",
            StepOutcome::Succeeded => "✓",
            StepOutcome::Failed => "✗",
            StepOutcome::Planned => "~",
        };
        println!(
            "  {} {} [{}] ({}ms)",
            marker,
            result.step_name,
            result.outcome.as_str(),
            result.duration_ms
        );
        if let Some(error) = &result.error {
            println!("      {}", error);
        }
    }

    println!();
    let status = if report.success {
        "✓ PASSED"
    } else if report.cancelled {
        "✗ CANCELLED"
    } else {
        "✗ FAILED"
    };
    println!("Status: {}", status);
    if let Some(error) = &report.terminal_error {
        println!("Error: {}", error);
    }
    println!(
        "Summary: {} succeeded, {} skipped, {} planned ({}ms)",
        report.count(StepOutcome::Succeeded),
        report.count(StepOutcome::Skipped),
        report.count(StepOutcome::Planned),
        report.duration_ms
    );
}

fn cmd_steps(plan: &Plan) -> Result<()> {
    let registry = plan.build_registry()?;
    println!("Plan: {} ({})", plan.name, registry.digest());
    for (index, step) in registry.steps().iter().enumerate() {
        println!("  {}. {:<20} {}", index + 1, step.name(), step.describe());
    }
    Ok(())
}

fn cmd_render_config(plan: &Plan) -> Result<()> {
    match plan.render_config()? {
        Some(document) => {
            print!("{}", document);
            Ok(())
        }
        None => anyhow::bail!("Plan '{}' has no [config] section", plan.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "hostprep",
            "run",
            "--dry-run",
            "--from-step",
            "render-config",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { dry_run, from_step } => {
                assert!(dry_run);
                assert_eq!(from_step.as_deref(), Some("render-config"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["hostprep", "steps", "--json", "--plan", "host.toml"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.plan, Some(PathBuf::from("host.toml")));
        assert!(matches!(cli.command, Commands::Steps));
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["hostprep", "run"]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Commands::Run { dry_run, from_step } => {
                assert!(!dry_run);
                assert!(from_step.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["hostprep", "provision"]).is_err());
    }

    #[test]
    fn test_load_builtin_plan() {
        let plan = load_plan(None).unwrap();
        assert_eq!(plan.name, "storage-node");
    }

    #[test]
    fn test_load_missing_plan_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_plan(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load plan"));
    }

    #[test]
    fn test_render_config_requires_section() {
        let plan = Plan::from_toml_str("name = \"bare\"\n").unwrap();
        assert!(cmd_render_config(&plan).is_err());
    }
}
