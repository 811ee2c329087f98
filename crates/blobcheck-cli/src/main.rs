//! blobcheck - conformance harness for content-addressed blob storage servers
//!
//! ## Commands
//!
//! - `run`: start each selected target, run the gated suite, write artifacts
//! - `targets`: list configured targets
//! - `self-check`: run the harness pre-flight checks only
//! - `parse`: extract test records from a raw JUnit file

use anyhow::{Context, Result};
use blobcheck_core::{
    parse_file, CapabilitySet, RecordSummary, RootConfig, TargetSpec, TestStatus,
};
use blobcheck_harness::{ConformancePipeline, RunSummary, RuntimeEnv, SelfCheck};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "blobcheck")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Conformance harness for blob storage servers", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "BLOBCHECK_CONFIG",
        default_value = "blobcheck.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the conformance suite against targets, one at a time
    Run {
        /// Targets to run (default: the configured default, else all)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Override the artifacts directory
        #[arg(long)]
        artifacts: Option<PathBuf>,

        /// Print the run summary as JSON
        #[arg(long)]
        summary_json: bool,
    },

    /// List configured targets
    Targets,

    /// Run the pre-flight self-check and exit
    SelfCheck,

    /// Extract test records from a raw JUnit XML file
    Parse {
        /// Raw runner output
        raw: PathBuf,

        /// Print records as JSON
        #[arg(long)]
        records_json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    blobcheck_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            targets,
            artifacts,
            summary_json,
        } => cmd_run(&cli.config, &targets, artifacts, summary_json).await,
        Commands::Targets => cmd_targets(&cli.config),
        Commands::SelfCheck => cmd_self_check(&cli.config).await,
        Commands::Parse { raw, records_json } => cmd_parse(&raw, records_json),
    }
}

fn load_config(path: &Path) -> Result<RootConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration {}", path.display()))?;
    RootConfig::from_toml_str(&raw)
        .with_context(|| format!("Invalid configuration {}", path.display()))
}

async fn cmd_run(
    config_path: &Path,
    targets: &[String],
    artifacts: Option<PathBuf>,
    summary_json: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = artifacts {
        config.artifacts_dir = dir;
    }
    let selected = config.select(targets)?;
    info!(
        targets = %selected.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(","),
        artifacts = %config.artifacts_dir.display(),
        "starting conformance run"
    );

    let env = RuntimeEnv::detect();
    let pipeline = ConformancePipeline::from_config(&config, env)?;
    let summary = pipeline
        .run(&selected)
        .await
        .context("Conformance run aborted before any target started")?;

    print_summary(&summary, summary_json)?;
    if !summary.success() {
        anyhow::bail!(
            "{} of {} target(s) did not complete",
            summary.configured - summary.completed,
            summary.configured
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}

fn cmd_targets(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    if config.targets.is_empty() {
        println!("No targets configured in {}", config_path.display());
        return Ok(());
    }
    for spec in config.targets.values() {
        let marker = if config.default_target.as_deref() == Some(spec.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}", marker, describe_target(spec));
    }
    Ok(())
}

fn describe_target(spec: &TargetSpec) -> String {
    format!(
        "{:<16} {:<10} {}  [{}]",
        spec.name,
        spec.strategy.kind(),
        spec.base_url,
        capability_list(&spec.capabilities)
    )
}

fn capability_list(caps: &CapabilitySet) -> String {
    caps.iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn cmd_self_check(config_path: &Path) -> Result<()> {
    let self_check = if config_path.exists() {
        load_config(config_path)?.self_check
    } else {
        Default::default()
    };
    let report = SelfCheck::new(self_check)
        .run()
        .await
        .context("Self-check failed")?;
    for check in &report.passed {
        println!("  ok {}", check);
    }
    println!(
        "Self-check passed ({} checks, {}ms)",
        report.passed.len(),
        report.duration_ms
    );
    Ok(())
}

fn cmd_parse(raw: &Path, records_json: bool) -> Result<()> {
    let records =
        parse_file(raw).with_context(|| format!("Failed to extract {}", raw.display()))?;

    if records_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in &records {
        let status = match record.status {
            TestStatus::Passed => "✓",
            TestStatus::Failed => "✗",
            TestStatus::Skipped => "-",
        };
        println!("  {} {} ({}ms)", status, record.id, record.duration_ms);
        if let Some(error) = &record.error {
            println!("      {}", error.message);
        }
        if let Some(reason) = &record.skip_reason {
            println!("      skipped: {}", reason);
        }
    }
    let summary = RecordSummary::from_records(&records);
    println!(
        "{} passed, {} failed, {} skipped ({} total, {}ms)",
        summary.passed, summary.failed, summary.skipped, summary.total, summary.duration_ms
    );
    Ok(())
}
