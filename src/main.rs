use std::path::PathBuf;

use anyhow::{Context, Result};
use batch_grader::{BatchGradingCoordinator, GraderConfig};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Grade every submission of an LMS bulk export with an external engine
#[derive(Parser, Debug)]
#[command(name = "batch-grader", version)]
struct Cli {
    /// Bulk export archive, or a directory containing exactly one
    #[arg(long)]
    source: PathBuf,

    /// Directory searched (recursively) for the autograder archive
    #[arg(long)]
    autograder_dir: PathBuf,

    /// TOML configuration file
    #[arg(long, env = "GRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Per-submission timeout in seconds, 0 disables it
    #[arg(long)]
    timeout: Option<u64>,

    /// Number of submissions graded at once
    #[arg(long)]
    jobs: Option<usize>,

    /// Write a histogram of the overall scores
    #[arg(long)]
    plot: bool,

    /// Remove previous grading sessions first
    #[arg(long)]
    clear: bool,

    /// Directory for the grading session, defaults to the source's directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("batch_grader=info".parse()?))
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = GraderConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(timeout) = cli.timeout {
        config.grading.timeout_secs = timeout;
    }
    if let Some(jobs) = cli.jobs {
        config.grading.max_parallel = jobs;
    }
    if cli.output_dir.is_some() {
        config.grading.output_dir = cli.output_dir;
    }
    config.grading.plot |= cli.plot;
    config.grading.clear |= cli.clear;
    config.validate().context("Invalid configuration")?;

    info!(
        "Grading {:?} (timeout: {:?}, parallel: {})",
        cli.source,
        config.timeout(),
        config.grading.max_parallel
    );

    let timeout = config.timeout();
    let plot = config.grading.plot;
    let coordinator = BatchGradingCoordinator::from_config(config);
    let summary = coordinator
        .run(&cli.source, &cli.autograder_dir, timeout, plot)
        .await
        .context("Grading run failed")?;

    let Some(report_path) = &summary.report_path else {
        warn!("Nothing was graded");
        return Ok(());
    };

    println!("Graded:  {}", summary.graded());
    println!("Errors:  {}", summary.errors.len());
    for identity in &summary.errors {
        println!("  - {}", identity);
    }
    println!("Invalid: {}", summary.invalid.len());
    for invalid in &summary.invalid {
        error!("{}: {}", invalid.raw_name, invalid.reason);
        println!("  - {}", invalid.raw_name);
    }
    println!("Report:  {}", report_path.display());
    if let Some(histogram) = &summary.histogram_path {
        println!("Histogram: {}", histogram.display());
    }

    Ok(())
}
