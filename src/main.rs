//! CLI entry point for harvester.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::{Config, Orchestrator, RetryPolicy, RunSummary, UploadOutcome};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config
        .retain_groups(&args.groups)
        .context("selecting groups")?;
    if let Some(dir) = &args.data_dir {
        config.data_dir.clone_from(dir);
    }

    let mut retry = config.retry.policy();
    if let Some(max_retries) = args.max_retries {
        retry = RetryPolicy::new(u32::from(max_retries), retry.initial_delay());
    }

    info!(
        groups = config.groups.len(),
        data_dir = %config.data_dir.display(),
        max_retries = retry.max_retries(),
        "Harvester starting"
    );

    let orchestrator = Orchestrator::from_config(&config)
        .context("setting up uploaders")?
        .with_retry(retry);
    let summary = orchestrator.run().await;
    log_summary(&summary);

    if args.strict && summary.has_failures() {
        warn!("failures recorded and --strict is set");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn log_summary(summary: &RunSummary) {
    for group in &summary.groups {
        let uploaded = match &group.upload {
            UploadOutcome::Completed(upload) => upload.uploaded,
            UploadOutcome::Failed(_) => 0,
        };
        info!(
            group = %group.name,
            targets = group.targets.len(),
            uploaded,
            upload_failed = matches!(group.upload, UploadOutcome::Failed(_)),
            "Group complete"
        );
    }

    let crawled = summary.crawled();
    info!(
        emitted = crawled.emitted,
        skipped = crawled.skipped,
        item_failures = crawled.failed,
        failed_targets = summary.failed_targets(),
        dispatch_misses = summary.dispatch_misses(),
        failed_uploads = summary.failed_uploads(),
        "Harvest complete"
    );
}
