//! Subcommand implementations
//!
//! Each command loads the pipeline configuration, builds the Postgres-backed
//! orchestrator, and prints its result as JSON on stdout.

use anyhow::{bail, Context, Result};
use churnflow_pipeline::{JobRun, Orchestrator, PipelineConfig, PipelineRequest};
use std::path::PathBuf;
use tracing::info;

fn orchestrator(config: PipelineConfig) -> Result<Orchestrator> {
    Orchestrator::connect(config).context("Failed to configure stores")
}

/// Run the pipeline; returns whether the run succeeded
pub async fn run(source: PathBuf, dry_run: bool, job_name: Option<String>) -> Result<bool> {
    let mut config = PipelineConfig::load()?;
    if let Some(name) = job_name {
        config.job_name = name;
        config.validate()?;
    }

    let orchestrator = orchestrator(config)?;
    let request = PipelineRequest::new(source).dry_run(dry_run);
    let outcome = orchestrator.run(&request).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.succeeded())
}

pub async fn reset(yes: bool) -> Result<()> {
    if !yes {
        bail!("Reset drops every table and all job history; pass --yes to confirm");
    }

    let orchestrator = orchestrator(PipelineConfig::load()?)?;
    orchestrator.reset().await?;
    info!("Reset complete");
    println!("{}", serde_json::json!({ "reset": true }));
    Ok(())
}

pub async fn jobs(limit: i64) -> Result<()> {
    if limit <= 0 {
        bail!("Limit must be greater than 0");
    }

    let orchestrator = orchestrator(PipelineConfig::load()?)?;
    let runs = orchestrator.recent_jobs(limit).await?;
    let summaries: Vec<_> = runs.iter().map(summary).collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn summary(run: &JobRun) -> serde_json::Value {
    serde_json::json!({
        "job_id": run.job_id,
        "job_name": run.job_name,
        "status": run.status,
        "started_at": run.started_at,
        "ended_at": run.ended_at,
        "duration_ms": run.duration().map(|d| d.num_milliseconds()),
        "records_processed": run.records_processed,
        "failed_stage": run.failed_stage,
        "error_kind": run.error_kind,
        "error_message": run.error_message,
    })
}
