use anyhow::{Context, Result};
use clap::Parser;
use incident_analytics::cli::{self, Command};
use incident_analytics::services::analysis::jobs::{AnalysisJobService, JobCreateRequest};
use incident_analytics::{config, db};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn read_submission(path: &Path) -> Result<JobCreateRequest> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read submission from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&raw).context("submission is not a valid job document")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::AnalyticsConfig::from_env()?;
    let pool = db::connect(&config.database_url).await?;
    db::ensure_schema(&pool).await?;
    let service = Arc::new(AnalysisJobService::new(pool, &config)?);

    match args.command {
        Command::Worker { once: true } => {
            let mut processed = 0usize;
            while service.run_next().await?.is_some() {
                processed += 1;
            }
            tracing::info!(processed, "analysis job queue drained");
        }
        Command::Worker { once: false } => {
            tracing::info!(
                worker_id = %service.worker_id(),
                results_path = %config.results_path.display(),
                max_concurrent_jobs = config.max_concurrent_jobs,
                "starting analysis worker"
            );
            let cancel = CancellationToken::new();
            let poller = service.clone().start(cancel.clone());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested; waiting for running jobs");
            cancel.cancel();
            poller.await.context("analysis worker task failed")?;
            service.drain().await;
        }
        Command::Submit { file } => {
            let request = read_submission(&file)?;
            let response = service.create_job(&request).await?;
            print_json(&response)?;
        }
        Command::Status { job_id } => match service.get_status(&job_id).await? {
            Some(status) => print_json(&status)?,
            None => anyhow::bail!("job {job_id} not found"),
        },
        Command::Results { job_id } => match service.get_results(&job_id).await? {
            Some(results) => print_json(&results)?,
            None => anyhow::bail!("job {job_id} not found"),
        },
        Command::Events {
            job_id,
            after,
            limit,
        } => {
            let events = service.list_events(&job_id, after, limit).await?;
            print_json(&events)?;
        }
    }

    Ok(())
}
