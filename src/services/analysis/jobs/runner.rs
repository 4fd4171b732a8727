use super::stages::{PipelinePlan, PlannedStage, StageId, StageInputs, StageOutput};
use super::store::{self, ArtifactRecord, ProgressUpdate};
use super::types::{
    AnalysisJobError, AnalysisJobEventsResponse, AnalysisJobRow, AnalysisJobStatus, ArtifactKind,
    JobCreateRequest, JobCreateResponse, JobResultsResponse, JobStatusResponse,
};
use crate::config::AnalyticsConfig;
use crate::services::analysis::artifacts::{is_valid_job_id, ArtifactStore, StoredArtifact};
use crate::services::analysis::sources::SourceResolver;
use crate::services::analysis::timeseries::build_weekly_series;
use crate::time::{ms_to_rfc3339, now_ms};
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid job submission: {0}")]
    Invalid(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub struct AnalysisJobService {
    db: SqlitePool,
    artifacts: ArtifactStore,
    sources: SourceResolver,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    poll_interval: Duration,
    lease: Duration,
    max_attempts: u32,
    worker_id: String,
}

impl AnalysisJobService {
    pub fn new(db: SqlitePool, config: &AnalyticsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;
        let max_concurrency = config.max_concurrent_jobs.max(1);
        Ok(Self {
            db,
            artifacts: ArtifactStore::new(config.results_path.clone()),
            sources: SourceResolver::new(
                http,
                config.fetch_retries,
                Duration::from_millis(config.fetch_backoff_ms),
            ),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease: Duration::from_secs(config.lease_seconds),
            max_attempts: config.max_attempts.max(1),
            worker_id: config.worker_id.clone(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn lease_ms(&self) -> i64 {
        self.lease.as_millis() as i64
    }

    pub async fn create_job(&self, request: &JobCreateRequest) -> Result<JobCreateResponse, SubmitError> {
        if !is_valid_job_id(&request.job_id) {
            return Err(SubmitError::Invalid(format!(
                "job_id '{}' must be 1-128 characters of [A-Za-z0-9._-]",
                request.job_id
            )));
        }
        let today = chrono::Utc::now().date_naive();
        PipelinePlan::resolve(&request.config, &request.data_sources, today)
            .map_err(|err| SubmitError::Invalid(err.message))?;

        let (row, created) =
            store::create_job(&self.db, request, self.max_attempts, now_ms()).await?;
        if created {
            tracing::info!(
                job_id = %row.job_id,
                run = row.run,
                stages = ?request.config.analysis_stages,
                "analysis job queued"
            );
        } else {
            tracing::info!(
                job_id = %row.job_id,
                run = row.run,
                status = %row.status,
                "analysis job already active; returning existing run"
            );
        }
        Ok(JobCreateResponse {
            job: row.to_public(),
            created,
        })
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobStatusResponse>, sqlx::Error> {
        Ok(store::get_latest_run(&self.db, job_id)
            .await?
            .map(|row| JobStatusResponse {
                job: row.to_public(),
            }))
    }

    pub async fn get_results(&self, job_id: &str) -> Result<Option<JobResultsResponse>, sqlx::Error> {
        let Some(row) = store::get_latest_run(&self.db, job_id).await? else {
            return Ok(None);
        };
        let artifacts = store::list_artifacts(&self.db, job_id)
            .await?
            .into_iter()
            .map(|artifact| (artifact.name.clone(), artifact))
            .collect();
        Ok(Some(JobResultsResponse {
            job_id: row.job_id.clone(),
            run: row.run,
            status: row.status_enum(),
            artifacts,
        }))
    }

    pub async fn list_events(
        &self,
        job_id: &str,
        after: i64,
        limit: i64,
    ) -> Result<AnalysisJobEventsResponse, sqlx::Error> {
        let events = store::list_events(&self.db, job_id, after, limit).await?;
        let next_after = events.last().map(|event| event.id);
        Ok(AnalysisJobEventsResponse { events, next_after })
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(worker_id = %self.worker_id, "analysis job worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                self.reap().await;

                while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    let job = match store::claim_next(&self.db, &self.worker_id, self.lease_ms(), now_ms())
                        .await
                    {
                        Ok(job) => job,
                        Err(err) => {
                            tracing::warn!(error = %err, "analysis job poller failed to claim job");
                            drop(permit);
                            break;
                        }
                    };

                    let Some(job) = job else {
                        drop(permit);
                        break;
                    };

                    let service = self.clone();
                    let span = job_span(&job);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = service.run_one(job).instrument(span).await {
                            tracing::warn!(error = %err, "analysis job runner error");
                        }
                    });
                }
            }
            tracing::info!(worker_id = %self.worker_id, "analysis job worker stopping");
        })
    }

    /// Waits for every in-flight job of this worker to finish.
    pub async fn drain(&self) {
        let permits = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Claims and runs one job to completion on the current task. Returns the job id, or
    /// `None` when nothing was claimable.
    pub async fn run_next(self: &Arc<Self>) -> Result<Option<String>> {
        self.reap().await;
        let Some(job) = store::claim_next(&self.db, &self.worker_id, self.lease_ms(), now_ms()).await?
        else {
            return Ok(None);
        };
        let job_id = job.job_id.clone();
        let span = job_span(&job);
        self.clone().run_one(job).instrument(span).await?;
        Ok(Some(job_id))
    }

    async fn reap(&self) {
        match store::reap_expired(&self.db, now_ms()).await {
            Ok(reaped) => {
                for job in reaped {
                    tracing::warn!(
                        job_id = %job.job_id,
                        run = job.run,
                        attempts = job.attempts,
                        "analysis job lease expired with no attempts left; marked failed"
                    );
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to reap expired analysis jobs"),
        }
    }

    fn spawn_heartbeat(&self, job: &AnalysisJobRow) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let db = self.db.clone();
        let job = job.clone();
        let worker_id = self.worker_id.clone();
        let lease_ms = self.lease_ms();
        let interval = (self.lease / 3).max(MIN_HEARTBEAT);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match store::renew_lease(&db, &job, &worker_id, lease_ms, now_ms()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!("analysis job lease was taken over; heartbeat stopped");
                            break;
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to renew analysis job lease"),
                    }
                }
            }
            .in_current_span(),
        );
        token
    }

    async fn run_one(self: Arc<Self>, job: AnalysisJobRow) -> Result<()> {
        let started = Instant::now();
        tracing::info!(attempt = job.attempts, "analysis job execution started");

        let heartbeat = self.spawn_heartbeat(&job);
        let outcome = self.execute_job(&job).await;
        heartbeat.cancel();

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(summary) => {
                if store::mark_completed(&self.db, &job, &self.worker_id, summary, now_ms()).await? {
                    tracing::info!(
                        status = AnalysisJobStatus::Completed.as_str(),
                        duration_ms,
                        "analysis job execution finished"
                    );
                } else {
                    tracing::warn!(duration_ms, "analysis job finished after losing its lease; result discarded");
                }
            }
            Err(JobFailure::Failed(error)) => {
                let recorded =
                    store::mark_failed(&self.db, &job, &self.worker_id, &error, now_ms()).await?;
                tracing::warn!(
                    status = AnalysisJobStatus::Failed.as_str(),
                    duration_ms,
                    recorded,
                    error_code = %error.code,
                    error_message = %error.message,
                    "analysis job execution finished"
                );
            }
            Err(JobFailure::LostLease) => {
                tracing::warn!(duration_ms, "analysis job lease lost; abandoning run");
            }
        }
        Ok(())
    }

    async fn execute_job(&self, job: &AnalysisJobRow) -> Result<serde_json::Value, JobFailure> {
        let today = chrono::Utc::now().date_naive();
        let plan = PipelinePlan::resolve(&job.config.0, &job.data_sources.0, today)
            .map_err(JobFailure::Failed)?;
        let total = plan.stages.len();
        let mut inputs: Option<StageInputs> = None;
        let mut stage_summaries = Vec::with_capacity(total);

        for (idx, stage) in plan.stages.iter().enumerate() {
            let id = stage.id();
            self.progress(job, percent(idx, total), Some(id.as_str()), "running")
                .await?;

            let result_name = id.result_artifact();
            if plan.skip_existing && self.artifact_present(&job.job_id, &result_name).await {
                tracing::info!(stage = id.as_str(), "stage result already present; skipping");
                self.event(job, "stage_skipped", serde_json::json!({ "stage": id.as_str() }))
                    .await;
                stage_summaries.push(serde_json::json!({ "stage": id.as_str(), "status": "skipped" }));
                self.progress(
                    job,
                    percent(idx + 1, total),
                    Some(id.as_str()),
                    "skipped existing result",
                )
                .await?;
                continue;
            }

            if inputs.is_none() {
                self.progress(job, percent(idx, total), Some(id.as_str()), "loading data sources")
                    .await?;
                inputs = Some(self.load_inputs(job).await?);
            }
            let Some(loaded) = inputs.as_mut() else {
                return Err(JobFailure::Failed(AnalysisJobError::new(
                    "stage_failed",
                    "stage inputs were not loaded",
                )));
            };
            self.ensure_series(loaded, stage).await?;

            let stage_started = Instant::now();
            let output = run_stage(stage.clone(), loaded.clone()).await?;
            let names = self.write_outputs(job, id, output).await?;
            let duration_ms = stage_started.elapsed().as_millis() as u64;
            tracing::info!(
                stage = id.as_str(),
                artifacts = names.len(),
                duration_ms,
                "stage completed"
            );
            self.event(
                job,
                "stage_completed",
                serde_json::json!({
                    "stage": id.as_str(),
                    "artifacts": names,
                    "duration_ms": duration_ms,
                }),
            )
            .await;
            stage_summaries.push(serde_json::json!({
                "stage": id.as_str(),
                "status": "completed",
                "artifacts": names,
            }));
            self.progress(job, percent(idx + 1, total), Some(id.as_str()), "stage completed")
                .await?;
        }

        Ok(serde_json::json!({ "stages": stage_summaries }))
    }

    async fn progress(
        &self,
        job: &AnalysisJobRow,
        progress: i64,
        current_stage: Option<&str>,
        stage_detail: &str,
    ) -> Result<(), JobFailure> {
        let update = ProgressUpdate {
            progress,
            current_stage,
            stage_detail,
        };
        match store::update_progress(&self.db, job, &self.worker_id, &update, self.lease_ms(), now_ms())
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(JobFailure::LostLease),
            Err(err) => {
                tracing::warn!(error = %err, "failed to write analysis job progress");
                Ok(())
            }
        }
    }

    async fn event(&self, job: &AnalysisJobRow, kind: &str, payload: serde_json::Value) {
        if let Err(err) = store::append_event(&self.db, &job.job_id, job.run, kind, payload, now_ms()).await
        {
            tracing::warn!(error = %err, kind, "failed to append analysis job event");
        }
    }

    async fn artifact_present(&self, job_id: &str, name: &str) -> bool {
        match store::get_artifact(&self.db, job_id, name).await {
            Ok(Some(artifact)) => self.artifacts.exists(&artifact.locator).await,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(error = %err, artifact = name, "failed to look up artifact");
                false
            }
        }
    }

    async fn load_inputs(&self, job: &AnalysisJobRow) -> Result<StageInputs, JobFailure> {
        let table = self
            .sources
            .resolve_all(&job.data_sources.0)
            .await
            .map_err(|err| JobFailure::Failed(err.into()))?;
        tracing::info!(
            rows = table.rows.len(),
            dropped_rows = table.dropped_rows,
            sources = job.data_sources.0.len(),
            "data sources loaded"
        );
        Ok(StageInputs {
            table: Arc::new(table),
            series: Default::default(),
        })
    }

    /// Builds the grouping schemes this stage reads that no earlier stage already built.
    async fn ensure_series(&self, inputs: &mut StageInputs, stage: &PlannedStage) -> Result<(), JobFailure> {
        for scheme in stage.plan.schemes() {
            if inputs.series.contains_key(&scheme) {
                continue;
            }
            let table = inputs.table.clone();
            let built = tokio::task::spawn_blocking(move || {
                build_weekly_series(&table, &scheme).map(|series| (scheme, series))
            })
            .await
            .map_err(|err| {
                JobFailure::Failed(AnalysisJobError::new(
                    "stage_failed",
                    format!("series builder task failed: {err}"),
                ))
            })?
            .map_err(|err| JobFailure::Failed(err.into()))?;
            inputs.series.insert(built.0, Arc::new(built.1));
        }
        Ok(())
    }

    /// Writes plot requests and the report before the stage result, so a registered result
    /// implies the stage's other outputs are in place.
    async fn write_outputs(
        &self,
        job: &AnalysisJobRow,
        stage: StageId,
        output: StageOutput,
    ) -> Result<Vec<String>, JobFailure> {
        let mut names = Vec::with_capacity(output.plots.len() + 2);
        for plot in &output.plots {
            let stored = self
                .artifacts
                .write_json(&job.job_id, &plot.name, plot)
                .await
                .map_err(storage_failed)?;
            self.register(job, &plot.name, ArtifactKind::PlotRequest, stage, &stored)
                .await?;
            names.push(plot.name.clone());
        }

        if let Some(report) = output.report.as_ref() {
            let name = stage.report_artifact();
            let stored = self
                .artifacts
                .write_bytes(&job.job_id, &name, report.as_bytes())
                .await
                .map_err(storage_failed)?;
            self.register(job, &name, ArtifactKind::Report, stage, &stored)
                .await?;
            names.push(name);
        }

        let name = stage.result_artifact();
        let stored = self
            .artifacts
            .write_json(&job.job_id, &name, &output.document)
            .await
            .map_err(storage_failed)?;
        self.register(job, &name, ArtifactKind::StageResult, stage, &stored)
            .await?;
        names.push(name);
        Ok(names)
    }

    async fn register(
        &self,
        job: &AnalysisJobRow,
        name: &str,
        kind: ArtifactKind,
        stage: StageId,
        stored: &StoredArtifact,
    ) -> Result<(), JobFailure> {
        let record = ArtifactRecord {
            name,
            kind,
            stage: Some(stage.as_str()),
            stored,
        };
        let registered =
            store::register_artifact(&self.db, job, &self.worker_id, &record, now_ms())
                .await
                .map_err(|err| {
                    JobFailure::Failed(AnalysisJobError::new(
                        "storage_failed",
                        format!("failed to register artifact {name}: {err}"),
                    ))
                })?;
        if registered {
            Ok(())
        } else {
            Err(JobFailure::LostLease)
        }
    }
}

fn job_span(job: &AnalysisJobRow) -> tracing::Span {
    tracing::info_span!(
        "analysis_job",
        job_id = %job.job_id,
        run = job.run,
        attempt = job.attempts,
    )
}

fn percent(done: usize, total: usize) -> i64 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round() as i64
}

fn storage_failed(err: anyhow::Error) -> JobFailure {
    JobFailure::Failed(AnalysisJobError::new("storage_failed", format!("{err:#}")))
}

/// Runs the stage computation on the blocking pool.
async fn run_stage(stage: PlannedStage, inputs: StageInputs) -> Result<StageOutput, JobFailure> {
    let id = stage.id();
    let generated_at = ms_to_rfc3339(now_ms());
    tokio::task::spawn_blocking(move || stage.plan.run(&inputs, stage.generate_report, &generated_at))
        .await
        .map_err(|err| {
            JobFailure::Failed(AnalysisJobError::new(
                "stage_failed",
                format!("{} task failed: {err}", id.as_str()),
            ))
        })?
        .map_err(|mut err| {
            if err.details.is_none() {
                err.details = Some(serde_json::json!({ "stage": id.as_str() }));
            }
            JobFailure::Failed(err)
        })
}

pub(super) enum JobFailure {
    Failed(AnalysisJobError),
    /// Another worker owns the run now; nothing more may be written for it.
    LostLease,
}
