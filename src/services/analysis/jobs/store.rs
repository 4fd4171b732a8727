use sqlx::types::Json as SqlJson;
use sqlx::SqlitePool;

use super::types::{
    AnalysisJobError, AnalysisJobEventPublic, AnalysisJobRow, ArtifactKind, JobArtifact,
    JobCreateRequest,
};
use crate::services::analysis::artifacts::StoredArtifact;
use crate::time::ms_to_rfc3339;

pub const JOB_STATUS_QUEUED: &str = "queued";
pub const JOB_STATUS_PROCESSING: &str = "processing";
pub const JOB_STATUS_COMPLETED: &str = "completed";
pub const JOB_STATUS_FAILED: &str = "failed";

const JOB_COLUMNS: &str = r#"
    id, job_id, run, status, data_sources, config, progress, current_stage, stage_detail,
    error, attempts, max_attempts, claimed_by, lease_expires_at_ms,
    created_at_ms, updated_at_ms, started_at_ms, completed_at_ms
"#;

/// SQLITE_CONSTRAINT_UNIQUE extended result code.
const SQLITE_UNIQUE_VIOLATION: &str = "2067";

/// Queues a new run of `request.job_id` unless one is already queued or processing.
///
/// Returns the run and whether it was created by this call.
pub async fn create_job(
    db: &SqlitePool,
    request: &JobCreateRequest,
    max_attempts: u32,
    now_ms: i64,
) -> Result<(AnalysisJobRow, bool), sqlx::Error> {
    let inserted: Result<Option<AnalysisJobRow>, sqlx::Error> = sqlx::query_as(&format!(
        r#"
        INSERT INTO analysis_jobs (
            job_id, run, status, data_sources, config, progress, attempts, max_attempts,
            created_at_ms, updated_at_ms
        )
        SELECT
            ?1,
            COALESCE((SELECT MAX(run) FROM analysis_jobs WHERE job_id = ?1), 0) + 1,
            ?2, ?3, ?4, 0, 0, ?5, ?6, ?6
        WHERE NOT EXISTS (
            SELECT 1 FROM analysis_jobs
            WHERE job_id = ?1 AND status IN (?2, ?7)
        )
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(&request.job_id)
    .bind(JOB_STATUS_QUEUED)
    .bind(SqlJson(&request.data_sources))
    .bind(SqlJson(&request.config))
    .bind(max_attempts as i64)
    .bind(now_ms)
    .bind(JOB_STATUS_PROCESSING)
    .fetch_optional(db)
    .await;

    match inserted {
        Ok(Some(row)) => {
            append_event(
                db,
                &row.job_id,
                row.run,
                "created",
                serde_json::json!({
                    "stages": row.config.0.analysis_stages,
                    "data_sources": row.data_sources.0.len(),
                }),
                now_ms,
            )
            .await?;
            Ok((row, true))
        }
        Ok(None) => existing_run(db, &request.job_id).await,
        Err(sqlx::Error::Database(db_err))
            if db_err.code().as_deref() == Some(SQLITE_UNIQUE_VIOLATION) =>
        {
            existing_run(db, &request.job_id).await
        }
        Err(err) => Err(err),
    }
}

async fn existing_run(
    db: &SqlitePool,
    job_id: &str,
) -> Result<(AnalysisJobRow, bool), sqlx::Error> {
    let existing = get_latest_run(db, job_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    Ok((existing, false))
}

pub async fn get_latest_run(
    db: &SqlitePool,
    job_id: &str,
) -> Result<Option<AnalysisJobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM analysis_jobs
        WHERE job_id = ?1
        ORDER BY run DESC
        LIMIT 1
        "#
    ))
    .bind(job_id)
    .fetch_optional(db)
    .await
}

/// Atomically claims the oldest claimable run for `worker_id`.
///
/// Claimable means queued, or processing with an expired lease, and with attempts left.
/// The selection and the ownership stamp happen in one `UPDATE`, and SQLite serialises
/// writers, so concurrent workers never receive the same run.
pub async fn claim_next(
    db: &SqlitePool,
    worker_id: &str,
    lease_ms: i64,
    now_ms: i64,
) -> Result<Option<AnalysisJobRow>, sqlx::Error> {
    let mut tx = db.begin().await?;
    let claimed: Option<AnalysisJobRow> = sqlx::query_as(&format!(
        r#"
        UPDATE analysis_jobs
        SET status = ?1,
            claimed_by = ?2,
            lease_expires_at_ms = ?3,
            attempts = attempts + 1,
            started_at_ms = COALESCE(started_at_ms, ?4),
            updated_at_ms = ?4
        WHERE id = (
            SELECT id
            FROM analysis_jobs
            WHERE attempts < max_attempts
              AND (
                status = ?5
                OR (status = ?1 AND lease_expires_at_ms IS NOT NULL AND lease_expires_at_ms < ?4)
              )
            ORDER BY created_at_ms ASC, id ASC
            LIMIT 1
        )
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(JOB_STATUS_PROCESSING)
    .bind(worker_id)
    .bind(now_ms + lease_ms)
    .bind(now_ms)
    .bind(JOB_STATUS_QUEUED)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(job) = &claimed {
        let kind = if job.attempts > 1 { "reclaimed" } else { "started" };
        sqlx::query(
            r#"
            INSERT INTO analysis_job_events (job_id, run, kind, payload, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.run)
        .bind(kind)
        .bind(SqlJson(serde_json::json!({
            "worker_id": worker_id,
            "attempt": job.attempts,
        })))
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(claimed)
}

/// Fails processing runs whose lease expired with no attempts left.
pub async fn reap_expired(db: &SqlitePool, now_ms: i64) -> Result<Vec<AnalysisJobRow>, sqlx::Error> {
    let error = AnalysisJobError::new(
        "lease_expired",
        "worker stopped renewing its lease and retry attempts are exhausted",
    );
    let mut tx = db.begin().await?;
    let reaped: Vec<AnalysisJobRow> = sqlx::query_as(&format!(
        r#"
        UPDATE analysis_jobs
        SET status = ?1,
            error = ?2,
            claimed_by = NULL,
            lease_expires_at_ms = NULL,
            completed_at_ms = ?3,
            updated_at_ms = ?3
        WHERE status = ?4
          AND lease_expires_at_ms IS NOT NULL
          AND lease_expires_at_ms < ?3
          AND attempts >= max_attempts
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(JOB_STATUS_FAILED)
    .bind(SqlJson(&error))
    .bind(now_ms)
    .bind(JOB_STATUS_PROCESSING)
    .fetch_all(&mut *tx)
    .await?;

    for job in &reaped {
        sqlx::query(
            r#"
            INSERT INTO analysis_job_events (job_id, run, kind, payload, created_at_ms)
            VALUES (?1, ?2, 'failed', ?3, ?4)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.run)
        .bind(SqlJson(serde_json::json!({
            "error_code": error.code,
            "attempts": job.attempts,
        })))
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(reaped)
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate<'a> {
    pub progress: i64,
    pub current_stage: Option<&'a str>,
    pub stage_detail: &'a str,
}

/// Writes progress (never decreasing) and renews the lease. Returns `false` when the
/// worker no longer owns the run.
pub async fn update_progress(
    db: &SqlitePool,
    job: &AnalysisJobRow,
    worker_id: &str,
    update: &ProgressUpdate<'_>,
    lease_ms: i64,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET progress = MAX(progress, ?1),
            current_stage = ?2,
            stage_detail = ?3,
            lease_expires_at_ms = ?4,
            updated_at_ms = ?5
        WHERE id = ?6 AND status = ?7 AND claimed_by = ?8
        "#,
    )
    .bind(update.progress.clamp(0, 100))
    .bind(update.current_stage)
    .bind(update.stage_detail)
    .bind(now_ms + lease_ms)
    .bind(now_ms)
    .bind(job.id)
    .bind(JOB_STATUS_PROCESSING)
    .bind(worker_id)
    .execute(db)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    append_event(
        db,
        &job.job_id,
        job.run,
        "progress",
        serde_json::json!({
            "progress": update.progress,
            "stage": update.current_stage,
            "detail": update.stage_detail,
        }),
        now_ms,
    )
    .await?;
    Ok(true)
}

pub async fn renew_lease(
    db: &SqlitePool,
    job: &AnalysisJobRow,
    worker_id: &str,
    lease_ms: i64,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET lease_expires_at_ms = ?1,
            updated_at_ms = ?2
        WHERE id = ?3 AND status = ?4 AND claimed_by = ?5
        "#,
    )
    .bind(now_ms + lease_ms)
    .bind(now_ms)
    .bind(job.id)
    .bind(JOB_STATUS_PROCESSING)
    .bind(worker_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_completed(
    db: &SqlitePool,
    job: &AnalysisJobRow,
    worker_id: &str,
    summary: serde_json::Value,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let mut tx = db.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = ?1,
            progress = 100,
            stage_detail = 'All stages complete',
            lease_expires_at_ms = NULL,
            completed_at_ms = ?2,
            updated_at_ms = ?2
        WHERE id = ?3 AND status = ?4 AND claimed_by = ?5
        "#,
    )
    .bind(JOB_STATUS_COMPLETED)
    .bind(now_ms)
    .bind(job.id)
    .bind(JOB_STATUS_PROCESSING)
    .bind(worker_id)
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO analysis_job_events (job_id, run, kind, payload, created_at_ms)
        VALUES (?1, ?2, 'completed', ?3, ?4)
        "#,
    )
    .bind(&job.job_id)
    .bind(job.run)
    .bind(SqlJson(summary))
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn mark_failed(
    db: &SqlitePool,
    job: &AnalysisJobRow,
    worker_id: &str,
    error: &AnalysisJobError,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let mut tx = db.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = ?1,
            error = ?2,
            lease_expires_at_ms = NULL,
            completed_at_ms = ?3,
            updated_at_ms = ?3
        WHERE id = ?4 AND status = ?5 AND claimed_by = ?6
        "#,
    )
    .bind(JOB_STATUS_FAILED)
    .bind(SqlJson(error))
    .bind(now_ms)
    .bind(job.id)
    .bind(JOB_STATUS_PROCESSING)
    .bind(worker_id)
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO analysis_job_events (job_id, run, kind, payload, created_at_ms)
        VALUES (?1, ?2, 'failed', ?3, ?4)
        "#,
    )
    .bind(&job.job_id)
    .bind(job.run)
    .bind(SqlJson(serde_json::json!({
        "error_code": error.code,
        "message": error.message,
        "details": error.details,
    })))
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct ArtifactRecord<'a> {
    pub name: &'a str,
    pub kind: ArtifactKind,
    pub stage: Option<&'a str>,
    pub stored: &'a StoredArtifact,
}

/// Records an artifact in the job's registry while `worker_id` still owns the processing
/// run. A later write of the same name replaces the row in one statement; readers see
/// either the previous or the new entry. Returns `false` when ownership was lost.
pub async fn register_artifact(
    db: &SqlitePool,
    job: &AnalysisJobRow,
    worker_id: &str,
    record: &ArtifactRecord<'_>,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO job_artifacts (job_id, name, kind, stage, locator, sha256, size, run, created_at_ms)
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
        WHERE EXISTS (
            SELECT 1 FROM analysis_jobs
            WHERE id = ?10 AND status = ?11 AND claimed_by = ?12
        )
        ON CONFLICT (job_id, name) DO UPDATE SET
            kind = excluded.kind,
            stage = excluded.stage,
            locator = excluded.locator,
            sha256 = excluded.sha256,
            size = excluded.size,
            run = excluded.run,
            created_at_ms = excluded.created_at_ms
        "#,
    )
    .bind(&job.job_id)
    .bind(record.name)
    .bind(record.kind.as_str())
    .bind(record.stage)
    .bind(&record.stored.locator)
    .bind(&record.stored.sha256)
    .bind(record.stored.size as i64)
    .bind(job.run)
    .bind(now_ms)
    .bind(job.id)
    .bind(JOB_STATUS_PROCESSING)
    .bind(worker_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    name: String,
    kind: String,
    stage: Option<String>,
    locator: String,
    sha256: String,
    size: i64,
    run: i64,
    created_at_ms: i64,
}

impl ArtifactRow {
    fn into_public(self) -> JobArtifact {
        let kind = ArtifactKind::parse(&self.kind).unwrap_or_else(|| {
            tracing::warn!(kind = %self.kind, name = %self.name, "unknown artifact kind; treating as stage result");
            ArtifactKind::StageResult
        });
        JobArtifact {
            name: self.name,
            kind,
            stage: self.stage,
            locator: self.locator,
            sha256: self.sha256,
            size: self.size,
            run: self.run,
            created_at: ms_to_rfc3339(self.created_at_ms),
        }
    }
}

pub async fn get_artifact(
    db: &SqlitePool,
    job_id: &str,
    name: &str,
) -> Result<Option<JobArtifact>, sqlx::Error> {
    let row: Option<ArtifactRow> = sqlx::query_as(
        r#"
        SELECT name, kind, stage, locator, sha256, size, run, created_at_ms
        FROM job_artifacts
        WHERE job_id = ?1 AND name = ?2
        LIMIT 1
        "#,
    )
    .bind(job_id)
    .bind(name)
    .fetch_optional(db)
    .await?;
    Ok(row.map(ArtifactRow::into_public))
}

pub async fn list_artifacts(db: &SqlitePool, job_id: &str) -> Result<Vec<JobArtifact>, sqlx::Error> {
    let rows: Vec<ArtifactRow> = sqlx::query_as(
        r#"
        SELECT name, kind, stage, locator, sha256, size, run, created_at_ms
        FROM job_artifacts
        WHERE job_id = ?1
        ORDER BY name ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(ArtifactRow::into_public).collect())
}

pub async fn append_event(
    db: &SqlitePool,
    job_id: &str,
    run: i64,
    kind: &str,
    payload: serde_json::Value,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO analysis_job_events (job_id, run, kind, payload, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(job_id)
    .bind(run)
    .bind(kind)
    .bind(SqlJson(payload))
    .bind(now_ms)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn list_events(
    db: &SqlitePool,
    job_id: &str,
    after: i64,
    limit: i64,
) -> Result<Vec<AnalysisJobEventPublic>, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: i64,
        run: i64,
        kind: String,
        payload: SqlJson<serde_json::Value>,
        created_at_ms: i64,
    }

    let limit = limit.clamp(1, 500);
    let rows: Vec<Row> = sqlx::query_as(
        r#"
        SELECT id, run, kind, payload, created_at_ms
        FROM analysis_job_events
        WHERE job_id = ?1 AND id > ?2
        ORDER BY id ASC
        LIMIT ?3
        "#,
    )
    .bind(job_id)
    .bind(after)
    .bind(limit)
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| AnalysisJobEventPublic {
            id: row.id,
            run: row.run,
            kind: row.kind,
            payload: row.payload.0,
            created_at: ms_to_rfc3339(row.created_at_ms),
        })
        .collect())
}
