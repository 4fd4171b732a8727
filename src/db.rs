use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Opens the shared job registry. Every worker process on the host points at the same file.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(8))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open job registry at {database_url}"))
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        run INTEGER NOT NULL,
        status TEXT NOT NULL,
        data_sources TEXT NOT NULL,
        config TEXT NOT NULL,
        progress INTEGER NOT NULL DEFAULT 0,
        current_stage TEXT,
        stage_detail TEXT,
        error TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        claimed_by TEXT,
        lease_expires_at_ms INTEGER,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL,
        started_at_ms INTEGER,
        completed_at_ms INTEGER,
        UNIQUE (job_id, run)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS analysis_jobs_claim_idx
        ON analysis_jobs (status, created_at_ms, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_job_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        run INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS analysis_job_events_job_idx
        ON analysis_job_events (job_id, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_artifacts (
        job_id TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        stage TEXT,
        locator TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        size INTEGER NOT NULL,
        run INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        PRIMARY KEY (job_id, name)
    )
    "#,
];

pub async fn ensure_schema(db: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(db)
            .await
            .context("failed to ensure job registry schema")?;
    }
    Ok(())
}
