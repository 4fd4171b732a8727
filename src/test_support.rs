use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

use crate::config::AnalyticsConfig;
use crate::services::analysis::jobs::AnalysisJobService;
use crate::services::analysis::sources::{DataSource, EventTable};

/// Single-connection in-memory registry; every query sees the same database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::ensure_schema(&pool).await.unwrap();
    pool
}

pub fn source_for(data_url: &str) -> DataSource {
    DataSource {
        data_url: data_url.to_string(),
        timestamp_col: "date".to_string(),
        lat_col: Some("lat".to_string()),
        lon_col: Some("lon".to_string()),
        primary_group_col: Some("district".to_string()),
        secondary_group_col: Some("category".to_string()),
        drop_invalid_timestamps: false,
    }
}

pub fn event_table(csv: &str) -> EventTable {
    EventTable::parse(&[source_for("inline.csv")], &[csv.as_bytes().to_vec()]).unwrap()
}

pub fn test_config(dir: &Path, worker_id: &str) -> AnalyticsConfig {
    AnalyticsConfig {
        database_url: format!("sqlite://{}", dir.join("jobs.sqlite").display()),
        data_root: dir.to_path_buf(),
        results_path: dir.join("results"),
        max_concurrent_jobs: 2,
        poll_interval_ms: 20,
        lease_seconds: 60,
        max_attempts: 3,
        fetch_retries: 1,
        fetch_backoff_ms: 10,
        fetch_timeout_seconds: 5,
        worker_id: worker_id.to_string(),
    }
}

/// A service backed by an on-disk registry under `dir`, so several services can share it.
pub async fn test_service(dir: &Path, worker_id: &str) -> Arc<AnalysisJobService> {
    let config = test_config(dir, worker_id);
    let db = crate::db::connect(&config.database_url).await.unwrap();
    crate::db::ensure_schema(&db).await.unwrap();
    Arc::new(AnalysisJobService::new(db, &config).unwrap())
}

/// Writes one week of events per entry of `counts`, starting the week of 2024-01-01:
/// `counts[i]` North/Theft rows in week `i` plus one South/Theft row every week.
pub fn write_weekly_csv(path: &Path, counts: &[u64]) {
    use chrono::{Duration, NaiveDate};
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let mut csv = String::from("date,lat,lon,district,category\n");
    for (week, count) in counts.iter().enumerate() {
        let day = start + Duration::weeks(week as i64) + Duration::days(1);
        for _ in 0..*count {
            csv.push_str(&format!("{day},41.8781,-87.6298,North,Theft\n"));
        }
        csv.push_str(&format!("{day},41.7508,-87.5813,South,Theft\n"));
    }
    std::fs::write(path, csv).unwrap();
}
