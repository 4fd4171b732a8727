use anyhow::Result;
use std::path::{Component, PathBuf};

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub database_url: String,
    pub data_root: PathBuf,
    /// Root of the artifact blob store; one directory per job id.
    pub results_path: PathBuf,
    pub max_concurrent_jobs: usize,
    pub poll_interval_ms: u64,
    pub lease_seconds: u64,
    pub max_attempts: u32,
    pub fetch_retries: u32,
    pub fetch_backoff_ms: u64,
    pub fetch_timeout_seconds: u64,
    pub worker_id: String,
}

impl AnalyticsConfig {
    pub fn from_env() -> Result<Self> {
        let data_root = env_path("ANALYTICS_DATA_ROOT", "./storage")?;
        let results_default = data_root.join("results");
        let results_path = env_path("ANALYTICS_RESULTS_PATH", &results_default.to_string_lossy())?;
        let database_default = format!(
            "sqlite://{}",
            data_root.join("analysis_jobs.sqlite").display()
        );
        let database_url = env_string("ANALYTICS_DATABASE_URL", &database_default);

        let max_concurrent_jobs = env_u64("ANALYTICS_MAX_CONCURRENT_JOBS", 2).clamp(1, 16) as usize;
        let poll_interval_ms = env_u64("ANALYTICS_POLL_INTERVAL_MS", 500).clamp(50, 10_000);
        let lease_seconds = env_u64("ANALYTICS_LEASE_SECONDS", 300).clamp(5, 86_400);
        let max_attempts = env_u32("ANALYTICS_MAX_ATTEMPTS", 3).clamp(1, 10);
        let fetch_retries = env_u32("ANALYTICS_FETCH_RETRIES", 3).clamp(1, 10);
        let fetch_backoff_ms = env_u64("ANALYTICS_FETCH_BACKOFF_MS", 500).clamp(10, 30_000);
        let fetch_timeout_seconds = env_u64("ANALYTICS_FETCH_TIMEOUT_SECONDS", 60).clamp(1, 3_600);
        let worker_id = env_optional_string("ANALYTICS_WORKER_ID").unwrap_or_else(default_worker_id);

        Ok(Self {
            database_url,
            data_root,
            results_path,
            max_concurrent_jobs,
            poll_interval_ms,
            lease_seconds,
            max_attempts,
            fetch_retries,
            fetch_backoff_ms,
            fetch_timeout_seconds,
            worker_id,
        })
    }
}

pub fn default_worker_id() -> String {
    format!(
        "worker-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        anyhow::bail!("{key} must not contain '..' segments");
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_segments_in_paths() {
        std::env::set_var("ANALYTICS_TEST_PARENT_PATH", "/srv/../etc");
        assert!(env_path("ANALYTICS_TEST_PARENT_PATH", "./storage").is_err());
        std::env::remove_var("ANALYTICS_TEST_PARENT_PATH");
        assert_eq!(
            env_path("ANALYTICS_TEST_PARENT_PATH", "./storage").unwrap(),
            PathBuf::from("./storage")
        );
    }

    #[test]
    fn numeric_overrides_fall_back_on_garbage() {
        std::env::set_var("ANALYTICS_TEST_U64", " 42 ");
        assert_eq!(env_u64("ANALYTICS_TEST_U64", 7), 42);
        std::env::set_var("ANALYTICS_TEST_U64", "lots");
        assert_eq!(env_u64("ANALYTICS_TEST_U64", 7), 7);
        std::env::remove_var("ANALYTICS_TEST_U64");
    }

    #[test]
    fn worker_ids_are_unique_per_call() {
        assert_ne!(default_worker_id(), default_worker_id());
    }
}
