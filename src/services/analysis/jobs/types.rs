use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use std::collections::BTreeMap;

use crate::services::analysis::sources::{DataSource, SourceError};
use crate::time::ms_to_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisJobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl AnalysisJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisJobStatus::Queued => "queued",
            AnalysisJobStatus::Processing => "processing",
            AnalysisJobStatus::Completed => "completed",
            AnalysisJobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisJobStatus::Completed | AnalysisJobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJobError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AnalysisJobError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<SourceError> for AnalysisJobError {
    fn from(err: SourceError) -> Self {
        let transient = err.is_transient();
        AnalysisJobError::new(err.code(), err.to_string())
            .with_details(serde_json::json!({ "transient": transient }))
    }
}

/// Ordered stage list plus per-stage parameters, as submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub analysis_stages: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub generate_reports: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreateRequest {
    pub job_id: String,
    pub data_sources: Vec<DataSource>,
    pub config: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJobPublic {
    pub job_id: String,
    pub run: i64,
    pub status: AnalysisJobStatus,
    pub current_stage: Option<String>,
    pub stage_detail: Option<String>,
    pub progress: i64,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisJobError>,
    pub attempts: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreateResponse {
    pub job: AnalysisJobPublic,
    /// False when an active run of the same job id already existed.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job: AnalysisJobPublic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    StageResult,
    PlotRequest,
    Report,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::StageResult => "stage_result",
            ArtifactKind::PlotRequest => "plot_request",
            ArtifactKind::Report => "report",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stage_result" => Some(ArtifactKind::StageResult),
            "plot_request" => Some(ArtifactKind::PlotRequest),
            "report" => Some(ArtifactKind::Report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArtifact {
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub locator: String,
    pub sha256: String,
    pub size: i64,
    pub run: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultsResponse {
    pub job_id: String,
    pub run: i64,
    pub status: AnalysisJobStatus,
    pub artifacts: BTreeMap<String, JobArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJobEventPublic {
    pub id: i64,
    pub run: i64,
    pub created_at: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJobEventsResponse {
    pub events: Vec<AnalysisJobEventPublic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after: Option<i64>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct AnalysisJobRow {
    pub id: i64,
    pub job_id: String,
    pub run: i64,
    pub status: String,
    pub data_sources: SqlJson<Vec<DataSource>>,
    pub config: SqlJson<PipelineConfig>,
    pub progress: i64,
    pub current_stage: Option<String>,
    pub stage_detail: Option<String>,
    pub error: Option<SqlJson<AnalysisJobError>>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub claimed_by: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl AnalysisJobRow {
    pub fn status_enum(&self) -> AnalysisJobStatus {
        match self.status.as_str() {
            "queued" => AnalysisJobStatus::Queued,
            "processing" => AnalysisJobStatus::Processing,
            "completed" => AnalysisJobStatus::Completed,
            "failed" => AnalysisJobStatus::Failed,
            other => {
                tracing::warn!(status = %other, job_id = %self.job_id, run = self.run, "unknown analysis job status; treating as failed");
                AnalysisJobStatus::Failed
            }
        }
    }

    pub fn to_public(&self) -> AnalysisJobPublic {
        let error = self.error.as_ref().map(|value| value.0.clone());
        AnalysisJobPublic {
            job_id: self.job_id.clone(),
            run: self.run,
            status: self.status_enum(),
            current_stage: self.current_stage.clone(),
            stage_detail: self.stage_detail.clone(),
            progress: self.progress,
            error_message: error.as_ref().map(|err| err.message.clone()),
            error,
            attempts: self.attempts,
            created_at: ms_to_rfc3339(self.created_at_ms),
            updated_at: ms_to_rfc3339(self.updated_at_ms),
            started_at: self.started_at_ms.map(ms_to_rfc3339),
            completed_at: self.completed_at_ms.map(ms_to_rfc3339),
        }
    }
}
