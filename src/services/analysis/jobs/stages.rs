use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::detection::PlotRequest;
use super::stage2_yearly_count_comparison::YearlySettings;
use super::stage3_univariate_anomaly::UnivariateSettings;
use super::stage4_h3_anomaly::H3Settings;
use super::types::{AnalysisJobError, PipelineConfig};
use crate::services::analysis::sources::{DataSource, EventTable};
use crate::services::analysis::timeseries::{GroupedTimeSeries, GroupingScheme};

pub const STAGE_VERSION: &str = "v1";

/// The closed set of analysis stages a pipeline can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageId {
    #[serde(rename = "stage2_yearly_count_comparison")]
    YearlyCountComparison,
    #[serde(rename = "stage3_univariate_anomaly")]
    UnivariateAnomaly,
    #[serde(rename = "stage4_h3_anomaly")]
    H3Anomaly,
}

impl StageId {
    pub const ALL: [StageId; 3] = [
        StageId::YearlyCountComparison,
        StageId::UnivariateAnomaly,
        StageId::H3Anomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::YearlyCountComparison => "stage2_yearly_count_comparison",
            StageId::UnivariateAnomaly => "stage3_univariate_anomaly",
            StageId::H3Anomaly => "stage4_h3_anomaly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == value.trim())
    }

    pub fn result_artifact(&self) -> String {
        format!("{}.json", self.as_str())
    }

    pub fn report_artifact(&self) -> String {
        format!("{}_report.html", self.as_str())
    }

    pub fn supports_report(&self) -> bool {
        !matches!(self, StageId::YearlyCountComparison)
    }
}

pub fn invalid_params(stage: StageId, message: impl Into<String>) -> AnalysisJobError {
    AnalysisJobError::new("invalid_params", message)
        .with_details(serde_json::json!({ "stage": stage.as_str() }))
}

/// Deserializes a stage's parameter object; a missing entry means all defaults.
pub fn parse_params<T: DeserializeOwned + Default>(
    stage: StageId,
    value: Option<&serde_json::Value>,
) -> Result<T, AnalysisJobError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| invalid_params(stage, format!("{}: {err}", stage.as_str()))),
    }
}

pub fn require_alpha(stage: StageId, name: &str, value: f64) -> Result<f64, AnalysisJobError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(invalid_params(stage, format!("{name} must be in (0, 1], got {value}")))
    }
}

/// Upper bound for any week-count parameter (ten years).
pub const MAX_WINDOW_WEEKS: usize = 520;

pub fn require_window(stage: StageId, name: &str, value: usize) -> Result<usize, AnalysisJobError> {
    if (1..=MAX_WINDOW_WEEKS).contains(&value) {
        Ok(value)
    } else {
        Err(invalid_params(
            stage,
            format!("{name} must be between 1 and {MAX_WINDOW_WEEKS} weeks"),
        ))
    }
}

/// Picks an explicit column parameter, else the first data source that maps one.
pub fn column_or_default(
    explicit: Option<&str>,
    sources: &[DataSource],
    from_source: impl Fn(&DataSource) -> Option<&str>,
) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            sources
                .iter()
                .filter_map(|source| from_source(source))
                .map(str::trim)
                .find(|value| !value.is_empty())
        })
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub enum StagePlan {
    YearlyCountComparison(YearlySettings),
    UnivariateAnomaly(UnivariateSettings),
    H3Anomaly(H3Settings),
}

impl StagePlan {
    pub fn id(&self) -> StageId {
        match self {
            StagePlan::YearlyCountComparison(_) => StageId::YearlyCountComparison,
            StagePlan::UnivariateAnomaly(_) => StageId::UnivariateAnomaly,
            StagePlan::H3Anomaly(_) => StageId::H3Anomaly,
        }
    }

    /// Weekly grouping schemes the stage reads.
    pub fn schemes(&self) -> Vec<GroupingScheme> {
        match self {
            StagePlan::YearlyCountComparison(_) => Vec::new(),
            StagePlan::UnivariateAnomaly(settings) => settings.schemes(),
            StagePlan::H3Anomaly(settings) => settings.schemes(),
        }
    }

    pub fn run(
        &self,
        inputs: &StageInputs,
        generate_report: bool,
        generated_at: &str,
    ) -> Result<StageOutput, AnalysisJobError> {
        match self {
            StagePlan::YearlyCountComparison(settings) => {
                super::stage2_yearly_count_comparison::run(settings, &inputs.table, generated_at)
            }
            StagePlan::UnivariateAnomaly(settings) => super::stage3_univariate_anomaly::run(
                settings,
                inputs,
                generate_report,
                generated_at,
            ),
            StagePlan::H3Anomaly(settings) => {
                super::stage4_h3_anomaly::run(settings, inputs, generate_report, generated_at)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub plan: StagePlan,
    pub generate_report: bool,
}

impl PlannedStage {
    pub fn id(&self) -> StageId {
        self.plan.id()
    }
}

#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub stages: Vec<PlannedStage>,
    pub skip_existing: bool,
}

impl PipelinePlan {
    /// Validates the submitted configuration and resolves every stage's parameters.
    pub fn resolve(
        config: &PipelineConfig,
        sources: &[DataSource],
        today: NaiveDate,
    ) -> Result<Self, AnalysisJobError> {
        if sources.is_empty() {
            return Err(AnalysisJobError::new(
                "invalid_config",
                "at least one data source is required",
            ));
        }
        if config.analysis_stages.is_empty() {
            return Err(AnalysisJobError::new(
                "invalid_config",
                "analysis_stages must name at least one stage",
            ));
        }

        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(config.analysis_stages.len());
        for name in &config.analysis_stages {
            let Some(id) = StageId::parse(name) else {
                return Err(AnalysisJobError::new(
                    "invalid_config",
                    format!("unknown analysis stage '{name}'"),
                )
                .with_details(serde_json::json!({
                    "known_stages": StageId::ALL.iter().map(StageId::as_str).collect::<Vec<_>>(),
                })));
            };
            if !seen.insert(id) {
                return Err(AnalysisJobError::new(
                    "invalid_config",
                    format!("stage '{}' is listed more than once", id.as_str()),
                ));
            }

            let params = config.parameters.get(id.as_str());
            let plan = match id {
                StageId::YearlyCountComparison => {
                    StagePlan::YearlyCountComparison(YearlySettings::resolve(params, sources, today)?)
                }
                StageId::UnivariateAnomaly => {
                    StagePlan::UnivariateAnomaly(UnivariateSettings::resolve(params, sources)?)
                }
                StageId::H3Anomaly => StagePlan::H3Anomaly(H3Settings::resolve(params, sources)?),
            };
            let generate_report = id.supports_report()
                && config.generate_reports.get(id.as_str()).copied().unwrap_or(false);
            stages.push(PlannedStage {
                plan,
                generate_report,
            });
        }

        Ok(Self {
            stages,
            skip_existing: config.skip_existing,
        })
    }
}

/// Event rows plus every weekly series built for the job, shared across its stages.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    pub table: Arc<EventTable>,
    pub series: HashMap<GroupingScheme, Arc<GroupedTimeSeries>>,
}

impl StageInputs {
    pub fn series_for(&self, scheme: &GroupingScheme) -> Result<&GroupedTimeSeries, AnalysisJobError> {
        self.series
            .get(scheme)
            .map(Arc::as_ref)
            .ok_or_else(|| AnalysisJobError::new("stage_failed", "grouped series was not built"))
    }
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub document: serde_json::Value,
    pub plots: Vec<PlotRequest>,
    pub report: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::source_for;

    fn config(stages: &[&str]) -> PipelineConfig {
        PipelineConfig {
            analysis_stages: stages.iter().map(|s| s.to_string()).collect(),
            ..PipelineConfig::default()
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn stage_ids_round_trip_through_names() {
        for id in StageId::ALL {
            assert_eq!(StageId::parse(id.as_str()), Some(id));
            let json = serde_json::to_value(id).unwrap();
            assert_eq!(json, serde_json::json!(id.as_str()));
        }
        assert_eq!(StageId::parse("stage5_magic"), None);
    }

    #[test]
    fn unknown_and_duplicate_stages_are_config_errors() {
        let sources = vec![source_for("a.csv")];
        let err = PipelinePlan::resolve(&config(&["stage9"]), &sources, today()).unwrap_err();
        assert_eq!(err.code, "invalid_config");

        let err = PipelinePlan::resolve(
            &config(&["stage3_univariate_anomaly", "stage3_univariate_anomaly"]),
            &sources,
            today(),
        )
        .unwrap_err();
        assert_eq!(err.code, "invalid_config");

        let err = PipelinePlan::resolve(&config(&[]), &sources, today()).unwrap_err();
        assert_eq!(err.code, "invalid_config");
        let err = PipelinePlan::resolve(&config(&["stage4_h3_anomaly"]), &[], today()).unwrap_err();
        assert_eq!(err.code, "invalid_config");
    }

    #[test]
    fn stages_keep_configured_order_and_report_flags() {
        let mut cfg = config(&[
            "stage4_h3_anomaly",
            "stage2_yearly_count_comparison",
            "stage3_univariate_anomaly",
        ]);
        cfg.generate_reports
            .insert("stage4_h3_anomaly".to_string(), true);
        cfg.generate_reports
            .insert("stage2_yearly_count_comparison".to_string(), true);
        let plan = PipelinePlan::resolve(&cfg, &[source_for("a.csv")], today()).unwrap();
        let ids: Vec<StageId> = plan.stages.iter().map(PlannedStage::id).collect();
        assert_eq!(
            ids,
            vec![
                StageId::H3Anomaly,
                StageId::YearlyCountComparison,
                StageId::UnivariateAnomaly
            ]
        );
        assert!(plan.stages[0].generate_report);
        assert!(!plan.stages[1].generate_report);
        assert!(!plan.stages[2].generate_report);
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        let mut cfg = config(&["stage4_h3_anomaly"]);
        cfg.parameters.insert(
            "stage4_h3_anomaly".to_string(),
            serde_json::json!({ "h3_resolution": "fine" }),
        );
        let err = PipelinePlan::resolve(&cfg, &[source_for("a.csv")], today()).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn shared_schemes_are_deduplicated_by_value() {
        let cfg = config(&["stage3_univariate_anomaly", "stage4_h3_anomaly"]);
        let plan = PipelinePlan::resolve(&cfg, &[source_for("a.csv")], today()).unwrap();
        let schemes: HashSet<GroupingScheme> = plan
            .stages
            .iter()
            .flat_map(|stage| stage.plan.schemes())
            .collect();
        // stage3: primary x secondary and secondary-only context; stage4: cell x secondary
        // and a coordinate-cleaned secondary-only context.
        assert_eq!(schemes.len(), 4);
    }
}
