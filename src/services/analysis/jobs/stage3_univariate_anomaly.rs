use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::detection::{
    plot_requests, run_detection, BonferroniScope, DetectionMode, DetectionRun, DetectionSettings,
    GroupAnalysis, PlotPolicy, SeriesAnalysis, SignificanceSummary,
};
use super::report::render_detection_report;
use super::stages::{
    column_or_default, invalid_params, parse_params, require_alpha, require_window, StageId,
    StageInputs, StageOutput, STAGE_VERSION,
};
use super::types::AnalysisJobError;
use crate::services::analysis::sources::DataSource;
use crate::services::analysis::timeseries::{GroupedTimeSeries, GroupingScheme};

const STAGE: StageId = StageId::UnivariateAnomaly;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UnivariateParams {
    primary_group_col: Option<String>,
    secondary_group_col: Option<String>,
    mode: Option<DetectionMode>,
    alpha: Option<f64>,
    analysis_weeks: Option<usize>,
    trend_windows: Option<Vec<usize>>,
    min_history_weeks: Option<usize>,
    min_trend_events: Option<u64>,
    include_context: Option<bool>,
    bonferroni_scope: Option<BonferroniScope>,
    plot_generation: Option<PlotPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnivariateSettings {
    pub primary_group_col: String,
    pub secondary_group_col: String,
    #[serde(flatten)]
    pub detection: DetectionSettings,
    pub plot_generation: PlotPolicy,
}

impl UnivariateSettings {
    pub fn resolve(
        params: Option<&serde_json::Value>,
        sources: &[DataSource],
    ) -> Result<Self, AnalysisJobError> {
        let params: UnivariateParams = parse_params(STAGE, params)?;
        let primary_group_col = column_or_default(params.primary_group_col.as_deref(), sources, |s| {
            s.primary_group_col.as_deref()
        })
        .ok_or_else(|| invalid_params(STAGE, "primary_group_col is required"))?;
        let secondary_group_col =
            column_or_default(params.secondary_group_col.as_deref(), sources, |s| {
                s.secondary_group_col.as_deref()
            })
            .ok_or_else(|| invalid_params(STAGE, "secondary_group_col is required"))?;
        if primary_group_col == secondary_group_col {
            return Err(invalid_params(
                STAGE,
                "primary_group_col and secondary_group_col must differ",
            ));
        }

        let alpha = require_alpha(STAGE, "alpha", params.alpha.unwrap_or(0.05))?;
        let anomaly_weeks = require_window(
            STAGE,
            "analysis_weeks",
            params.analysis_weeks.unwrap_or(4),
        )?;
        let trend_windows = params.trend_windows.unwrap_or_else(|| vec![anomaly_weeks]);
        for window in &trend_windows {
            require_window(STAGE, "trend_windows", *window)?;
        }
        let min_history_weeks = require_window(
            STAGE,
            "min_history_weeks",
            params.min_history_weeks.unwrap_or(8),
        )?;

        Ok(Self {
            primary_group_col,
            secondary_group_col,
            detection: DetectionSettings {
                mode: params.mode.unwrap_or(DetectionMode::Conservative),
                anomaly_alpha: alpha,
                trend_alpha: alpha,
                anomaly_weeks,
                trend_windows,
                min_history_weeks,
                min_trend_events: params.min_trend_events.unwrap_or(4),
                include_context: params.include_context.unwrap_or(true),
                bonferroni_scope: params.bonferroni_scope.unwrap_or(BonferroniScope::Combined),
            },
            plot_generation: params.plot_generation.unwrap_or(PlotPolicy::None),
        })
    }

    fn group_scheme(&self) -> GroupingScheme {
        GroupingScheme::columns(&[
            self.primary_group_col.as_str(),
            self.secondary_group_col.as_str(),
        ])
    }

    fn context_scheme(&self) -> GroupingScheme {
        GroupingScheme::columns(&[self.secondary_group_col.as_str()])
    }

    pub fn schemes(&self) -> Vec<GroupingScheme> {
        let mut schemes = vec![self.group_scheme()];
        if self.detection.include_context {
            schemes.push(self.context_scheme());
        }
        schemes
    }
}

#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    primary_group: &'a str,
    secondary_group: &'a str,
    #[serde(flatten)]
    group: &'a GroupAnalysis,
}

#[derive(Debug, Serialize)]
struct ExcludedRow<'a> {
    primary_group: &'a str,
    secondary_group: &'a str,
    weeks: usize,
}

#[derive(Debug, Serialize)]
struct DataSummary {
    total_events: usize,
    dropped_rows: usize,
    groups_analyzed: usize,
    groups_excluded: usize,
    through_week: Option<chrono::NaiveDate>,
}

#[derive(Debug, Serialize)]
struct UnivariateDocument<'a> {
    stage: &'static str,
    version: &'static str,
    generated_at: &'a str,
    parameters: &'a UnivariateSettings,
    data_summary: DataSummary,
    significance: &'a SignificanceSummary,
    results: Vec<ResultRow<'a>>,
    context_results: &'a BTreeMap<String, SeriesAnalysis>,
    excluded_groups: Vec<ExcludedRow<'a>>,
}

fn key_part(key: &[String], idx: usize) -> &str {
    key.get(idx).map(String::as_str).unwrap_or_default()
}

fn document(
    settings: &UnivariateSettings,
    inputs: &StageInputs,
    series: &GroupedTimeSeries,
    run: &DetectionRun,
    generated_at: &str,
) -> Result<serde_json::Value, AnalysisJobError> {
    let doc = UnivariateDocument {
        stage: STAGE.as_str(),
        version: STAGE_VERSION,
        generated_at,
        parameters: settings,
        data_summary: DataSummary {
            total_events: inputs.table.rows.len(),
            dropped_rows: inputs.table.dropped_rows,
            groups_analyzed: run.groups.len(),
            groups_excluded: run.excluded.len(),
            through_week: series.through,
        },
        significance: &run.summary,
        results: run
            .groups
            .iter()
            .map(|group| ResultRow {
                primary_group: key_part(&group.key, 0),
                secondary_group: key_part(&group.key, 1),
                group,
            })
            .collect(),
        context_results: &run.context,
        excluded_groups: run
            .excluded
            .iter()
            .map(|excluded| ExcludedRow {
                primary_group: key_part(&excluded.key, 0),
                secondary_group: key_part(&excluded.key, 1),
                weeks: excluded.weeks,
            })
            .collect(),
    };
    serde_json::to_value(&doc).map_err(|err| AnalysisJobError::new("stage_failed", err.to_string()))
}

pub fn run(
    settings: &UnivariateSettings,
    inputs: &StageInputs,
    generate_report: bool,
    generated_at: &str,
) -> Result<StageOutput, AnalysisJobError> {
    let series = inputs.series_for(&settings.group_scheme())?;
    let context = if settings.detection.include_context {
        Some(inputs.series_for(&settings.context_scheme())?)
    } else {
        None
    };
    let run = run_detection(series, context, 1, &settings.detection);

    let labels = [
        settings.primary_group_col.as_str(),
        settings.secondary_group_col.as_str(),
    ];
    let plots = plot_requests(&run, series, settings.plot_generation, &labels);
    let report = generate_report
        .then(|| render_detection_report(STAGE, generated_at, &settings.detection, &run, &labels));

    Ok(StageOutput {
        document: document(settings, inputs, series, &run, generated_at)?,
        plots,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analysis::timeseries::build_weekly_series;
    use crate::test_support::{event_table, source_for};
    use chrono::{Duration, NaiveDate};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Two districts of Theft over 16 weeks; North spikes in the final week.
    fn spike_csv() -> String {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let north: [u64; 16] = [2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 9];
        let south: [u64; 16] = [1; 16];
        let mut csv = String::from("date,lat,lon,district,category\n");
        for (week, (n, s)) in north.iter().zip(south.iter()).enumerate() {
            let day = start + Duration::weeks(week as i64) + Duration::days(1);
            for _ in 0..*n {
                csv.push_str(&format!("{day},41.88,-87.63,North,Theft\n"));
            }
            for _ in 0..*s {
                csv.push_str(&format!("{day},41.70,-87.60,South,Theft\n"));
            }
        }
        csv
    }

    fn inputs_for(settings: &UnivariateSettings, csv: &str) -> StageInputs {
        let table = Arc::new(event_table(csv));
        let series: HashMap<_, _> = settings
            .schemes()
            .into_iter()
            .map(|scheme| {
                let built = build_weekly_series(&table, &scheme).unwrap();
                (scheme, Arc::new(built))
            })
            .collect();
        StageInputs { table, series }
    }

    fn resolve(params: serde_json::Value) -> UnivariateSettings {
        UnivariateSettings::resolve(Some(&params), &[source_for("a.csv")]).unwrap()
    }

    #[test]
    fn defaults_come_from_the_source_mapping() {
        let settings = UnivariateSettings::resolve(None, &[source_for("a.csv")]).unwrap();
        assert_eq!(settings.primary_group_col, "district");
        assert_eq!(settings.secondary_group_col, "category");
        assert_eq!(settings.detection.mode, DetectionMode::Conservative);
        assert_eq!(settings.detection.trend_windows, vec![4]);
        assert_eq!(settings.plot_generation, PlotPolicy::None);
        assert_eq!(settings.schemes().len(), 2);
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        for params in [
            serde_json::json!({ "alpha": 0.0 }),
            serde_json::json!({ "alpha": 1.5 }),
            serde_json::json!({ "analysis_weeks": 0 }),
            serde_json::json!({ "trend_windows": [4, 0] }),
            serde_json::json!({ "analysis_weeks": u64::MAX }),
            serde_json::json!({ "trend_windows": [4, 10_000] }),
            serde_json::json!({ "min_history_weeks": 521 }),
            serde_json::json!({ "mode": "aggressive" }),
            serde_json::json!({ "primary_group_col": "category" }),
        ] {
            let err = UnivariateSettings::resolve(Some(&params), &[source_for("a.csv")]).unwrap_err();
            assert_eq!(err.code, "invalid_params", "{params}");
        }
    }

    #[test]
    fn flags_the_spike_and_pairs_it_with_citywide_context() {
        let settings = resolve(serde_json::json!({ "mode": "screening", "plot_generation": "anomalies" }));
        let inputs = inputs_for(&settings, &spike_csv());
        let output = run(&settings, &inputs, true, "2024-05-01T00:00:00Z").unwrap();
        let doc = &output.document;

        assert_eq!(doc["stage"], "stage3_univariate_anomaly");
        assert_eq!(doc["parameters"]["mode"], "screening");
        let north = doc["results"]
            .as_array()
            .unwrap()
            .iter()
            .find(|row| row["primary_group"] == "North")
            .unwrap();
        assert_eq!(north["secondary_group"], "Theft");
        assert_eq!(north["model"]["kind"], "poisson");
        let last = north["anomalies"].as_array().unwrap().last().unwrap();
        assert_eq!(last["observed"], 9);
        assert_eq!(last["significant"], true);
        assert_eq!(last["context"]["observed"], 10);
        assert!(doc["context_results"]["Theft"].is_object());

        assert_eq!(output.plots.len(), 1);
        assert_eq!(output.plots[0].name, "plot_North_Theft.json");
        assert!(output.report.unwrap().contains("district=North, category=Theft"));
    }

    #[test]
    fn plot_policy_does_not_change_results() {
        let quiet = resolve(serde_json::json!({ "plot_generation": "none" }));
        let loud = resolve(serde_json::json!({ "plot_generation": "both" }));
        let csv = spike_csv();
        let a = run(&quiet, &inputs_for(&quiet, &csv), false, "t").unwrap();
        let b = run(&loud, &inputs_for(&loud, &csv), false, "t").unwrap();
        assert_eq!(a.document["results"], b.document["results"]);
        assert!(a.plots.is_empty());
        assert!(a.report.is_none());
    }

    #[test]
    fn repeated_runs_produce_identical_findings() {
        let settings = resolve(serde_json::json!({}));
        let csv = spike_csv();
        let first = run(&settings, &inputs_for(&settings, &csv), false, "2024-05-01T00:00:00Z").unwrap();
        let second = run(&settings, &inputs_for(&settings, &csv), false, "2024-05-02T00:00:00Z").unwrap();
        let findings = |doc: &serde_json::Value| serde_json::to_vec(&doc["results"]).unwrap();
        assert_eq!(findings(&first.document), findings(&second.document));
        assert_ne!(first.document["generated_at"], second.document["generated_at"]);
    }

    #[test]
    fn short_groups_are_listed_as_excluded() {
        let settings = resolve(serde_json::json!({}));
        let mut csv = spike_csv();
        csv.push_str("2024-04-16,41.9,-87.6,West,Arson\n");
        let output = run(&settings, &inputs_for(&settings, &csv), false, "t").unwrap();
        let excluded = output.document["excluded_groups"].as_array().unwrap().clone();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0]["primary_group"], "West");
        assert_eq!(excluded[0]["weeks"], 1);
    }
}
