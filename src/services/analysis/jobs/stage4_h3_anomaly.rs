use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

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
use crate::services::analysis::spatial::{self, DEFAULT_H3_RESOLUTION, MAX_H3_RESOLUTION};
use crate::services::analysis::timeseries::{
    GroupDimension, GroupedTimeSeries, GroupingScheme, ValueFilter,
};

const STAGE: StageId = StageId::H3Anomaly;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct H3Params {
    secondary_group_col: Option<String>,
    h3_resolution: Option<u8>,
    analysis_weeks_trend: Option<Vec<usize>>,
    analysis_weeks_anomaly: Option<usize>,
    p_value_anomaly: Option<f64>,
    p_value_trend: Option<f64>,
    plot_generation: Option<PlotPolicy>,
    filter_col: Option<String>,
    filter_values: Option<Vec<String>>,
    mode: Option<DetectionMode>,
    min_history_weeks: Option<usize>,
    min_trend_events: Option<u64>,
    include_context: Option<bool>,
    bonferroni_scope: Option<BonferroniScope>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct H3Filter {
    pub column: String,
    pub values: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct H3Settings {
    pub secondary_group_col: String,
    pub h3_resolution: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<H3Filter>,
    #[serde(flatten)]
    pub detection: DetectionSettings,
    pub plot_generation: PlotPolicy,
}

impl H3Settings {
    pub fn resolve(
        params: Option<&serde_json::Value>,
        sources: &[DataSource],
    ) -> Result<Self, AnalysisJobError> {
        let params: H3Params = parse_params(STAGE, params)?;
        let secondary_group_col =
            column_or_default(params.secondary_group_col.as_deref(), sources, |s| {
                s.secondary_group_col.as_deref()
            })
            .ok_or_else(|| invalid_params(STAGE, "secondary_group_col is required"))?;
        if !sources
            .iter()
            .any(|s| s.lat_col.is_some() && s.lon_col.is_some())
        {
            return Err(invalid_params(
                STAGE,
                "stage4 requires lat_col and lon_col on at least one data source",
            ));
        }

        let h3_resolution = params.h3_resolution.unwrap_or(DEFAULT_H3_RESOLUTION);
        if h3_resolution > MAX_H3_RESOLUTION {
            return Err(invalid_params(
                STAGE,
                format!("h3_resolution must be between 0 and {MAX_H3_RESOLUTION}"),
            ));
        }

        let anomaly_weeks = require_window(
            STAGE,
            "analysis_weeks_anomaly",
            params.analysis_weeks_anomaly.unwrap_or(4),
        )?;
        let mut trend_windows = params.analysis_weeks_trend.unwrap_or_else(|| vec![4]);
        for window in &trend_windows {
            require_window(STAGE, "analysis_weeks_trend", *window)?;
        }
        trend_windows.sort_unstable();
        trend_windows.dedup();
        let min_history_weeks = require_window(
            STAGE,
            "min_history_weeks",
            params.min_history_weeks.unwrap_or(8),
        )?;

        let filter = match (params.filter_col, params.filter_values) {
            (Some(_), None) => {
                return Err(invalid_params(STAGE, "filter_col requires filter_values"));
            }
            (None, None) => None,
            (column, Some(values)) => {
                let values: BTreeSet<String> = values
                    .into_iter()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if values.is_empty() {
                    return Err(invalid_params(STAGE, "filter_values must not be empty"));
                }
                let column = column
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| secondary_group_col.clone());
                Some(H3Filter { column, values })
            }
        };

        Ok(Self {
            secondary_group_col,
            h3_resolution,
            filter,
            detection: DetectionSettings {
                mode: params.mode.unwrap_or(DetectionMode::Screening),
                anomaly_alpha: require_alpha(
                    STAGE,
                    "p_value_anomaly",
                    params.p_value_anomaly.unwrap_or(0.05),
                )?,
                trend_alpha: require_alpha(
                    STAGE,
                    "p_value_trend",
                    params.p_value_trend.unwrap_or(0.05),
                )?,
                anomaly_weeks,
                trend_windows,
                min_history_weeks,
                min_trend_events: params.min_trend_events.unwrap_or(4),
                include_context: params.include_context.unwrap_or(true),
                bonferroni_scope: params.bonferroni_scope.unwrap_or(BonferroniScope::Combined),
            },
            plot_generation: params.plot_generation.unwrap_or(PlotPolicy::Both),
        })
    }

    fn value_filter(&self) -> Option<ValueFilter> {
        self.filter.as_ref().map(|f| ValueFilter {
            column: f.column.clone(),
            values: f.values.clone(),
        })
    }

    fn group_scheme(&self) -> GroupingScheme {
        GroupingScheme {
            dimensions: vec![
                GroupDimension::H3Cell {
                    resolution: self.h3_resolution,
                },
                GroupDimension::Column(self.secondary_group_col.clone()),
            ],
            filter: self.value_filter(),
            require_coordinates: true,
        }
    }

    /// Secondary-only series over the same cleaned, filtered rows.
    fn context_scheme(&self) -> GroupingScheme {
        GroupingScheme {
            dimensions: vec![GroupDimension::Column(self.secondary_group_col.clone())],
            filter: self.value_filter(),
            require_coordinates: true,
        }
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
struct CellRow<'a> {
    h3_cell: &'a str,
    lat: Option<f64>,
    lon: Option<f64>,
    secondary_group: &'a str,
    #[serde(flatten)]
    group: &'a GroupAnalysis,
}

#[derive(Debug, Serialize)]
struct ExcludedCell<'a> {
    h3_cell: &'a str,
    secondary_group: &'a str,
    weeks: usize,
}

#[derive(Debug, Serialize)]
struct DataSummary {
    total_events: usize,
    dropped_rows: usize,
    cells: usize,
    groups_analyzed: usize,
    groups_excluded: usize,
    through_week: Option<chrono::NaiveDate>,
}

#[derive(Debug, Serialize)]
struct H3Document<'a> {
    stage: &'static str,
    version: &'static str,
    generated_at: &'a str,
    parameters: &'a H3Settings,
    data_summary: DataSummary,
    significance: &'a SignificanceSummary,
    results: Vec<CellRow<'a>>,
    context_results: &'a BTreeMap<String, SeriesAnalysis>,
    excluded_groups: Vec<ExcludedCell<'a>>,
}

fn key_part(key: &[String], idx: usize) -> &str {
    key.get(idx).map(String::as_str).unwrap_or_default()
}

fn document(
    settings: &H3Settings,
    inputs: &StageInputs,
    series: &GroupedTimeSeries,
    run: &DetectionRun,
    generated_at: &str,
) -> Result<serde_json::Value, AnalysisJobError> {
    let cells: BTreeSet<&str> = series.groups.keys().map(|key| key_part(key, 0)).collect();
    let doc = H3Document {
        stage: STAGE.as_str(),
        version: STAGE_VERSION,
        generated_at,
        parameters: settings,
        data_summary: DataSummary {
            total_events: inputs.table.rows.len(),
            dropped_rows: inputs.table.dropped_rows,
            cells: cells.len(),
            groups_analyzed: run.groups.len(),
            groups_excluded: run.excluded.len(),
            through_week: series.through,
        },
        significance: &run.summary,
        results: run
            .groups
            .iter()
            .map(|group| {
                let h3_cell = key_part(&group.key, 0);
                let center = spatial::parse_cell(h3_cell).map(spatial::cell_center);
                CellRow {
                    h3_cell,
                    lat: center.map(|(lat, _)| lat),
                    lon: center.map(|(_, lon)| lon),
                    secondary_group: key_part(&group.key, 1),
                    group,
                }
            })
            .collect(),
        context_results: &run.context,
        excluded_groups: run
            .excluded
            .iter()
            .map(|excluded| ExcludedCell {
                h3_cell: key_part(&excluded.key, 0),
                secondary_group: key_part(&excluded.key, 1),
                weeks: excluded.weeks,
            })
            .collect(),
    };
    serde_json::to_value(&doc).map_err(|err| AnalysisJobError::new("stage_failed", err.to_string()))
}

pub fn run(
    settings: &H3Settings,
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

    let labels = ["h3_cell", settings.secondary_group_col.as_str()];
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

    fn resolve(params: serde_json::Value) -> H3Settings {
        H3Settings::resolve(Some(&params), &[source_for("a.csv")]).unwrap()
    }

    /// One hotspot with a final-week surge plus steady background in a second cell.
    fn hotspot_csv() -> String {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let hot: [u64; 12] = [2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 12];
        let mut csv = String::from("date,lat,lon,district,category\n");
        for (week, count) in hot.iter().enumerate() {
            let day = start + Duration::weeks(week as i64) + Duration::days(2);
            for _ in 0..*count {
                csv.push_str(&format!("{day},41.8781,-87.6298,Loop,Theft\n"));
            }
            csv.push_str(&format!("{day},41.7508,-87.5813,South,Theft\n"));
            csv.push_str(&format!("{day},41.8781,-87.6298,Loop,Arson\n"));
            csv.push_str(&format!("{day},0,0,Loop,Theft\n"));
        }
        csv
    }

    fn inputs_for(settings: &H3Settings, csv: &str) -> StageInputs {
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

    #[test]
    fn defaults_follow_the_documented_parameters() {
        let settings = H3Settings::resolve(None, &[source_for("a.csv")]).unwrap();
        assert_eq!(settings.secondary_group_col, "category");
        assert_eq!(settings.h3_resolution, 9);
        assert_eq!(settings.detection.anomaly_weeks, 4);
        assert_eq!(settings.detection.trend_windows, vec![4]);
        assert_eq!(settings.detection.anomaly_alpha, 0.05);
        assert_eq!(settings.detection.mode, DetectionMode::Screening);
        assert_eq!(settings.plot_generation, PlotPolicy::Both);
        assert!(settings.filter.is_none());
    }

    #[test]
    fn rejects_invalid_parameters() {
        for params in [
            serde_json::json!({ "h3_resolution": 16 }),
            serde_json::json!({ "h3_resolution": -1 }),
            serde_json::json!({ "p_value_anomaly": 0 }),
            serde_json::json!({ "p_value_trend": 1.01 }),
            serde_json::json!({ "analysis_weeks_trend": [4, 0] }),
            serde_json::json!({ "plot_generation": "sometimes" }),
            serde_json::json!({ "filter_values": [] }),
            serde_json::json!({ "filter_col": "category" }),
            serde_json::json!({ "analysis_weeks_anomaly": 521 }),
            serde_json::json!({ "min_history_weeks": u64::MAX }),
        ] {
            let err = H3Settings::resolve(Some(&params), &[source_for("a.csv")]).unwrap_err();
            assert_eq!(err.code, "invalid_params", "{params}");
        }

        let mut no_coords = source_for("a.csv");
        no_coords.lat_col = None;
        let err = H3Settings::resolve(None, &[no_coords]).unwrap_err();
        assert_eq!(err.code, "invalid_params");

        let mut no_secondary = source_for("a.csv");
        no_secondary.secondary_group_col = None;
        let err = H3Settings::resolve(None, &[no_secondary]).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn hotspot_is_flagged_in_its_cell() {
        let settings = resolve(serde_json::json!({ "analysis_weeks_trend": [8, 4, 4] }));
        assert_eq!(settings.detection.trend_windows, vec![4, 8]);
        let inputs = inputs_for(&settings, &hotspot_csv());
        let output = run(&settings, &inputs, false, "t").unwrap();
        let doc = &output.document;

        let loop_cell = spatial::cell_for(41.8781, -87.6298, 9).unwrap().to_string();
        let rows = doc["results"].as_array().unwrap();
        let hot = rows
            .iter()
            .find(|r| r["h3_cell"] == loop_cell.as_str() && r["secondary_group"] == "Theft")
            .unwrap();
        let last = hot["anomalies"].as_array().unwrap().last().unwrap();
        assert_eq!(last["observed"], 12);
        assert_eq!(last["significant"], true);
        assert!((hot["lat"].as_f64().unwrap() - 41.8781).abs() < 0.01);
        assert_eq!(hot["trends"].as_array().unwrap().len(), 2);
        // Placeholder (0, 0) rows never reach a cell or the context series.
        assert_eq!(doc["data_summary"]["cells"], 2);
        assert_eq!(last["context"]["observed"], 13);

        assert!(output
            .plots
            .iter()
            .any(|p| p.name == format!("plot_{loop_cell}_Theft.json")));
    }

    #[test]
    fn filter_restricts_secondary_groups_before_aggregation() {
        let settings = resolve(serde_json::json!({ "filter_values": ["Arson"] }));
        let inputs = inputs_for(&settings, &hotspot_csv());
        let output = run(&settings, &inputs, false, "t").unwrap();
        let rows = output.document["results"].as_array().unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r["secondary_group"] == "Arson"));
        assert_eq!(output.document["parameters"]["filter"]["column"], "category");
    }

    #[test]
    fn plot_policy_never_changes_results() {
        let none = resolve(serde_json::json!({ "plot_generation": "none" }));
        let both = resolve(serde_json::json!({ "plot_generation": "both" }));
        let csv = hotspot_csv();
        let a = run(&none, &inputs_for(&none, &csv), false, "t").unwrap();
        let b = run(&both, &inputs_for(&both, &csv), false, "t").unwrap();
        assert_eq!(a.document["results"], b.document["results"]);
        assert!(a.plots.is_empty());
        assert!(!b.plots.is_empty());
    }
}
