use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::stages::{column_or_default, invalid_params, parse_params, StageId, StageOutput, STAGE_VERSION};
use super::types::AnalysisJobError;
use crate::services::analysis::sources::{DataSource, EventTable};

const STAGE: StageId = StageId::YearlyCountComparison;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YearlyParams {
    group_by_col: Option<String>,
    as_of: Option<NaiveDate>,
    baseline_year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearlySettings {
    pub group_by_col: String,
    /// Day-of-year cutoff for the to-date counts.
    pub as_of: NaiveDate,
    pub baseline_year: Option<i32>,
}

impl YearlySettings {
    pub fn resolve(
        params: Option<&serde_json::Value>,
        sources: &[DataSource],
        today: NaiveDate,
    ) -> Result<Self, AnalysisJobError> {
        let params: YearlyParams = parse_params(STAGE, params)?;
        let group_by_col = column_or_default(params.group_by_col.as_deref(), sources, |s| {
            s.primary_group_col.as_deref()
        })
        .ok_or_else(|| {
            invalid_params(
                STAGE,
                "group_by_col is required when no data source maps a primary group column",
            )
        })?;
        Ok(Self {
            group_by_col,
            as_of: params.as_of.unwrap_or(today),
            baseline_year: params.baseline_year,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct YearCell {
    year: i32,
    total: u64,
    to_date: u64,
    total_change_pct: Option<f64>,
    to_date_change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct BaselineComparison {
    vs_year: i32,
    latest_year: i32,
    baseline_total: u64,
    latest_total: u64,
    change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct GroupRow {
    group: String,
    years: Vec<YearCell>,
    #[serde(skip_serializing_if = "Option::is_none")]
    baseline: Option<BaselineComparison>,
}

#[derive(Debug, Serialize)]
struct YearlyDocument<'a> {
    stage: &'static str,
    version: &'static str,
    generated_at: &'a str,
    parameters: &'a YearlySettings,
    total_events: u64,
    years: Vec<i32>,
    rows: Vec<GroupRow>,
}

/// Percentage change rounded to two decimals; `None` without a non-zero prior value.
pub fn change_pct(previous: Option<u64>, current: u64) -> Option<f64> {
    match previous {
        Some(previous) if previous > 0 => {
            let pct = (current as f64 - previous as f64) / previous as f64 * 100.0;
            Some((pct * 100.0).round() / 100.0)
        }
        _ => None,
    }
}

fn within_to_date(date: NaiveDate, as_of: NaiveDate) -> bool {
    (date.month(), date.day()) <= (as_of.month(), as_of.day())
}

pub fn run(
    settings: &YearlySettings,
    table: &EventTable,
    generated_at: &str,
) -> Result<StageOutput, AnalysisJobError> {
    let column = table.column(&settings.group_by_col)?;

    let mut counts: BTreeMap<String, BTreeMap<i32, (u64, u64)>> = BTreeMap::new();
    let mut total_events = 0u64;
    for row in &table.rows {
        let group = table.value(row, &column);
        if group.is_empty() {
            continue;
        }
        let date = row.timestamp.date();
        let entry = counts
            .entry(group.to_string())
            .or_default()
            .entry(date.year())
            .or_insert((0, 0));
        entry.0 += 1;
        if within_to_date(date, settings.as_of) {
            entry.1 += 1;
        }
        total_events += 1;
    }

    let years: Vec<i32> = match (table.min_timestamp(), table.max_timestamp()) {
        (Some(min), Some(max)) => (min.year()..=max.year()).collect(),
        _ => Vec::new(),
    };

    let rows = counts
        .into_iter()
        .map(|(group, by_year)| {
            let mut previous: Option<(u64, u64)> = None;
            let cells: Vec<YearCell> = years
                .iter()
                .map(|year| {
                    let (total, to_date) = by_year.get(year).copied().unwrap_or((0, 0));
                    let cell = YearCell {
                        year: *year,
                        total,
                        to_date,
                        total_change_pct: change_pct(previous.map(|p| p.0), total),
                        to_date_change_pct: change_pct(previous.map(|p| p.1), to_date),
                    };
                    previous = Some((total, to_date));
                    cell
                })
                .collect();
            let baseline = settings.baseline_year.and_then(|vs_year| {
                let latest_year = *years.last()?;
                if !years.contains(&vs_year) {
                    return None;
                }
                let baseline_total = by_year.get(&vs_year).map_or(0, |c| c.0);
                let latest_total = by_year.get(&latest_year).map_or(0, |c| c.0);
                Some(BaselineComparison {
                    vs_year,
                    latest_year,
                    baseline_total,
                    latest_total,
                    change_pct: change_pct(Some(baseline_total), latest_total),
                })
            });
            GroupRow {
                group,
                years: cells,
                baseline,
            }
        })
        .collect();

    let document = YearlyDocument {
        stage: STAGE.as_str(),
        version: STAGE_VERSION,
        generated_at,
        parameters: settings,
        total_events,
        years,
        rows,
    };
    let document = serde_json::to_value(&document)
        .map_err(|err| AnalysisJobError::new("stage_failed", err.to_string()))?;

    Ok(StageOutput {
        document,
        plots: Vec::new(),
        report: None,
    })
}
