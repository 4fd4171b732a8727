use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::services::analysis::artifacts::{sanitize_file_component, sha256_hex};
use crate::services::analysis::stats::distribution::{self, FittedModel};
use crate::services::analysis::stats::multiple_testing::{bonferroni_threshold, is_significant};
use crate::services::analysis::stats::trend::{fit_trend, TrendDirection};
use crate::services::analysis::timeseries::{GroupKey, GroupedTimeSeries, WeekCount, WeeklySeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Bonferroni-corrected thresholds.
    Conservative,
    /// Nominal alpha plus the low-baseline noise filter.
    Screening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonferroniScope {
    /// Anomaly and trend tests form one family.
    Combined,
    /// Anomaly tests and trend tests are corrected independently.
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotPolicy {
    Both,
    Trends,
    Anomalies,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSettings {
    pub mode: DetectionMode,
    pub anomaly_alpha: f64,
    pub trend_alpha: f64,
    pub anomaly_weeks: usize,
    pub trend_windows: Vec<usize>,
    pub min_history_weeks: usize,
    pub min_trend_events: u64,
    pub include_context: bool,
    pub bonferroni_scope: BonferroniScope,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyContext {
    pub observed: u64,
    pub historical_avg: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendContext {
    pub slope: f64,
    pub direction: TrendDirection,
    pub p_value: Option<f64>,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyFinding {
    pub week: NaiveDate,
    pub observed: u64,
    pub historical_avg: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub significant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<AnomalyContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendFinding {
    pub window: String,
    pub weeks: usize,
    pub slope: f64,
    pub direction: TrendDirection,
    /// `None` when the window holds fewer than `min_trend_events` events.
    pub p_value: Option<f64>,
    pub total_events: u64,
    pub significant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<TrendContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesAnalysis {
    pub model: FittedModel,
    pub historical_weeks: usize,
    pub anomalies: Vec<AnomalyFinding>,
    pub trends: Vec<TrendFinding>,
    pub recent_weeks: Vec<WeekCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAnalysis {
    #[serde(skip)]
    pub key: GroupKey,
    #[serde(flatten)]
    pub analysis: SeriesAnalysis,
    pub suppressed_noise_anomalies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedGroup {
    #[serde(skip)]
    pub key: GroupKey,
    pub weeks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignificanceSummary {
    pub mode: DetectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonferroni_scope: Option<BonferroniScope>,
    pub anomaly_tests: usize,
    pub trend_tests: usize,
    pub anomaly_threshold: f64,
    pub trend_threshold: f64,
    pub significant_anomalies: usize,
    pub significant_trends: usize,
    pub suppressed_noise_anomalies: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_anomaly_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_trend_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRun {
    pub groups: Vec<GroupAnalysis>,
    pub excluded: Vec<ExcludedGroup>,
    /// Secondary-only analyses keyed by the secondary group value.
    pub context: BTreeMap<String, SeriesAnalysis>,
    pub summary: SignificanceSummary,
}

pub fn window_label(weeks: usize) -> String {
    format!("last_{weeks}_weeks")
}

/// Fits the model on the historical portion and evaluates the trailing windows.
///
/// Returns `None` when fewer than `min_history_weeks` weeks precede the anomaly window.
pub fn analyze_series(series: &WeeklySeries, settings: &DetectionSettings) -> Option<SeriesAnalysis> {
    let counts = series.counts();
    let len = counts.len();
    let anomaly_weeks = settings.anomaly_weeks.max(1);
    let required = anomaly_weeks.checked_add(settings.min_history_weeks.max(1))?;
    if len < required {
        return None;
    }
    let split = len.checked_sub(anomaly_weeks)?;
    let model = distribution::fit(&counts[..split])?;

    let anomalies = (split..len)
        .map(|idx| {
            let observed = counts[idx];
            AnomalyFinding {
                week: series.week_at(idx),
                observed,
                historical_avg: model.historical_mean,
                z_score: distribution::z_score(&model, observed),
                p_value: distribution::survival_probability(&model, observed),
                significant: false,
                context: None,
            }
        })
        .collect();

    let trends = settings
        .trend_windows
        .iter()
        .filter(|weeks| **weeks <= len)
        .filter_map(|weeks| {
            let window = &counts[len - weeks..];
            let fit = fit_trend(window)?;
            let total_events: u64 = window.iter().sum();
            let tested = total_events >= settings.min_trend_events;
            Some(TrendFinding {
                window: window_label(*weeks),
                weeks: *weeks,
                slope: fit.slope,
                direction: fit.direction,
                p_value: if tested { fit.p_value } else { None },
                total_events,
                significant: false,
                context: None,
            })
        })
        .collect();

    let recent_len = settings
        .trend_windows
        .iter()
        .copied()
        .chain(std::iter::once(anomaly_weeks))
        .max()
        .unwrap_or(anomaly_weeks)
        .min(len);
    let recent_weeks = series
        .points()
        .into_iter()
        .skip(len - recent_len)
        .collect();

    Some(SeriesAnalysis {
        model,
        historical_weeks: split,
        anomalies,
        trends,
        recent_weeks,
    })
}

/// An anomaly whose baseline is below one event a week and whose observed count is a
/// single event carries no signal.
pub fn is_noise(finding: &AnomalyFinding) -> bool {
    finding.historical_avg < 1.0 && finding.observed == 1
}

fn thresholds(settings: &DetectionSettings, anomaly_tests: usize, trend_tests: usize) -> (f64, f64) {
    match settings.mode {
        DetectionMode::Screening => (settings.anomaly_alpha, settings.trend_alpha),
        DetectionMode::Conservative => match settings.bonferroni_scope {
            BonferroniScope::Combined => {
                let family = anomaly_tests + trend_tests;
                (
                    bonferroni_threshold(settings.anomaly_alpha, family),
                    bonferroni_threshold(settings.trend_alpha, family),
                )
            }
            BonferroniScope::Separate => (
                bonferroni_threshold(settings.anomaly_alpha, anomaly_tests),
                bonferroni_threshold(settings.trend_alpha, trend_tests),
            ),
        },
    }
}

fn count_tests<'a>(analyses: impl Iterator<Item = &'a SeriesAnalysis>) -> (usize, usize) {
    analyses.fold((0, 0), |(anomalies, trends), analysis| {
        (
            anomalies + analysis.anomalies.len(),
            trends + analysis.trends.iter().filter(|t| t.p_value.is_some()).count(),
        )
    })
}

fn mark_significance(analysis: &mut SeriesAnalysis, anomaly_threshold: f64, trend_threshold: f64) {
    for finding in &mut analysis.anomalies {
        finding.significant = is_significant(Some(finding.p_value), anomaly_threshold);
    }
    for finding in &mut analysis.trends {
        // A zero slope is never a trend, whatever its p-value.
        finding.significant = finding.direction != TrendDirection::Flat
            && is_significant(finding.p_value, trend_threshold);
    }
}

/// Runs the anomaly/trend analysis over every group, then over the secondary-only
/// context series, and applies the configured significance policy to each family.
///
/// `secondary_index` is the position of the secondary value in the group keys.
pub fn run_detection(
    series: &GroupedTimeSeries,
    context: Option<&GroupedTimeSeries>,
    secondary_index: usize,
    settings: &DetectionSettings,
) -> DetectionRun {
    let entries: Vec<(&GroupKey, &WeeklySeries)> = series.groups.iter().collect();
    let analyzed: Vec<(GroupKey, usize, Option<SeriesAnalysis>)> = entries
        .par_iter()
        .map(|(key, weekly)| ((*key).clone(), weekly.len(), analyze_series(weekly, settings)))
        .collect();

    let mut groups = Vec::new();
    let mut excluded = Vec::new();
    for (key, weeks, analysis) in analyzed {
        match analysis {
            Some(analysis) => groups.push(GroupAnalysis {
                key,
                analysis,
                suppressed_noise_anomalies: 0,
            }),
            None => excluded.push(ExcludedGroup { key, weeks }),
        }
    }

    let mut suppressed_total = 0;
    if settings.mode == DetectionMode::Screening {
        for group in &mut groups {
            let before = group.analysis.anomalies.len();
            group.analysis.anomalies.retain(|finding| !is_noise(finding));
            group.suppressed_noise_anomalies = before - group.analysis.anomalies.len();
            suppressed_total += group.suppressed_noise_anomalies;
        }
    }

    let (anomaly_tests, trend_tests) = count_tests(groups.iter().map(|g| &g.analysis));
    let (anomaly_threshold, trend_threshold) = thresholds(settings, anomaly_tests, trend_tests);
    for group in &mut groups {
        mark_significance(&mut group.analysis, anomaly_threshold, trend_threshold);
    }

    let mut context_map = BTreeMap::new();
    let mut context_thresholds = None;
    if let (true, Some(context)) = (settings.include_context, context) {
        let entries: Vec<(&GroupKey, &WeeklySeries)> = context.groups.iter().collect();
        let analyzed: Vec<(String, SeriesAnalysis)> = entries
            .par_iter()
            .filter_map(|(key, weekly)| {
                let secondary = key.first()?.clone();
                let mut analysis = analyze_series(weekly, settings)?;
                if settings.mode == DetectionMode::Screening {
                    analysis.anomalies.retain(|finding| !is_noise(finding));
                }
                Some((secondary, analysis))
            })
            .collect();
        let (ctx_anomaly_tests, ctx_trend_tests) = count_tests(analyzed.iter().map(|(_, a)| a));
        let (ctx_anomaly, ctx_trend) = thresholds(settings, ctx_anomaly_tests, ctx_trend_tests);
        for (secondary, mut analysis) in analyzed {
            mark_significance(&mut analysis, ctx_anomaly, ctx_trend);
            context_map.insert(secondary, analysis);
        }
        context_thresholds = Some((ctx_anomaly, ctx_trend));
        for group in &mut groups {
            if let Some(ctx) = group
                .key
                .get(secondary_index)
                .and_then(|secondary| context_map.get(secondary))
            {
                attach_context(&mut group.analysis, ctx);
            }
        }
    }

    let significant_anomalies = groups
        .iter()
        .flat_map(|g| g.analysis.anomalies.iter())
        .filter(|f| f.significant)
        .count();
    let significant_trends = groups
        .iter()
        .flat_map(|g| g.analysis.trends.iter())
        .filter(|f| f.significant)
        .count();

    tracing::debug!(
        groups = groups.len(),
        excluded = excluded.len(),
        anomaly_tests,
        trend_tests,
        significant_anomalies,
        significant_trends,
        "detection finished"
    );

    DetectionRun {
        groups,
        excluded,
        context: context_map,
        summary: SignificanceSummary {
            mode: settings.mode,
            bonferroni_scope: (settings.mode == DetectionMode::Conservative)
                .then_some(settings.bonferroni_scope),
            anomaly_tests,
            trend_tests,
            anomaly_threshold,
            trend_threshold,
            significant_anomalies,
            significant_trends,
            suppressed_noise_anomalies: suppressed_total,
            context_anomaly_threshold: context_thresholds.map(|(a, _)| a),
            context_trend_threshold: context_thresholds.map(|(_, t)| t),
        },
    }
}

fn attach_context(analysis: &mut SeriesAnalysis, context: &SeriesAnalysis) {
    for finding in &mut analysis.anomalies {
        finding.context = context
            .anomalies
            .iter()
            .find(|c| c.week == finding.week)
            .map(|c| AnomalyContext {
                observed: c.observed,
                historical_avg: c.historical_avg,
                z_score: c.z_score,
                p_value: c.p_value,
                significant: c.significant,
            });
    }
    for finding in &mut analysis.trends {
        finding.context = context
            .trends
            .iter()
            .find(|c| c.window == finding.window)
            .map(|c| TrendContext {
                slope: c.slope,
                direction: c.direction,
                p_value: c.p_value,
                significant: c.significant,
            });
    }
}

/// Request for an externally rendered chart of one group's series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotRequest {
    /// Artifact name of this request document.
    #[serde(skip)]
    pub name: String,
    pub image: String,
    pub title: String,
    pub group: BTreeMap<String, String>,
    pub series: Vec<WeekCount>,
    pub anomalies: Vec<AnomalyFinding>,
    pub trends: Vec<TrendFinding>,
}

/// Builds one plot request per group holding a significant finding of a kind the policy
/// asks for. Results are unaffected by the policy.
pub fn plot_requests(
    run: &DetectionRun,
    series: &GroupedTimeSeries,
    policy: PlotPolicy,
    labels: &[&str],
) -> Vec<PlotRequest> {
    let (want_anomalies, want_trends) = match policy {
        PlotPolicy::None => return Vec::new(),
        PlotPolicy::Both => (true, true),
        PlotPolicy::Anomalies => (true, false),
        PlotPolicy::Trends => (false, true),
    };

    run.groups
        .iter()
        .filter_map(|group| {
            let anomalies: Vec<AnomalyFinding> = group
                .analysis
                .anomalies
                .iter()
                .filter(|f| want_anomalies && f.significant)
                .cloned()
                .collect();
            let trends: Vec<TrendFinding> = group
                .analysis
                .trends
                .iter()
                .filter(|f| want_trends && f.significant)
                .cloned()
                .collect();
            if anomalies.is_empty() && trends.is_empty() {
                return None;
            }
            let stem = plot_stem(&group.key);
            Some(PlotRequest {
                name: format!("{stem}.json"),
                image: format!("{stem}.png"),
                title: group.key.join(" / "),
                group: labels
                    .iter()
                    .zip(group.key.iter())
                    .map(|(label, value)| (label.to_string(), value.clone()))
                    .collect(),
                series: series
                    .groups
                    .get(&group.key)
                    .map(WeeklySeries::points)
                    .unwrap_or_default(),
                anomalies,
                trends,
            })
        })
        .collect()
}

/// Readable stem for a group's plot files. A digest of the raw key is appended when
/// sanitizing altered a part or a part contains the `_` separator.
pub fn plot_stem(key: &GroupKey) -> String {
    let parts: Vec<String> = key.iter().map(|part| sanitize_file_component(part)).collect();
    let ambiguous = parts
        .iter()
        .zip(key.iter())
        .any(|(clean, raw)| clean != raw || clean.contains('_'));
    let stem = format!("plot_{}", parts.join("_"));
    if !ambiguous {
        return stem;
    }
    let digest = sha256_hex(key.join("\u{1f}").as_bytes());
    format!("{stem}_{}", &digest[..8])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::analysis::timeseries::GroupingScheme;
    use chrono::Duration;

    pub(crate) fn settings(mode: DetectionMode) -> DetectionSettings {
        DetectionSettings {
            mode,
            anomaly_alpha: 0.05,
            trend_alpha: 0.05,
            anomaly_weeks: 4,
            trend_windows: vec![4],
            min_history_weeks: 8,
            min_trend_events: 4,
            include_context: true,
            bonferroni_scope: BonferroniScope::Combined,
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    pub(crate) fn weekly(counts: &[u64]) -> WeeklySeries {
        let through = monday() + Duration::weeks(counts.len() as i64 - 1);
        let sparse: BTreeMap<NaiveDate, u64> = counts
            .iter()
            .enumerate()
            .map(|(idx, count)| (monday() + Duration::weeks(idx as i64), *count))
            .collect();
        WeeklySeries::from_sparse(&sparse, through).unwrap()
    }

    fn grouped(groups: Vec<(&str, &str, Vec<u64>)>) -> GroupedTimeSeries {
        GroupedTimeSeries {
            scheme: GroupingScheme::columns(&["primary", "secondary"]),
            through: None,
            groups: groups
                .into_iter()
                .map(|(primary, secondary, counts)| {
                    (vec![primary.to_string(), secondary.to_string()], weekly(&counts))
                })
                .collect(),
        }
    }

    #[test]
    fn short_histories_are_excluded_not_zero_filled() {
        let s = settings(DetectionMode::Conservative);
        assert!(analyze_series(&weekly(&[1; 11]), &s).is_none());
        let analysis = analyze_series(&weekly(&[1; 12]), &s).unwrap();
        assert_eq!(analysis.historical_weeks, 8);
        assert_eq!(analysis.anomalies.len(), 4);
        assert_eq!(analysis.recent_weeks.len(), 4);
    }

    #[test]
    fn model_is_fit_on_history_only() {
        let s = settings(DetectionMode::Conservative);
        let analysis =
            analyze_series(&weekly(&[2, 2, 2, 2, 2, 2, 2, 2, 50, 60, 70, 80]), &s).unwrap();
        assert!((analysis.model.historical_mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn scenario_a_is_flagged_in_both_modes() {
        let counts: &[u64] = &[2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 9];
        for mode in [DetectionMode::Conservative, DetectionMode::Screening] {
            let series = grouped(vec![("North", "Theft", counts.to_vec())]);
            let run = run_detection(&series, None, 1, &settings(mode));
            let last = run.groups[0].analysis.anomalies.last().unwrap();
            assert_eq!(last.observed, 9);
            assert!(last.z_score > 4.0);
            assert!(last.significant, "{mode:?}");
        }
    }

    #[test]
    fn bonferroni_divides_alpha_by_all_tests_while_screening_does_not() {
        let series = grouped(vec![
            ("A", "x", vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 5, 6]),
            ("B", "x", vec![4, 5, 4, 5, 4, 5, 4, 5, 6, 7, 8, 9]),
            ("C", "x", vec![1, 0, 1, 0, 1, 0, 1, 0, 0, 1, 2, 3]),
        ]);

        let conservative = run_detection(&series, None, 1, &settings(DetectionMode::Conservative));
        let summary = &conservative.summary;
        let family = summary.anomaly_tests + summary.trend_tests;
        assert_eq!(summary.anomaly_tests, 12);
        assert!((summary.anomaly_threshold - 0.05 / family as f64).abs() < 1e-15);
        for group in &conservative.groups {
            for finding in &group.analysis.anomalies {
                assert_eq!(finding.significant, finding.p_value < 0.05 / family as f64);
            }
        }

        let screening = run_detection(&series, None, 1, &settings(DetectionMode::Screening));
        assert_eq!(screening.summary.anomaly_threshold, 0.05);
        for group in &screening.groups {
            for finding in &group.analysis.anomalies {
                assert_eq!(finding.significant, finding.p_value < 0.05);
            }
        }
    }

    #[test]
    fn separate_scope_corrects_each_family_on_its_own() {
        let series = grouped(vec![("A", "x", vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 5, 6])]);
        let mut s = settings(DetectionMode::Conservative);
        s.bonferroni_scope = BonferroniScope::Separate;
        let run = run_detection(&series, None, 1, &s);
        assert!((run.summary.anomaly_threshold - 0.05 / 4.0).abs() < 1e-15);
        assert!((run.summary.trend_threshold - 0.05).abs() < 1e-15);
    }

    #[test]
    fn screening_drops_single_events_on_near_zero_baselines() {
        let series = grouped(vec![("Quiet", "x", vec![0, 0, 0, 1, 0, 0, 0, 0, 1, 0, 1, 2])]);
        let run = run_detection(&series, None, 1, &settings(DetectionMode::Screening));
        let anomalies = &run.groups[0].analysis.anomalies;
        assert!(anomalies.iter().all(|f| !is_noise(f)));
        assert_eq!(run.groups[0].suppressed_noise_anomalies, 2);
        assert_eq!(run.summary.suppressed_noise_anomalies, 2);
        assert!(anomalies.iter().any(|f| f.observed == 2));

        let conservative = run_detection(&series, None, 1, &settings(DetectionMode::Conservative));
        assert_eq!(conservative.groups[0].analysis.anomalies.len(), 4);
    }

    #[test]
    fn flat_trends_are_never_significant() {
        let series = grouped(vec![("Flat", "x", vec![1, 2, 1, 2, 1, 2, 1, 2, 5, 5, 5, 5])]);
        let mut s = settings(DetectionMode::Screening);
        // Above any p-value, so only the direction can keep it from being significant.
        s.trend_alpha = 1.5;
        let run = run_detection(&series, None, 1, &s);
        let trend = &run.groups[0].analysis.trends[0];
        assert_eq!(trend.direction, TrendDirection::Flat);
        assert_eq!(trend.p_value, Some(1.0));
        assert!(!trend.significant);
    }

    #[test]
    fn sparse_windows_are_reported_but_not_tested() {
        let series = grouped(vec![("Low", "x", vec![1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 1, 2])]);
        let run = run_detection(&series, None, 1, &settings(DetectionMode::Conservative));
        let trend = &run.groups[0].analysis.trends[0];
        assert_eq!(trend.total_events, 3);
        assert_eq!(trend.p_value, None);
        assert_eq!(run.summary.trend_tests, 0);
    }

    #[test]
    fn context_is_attached_by_secondary_and_week() {
        let series = grouped(vec![
            ("North", "Theft", vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 9]),
            ("South", "Theft", vec![1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]),
        ]);
        let context = GroupedTimeSeries {
            scheme: GroupingScheme::columns(&["secondary"]),
            through: None,
            groups: BTreeMap::from([(
                vec!["Theft".to_string()],
                weekly(&[3, 4, 3, 4, 3, 4, 3, 4, 3, 4, 3, 10]),
            )]),
        };
        let run = run_detection(&series, Some(&context), 1, &settings(DetectionMode::Screening));
        assert!(run.context.contains_key("Theft"));
        let north = &run.groups[0];
        let last = north.analysis.anomalies.last().unwrap();
        assert_eq!(last.context.as_ref().unwrap().observed, 10);
        assert!(north.analysis.trends[0].context.is_some());

        let mut no_context = settings(DetectionMode::Screening);
        no_context.include_context = false;
        let run = run_detection(&series, Some(&context), 1, &no_context);
        assert!(run.context.is_empty());
        assert!(run.groups[0].analysis.anomalies.iter().all(|f| f.context.is_none()));
    }

    #[test]
    fn detection_is_deterministic() {
        let series = grouped(vec![
            ("A", "x", vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 5, 6]),
            ("B", "y", vec![0, 5, 1, 9, 0, 7, 2, 8, 3, 1, 0, 12]),
        ]);
        let s = settings(DetectionMode::Conservative);
        let a = serde_json::to_vec(&run_detection(&series, None, 1, &s).groups).unwrap();
        let b = serde_json::to_vec(&run_detection(&series, None, 1, &s).groups).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn plot_policy_only_gates_requests() {
        let series = grouped(vec![("North", "Theft/Larceny", vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 9])]);
        let run = run_detection(&series, None, 1, &settings(DetectionMode::Screening));
        assert!(plot_requests(&run, &series, PlotPolicy::None, &["p", "s"]).is_empty());
        assert!(plot_requests(&run, &series, PlotPolicy::Trends, &["p", "s"]).is_empty());
        let plots = plot_requests(&run, &series, PlotPolicy::Anomalies, &["p", "s"]);
        assert_eq!(plots.len(), 1);
        let stem = plot_stem(&vec!["North".to_string(), "Theft/Larceny".to_string()]);
        assert!(stem.starts_with("plot_North_TheftLarceny_"));
        assert_eq!(plots[0].name, format!("{stem}.json"));
        assert_eq!(plots[0].image, format!("{stem}.png"));
        assert_eq!(plots[0].series.len(), 12);
    }

    #[test]
    fn plot_stems_stay_distinct_for_distinct_keys() {
        let key = |a: &str, b: &str| vec![a.to_string(), b.to_string()];
        assert_eq!(plot_stem(&key("North", "Theft")), "plot_North_Theft");
        assert_ne!(plot_stem(&key("North_A", "B")), plot_stem(&key("North", "A_B")));
        assert_ne!(plot_stem(&key("North", "A/B")), plot_stem(&key("North", "AB")));
    }

    #[test]
    fn screening_filters_noise_from_context_analyses() {
        let series = grouped(vec![("North", "Theft", vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3])]);
        let context = GroupedTimeSeries {
            scheme: GroupingScheme::columns(&["secondary"]),
            through: None,
            groups: BTreeMap::from([(
                vec!["Theft".to_string()],
                weekly(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 1, 0, 0]),
            )]),
        };
        let run = run_detection(&series, Some(&context), 1, &settings(DetectionMode::Screening));
        let theft = &run.context["Theft"];
        assert!(theft.anomalies.iter().all(|f| !is_noise(f)));
        assert_eq!(theft.anomalies.len(), 3);
        let north = &run.groups[0].analysis;
        assert!(north.anomalies.iter().all(|f| f
            .context
            .as_ref()
            .map_or(true, |ctx| !(ctx.observed == 1 && ctx.historical_avg < 1.0))));

        let conservative =
            run_detection(&series, Some(&context), 1, &settings(DetectionMode::Conservative));
        assert_eq!(conservative.context["Theft"].anomalies.len(), 4);
    }

    #[test]
    fn oversized_windows_exclude_instead_of_overflowing() {
        let mut s = settings(DetectionMode::Conservative);
        s.anomaly_weeks = usize::MAX;
        assert!(analyze_series(&weekly(&[1; 12]), &s).is_none());
        let mut s = settings(DetectionMode::Conservative);
        s.min_history_weeks = usize::MAX;
        assert!(analyze_series(&weekly(&[1; 12]), &s).is_none());
    }
}
