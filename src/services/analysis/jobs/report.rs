use super::detection::{DetectionMode, DetectionRun, DetectionSettings, GroupAnalysis};
use super::stages::StageId;

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn format_p(value: Option<f64>) -> String {
    match value {
        Some(p) if p < 1e-4 => format!("{p:.2e}"),
        Some(p) => format!("{p:.4}"),
        None => "untested".to_string(),
    }
}

fn group_label(group: &GroupAnalysis, labels: &[&str]) -> String {
    labels
        .iter()
        .zip(group.key.iter())
        .map(|(label, value)| format!("{label}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn methodology(settings: &DetectionSettings, run: &DetectionRun) -> String {
    let summary = &run.summary;
    let correction = match settings.mode {
        DetectionMode::Conservative => format!(
            "Bonferroni correction ({:?} family) over {} anomaly and {} trend tests",
            settings.bonferroni_scope, summary.anomaly_tests, summary.trend_tests
        ),
        DetectionMode::Screening => format!(
            "nominal alpha without correction; {} single-event anomalies on sub-1/week baselines suppressed",
            summary.suppressed_noise_anomalies
        ),
    };
    let windows = settings
        .trend_windows
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let mut html = String::from("<h2>Methodology</h2>\n<ul>\n");
    html.push_str(&format!(
        "<li>Weekly counts; the last {} weeks are tested against a Poisson or negative binomial model fitted on at least {} prior weeks.</li>\n",
        settings.anomaly_weeks, settings.min_history_weeks
    ));
    html.push_str(&format!(
        "<li>Trend windows (weeks): {}; windows with fewer than {} events are not tested.</li>\n",
        escape_html(&windows),
        settings.min_trend_events
    ));
    html.push_str(&format!("<li>Significance: {}.</li>\n", escape_html(&correction)));
    html.push_str(&format!(
        "<li>Thresholds: anomaly p &lt; {:.3e}, trend p &lt; {:.3e}.</li>\n",
        summary.anomaly_threshold, summary.trend_threshold
    ));
    html.push_str(&format!(
        "<li>Groups analysed: {}; excluded for short history: {}.</li>\n</ul>\n",
        run.groups.len(),
        run.excluded.len()
    ));
    html
}

/// Renders the significant findings of a detection run as a standalone HTML page.
pub fn render_detection_report(
    stage: StageId,
    generated_at: &str,
    settings: &DetectionSettings,
    run: &DetectionRun,
    labels: &[&str],
) -> String {
    let title = format!("{} findings", stage.as_str());
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{}</title>\n", escape_html(&title)));
    html.push_str(
        "<style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse}\
         td,th{border:1px solid #ccc;padding:4px 8px;text-align:left}</style>\n",
    );
    html.push_str("</head>\n<body>\n");
    html.push_str(&format!("<h1>{}</h1>\n", escape_html(&title)));
    html.push_str(&format!("<p>Generated at {}</p>\n", escape_html(generated_at)));
    html.push_str(&methodology(settings, run));

    html.push_str("<h2>Significant findings</h2>\n");
    let mut rows = String::new();
    for group in &run.groups {
        let label = escape_html(&group_label(group, labels));
        for finding in group.analysis.anomalies.iter().filter(|f| f.significant) {
            rows.push_str(&format!(
                "<tr><td>{label}</td><td>anomaly</td><td>week of {}</td><td>observed {} vs average {:.2} (z = {:.2})</td><td>{}</td></tr>\n",
                finding.week,
                finding.observed,
                finding.historical_avg,
                finding.z_score,
                format_p(Some(finding.p_value)),
            ));
        }
        for finding in group.analysis.trends.iter().filter(|f| f.significant) {
            rows.push_str(&format!(
                "<tr><td>{label}</td><td>trend</td><td>{}</td><td>{} slope {:.3}/week over {} events</td><td>{}</td></tr>\n",
                escape_html(&finding.window),
                finding.direction.as_str(),
                finding.slope,
                finding.total_events,
                format_p(finding.p_value),
            ));
        }
    }
    if rows.is_empty() {
        html.push_str("<p>No significant findings.</p>\n");
    } else {
        html.push_str(
            "<table>\n<tr><th>Group</th><th>Kind</th><th>When</th><th>Detail</th><th>p-value</th></tr>\n",
        );
        html.push_str(&rows);
        html.push_str("</table>\n");
    }
    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analysis::jobs::detection::tests::{settings, weekly};
    use crate::services::analysis::jobs::detection::run_detection;
    use crate::services::analysis::timeseries::{GroupedTimeSeries, GroupingScheme};
    use std::collections::BTreeMap;

    fn series(primary: &str, counts: &[u64]) -> GroupedTimeSeries {
        GroupedTimeSeries {
            scheme: GroupingScheme::columns(&["district", "category"]),
            through: None,
            groups: BTreeMap::from([(
                vec![primary.to_string(), "Theft".to_string()],
                weekly(counts),
            )]),
        }
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn lists_significant_findings_with_escaped_labels() {
        let s = settings(DetectionMode::Screening);
        let grouped = series("<North>", &[2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 9]);
        let run = run_detection(&grouped, None, 1, &s);
        let html = render_detection_report(
            StageId::UnivariateAnomaly,
            "2024-01-01T00:00:00Z",
            &s,
            &run,
            &["district", "category"],
        );
        assert!(html.contains("district=&lt;North&gt;, category=Theft"));
        assert!(html.contains("observed 9"));
        assert!(!html.contains("No significant findings"));
    }

    #[test]
    fn says_so_when_nothing_is_significant() {
        let s = settings(DetectionMode::Conservative);
        let grouped = series("North", &[2; 12]);
        let run = run_detection(&grouped, None, 1, &s);
        let html = render_detection_report(StageId::H3Anomaly, "now", &s, &run, &["cell", "category"]);
        assert!(html.contains("No significant findings."));
        assert!(html.contains("Bonferroni"));
    }
}
