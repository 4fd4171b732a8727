/// Bonferroni-corrected significance threshold for a family of `tests` hypotheses.
///
/// An empty family keeps the nominal alpha.
pub fn bonferroni_threshold(alpha: f64, tests: usize) -> f64 {
    if tests == 0 {
        return alpha;
    }
    alpha / tests as f64
}

/// Strict comparison: a p-value equal to the threshold is not significant.
pub fn is_significant(p_value: Option<f64>, threshold: f64) -> bool {
    matches!(p_value, Some(p) if p.is_finite() && p < threshold)
}
