use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

const FLAT_SLOPE_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Upward,
    Downward,
    Flat,
}

impl TrendDirection {
    pub fn from_slope(slope: f64) -> Self {
        if slope.abs() < FLAT_SLOPE_EPS {
            TrendDirection::Flat
        } else if slope > 0.0 {
            TrendDirection::Upward
        } else {
            TrendDirection::Downward
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Upward => "upward",
            TrendDirection::Downward => "downward",
            TrendDirection::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendFit {
    pub slope: f64,
    pub intercept: f64,
    pub direction: TrendDirection,
    /// Two-sided t-test of the slope against zero; `None` below three points.
    pub p_value: Option<f64>,
    pub n: usize,
}

/// Ordinary least squares of `count ~ week_index` over the given window.
pub fn fit_trend(counts: &[u64]) -> Option<TrendFit> {
    let n = counts.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = counts.iter().map(|c| *c as f64).sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (idx, count) in counts.iter().enumerate() {
        let dx = idx as f64 - mean_x;
        sxx += dx * dx;
        sxy += dx * (*count as f64 - mean_y);
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let direction = TrendDirection::from_slope(slope);

    let p_value = if n < 3 {
        None
    } else {
        let sse: f64 = counts
            .iter()
            .enumerate()
            .map(|(idx, count)| {
                let residual = *count as f64 - (intercept + slope * idx as f64);
                residual * residual
            })
            .sum();
        slope_p_value(slope, sse, sxx, nf - 2.0, direction)
    };

    Some(TrendFit {
        slope,
        intercept,
        direction,
        p_value,
        n,
    })
}

fn slope_p_value(slope: f64, sse: f64, sxx: f64, df: f64, direction: TrendDirection) -> Option<f64> {
    if sse <= 1e-12 {
        // A perfect fit: any non-zero slope is certain, a zero slope carries no evidence.
        return Some(if direction == TrendDirection::Flat { 1.0 } else { 0.0 });
    }
    let se = (sse / df / sxx).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return None;
    }
    let t = slope / se;
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p = 2.0 * dist.sf(t.abs());
    Some(p.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rising_window_is_upward_and_significant() {
        let fit = fit_trend(&[1, 3, 5, 8, 9, 12]).unwrap();
        assert_eq!(fit.direction, TrendDirection::Upward);
        assert!(fit.slope > 1.5);
        assert!(fit.p_value.unwrap() < 0.01);
    }

    #[test]
    fn constant_window_is_flat_with_p_one() {
        let fit = fit_trend(&[4, 4, 4, 4]).unwrap();
        assert_eq!(fit.direction, TrendDirection::Flat);
        assert_eq!(fit.p_value, Some(1.0));
    }

    #[test]
    fn perfect_line_has_zero_p_value() {
        let fit = fit_trend(&[6, 4, 2, 0]).unwrap();
        assert_eq!(fit.direction, TrendDirection::Downward);
        assert!((fit.slope + 2.0).abs() < 1e-12);
        assert_eq!(fit.p_value, Some(0.0));
    }

    #[test]
    fn short_windows_have_no_test() {
        assert!(fit_trend(&[3]).is_none());
        let two = fit_trend(&[1, 2]).unwrap();
        assert_eq!(two.p_value, None);
        assert_eq!(two.direction, TrendDirection::Upward);
    }

    #[test]
    fn matches_reference_t_test() {
        // x = 0..4, y = [2, 1, 4, 3, 5]: slope 0.8, r^2 = 0.64, t = 2.3094 with 3 df.
        let fit = fit_trend(&[2, 1, 4, 3, 5]).unwrap();
        assert!((fit.slope - 0.8).abs() < 1e-12);
        let p = fit.p_value.unwrap();
        assert!((p - 0.1041).abs() < 1e-3, "p={p}");
    }
}
