use serde::Serialize;
use statrs::function::{beta, gamma};

/// Floor applied to rates and standard deviations so degenerate histories never divide by zero.
pub const RATE_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    Poisson,
    NegativeBinomial,
}

impl DistributionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionKind::Poisson => "poisson",
            DistributionKind::NegativeBinomial => "negative_binomial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedDistribution {
    Poisson { lambda: f64 },
    /// Failures before the `r`-th success with success probability `p`.
    NegativeBinomial { r: f64, p: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FittedModel {
    #[serde(flatten)]
    pub distribution: FittedDistribution,
    pub historical_mean: f64,
    pub historical_variance: f64,
}

impl FittedModel {
    pub fn kind(&self) -> DistributionKind {
        match self.distribution {
            FittedDistribution::Poisson { .. } => DistributionKind::Poisson,
            FittedDistribution::NegativeBinomial { .. } => DistributionKind::NegativeBinomial,
        }
    }

    pub fn mean(&self) -> f64 {
        match self.distribution {
            FittedDistribution::Poisson { lambda } => lambda,
            FittedDistribution::NegativeBinomial { r, p } => r * (1.0 - p) / p,
        }
    }

    pub fn variance(&self) -> f64 {
        match self.distribution {
            FittedDistribution::Poisson { lambda } => lambda,
            FittedDistribution::NegativeBinomial { r, p } => r * (1.0 - p) / (p * p),
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().max(0.0).sqrt().max(RATE_FLOOR)
    }
}

/// Model selection depends on the first two sample moments only.
pub fn select_kind(mean: f64, variance: f64) -> DistributionKind {
    if variance > mean && mean > 0.0 {
        DistributionKind::NegativeBinomial
    } else {
        DistributionKind::Poisson
    }
}

pub fn sample_moments(counts: &[u64]) -> Option<(f64, f64)> {
    if counts.is_empty() {
        return None;
    }
    let n = counts.len() as f64;
    let mean = counts.iter().map(|c| *c as f64).sum::<f64>() / n;
    if counts.len() < 2 {
        return Some((mean, 0.0));
    }
    let ss: f64 = counts
        .iter()
        .map(|c| {
            let d = *c as f64 - mean;
            d * d
        })
        .sum();
    Some((mean, ss / (n - 1.0)))
}

/// Fits Poisson or Negative Binomial (method of moments) to a historical count series.
///
/// Returns `None` only for an empty series; every non-empty series yields a model.
pub fn fit(historical: &[u64]) -> Option<FittedModel> {
    let (mean, variance) = sample_moments(historical)?;
    let distribution = match select_kind(mean, variance) {
        DistributionKind::NegativeBinomial => {
            let p = (mean / variance).clamp(RATE_FLOOR, 1.0 - RATE_FLOOR);
            let r = (mean * mean / (variance - mean)).max(RATE_FLOOR);
            FittedDistribution::NegativeBinomial { r, p }
        }
        DistributionKind::Poisson => FittedDistribution::Poisson {
            lambda: mean.max(RATE_FLOOR),
        },
    };
    Some(FittedModel {
        distribution,
        historical_mean: mean,
        historical_variance: variance,
    })
}

/// Upper tail `P(X >= observed)` under the fitted model. One-sided: a count of zero is
/// never surprising, so `observed == 0` returns 1.
pub fn survival_probability(model: &FittedModel, observed: u64) -> f64 {
    if observed == 0 {
        return 1.0;
    }
    let k = observed as f64;
    let p = match model.distribution {
        // P(X >= k) = P(k, lambda), the regularized lower incomplete gamma.
        FittedDistribution::Poisson { lambda } => gamma::checked_gamma_lr(k, lambda).ok(),
        // P(X >= k) = I_{1-p}(k, r).
        FittedDistribution::NegativeBinomial { r, p } => {
            beta::checked_beta_reg(k, r, 1.0 - p).ok()
        }
    };
    match p {
        Some(value) if value.is_finite() => value.clamp(0.0, 1.0),
        _ => 1.0,
    }
}

pub fn z_score(model: &FittedModel, observed: u64) -> f64 {
    (observed as f64 - model.mean()) / model.std_dev()
}
