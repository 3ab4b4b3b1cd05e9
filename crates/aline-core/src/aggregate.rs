//! Day-level risk: fuse the 24 hourly posteriors into one Gaussian over the
//! latent state, push it through the logistic link, and bracket the point
//! estimate with a Monte Carlo interval.

use candle_core::{D, Tensor};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::config::{FusionRule, InferenceConfig};
use crate::constants::HOURS_PER_DAY;
use crate::error::Result;
use crate::math::{dot, quantile_sorted, sigmoid, standard_normal};
use crate::posterior::HourlyPosterior;

/// risk = sigmoid(w · z + b)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogisticLink {
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticLink {
    pub fn new(weights: Vec<f64>, bias: f64) -> Self {
        Self { weights, bias }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn logit(&self, z: &[f64]) -> f64 {
        dot(&self.weights, z) + self.bias
    }

    pub fn probability(&self, z: &[f64]) -> f64 {
        sigmoid(self.logit(z))
    }

    /// ‖w‖₂, the largest possible logit change per unit latent shift.
    pub fn norm(&self) -> f64 {
        self.weights.iter().map(|w| w * w).sum::<f64>().sqrt()
    }

    /// Var(w · z) for independent latent axes with the given variances.
    pub fn logit_variance(&self, var: &[f64]) -> f64 {
        self.weights.iter().zip(var).map(|(w, v)| w * w * v).sum()
    }
}

/// Fused diagonal Gaussian over the day's latent state.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedGaussian {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
}

impl FusedGaussian {
    pub fn is_degenerate(&self) -> bool {
        self.var.iter().all(|v| *v <= 0.0)
    }
}

/// Combine hourly posteriors into one day-level Gaussian.
///
/// Precision weighting: per axis, z̄ = Σ μ/σ² ÷ Σ 1/σ², fused variance
/// 1/Σ 1/σ². Hours with zero variance are exact observations; when any exist
/// on an axis they alone define that axis (their plain mean, variance 0).
pub fn fuse(posteriors: &[HourlyPosterior], rule: FusionRule) -> FusedGaussian {
    let dim = posteriors.first().map(|p| p.mean.len()).unwrap_or(0);
    match rule {
        FusionRule::LastHour => match posteriors.last() {
            Some(last) => FusedGaussian {
                mean: last.mean.clone(),
                var: last.variance().collect(),
            },
            None => FusedGaussian {
                mean: vec![0.0; dim],
                var: vec![0.0; dim],
            },
        },
        FusionRule::PrecisionWeighted => {
            let mut mean = vec![0.0; dim];
            let mut var = vec![0.0; dim];
            for a in 0..dim {
                let exact: Vec<f64> = posteriors
                    .iter()
                    .filter(|p| p.std[a] <= 0.0)
                    .map(|p| p.mean[a])
                    .collect();
                if !exact.is_empty() {
                    mean[a] = crate::math::mean(&exact);
                    var[a] = 0.0;
                    continue;
                }
                let mut precision = 0.0;
                let mut weighted = 0.0;
                for p in posteriors {
                    let prec = 1.0 / (p.std[a] * p.std[a]);
                    precision += prec;
                    weighted += prec * p.mean[a];
                }
                if precision > 0.0 && precision.is_finite() {
                    mean[a] = weighted / precision;
                    var[a] = 1.0 / precision;
                }
            }
            FusedGaussian { mean, var }
        }
    }
}

/// Point estimate with its Monte Carlo interval; lower ≤ mean ≤ upper, all in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyRiskEstimate {
    pub mean_probability: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Clone, Debug)]
pub struct RiskAggregator {
    config: InferenceConfig,
}

impl RiskAggregator {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn aggregate(&self, posteriors: &[HourlyPosterior], link: &LogisticLink) -> DailyRiskEstimate {
        let fused = fuse(posteriors, self.config.fusion);
        self.estimate(&fused, link)
    }

    pub fn estimate(&self, fused: &FusedGaussian, link: &LogisticLink) -> DailyRiskEstimate {
        let p = link.probability(&fused.mean).clamp(0.0, 1.0);
        if fused.is_degenerate() || self.config.mc_samples == 0 {
            return DailyRiskEstimate {
                mean_probability: p,
                lower_bound: p,
                upper_bound: p,
            };
        }

        let mut rng = SmallRng::seed_from_u64(self.config.seed);
        let std: Vec<f64> = fused.var.iter().map(|v| v.max(0.0).sqrt()).collect();
        let mut z = vec![0.0; fused.mean.len()];
        let mut samples: Vec<f64> = (0..self.config.mc_samples)
            .map(|_| {
                for (a, slot) in z.iter_mut().enumerate() {
                    *slot = fused.mean[a] + std[a] * standard_normal(&mut rng);
                }
                link.probability(&z)
            })
            .collect();
        samples.sort_by(f64::total_cmp);

        let lower = quantile_sorted(&samples, self.config.lower_quantile);
        let upper = quantile_sorted(&samples, self.config.upper_quantile);
        DailyRiskEstimate {
            mean_probability: p,
            lower_bound: lower.min(p).clamp(0.0, 1.0),
            upper_bound: upper.max(p).clamp(0.0, 1.0),
        }
    }
}

/// Differentiable risk logit for training: the same fusion rules on `[24, D]`
/// mean/log-std tensors. Returns a scalar tensor.
pub fn fused_logit(
    mean: &Tensor,
    log_std: &Tensor,
    rule: FusionRule,
    link_weight: &Tensor,
    link_bias: &Tensor,
) -> Result<Tensor> {
    let z = match rule {
        FusionRule::LastHour => mean.narrow(0, HOURS_PER_DAY - 1, 1)?.squeeze(0)?,
        FusionRule::PrecisionWeighted => {
            let precision = log_std.affine(-2.0, 0.0)?.exp()?;
            let total = precision.sum(0)?;
            (mean * &precision)?.sum(0)?.broadcast_div(&total)?
        }
    };
    let logit = (z * link_weight)?.sum_keepdim(D::Minus1)?;
    Ok(logit.add(link_bias)?.squeeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn link() -> LogisticLink {
        LogisticLink::new(vec![0.5, 0.4, 0.45, 0.35], -1.8)
    }

    fn day(mean: f64, std: f64) -> Vec<HourlyPosterior> {
        (0..24)
            .map(|hour| HourlyPosterior {
                hour,
                mean: vec![mean; 4],
                std: vec![std; 4],
            })
            .collect()
    }

    #[test]
    fn test_precision_weighting_favors_confident_hours() {
        let mut posts = day(0.0, 1.0);
        posts[5].mean = vec![2.0; 4];
        posts[5].std = vec![0.1; 4];
        let fused = fuse(&posts, FusionRule::PrecisionWeighted);
        // 100 precision at 2.0 vs 23 at 0.0
        assert_abs_diff_eq!(fused.mean[0], 200.0 / 123.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fused.var[0], 1.0 / 123.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_variance_hours_dominate() {
        let mut posts = day(0.0, 1.0);
        posts[3].mean = vec![1.0; 4];
        posts[3].std = vec![0.0; 4];
        posts[9].mean = vec![3.0; 4];
        posts[9].std = vec![0.0; 4];
        let fused = fuse(&posts, FusionRule::PrecisionWeighted);
        assert_abs_diff_eq!(fused.mean[2], 2.0);
        assert_eq!(fused.var[2], 0.0);
    }

    #[test]
    fn test_all_zero_variance_collapses_interval() {
        let agg = RiskAggregator::new(InferenceConfig::default());
        let est = agg.aggregate(&day(0.5, 0.0), &link());
        assert_eq!(est.lower_bound, est.mean_probability);
        assert_eq!(est.upper_bound, est.mean_probability);
    }

    #[test]
    fn test_last_hour_rule_reads_hour_23() {
        let mut posts = day(0.0, 1.0);
        posts[23].mean = vec![1.0; 4];
        let fused = fuse(&posts, FusionRule::LastHour);
        assert_eq!(fused.mean, vec![1.0; 4]);
        assert_eq!(fused.var, vec![1.0; 4]);
    }

    #[test]
    fn test_interval_brackets_mean() {
        let agg = RiskAggregator::new(InferenceConfig::default());
        for (m, s) in [(0.0, 1.0), (3.0, 2.0), (-4.0, 5.0), (10.0, 20.0)] {
            let est = agg.aggregate(&day(m, s), &link());
            assert!(0.0 <= est.lower_bound);
            assert!(est.lower_bound <= est.mean_probability);
            assert!(est.mean_probability <= est.upper_bound);
            assert!(est.upper_bound <= 1.0);
        }
    }

    #[test]
    fn test_seeded_interval_is_reproducible() {
        let agg = RiskAggregator::new(InferenceConfig::default());
        let a = agg.aggregate(&day(0.2, 1.5), &link());
        let b = agg.aggregate(&day(0.2, 1.5), &link());
        assert_eq!(a, b);
    }

    #[test]
    fn test_wider_posterior_wider_interval() {
        let agg = RiskAggregator::new(InferenceConfig {
            fusion: FusionRule::LastHour,
            ..InferenceConfig::default()
        });
        let narrow = agg.aggregate(&day(0.0, 0.2), &link());
        let wide = agg.aggregate(&day(0.0, 2.0), &link());
        assert!(wide.upper_bound - wide.lower_bound > narrow.upper_bound - narrow.lower_bound);
    }

    #[test]
    fn test_logit_variance() {
        assert_abs_diff_eq!(
            link().logit_variance(&[1.0, 1.0, 1.0, 1.0]),
            0.25 + 0.16 + 0.2025 + 0.1225,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_tensor_fusion_matches_scalar_fusion() {
        let mut posts = day(0.3, 1.0);
        posts[7].mean = vec![1.2; 4];
        posts[7].std = vec![0.5; 4];
        let fused = fuse(&posts, FusionRule::PrecisionWeighted);
        let expected = link().logit(&fused.mean);

        let means: Vec<f32> = posts.iter().flat_map(|p| p.mean.iter().map(|&v| v as f32)).collect();
        let log_stds: Vec<f32> = posts
            .iter()
            .flat_map(|p| p.std.iter().map(|&v| v.ln() as f32))
            .collect();
        let dev = Device::Cpu;
        let mean = Tensor::from_vec(means, (24, 4), &dev).unwrap();
        let log_std = Tensor::from_vec(log_stds, (24, 4), &dev).unwrap();
        let w = Tensor::new(&[0.5f32, 0.4, 0.45, 0.35], &dev).unwrap();
        let b = Tensor::new(&[-1.8f32], &dev).unwrap();
        let got = fused_logit(&mean, &log_std, FusionRule::PrecisionWeighted, &w, &b)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_abs_diff_eq!(got as f64, expected, epsilon = 1e-4);
    }
}
