//! Offline evaluation: day-level prediction quality, and the learned query
//! policy against a random policy and a fixed schedule.

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::aggregate::RiskAggregator;
use crate::config::InferenceConfig;
use crate::constants::HOURS_PER_DAY;
use crate::error::Result;
use crate::features::ObservationMask;
use crate::metrics::PredictionMetrics;
use crate::model::{AlineModel, DayInference};
use crate::policy::{fixed_hours, random_hours, score_hours, select_top_k};
use crate::prior::Episode;
use crate::reward::{risk_logit_variance, uncertainty_reduction};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    /// Mean posterior std at the selected hours, before confirming them.
    pub mean_uncertainty: f64,
    /// Mean drop in risk-logit variance after confirming the selected hours.
    pub mean_reward: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyComparison {
    pub k: usize,
    pub aline: PolicyStats,
    pub random: PolicyStats,
    pub fixed: PolicyStats,
    /// (aline − baseline) / baseline × 100 on mean uncertainty.
    pub improvement_vs_random_pct: f64,
    pub improvement_vs_fixed_pct: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub prediction: PredictionMetrics,
    pub policy: PolicyComparison,
}

pub struct Evaluator<'a> {
    model: &'a AlineModel,
    aggregator: RiskAggregator,
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a AlineModel, config: InferenceConfig) -> Self {
        Self {
            model,
            aggregator: RiskAggregator::new(config),
        }
    }

    fn infer(&self, episode: &Episode, mask: &ObservationMask) -> Result<DayInference> {
        let x = Tensor::from_vec(
            episode.input(mask),
            (HOURS_PER_DAY, episode.width),
            &Device::Cpu,
        )?;
        self.model.infer_tensor(&x, mask)
    }

    /// Day-level metrics with no context hours, as the service predicts.
    pub fn prediction(&self, episodes: &[Episode]) -> Result<PredictionMetrics> {
        let mask = ObservationMask::empty();
        let mut probs = Vec::with_capacity(episodes.len());
        let mut labels = Vec::with_capacity(episodes.len());
        for episode in episodes {
            let inf = self.infer(episode, &mask)?;
            let est = self.aggregator.aggregate(&inf.posteriors, self.model.link());
            probs.push(est.mean_probability);
            labels.push(episode.positive());
        }
        Ok(PredictionMetrics::compute(&probs, &labels))
    }

    /// Compare the learned policy with seeded random picks and the fixed
    /// schedule, each choosing `k` hours from an empty context.
    pub fn policy(&self, episodes: &[Episode], k: usize, seed: u64) -> Result<PolicyComparison> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mask = ObservationMask::empty();
        let config = self.aggregator.config();
        let link = self.model.link();

        let mut sums = [PolicyStats::default(); 3];
        let mut counts = [0usize; 3];
        for episode in episodes {
            let inf = self.infer(episode, &mask)?;
            let before = risk_logit_variance(&inf.posteriors, link, config.fusion);
            let scores = score_hours(&inf.posteriors, &inf.policy_logits, link, &config.policy);
            let picks = [
                select_top_k(&scores, &mask, k as i64)?.hours(),
                random_hours(&mask, k, &mut rng),
                fixed_hours(&mask, k),
            ];
            for (slot, hours) in picks.iter().enumerate() {
                if hours.is_empty() {
                    continue;
                }
                let uncertainty =
                    hours.iter().map(|&h| inf.posteriors[h].mean_std()).sum::<f64>() / hours.len() as f64;
                let confirmed = hours.iter().fold(mask, |m, &h| m.with_observed(h));
                let after_inf = self.infer(episode, &confirmed)?;
                let after = risk_logit_variance(&after_inf.posteriors, link, config.fusion);
                sums[slot].mean_uncertainty += uncertainty;
                sums[slot].mean_reward += uncertainty_reduction(before, after);
                counts[slot] += 1;
            }
        }

        let [aline, random, fixed] = [0, 1, 2].map(|i| {
            let n = counts[i].max(1) as f64;
            PolicyStats {
                mean_uncertainty: sums[i].mean_uncertainty / n,
                mean_reward: sums[i].mean_reward / n,
            }
        });
        Ok(PolicyComparison {
            k,
            improvement_vs_random_pct: relative_improvement(aline.mean_uncertainty, random.mean_uncertainty),
            improvement_vs_fixed_pct: relative_improvement(aline.mean_uncertainty, fixed.mean_uncertainty),
            aline,
            random,
            fixed,
        })
    }

    pub fn report(&self, episodes: &[Episode], k: usize, seed: u64) -> Result<EvaluationReport> {
        Ok(EvaluationReport {
            prediction: self.prediction(episodes)?,
            policy: self.policy(episodes, k, seed)?,
        })
    }
}

/// Percent by which `ours` exceeds `baseline`; 0 for a zero baseline.
pub fn relative_improvement(ours: f64, baseline: f64) -> f64 {
    if baseline.abs() < f64::EPSILON {
        0.0
    } else {
        (ours - baseline) / baseline * 100.0
    }
}
