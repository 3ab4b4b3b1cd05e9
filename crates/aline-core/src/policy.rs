//! Active query policy: per-hour priority scores and top-k selection over the
//! hours that are not yet confirmed.

use std::collections::BTreeMap;

use candle_core::{D, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::aggregate::LogisticLink;
use crate::config::PolicyWeights;
use crate::constants::{FIXED_SCHEDULE, MEAN_LIMIT};
use crate::error::{Result, ValidationError};
use crate::features::ObservationMask;
use crate::math::{binary_entropy, softplus};
use crate::nn::Linear;
use crate::posterior::HourlyPosterior;

/// Learned scorer g_h over [hidden_h, log_std_h]. Returns `[24]` logits.
#[derive(Clone, Debug)]
pub struct PolicyHead {
    linear: Linear,
}

impl PolicyHead {
    pub fn load(tensors: &BTreeMap<String, Tensor>) -> Result<Self> {
        Ok(Self {
            linear: Linear::load(tensors, "policy")?,
        })
    }

    pub fn forward(&self, hidden: &Tensor, log_std: &Tensor) -> Result<Tensor> {
        let joined = Tensor::cat(&[hidden, log_std], D::Minus1)?;
        Ok(self.linear.forward(&joined)?.squeeze(D::Minus1)?)
    }
}

/// score = λ₁·H(p) + λ₂·mean σ + λ₃·‖w‖·p(1−p) + λ₄·softplus(g)
///
/// p is the single-hour risk under the posterior mean. Each term is
/// non-negative; a non-finite result scores 0.
pub fn priority_score(
    posterior: &HourlyPosterior,
    learned: f64,
    link: &LogisticLink,
    weights: &PolicyWeights,
) -> f64 {
    let p = link.probability(&posterior.mean);
    let g = learned.clamp(-(MEAN_LIMIT as f64), MEAN_LIMIT as f64);
    let score = weights.entropy * binary_entropy(p)
        + weights.uncertainty * posterior.mean_std()
        + weights.sensitivity * link.norm() * p * (1.0 - p)
        + weights.learned * softplus(g);
    if score.is_finite() { score.max(0.0) } else { 0.0 }
}

/// Scores for every hour, in hour order.
pub fn score_hours(
    posteriors: &[HourlyPosterior],
    learned: &[f64],
    link: &LogisticLink,
    weights: &PolicyWeights,
) -> Vec<f64> {
    posteriors
        .iter()
        .map(|p| {
            let g = learned.get(p.hour).copied().unwrap_or(0.0);
            priority_score(p, g, link, weights)
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredHour {
    pub hour: usize,
    pub priority_score: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyRecommendation {
    pub selected: Vec<ScoredHour>,
    pub requested_k: usize,
    /// Unconfirmed hours that were eligible; `selected.len() == min(k, available)`.
    pub available: usize,
}

impl PolicyRecommendation {
    pub fn hours(&self) -> Vec<usize> {
        self.selected.iter().map(|s| s.hour).collect()
    }
}

/// Validate a caller-supplied k.
pub fn check_k(k: i64) -> std::result::Result<usize, ValidationError> {
    if k <= 0 {
        return Err(ValidationError::InvalidK { k });
    }
    Ok(k as usize)
}

/// Rank unconfirmed hours by score (descending, ties to the earlier hour) and
/// keep the first k.
pub fn select_top_k(
    scores: &[f64],
    mask: &ObservationMask,
    k: i64,
) -> std::result::Result<PolicyRecommendation, ValidationError> {
    let k = check_k(k)?;
    let mut candidates: Vec<ScoredHour> = mask
        .query_hours()
        .into_iter()
        .filter_map(|hour| {
            scores.get(hour).map(|&s| ScoredHour {
                hour,
                priority_score: if s.is_finite() { s.max(0.0) } else { 0.0 },
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.priority_score
            .total_cmp(&a.priority_score)
            .then(a.hour.cmp(&b.hour))
    });
    let available = candidates.len();
    candidates.truncate(k);
    Ok(PolicyRecommendation {
        selected: candidates,
        requested_k: k,
        available,
    })
}

/// Uniformly random unconfirmed hours.
pub fn random_hours(mask: &ObservationMask, k: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut hours = mask.query_hours();
    hours.shuffle(rng);
    hours.truncate(k);
    hours
}

/// The fixed 08:00 / 12:00 / 20:00 schedule, minus hours already confirmed.
pub fn fixed_hours(mask: &ObservationMask, k: usize) -> Vec<usize> {
    FIXED_SCHEDULE
        .iter()
        .copied()
        .filter(|&h| !mask.is_observed(h))
        .take(k)
        .collect()
}
