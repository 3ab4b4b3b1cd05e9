//! Policy reward: how much confirming an hour shrinks the uncertainty of the
//! day-level risk logit. Pure arithmetic over posteriors; no tensors.

use crate::aggregate::{LogisticLink, fuse};
use crate::config::FusionRule;
use crate::posterior::HourlyPosterior;

/// Var(w · z̄) of the fused day-level latent.
pub fn risk_logit_variance(posteriors: &[HourlyPosterior], link: &LogisticLink, rule: FusionRule) -> f64 {
    let fused = fuse(posteriors, rule);
    link.logit_variance(&fused.var)
}

/// Realized reward of one query: variance before minus variance after.
/// Negative when the query made the model less certain.
pub fn uncertainty_reduction(before: f64, after: f64) -> f64 {
    let r = before - after;
    if r.is_finite() { r } else { 0.0 }
}

/// G_t = r_t + γ·G_{t+1}
pub fn discounted_returns(rewards: &[f64], gamma: f64) -> Vec<f64> {
    let mut out = vec![0.0; rewards.len()];
    let mut running = 0.0;
    for (i, r) in rewards.iter().enumerate().rev() {
        running = r + gamma * running;
        out[i] = running;
    }
    out
}

/// Exponential moving average of episode returns, subtracted from returns
/// to reduce REINFORCE variance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RewardBaseline {
    value: f64,
    decay: f64,
    initialized: bool,
}

impl RewardBaseline {
    pub fn new(decay: f64) -> Self {
        Self {
            value: 0.0,
            decay: decay.clamp(0.0, 1.0),
            initialized: false,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Advantages for `returns` against the current baseline, then fold the
    /// mean return into the baseline.
    pub fn advantages(&mut self, returns: &[f64]) -> Vec<f64> {
        if returns.is_empty() {
            return Vec::new();
        }
        let baseline = self.value;
        let adv = returns.iter().map(|g| g - baseline).collect();
        let mean = crate::math::mean(returns);
        if self.initialized {
            self.value = self.decay * self.value + (1.0 - self.decay) * mean;
        } else {
            self.value = mean;
            self.initialized = true;
        }
        adv
    }
}
