use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_FEATURES, DEFAULT_LATENT_DIM, DEFAULT_LINK_WEIGHTS, DEFAULT_MC_SAMPLES,
    LOWER_QUANTILE, UPPER_QUANTILE,
};
use crate::error::{AlineError, Result};

/// Architecture of the context encoder and its heads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub n_features: usize,
    pub latent_dim: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub ff_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_features: DEFAULT_FEATURES,
            latent_dim: DEFAULT_LATENT_DIM,
            d_model: 64,
            n_heads: 4,
            n_layers: 3,
            ff_dim: 256,
        }
    }
}

impl ModelConfig {
    /// Small architecture for tests and benches.
    pub fn tiny(n_features: usize) -> Self {
        Self {
            n_features,
            latent_dim: DEFAULT_LATENT_DIM,
            d_model: 16,
            n_heads: 2,
            n_layers: 1,
            ff_dim: 32,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_features == 0 {
            return Err(AlineError::Config("n_features must be positive".into()));
        }
        if self.latent_dim == 0 {
            return Err(AlineError::Config("latent_dim must be positive".into()));
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(AlineError::Config(format!(
                "d_model {} is not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        // Axis dims plus the confirmation indicator are reserved.
        if self.d_model < self.latent_dim + 2 {
            return Err(AlineError::Config(format!(
                "d_model {} leaves no free dimensions after {} reserved",
                self.d_model,
                self.latent_dim + 1
            )));
        }
        if self.ff_dim == 0 {
            return Err(AlineError::Config("ff_dim must be positive".into()));
        }
        Ok(())
    }
}

/// Default link weights for a latent of width `latent_dim`. The four-axis
/// defaults are cycled when the latent is wider.
pub fn default_link_weights(latent_dim: usize) -> Vec<f64> {
    (0..latent_dim)
        .map(|i| DEFAULT_LINK_WEIGHTS[i % DEFAULT_LINK_WEIGHTS.len()])
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionRule {
    /// Inverse-variance weighting of all 24 hourly posteriors.
    #[default]
    PrecisionWeighted,
    /// Use the hour-23 posterior alone.
    LastHour,
}

/// Mixing weights of the priority score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyWeights {
    pub entropy: f64,
    pub uncertainty: f64,
    pub sensitivity: f64,
    pub learned: f64,
}

impl Default for PolicyWeights {
    fn default() -> Self {
        Self {
            entropy: 1.0,
            uncertainty: 0.5,
            sensitivity: 0.3,
            learned: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub fusion: FusionRule,
    pub mc_samples: usize,
    pub seed: u64,
    pub lower_quantile: f64,
    pub upper_quantile: f64,
    pub policy: PolicyWeights,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            fusion: FusionRule::default(),
            mc_samples: DEFAULT_MC_SAMPLES,
            seed: 42,
            lower_quantile: LOWER_QUANTILE,
            upper_quantile: UPPER_QUANTILE,
            policy: PolicyWeights::default(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mc_samples == 0 {
            return Err(AlineError::Config("mc_samples must be positive".into()));
        }
        let ordered = 0.0 <= self.lower_quantile
            && self.lower_quantile <= self.upper_quantile
            && self.upper_quantile <= 1.0;
        if !ordered {
            return Err(AlineError::Config(format!(
                "quantiles must satisfy 0 <= lower <= upper <= 1, got {} and {}",
                self.lower_quantile, self.upper_quantile
            )));
        }
        let w = self.policy;
        if [w.entropy, w.uncertainty, w.sensitivity, w.learned]
            .iter()
            .any(|x| !x.is_finite() || *x < 0.0)
        {
            return Err(AlineError::Config(
                "policy weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}
