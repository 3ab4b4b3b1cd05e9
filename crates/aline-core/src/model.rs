use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::aggregate::LogisticLink;
use crate::config::ModelConfig;
use crate::constants::{HOURS_PER_DAY, MEAN_LIMIT};
use crate::encoder::ContextEncoder;
use crate::error::{Result, ValidationError};
use crate::features::{FeatureSequence, FeatureStats, ObservationMask};
use crate::nn::lookup;
use crate::params::ModelParams;
use crate::policy::PolicyHead;
use crate::posterior::{HourlyPosterior, PosteriorHead, read_posteriors};

/// Raw tensors of one forward pass, all with 24 rows.
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    pub hidden: Tensor,
    pub mean: Tensor,
    pub log_std: Tensor,
    pub policy_logits: Tensor,
}

/// Clamped, host-side results of one forward pass.
#[derive(Clone, Debug)]
pub struct DayInference {
    pub posteriors: Vec<HourlyPosterior>,
    pub policy_logits: Vec<f64>,
}

/// Encoder plus posterior and policy heads, sharing one set of hidden states.
#[derive(Clone, Debug)]
pub struct AlineModel {
    config: ModelConfig,
    encoder: ContextEncoder,
    posterior: PosteriorHead,
    policy: PolicyHead,
    link: LogisticLink,
    link_weight: Tensor,
    link_bias: Tensor,
}

impl AlineModel {
    pub fn from_params(params: &ModelParams) -> Result<Self> {
        Self::from_tensors(params.config(), params.tensors())
    }

    /// Build over an arbitrary tensor map, e.g. one bound to training `Var`s.
    pub fn from_tensors(config: &ModelConfig, tensors: &BTreeMap<String, Tensor>) -> Result<Self> {
        let link_weight = lookup(tensors, "link.weight")?;
        let link_bias = lookup(tensors, "link.bias")?;
        let link = LogisticLink::new(
            link_weight
                .to_vec1::<f32>()?
                .into_iter()
                .map(f64::from)
                .collect(),
            link_bias.to_vec1::<f32>()?.first().copied().map(f64::from).unwrap_or(0.0),
        );
        Ok(Self {
            config: config.clone(),
            encoder: ContextEncoder::load(tensors, config)?,
            posterior: PosteriorHead::load(tensors, config.latent_dim)?,
            policy: PolicyHead::load(tensors)?,
            link,
            link_weight,
            link_bias,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn link(&self) -> &LogisticLink {
        &self.link
    }

    pub fn link_tensors(&self) -> (&Tensor, &Tensor) {
        (&self.link_weight, &self.link_bias)
    }

    /// Normalized `[24, F]` input tensor.
    pub fn input_tensor(&self, seq: &FeatureSequence, stats: Option<&FeatureStats>) -> Result<Tensor> {
        if seq.width() != self.config.n_features {
            return Err(ValidationError::ChannelWidth {
                hour: 0,
                expected: self.config.n_features,
                got: seq.width(),
            }
            .into());
        }
        let stats = stats.filter(|s| s.width() == seq.width());
        let data = seq.normalized(stats);
        Ok(Tensor::from_vec(data, (HOURS_PER_DAY, seq.width()), &Device::Cpu)?)
    }

    pub fn forward(&self, x: &Tensor, mask: &ObservationMask) -> Result<ForwardOutput> {
        let hidden = self.encoder.forward(x, mask)?;
        let (mean, log_std) = self.posterior.forward(&hidden)?;
        let policy_logits = self.policy.forward(&hidden, &log_std)?;
        Ok(ForwardOutput {
            hidden,
            mean,
            log_std,
            policy_logits,
        })
    }

    /// One forward pass, read back with inference-time clamps applied.
    pub fn infer(
        &self,
        seq: &FeatureSequence,
        mask: &ObservationMask,
        stats: Option<&FeatureStats>,
    ) -> Result<DayInference> {
        let x = self.input_tensor(seq, stats)?;
        self.infer_tensor(&x, mask)
    }

    /// Like [`AlineModel::infer`] for an already normalized `[24, F]` input.
    pub fn infer_tensor(&self, x: &Tensor, mask: &ObservationMask) -> Result<DayInference> {
        let out = self.forward(x, mask)?;
        let posteriors = read_posteriors(&out.mean, &out.log_std)?;
        let limit = MEAN_LIMIT as f64;
        let policy_logits = out
            .policy_logits
            .to_vec1::<f32>()?
            .into_iter()
            .map(|g| {
                let g = f64::from(g);
                if g.is_nan() { 0.0 } else { g.clamp(-limit, limit) }
            })
            .collect();
        Ok(DayInference {
            posteriors,
            policy_logits,
        })
    }
}
