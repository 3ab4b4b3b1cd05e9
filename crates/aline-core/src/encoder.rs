use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::config::ModelConfig;
use crate::constants::HOURS_PER_DAY;
use crate::error::Result;
use crate::features::ObservationMask;
use crate::nn::{Linear, TransformerBlock, lookup};

/// Self-attention encoder over the 24 hourly rows.
///
/// h₀ = x·W_in + b + hour_emb[h] + (confirmed ? emb_confirmed : emb_unconfirmed)
/// then `n_layers` pre-norm transformer blocks. All hours attend to all hours.
#[derive(Clone, Debug)]
pub struct ContextEncoder {
    input: Linear,
    hour: Tensor,
    confirmed: Tensor,
    unconfirmed: Tensor,
    blocks: Vec<TransformerBlock>,
}

impl ContextEncoder {
    pub fn load(tensors: &BTreeMap<String, Tensor>, config: &ModelConfig) -> Result<Self> {
        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlock::load(tensors, &format!("layers.{i}"), config.n_heads))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input: Linear::load(tensors, "input")?,
            hour: lookup(tensors, "embed.hour")?,
            confirmed: lookup(tensors, "embed.confirmed")?.unsqueeze(0)?,
            unconfirmed: lookup(tensors, "embed.unconfirmed")?.unsqueeze(0)?,
            blocks,
        })
    }

    /// `x` is `[24, F]`; returns `[24, d_model]`.
    pub fn forward(&self, x: &Tensor, mask: &ObservationMask) -> Result<Tensor> {
        let flags = Tensor::from_vec(mask.as_f32().to_vec(), (HOURS_PER_DAY, 1), &Device::Cpu)?;
        let inverse = flags.affine(-1.0, 1.0)?;
        let context = (flags.broadcast_mul(&self.confirmed)?
            + inverse.broadcast_mul(&self.unconfirmed)?)?;

        let mut h = self
            .input
            .forward(x)?
            .add(&self.hour)?
            .add(&context)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}
