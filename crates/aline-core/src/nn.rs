//! Tensor building blocks for the context encoder: dense layers, LayerNorm,
//! multi-head self-attention and the feed-forward sublayer.
//!
//! Every block is built from a named-tensor map so the same code serves
//! inference (plain tensors) and training (tensors backed by `Var`s).
//! Weights are stored `[in, out]` and applied as `x · W + b`.

use std::collections::BTreeMap;

use candle_core::{D, Tensor};

use crate::error::{AlineError, Result};

pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Fetch a tensor by name, failing with a parameter error when absent.
pub fn lookup(tensors: &BTreeMap<String, Tensor>, name: &str) -> Result<Tensor> {
    tensors
        .get(name)
        .cloned()
        .ok_or_else(|| AlineError::Params(format!("missing tensor {name}")))
}

#[derive(Clone, Debug)]
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Tensor) -> Self {
        Self { weight, bias }
    }

    /// Loads `{prefix}.weight` and `{prefix}.bias`.
    pub fn load(tensors: &BTreeMap<String, Tensor>, prefix: &str) -> Result<Self> {
        Ok(Self::new(
            lookup(tensors, &format!("{prefix}.weight"))?,
            lookup(tensors, &format!("{prefix}.bias"))?,
        ))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// (x - mean) / sqrt(var + eps) * weight + bias over the last dimension.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    pub fn load(tensors: &BTreeMap<String, Tensor>, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: lookup(tensors, &format!("{prefix}.weight"))?,
            bias: lookup(tensors, &format!("{prefix}.bias"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = var.affine(1.0, LAYER_NORM_EPS)?.sqrt()?;
        Ok(centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

/// Full (non-causal) multi-head self-attention over a `[seq, d_model]` input.
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    n_heads: usize,
}

impl MultiHeadAttention {
    pub fn load(tensors: &BTreeMap<String, Tensor>, prefix: &str, n_heads: usize) -> Result<Self> {
        Ok(Self {
            q: Linear::load(tensors, &format!("{prefix}.q"))?,
            k: Linear::load(tensors, &format!("{prefix}.k"))?,
            v: Linear::load(tensors, &format!("{prefix}.v"))?,
            o: Linear::load(tensors, &format!("{prefix}.o"))?,
            n_heads,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (seq, d_model) = x.dims2()?;
        let head_dim = d_model / self.n_heads;

        // [seq, d] -> [heads, seq, head_dim]
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((seq, self.n_heads, head_dim))?
                .transpose(0, 1)?
                .contiguous()?)
        };
        let q = split(self.q.forward(x)?)?;
        let k = split(self.k.forward(x)?)?;
        let v = split(self.v.forward(x)?)?;

        let k_t = k.transpose(1, 2)?.contiguous()?;
        let scores = q.matmul(&k_t)?.affine(1.0 / (head_dim as f64).sqrt(), 0.0)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs
            .matmul(&v)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq, d_model))?;
        self.o.forward(&context)
    }
}

/// Position-wise ReLU feed-forward: up-projection then down-projection.
#[derive(Clone, Debug)]
pub struct FeedForward {
    up: Linear,
    down: Linear,
}

impl FeedForward {
    pub fn load(tensors: &BTreeMap<String, Tensor>, prefix: &str) -> Result<Self> {
        Ok(Self {
            up: Linear::load(tensors, &format!("{prefix}.up"))?,
            down: Linear::load(tensors, &format!("{prefix}.down"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.down.forward(&self.up.forward(x)?.relu()?)
    }
}

/// Pre-norm transformer block: x + attn(LN(x)), then x + ffn(LN(x)).
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    norm1: LayerNorm,
    attn: MultiHeadAttention,
    norm2: LayerNorm,
    ffn: FeedForward,
}

impl TransformerBlock {
    pub fn load(tensors: &BTreeMap<String, Tensor>, prefix: &str, n_heads: usize) -> Result<Self> {
        Ok(Self {
            norm1: LayerNorm::load(tensors, &format!("{prefix}.norm1"))?,
            attn: MultiHeadAttention::load(tensors, &format!("{prefix}.attn"), n_heads)?,
            norm2: LayerNorm::load(tensors, &format!("{prefix}.norm2"))?,
            ffn: FeedForward::load(tensors, &format!("{prefix}.ffn"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.norm1.forward(x)?)?)?;
        let out = (&x + self.ffn.forward(&self.norm2.forward(&x)?)?)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(data: Vec<f32>, shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_linear_applies_weight_then_bias() {
        let lin = Linear::new(
            tensor(vec![1.0, 0.0, 0.0, 2.0], (2, 2)),
            Tensor::new(&[0.5f32, -0.5], &Device::Cpu).unwrap(),
        );
        let out = lin.forward(&tensor(vec![1.0, 1.0], (1, 2))).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.5, 1.5]]);
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let mut map = BTreeMap::new();
        map.insert("ln.weight".to_string(), Tensor::ones(4, candle_core::DType::F32, &Device::Cpu).unwrap());
        map.insert("ln.bias".to_string(), Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap());
        let ln = LayerNorm::load(&map, "ln").unwrap();
        let out = ln
            .forward(&tensor(vec![1.0, 2.0, 3.0, 4.0], (1, 4)))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let mean: f32 = out[0].iter().sum::<f32>() / 4.0;
        let var: f32 = out[0].iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_tensor_is_param_error() {
        let map = BTreeMap::new();
        let err = Linear::load(&map, "input").unwrap_err();
        assert!(matches!(err, AlineError::Params(_)));
    }
}
