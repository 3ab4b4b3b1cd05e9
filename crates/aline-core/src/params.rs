//! Named parameter bundle and its prior-informed initialization.
//!
//! Hidden layout at initialization: dimensions `0..D` carry the latent axes
//! (read out directly by the posterior head), dimension `D` is the
//! confirmation indicator, the rest are free. Residual outputs start at zero,
//! so an untrained model is an exact per-hour linear map from the schema's
//! channel gains to latent means.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::aggregate::LogisticLink;
use crate::config::{ModelConfig, default_link_weights};
use crate::constants::{CONFIRMED_LOG_STD_DROP, DEFAULT_LINK_BIAS, HOURS_PER_DAY};
use crate::error::{AlineError, Result};
use crate::features::FeatureSchema;

const XAVIER_GAIN: f64 = 0.5;
const HOUR_EMBED_BASE: f64 = 10_000.0;

/// Tensors the trainer never updates.
pub const FROZEN_PREFIX: &str = "link.";

#[derive(Clone, Debug)]
pub struct ModelParams {
    config: ModelConfig,
    tensors: BTreeMap<String, Tensor>,
}

/// Every tensor name the model expects, with its shape.
pub fn expected_shapes(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let d = config.d_model;
    let f = config.n_features;
    let z = config.latent_dim;
    let mut shapes = vec![
        ("input.weight".to_string(), vec![f, d]),
        ("input.bias".to_string(), vec![d]),
        ("embed.hour".to_string(), vec![HOURS_PER_DAY, d]),
        ("embed.confirmed".to_string(), vec![d]),
        ("embed.unconfirmed".to_string(), vec![d]),
    ];
    for i in 0..config.n_layers {
        let p = format!("layers.{i}");
        for norm in ["norm1", "norm2"] {
            shapes.push((format!("{p}.{norm}.weight"), vec![d]));
            shapes.push((format!("{p}.{norm}.bias"), vec![d]));
        }
        for proj in ["q", "k", "v", "o"] {
            shapes.push((format!("{p}.attn.{proj}.weight"), vec![d, d]));
            shapes.push((format!("{p}.attn.{proj}.bias"), vec![d]));
        }
        shapes.push((format!("{p}.ffn.up.weight"), vec![d, config.ff_dim]));
        shapes.push((format!("{p}.ffn.up.bias"), vec![config.ff_dim]));
        shapes.push((format!("{p}.ffn.down.weight"), vec![config.ff_dim, d]));
        shapes.push((format!("{p}.ffn.down.bias"), vec![d]));
    }
    shapes.extend([
        ("posterior.weight".to_string(), vec![d, 2 * z]),
        ("posterior.bias".to_string(), vec![2 * z]),
        ("policy.weight".to_string(), vec![d + z, 1]),
        ("policy.bias".to_string(), vec![1]),
        ("link.weight".to_string(), vec![z]),
        ("link.bias".to_string(), vec![1]),
    ]);
    shapes
}

impl ModelParams {
    /// Wrap loaded tensors, checking that every expected tensor is present
    /// with the expected shape. Extra tensors are rejected too.
    pub fn from_tensors(config: ModelConfig, tensors: BTreeMap<String, Tensor>) -> Result<Self> {
        config.validate()?;
        let expected = expected_shapes(&config);
        for (name, shape) in &expected {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| AlineError::Params(format!("missing tensor {name}")))?;
            if tensor.dims() != shape.as_slice() {
                return Err(AlineError::Params(format!(
                    "tensor {name} has shape {:?}, expected {shape:?}",
                    tensor.dims()
                )));
            }
        }
        if tensors.len() != expected.len() {
            let unknown: Vec<&String> = tensors
                .keys()
                .filter(|k| !expected.iter().any(|(n, _)| n == *k))
                .collect();
            return Err(AlineError::Params(format!("unexpected tensors {unknown:?}")));
        }
        let tensors = tensors
            .into_iter()
            .map(|(k, t)| Ok((k, t.to_dtype(DType::F32)?)))
            .collect::<Result<_>>()?;
        Ok(Self { config, tensors })
    }

    /// Prior-informed initialization from a feature schema. Deterministic in `seed`.
    pub fn initialize(config: ModelConfig, schema: &FeatureSchema, seed: u64) -> Result<Self> {
        config.validate()?;
        if schema.len() != config.n_features {
            return Err(AlineError::Config(format!(
                "schema has {} channels but the model expects {}",
                schema.len(),
                config.n_features
            )));
        }
        let mut init = Initializer::new(seed);
        let d = config.d_model;
        let z = config.latent_dim;
        let f = config.n_features;
        let mut tensors = BTreeMap::new();

        // Input projection: axis columns from the schema, indicator column
        // empty, free columns random.
        let random = init.xavier(f, d);
        let mut input = vec![0f32; f * d];
        for (c, channel) in schema.channels.iter().enumerate() {
            if let Some(axis) = channel.axis.filter(|a| a.index() < z) {
                input[c * d + axis.index()] = channel.gain;
            }
            for j in (z + 1)..d {
                input[c * d + j] = random[c * d + j];
            }
        }
        tensors.insert("input.weight".into(), matrix(input, f, d)?);
        tensors.insert("input.bias".into(), zeros(&[d])?);
        tensors.insert("embed.hour".into(), matrix(hour_embedding(d, z), HOURS_PER_DAY, d)?);
        let mut confirmed = vec![0f32; d];
        confirmed[z] = 1.0;
        tensors.insert("embed.confirmed".into(), vector(confirmed)?);
        tensors.insert("embed.unconfirmed".into(), zeros(&[d])?);

        for i in 0..config.n_layers {
            let p = format!("layers.{i}");
            for norm in ["norm1", "norm2"] {
                tensors.insert(format!("{p}.{norm}.weight"), vector(vec![1.0; d])?);
                tensors.insert(format!("{p}.{norm}.bias"), zeros(&[d])?);
            }
            for proj in ["q", "k", "v"] {
                tensors.insert(format!("{p}.attn.{proj}.weight"), matrix(init.xavier(d, d), d, d)?);
                tensors.insert(format!("{p}.attn.{proj}.bias"), zeros(&[d])?);
            }
            tensors.insert(format!("{p}.attn.o.weight"), zeros(&[d, d])?);
            tensors.insert(format!("{p}.attn.o.bias"), zeros(&[d])?);
            let ff = config.ff_dim;
            tensors.insert(format!("{p}.ffn.up.weight"), matrix(init.xavier(d, ff), d, ff)?);
            tensors.insert(format!("{p}.ffn.up.bias"), zeros(&[ff])?);
            tensors.insert(format!("{p}.ffn.down.weight"), zeros(&[ff, d])?);
            tensors.insert(format!("{p}.ffn.down.bias"), zeros(&[d])?);
        }

        // Posterior head: means read the axis dims, log-std drops on the
        // confirmation indicator.
        let mut post = vec![0f32; d * 2 * z];
        for a in 0..z {
            post[a * 2 * z + a] = 1.0;
            post[z * 2 * z + z + a] = -CONFIRMED_LOG_STD_DROP;
        }
        tensors.insert("posterior.weight".into(), matrix(post, d, 2 * z)?);
        tensors.insert("posterior.bias".into(), zeros(&[2 * z])?);
        tensors.insert("policy.weight".into(), zeros(&[d + z, 1])?);
        tensors.insert("policy.bias".into(), zeros(&[1])?);

        let link = default_link_weights(z)
            .into_iter()
            .map(|w| w as f32)
            .collect();
        tensors.insert("link.weight".into(), vector(link)?);
        tensors.insert("link.bias".into(), vector(vec![DEFAULT_LINK_BIAS as f32])?);

        Self::from_tensors(config, tensors)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn link(&self) -> Result<LogisticLink> {
        let weights = self
            .tensors
            .get("link.weight")
            .ok_or_else(|| AlineError::Params("missing tensor link.weight".into()))?
            .to_vec1::<f32>()?;
        let bias = self
            .tensors
            .get("link.bias")
            .ok_or_else(|| AlineError::Params("missing tensor link.bias".into()))?
            .to_vec1::<f32>()?;
        Ok(LogisticLink::new(
            weights.into_iter().map(f64::from).collect(),
            bias.first().copied().map(f64::from).unwrap_or(DEFAULT_LINK_BIAS),
        ))
    }

    pub fn num_params(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }

    /// Fresh `Var`s for every trainable tensor.
    pub fn trainable_vars(&self) -> Result<BTreeMap<String, Var>> {
        self.tensors
            .iter()
            .filter(|(name, _)| !name.starts_with(FROZEN_PREFIX))
            .map(|(name, t)| Ok((name.clone(), Var::from_tensor(t)?)))
            .collect()
    }

    /// Tensor map where trainable entries come from `vars` (so gradients flow
    /// back to them) and frozen entries from this bundle.
    pub fn bind(&self, vars: &BTreeMap<String, Var>) -> BTreeMap<String, Tensor> {
        self.tensors
            .iter()
            .map(|(name, t)| {
                let bound = vars
                    .get(name)
                    .map(|v| v.as_tensor().clone())
                    .unwrap_or_else(|| t.clone());
                (name.clone(), bound)
            })
            .collect()
    }

    /// Detached copy of the current `Var` values.
    pub fn snapshot(&self, vars: &BTreeMap<String, Var>) -> Result<Self> {
        let mut tensors = self.tensors.clone();
        for (name, var) in vars {
            let t = var.as_tensor();
            let data = t.flatten_all()?.to_vec1::<f32>()?;
            tensors.insert(name.clone(), Tensor::from_vec(data, t.dims(), &Device::Cpu)?);
        }
        Self::from_tensors(self.config.clone(), tensors)
    }
}

struct Initializer {
    rng: SmallRng,
}

impl Initializer {
    fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Xavier-uniform values for a `[fan_in, fan_out]` matrix.
    fn xavier(&mut self, fan_in: usize, fan_out: usize) -> Vec<f32> {
        let bound = XAVIER_GAIN * (6.0 / (fan_in + fan_out) as f64).sqrt();
        (0..fan_in * fan_out)
            .map(|_| self.rng.random_range(-bound..bound) as f32)
            .collect()
    }
}

/// Sinusoidal hour codes on the free dimensions; reserved dims stay zero.
fn hour_embedding(d_model: usize, latent_dim: usize) -> Vec<f32> {
    let first_free = latent_dim + 1;
    let n_free = d_model - first_free;
    let mut out = vec![0f32; HOURS_PER_DAY * d_model];
    for h in 0..HOURS_PER_DAY {
        for k in 0..n_free {
            let pair = (k / 2) as f64;
            let freq = 1.0 / HOUR_EMBED_BASE.powf(2.0 * pair / n_free as f64);
            let angle = h as f64 * freq;
            let v = if k % 2 == 0 { angle.sin() } else { angle.cos() };
            out[h * d_model + first_free + k] = v as f32;
        }
    }
    out
}

fn matrix(data: Vec<f32>, rows: usize, cols: usize) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
}

fn vector(data: Vec<f32>) -> Result<Tensor> {
    let n = data.len();
    Ok(Tensor::from_vec(data, n, &Device::Cpu)?)
}

fn zeros(shape: &[usize]) -> Result<Tensor> {
    Ok(Tensor::zeros(shape, DType::F32, &Device::Cpu)?)
}
