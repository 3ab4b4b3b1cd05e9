use std::collections::BTreeMap;

use candle_core::{D, Tensor};
use serde::{Deserialize, Serialize};

use crate::constants::{LOG_STD_MAX, LOG_STD_MIN, MEAN_LIMIT};
use crate::error::{AlineError, Result};
use crate::nn::Linear;

/// Diagonal Gaussian q(z_h | C) for one hour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HourlyPosterior {
    pub hour: usize,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl HourlyPosterior {
    pub fn variance(&self) -> impl Iterator<Item = f64> + '_ {
        self.std.iter().map(|s| s * s)
    }

    pub fn mean_std(&self) -> f64 {
        crate::math::mean(&self.std)
    }
}

/// Linear head from hidden states to (mean, log-std), each `[seq, D]`.
#[derive(Clone, Debug)]
pub struct PosteriorHead {
    linear: Linear,
    latent_dim: usize,
}

impl PosteriorHead {
    pub fn load(tensors: &BTreeMap<String, Tensor>, latent_dim: usize) -> Result<Self> {
        Ok(Self {
            linear: Linear::load(tensors, "posterior")?,
            latent_dim,
        })
    }

    /// Unclamped outputs, as used by the training objective.
    pub fn forward(&self, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = self.linear.forward(hidden)?;
        let mean = out.narrow(D::Minus1, 0, self.latent_dim)?.contiguous()?;
        let log_std = out
            .narrow(D::Minus1, self.latent_dim, self.latent_dim)?
            .contiguous()?;
        Ok((mean, log_std))
    }
}

/// Read `[24, D]` mean and log-std tensors into per-hour posteriors, clamping
/// means to ±10 and log-std to [-6, 3] before exponentiating.
pub fn read_posteriors(mean: &Tensor, log_std: &Tensor) -> Result<Vec<HourlyPosterior>> {
    let means = mean.to_vec2::<f32>()?;
    let log_stds = log_std.to_vec2::<f32>()?;
    if means.len() != log_stds.len() {
        return Err(AlineError::Params(format!(
            "posterior rows disagree: {} means, {} log-stds",
            means.len(),
            log_stds.len()
        )));
    }
    Ok(means
        .into_iter()
        .zip(log_stds)
        .enumerate()
        .map(|(hour, (m, ls))| HourlyPosterior {
            hour,
            mean: m
                .into_iter()
                .map(|v| clamp_finite(v, -MEAN_LIMIT, MEAN_LIMIT, 0.0) as f64)
                .collect(),
            std: ls
                .into_iter()
                .map(|v| (clamp_finite(v, LOG_STD_MIN, LOG_STD_MAX, LOG_STD_MAX) as f64).exp())
                .collect(),
        })
        .collect())
}

/// NaN maps to `fallback`; infinities clamp to the nearest bound.
fn clamp_finite(v: f32, lo: f32, hi: f32, fallback: f32) -> f32 {
    if v.is_nan() { fallback } else { v.clamp(lo, hi) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_read_posteriors_clamps() {
        let mean = Tensor::from_vec(vec![50.0f32, -50.0], (1, 2), &Device::Cpu).unwrap();
        let log_std = Tensor::from_vec(vec![-20.0f32, 20.0], (1, 2), &Device::Cpu).unwrap();
        let post = read_posteriors(&mean, &log_std).unwrap();
        assert_eq!(post[0].mean, vec![10.0, -10.0]);
        assert!((post[0].std[0] - (-6.0f64).exp()).abs() < 1e-9);
        assert!((post[0].std[1] - 3.0f64.exp()).abs() < 1e-6);
    }

    #[test]
    fn test_nan_log_std_is_widest() {
        let mean = Tensor::from_vec(vec![f32::NAN], (1, 1), &Device::Cpu).unwrap();
        let log_std = Tensor::from_vec(vec![f32::NAN], (1, 1), &Device::Cpu).unwrap();
        let post = read_posteriors(&mean, &log_std).unwrap();
        assert_eq!(post[0].mean[0], 0.0);
        assert!(post[0].std[0].is_finite());
        assert!(post[0].std[0] > 1.0);
    }

    #[test]
    fn test_head_splits_mean_and_log_std() {
        let mut map = BTreeMap::new();
        // hidden 2 -> (mean 1, log_std 1)
        map.insert(
            "posterior.weight".to_string(),
            Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 2.0], (2, 2), &Device::Cpu).unwrap(),
        );
        map.insert(
            "posterior.bias".to_string(),
            Tensor::from_vec(vec![0.0f32, -1.0], 2, &Device::Cpu).unwrap(),
        );
        let head = PosteriorHead::load(&map, 1).unwrap();
        let hidden = Tensor::from_vec(vec![3.0f32, 1.0], (1, 2), &Device::Cpu).unwrap();
        let (m, ls) = head.forward(&hidden).unwrap();
        assert_eq!(m.to_vec2::<f32>().unwrap(), vec![vec![3.0]]);
        assert_eq!(ls.to_vec2::<f32>().unwrap(), vec![vec![1.0]]);
    }
}
