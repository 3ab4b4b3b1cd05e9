//! Synthetic training days from a latent-dynamics prior:
//!
//! Z_t = A·Z_{t−1} + B·u_t + η_t,  η_t ~ N(0, diag Σ²)
//!
//! u_t are the (normalized) hourly features; B maps each channel onto its
//! schema axis with the schema gain. The initial state μ₀ and the per-axis
//! noise Σ are redrawn for every episode, so the model sees a family of
//! dynamics rather than one.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::aggregate::LogisticLink;
use crate::constants::HOURS_PER_DAY;
use crate::features::{FeatureSchema, ObservationMask};
use crate::math::standard_normal;

/// State transition used for the four standard axes: stress persists, sleep
/// debt feeds on stress, hormonal cycles are slow, environmental load decays.
const TRANSITION_4: [[f64; 4]; 4] = [
    [0.95, 0.05, 0.00, 0.00],
    [0.10, 0.90, 0.00, 0.00],
    [0.00, 0.00, 0.98, 0.02],
    [0.05, 0.00, 0.00, 0.85],
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// Scale of the B matrix entries (times the schema gain).
    pub input_gain: f64,
    /// Std of the initial state μ₀.
    pub initial_scale: f64,
    /// Per-episode process noise Σ is drawn uniformly from this range.
    pub noise_min: f64,
    pub noise_max: f64,
    /// Gaussian noise added to features of unconfirmed hours.
    pub feature_noise: f64,
    /// Probability that a channel of an unconfirmed hour is dropped to missing.
    pub dropout: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            input_gain: 0.3,
            initial_scale: 1.0,
            noise_min: 0.05,
            noise_max: 0.3,
            feature_noise: 0.3,
            dropout: 0.1,
        }
    }
}

/// One training day in normalized feature space.
#[derive(Clone, Debug, PartialEq)]
pub struct Episode {
    /// Row-major `24 × F` features as measured.
    pub clean: Vec<f32>,
    /// Same day with sensor noise and dropout, seen at unconfirmed hours.
    pub corrupted: Vec<f32>,
    /// Row-major `24 × D` latent trajectory, when known.
    pub latents: Option<Vec<f32>>,
    pub label: f32,
    pub width: usize,
}

impl Episode {
    /// Episode from recorded data: no latent targets, no corruption.
    pub fn observed(features: Vec<f32>, width: usize, label: bool) -> Self {
        Self {
            corrupted: features.clone(),
            clean: features,
            latents: None,
            label: if label { 1.0 } else { 0.0 },
            width,
        }
    }

    /// Encoder input under `mask`: clean rows where confirmed, corrupted elsewhere.
    pub fn input(&self, mask: &ObservationMask) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.clean.len());
        for h in 0..HOURS_PER_DAY {
            let src = if mask.is_observed(h) { &self.clean } else { &self.corrupted };
            out.extend_from_slice(&src[h * self.width..(h + 1) * self.width]);
        }
        out
    }

    pub fn positive(&self) -> bool {
        self.label >= 0.5
    }
}

#[derive(Clone, Debug)]
pub struct LatentDynamicsPrior {
    config: PriorConfig,
    transition: Vec<Vec<f64>>,
    input: Vec<Vec<f64>>,
    link: LogisticLink,
    latent_dim: usize,
    width: usize,
}

impl LatentDynamicsPrior {
    pub fn new(config: PriorConfig, schema: &FeatureSchema, link: LogisticLink) -> Self {
        let latent_dim = link.weights().len();
        let width = schema.len();
        let transition = (0..latent_dim)
            .map(|i| {
                (0..latent_dim)
                    .map(|j| {
                        if latent_dim == 4 {
                            TRANSITION_4[i][j]
                        } else if i == j {
                            0.9
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();
        let mut input = vec![vec![0.0; width]; latent_dim];
        for (c, channel) in schema.channels.iter().enumerate() {
            if let Some(axis) = channel.axis.filter(|a| a.index() < latent_dim) {
                input[axis.index()][c] = config.input_gain * f64::from(channel.gain);
            }
        }
        Self {
            config,
            transition,
            input,
            link,
            latent_dim,
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Draw one day. The label is Bernoulli on the link applied to the day's
    /// mean latent state.
    pub fn sample(&self, rng: &mut impl Rng) -> Episode {
        let d = self.latent_dim;
        let f = self.width;
        let cfg = &self.config;

        let mut z: Vec<f64> = (0..d)
            .map(|_| cfg.initial_scale * standard_normal(rng))
            .collect();
        let sigma: Vec<f64> = (0..d)
            .map(|_| {
                if cfg.noise_max > cfg.noise_min {
                    rng.random_range(cfg.noise_min..cfg.noise_max)
                } else {
                    cfg.noise_min
                }
            })
            .collect();

        let mut clean = Vec::with_capacity(HOURS_PER_DAY * f);
        let mut corrupted = Vec::with_capacity(HOURS_PER_DAY * f);
        let mut latents = Vec::with_capacity(HOURS_PER_DAY * d);
        let mut day_sum = vec![0.0; d];

        for _ in 0..HOURS_PER_DAY {
            let u: Vec<f64> = (0..f).map(|_| standard_normal(rng)).collect();
            let next: Vec<f64> = (0..d)
                .map(|i| {
                    let carried: f64 = (0..d).map(|j| self.transition[i][j] * z[j]).sum();
                    let driven: f64 = (0..f).map(|c| self.input[i][c] * u[c]).sum();
                    carried + driven + sigma[i] * standard_normal(rng)
                })
                .collect();
            z = next;

            for (a, v) in z.iter().enumerate() {
                latents.push(*v as f32);
                day_sum[a] += v;
            }
            for &x in &u {
                clean.push(x as f32);
                let noisy = if rng.random::<f64>() < cfg.dropout {
                    // missing channels are imputed to the normalized mean
                    0.0
                } else {
                    x + cfg.feature_noise * standard_normal(rng)
                };
                corrupted.push(noisy as f32);
            }
        }

        let day_mean: Vec<f64> = day_sum.iter().map(|s| s / HOURS_PER_DAY as f64).collect();
        let p = self.link.probability(&day_mean);
        let label = if rng.random::<f64>() < p { 1.0 } else { 0.0 };

        Episode {
            clean,
            corrupted,
            latents: Some(latents),
            label,
            width: f,
        }
    }

    pub fn sample_many(&self, n: usize, rng: &mut impl Rng) -> Vec<Episode> {
        (0..n).map(|_| self.sample(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn prior() -> LatentDynamicsPrior {
        LatentDynamicsPrior::new(
            PriorConfig::default(),
            &FeatureSchema::migraine_default(),
            LogisticLink::new(vec![0.5, 0.4, 0.45, 0.35], -1.8),
        )
    }

    #[test]
    fn test_episode_shapes() {
        let ep = prior().sample(&mut rng());
        assert_eq!(ep.clean.len(), 24 * 20);
        assert_eq!(ep.corrupted.len(), 24 * 20);
        assert_eq!(ep.latents.as_ref().unwrap().len(), 24 * 4);
        assert!(ep.label == 0.0 || ep.label == 1.0);
        assert!(ep.clean.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sampling_is_seeded() {
        let a = prior().sample(&mut rng());
        let b = prior().sample(&mut rng());
        assert_eq!(a, b);
    }

    #[test]
    fn test_input_mixes_by_mask() {
        let ep = prior().sample(&mut rng());
        let mask = ObservationMask::from_hours(&[0]).unwrap();
        let x = ep.input(&mask);
        assert_eq!(&x[..20], &ep.clean[..20]);
        assert_eq!(&x[20..40], &ep.corrupted[20..40]);
    }

    #[test]
    fn test_both_labels_occur() {
        let mut r = rng();
        let eps = prior().sample_many(300, &mut r);
        let positives = eps.iter().filter(|e| e.positive()).count();
        assert!(positives > 0 && positives < 300, "positives = {positives}");
    }

    #[test]
    fn test_stress_channel_drives_stress_axis() {
        let p = prior();
        assert!(p.input[0][3] > 0.0);
        assert!(p.input[0][19] < 0.0);
        assert_eq!(p.input[0][6], 0.0);
    }

    #[test]
    fn test_observed_episode_has_no_targets() {
        let ep = Episode::observed(vec![0.5; 48], 2, true);
        assert!(ep.latents.is_none());
        assert!(ep.positive());
        assert_eq!(ep.clean, ep.corrupted);
    }
}
