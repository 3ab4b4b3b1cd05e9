//! Joint training: posterior NLL + day-level BCE + REINFORCE on the query
//! policy, all active from the first step with fixed weights.

use std::collections::BTreeMap;

use candle_core::{D, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::aggregate::fused_logit;
use crate::config::FusionRule;
use crate::constants::{HOURS_PER_DAY, LOG_STD_MAX, LOG_STD_MIN};
use crate::error::{AlineError, Result};
use crate::features::ObservationMask;
use crate::math::sigmoid;
use crate::metrics::{brier_score, roc_auc};
use crate::model::{AlineModel, ForwardOutput};
use crate::params::ModelParams;
use crate::posterior::read_posteriors;
use crate::prior::Episode;
use crate::reward::{RewardBaseline, discounted_returns, risk_logit_variance, uncertainty_reduction};

/// Logit pushed onto confirmed hours so the policy never samples them.
const MASKED_LOGIT: f32 = -1e9;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Floor of the cosine schedule.
    pub min_learning_rate: f64,
    pub cosine_schedule: bool,
    pub weight_decay: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub posterior_weight: f64,
    pub classification_weight: f64,
    pub policy_weight: f64,
    /// Queries simulated per episode for the policy term.
    pub policy_steps: usize,
    pub gamma: f64,
    pub baseline_decay: f64,
    /// Upper bound on the random context set size per episode.
    pub max_context: usize,
    pub fusion: FusionRule,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 16,
            learning_rate: 1e-3,
            min_learning_rate: 1e-5,
            cosine_schedule: true,
            weight_decay: 1e-4,
            patience: 5,
            min_delta: 1e-4,
            posterior_weight: 1.0,
            classification_weight: 1.0,
            policy_weight: 0.1,
            policy_steps: 3,
            gamma: 0.9,
            baseline_decay: 0.9,
            max_context: 12,
            fusion: FusionRule::PrecisionWeighted,
            seed: 42,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub total: f64,
    pub posterior: f64,
    pub classification: f64,
    pub policy: f64,
}

impl LossBreakdown {
    fn accumulate(&mut self, other: &LossBreakdown) {
        self.total += other.total;
        self.posterior += other.posterior;
        self.classification += other.classification;
        self.policy += other.policy;
    }

    fn scaled(mut self, by: f64) -> Self {
        self.total *= by;
        self.posterior *= by;
        self.classification *= by;
        self.policy *= by;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    pub epoch: usize,
    pub train: LossBreakdown,
    pub val_loss: f64,
    pub auc: f64,
    pub brier: f64,
    pub learning_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub epochs: Vec<EpochLog>,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub stopped_early: bool,
}

/// Loss tensor of one episode plus host-side values of its parts.
struct EpisodeLoss {
    total: Tensor,
    parts: LossBreakdown,
}

pub struct Trainer {
    config: TrainConfig,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Cosine annealing from `learning_rate` down to `min_learning_rate`.
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        let cfg = &self.config;
        if !cfg.cosine_schedule || cfg.epochs <= 1 {
            return cfg.learning_rate;
        }
        let progress = epoch as f64 / (cfg.epochs - 1) as f64;
        cfg.min_learning_rate
            + 0.5
                * (cfg.learning_rate - cfg.min_learning_rate)
                * (1.0 + (std::f64::consts::PI * progress).cos())
    }

    /// Train from `params`, returning the parameters of the best validation
    /// epoch and the per-epoch log. With no validation episodes the training
    /// loss drives early stopping.
    pub fn fit(
        &self,
        params: &ModelParams,
        train: &[Episode],
        val: &[Episode],
    ) -> Result<(ModelParams, TrainReport)> {
        if train.is_empty() {
            return Err(AlineError::Config("no training episodes".into()));
        }
        let width = params.config().n_features;
        if let Some(bad) = train.iter().chain(val).find(|e| e.width != width) {
            return Err(AlineError::Config(format!(
                "episode width {} does not match model width {width}",
                bad.width
            )));
        }

        let cfg = &self.config;
        let mut rng = SmallRng::seed_from_u64(cfg.seed);
        let vars: BTreeMap<String, Var> = params.trainable_vars()?;
        let model = AlineModel::from_tensors(params.config(), &params.bind(&vars))?;
        let mut opt = AdamW::new(
            vars.values().cloned().collect(),
            ParamsAdamW {
                lr: cfg.learning_rate,
                weight_decay: cfg.weight_decay,
                ..Default::default()
            },
        )?;
        let mut baseline = RewardBaseline::new(cfg.baseline_decay);

        let mut best = params.clone();
        let mut best_val = f64::INFINITY;
        let mut best_epoch = 0;
        let mut waited = 0;
        let mut stopped_early = false;
        let mut logs = Vec::new();
        let mut order: Vec<usize> = (0..train.len()).collect();

        for epoch in 0..cfg.epochs {
            let lr = self.learning_rate(epoch);
            opt.set_learning_rate(lr);
            order.shuffle(&mut rng);

            let mut sum = LossBreakdown::default();
            for batch in order.chunks(cfg.batch_size.max(1)) {
                let mut losses = Vec::with_capacity(batch.len());
                for &i in batch {
                    let loss = self.episode_loss(&model, &train[i], &mut rng, &mut baseline)?;
                    sum.accumulate(&loss.parts);
                    losses.push(loss.total);
                }
                let loss = Tensor::stack(&losses, 0)?.mean_all()?;
                opt.backward_step(&loss)?;
            }
            let train_loss = sum.scaled(1.0 / train.len() as f64);

            let (val_loss, auc, brier) = if val.is_empty() {
                (train_loss.total, 0.5, f64::NAN)
            } else {
                self.validate(&model, val)?
            };
            tracing::info!(
                "epoch {epoch}: train {:.4} (nll {:.4}, bce {:.4}, policy {:.4}) val {val_loss:.4} auc {auc:.3} brier {brier:.4} lr {lr:.2e}",
                train_loss.total,
                train_loss.posterior,
                train_loss.classification,
                train_loss.policy,
            );
            logs.push(EpochLog {
                epoch,
                train: train_loss,
                val_loss,
                auc,
                brier,
                learning_rate: lr,
            });

            if !val_loss.is_finite() {
                tracing::warn!("epoch {epoch}: non-finite validation loss, stopping");
                stopped_early = true;
                break;
            }
            if val_loss < best_val - cfg.min_delta {
                best_val = val_loss;
                best_epoch = epoch;
                best = params.snapshot(&vars)?;
                waited = 0;
            } else {
                waited += 1;
                if waited >= cfg.patience {
                    tracing::info!("early stop at epoch {epoch}, best epoch {best_epoch}");
                    stopped_early = true;
                    break;
                }
            }
        }

        Ok((
            best,
            TrainReport {
                epochs: logs,
                best_epoch,
                best_val_loss: best_val,
                stopped_early,
            },
        ))
    }

    fn episode_loss(
        &self,
        model: &AlineModel,
        episode: &Episode,
        rng: &mut impl Rng,
        baseline: &mut RewardBaseline,
    ) -> Result<EpisodeLoss> {
        let cfg = &self.config;
        let mut mask = random_context(rng, cfg.max_context);
        let mut out = model.forward(&episode_tensor(episode, &mask)?, &mask)?;

        let posterior = match &episode.latents {
            Some(latents) => Some(gaussian_nll(&out.mean, &out.log_std, latents)?),
            None => None,
        };
        let classification = self.classification_loss(model, &out, episode.label)?;

        // REINFORCE over a short query rollout from the sampled context.
        let mut log_probs = Vec::new();
        let mut rewards = Vec::new();
        for _ in 0..cfg.policy_steps {
            let query = mask.query_hours();
            if query.is_empty() {
                break;
            }
            let penalty: Vec<f32> = (0..HOURS_PER_DAY)
                .map(|h| if mask.is_observed(h) { MASKED_LOGIT } else { 0.0 })
                .collect();
            let penalty = Tensor::from_vec(penalty, HOURS_PER_DAY, &Device::Cpu)?;
            let log_p = candle_nn::ops::log_softmax(&out.policy_logits.add(&penalty)?, D::Minus1)?;
            let probs = log_p.exp()?.to_vec1::<f32>()?;
            let hour = sample_hour(&probs, &query, rng);
            log_probs.push(log_p.narrow(0, hour, 1)?.squeeze(0)?);

            let before = self.logit_variance(model, &out)?;
            mask = mask.with_observed(hour);
            let next = model.forward(&episode_tensor(episode, &mask)?, &mask)?;
            let after = self.logit_variance(model, &next)?;
            rewards.push(uncertainty_reduction(before, after));
            out = next;
        }
        let policy = if log_probs.is_empty() {
            None
        } else {
            let returns = discounted_returns(&rewards, cfg.gamma);
            let advantages: Vec<f32> = baseline
                .advantages(&returns)
                .into_iter()
                .map(|a| a as f32)
                .collect();
            let n = advantages.len();
            let adv = Tensor::from_vec(advantages, n, &Device::Cpu)?;
            let weighted = (Tensor::stack(&log_probs, 0)? * adv)?.sum_all()?;
            Some(weighted.affine(-1.0 / n as f64, 0.0)?)
        };

        let mut total = classification.affine(cfg.classification_weight, 0.0)?;
        let mut parts = LossBreakdown {
            classification: classification.to_scalar::<f32>()? as f64,
            ..LossBreakdown::default()
        };
        if let Some(nll) = posterior {
            parts.posterior = nll.to_scalar::<f32>()? as f64;
            total = (total + nll.affine(cfg.posterior_weight, 0.0)?)?;
        }
        if let Some(pg) = policy {
            parts.policy = pg.to_scalar::<f32>()? as f64;
            total = (total + pg.affine(cfg.policy_weight, 0.0)?)?;
        }
        parts.total = cfg.classification_weight * parts.classification
            + cfg.posterior_weight * parts.posterior
            + cfg.policy_weight * parts.policy;
        Ok(EpisodeLoss { total, parts })
    }

    fn classification_loss(&self, model: &AlineModel, out: &ForwardOutput, label: f32) -> Result<Tensor> {
        let (w, b) = model.link_tensors();
        let log_std = out.log_std.clamp(LOG_STD_MIN, LOG_STD_MAX)?;
        let logit = fused_logit(&out.mean, &log_std, self.config.fusion, w, b)?;
        bce_with_logits(&logit, label)
    }

    fn logit_variance(&self, model: &AlineModel, out: &ForwardOutput) -> Result<f64> {
        let posteriors = read_posteriors(&out.mean, &out.log_std)?;
        Ok(risk_logit_variance(&posteriors, model.link(), self.config.fusion))
    }

    /// Validation loss (NLL + BCE with no context), AUC and Brier of the
    /// fused day-level probability.
    fn validate(&self, model: &AlineModel, val: &[Episode]) -> Result<(f64, f64, f64)> {
        let cfg = &self.config;
        let mask = ObservationMask::empty();
        let mut total = 0.0;
        let mut probs = Vec::with_capacity(val.len());
        let mut labels = Vec::with_capacity(val.len());
        for episode in val {
            let out = model.forward(&episode_tensor(episode, &mask)?, &mask)?;
            let (w, b) = model.link_tensors();
            let log_std = out.log_std.clamp(LOG_STD_MIN, LOG_STD_MAX)?;
            let logit = fused_logit(&out.mean, &log_std, cfg.fusion, w, b)?;
            let bce = bce_with_logits(&logit, episode.label)?.to_scalar::<f32>()? as f64;
            let nll = match &episode.latents {
                Some(latents) => {
                    gaussian_nll(&out.mean, &out.log_std, latents)?.to_scalar::<f32>()? as f64
                }
                None => 0.0,
            };
            total += cfg.classification_weight * bce + cfg.posterior_weight * nll;
            probs.push(sigmoid(logit.to_scalar::<f32>()? as f64));
            labels.push(episode.positive());
        }
        let n = val.len() as f64;
        Ok((total / n, roc_auc(&probs, &labels), brier_score(&probs, &labels)))
    }
}

/// Uniformly sized random context set of at most `max_context` hours.
fn random_context(rng: &mut impl Rng, max_context: usize) -> ObservationMask {
    let n = rng.random_range(0..=max_context.min(HOURS_PER_DAY - 1));
    let mut hours: Vec<usize> = (0..HOURS_PER_DAY).collect();
    hours.shuffle(rng);
    let mut mask = ObservationMask::empty();
    for &h in &hours[..n] {
        mask = mask.with_observed(h);
    }
    mask
}

fn episode_tensor(episode: &Episode, mask: &ObservationMask) -> Result<Tensor> {
    Ok(Tensor::from_vec(
        episode.input(mask),
        (HOURS_PER_DAY, episode.width),
        &Device::Cpu,
    )?)
}

/// Draw an hour from `probs` restricted to `candidates`.
fn sample_hour(probs: &[f32], candidates: &[usize], rng: &mut impl Rng) -> usize {
    let total: f32 = candidates.iter().map(|&h| probs[h]).sum();
    let mut u = rng.random::<f32>() * total;
    for &h in candidates {
        u -= probs[h];
        if u <= 0.0 {
            return h;
        }
    }
    candidates[candidates.len() - 1]
}

/// Mean over hours and axes of ½(z−μ)²/σ² + log σ.
fn gaussian_nll(mean: &Tensor, log_std: &Tensor, latents: &[f32]) -> Result<Tensor> {
    let target = Tensor::from_vec(latents.to_vec(), mean.dims(), &Device::Cpu)?;
    let inv_var = log_std.affine(-2.0, 0.0)?.exp()?;
    let sq = (target - mean)?.sqr()?;
    let nll = ((sq * inv_var)?.affine(0.5, 0.0)? + log_std)?;
    Ok(nll.mean_all()?)
}

/// Numerically stable BCE on a scalar logit: max(l,0) − l·y + ln(1 + e^−|l|).
fn bce_with_logits(logit: &Tensor, label: f32) -> Result<Tensor> {
    let soft = logit.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let linear = (logit.relu()? - logit.affine(label as f64, 0.0)?)?;
    Ok((linear + soft)?)
}
