/// Rows in every feature sequence: one per hour of the day.
pub const HOURS_PER_DAY: usize = 24;

/// Default channel width F of a feature row.
pub const DEFAULT_FEATURES: usize = 20;

/// Default latent dimension D (stress, sleep debt, hormonal, environmental load).
pub const DEFAULT_LATENT_DIM: usize = 4;

/// Channel values at or below this are missing-sensor sentinels.
pub const MISSING_SENTINEL: f64 = -999.0;

/// Inference-time clamp for log-uncertainty: exp(-6) ≈ 0.0025, exp(3) ≈ 20.1
pub const LOG_STD_MIN: f32 = -6.0;
pub const LOG_STD_MAX: f32 = 3.0;

/// Inference-time clamp for latent means.
pub const MEAN_LIMIT: f32 = 10.0;

/// Logistic link defaults (weights per latent axis, bias).
pub const DEFAULT_LINK_WEIGHTS: [f64; 4] = [0.5, 0.4, 0.45, 0.35];
pub const DEFAULT_LINK_BIAS: f64 = -1.8;

/// Monte Carlo draws for the daily risk interval.
pub const DEFAULT_MC_SAMPLES: usize = 512;

/// Empirical percentiles reported as interval bounds.
pub const LOWER_QUANTILE: f64 = 0.05;
pub const UPPER_QUANTILE: f64 = 0.95;

/// Added to std before dividing during z-score normalization.
pub const NORMALIZE_EPSILON: f64 = 1e-6;

/// Probability clamp used by entropy and cross-entropy terms.
pub const PROB_EPSILON: f64 = 1e-6;

/// Log-uncertainty drop applied to confirmed hours by the prior initialization.
pub const CONFIRMED_LOG_STD_DROP: f32 = 1.5;

/// Fixed measurement schedule used as the policy baseline (08:00, 12:00, 20:00).
pub const FIXED_SCHEDULE: [usize; 3] = [8, 12, 20];
