//! ALINE: amortized posterior inference and active query policy for
//! next-day migraine risk.
//!
//! A self-attention encoder reads a day of 24 hourly feature rows, with a
//! mask marking the hours whose outcomes are confirmed, and produces a
//! diagonal Gaussian over a small latent health state for every hour. The
//! hourly posteriors fuse into a day-level risk with an uncertainty interval,
//! and a policy ranks the unconfirmed hours by how much measuring them would
//! tighten that estimate.
//!
//! Zero I/O: parameters come in as tensors, results go out as plain values.

pub mod aggregate;
pub mod config;
pub mod constants;
pub mod encoder;
pub mod error;
pub mod eval;
pub mod features;
pub mod math;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod params;
pub mod policy;
pub mod posterior;
pub mod prior;
pub mod reward;
pub mod service;
pub mod time;
pub mod train;
pub mod wire;

pub use aggregate::{DailyRiskEstimate, FusedGaussian, LogisticLink, RiskAggregator, fuse};
pub use config::{FusionRule, InferenceConfig, ModelConfig, PolicyWeights};
pub use constants::{HOURS_PER_DAY, MISSING_SENTINEL};
pub use error::{AlineError, Result, ValidationError};
pub use eval::{EvaluationReport, Evaluator, PolicyComparison, PolicyStats};
pub use features::{ChannelSpec, FeatureSchema, FeatureSequence, FeatureStats, LatentAxis, ObservationMask};
pub use metrics::PredictionMetrics;
pub use model::{AlineModel, DayInference, ForwardOutput};
pub use params::{ModelParams, expected_shapes};
pub use policy::{PolicyRecommendation, ScoredHour, select_top_k};
pub use posterior::HourlyPosterior;
pub use prior::{Episode, LatentDynamicsPrior, PriorConfig};
pub use service::{DayAnalysis, InferenceService};
pub use train::{EpochLog, TrainConfig, TrainReport, Trainer};
