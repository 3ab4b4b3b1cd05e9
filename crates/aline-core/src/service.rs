//! Request-level facade over the model: validation, one forward pass, and the
//! three views of its result. Stateless; clones share the same parameters.

use std::sync::Arc;

use crate::aggregate::{DailyRiskEstimate, RiskAggregator};
use crate::config::InferenceConfig;
use crate::error::{AlineError, Result, ValidationError};
use crate::features::{FeatureSequence, FeatureStats, ObservationMask};
use crate::model::AlineModel;
use crate::params::ModelParams;
use crate::policy::{PolicyRecommendation, check_k, score_hours, select_top_k};
use crate::posterior::HourlyPosterior;
use crate::time::now_rfc3339;
use crate::wire::{
    AnalysisResponse, DailyRiskResponse, DayRequest, HourlyPosteriorRecord,
    HourlyPosteriorResponse, PolicyRequest, PolicyTopkResponse, SelectedHour,
};

/// Result of analysing one day.
#[derive(Clone, Debug)]
pub struct DayAnalysis {
    pub posteriors: Vec<HourlyPosterior>,
    pub risk: DailyRiskEstimate,
    /// Priority score of every hour, confirmed or not.
    pub scores: Vec<f64>,
    pub mask: ObservationMask,
}

impl DayAnalysis {
    pub fn top_k(&self, k: i64) -> std::result::Result<PolicyRecommendation, ValidationError> {
        select_top_k(&self.scores, &self.mask, k)
    }
}

#[derive(Clone)]
pub struct InferenceService {
    model: Arc<AlineModel>,
    stats: Option<FeatureStats>,
    aggregator: RiskAggregator,
}

impl InferenceService {
    pub fn new(params: &ModelParams, stats: Option<FeatureStats>, config: InferenceConfig) -> Result<Self> {
        config.validate()?;
        let model = AlineModel::from_params(params)?;
        let width = model.config().n_features;
        if let Some(s) = stats.as_ref().filter(|s| !s.fits(width)) {
            return Err(AlineError::Config(format!(
                "feature stats cover {} means and {} stds, model expects {width}",
                s.mean.len(),
                s.std.len()
            )));
        }
        Ok(Self {
            model: Arc::new(model),
            stats,
            aggregator: RiskAggregator::new(config),
        })
    }

    pub fn n_features(&self) -> usize {
        self.model.config().n_features
    }

    pub fn model(&self) -> &AlineModel {
        &self.model
    }

    /// Shape-check raw rows against the deployed width.
    pub fn sequence(&self, rows: Vec<Vec<f64>>) -> std::result::Result<FeatureSequence, ValidationError> {
        FeatureSequence::new(rows, self.n_features())
    }

    /// One forward pass over a validated day.
    pub fn analyze_day(&self, seq: &FeatureSequence, mask: ObservationMask) -> Result<DayAnalysis> {
        let inf = self.model.infer(seq, &mask, self.stats.as_ref())?;
        let link = self.model.link();
        let risk = self.aggregator.aggregate(&inf.posteriors, link);
        let scores = score_hours(
            &inf.posteriors,
            &inf.policy_logits,
            link,
            &self.aggregator.config().policy,
        );
        Ok(DayAnalysis {
            posteriors: inf.posteriors,
            risk,
            scores,
            mask,
        })
    }

    fn analyze_request(&self, req: &DayRequest) -> Result<DayAnalysis> {
        let mask = match &req.observed_hours {
            Some(hours) => ObservationMask::from_signed_hours(hours)?,
            None => ObservationMask::empty(),
        };
        let seq = self.sequence(req.features.clone())?;
        self.analyze_day(&seq, mask)
    }

    pub fn hourly_posterior(&self, req: &DayRequest) -> Result<HourlyPosteriorResponse> {
        let analysis = self.analyze_request(req)?;
        Ok(HourlyPosteriorResponse {
            user_id: req.user_id.clone(),
            hourly_posteriors: analysis.posteriors.iter().map(HourlyPosteriorRecord::from).collect(),
            timestamp: now_rfc3339(),
        })
    }

    pub fn daily_risk(&self, req: &DayRequest) -> Result<DailyRiskResponse> {
        let analysis = self.analyze_request(req)?;
        Ok(DailyRiskResponse::new(req.user_id.clone(), &analysis.risk, now_rfc3339()))
    }

    pub fn policy_topk(&self, req: &PolicyRequest) -> Result<PolicyTopkResponse> {
        check_k(req.k)?;
        let analysis = self.analyze_request(&req.day())?;
        let rec = analysis.top_k(req.k)?;
        Ok(PolicyTopkResponse::new(req.user_id.clone(), &rec, now_rfc3339()))
    }

    /// Posteriors, daily risk and top-k in one response.
    pub fn analyze(&self, req: &PolicyRequest) -> Result<AnalysisResponse> {
        check_k(req.k)?;
        let analysis = self.analyze_request(&req.day())?;
        let rec = analysis.top_k(req.k)?;
        Ok(AnalysisResponse {
            user_id: req.user_id.clone(),
            mean_probability: analysis.risk.mean_probability,
            lower_bound: analysis.risk.lower_bound,
            upper_bound: analysis.risk.upper_bound,
            hourly_posteriors: analysis.posteriors.iter().map(HourlyPosteriorRecord::from).collect(),
            selected_hours: rec.selected.iter().map(SelectedHour::from).collect(),
            k: rec.requested_k,
            available_hours: rec.available,
            timestamp: now_rfc3339(),
        })
    }
}
