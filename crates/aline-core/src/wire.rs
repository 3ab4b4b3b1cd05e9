//! JSON records exchanged with external callers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::aggregate::DailyRiskEstimate;
use crate::policy::{PolicyRecommendation, ScoredHour};
use crate::posterior::HourlyPosterior;

pub const DEFAULT_K: i64 = 3;

fn default_k() -> i64 {
    DEFAULT_K
}

/// Body of `/posterior/hourly` and `/risk/daily`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DayRequest {
    pub user_id: String,
    /// 24 rows of F channel values; -999 marks a missing channel.
    pub features: Vec<Vec<f64>>,
    /// Hours (0-23) with confirmed outcomes. Absent means none.
    #[serde(default)]
    pub observed_hours: Option<Vec<i64>>,
}

/// Body of `/policy/topk`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyRequest {
    pub user_id: String,
    pub features: Vec<Vec<f64>>,
    #[serde(default = "default_k")]
    pub k: i64,
    #[serde(default)]
    pub observed_hours: Option<Vec<i64>>,
}

impl PolicyRequest {
    pub fn day(&self) -> DayRequest {
        DayRequest {
            user_id: self.user_id.clone(),
            features: self.features.clone(),
            observed_hours: self.observed_hours.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HourlyPosteriorRecord {
    pub hour: usize,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl From<&HourlyPosterior> for HourlyPosteriorRecord {
    fn from(p: &HourlyPosterior) -> Self {
        Self {
            hour: p.hour,
            mean: p.mean.clone(),
            std: p.std.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HourlyPosteriorResponse {
    pub user_id: String,
    pub hourly_posteriors: Vec<HourlyPosteriorRecord>,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DailyRiskResponse {
    pub user_id: String,
    pub mean_probability: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub timestamp: String,
}

impl DailyRiskResponse {
    pub fn new(user_id: String, est: &DailyRiskEstimate, timestamp: String) -> Self {
        Self {
            user_id,
            mean_probability: est.mean_probability,
            lower_bound: est.lower_bound,
            upper_bound: est.upper_bound,
            timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectedHour {
    pub hour: usize,
    pub priority_score: f64,
}

impl From<&ScoredHour> for SelectedHour {
    fn from(s: &ScoredHour) -> Self {
        Self {
            hour: s.hour,
            priority_score: s.priority_score,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyTopkResponse {
    pub user_id: String,
    pub selected_hours: Vec<SelectedHour>,
    /// Requested k; `selected_hours` holds min(k, available_hours) entries.
    pub k: usize,
    pub available_hours: usize,
    pub timestamp: String,
}

impl PolicyTopkResponse {
    pub fn new(user_id: String, rec: &PolicyRecommendation, timestamp: String) -> Self {
        Self {
            user_id,
            selected_hours: rec.selected.iter().map(SelectedHour::from).collect(),
            k: rec.requested_k,
            available_hours: rec.available,
            timestamp,
        }
    }
}

/// Everything for one day from a single forward pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisResponse {
    pub user_id: String,
    pub mean_probability: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub hourly_posteriors: Vec<HourlyPosteriorRecord>,
    pub selected_hours: Vec<SelectedHour>,
    pub k: usize,
    pub available_hours: usize,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub model_loaded: bool,
}

/// Body of `/feedback`: a day with its observed outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeedbackRequest {
    pub user_id: String,
    /// `YYYY-MM-DD`
    pub day: String,
    pub features: Vec<Vec<f64>>,
    /// Whether a migraine occurred.
    pub outcome: bool,
    #[serde(default)]
    pub predicted_risk: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeedbackResponse {
    pub status: String,
    pub id: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccuracyResponse {
    pub user_id: String,
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub brier: f64,
    pub window_days: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeedbackHistoryItem {
    pub day: String,
    pub predicted_risk: Option<f64>,
    pub outcome: bool,
    pub recorded_at: String,
}

/// Most recent labeled days first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeedbackHistoryResponse {
    pub user_id: String,
    pub items: Vec<FeedbackHistoryItem>,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: String,
}

/// JSON Schemas of every wire record, keyed by record name.
pub fn schemas() -> serde_json::Value {
    serde_json::json!({
        "DayRequest": schemars::schema_for!(DayRequest),
        "PolicyRequest": schemars::schema_for!(PolicyRequest),
        "HourlyPosteriorResponse": schemars::schema_for!(HourlyPosteriorResponse),
        "DailyRiskResponse": schemars::schema_for!(DailyRiskResponse),
        "PolicyTopkResponse": schemars::schema_for!(PolicyTopkResponse),
        "AnalysisResponse": schemars::schema_for!(AnalysisResponse),
        "HealthResponse": schemars::schema_for!(HealthResponse),
        "FeedbackRequest": schemars::schema_for!(FeedbackRequest),
        "FeedbackResponse": schemars::schema_for!(FeedbackResponse),
        "AccuracyResponse": schemars::schema_for!(AccuracyResponse),
        "FeedbackHistoryResponse": schemars::schema_for!(FeedbackHistoryResponse),
        "ErrorResponse": schemars::schema_for!(ErrorResponse),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_request_defaults() {
        let req: PolicyRequest =
            serde_json::from_str(r#"{"user_id":"u1","features":[]}"#).unwrap();
        assert_eq!(req.k, 3);
        assert!(req.observed_hours.is_none());
    }

    #[test]
    fn test_day_request_with_context() {
        let req: DayRequest = serde_json::from_str(
            r#"{"user_id":"u1","features":[[1.0]],"observed_hours":[0,5]}"#,
        )
        .unwrap();
        assert_eq!(req.observed_hours, Some(vec![0, 5]));
    }

    #[test]
    fn test_schemas_cover_every_record() {
        let s = schemas();
        let obj = s.as_object().unwrap();
        assert_eq!(obj.len(), 12);
        let policy = serde_json::to_string(&obj["PolicyRequest"]).unwrap();
        assert!(policy.contains("observed_hours"));
    }
}
