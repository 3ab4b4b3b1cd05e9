//! HTTP facade: JSON in, JSON out. The forward pass runs on the blocking
//! pool; the outcome corpus sits behind an async mutex.

use std::sync::Arc;

use aline_core::time::now_rfc3339;
use aline_core::wire::{
    AccuracyResponse, AnalysisResponse, DailyRiskResponse, DayRequest, ErrorResponse,
    FeedbackHistoryResponse, FeedbackRequest, FeedbackResponse, HealthResponse,
    HourlyPosteriorResponse, PolicyRequest, PolicyTopkResponse,
};
use aline_core::{AlineError, InferenceService};
use aline_store::{CorpusStore, StoreError};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_WINDOW_DAYS: u32 = 30;
const DEFAULT_HISTORY_LIMIT: usize = 30;

#[derive(Clone)]
pub struct AppState {
    service: InferenceService,
    corpus: Arc<Mutex<CorpusStore>>,
}

impl AppState {
    pub fn new(service: InferenceService, corpus: CorpusStore) -> Self {
        Self {
            service,
            corpus: Arc::new(Mutex::new(corpus)),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            ApiError::BadRequest(d) => (StatusCode::BAD_REQUEST, "invalid_request", d),
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, "not_found", d),
            ApiError::Internal(d) => {
                tracing::error!("request failed: {d}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", d)
            }
        };
        let body = ErrorResponse {
            error: error.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

impl From<AlineError> for ApiError {
    fn from(e: AlineError) -> Self {
        match e {
            AlineError::Validation(v) => ApiError::BadRequest(v.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidData(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/posterior/hourly", post(posterior_hourly))
        .route("/risk/daily", post(risk_daily))
        .route("/policy/topk", post(policy_topk))
        .route("/analyze", post(analyze))
        .route("/feedback", post(feedback))
        .route("/user/{user_id}/accuracy", get(accuracy))
        .route("/user/{user_id}/feedback_history", get(feedback_history))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("listening on {addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Run model compute off the async workers.
async fn compute<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AlineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("inference task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: now_rfc3339(),
        model_loaded: true,
    })
}

async fn posterior_hourly(
    State(state): State<AppState>,
    payload: Result<Json<DayRequest>, JsonRejection>,
) -> ApiResult<HourlyPosteriorResponse> {
    let Json(req) = payload?;
    let service = state.service.clone();
    Ok(Json(compute(move || service.hourly_posterior(&req)).await?))
}

async fn risk_daily(
    State(state): State<AppState>,
    payload: Result<Json<DayRequest>, JsonRejection>,
) -> ApiResult<DailyRiskResponse> {
    let Json(req) = payload?;
    let service = state.service.clone();
    Ok(Json(compute(move || service.daily_risk(&req)).await?))
}

async fn policy_topk(
    State(state): State<AppState>,
    payload: Result<Json<PolicyRequest>, JsonRejection>,
) -> ApiResult<PolicyTopkResponse> {
    let Json(req) = payload?;
    let service = state.service.clone();
    Ok(Json(compute(move || service.policy_topk(&req)).await?))
}

async fn analyze(
    State(state): State<AppState>,
    payload: Result<Json<PolicyRequest>, JsonRejection>,
) -> ApiResult<AnalysisResponse> {
    let Json(req) = payload?;
    let service = state.service.clone();
    Ok(Json(compute(move || service.analyze(&req)).await?))
}

async fn feedback(
    State(state): State<AppState>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> ApiResult<FeedbackResponse> {
    let Json(req) = payload?;
    // Width is checked here so the corpus only holds days the model can replay.
    state.service.sequence(req.features.clone()).map_err(AlineError::from)?;
    let id = state.corpus.lock().await.record_feedback(&req)?;
    Ok(Json(FeedbackResponse {
        status: "recorded".to_string(),
        id: id.to_string(),
        timestamp: now_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct AccuracyQuery {
    window_days: Option<u32>,
}

async fn accuracy(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    query: Result<Query<AccuracyQuery>, QueryRejection>,
) -> ApiResult<AccuracyResponse> {
    let Query(q) = query?;
    let window = q.window_days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let resp = state.corpus.lock().await.accuracy(&user_id, window)?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn feedback_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<FeedbackHistoryResponse> {
    let Query(q) = query?;
    let items = state
        .corpus
        .lock()
        .await
        .history(&user_id, q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))?;
    if items.is_empty() {
        return Err(ApiError::NotFound(format!("no feedback recorded for user {user_id}")));
    }
    Ok(Json(FeedbackHistoryResponse {
        user_id,
        items,
        timestamp: now_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aline_core::{FeatureSchema, InferenceConfig, ModelConfig, ModelParams};
    use serde_json::{Value, json};

    struct TestServer {
        base: String,
        client: reqwest::Client,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl TestServer {
        async fn start() -> Self {
            let params = ModelParams::initialize(
                ModelConfig::tiny(20),
                &FeatureSchema::migraine_default(),
                42,
            )
            .unwrap();
            let service = InferenceService::new(&params, None, InferenceConfig::default()).unwrap();
            let state = AppState::new(service, CorpusStore::open_in_memory().unwrap());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let shutdown = CancellationToken::new();
            let handle = tokio::spawn(serve(listener, state, shutdown.clone()));
            Self {
                base,
                client: reqwest::Client::new(),
                shutdown,
                handle,
            }
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let resp = self
                .client
                .post(format!("{}{path}", self.base))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.client.get(format!("{}{path}", self.base)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.handle.await.unwrap().unwrap();
        }
    }

    fn day(rows: usize) -> Value {
        json!(vec![vec![0.2; 20]; rows])
    }

    #[tokio::test]
    async fn test_health() {
        let server = TestServer::start().await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], true);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_hourly_posterior() {
        let server = TestServer::start().await;
        let (status, body) = server
            .post("/posterior/hourly", json!({"user_id": "u1", "features": day(24)}))
            .await;
        assert_eq!(status, 200);
        let posts = body["hourly_posteriors"].as_array().unwrap();
        assert_eq!(posts.len(), 24);
        assert_eq!(posts[0]["mean"].as_array().unwrap().len(), 4);
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_daily_risk_bounds() {
        let server = TestServer::start().await;
        let (status, body) = server
            .post(
                "/risk/daily",
                json!({"user_id": "u1", "features": day(24), "observed_hours": [0, 1, 2]}),
            )
            .await;
        assert_eq!(status, 200);
        let lower = body["lower_bound"].as_f64().unwrap();
        let mean = body["mean_probability"].as_f64().unwrap();
        let upper = body["upper_bound"].as_f64().unwrap();
        assert!(lower <= mean && mean <= upper);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_policy_topk_default_k() {
        let server = TestServer::start().await;
        let (status, body) = server
            .post("/policy/topk", json!({"user_id": "u1", "features": day(24)}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["k"], 3);
        assert_eq!(body["selected_hours"].as_array().unwrap().len(), 3);
        assert_eq!(body["available_hours"], 24);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_validation_errors_are_400() {
        let server = TestServer::start().await;
        let (status, body) = server
            .post("/risk/daily", json!({"user_id": "u1", "features": day(12)}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "invalid_request");

        let (status, body) = server
            .post("/policy/topk", json!({"user_id": "u1", "features": day(24), "k": 0}))
            .await;
        assert_eq!(status, 400);
        assert!(body["detail"].as_str().unwrap().contains("k must be positive"));

        let (status, _) = server
            .post("/posterior/hourly", json!({"user_id": "u1", "features": "nope"}))
            .await;
        assert_eq!(status, 400);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_feedback_then_accuracy_and_history() {
        let server = TestServer::start().await;
        let (status, body) = server
            .post(
                "/feedback",
                json!({
                    "user_id": "u9",
                    "day": "2026-10-17",
                    "features": day(24),
                    "outcome": true,
                    "predicted_risk": 0.8
                }),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "recorded");

        let (status, acc) = server.get("/user/u9/accuracy?window_days=7").await;
        assert_eq!(status, 200);
        assert_eq!(acc["total"], 1);
        assert_eq!(acc["correct"], 1);
        assert_eq!(acc["window_days"], 7);

        let (status, hist) = server.get("/user/u9/feedback_history").await;
        assert_eq!(status, 200);
        assert_eq!(hist["items"][0]["day"], "2026-10-17");

        let (status, _) = server.get("/user/nobody/feedback_history").await;
        assert_eq!(status, 404);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_feedback_wrong_width_rejected() {
        let server = TestServer::start().await;
        let (status, _) = server
            .post(
                "/feedback",
                json!({
                    "user_id": "u9",
                    "day": "2026-10-17",
                    "features": vec![vec![0.0; 3]; 24],
                    "outcome": false
                }),
            )
            .await;
        assert_eq!(status, 400);
        server.stop().await;
    }
}
