//! HTTP API: predictions, model management, health checks and Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use predictor_lib::{
    render_metrics, HealthResponse, ModelProvider, PredictionError, PredictionResponse,
    PredictionService, RawPredictionRequest, ReadinessResponse, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PredictionService>,
}

impl AppState {
    pub fn new(service: Arc<PredictionService>) -> Self {
        Self { service }
    }

    pub fn provider(&self) -> &Arc<ModelProvider> {
        self.service.provider()
    }
}

/// Error body for rejected requests
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Body of a successful batch prediction
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub predictions: Vec<PredictionResponse>,
    pub count: usize,
}

/// Prediction failure mapped onto an HTTP response
pub struct ApiError(PredictionError);

impl From<PredictionError> for ApiError {
    fn from(e: PredictionError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ValidationError::Malformed(rejection.body_text()).into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let index = match &err {
            PredictionError::BatchItem { index, .. } => Some(*index),
            _ => None,
        };
        let (error, field) = match err.validation() {
            Some(validation) => (validation.to_string(), validation.field().map(str::to_string)),
            None => ("Prediction failed".to_string(), None),
        };

        if status.is_client_error() {
            warn!(error = %error, field = ?field, index = ?index, "Rejected prediction request");
        }

        (status, Json(ErrorResponse { error, field, index })).into_response()
    }
}

/// Health check - 200 once a model is loaded, 503 before that
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let info = state.provider().get_model_info().await;
    let health = HealthResponse::from_info(&info);

    let status_code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Readiness check - loads the model on first use, then returns 200 if
/// ready, 503 if not ready
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let info = state.provider().get_loaded().await.info;
    let readiness = ReadinessResponse::from_info(&info);

    let status_code = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn predict(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RawPredictionRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let Json(raw) = body?;
    let response = state.service.predict_raw(raw).await?;
    Ok(Json(response))
}

async fn predict_batch(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Vec<serde_json::Value>>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let Json(values) = body?;
    let items = PredictionService::parse_batch(values)?;
    let predictions = state.service.predict_batch(items).await?;
    Ok(Json(BatchResponse {
        count: predictions.len(),
        predictions,
    }))
}

async fn model_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.provider().get_model_info().await)
}

async fn reload_model(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Model reload requested");
    Json(state.provider().reload().await)
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    match render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("failed to encode metrics: {}", e),
        ),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/model/info", get(model_info))
        .route("/model/reload", post(reload_model))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the API server; returns once `shutdown` resolves and in-flight
/// requests have drained
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
