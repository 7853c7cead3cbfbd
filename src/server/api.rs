//! HTTP API.
//!
//! - POST /v1/route
//! - GET /health, GET /health/{tier}
//! - POST /jobs, GET /jobs/{job_id}, GET /jobs/{job_id}/result
//! - GET /v1/tiers, GET /v1/cache/stats
//! - GET /events (SSE), GET /metrics
//! - POST /admin/distill, POST /admin/tiers/{tier}/health, POST /admin/tiers/{tier}/rollback

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::ServingStack;
use crate::cache::manager::CacheStats;
use crate::distill::DistillationError;
use crate::error::ServingError;
use crate::inference::speculative::SpeculativeReport;
use crate::jobs::JobOutcome;
use crate::predictor::PredictorStats;
use crate::registry::descriptor::{AdapterRef, HealthState, TierId};
use crate::registry::{HealthReport, RegistrySnapshot};
use crate::router::envelope::{ResponseEnvelope, RouteRequest};
use crate::server::streaming::events_to_sse_stream;

pub type AppState = Arc<ServingStack>;

/// Build the axum router with all API routes.
pub fn build_router(state: AppState) -> Router {
    let limit = state.config.server.max_concurrent_requests.max(1);
    Router::new()
        .route("/v1/route", post(route))
        .route("/health", get(health))
        .route("/health/{tier}", get(tier_health))
        .route("/jobs", post(submit_job))
        .route("/jobs/{job_id}", get(poll_job))
        .route("/jobs/{job_id}/result", get(job_result))
        .route("/v1/tiers", get(tiers))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/events", get(events))
        .route("/metrics", get(metrics))
        .route("/admin/distill", post(run_distillation))
        .route("/admin/tiers/{tier}/health", post(override_health))
        .route("/admin/tiers/{tier}/rollback", post(rollback))
        .layer(GlobalConcurrencyLimitLayer::new(limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Serving(ServingError),
    Distillation(DistillationError),
    UnknownTier(String),
}

impl From<ServingError> for ApiError {
    fn from(e: ServingError) -> Self {
        ApiError::Serving(e)
    }
}

impl From<DistillationError> for ApiError {
    fn from(e: DistillationError) -> Self {
        ApiError::Distillation(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Serving(e) => {
                let status = match &e {
                    ServingError::JobNotFound(_) => StatusCode::NOT_FOUND,
                    ServingError::JobFailed { .. } | ServingError::JobTimedOut { .. } => {
                        StatusCode::CONFLICT
                    }
                    ServingError::TierUnavailable(_) | ServingError::AllTiersExhausted { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    ServingError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let retry_after_ms = match &e {
                    ServingError::JobFailed { retry_after_ms, .. }
                    | ServingError::JobTimedOut { retry_after_ms, .. } => Some(*retry_after_ms),
                    _ => None,
                };
                (
                    status,
                    ErrorBody {
                        error: e.code(),
                        message: e.to_string(),
                        retry_after_ms,
                    },
                )
            }
            ApiError::Distillation(e) => {
                let (status, code) = match &e {
                    DistillationError::AlreadyRunning => (StatusCode::CONFLICT, "already_running"),
                    DistillationError::NothingToRollBack(_) => {
                        (StatusCode::CONFLICT, "nothing_to_roll_back")
                    }
                    DistillationError::Registry(_) => (StatusCode::CONFLICT, "promotion_conflict"),
                    DistillationError::Training { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "training_failed")
                    }
                    DistillationError::Archive(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "archive_failed")
                    }
                };
                (
                    status,
                    ErrorBody {
                        error: code,
                        message: e.to_string(),
                        retry_after_ms: None,
                    },
                )
            }
            ApiError::UnknownTier(message) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: "unknown_tier",
                    message,
                    retry_after_ms: None,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_tier(raw: &str) -> Result<TierId, ApiError> {
    raw.parse().map_err(ApiError::UnknownTier)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub prompt: String,
    pub dedupe_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct OverallHealth {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub registry_version: u64,
    pub gold: HealthReport,
    pub silver: HealthReport,
    pub bronze: HealthReport,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub gold: CacheStats,
    pub silver: CacheStats,
    pub speculative: SpeculativeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictor: Option<PredictorStats>,
}

#[derive(Debug, Deserialize)]
pub struct HealthOverrideRequest {
    /// `null` clears the override.
    pub status: Option<HealthState>,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub tier: TierId,
    pub model_ref: AdapterRef,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn route(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Json<ResponseEnvelope> {
    let envelope = req.into_envelope(state.router.default_deadline());
    Json(state.router.route(envelope).await)
}

async fn health(State(state): State<AppState>) -> Json<OverallHealth> {
    let registry = &state.registry;
    let all_healthy = TierId::ALL
        .iter()
        .all(|&t| registry.health(t) == HealthState::Healthy);
    Json(OverallHealth {
        status: if all_healthy { "ok" } else { "degraded" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        registry_version: registry.snapshot().version,
        gold: registry.health_report(TierId::Gold),
        silver: registry.health_report(TierId::Silver),
        bronze: registry.health_report(TierId::Bronze),
    })
}

async fn tier_health(
    State(state): State<AppState>,
    Path(tier): Path<String>,
) -> Result<Json<HealthReport>, ApiError> {
    let tier = parse_tier(&tier)?;
    Ok(Json(state.registry.health_report(tier)))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> (StatusCode, Json<SubmitJobResponse>) {
    let job_id = state.jobs.submit(req.prompt, req.dedupe_key);
    (StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id }))
}

async fn poll_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .jobs
        .poll(&job_id)
        .ok_or(ServingError::JobNotFound(job_id))?;
    Ok(Json(job).into_response())
}

async fn job_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let response = match state.jobs.retrieve(&job_id)? {
        JobOutcome::Succeeded(result) => {
            (StatusCode::OK, Json(json!({ "job_id": job_id, "result": result }))).into_response()
        }
        JobOutcome::InProgress(status) => (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id, "status": status })),
        )
            .into_response(),
    };
    Ok(response)
}

async fn tiers(State(state): State<AppState>) -> Json<RegistrySnapshot> {
    Json(RegistrySnapshot::clone(&state.registry.snapshot()))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        gold: state.gold_cache.stats(),
        silver: state.silver_cache.stats(),
        speculative: state.gold.decoder().report(),
        predictor: state.predictor.as_ref().map(|p| p.stats()),
    })
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let stream = events_to_sse_stream(state.events.subscribe());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn run_distillation(State(state): State<AppState>) -> Result<Response, ApiError> {
    info!("Manual distillation run requested");
    let report = state.pipeline.run_once().await?;
    Ok(Json(report).into_response())
}

async fn override_health(
    State(state): State<AppState>,
    Path(tier): Path<String>,
    Json(req): Json<HealthOverrideRequest>,
) -> Result<Json<HealthReport>, ApiError> {
    let tier = parse_tier(&tier)?;
    info!(tier = %tier, status = ?req.status, "Health override");
    state.registry.override_health(tier, req.status);
    Ok(Json(state.registry.health_report(tier)))
}

async fn rollback(
    State(state): State<AppState>,
    Path(tier): Path<String>,
) -> Result<Json<RollbackResponse>, ApiError> {
    let tier = parse_tier(&tier)?;
    let model_ref = state.pipeline.rollback(tier, "manual rollback")?;
    Ok(Json(RollbackResponse { tier, model_ref }))
}
