//! REST API handlers.
//!
//! Each handler delegates to one service and returns JSON responses in the
//! `{success, data, error}` envelope.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use botshard_inject::InjectError;
use botshard_placement::{AssignRequest, PlacementError};
use botshard_state::*;
use botshard_tracker::TrackerError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::InvalidTransition(_) | StateError::CapacityExceeded(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn placement_status(e: &PlacementError) -> StatusCode {
    match e {
        PlacementError::CapacityExhausted(_) | PlacementError::PoolLimitReached { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PlacementError::State(e) => state_status(e),
    }
}

fn tracker_status(e: &TrackerError) -> StatusCode {
    match e {
        TrackerError::RegistrationNotFound(_) | TrackerError::ChannelNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        TrackerError::ChannelUnavailable { .. } => StatusCode::CONFLICT,
        TrackerError::Engine(_) => StatusCode::BAD_GATEWAY,
        TrackerError::State(e) => state_status(e),
    }
}

fn inject_status(e: &InjectError) -> StatusCode {
    match e {
        InjectError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        InjectError::Engine(_) => StatusCode::BAD_GATEWAY,
        InjectError::State(e) => state_status(e),
    }
}

// ── Assignment ─────────────────────────────────────────────────

/// Assign request body. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub region: Option<String>,
    pub agent_type: Option<String>,
    /// `main`, `vip` or `test`; defaults to `main`.
    pub kind: Option<String>,
}

/// POST /api/v1/assign
pub async fn assign_channel(
    State(state): State<ApiState>,
    Json(body): Json<AssignBody>,
) -> impl IntoResponse {
    let kind = match body.kind.as_deref().map(str::parse::<ChannelKind>) {
        None => ChannelKind::Main,
        Some(Ok(kind)) => kind,
        Some(Err(e)) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
    };
    let req = AssignRequest {
        region: body.region,
        agent_type: body.agent_type,
        kind,
    };
    match state.assigner.assign(&req).await {
        Ok(channel) => ApiResponse::ok(serde_json::json!({ "channel": channel })).into_response(),
        Err(e) => error_response(&e.to_string(), placement_status(&e)).into_response(),
    }
}

// ── Channels ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ChannelQuery {
    pub region: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
}

impl ChannelQuery {
    fn to_filter(&self) -> Result<ChannelFilter, String> {
        Ok(ChannelFilter {
            region: self.region.clone(),
            kind: self.kind.as_deref().map(str::parse).transpose()?,
            status: self.status.as_deref().map(str::parse).transpose()?,
        })
    }
}

/// GET /api/v1/channels
pub async fn list_channels(
    State(state): State<ApiState>,
    Query(query): Query<ChannelQuery>,
) -> impl IntoResponse {
    let filter = match query.to_filter() {
        Ok(f) => f,
        Err(e) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
    };
    match state.store.list_channels(&filter) {
        Ok(channels) => ApiResponse::ok(channels).into_response(),
        Err(e) => error_response(&e.to_string(), state_status(&e)).into_response(),
    }
}

/// DELETE /api/v1/channels/{name}/agents
pub async fn remove_agent(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.tracker.remove_agent(&name) {
        Ok(channel) => ApiResponse::ok(channel).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

// ── Registrations ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RegisterBody {
    /// Agent definition passed through to the engine's `create_agent` command.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /api/v1/channels/{name}/registrations
pub async fn register_agent(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<RegisterBody>,
) -> impl IntoResponse {
    match state.tracker.register_agent(&name, body.payload) {
        Ok(reg) => (StatusCode::CREATED, ApiResponse::ok(reg)).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistrationQuery {
    pub status: Option<String>,
}

/// GET /api/v1/channels/{name}/registrations
pub async fn list_registrations(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<RegistrationQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref().map(str::parse::<RegistrationStatus>).transpose() {
        Ok(s) => s,
        Err(e) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
    };
    let filter = RegistrationFilter {
        channel: Some(name),
        status,
    };
    match state.tracker.list(&filter) {
        Ok(regs) => ApiResponse::ok(regs).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

/// GET /api/v1/registrations/{id}
pub async fn get_registration(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.registration(&id) {
        Ok(reg) => ApiResponse::ok(reg).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    pub channel: Option<String>,
}

/// GET /api/v1/queue
pub async fn queue_status(
    State(state): State<ApiState>,
    Query(query): Query<QueueQuery>,
) -> impl IntoResponse {
    match state.tracker.queue_status(query.channel.as_deref()) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

// ── Operations ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct InjectQuery {
    pub max_batch_size: Option<usize>,
}

/// POST /api/v1/admin/channels/{name}/inject
pub async fn inject_channel(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<InjectQuery>,
) -> impl IntoResponse {
    let max = query
        .max_batch_size
        .unwrap_or(state.pipeline.settings().max_batch_size);
    if max == 0 {
        return error_response("max_batch_size must be positive", StatusCode::BAD_REQUEST)
            .into_response();
    }
    match state.pipeline.inject_batch(&name, max).await {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => error_response(&e.to_string(), inject_status(&e)).into_response(),
    }
}

/// POST /api/v1/admin/reconcile
pub async fn reconcile(State(state): State<ApiState>) -> impl IntoResponse {
    match state.tracker.reconcile().await {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryQuery {
    pub max_retries: Option<u32>,
}

/// POST /api/v1/admin/registrations/retry-failed
pub async fn retry_failed(
    State(state): State<ApiState>,
    Query(query): Query<RetryQuery>,
) -> impl IntoResponse {
    let max = query
        .max_retries
        .unwrap_or(state.tracker.settings().max_retries);
    match state.tracker.retry_failed(max) {
        Ok(requeued) => {
            ApiResponse::ok(serde_json::json!({ "requeued": requeued })).into_response()
        }
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub hours: Option<u64>,
}

/// POST /api/v1/admin/registrations/cleanup
pub async fn cleanup(
    State(state): State<ApiState>,
    Query(query): Query<CleanupQuery>,
) -> impl IntoResponse {
    let hours = query
        .hours
        .unwrap_or(state.tracker.settings().cleanup_after_hours);
    match state.tracker.cleanup_older_than(hours) {
        Ok(deleted) => ApiResponse::ok(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

/// POST /api/v1/admin/registrations/clear-stuck
pub async fn clear_stuck(State(state): State<ApiState>) -> impl IntoResponse {
    match state.tracker.clear_stuck() {
        Ok(cleared) => ApiResponse::ok(serde_json::json!({ "cleared": cleared })).into_response(),
        Err(e) => error_response(&e.to_string(), tracker_status(&e)).into_response(),
    }
}

/// GET /api/v1/admin/metrics
///
/// Returns the last published snapshot, collecting one if none exists yet.
pub async fn fleet_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    if let Some(snapshot) = state.metrics.latest().await {
        return ApiResponse::ok(snapshot).into_response();
    }
    match state.metrics.snapshot().await {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolQuery {
    pub region: Option<String>,
}

/// GET /api/v1/admin/pools
pub async fn list_pools(
    State(state): State<ApiState>,
    Query(query): Query<PoolQuery>,
) -> impl IntoResponse {
    match state.provisioner.list_pools(query.region.as_deref()) {
        Ok(pools) => ApiResponse::ok(pools).into_response(),
        Err(e) => error_response(&e.to_string(), placement_status(&e)).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.metrics.collect() {
        Ok(snapshot) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            botshard_metrics::render_prometheus(&snapshot),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
