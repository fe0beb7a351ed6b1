use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::api::latency::{CycleLatency, LatencyStats};
use crate::config::MAX_BACKFILL_DAYS;
use crate::error::AppError;
use crate::scheduler::{SchedulerHandle, SchedulerState, TriggerReply};
use crate::types::{CycleOutcome, CycleResult, Trigger};

#[derive(Clone)]
pub struct ApiState {
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub scheduler: SchedulerHandle,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/cycles/latest", get(get_latest_cycle))
        .route("/stats/latency", get(get_stats_latency))
        .route("/trigger", post(post_trigger))
        .route("/backfill", post(post_backfill))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BackfillQuery {
    pub days: Option<u32>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler_state: SchedulerState,
    pub interval_secs: u64,
    pub cycles_completed: u64,
    pub ticks_suppressed: u64,
    pub last_cycle_at: Option<i64>,
}

#[derive(Serialize)]
pub struct CycleResponse {
    pub outcome: CycleOutcome,
    #[serde(flatten)]
    pub result: CycleResult,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    pub trigger: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let h = &state.health;
    Json(HealthResponse {
        status: "ok",
        scheduler_state: h.state(),
        interval_secs: h.interval_secs(),
        cycles_completed: h.cycles_completed(),
        ticks_suppressed: h.ticks_suppressed(),
        last_cycle_at: h.last_cycle_at(),
    })
}

async fn get_latest_cycle(State(state): State<ApiState>) -> Response {
    match state.health.last_result() {
        Some(result) => Json(CycleResponse { outcome: result.outcome(), result }).into_response(),
        None => (StatusCode::NOT_FOUND, "no cycle has completed yet").into_response(),
    }
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<CycleLatency> {
    Json(state.latency.summary())
}

async fn post_trigger(State(state): State<ApiState>) -> Result<Response, AppError> {
    dispatch(&state, Trigger::Manual).await
}

async fn post_backfill(
    State(state): State<ApiState>,
    Query(params): Query<BackfillQuery>,
) -> Result<Response, AppError> {
    let days = params.days.unwrap_or(7);
    if days == 0 || days > MAX_BACKFILL_DAYS {
        return Err(AppError::InvalidRequest(format!(
            "days must be between 1 and {MAX_BACKFILL_DAYS}, got {days}"
        )));
    }
    dispatch(&state, Trigger::Backfill { days }).await
}

async fn dispatch(state: &ApiState, trigger: Trigger) -> Result<Response, AppError> {
    let (status, label) = match state.scheduler.trigger(trigger).await? {
        TriggerReply::Started => (StatusCode::ACCEPTED, "started"),
        TriggerReply::Busy => (StatusCode::CONFLICT, "cycle already running"),
    };
    let body = TriggerResponse { status: label, trigger: trigger.to_string() };
    Ok((status, Json(body)).into_response())
}
