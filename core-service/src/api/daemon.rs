//! Daemon control handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{ApiResult, ApiState};
use crate::logic::autonomy::AutonomyLevel;
use crate::logic::facade::DaemonStatus;

pub async fn status(State(state): State<ApiState>) -> ApiResult<Json<DaemonStatus>> {
    Ok(Json(state.facade.daemon_status().await?))
}

#[derive(Debug, Deserialize)]
pub struct LevelRequest {
    pub level: AutonomyLevel,
}

#[derive(Debug, Serialize)]
pub struct LevelResponse {
    pub level: AutonomyLevel,
}

pub async fn set_level(
    State(state): State<ApiState>,
    Json(request): Json<LevelRequest>,
) -> ApiResult<Json<LevelResponse>> {
    state.facade.autonomy_set_level(request.level).await?;
    Ok(Json(LevelResponse { level: request.level }))
}

#[derive(Debug, Deserialize)]
pub struct NeverBlockRequest {
    pub entry: String,
}

#[derive(Debug, Serialize)]
pub struct NeverBlockResponse {
    pub entry: String,
    pub changed: bool,
}

pub async fn never_block_add(
    State(state): State<ApiState>,
    Json(request): Json<NeverBlockRequest>,
) -> ApiResult<Json<NeverBlockResponse>> {
    let entry = state.facade.never_block_add(&request.entry).await?;
    Ok(Json(NeverBlockResponse { entry: entry.display(), changed: true }))
}

pub async fn never_block_remove(
    State(state): State<ApiState>,
    Json(request): Json<NeverBlockRequest>,
) -> ApiResult<Json<NeverBlockResponse>> {
    let changed = state.facade.never_block_remove(&request.entry).await?;
    Ok(Json(NeverBlockResponse { entry: request.entry, changed }))
}

/// Inbound heartbeat witness: an external prober reached us through the
/// live ruleset.
pub async fn probe(State(state): State<ApiState>) -> StatusCode {
    state.facade.probe_witness();
    StatusCode::NO_CONTENT
}
