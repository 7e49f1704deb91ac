//! Deployment handlers

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::api::{ApiResult, ApiState};
use crate::logic::store::Deployment;

pub async fn get(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.facade.deployment(id).await?))
}

pub async fn commit(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.facade.commit(id).await?))
}

pub async fn rollback(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.facade.rollback(id).await?))
}
