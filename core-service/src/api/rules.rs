//! Live ruleset handlers

use axum::extract::State;
use axum::Json;

use crate::api::{ApiResult, ApiState};
use crate::logic::backend::ImportResult;
use crate::logic::policy::RenderedRule;

pub async fn list(State(state): State<ApiState>) -> ApiResult<Json<Vec<RenderedRule>>> {
    Ok(Json(state.facade.list_rules().await?))
}

pub async fn import(State(state): State<ApiState>) -> ApiResult<Json<ImportResult>> {
    Ok(Json(state.facade.import_rules().await?))
}
