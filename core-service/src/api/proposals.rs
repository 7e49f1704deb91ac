//! Proposal handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::{ApiResult, ApiState};
use crate::logic::error::CoreError;
use crate::logic::policy::PolicyRule;
use crate::logic::store::{Deployment, Proposal, ProposalState};

/// Either free text for the translator or a structured rule, never both.
#[derive(Debug, Deserialize)]
pub struct ProposeRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub rule: Option<PolicyRule>,
    #[serde(default)]
    pub explanation: Option<String>,
}

pub async fn create(
    State(state): State<ApiState>,
    Json(request): Json<ProposeRequest>,
) -> ApiResult<Json<Proposal>> {
    let proposal = match (request.text, request.rule) {
        (Some(text), None) => state.facade.propose_text(text).await?,
        (None, Some(rule)) => state.facade.propose_rule(rule, request.explanation).await?,
        _ => {
            return Err(CoreError::validation(
                "provide exactly one of `text` or `rule`",
            ))
        }
    };
    Ok(Json(proposal))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListFilter {
    #[serde(default)]
    pub state: Option<String>,
}

pub async fn list(
    State(state): State<ApiState>,
    Query(filter): Query<ListFilter>,
) -> ApiResult<Json<Vec<Proposal>>> {
    let wanted = match filter.state.as_deref() {
        Some(text) => Some(
            ProposalState::parse(text)
                .ok_or_else(|| CoreError::validation(format!("unknown state {:?}", text)))?,
        ),
        None => None,
    };
    Ok(Json(state.facade.proposals(wanted).await?))
}

pub async fn get(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Proposal>> {
    Ok(Json(state.facade.proposal(id).await?))
}

pub async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.facade.approve(id).await?))
}

pub async fn reject(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Proposal>> {
    Ok(Json(state.facade.reject(id).await?))
}

pub async fn cancel(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Proposal>> {
    Ok(Json(state.facade.cancel_queued(id).await?))
}
