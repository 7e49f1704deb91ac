//! Facade RPC surface
//!
//! Local-only HTTP + JSON over axum. Every route is a thin shim over the
//! facade; no handler touches the store or an adapter directly. Errors map
//! the core taxonomy onto HTTP statuses with a structured body.

pub mod daemon;
pub mod deployments;
pub mod events;
pub mod proposals;
pub mod rules;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

use crate::logic::error::{AdapterErrorKind, CoreError, CoreErrorKind, CoreResult};
use crate::logic::facade::Facade;
use crate::logic::Shutdown;

#[derive(Clone)]
pub struct ApiState {
    pub facade: Arc<Facade>,
}

pub type ApiResult<T> = Result<T, CoreError>;

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match self.class() {
            CoreErrorKind::Validation => StatusCode::BAD_REQUEST,
            CoreErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
            CoreErrorKind::NotFound => StatusCode::NOT_FOUND,
            CoreErrorKind::Concurrency => StatusCode::CONFLICT,
            CoreErrorKind::HeartbeatMiss => StatusCode::CONFLICT,
            CoreErrorKind::Adapter(kind) => match kind {
                AdapterErrorKind::Syntax => StatusCode::BAD_REQUEST,
                AdapterErrorKind::Coexistence => StatusCode::CONFLICT,
                AdapterErrorKind::Unavailable | AdapterErrorKind::Transient => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                AdapterErrorKind::Permission | AdapterErrorKind::System => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            CoreErrorKind::Integrity | CoreErrorKind::Catastrophic => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            log::error!("api error: {}", self);
        }
        // correlation_id locates the audit rows of this failing attempt
        let body = Json(json!({
            "error": self.message(),
            "kind": self.kind(),
            "correlation_id": self.correlation_id(),
        }));
        (status, body).into_response()
    }
}

/// Build the full router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/proposals", post(proposals::create).get(proposals::list))
        .route("/api/v1/proposals/:id", get(proposals::get))
        .route("/api/v1/proposals/:id/approve", post(proposals::approve))
        .route("/api/v1/proposals/:id/reject", post(proposals::reject))
        .route("/api/v1/proposals/:id/cancel", post(proposals::cancel))
        .route("/api/v1/deployments/:id", get(deployments::get))
        .route("/api/v1/deployments/:id/commit", post(deployments::commit))
        .route("/api/v1/deployments/:id/rollback", post(deployments::rollback))
        .route("/api/v1/rules", get(rules::list))
        .route("/api/v1/rules/import", post(rules::import))
        .route("/api/v1/events", get(events::stream))
        .route("/api/v1/status", get(daemon::status))
        .route("/api/v1/autonomy/level", put(daemon::set_level))
        .route(
            "/api/v1/never-block",
            post(daemon::never_block_add).delete(daemon::never_block_remove),
        )
        .route("/api/v1/probe", post(daemon::probe))
        .with_state(state)
}

/// Serve until the shutdown channel fires.
pub async fn serve(facade: Arc<Facade>, shutdown: Arc<Shutdown>) -> CoreResult<()> {
    let listen = facade.config().api.listen.clone();
    let app = create_router(ApiState { facade });
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| CoreError::integrity(format!("api bind {}: {}", listen, e)))?;
    log::info!("facade API listening on http://{}", listen);

    let mut stop = shutdown.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.changed().await;
        })
        .await
        .map_err(|e| CoreError::integrity(format!("api serve: {}", e)))
}
