//! HTTP control-plane API — thin axum routers over the services.

mod chat;
mod queue;
mod sessions;
mod tasks;
mod workers;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;

use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, OrchestratorError};
use crate::orchestrator::Orchestrator;
use crate::queue::QueueManager;
use crate::session::SessionRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<SessionRegistry>,
    pub queue: Arc<QueueManager>,
}

/// API-facing error: not-found and validation failures surface with their
/// status; everything else is a 500 with the detail logged server-side.
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Self::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::TaskNotFound(_)
            | DispatchError::WorkOrderNotFound(_)
            | DispatchError::WorkerNotFound(_) => Self::NotFound(e.to_string()),
            DispatchError::Database(_) | DispatchError::Queue(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::MessageNotFound(_) | OrchestratorError::SessionNotFound(_) => {
                Self::NotFound(e.to_string())
            }
            OrchestratorError::Database(_) | OrchestratorError::Queue(_) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

/// Build the full application router.
pub fn app_router(state: AppState) -> Router {
    let v1 = Router::new()
        .merge(tasks::routes())
        .merge(workers::routes())
        .merge(sessions::routes())
        .merge(queue::routes())
        .merge(chat::routes());

    Router::new()
        .route("/health", get(health))
        .route("/about", get(about))
        .nest("/api/v1", v1)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "foreman"
    }))
}

async fn about() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "foreman",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Task distribution and worker/human message relay",
    }))
}
