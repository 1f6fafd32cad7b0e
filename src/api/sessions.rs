//! Session endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::model::SessionStatus;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{external_id}/heartbeat", post(heartbeat))
        .route("/sessions/{external_id}/terminate", post(terminate))
}

#[derive(Deserialize)]
struct CreateSession {
    external_id: String,
    worker_id: Uuid,
    task_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct ListParams {
    status: Option<SessionStatus>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSession>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .get_or_create(&body.external_id, body.worker_id, body.task_id)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.sessions.list(params.status).await?;
    Ok(Json(sessions))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.heartbeat(&external_id).await?;
    Ok(Json(session))
}

async fn terminate(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.terminate(&external_id).await?;
    Ok(Json(session))
}
