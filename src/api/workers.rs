//! Worker registry endpoints.

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
use crate::model::WorkerStatus;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workers", get(list_workers).post(register_worker))
        .route("/workers/{id}", get(get_worker).delete(deregister_worker))
        .route("/workers/{id}/heartbeat", post(heartbeat))
}

#[derive(Deserialize)]
struct RegisterWorker {
    name: String,
}

#[derive(Deserialize)]
struct ListParams {
    status: Option<WorkerStatus>,
}

#[derive(Deserialize)]
struct Heartbeat {
    status: WorkerStatus,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(body): Json<RegisterWorker>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.dispatcher.register_worker(&body.name).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn list_workers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let workers = state.dispatcher.list_workers(params.status).await?;
    Ok(Json(workers))
}

async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.dispatcher.get_worker(id).await?;
    Ok(Json(worker))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Heartbeat>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.dispatcher.worker_heartbeat(id, body.status).await?;
    Ok(Json(worker))
}

async fn deregister_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.dispatcher.deregister_worker(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
