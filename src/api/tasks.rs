//! Task endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::dispatch::NewTask;
use crate::model::TaskStatus;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
}

#[derive(Deserialize)]
struct ListParams {
    status: Option<TaskStatus>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    100
}

async fn create_task(
    State(state): State<AppState>,
    Json(new): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    let (task, _order) = state.dispatcher.create_task(new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state
        .dispatcher
        .list_tasks(params.status, params.limit, params.offset)
        .await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.dispatcher.get_task(id).await?;
    Ok(Json(task))
}

#[derive(Deserialize)]
struct TaskUpdate {
    status: TaskStatus,
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<TaskUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.dispatcher.update_task_status(id, update.status).await?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.dispatcher.delete_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
