//! Chat endpoints — worker/human message relay.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat/worker-message", post(worker_message))
        .route("/chat/human-response", post(human_response))
        .route("/chat/pending", get(pending))
        .route("/chat/conversation/{external_id}", get(conversation))
}

#[derive(Deserialize)]
struct WorkerMessage {
    external_session_id: String,
    worker_id: Uuid,
    message: String,
    task_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct HumanResponse {
    message_id: Uuid,
    response: String,
}

#[derive(Deserialize)]
struct PendingParams {
    #[serde(default = "default_pending_limit")]
    limit: u32,
}

fn default_pending_limit() -> u32 {
    50
}

async fn worker_message(
    State(state): State<AppState>,
    Json(body): Json<WorkerMessage>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .orchestrator
        .send_worker_message(
            &body.external_session_id,
            body.worker_id,
            &body.message,
            body.task_id,
        )
        .await?;
    Ok(Json(receipt))
}

async fn human_response(
    State(state): State<AppState>,
    Json(body): Json<HumanResponse>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .orchestrator
        .send_human_response(body.message_id, &body.response)
        .await?;
    Ok(Json(receipt))
}

async fn pending(
    State(state): State<AppState>,
    Query(params): Query<PendingParams>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.orchestrator.pending_messages(params.limit).await?;
    Ok(Json(messages))
}

async fn conversation(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.orchestrator.conversation(&external_id).await?;
    Ok(Json(messages))
}
