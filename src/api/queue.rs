//! Queue endpoints: stats and the claim protocol.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::queue::LaneStats;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queue/status", get(queue_status))
        .route("/queue/claim", post(claim))
}

#[derive(Deserialize)]
struct ClaimRequest {
    #[serde(default = "default_lanes")]
    lanes: Vec<String>,
    worker_id: Option<Uuid>,
}

fn default_lanes() -> Vec<String> {
    vec![
        "high".to_string(),
        "default".to_string(),
        "low".to_string(),
    ]
}

async fn queue_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .queue
        .stats()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let map: BTreeMap<String, LaneStats> = stats
        .into_iter()
        .map(|(lane, stats)| (lane.to_string(), stats))
        .collect();
    Ok(Json(map))
}

async fn claim(
    State(state): State<AppState>,
    Json(body): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .dispatcher
        .claim_work(&body.lanes, body.worker_id)
        .await;
    Ok(Json(job))
}
