//! Sync queue inspection and control.

use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use stowage_engine::{DeadLetter, QueueItem, SyncStatus};

use crate::error::{AppError, AppResult};
use crate::{AppState, DrainOutcome};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: SyncStatus,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/pending", get(pending))
        .route("/sync/drain", post(drain))
        .route("/sync/status/{collection}/{id}", get(status))
        .route("/sync/dead-letters", get(dead_letters))
        .route(
            "/sync/dead-letters/{collection}/{id}",
            delete(discard_dead_letter),
        )
        .route(
            "/sync/dead-letters/{collection}/{id}/retry",
            post(retry_dead_letter),
        )
}

async fn pending(State(state): State<AppState>) -> Json<Vec<QueueItem>> {
    Json(state.service.pending())
}

/// POST /sync/drain - Drain now and report every outcome.
async fn drain(State(state): State<AppState>) -> Json<Vec<DrainOutcome>> {
    Json(state.service.drain().collect().await)
}

/// GET /sync/status/{collection}/{id}
async fn status(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<Json<StatusResponse>> {
    state
        .service
        .sync_status(&collection, &id)
        .await?
        .map(|status| Json(StatusResponse { status }))
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))
}

async fn dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.service.dead_letters())
}

async fn retry_dead_letter(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<Json<QueueItem>> {
    Ok(Json(state.service.retry_dead_letter(&collection, &id).await?))
}

async fn discard_dead_letter(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<Json<DeadLetter>> {
    Ok(Json(state.service.discard_dead_letter(&collection, &id).await?))
}
