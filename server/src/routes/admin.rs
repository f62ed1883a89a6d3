//! Operational dashboard: metrics, cache administration and connectivity.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use stowage_engine::{ConnectionMetrics, PerformanceMetrics};

use crate::error::AppResult;
use crate::AppState;

/// Body of `PUT /connection`.
#[derive(Debug, Deserialize)]
pub struct ConnectionUpdate {
    pub online: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/cache/clear", post(clear_cache))
        .route("/connection", get(connection).put(set_connection))
}

/// GET /metrics - Polled by the dashboard; no side effects.
async fn metrics(State(state): State<AppState>) -> AppResult<Json<PerformanceMetrics>> {
    Ok(Json(state.service.get_performance_metrics().await?))
}

/// POST /cache/clear
async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.service.clear_cache();
    StatusCode::NO_CONTENT
}

async fn connection(State(state): State<AppState>) -> Json<ConnectionMetrics> {
    Json(state.service.connection().state().into())
}

/// PUT /connection - The host reports device network reachability.
async fn set_connection(
    State(state): State<AppState>,
    Json(update): Json<ConnectionUpdate>,
) -> Json<ConnectionMetrics> {
    let monitor = state.service.connection();
    monitor.set_online(update.online);
    if update.online {
        state.service.check_remote().await;
    } else {
        monitor.set_remote_connected(false);
    }
    Json(monitor.state().into())
}
