//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use stowage_engine::ConnectionHealth;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connection: ConnectionHealth,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let connection = state.service.connection().state();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connection: connection.health(),
        last_sync: connection
            .last_sync_time
            .and_then(|millis| i64::try_from(millis).ok())
            .and_then(DateTime::from_timestamp_millis),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Stowage Data Service"
}
