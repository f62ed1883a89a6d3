//! HTTP route definitions.

mod admin;
mod collections;
mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(admin::routes())
        .merge(collections::routes())
        .merge(sync::routes())
}
