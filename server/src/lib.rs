//! Stowage data service.
//!
//! A local-first engine in front of a remote document store: reads are
//! answered from an LRU cache and a durable SQLite store, writes apply
//! locally at once and reach the remote through a coalescing sync queue,
//! and live collection feeds reconcile remote changes back into the local
//! tiers by last-writer-wins.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stowage_engine::SystemClock;
//! use stowage_server::{DataService, EngineConfig, MemoryRemote, OfflineStore};
//!
//! # async fn run() -> stowage_server::Result<()> {
//! let clock = Arc::new(SystemClock);
//! let offline = OfflineStore::open("sqlite://stowage.db", clock.clone()).await?;
//! let remote = Arc::new(MemoryRemote::new(clock.clone()));
//! let service = DataService::open(EngineConfig::default(), offline, remote, clock).await?;
//! let _worker = service.spawn_workers();
//!
//! let fields = serde_json::json!({"name": "Ada"});
//! let id = service
//!     .create("clients", fields.as_object().cloned().unwrap_or_default())
//!     .await?;
//! let client = service.get("clients", &id).await?;
//! assert!(client.is_some());
//! # Ok(())
//! # }
//! ```

pub mod config;
mod drain;
pub mod error;
mod events;
mod locks;
pub mod monitor;
pub mod offline;
pub mod remote;
mod routes;
mod service;
mod subscription;
mod tiers;
mod worker;

pub use config::{Config, ConfigError, EngineConfig};
pub use drain::DrainOutcome;
pub use error::{AppError, Error, RemoteError, Result};
pub use events::SyncEvent;
pub use monitor::ConnectionMonitor;
pub use offline::OfflineStore;
pub use remote::{FeedEvent, HttpRemote, MemoryRemote, RemoteStore};
pub use service::DataService;
pub use subscription::{FeedState, SubscriptionHandle, SubscriptionManager};
pub use tiers::ApplySummary;
pub use worker::SyncWorker;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: DataService,
}

/// Build the HTTP application around a running service.
pub fn app(service: DataService) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(AppState { service })
}
