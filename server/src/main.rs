//! Stowage Server - local-first data service with an operational dashboard.
//!
//! Serves the data service over HTTP and keeps its sync queue draining in
//! the background.

use std::sync::Arc;

use stowage_engine::{Clock, SystemClock};
use stowage_server::{Config, DataService, HttpRemote, MemoryRemote, OfflineStore, RemoteStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stowage_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Stowage Server on {}:{}", config.host, config.port);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    tracing::info!("Opening offline store at {}", config.database_url);
    let offline = OfflineStore::open(&config.database_url, clock.clone()).await?;

    let remote: Arc<dyn RemoteStore> = match &config.remote_url {
        Some(url) => {
            tracing::info!("Using remote document API at {}", url);
            Arc::new(HttpRemote::new(
                url,
                config.engine.remote_timeout,
                config.engine.poll_interval,
            )?)
        }
        None => {
            tracing::warn!("REMOTE_URL not set, using an in-process remote store");
            Arc::new(MemoryRemote::new(clock.clone()))
        }
    };

    let service = DataService::open(config.engine.clone(), offline, remote, clock).await?;
    let worker = service.spawn_workers();

    let app = stowage_server::app(service.clone());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    service.shutdown();
    worker.shutdown().await;

    Ok(())
}
