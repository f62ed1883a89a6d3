//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use stowage_engine::{Fields, ManualClock, RetryPolicy};
use stowage_server::{DataService, DrainOutcome, EngineConfig, MemoryRemote, OfflineStore};

/// Start of the manual clock, in ms.
pub const START: u64 = 1_000_000;

pub struct Harness {
    pub service: DataService,
    pub offline: OfflineStore,
    pub remote: Arc<MemoryRemote>,
    pub clock: Arc<ManualClock>,
}

/// Deterministic engine settings: no implicit feeds, short backoff.
pub fn config() -> EngineConfig {
    EngineConfig {
        cache_capacity: 100,
        retry: RetryPolicy::new(100, 2, 1_000, 3),
        remote_timeout: Duration::from_secs(2),
        auto_subscribe: false,
        ..EngineConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(config()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(START));
    let offline = OfflineStore::in_memory(clock.clone()).await.unwrap();
    let remote = Arc::new(MemoryRemote::new(clock.clone()));
    let service = DataService::open(config, offline.clone(), remote.clone(), clock.clone())
        .await
        .unwrap();
    Harness {
        service,
        offline,
        remote,
        clock,
    }
}

impl Harness {
    pub fn go_online(&self) {
        let connection = self.service.connection();
        connection.set_online(true);
        connection.set_remote_connected(true);
    }

    pub fn go_offline(&self) {
        let connection = self.service.connection();
        connection.set_online(false);
        connection.set_remote_connected(false);
    }

    pub async fn drain(&self) -> Vec<DrainOutcome> {
        self.service.drain().collect().await
    }
}

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
