//! Live collection feeds.
//!
//! Exactly one feed runs per collection however many consumers are
//! interested in it. A feed task owns the remote subscription, reconciles
//! every event it delivers and reconnects with backoff when it fails:
//!
//! ```text
//! Closed -> Opening -> Open -> Error -> Opening -> ... -> Closed (last unsubscribe)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use stowage_engine::CollectionName;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::RemoteError;
use crate::remote::{FeedEvent, RemoteStore};
use crate::tiers::Tiers;

/// Lifecycle of a collection feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedState {
    Closed,
    Opening,
    Open,
    Error,
}

/// One consumer's interest in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    collection: CollectionName,
}

impl SubscriptionHandle {
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

type SharedState = Arc<Mutex<FeedState>>;

struct Feed {
    consumers: HashSet<Uuid>,
    state: SharedState,
    task: JoinHandle<()>,
}

/// Ref-counted registry of collection feeds.
pub struct SubscriptionManager {
    feeds: DashMap<CollectionName, Feed>,
    tiers: Arc<Tiers>,
    remote: Arc<dyn RemoteStore>,
}

impl SubscriptionManager {
    pub(crate) fn new(tiers: Arc<Tiers>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            feeds: DashMap::new(),
            tiers,
            remote,
        }
    }

    /// Start or reuse the feed for `collection`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, collection: &str) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let mut feed = self
            .feeds
            .entry(collection.to_string())
            .or_insert_with(|| self.start(collection));
        feed.consumers.insert(id);
        tracing::debug!(collection, consumers = feed.consumers.len(), "subscribed");

        SubscriptionHandle {
            id,
            collection: collection.to_string(),
        }
    }

    /// Release a handle. The feed stops with its last consumer.
    ///
    /// Returns `false` for a handle that was already released.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let released = self
            .feeds
            .get_mut(&handle.collection)
            .map(|mut feed| feed.consumers.remove(&handle.id))
            .unwrap_or(false);

        let removed = self
            .feeds
            .remove_if(&handle.collection, |_, feed| feed.consumers.is_empty());
        if let Some((collection, feed)) = removed {
            feed.task.abort();
            set_state(&feed.state, FeedState::Closed);
            tracing::info!(%collection, "feed closed");
        }
        released
    }

    pub fn state(&self, collection: &str) -> FeedState {
        self.feeds
            .get(collection)
            .map(|feed| current_state(&feed.state))
            .unwrap_or(FeedState::Closed)
    }

    /// Number of live feeds, whatever their state.
    pub fn active_count(&self) -> usize {
        self.feeds.len()
    }

    pub fn consumers(&self, collection: &str) -> usize {
        self.feeds
            .get(collection)
            .map(|feed| feed.consumers.len())
            .unwrap_or(0)
    }

    /// Stop every feed regardless of consumers.
    pub fn shutdown(&self) {
        let collections: Vec<_> = self.feeds.iter().map(|feed| feed.key().clone()).collect();
        for collection in collections {
            if let Some((_, feed)) = self.feeds.remove(&collection) {
                feed.task.abort();
                set_state(&feed.state, FeedState::Closed);
            }
        }
    }

    fn start(&self, collection: &str) -> Feed {
        let state = Arc::new(Mutex::new(FeedState::Opening));
        let task = tokio::spawn(run_feed(
            collection.to_string(),
            self.tiers.clone(),
            self.remote.clone(),
            state.clone(),
        ));
        tracing::info!(collection, "feed started");
        Feed {
            consumers: HashSet::new(),
            state,
            task,
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for feed in self.feeds.iter() {
            feed.task.abort();
        }
    }
}

fn set_state(state: &SharedState, next: FeedState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

fn current_state(state: &SharedState) -> FeedState {
    *state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feed loop: open, reconcile until the feed fails, back off, reopen.
async fn run_feed(
    collection: CollectionName,
    tiers: Arc<Tiers>,
    remote: Arc<dyn RemoteStore>,
    state: SharedState,
) {
    let policy = tiers.config.retry;
    let mut failures: u32 = 0;

    loop {
        set_state(&state, FeedState::Opening);
        let opened =
            tokio::time::timeout(tiers.config.remote_timeout, remote.subscribe(&collection))
                .await
                .unwrap_or(Err(RemoteError::Timeout));

        let reason = match opened {
            Ok(mut events) => {
                let mut reason = RemoteError::Unavailable("feed closed".to_string());
                while let Some(event) = events.recv().await {
                    match event {
                        FeedEvent::Snapshot(documents) => {
                            let count = documents.len();
                            match tiers.apply_snapshot(&collection, documents).await {
                                Ok(summary) => {
                                    tracing::info!(
                                        %collection,
                                        documents = count,
                                        applied = summary.applied,
                                        kept_local = summary.kept_local,
                                        removed = summary.removed,
                                        "snapshot reconciled"
                                    );
                                }
                                Err(err) => {
                                    tracing::error!(
                                        %collection,
                                        error = %err,
                                        "snapshot reconciliation failed"
                                    );
                                }
                            }
                            set_state(&state, FeedState::Open);
                            tiers.monitor.set_remote_connected(true);
                            failures = 0;
                        }
                        FeedEvent::Changed(documents) => {
                            if let Err(err) = tiers.apply_changes(documents).await {
                                tracing::error!(
                                    %collection,
                                    error = %err,
                                    "change reconciliation failed"
                                );
                            }
                        }
                        FeedEvent::Error(err) => {
                            reason = err;
                            break;
                        }
                    }
                }
                reason
            }
            Err(err) => err,
        };

        set_state(&state, FeedState::Error);
        if reason.is_transient() {
            tiers.monitor.set_remote_connected(false);
        }
        // Reconnects never give up; the ceiling only bounds queue retries.
        failures = failures.saturating_add(1);
        let delay = policy.delay(failures);
        tracing::warn!(
            %collection,
            error = %reason,
            retry_in_ms = delay.as_millis() as u64,
            "feed failed"
        );
        tokio::time::sleep(delay).await;
    }
}
