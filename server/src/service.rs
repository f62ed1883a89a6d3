//! The data service façade.
//!
//! Every operation answers from local state. Remote work is queued and
//! performed by [`drain`](DataService::drain), usually from a
//! [`SyncWorker`].

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::BoxStream;
use stowage_engine::{
    Clock, CollectionName, DeadLetter, Document, DocumentId, DocumentKey, Error as EngineError,
    Fields, Mutation, PerformanceMetrics, QueueItem, SyncStatus,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::drain::{self, DrainOutcome};
use crate::error::{RemoteError, Result};
use crate::events::SyncEvent;
use crate::monitor::ConnectionMonitor;
use crate::offline::{OfflineStore, QueueChange};
use crate::remote::RemoteStore;
use crate::subscription::{FeedState, SubscriptionHandle, SubscriptionManager};
use crate::tiers::Tiers;
use crate::worker::SyncWorker;

/// Local-first access to remote collections.
///
/// Cheap to clone; clones share one engine. Construct once per process.
#[derive(Clone)]
pub struct DataService {
    pub(crate) tiers: Arc<Tiers>,
    remote: Arc<dyn RemoteStore>,
    subscriptions: Arc<SubscriptionManager>,
    /// Feeds opened on behalf of reads
    interest: Arc<DashMap<CollectionName, SubscriptionHandle>>,
}

impl DataService {
    /// Build the service over an opened offline store, reloading any
    /// mutations that were pending at the last shutdown.
    pub async fn open(
        config: EngineConfig,
        offline: OfflineStore,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let tiers = Arc::new(Tiers::open(config, offline, clock).await?);
        let subscriptions = Arc::new(SubscriptionManager::new(tiers.clone(), remote.clone()));

        Ok(Self {
            tiers,
            remote,
            subscriptions,
            interest: Arc::new(DashMap::new()),
        })
    }

    /// Create a document under a fresh id and queue it for the remote.
    pub async fn create(&self, collection: &str, payload: Fields) -> Result<DocumentId> {
        let id = Uuid::new_v4().to_string();
        let key = DocumentKey::new(collection, id.clone());
        let _guard = self.tiers.locks.lock(&key).await;

        let version = Document::next_local_version(0, self.tiers.now());
        let document = Document::new(collection, id.clone(), payload, version);
        let mutation = Mutation::create(&document);
        self.tiers.write_local(document, mutation).await?;

        tracing::debug!(%key, "document created");
        Ok(id)
    }

    /// Overwrite the fields named in `patch` and queue an update.
    pub async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Document> {
        let key = DocumentKey::new(collection, id);
        let _guard = self.tiers.locks.lock(&key).await;

        let mut document = self
            .tiers
            .current(&key)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(key.clone()))?;
        if document.deleted {
            return Err(EngineError::OperationOnDeleted(key).into());
        }

        document.apply_patch(&patch, self.tiers.now());
        let mutation = Mutation::update(&document);
        self.tiers.write_local(document.clone(), mutation).await?;
        Ok(document)
    }

    /// Tombstone a document locally and queue a delete.
    ///
    /// Removing an already deleted document does nothing.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let key = DocumentKey::new(collection, id);
        let _guard = self.tiers.locks.lock(&key).await;

        let mut document = self
            .tiers
            .current(&key)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(key.clone()))?;
        if document.deleted {
            return Ok(());
        }

        document.mark_deleted(self.tiers.now());
        document.fields.clear();
        self.tiers
            .write_local(document, Mutation::delete(key))
            .await
    }

    /// Cache, then offline store, then (when online) a one-shot remote fetch.
    ///
    /// Never fails on a read problem: storage and remote errors are logged
    /// and reported as a miss.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.touch(collection);
        let key = DocumentKey::new(collection, id);
        let now = self.tiers.now();

        let (cached, hit) = self.tiers.cache().get(&key, now);
        if hit {
            return Ok(cached.filter(Document::is_active));
        }

        {
            let _guard = self.tiers.locks.lock(&key).await;
            match self.tiers.offline.read(&key).await {
                Ok(Some(document)) => {
                    self.tiers.cache().put(document.clone(), now);
                    return Ok(Some(document).filter(Document::is_active));
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(%key, error = %err, "offline read failed"),
            }
        }

        if !self.tiers.monitor.state().is_online {
            return Ok(None);
        }
        match self.tiers.fetch_through(self.remote.as_ref(), &key).await {
            Ok(document) => Ok(document),
            Err(err) => {
                tracing::warn!(%key, error = %err, "remote fetch failed");
                Ok(None)
            }
        }
    }

    /// Live documents of a collection matching `predicate`, from the offline
    /// store. A snapshot, not a live view.
    pub async fn query<F>(&self, collection: &str, predicate: F) -> Result<Vec<Document>>
    where
        F: Fn(&Document) -> bool,
    {
        self.touch(collection);
        let documents = self.tiers.offline.scan(collection).await?;
        Ok(documents
            .into_iter()
            .filter(|doc| doc.is_active() && predicate(doc))
            .collect())
    }

    /// Read-only snapshot of connection, cache, offline and queue state.
    pub async fn get_performance_metrics(&self) -> Result<PerformanceMetrics> {
        let offline_stats = self.tiers.offline.stats().await?;
        let cache_stats = self.tiers.cache().stats();
        let (queue_size, dead_letters) = {
            let queue = self.tiers.queue();
            (queue.len(), queue.dead_letter_count())
        };

        Ok(PerformanceMetrics::assemble(
            self.tiers.monitor.state(),
            &cache_stats,
            self.subscriptions.active_count(),
            offline_stats,
            queue_size,
            dead_letters,
        ))
    }

    /// Whether the cache holds the key, without counting a lookup.
    pub fn is_cached(&self, collection: &str, id: &str) -> bool {
        self.tiers
            .cache()
            .contains(&DocumentKey::new(collection, id))
    }

    /// Empty the cache. The offline store and the queue are untouched.
    pub fn clear_cache(&self) {
        self.tiers.cache().clear();
        tracing::info!("cache cleared");
    }

    /// Send every due mutation, yielding one outcome per item.
    pub fn drain(&self) -> BoxStream<'static, DrainOutcome> {
        drain::drain(self.tiers.clone(), self.remote.clone())
    }

    /// Pending, failed, or confirmed at the local version; `None` when the
    /// document is unknown.
    pub async fn sync_status(&self, collection: &str, id: &str) -> Result<Option<SyncStatus>> {
        let key = DocumentKey::new(collection, id);
        let queued = self.tiers.queue().status(&key);
        if queued.is_some() {
            return Ok(queued);
        }
        Ok(self
            .tiers
            .current(&key)
            .await?
            .map(|document| SyncStatus::Confirmed {
                version: document.version,
            }))
    }

    pub fn pending(&self) -> Vec<QueueItem> {
        self.tiers.queue().items()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.tiers.queue().dead_letters()
    }

    /// Put a dead-lettered mutation back in the queue with a fresh retry budget.
    pub async fn retry_dead_letter(&self, collection: &str, id: &str) -> Result<QueueItem> {
        let key = DocumentKey::new(collection, id);
        let _guard = self.tiers.locks.lock(&key).await;

        let (item, letter) = {
            let mut queue = self.tiers.queue();
            let letter = queue
                .dead_letter(&key)
                .cloned()
                .ok_or_else(|| EngineError::NotQueued(key.clone()))?;
            (queue.revive(&key, self.tiers.now())?, letter)
        };

        if let Err(err) = self
            .tiers
            .offline
            .commit(None, &[QueueChange::Revive(&item)])
            .await
        {
            let mut queue = self.tiers.queue();
            queue.remove(&key);
            queue.restore_dead_letter(letter);
            return Err(err);
        }

        self.tiers.cache().pin(key.clone());
        tracing::info!(%key, "dead letter requeued");
        self.tiers.wakeup.notify_one();
        Ok(item)
    }

    /// Abandon a dead-lettered mutation.
    ///
    /// The local copy still holds the rejected edit; when online it is reset
    /// to the remote copy (or tombstoned if the remote has none).
    pub async fn discard_dead_letter(&self, collection: &str, id: &str) -> Result<DeadLetter> {
        let key = DocumentKey::new(collection, id);
        let letter = {
            let _guard = self.tiers.locks.lock(&key).await;
            let letter = self
                .tiers
                .queue()
                .dead_letter(&key)
                .cloned()
                .ok_or_else(|| EngineError::NotQueued(key.clone()))?;
            self.tiers
                .offline
                .commit(None, &[QueueChange::Discard(&key)])
                .await?;
            self.tiers.queue().discard_dead_letter(&key);
            letter
        };
        tracing::info!(%key, reason = letter.reason(), "dead letter discarded");

        if self.tiers.monitor.state().is_online {
            if let Err(err) = self.reset_to_remote(&key).await {
                tracing::warn!(%key, error = %err, "could not restore remote copy");
            }
        }
        Ok(letter)
    }

    async fn reset_to_remote(&self, key: &DocumentKey) -> Result<()> {
        let fetched = tokio::time::timeout(
            self.tiers.config.remote_timeout,
            self.remote.fetch_document(&key.collection, &key.id),
        )
        .await
        .unwrap_or(Err(RemoteError::Timeout))?;

        let _guard = self.tiers.locks.lock(key).await;
        if self.tiers.queue().contains(key) {
            // A new local edit arrived meanwhile; it takes over.
            return Ok(());
        }
        let now = self.tiers.now();
        let replacement = match (fetched, self.tiers.offline.read(key).await?) {
            (Some(remote), _) => remote,
            (None, Some(local)) if !local.deleted => {
                let mut tombstone = local;
                tombstone.mark_deleted(now);
                tombstone.fields.clear();
                tombstone
            }
            (None, _) => return Ok(()),
        };

        self.tiers.offline.write(&replacement).await?;
        self.tiers.cache().refresh(replacement, now);
        Ok(())
    }

    /// Start or reuse the live feed for a collection.
    pub fn subscribe(&self, collection: &str) -> SubscriptionHandle {
        self.subscriptions.subscribe(collection)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle)
    }

    pub fn subscription_state(&self, collection: &str) -> FeedState {
        self.subscriptions.state(collection)
    }

    /// Receive sync lifecycle events, e.g. to surface dead letters to callers.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.tiers.events()
    }

    pub fn connection(&self) -> &ConnectionMonitor {
        &self.tiers.monitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.tiers.config
    }

    /// Ping the remote and record the result. Skipped while offline.
    pub async fn check_remote(&self) -> bool {
        if !self.tiers.monitor.state().is_online {
            return false;
        }
        let reachable = tokio::time::timeout(self.tiers.config.remote_timeout, self.remote.ping())
            .await
            .map(|pinged| pinged.is_ok())
            .unwrap_or(false);
        self.tiers.monitor.set_remote_connected(reachable);
        reachable
    }

    /// Purge tombstones older than the retention period.
    pub async fn collect_garbage(&self) -> Result<u64> {
        let retention = self.tiers.config.tombstone_retention.as_millis() as u64;
        let cutoff = self.tiers.now().saturating_sub(retention);
        let purged = self.tiers.offline.purge_tombstones(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "tombstones purged");
        }
        Ok(purged)
    }

    /// Spawn the background drain, heartbeat and garbage collection loop.
    pub fn spawn_workers(&self) -> SyncWorker {
        SyncWorker::spawn(self.clone())
    }

    /// Close every feed.
    pub fn shutdown(&self) {
        self.interest.clear();
        self.subscriptions.shutdown();
    }

    /// Keep a feed open for collections that are being read.
    fn touch(&self, collection: &str) {
        if !self.tiers.config.auto_subscribe || self.interest.contains_key(collection) {
            return;
        }
        self.interest
            .entry(collection.to_string())
            .or_insert_with(|| self.subscriptions.subscribe(collection));
    }
}
