//! The local tiers and the rules that keep them in step.
//!
//! [`Tiers`] owns the cache, the offline store and the sync queue. Every
//! change to a key goes through that key's lock and lands in the offline
//! store first, so the cache never holds something the store lacks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stowage_engine::{
    reconcile, CacheLayer, Clock, Document, DocumentKey, EnqueueOutcome, Mutation, Precedence,
    SyncQueue, Timestamp,
};
use tokio::sync::{broadcast, Notify};

use crate::config::EngineConfig;
use crate::error::{RemoteError, Result};
use crate::events::SyncEvent;
use crate::locks::KeyLocks;
use crate::monitor::ConnectionMonitor;
use crate::offline::{OfflineStore, QueueChange};
use crate::remote::RemoteStore;

/// Counts from reconciling a batch of remote documents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub kept_local: usize,
    pub stale: usize,
    /// Local documents tombstoned because a full snapshot lacked them
    pub removed: usize,
}

pub(crate) struct Tiers {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) offline: OfflineStore,
    pub(crate) monitor: ConnectionMonitor,
    pub(crate) locks: KeyLocks,
    /// Wakes the sync worker after an enqueue
    pub(crate) wakeup: Notify,
    /// One drain at a time
    pub(crate) drain_lock: Arc<tokio::sync::Mutex<()>>,
    cache: Mutex<CacheLayer>,
    queue: Mutex<SyncQueue>,
    events: broadcast::Sender<SyncEvent>,
}

impl Tiers {
    /// Build the tiers, reloading the persisted queue.
    pub(crate) async fn open(
        config: EngineConfig,
        offline: OfflineStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (items, letters) = offline.load_queue().await?;

        let mut cache = CacheLayer::new(config.cache_capacity, config.hit_rate_window);
        let mut queue = SyncQueue::new();
        for item in items {
            cache.pin(item.key.clone());
            queue.restore(item);
        }
        for letter in letters {
            queue.restore_dead_letter(letter);
        }
        if !queue.is_empty() || queue.dead_letter_count() > 0 {
            tracing::info!(
                pending = queue.len(),
                dead_letters = queue.dead_letter_count(),
                "restored sync queue"
            );
        }

        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            config,
            clock,
            offline,
            monitor: ConnectionMonitor::default(),
            locks: KeyLocks::new(),
            wakeup: Notify::new(),
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
            cache: Mutex::new(cache),
            queue: Mutex::new(queue),
            events,
        })
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, CacheLayer> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn queue(&self) -> MutexGuard<'_, SyncQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Freshest local copy, tombstones included, without touching hit stats.
    pub(crate) async fn current(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let cached = self.cache().peek(key).map(|entry| entry.document.clone());
        if cached.is_some() {
            return Ok(cached);
        }
        self.offline.read(key).await
    }

    /// Persist an optimistic local write and queue its mutation.
    ///
    /// The caller holds the key's lock. On a storage failure the in-memory
    /// queue is rolled back and nothing is cached.
    pub(crate) async fn write_local(&self, document: Document, mutation: Mutation) -> Result<()> {
        let key = document.key();
        let now = self.now();

        let (outcome, previous, previous_letter) = {
            let mut queue = self.queue();
            let previous = queue.get(&key).cloned();
            let previous_letter = queue.dead_letter(&key).cloned();
            (queue.enqueue(mutation, now), previous, previous_letter)
        };

        let persisted = match &outcome {
            EnqueueOutcome::Queued(item) | EnqueueOutcome::Coalesced(item) => {
                self.offline
                    .commit(
                        Some(&document),
                        &[QueueChange::Discard(&key), QueueChange::Save(item)],
                    )
                    .await
            }
            EnqueueOutcome::Cancelled(key) => {
                self.offline
                    .commit(Some(&document), &[QueueChange::Remove(key)])
                    .await
            }
        };

        if let Err(err) = persisted {
            let mut queue = self.queue();
            queue.remove(&key);
            if let Some(previous) = previous {
                queue.restore(previous);
            }
            if let Some(letter) = previous_letter {
                queue.restore_dead_letter(letter);
            }
            tracing::error!(%key, error = %err, "local write failed");
            return Err(err);
        }

        {
            let mut cache = self.cache();
            match outcome {
                EnqueueOutcome::Cancelled(_) => cache.unpin(&key),
                _ => cache.pin(key.clone()),
            }
            cache.put(document, now);
        }

        tracing::debug!(%key, pending = self.queue().len(), "local write queued");
        self.wakeup.notify_one();
        Ok(())
    }

    /// Reconcile one remote document against the local tiers.
    pub(crate) async fn apply_remote(&self, remote: Document) -> Result<Precedence> {
        let key = remote.key();
        let _guard = self.locks.lock(&key).await;

        let local = self.offline.read(&key).await?;
        let pending = self.queue().get(&key).cloned();
        let resolution = reconcile::resolve(&remote, local.as_ref(), pending.as_ref());

        if !resolution.applies_remote() {
            tracing::debug!(%key, precedence = ?resolution.precedence, "remote change not applied");
            return Ok(resolution.precedence);
        }

        if resolution.discard_pending {
            self.offline
                .commit(Some(&remote), &[QueueChange::Remove(&key)])
                .await?;
            self.queue().remove(&key);
            self.cache().unpin(&key);
            tracing::info!(
                %key,
                version = remote.version,
                "newer remote copy superseded local edit"
            );
            self.emit(SyncEvent::Superseded {
                key: key.clone(),
                remote_version: remote.version,
            });
        } else {
            self.offline.write(&remote).await?;
        }

        let (version, deleted) = (remote.version, remote.deleted);
        self.cache().refresh(remote, self.now());
        self.emit(SyncEvent::RemoteApplied {
            key,
            version,
            deleted,
        });
        Ok(Precedence::ApplyRemote)
    }

    /// Reconcile a batch of incremental changes, in arrival order.
    pub(crate) async fn apply_changes(&self, documents: Vec<Document>) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        for document in documents {
            summary.count(self.apply_remote(document).await?);
        }
        Ok(summary)
    }

    /// Reconcile a full snapshot of a collection.
    ///
    /// Local documents the snapshot lacks were deleted remotely and become
    /// tombstones at their local version, unless a local mutation is still
    /// pending for them or they were confirmed after the snapshot was taken.
    pub(crate) async fn apply_snapshot(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<ApplySummary> {
        let present: HashSet<String> = documents.iter().map(|doc| doc.id.clone()).collect();
        let newest = documents.iter().map(|doc| doc.version).max();
        let mut summary = self.apply_changes(documents).await?;

        for local in self.offline.scan(collection).await? {
            if local.deleted || present.contains(&local.id) {
                continue;
            }
            let key = local.key();
            let _guard = self.locks.lock(&key).await;

            let Some(current) = self.offline.read(&key).await? else {
                continue;
            };
            let pending = self.queue().get(&key).cloned();
            let Some(tombstone) = reconcile::resolve_absent(&current, pending.as_ref(), newest)
            else {
                continue;
            };
            let now = self.now();

            self.offline.write(&tombstone).await?;
            let version = tombstone.version;
            self.cache().refresh(tombstone, now);
            self.emit(SyncEvent::RemoteApplied {
                key,
                version,
                deleted: true,
            });
            summary.removed += 1;
        }

        self.monitor.mark_synced(self.now());
        Ok(summary)
    }

    /// One-shot remote fetch that populates both tiers.
    ///
    /// Returns the live local copy after reconciliation.
    pub(crate) async fn fetch_through(
        &self,
        remote: &dyn RemoteStore,
        key: &DocumentKey,
    ) -> Result<Option<Document>> {
        let fetched = tokio::time::timeout(
            self.config.remote_timeout,
            remote.fetch_document(&key.collection, &key.id),
        )
        .await
        .unwrap_or(Err(RemoteError::Timeout))?;

        let Some(document) = fetched else {
            return Ok(None);
        };
        self.apply_remote(document).await?;

        let _guard = self.locks.lock(key).await;
        let Some(local) = self.offline.read(key).await? else {
            return Ok(None);
        };
        self.cache().put(local.clone(), self.now());
        Ok(Some(local).filter(Document::is_active))
    }
}

impl ApplySummary {
    fn count(&mut self, precedence: Precedence) {
        match precedence {
            Precedence::ApplyRemote => self.applied += 1,
            Precedence::KeepLocal => self.kept_local += 1,
            Precedence::Stale => self.stale += 1,
        }
    }
}
