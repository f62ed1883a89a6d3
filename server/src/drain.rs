//! Sending queued mutations to the remote store.
//!
//! A drain takes a snapshot of the due keys and handles them one at a time,
//! oldest first. The key's lock is held while an item is taken off the queue
//! and again while the result is recorded, never across the network call, so
//! local writes keep flowing while a request is out.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use stowage_engine::{
    Document, DocumentKey, FailureOutcome, MutationKind, QueueItem, SuccessOutcome, Timestamp,
    Version,
};

use crate::error::{RemoteError, Result};
use crate::events::SyncEvent;
use crate::offline::QueueChange;
use crate::remote::RemoteStore;
use crate::tiers::Tiers;

/// Result of sending one queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DrainOutcome {
    /// Acknowledged; `requeued` when newer local edits are still waiting
    Confirmed {
        key: DocumentKey,
        version: Version,
        requeued: bool,
    },
    /// Transient failure, retried after backoff
    Retrying {
        key: DocumentKey,
        attempts: u32,
        next_attempt_at: Timestamp,
        error: String,
    },
    /// Permanent failure or retries exhausted
    DeadLettered { key: DocumentKey, reason: String },
    /// The item left the queue while its request was out
    Superseded { key: DocumentKey },
}

impl DrainOutcome {
    pub fn key(&self) -> &DocumentKey {
        match self {
            DrainOutcome::Confirmed { key, .. }
            | DrainOutcome::Retrying { key, .. }
            | DrainOutcome::DeadLettered { key, .. }
            | DrainOutcome::Superseded { key } => key,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DrainOutcome::Confirmed { .. })
    }
}

/// Lazily drain every item due now. Finite; yields nothing unless the
/// remote can be reached.
pub(crate) fn drain(
    tiers: Arc<Tiers>,
    remote: Arc<dyn RemoteStore>,
) -> BoxStream<'static, DrainOutcome> {
    stream::once(async move {
        let held = tiers.drain_lock.clone().lock_owned().await;
        let keys = if tiers.monitor.state().can_sync() {
            tiers.queue().due(tiers.now())
        } else {
            Vec::new()
        };
        if !keys.is_empty() {
            tracing::debug!(due = keys.len(), "draining sync queue");
        }
        (held, keys, tiers, remote)
    })
    .flat_map(|(held, keys, tiers, remote)| {
        stream::iter(keys).then(move |key| {
            let _held = &held;
            let tiers = tiers.clone();
            let remote = remote.clone();
            async move {
                match tiers.drain_one(remote.as_ref(), key.clone()).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(%key, error = %err, "failed to record drain result");
                        None
                    }
                }
            }
        })
    })
    .filter_map(|outcome| async move { outcome })
    .boxed()
}

impl Tiers {
    /// Send one queued item and record the result.
    ///
    /// `None` when the item is gone, already in flight, or the remote
    /// dropped out since the drain started.
    pub(crate) async fn drain_one(
        &self,
        remote: &dyn RemoteStore,
        key: DocumentKey,
    ) -> Result<Option<DrainOutcome>> {
        if !self.monitor.state().can_sync() {
            return Ok(None);
        }

        let item = {
            let _guard = self.locks.lock(&key).await;
            let begun = self.queue().begin(&key);
            match begun {
                Ok(item) => item,
                Err(_) => return Ok(None),
            }
        };

        let sent = self.send(remote, &item).await;

        let _guard = self.locks.lock(&key).await;
        let now = self.now();
        let settled = match sent {
            Ok(version) => self.settle_success(&item, version, now).await,
            Err(err) => self.settle_failure(&key, err, now).await,
        };
        match settled {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                // Not recorded locally; send it again on a later drain.
                if self.queue().abort(&key) {
                    tracing::warn!(%key, "released in-flight mutation");
                }
                Err(err)
            }
        }
    }

    async fn send(
        &self,
        remote: &dyn RemoteStore,
        item: &QueueItem,
    ) -> std::result::Result<Option<Version>, RemoteError> {
        let key = &item.key;
        let call = async {
            match item.kind {
                MutationKind::Create | MutationKind::Update => remote
                    .write_document(&key.collection, &key.id, &item.payload)
                    .await
                    .map(Some),
                MutationKind::Delete => {
                    match remote.delete_document(&key.collection, &key.id).await {
                        Ok(()) | Err(RemoteError::NotFound(_)) => Ok(None),
                        Err(err) => Err(err),
                    }
                }
            }
        };

        tokio::time::timeout(self.config.remote_timeout, call)
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }

    async fn settle_success(
        &self,
        sent: &QueueItem,
        remote_version: Option<Version>,
        now: Timestamp,
    ) -> Result<DrainOutcome> {
        let key = sent.key.clone();
        let local = self.offline.read(&key).await?;
        let version = remote_version
            .or(local.as_ref().map(|doc| doc.version))
            .unwrap_or(sent.last_edited_at);

        let completed = self.queue().complete(&key, version, now);
        let outcome = match completed {
            Ok(outcome) => outcome,
            Err(_) => return Ok(DrainOutcome::Superseded { key }),
        };
        self.monitor.mark_synced(now);

        match outcome {
            SuccessOutcome::Removed { version, .. } => {
                let confirmed = confirmed_copy(sent, local, version);
                self.offline
                    .commit(confirmed.as_ref(), &[QueueChange::Remove(&key)])
                    .await?;
                {
                    let mut cache = self.cache();
                    cache.unpin(&key);
                    if let Some(confirmed) = confirmed {
                        cache.refresh(confirmed, now);
                    }
                }
                tracing::debug!(%key, version, "mutation confirmed");
                self.emit(SyncEvent::Confirmed {
                    key: key.clone(),
                    version,
                });
                Ok(DrainOutcome::Confirmed {
                    key,
                    version,
                    requeued: false,
                })
            }
            SuccessOutcome::Requeued { item, version } => {
                self.offline.commit(None, &[QueueChange::Save(&item)]).await?;
                tracing::debug!(%key, version, "mutation confirmed, newer edits pending");
                self.wakeup.notify_one();
                Ok(DrainOutcome::Confirmed {
                    key,
                    version,
                    requeued: true,
                })
            }
        }
    }

    async fn settle_failure(
        &self,
        key: &DocumentKey,
        err: RemoteError,
        now: Timestamp,
    ) -> Result<DrainOutcome> {
        let permanent = !err.is_transient();
        let failed = self
            .queue()
            .fail(key, err.to_string(), permanent, &self.config.retry, now);
        let failed = match failed {
            Ok(failed) => failed,
            Err(_) => return Ok(DrainOutcome::Superseded { key: key.clone() }),
        };

        match failed {
            FailureOutcome::Retrying(item) => {
                self.offline.commit(None, &[QueueChange::Save(&item)]).await?;
                tracing::warn!(
                    %key,
                    attempts = item.attempts,
                    retry_at = item.next_attempt_at,
                    error = %err,
                    "remote write failed, will retry"
                );
                let error = item.last_error.clone().unwrap_or_default();
                self.emit(SyncEvent::Retrying {
                    key: key.clone(),
                    attempts: item.attempts,
                    next_attempt_at: item.next_attempt_at,
                    error: error.clone(),
                });
                Ok(DrainOutcome::Retrying {
                    key: key.clone(),
                    attempts: item.attempts,
                    next_attempt_at: item.next_attempt_at,
                    error,
                })
            }
            FailureOutcome::DeadLettered(letter) => {
                self.offline
                    .commit(None, &[QueueChange::DeadLetter(&letter)])
                    .await?;
                self.cache().unpin(key);
                let reason = letter.reason().to_string();
                tracing::error!(
                    %key,
                    attempts = letter.item.attempts,
                    reason = %reason,
                    "mutation dead-lettered"
                );
                self.emit(SyncEvent::DeadLettered {
                    key: key.clone(),
                    reason: reason.clone(),
                });
                Ok(DrainOutcome::DeadLettered {
                    key: key.clone(),
                    reason,
                })
            }
        }
    }
}

/// Local copy after a confirmed write, or `None` to leave it alone.
///
/// A remote change applied while the request was out may already be newer
/// than the confirmed write; otherwise the sent payload is what the remote
/// now holds, at the version it assigned.
fn confirmed_copy(
    sent: &QueueItem,
    local: Option<Document>,
    version: Version,
) -> Option<Document> {
    let ours = match sent.kind {
        MutationKind::Delete => {
            Document::tombstone(sent.key.collection.clone(), sent.key.id.clone(), version)
        }
        MutationKind::Create | MutationKind::Update => Document::new(
            sent.key.collection.clone(),
            sent.key.id.clone(),
            sent.payload.clone(),
            version,
        ),
    };

    match local {
        Some(local) if local.fields == ours.fields && local.deleted == ours.deleted => Some(ours),
        Some(local) if local.version > version => None,
        _ => Some(ours),
    }
}
