//! Per-document write serialization.

use std::sync::Arc;

use dashmap::DashMap;
use stowage_engine::DocumentKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by document, created on demand and dropped when the
/// last holder or waiter lets go.
///
/// Every path that touches the cache, offline store and queue for one key
/// holds that key's lock, so the three tiers change together.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<DocumentKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &DocumentKey) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds one key's lock until dropped.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: DocumentKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
