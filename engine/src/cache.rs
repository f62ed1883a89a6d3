//! In-memory document cache.
//!
//! A size-bounded LRU keyed by [`DocumentKey`]. Lookups feed a rolling
//! hit/miss window that backs the operator-facing hit rate. Keys with a
//! pending sync mutation are pinned and skipped by eviction.

use crate::{Document, DocumentKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// A cached document plus its access bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub document: Document,
    pub last_accessed: Timestamp,
    pub last_written: Timestamp,
    /// Position in the recency index
    tick: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// hits / (hits + misses) over the rolling window, 0.0 when empty
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    pub pinned: usize,
    pub evictions: u64,
}

/// LRU cache with hit-rate accounting and eviction pinning.
#[derive(Debug)]
pub struct CacheLayer {
    capacity: usize,
    entries: HashMap<DocumentKey, CacheEntry>,
    /// Recency index: oldest tick first
    recency: BTreeMap<u64, DocumentKey>,
    next_tick: u64,
    pinned: HashSet<DocumentKey>,
    window: VecDeque<bool>,
    window_size: usize,
    window_hits: usize,
    evictions: u64,
}

impl CacheLayer {
    /// Create a cache holding at most `capacity` unpinned entries and
    /// measuring the hit rate over the last `window_size` lookups.
    pub fn new(capacity: usize, window_size: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            pinned: HashSet::new(),
            window: VecDeque::with_capacity(window_size.min(4096)),
            window_size: window_size.max(1),
            window_hits: 0,
            evictions: 0,
        }
    }

    /// Look up a document. Never fails; a miss returns `(None, false)`.
    ///
    /// Tombstones are returned as hits so callers can tell "deleted" apart
    /// from "unknown".
    pub fn get(&mut self, key: &DocumentKey, now: Timestamp) -> (Option<Document>, bool) {
        let tick = self.bump_tick();
        let found = match self.entries.get_mut(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                entry.tick = tick;
                entry.last_accessed = now;
                self.recency.insert(tick, key.clone());
                Some(entry.document.clone())
            }
            None => None,
        };

        let hit = found.is_some();
        self.record_lookup(hit);
        (found, hit)
    }

    /// Look at an entry without touching recency or the hit window.
    pub fn peek(&self, key: &DocumentKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace a document, evicting least-recently-used unpinned
    /// entries when over capacity.
    pub fn put(&mut self, document: Document, now: Timestamp) {
        let key = document.key();
        let tick = self.bump_tick();

        if let Some(previous) = self.entries.remove(&key) {
            self.recency.remove(&previous.tick);
        }

        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                document,
                last_accessed: now,
                last_written: now,
                tick,
            },
        );

        self.evict_overflow();
    }

    /// Replace a document only if it is already cached.
    ///
    /// Used when applying remote changes, so large snapshots do not flush the
    /// working set. Returns whether the entry was updated.
    pub fn refresh(&mut self, document: Document, now: Timestamp) -> bool {
        match self.entries.get_mut(&document.key()) {
            Some(entry) => {
                entry.document = document;
                entry.last_written = now;
                true
            }
            None => false,
        }
    }

    /// Drop a single entry. Pins are kept.
    pub fn invalidate(&mut self, key: &DocumentKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                true
            }
            None => false,
        }
    }

    /// Drop every entry and reset the hit window.
    ///
    /// Pins describe queued mutations, not cache contents, so they survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.window.clear();
        self.window_hits = 0;
    }

    /// Protect a key from eviction while it has an unconfirmed write.
    pub fn pin(&mut self, key: DocumentKey) {
        self.pinned.insert(key);
    }

    /// Release the eviction pin, evicting if the cache is over capacity.
    pub fn unpin(&mut self, key: &DocumentKey) {
        if self.pinned.remove(key) {
            self.evict_overflow();
        }
    }

    pub fn is_pinned(&self, key: &DocumentKey) -> bool {
        self.pinned.contains(key)
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_hits as f64 / self.window.len() as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_rate: self.hit_rate(),
            size: self.entries.len(),
            capacity: self.capacity,
            pinned: self.pinned.len(),
            evictions: self.evictions,
        }
    }

    fn bump_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn record_lookup(&mut self, hit: bool) {
        self.window.push_back(hit);
        if hit {
            self.window_hits += 1;
        }
        if self.window.len() > self.window_size {
            if let Some(true) = self.window.pop_front() {
                self.window_hits -= 1;
            }
        }
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .recency
                .iter()
                .find(|(_, key)| !self.pinned.contains(*key))
                .map(|(tick, key)| (*tick, key.clone()));

            // Everything left is pinned: allow the overflow.
            let Some((tick, key)) = victim else {
                break;
            };

            self.recency.remove(&tick);
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }
}
