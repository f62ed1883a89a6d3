//! # Stowage Engine
//!
//! Deterministic core of a local-first data service.
//!
//! This crate holds the logic that keeps three storage tiers consistent: an
//! in-memory cache, a durable on-device store and a remote document store.
//! It performs no IO of its own. The async runtime, the durable store and the
//! remote adapters live in `stowage-server` and drive the types defined here.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or timers
//! - **Injected time**: every timestamp comes from a [`Clock`]
//! - **Explicit state**: queue items carry a [`SyncStatus`] instead of flags
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] is identified by `(collection, id)` and carries a field map,
//! a version and a tombstone flag. Versions are millisecond timestamps
//! assigned by the remote store; optimistic local edits stamp a provisional
//! version until the remote confirms.
//!
//! ### Cache
//!
//! [`CacheLayer`] is a size-bounded LRU with a rolling hit-rate window. Keys
//! with unconfirmed writes are pinned and never evicted.
//!
//! ### Sync Queue
//!
//! [`SyncQueue`] keeps at most one [`QueueItem`] per key. Repeated edits
//! coalesce into the existing item and keep its FIFO position. Failures back
//! off through a shared [`RetryPolicy`] and end up as [`DeadLetter`]s once the
//! retry ceiling is reached.
//!
//! ### Reconciliation
//!
//! [`reconcile::resolve`] decides, per incoming remote document, whether the
//! remote copy is applied or a pending local edit keeps precedence
//! (last-writer-wins by version).
//!
//! ## Quick Start
//!
//! ```rust
//! use stowage_engine::{CacheLayer, DocumentKey, Document, Mutation, SyncQueue};
//! use serde_json::json;
//!
//! let mut cache = CacheLayer::new(100, 100);
//! let fields = json!({"name": "Ada"}).as_object().unwrap().clone();
//! let doc = Document::new("clients", "c-1", fields, 1000);
//! cache.put(doc.clone(), 1000);
//!
//! let (found, hit) = cache.get(&DocumentKey::new("clients", "c-1"), 1001);
//! assert!(hit);
//! assert_eq!(found.unwrap().version, 1000);
//!
//! let mut queue = SyncQueue::new();
//! queue.enqueue(Mutation::create(&doc), 1000);
//! assert_eq!(queue.len(), 1);
//! ```

pub mod cache;
pub mod clock;
pub mod connection;
pub mod document;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod queue;
pub mod reconcile;
pub mod retry;

// Re-export main types at crate root
pub use cache::{CacheEntry, CacheLayer, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionHealth, ConnectionState};
pub use document::{Document, DocumentKey, Fields};
pub use error::Error;
pub use metrics::{CacheMetrics, ConnectionMetrics, OfflineStats, PerformanceMetrics};
pub use operation::{Mutation, MutationKind, SyncStatus};
pub use queue::{DeadLetter, EnqueueOutcome, FailureOutcome, QueueItem, SuccessOutcome, SyncQueue};
pub use reconcile::{Precedence, RemoteResolution};
pub use retry::RetryPolicy;

/// Type aliases for clarity
pub type CollectionName = String;
pub type DocumentId = String;
pub type Version = u64;
pub type Timestamp = u64;
