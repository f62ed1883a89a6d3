//! The authoritative remote document store.
//!
//! [`RemoteStore`] is the seam between the data service and whatever backs
//! it: [`MemoryRemote`] keeps everything in process, [`HttpRemote`] talks to a
//! document API over HTTP.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use async_trait::async_trait;
use stowage_engine::{Document, Fields, Version};
use tokio::sync::mpsc;

pub use crate::error::RemoteError;

/// Buffer of a collection change feed.
pub const FEED_BUFFER: usize = 256;

/// Event delivered on a collection change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Full contents of the collection; always the first event of a feed
    Snapshot(Vec<Document>),
    /// Documents created, updated or deleted (as tombstones) since the last event
    Changed(Vec<Document>),
    /// The feed failed and will deliver nothing more
    Error(RemoteError),
}

/// Remote document store with per-collection change feeds.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Create or overwrite a document, returning the version the remote assigned.
    async fn write_document(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<Version, RemoteError>;

    /// Delete a document. Deleting a missing document is not an error.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    async fn fetch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, RemoteError>;

    /// Open a change feed. It starts with a [`FeedEvent::Snapshot`] and ends
    /// when the receiver is dropped or after a [`FeedEvent::Error`].
    async fn subscribe(&self, collection: &str) -> Result<mpsc::Receiver<FeedEvent>, RemoteError>;

    /// Liveness check.
    async fn ping(&self) -> Result<(), RemoteError>;
}
