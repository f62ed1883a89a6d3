//! In-process remote store.
//!
//! Used by the binary when no remote URL is configured and by tests, which
//! drive outages and rejections through its fault-injection knobs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use stowage_engine::{Clock, Document, DocumentKey, Fields, Version};
use tokio::sync::mpsc;

use super::{FeedEvent, RemoteError, RemoteStore, FEED_BUFFER};

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<DocumentKey, Document>,
    last_version: Version,
    unavailable: bool,
    fail_next_writes: u32,
    reject_writes: Option<String>,
    feeds: Vec<(String, mpsc::Sender<FeedEvent>)>,
    writes: u64,
    deletes: u64,
    fetches: u64,
    feeds_opened: u64,
}

impl MemoryState {
    fn next_version(&mut self, now: u64) -> Version {
        self.last_version = now.max(self.last_version + 1);
        self.last_version
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable {
            return Err(RemoteError::Unavailable("remote is offline".to_string()));
        }
        Ok(())
    }

    /// A full or closed feed is dropped; its consumer resubscribes and
    /// starts over from a fresh snapshot.
    fn publish(&mut self, document: &Document) {
        self.feeds.retain(|(collection, tx)| {
            if *collection != document.collection {
                return !tx.is_closed();
            }
            tx.try_send(FeedEvent::Changed(vec![document.clone()])).is_ok()
        });
    }
}

/// Remote store held entirely in memory.
///
/// Versions are assigned from the injected clock and strictly increase.
pub struct MemoryRemote {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate an outage. Going unavailable fails every open feed.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state();
        state.unavailable = !available;
        if !available {
            for (_, tx) in state.feeds.drain(..) {
                let _ = tx.try_send(FeedEvent::Error(RemoteError::Unavailable(
                    "remote went offline".to_string(),
                )));
            }
        }
    }

    /// Fail the next `count` writes or deletes with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state().fail_next_writes = count;
    }

    /// Permanently reject writes with `reason`, or accept them again with `None`.
    pub fn reject_writes(&self, reason: Option<&str>) {
        self.state().reject_writes = reason.map(str::to_string);
    }

    /// A write made by another client: stored and pushed to open feeds.
    pub fn external_write(&self, collection: &str, id: &str, fields: Fields) -> Version {
        let now = self.clock.now_millis();
        let mut state = self.state();
        let version = state.next_version(now);
        let document = Document::new(collection, id, fields, version);
        state.documents.insert(document.key(), document.clone());
        state.publish(&document);
        version
    }

    /// Store a document exactly as given, without notifying feeds.
    pub fn seed(&self, document: Document) {
        let mut state = self.state();
        state.last_version = state.last_version.max(document.version);
        state.documents.insert(document.key(), document);
    }

    /// A delete made by another client.
    pub fn external_delete(&self, collection: &str, id: &str) -> Version {
        let now = self.clock.now_millis();
        let mut state = self.state();
        let version = state.next_version(now);
        let tombstone = Document::tombstone(collection, id, version);
        state.documents.remove(&tombstone.key());
        state.publish(&tombstone);
        version
    }

    /// Current remote copy of a document.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.state()
            .documents
            .get(&DocumentKey::new(collection, id))
            .cloned()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }

    pub fn delete_count(&self) -> u64 {
        self.state().deletes
    }

    pub fn fetch_count(&self) -> u64 {
        self.state().fetches
    }

    /// Feeds opened so far, reconnects included.
    pub fn feeds_opened(&self) -> u64 {
        self.state().feeds_opened
    }

    fn admit_write(state: &mut MemoryState) -> Result<(), RemoteError> {
        state.check_available()?;
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(RemoteError::Unavailable("injected failure".to_string()));
        }
        if let Some(reason) = &state.reject_writes {
            return Err(RemoteError::Rejected(reason.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn write_document(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<Version, RemoteError> {
        let now = self.clock.now_millis();
        let mut state = self.state();
        Self::admit_write(&mut state)?;

        let version = state.next_version(now);
        let document = Document::new(collection, id, fields.clone(), version);
        state.documents.insert(document.key(), document.clone());
        state.writes += 1;
        state.publish(&document);
        Ok(version)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let now = self.clock.now_millis();
        let mut state = self.state();
        Self::admit_write(&mut state)?;

        let key = DocumentKey::new(collection, id);
        if state.documents.remove(&key).is_some() {
            let version = state.next_version(now);
            state.publish(&Document::tombstone(collection, id, version));
        }
        state.deletes += 1;
        Ok(())
    }

    async fn fetch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, RemoteError> {
        let mut state = self.state();
        state.check_available()?;
        state.fetches += 1;
        Ok(state
            .documents
            .get(&DocumentKey::new(collection, id))
            .cloned())
    }

    async fn subscribe(&self, collection: &str) -> Result<mpsc::Receiver<FeedEvent>, RemoteError> {
        let mut state = self.state();
        state.check_available()?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let snapshot = state
            .documents
            .values()
            .filter(|doc| doc.collection == collection)
            .cloned()
            .collect();
        // Fresh channel with room to spare.
        let _ = tx.try_send(FeedEvent::Snapshot(snapshot));
        state.feeds.push((collection.to_string(), tx));
        state.feeds_opened += 1;
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.state().check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stowage_engine::ManualClock;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    fn remote() -> (MemoryRemote, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(5_000));
        (MemoryRemote::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn versions_strictly_increase() {
        let (remote, _) = remote();
        let a = remote
            .write_document("clients", "a", &fields(json!({})))
            .await
            .unwrap();
        let b = remote
            .write_document("clients", "b", &fields(json!({})))
            .await
            .unwrap();
        assert_eq!(a, 5_000);
        assert_eq!(b, 5_001);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn feed_starts_with_snapshot_then_changes() {
        let (remote, clock) = remote();
        remote.external_write("clients", "a", fields(json!({"n": 1})));
        remote.external_write("projects", "p", fields(json!({})));

        let mut feed = remote.subscribe("clients").await.unwrap();
        match feed.recv().await.unwrap() {
            FeedEvent::Snapshot(docs) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0].id, "a");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        clock.advance(10);
        remote.external_delete("clients", "a");
        match feed.recv().await.unwrap() {
            FeedEvent::Changed(docs) => assert!(docs[0].deleted),
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outage_fails_feeds_and_calls() {
        let (remote, _) = remote();
        let mut feed = remote.subscribe("clients").await.unwrap();
        let _ = feed.recv().await;

        remote.set_available(false);
        assert!(matches!(feed.recv().await, Some(FeedEvent::Error(_))));
        assert!(feed.recv().await.is_none());

        let err = remote.ping().await.unwrap_err();
        assert!(err.is_transient());
        assert!(remote.subscribe("clients").await.is_err());

        remote.set_available(true);
        assert!(remote.ping().await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_then_rejection() {
        let (remote, _) = remote();
        remote.fail_next_writes(1);
        let err = remote
            .write_document("clients", "a", &fields(json!({})))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(remote
            .write_document("clients", "a", &fields(json!({})))
            .await
            .is_ok());

        remote.reject_writes(Some("schema violation"));
        let err = remote.delete_document("clients", "a").await.unwrap_err();
        assert_eq!(err, RemoteError::Rejected("schema violation".to_string()));
    }
}
