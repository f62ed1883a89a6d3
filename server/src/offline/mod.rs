//! Durable local tier backed by SQLite.
//!
//! Holds every document the device knows about (tombstones included) plus the
//! persisted sync queue, so pending work survives a restart. Document writes
//! and the queue change they cause commit in one transaction.

mod documents;
mod pool;
mod queue;

pub use pool::{create_memory_pool, create_pool, run_migrations, Pool};

use std::sync::Arc;

use stowage_engine::{
    Clock, CollectionName, DeadLetter, Document, DocumentKey, OfflineStats, QueueItem, Timestamp,
    Version,
};

use crate::error::Result;

/// Queue-table change committed alongside a document write.
#[derive(Debug, Clone, Copy)]
pub enum QueueChange<'a> {
    /// Insert or replace the pending item
    Save(&'a QueueItem),
    /// Drop the pending item
    Remove(&'a DocumentKey),
    /// Move the item to the dead letters
    DeadLetter(&'a DeadLetter),
    /// Move a dead letter back into the queue
    Revive(&'a QueueItem),
    /// Forget a dead letter
    Discard(&'a DocumentKey),
}

/// Persistent key-value store of documents grouped by collection.
#[derive(Clone)]
pub struct OfflineStore {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl OfflineStore {
    /// Open (or create) a file-backed store and apply migrations.
    pub async fn open(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool, clock })
    }

    /// A private in-memory store, mostly for tests.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = create_memory_pool().await?;
        run_migrations(&pool).await?;
        Ok(Self { pool, clock })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Read a document, tombstones included.
    pub async fn read(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let stored = documents::get_document(&self.pool, key).await?;
        Ok(stored.map(|row| row.to_document()).transpose()?)
    }

    pub async fn write(&self, document: &Document) -> Result<()> {
        documents::upsert_document(&self.pool, document, self.clock.now_millis()).await?;
        Ok(())
    }

    /// Replace the document with a tombstone at `version`.
    pub async fn delete(&self, key: &DocumentKey, version: Version) -> Result<()> {
        let tombstone = Document::tombstone(key.collection.clone(), key.id.clone(), version);
        self.write(&tombstone).await
    }

    /// Every document of a collection, tombstones included, ordered by id.
    pub async fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = documents::get_collection(&self.pool, collection).await?;
        let documents = rows
            .iter()
            .map(|row| row.to_document())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(documents)
    }

    /// Live document counts per collection.
    pub async fn stats(&self) -> Result<OfflineStats> {
        let counts = documents::count_live(&self.pool).await?;
        Ok(OfflineStats::from_counts(counts.into_iter().map(
            |(collection, count): (CollectionName, i64)| (collection, count.max(0) as usize),
        )))
    }

    /// Drop tombstones written before `cutoff` that have no pending or
    /// dead-lettered mutation. Returns how many were removed.
    pub async fn purge_tombstones(&self, cutoff: Timestamp) -> Result<u64> {
        Ok(documents::purge_tombstones(&self.pool, cutoff).await?)
    }

    /// Atomically write a document and apply queue changes.
    pub async fn commit(
        &self,
        document: Option<&Document>,
        changes: &[QueueChange<'_>],
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;

        if let Some(document) = document {
            documents::upsert_document(&mut *tx, document, now).await?;
        }

        for change in changes {
            match *change {
                QueueChange::Save(item) => queue::save_item(&mut *tx, item).await?,
                QueueChange::Remove(key) => queue::delete_item(&mut *tx, key).await?,
                QueueChange::DeadLetter(letter) => {
                    queue::delete_item(&mut *tx, &letter.item.key).await?;
                    queue::save_dead_letter(&mut *tx, letter).await?;
                }
                QueueChange::Revive(item) => {
                    queue::delete_dead_letter(&mut *tx, &item.key).await?;
                    queue::save_item(&mut *tx, item).await?;
                }
                QueueChange::Discard(key) => queue::delete_dead_letter(&mut *tx, key).await?,
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load the persisted queue in drain order, plus its dead letters.
    pub async fn load_queue(&self) -> Result<(Vec<QueueItem>, Vec<DeadLetter>)> {
        let items = queue::load_items(&self.pool)
            .await?
            .iter()
            .map(|body| serde_json::from_str(body))
            .collect::<std::result::Result<Vec<QueueItem>, _>>()?;
        let letters = queue::load_dead_letters(&self.pool)
            .await?
            .iter()
            .map(|body| serde_json::from_str(body))
            .collect::<std::result::Result<Vec<DeadLetter>, _>>()?;
        Ok((items, letters))
    }
}
