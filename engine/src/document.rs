//! Document types shared by every storage tier.

use crate::{CollectionName, DocumentId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field map of a document.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Identity of a document: `(collection, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub collection: CollectionName,
    pub id: DocumentId,
}

impl DocumentKey {
    pub fn new(collection: impl Into<CollectionName>, id: impl Into<DocumentId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A single identified record within a collection.
///
/// The remote store is authoritative; the cache and the offline store hold
/// copies. Logical deletes keep the document as a tombstone (`deleted = true`)
/// until garbage collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub collection: CollectionName,
    pub id: DocumentId,
    #[serde(default)]
    pub fields: Fields,
    /// Remote last-write timestamp, or a provisional local one
    pub version: Version,
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    /// Create a live document.
    pub fn new(
        collection: impl Into<CollectionName>,
        id: impl Into<DocumentId>,
        fields: Fields,
        version: Version,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            fields,
            version,
            deleted: false,
        }
    }

    /// Create a tombstone for a document removed at `version`.
    pub fn tombstone(
        collection: impl Into<CollectionName>,
        id: impl Into<DocumentId>,
        version: Version,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            fields: Fields::new(),
            version,
            deleted: true,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.collection.clone(), self.id.clone())
    }

    /// Check if document is live (not a tombstone).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Overwrite the listed fields, leaving the others untouched.
    ///
    /// This is a field-level overwrite: nested objects in `patch` replace the
    /// existing value wholesale.
    pub fn apply_patch(&mut self, patch: &Fields, now: Timestamp) {
        for (name, value) in patch {
            self.fields.insert(name.clone(), value.clone());
        }
        self.version = Self::next_local_version(self.version, now);
    }

    /// Mark as deleted, keeping the document as a tombstone.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.deleted = true;
        self.version = Self::next_local_version(self.version, now);
    }

    /// Provisional version for an optimistic local edit.
    ///
    /// Always strictly greater than `previous`, so a local edit never ranks
    /// below the copy it was made from.
    pub fn next_local_version(previous: Version, now: Timestamp) -> Version {
        now.max(previous.saturating_add(1))
    }
}
