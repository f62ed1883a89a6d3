//! Mutation types for expressing local changes.
//!
//! Local writes are applied optimistically to the cache and the offline store
//! and recorded as mutations that still have to reach the remote store.

use crate::{Document, DocumentKey, Fields, Version};
use serde::{Deserialize, Serialize};

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(MutationKind::Create),
            "update" => Some(MutationKind::Update),
            "delete" => Some(MutationKind::Delete),
            _ => None,
        }
    }
}

/// A local change waiting for the remote store.
///
/// `payload` is the complete field map to write, not a delta: coalescing two
/// mutations on the same key simply keeps the later payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub kind: MutationKind,
    pub key: DocumentKey,
    #[serde(default)]
    pub payload: Fields,
}

impl Mutation {
    pub fn create(doc: &Document) -> Self {
        Self {
            kind: MutationKind::Create,
            key: doc.key(),
            payload: doc.fields.clone(),
        }
    }

    pub fn update(doc: &Document) -> Self {
        Self {
            kind: MutationKind::Update,
            key: doc.key(),
            payload: doc.fields.clone(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            kind: MutationKind::Delete,
            key,
            payload: Fields::new(),
        }
    }
}

/// Confirmation state of a queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    /// Applied locally, not yet acknowledged by the remote store
    Pending,
    /// Acknowledged; the remote assigned this version
    Confirmed { version: Version },
    /// Abandoned after a permanent error or the retry ceiling
    Failed { reason: String },
}

impl SyncStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncStatus::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutation_from_document() {
        let doc = Document::new(
            "clients",
            "c-1",
            json!({"name": "Ada"}).as_object().cloned().unwrap(),
            1000,
        );

        let create = Mutation::create(&doc);
        assert_eq!(create.kind, MutationKind::Create);
        assert_eq!(create.key, DocumentKey::new("clients", "c-1"));
        assert_eq!(create.payload["name"], "Ada");

        let delete = Mutation::delete(doc.key());
        assert_eq!(delete.kind, MutationKind::Delete);
        assert!(delete.payload.is_empty());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [MutationKind::Create, MutationKind::Update, MutationKind::Delete] {
            assert_eq!(MutationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MutationKind::parse("upsert"), None);
    }

    #[test]
    fn status_serialization() {
        let json = serde_json::to_string(&SyncStatus::Confirmed { version: 42 }).unwrap();
        assert_eq!(json, r#"{"state":"confirmed","version":42}"#);

        let json = serde_json::to_string(&SyncStatus::Pending).unwrap();
        assert_eq!(json, r#"{"state":"pending"}"#);
    }

    #[test]
    fn status_predicates() {
        assert!(SyncStatus::Pending.is_pending());
        assert!(SyncStatus::Failed { reason: "x".into() }.is_failed());
        assert!(!SyncStatus::Confirmed { version: 1 }.is_failed());
    }
}
