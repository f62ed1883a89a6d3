//! Sync lifecycle notifications.

use serde::Serialize;
use stowage_engine::{DocumentKey, Timestamp, Version};

/// Broadcast whenever a queued mutation or a remote change settles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// The remote acknowledged a mutation
    Confirmed { key: DocumentKey, version: Version },
    /// A transient failure; the item is retried at `next_attempt_at`
    Retrying {
        key: DocumentKey,
        attempts: u32,
        next_attempt_at: Timestamp,
        error: String,
    },
    /// The mutation failed for good and needs attention
    DeadLettered { key: DocumentKey, reason: String },
    /// A newer remote copy replaced a queued local edit
    Superseded {
        key: DocumentKey,
        remote_version: Version,
    },
    /// A remote change was written to the local tiers
    RemoteApplied {
        key: DocumentKey,
        version: Version,
        deleted: bool,
    },
}

impl SyncEvent {
    pub fn key(&self) -> &DocumentKey {
        match self {
            SyncEvent::Confirmed { key, .. }
            | SyncEvent::Retrying { key, .. }
            | SyncEvent::DeadLettered { key, .. }
            | SyncEvent::Superseded { key, .. }
            | SyncEvent::RemoteApplied { key, .. } => key,
        }
    }
}
