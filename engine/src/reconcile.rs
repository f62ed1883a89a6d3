//! Reconciliation of remote changes against local state.
//!
//! Conflict policy is last-writer-wins by version. A pending local mutation
//! is compared through its `last_edited_at` timestamp, the basis the local
//! edit was made on:
//!
//! 1. A pending edit at least as recent as the remote version keeps
//!    precedence until it is confirmed; the remote copy is not applied.
//! 2. A remote version newer than the pending edit wins; the pending
//!    mutation is discarded so it cannot clobber the newer remote value.
//! 3. Without a pending edit, the remote copy is applied unless the local
//!    copy is strictly newer. Equal versions resolve to the remote copy, since
//!    the later arrival from the remote store breaks the tie.
//!
//! An item that is in flight and has already absorbed newer local edits is
//! always kept: its echo from the remote must not erase those edits. An
//! in-flight item is never discarded either; a newer remote copy is applied
//! and the acknowledgement settles the item.

use crate::{Document, QueueItem, Version};
use serde::{Deserialize, Serialize};

/// Which side wins for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precedence {
    /// Overwrite cache and offline store with the remote copy
    ApplyRemote,
    /// A pending local edit wins until confirmed
    KeepLocal,
    /// The local copy is already newer; nothing to do
    Stale,
}

/// Outcome of reconciling one remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteResolution {
    pub precedence: Precedence,
    /// The queued local mutation lost and must be dropped
    pub discard_pending: bool,
}

impl RemoteResolution {
    fn new(precedence: Precedence) -> Self {
        Self {
            precedence,
            discard_pending: false,
        }
    }

    pub fn applies_remote(&self) -> bool {
        self.precedence == Precedence::ApplyRemote
    }
}

/// Decide how an incoming remote document relates to the local copy and any
/// queued mutation for the same key.
pub fn resolve(
    remote: &Document,
    local: Option<&Document>,
    pending: Option<&QueueItem>,
) -> RemoteResolution {
    if let Some(item) = pending {
        if item.is_in_flight() && has_unsent_edits(item) {
            return RemoteResolution::new(Precedence::KeepLocal);
        }
        if item.last_edited_at >= remote.version {
            return RemoteResolution::new(Precedence::KeepLocal);
        }
        return RemoteResolution {
            precedence: Precedence::ApplyRemote,
            discard_pending: !item.is_in_flight(),
        };
    }

    match local {
        Some(local) if local.version > remote.version => RemoteResolution::new(Precedence::Stale),
        _ => RemoteResolution::new(Precedence::ApplyRemote),
    }
}

/// Tombstone for a local document that a full remote snapshot no longer
/// contains, or `None` when the local copy must be kept.
///
/// Documents with a queued mutation are kept (the local edit has not reached
/// the remote yet), as are documents that are already tombstones.
/// `snapshot_newest` is the highest version the snapshot carried: a local
/// copy newer than that was confirmed after the snapshot was taken.
///
/// The tombstone keeps the local version, so any remote copy at or above it
/// still wins a later reconciliation.
pub fn resolve_absent(
    local: &Document,
    pending: Option<&QueueItem>,
    snapshot_newest: Option<Version>,
) -> Option<Document> {
    if pending.is_some() || local.deleted {
        return None;
    }
    if snapshot_newest.is_some_and(|newest| local.version > newest) {
        return None;
    }
    let mut tombstone = local.clone();
    tombstone.fields.clear();
    tombstone.deleted = true;
    Some(tombstone)
}

fn has_unsent_edits(item: &QueueItem) -> bool {
    item.sent_revision()
        .is_some_and(|sent| sent != item.revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentKey, Fields, Mutation, SyncQueue};
    use serde_json::json;

    fn remote(version: u64) -> Document {
        Document::new(
            "clients",
            "c-1",
            json!({"name": "remote"}).as_object().cloned().unwrap(),
            version,
        )
    }

    fn local(version: u64) -> Document {
        Document::new(
            "clients",
            "c-1",
            json!({"name": "local"}).as_object().cloned().unwrap(),
            version,
        )
    }

    fn queued_at(queue: &mut SyncQueue, now: u64) -> QueueItem {
        queue.enqueue(Mutation::update(&local(now)), now);
        queue.get(&DocumentKey::new("clients", "c-1")).cloned().unwrap()
    }

    #[test]
    fn pending_edit_newer_than_snapshot_wins() {
        let mut queue = SyncQueue::new();
        let item = queued_at(&mut queue, 2_000);

        let resolution = resolve(&remote(1_500), Some(&local(2_000)), Some(&item));
        assert_eq!(resolution.precedence, Precedence::KeepLocal);
        assert!(!resolution.discard_pending);
    }

    #[test]
    fn remote_newer_than_pending_basis_wins() {
        let mut queue = SyncQueue::new();
        let item = queued_at(&mut queue, 2_000);

        let resolution = resolve(&remote(2_500), Some(&local(2_000)), Some(&item));
        assert!(resolution.applies_remote());
        assert!(resolution.discard_pending);
    }

    #[test]
    fn coalesced_edit_moves_the_basis_forward() {
        let mut queue = SyncQueue::new();
        queued_at(&mut queue, 1_000);
        let item = queued_at(&mut queue, 3_000);
        assert_eq!(item.enqueued_at, 1_000);

        let resolution = resolve(&remote(2_000), Some(&local(3_000)), Some(&item));
        assert_eq!(resolution.precedence, Precedence::KeepLocal);
    }

    #[test]
    fn in_flight_item_with_unsent_edits_is_kept() {
        let mut queue = SyncQueue::new();
        queued_at(&mut queue, 1_000);
        let key = DocumentKey::new("clients", "c-1");
        queue.begin(&key).unwrap();
        queue.enqueue(Mutation::update(&local(1_200)), 1_200);
        let item = queue.get(&key).cloned().unwrap();

        // Echo of the first write, stamped after the second edit.
        let resolution = resolve(&remote(1_300), Some(&local(1_200)), Some(&item));
        assert_eq!(resolution.precedence, Precedence::KeepLocal);
    }

    #[test]
    fn in_flight_item_is_not_discarded() {
        let mut queue = SyncQueue::new();
        queued_at(&mut queue, 1_000);
        let key = DocumentKey::new("clients", "c-1");
        let item = queue.begin(&key).unwrap();

        let resolution = resolve(&remote(1_500), Some(&local(1_000)), Some(&item));
        assert!(resolution.applies_remote());
        assert!(!resolution.discard_pending);
    }

    #[test]
    fn newer_remote_applies_without_pending() {
        let resolution = resolve(&remote(2), Some(&local(1)), None);
        assert!(resolution.applies_remote());
        assert!(!resolution.discard_pending);
    }

    #[test]
    fn equal_versions_take_remote_arrival() {
        let resolution = resolve(&remote(5), Some(&local(5)), None);
        assert!(resolution.applies_remote());
    }

    #[test]
    fn older_remote_is_stale() {
        let resolution = resolve(&remote(4), Some(&local(5)), None);
        assert_eq!(resolution.precedence, Precedence::Stale);
    }

    #[test]
    fn unknown_document_applies() {
        assert!(resolve(&remote(1), None, None).applies_remote());
    }

    #[test]
    fn absent_from_snapshot_becomes_tombstone() {
        let tombstone = resolve_absent(&local(10), None, None).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.fields, Fields::new());
        assert_eq!(tombstone.version, 10);

        let tombstone = resolve_absent(&local(10), None, Some(40)).unwrap();
        assert_eq!(tombstone.version, 10);
    }

    #[test]
    fn absence_tombstone_loses_to_remote_echo() {
        let tombstone = resolve_absent(&local(1_000), None, None).unwrap();
        let echo = resolve(&remote(1_000), Some(&tombstone), None);
        assert!(echo.applies_remote());
    }

    #[test]
    fn confirmed_after_snapshot_is_kept() {
        assert!(resolve_absent(&local(1_000), None, Some(900)).is_none());
        assert!(resolve_absent(&local(1_000), None, Some(1_000)).is_some());
    }

    #[test]
    fn absent_with_pending_is_kept() {
        let mut queue = SyncQueue::new();
        let item = queued_at(&mut queue, 10);
        assert!(resolve_absent(&local(10), Some(&item), None).is_none());
        assert!(resolve_absent(&Document::tombstone("clients", "c-1", 3), None, None).is_none());
    }
}
