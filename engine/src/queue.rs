//! The sync queue: pending local mutations not yet confirmed remotely.
//!
//! Invariants:
//! - at most one item per [`DocumentKey`]; a later mutation on the same key
//!   replaces the payload but keeps the original `enqueued_at`, so the key
//!   keeps its FIFO position and is written at most once per drain cycle
//! - items on different keys drain FIFO by `(enqueued_at, seq)`
//! - a failing item backs off through [`RetryPolicy`] and becomes a
//!   [`DeadLetter`] once the ceiling is reached or the error is permanent
//!
//! A drain works in three steps per key: [`SyncQueue::begin`] marks the item
//! in flight and hands out the payload, then either [`SyncQueue::complete`]
//! or [`SyncQueue::fail`] records the remote result. Edits that arrive while
//! an item is in flight bump its revision; a completion for a stale revision
//! leaves the item queued so the newer payload is sent next time.

use crate::{
    error::Result, DocumentKey, Error, Fields, Mutation, MutationKind, RetryPolicy, SyncStatus,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub kind: MutationKind,
    pub key: DocumentKey,
    #[serde(default)]
    pub payload: Fields,
    /// First enqueue time; kept across coalescing
    pub enqueued_at: Timestamp,
    /// Time of the most recent local edit folded into this item
    pub last_edited_at: Timestamp,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the next attempt may start
    pub next_attempt_at: Timestamp,
    /// Bumped on every coalesced edit
    pub revision: u64,
    /// FIFO tiebreak for items enqueued in the same millisecond
    pub seq: u64,
    pub status: SyncStatus,
    #[serde(skip)]
    in_flight: Option<u64>,
}

impl QueueItem {
    fn new(mutation: Mutation, now: Timestamp, seq: u64) -> Self {
        Self {
            kind: mutation.kind,
            key: mutation.key,
            payload: mutation.payload,
            enqueued_at: now,
            last_edited_at: now,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            revision: 1,
            seq,
            status: SyncStatus::Pending,
            in_flight: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Revision handed out by the current [`SyncQueue::begin`], if any.
    pub fn sent_revision(&self) -> Option<u64> {
        self.in_flight
    }

    fn order_key(&self) -> (Timestamp, u64) {
        (self.enqueued_at, self.seq)
    }
}

/// A mutation abandoned after a permanent error or the retry ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub item: QueueItem,
    pub failed_at: Timestamp,
}

impl DeadLetter {
    pub fn reason(&self) -> &str {
        self.item.last_error.as_deref().unwrap_or("unknown error")
    }
}

/// What happened to an enqueued mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// New item at the back of the queue
    Queued(QueueItem),
    /// Folded into the existing item for the same key
    Coalesced(QueueItem),
    /// A delete cancelled a create that never left the device
    Cancelled(DocumentKey),
}

impl EnqueueOutcome {
    pub fn item(&self) -> Option<&QueueItem> {
        match self {
            EnqueueOutcome::Queued(item) | EnqueueOutcome::Coalesced(item) => Some(item),
            EnqueueOutcome::Cancelled(_) => None,
        }
    }
}

/// Result of recording a remote acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum SuccessOutcome {
    /// The confirmed payload was the latest one; the item is gone
    Removed { item: QueueItem, version: Version },
    /// Newer edits arrived while in flight; the item stays queued
    Requeued { item: QueueItem, version: Version },
}

/// Result of recording a remote failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying(QueueItem),
    DeadLettered(DeadLetter),
}

/// Ordered, coalescing queue of pending mutations.
#[derive(Debug, Default)]
pub struct SyncQueue {
    items: HashMap<DocumentKey, QueueItem>,
    order: BTreeMap<(Timestamp, u64), DocumentKey>,
    dead_letters: BTreeMap<DocumentKey, DeadLetter>,
    next_seq: u64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mutation, coalescing with any item already queued for its key.
    pub fn enqueue(&mut self, mutation: Mutation, now: Timestamp) -> EnqueueOutcome {
        // A fresh edit supersedes an earlier failure on the same key.
        self.dead_letters.remove(&mutation.key);

        let Some(existing) = self.items.get_mut(&mutation.key) else {
            let seq = self.bump_seq();
            let item = QueueItem::new(mutation, now, seq);
            self.order.insert(item.order_key(), item.key.clone());
            self.items.insert(item.key.clone(), item.clone());
            return EnqueueOutcome::Queued(item);
        };

        let never_sent = existing.attempts == 0 && existing.in_flight.is_none();
        match (existing.kind, mutation.kind) {
            (MutationKind::Create, MutationKind::Delete) if never_sent => {
                let key = mutation.key;
                self.remove(&key);
                return EnqueueOutcome::Cancelled(key);
            }
            (MutationKind::Create, MutationKind::Update) => {}
            (_, kind) => existing.kind = kind,
        }

        existing.payload = mutation.payload;
        existing.last_edited_at = now;
        existing.revision += 1;
        EnqueueOutcome::Coalesced(existing.clone())
    }

    /// Keys ready to be sent at `now`, oldest first.
    pub fn due(&self, now: Timestamp) -> Vec<DocumentKey> {
        self.order
            .values()
            .filter(|key| {
                self.items
                    .get(*key)
                    .is_some_and(|item| item.in_flight.is_none() && item.next_attempt_at <= now)
            })
            .cloned()
            .collect()
    }

    /// Earliest time any idle item becomes due.
    pub fn next_due_at(&self) -> Option<Timestamp> {
        self.items
            .values()
            .filter(|item| item.in_flight.is_none())
            .map(|item| item.next_attempt_at)
            .min()
    }

    /// Mark an item in flight and return the snapshot to send.
    pub fn begin(&mut self, key: &DocumentKey) -> Result<QueueItem> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotQueued(key.clone()))?;
        if item.in_flight.is_some() {
            return Err(Error::AlreadyInFlight(key.clone()));
        }
        item.in_flight = Some(item.revision);
        Ok(item.clone())
    }

    /// Return an in-flight item to the queue untouched, so it is sent again.
    ///
    /// Used when settling a send could not finish locally. Returns whether
    /// the key was in flight.
    pub fn abort(&mut self, key: &DocumentKey) -> bool {
        self.items
            .get_mut(key)
            .and_then(|item| item.in_flight.take())
            .is_some()
    }

    /// Record a remote acknowledgement for an in-flight item.
    pub fn complete(
        &mut self,
        key: &DocumentKey,
        version: Version,
        now: Timestamp,
    ) -> Result<SuccessOutcome> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotQueued(key.clone()))?;
        let sent = item.in_flight.take();

        if sent == Some(item.revision) {
            let mut item = self.remove(key).ok_or_else(|| Error::NotQueued(key.clone()))?;
            item.status = SyncStatus::Confirmed { version };
            return Ok(SuccessOutcome::Removed { item, version });
        }

        // The create reached the remote; later edits go out as updates.
        if item.kind == MutationKind::Create {
            item.kind = MutationKind::Update;
        }
        item.attempts = 0;
        item.last_error = None;
        item.next_attempt_at = now;
        Ok(SuccessOutcome::Requeued {
            item: item.clone(),
            version,
        })
    }

    /// Record a remote failure for an in-flight item.
    ///
    /// Permanent failures dead-letter immediately; transient ones back off
    /// until the policy's ceiling.
    pub fn fail(
        &mut self,
        key: &DocumentKey,
        error: impl Into<String>,
        permanent: bool,
        policy: &RetryPolicy,
        now: Timestamp,
    ) -> Result<FailureOutcome> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotQueued(key.clone()))?;
        item.in_flight = None;
        item.attempts += 1;
        item.last_error = Some(error.into());

        if permanent || policy.is_exhausted(item.attempts) {
            let mut item = self.remove(key).ok_or_else(|| Error::NotQueued(key.clone()))?;
            item.status = SyncStatus::Failed {
                reason: item.last_error.clone().unwrap_or_default(),
            };
            let letter = DeadLetter {
                item,
                failed_at: now,
            };
            self.dead_letters.insert(key.clone(), letter.clone());
            return Ok(FailureOutcome::DeadLettered(letter));
        }

        item.next_attempt_at = now.saturating_add(policy.delay_ms(item.attempts));
        Ok(FailureOutcome::Retrying(item.clone()))
    }

    /// Drop the queued item for a key, if any.
    pub fn remove(&mut self, key: &DocumentKey) -> Option<QueueItem> {
        let item = self.items.remove(key)?;
        self.order.remove(&item.order_key());
        Some(item)
    }

    /// Re-insert a persisted item, e.g. after a restart.
    pub fn restore(&mut self, mut item: QueueItem) {
        item.in_flight = None;
        self.next_seq = self.next_seq.max(item.seq + 1);
        if let Some(previous) = self.items.remove(&item.key) {
            self.order.remove(&previous.order_key());
        }
        self.order.insert(item.order_key(), item.key.clone());
        self.items.insert(item.key.clone(), item);
    }

    /// Re-insert a persisted dead letter.
    pub fn restore_dead_letter(&mut self, letter: DeadLetter) {
        self.dead_letters.insert(letter.item.key.clone(), letter);
    }

    /// Move a dead letter back into the queue with a fresh retry budget.
    pub fn revive(&mut self, key: &DocumentKey, now: Timestamp) -> Result<QueueItem> {
        let letter = self
            .dead_letters
            .remove(key)
            .ok_or_else(|| Error::NotQueued(key.clone()))?;
        let seq = self.bump_seq();
        let mut item = letter.item;
        item.enqueued_at = now;
        item.next_attempt_at = now;
        item.attempts = 0;
        item.last_error = None;
        item.seq = seq;
        item.status = SyncStatus::Pending;
        item.in_flight = None;
        self.restore(item.clone());
        Ok(item)
    }

    pub fn dead_letter(&self, key: &DocumentKey) -> Option<&DeadLetter> {
        self.dead_letters.get(key)
    }

    /// Forget a dead letter.
    pub fn discard_dead_letter(&mut self, key: &DocumentKey) -> Option<DeadLetter> {
        self.dead_letters.remove(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&QueueItem> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.items.contains_key(key)
    }

    /// Sync status for a key: pending while queued, failed once dead-lettered.
    pub fn status(&self, key: &DocumentKey) -> Option<SyncStatus> {
        if let Some(item) = self.items.get(key) {
            return Some(item.status.clone());
        }
        self.dead_letters
            .get(key)
            .map(|letter| letter.item.status.clone())
    }

    /// Items in FIFO order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.order
            .values()
            .filter_map(|key| self.items.get(key).cloned())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.values().cloned().collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
