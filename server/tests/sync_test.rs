//! Integration tests for the local-first write path and queue drain.
//!
//! Everything runs against an in-memory SQLite store and the in-process
//! remote, with a manual clock driving versions and backoff.

mod common;

use common::{fields, harness, harness_with, START};
use serde_json::json;
use stowage_engine::SyncStatus;
use stowage_server::{
    DataService, DrainOutcome, EngineConfig, MemoryRemote, OfflineStore, SyncEvent,
};

mod offline_round_trip {
    use super::*;

    #[tokio::test]
    async fn offline_create_reaches_remote_exactly_once() {
        let h = harness().await;
        h.go_offline();

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        let local = h.service.get("clients", &id).await.unwrap().unwrap();
        assert_eq!(local.version, START);
        assert_eq!(
            h.service.sync_status("clients", &id).await.unwrap(),
            Some(SyncStatus::Pending)
        );

        // Nothing leaves while offline.
        assert!(h.drain().await.is_empty());
        assert_eq!(h.remote.write_count(), 0);

        h.clock.advance(50);
        h.go_online();
        let outcomes = h.drain().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_confirmed());
        assert_eq!(h.remote.write_count(), 1);

        let remote = h.remote.document("clients", &id).unwrap();
        assert_eq!(remote.fields["name"], "Ada");
        assert_eq!(remote.version, START + 50);

        let local = h.service.get("clients", &id).await.unwrap().unwrap();
        assert_eq!(local.version, remote.version);
        assert_eq!(
            h.service.sync_status("clients", &id).await.unwrap(),
            Some(SyncStatus::Confirmed {
                version: remote.version
            })
        );

        // A second drain has nothing left to send.
        assert!(h.drain().await.is_empty());
        assert_eq!(h.remote.write_count(), 1);
    }

    #[tokio::test]
    async fn offline_edits_coalesce_into_one_write() {
        let h = harness().await;
        h.go_offline();

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada", "visits": 0})))
            .await
            .unwrap();
        for visits in 1..=3 {
            h.clock.advance(10);
            h.service
                .update("clients", &id, fields(json!({"visits": visits})))
                .await
                .unwrap();
        }
        assert_eq!(h.service.pending().len(), 1);

        h.go_online();
        let outcomes = h.drain().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(h.remote.write_count(), 1);

        let remote = h.remote.document("clients", &id).unwrap();
        assert_eq!(remote.fields["name"], "Ada");
        assert_eq!(remote.fields["visits"], 3);
    }

    #[tokio::test]
    async fn create_then_remove_offline_sends_nothing() {
        let h = harness().await;
        h.go_offline();

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        h.service.remove("clients", &id).await.unwrap();
        assert!(h.service.pending().is_empty());
        assert!(h.service.get("clients", &id).await.unwrap().is_none());

        h.go_online();
        assert!(h.drain().await.is_empty());
        assert_eq!(h.remote.write_count(), 0);
        assert_eq!(h.remote.delete_count(), 0);
    }

    #[tokio::test]
    async fn remove_of_a_synced_document_reaches_remote() {
        let h = harness().await;
        h.go_online();

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        h.drain().await;
        assert!(h.remote.document("clients", &id).is_some());

        h.clock.advance(10);
        h.service.remove("clients", &id).await.unwrap();
        // Removing twice is a no-op.
        h.service.remove("clients", &id).await.unwrap();
        assert!(h.service.get("clients", &id).await.unwrap().is_none());

        let outcomes = h.drain().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_confirmed());
        assert!(h.remote.document("clients", &id).is_none());
        assert_eq!(h.remote.delete_count(), 1);
    }

    #[tokio::test]
    async fn update_of_unknown_or_deleted_document_fails() {
        let h = harness().await;
        h.go_offline();

        let missing = h
            .service
            .update("clients", "nobody", fields(json!({"name": "x"})))
            .await;
        assert!(missing.is_err());

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        h.go_online();
        h.drain().await;
        h.service.remove("clients", &id).await.unwrap();

        let deleted = h
            .service
            .update("clients", &id, fields(json!({"name": "x"})))
            .await;
        assert!(deleted.is_err());
    }
}

mod retries {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use stowage_engine::{Document, Fields, ManualClock, Version};
    use stowage_server::{FeedEvent, RemoteError, RemoteStore};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn transient_failures_back_off_then_dead_letter() {
        let h = harness().await;
        let mut events = h.service.events();
        h.go_offline();
        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();

        // Reported reachable, but every write fails.
        h.remote.set_available(false);
        h.go_online();

        let first = h.drain().await;
        assert!(matches!(
            first.as_slice(),
            [DrainOutcome::Retrying {
                attempts: 1,
                next_attempt_at,
                ..
            }] if *next_attempt_at == START + 100
        ));
        // Not due yet.
        assert!(h.drain().await.is_empty());

        h.clock.advance(100);
        let second = h.drain().await;
        assert!(matches!(
            second.as_slice(),
            [DrainOutcome::Retrying {
                attempts: 2,
                next_attempt_at,
                ..
            }] if *next_attempt_at == START + 300
        ));

        h.clock.advance(200);
        let third = h.drain().await;
        assert!(matches!(third.as_slice(), [DrainOutcome::DeadLettered { .. }]));

        assert!(h.service.pending().is_empty());
        let letters = h.service.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].item.attempts, 3);
        assert!(letters[0].reason().contains("offline"));
        assert!(matches!(
            h.service.sync_status("clients", &id).await.unwrap(),
            Some(SyncStatus::Failed { .. })
        ));

        // Dead letters are never retried on their own.
        h.remote.set_available(true);
        h.clock.advance(60_000);
        assert!(h.drain().await.is_empty());
        assert_eq!(h.remote.write_count(), 0);

        // The local copy keeps the edit.
        let local = h.service.get("clients", &id).await.unwrap().unwrap();
        assert_eq!(local.fields["name"], "Ada");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let retrying = seen
            .iter()
            .filter(|event| matches!(event, SyncEvent::Retrying { .. }))
            .count();
        assert_eq!(retrying, 2);
        assert!(seen
            .iter()
            .any(|event| matches!(event, SyncEvent::DeadLettered { .. })));
    }

    #[tokio::test]
    async fn a_single_transient_failure_recovers() {
        let h = harness().await;
        h.go_online();
        h.remote.fail_next_writes(1);

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        let first = h.drain().await;
        assert!(matches!(first.as_slice(), [DrainOutcome::Retrying { .. }]));

        h.clock.advance(100);
        let second = h.drain().await;
        assert!(matches!(second.as_slice(), [DrainOutcome::Confirmed { .. }]));
        assert_eq!(h.remote.write_count(), 1);
        assert!(h.remote.document("clients", &id).is_some());
    }

    #[tokio::test]
    async fn permanent_rejection_dead_letters_at_once() {
        let h = harness().await;
        h.go_online();
        h.remote.reject_writes(Some("invalid field"));

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        let outcomes = h.drain().await;
        assert!(matches!(
            outcomes.as_slice(),
            [DrainOutcome::DeadLettered { reason, .. }] if reason.contains("invalid field")
        ));
        assert_eq!(h.service.dead_letters()[0].item.attempts, 1);

        // Accepted again: a retried dead letter goes through.
        h.remote.reject_writes(None);
        let revived = h.service.retry_dead_letter("clients", &id).await.unwrap();
        assert_eq!(revived.attempts, 0);
        assert!(h.service.dead_letters().is_empty());
        assert_eq!(
            h.service.sync_status("clients", &id).await.unwrap(),
            Some(SyncStatus::Pending)
        );

        let outcomes = h.drain().await;
        assert!(matches!(outcomes.as_slice(), [DrainOutcome::Confirmed { .. }]));
        assert_eq!(h.remote.write_count(), 1);
    }

    #[tokio::test]
    async fn discarded_dead_letter_resets_to_remote_copy() {
        let h = harness().await;
        h.go_online();

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        h.drain().await;

        h.remote.reject_writes(Some("read only"));
        h.clock.advance(10);
        h.service
            .update("clients", &id, fields(json!({"name": "Bea"})))
            .await
            .unwrap();
        h.drain().await;
        assert_eq!(h.service.dead_letters().len(), 1);

        let letter = h.service.discard_dead_letter("clients", &id).await.unwrap();
        assert_eq!(letter.item.payload["name"], "Bea");
        assert!(h.service.dead_letters().is_empty());

        let local = h.service.get("clients", &id).await.unwrap().unwrap();
        assert_eq!(local.fields["name"], "Ada");
        assert!(h.service.sync_status("clients", &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn discarded_dead_letter_without_remote_copy_tombstones() {
        let h = harness().await;
        h.go_online();
        h.remote.reject_writes(Some("quota exceeded"));

        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        h.drain().await;
        h.service.discard_dead_letter("clients", &id).await.unwrap();

        assert!(h.service.get("clients", &id).await.unwrap().is_none());
        assert!(h.service.retry_dead_letter("clients", &id).await.is_err());
    }

    /// Accepts connections but never answers a write.
    struct Unresponsive;

    #[async_trait]
    impl RemoteStore for Unresponsive {
        async fn write_document(
            &self,
            _collection: &str,
            _id: &str,
            _fields: &Fields,
        ) -> Result<Version, RemoteError> {
            std::future::pending().await
        }

        async fn delete_document(&self, _collection: &str, _id: &str) -> Result<(), RemoteError> {
            std::future::pending().await
        }

        async fn fetch_document(
            &self,
            _collection: &str,
            _id: &str,
        ) -> Result<Option<Document>, RemoteError> {
            Ok(None)
        }

        async fn subscribe(
            &self,
            _collection: &str,
        ) -> Result<mpsc::Receiver<FeedEvent>, RemoteError> {
            Err(RemoteError::Timeout)
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn hung_remote_call_times_out_and_backs_off() {
        let clock = Arc::new(ManualClock::new(START));
        let offline = OfflineStore::in_memory(clock.clone()).await.unwrap();
        let config = EngineConfig {
            remote_timeout: Duration::from_millis(50),
            ..common::config()
        };
        let service = DataService::open(config, offline, Arc::new(Unresponsive), clock)
            .await
            .unwrap();
        service.connection().set_online(true);
        service.connection().set_remote_connected(true);

        let id = service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        let outcomes: Vec<DrainOutcome> = service.drain().collect().await;
        assert!(matches!(
            outcomes.as_slice(),
            [DrainOutcome::Retrying {
                attempts: 1,
                next_attempt_at,
                error,
                ..
            }] if *next_attempt_at == START + 100 && error == "remote call timed out"
        ));

        // Still queued, and the local copy keeps the edit.
        assert_eq!(service.pending().len(), 1);
        let local = service.get("clients", &id).await.unwrap().unwrap();
        assert_eq!(local.fields["name"], "Ada");
    }
}

mod cache_tiers {
    use super::*;

    #[tokio::test]
    async fn pending_documents_survive_eviction() {
        let h = harness_with(EngineConfig {
            cache_capacity: 3,
            ..common::config()
        })
        .await;
        h.go_offline();
        let pinned = h
            .service
            .create("clients", fields(json!({"name": "pending"})))
            .await
            .unwrap();

        // Remote-fetched documents are unpinned and compete for the rest.
        h.service.connection().set_online(true);
        for n in 0..10 {
            h.remote.seed(stowage_engine::Document::new(
                "clients",
                format!("remote-{n}"),
                fields(json!({"n": n})),
                START - 1_000 + n,
            ));
            let fetched = h
                .service
                .get("clients", &format!("remote-{n}"))
                .await
                .unwrap();
            assert!(fetched.is_some());
        }

        let metrics = h.service.get_performance_metrics().await.unwrap();
        assert!(metrics.cache_metrics.cache_size <= 3);
        assert!(h.service.is_cached("clients", &pinned));
        assert!(h.service.is_cached("clients", "remote-9"));
        assert!(!h.service.is_cached("clients", "remote-0"));

        // Evicted entries are still served from the offline store.
        let evicted = h.service.get("clients", "remote-0").await.unwrap().unwrap();
        assert_eq!(evicted.fields["n"], 0);
        assert_eq!(h.remote.fetch_count(), 10);
    }

    #[tokio::test]
    async fn clear_cache_is_idempotent_and_keeps_data() {
        let h = harness().await;
        h.go_offline();
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(
                h.service
                    .create("clients", fields(json!({"n": n})))
                    .await
                    .unwrap(),
            );
        }
        let before = h.service.get_performance_metrics().await.unwrap();
        assert_eq!(before.cache_metrics.cache_size, 4);

        h.service.clear_cache();
        let once = h.service.get_performance_metrics().await.unwrap();
        h.service.clear_cache();
        let twice = h.service.get_performance_metrics().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.cache_metrics.cache_size, 0);
        assert_eq!(once.cache_metrics.cache_hit_rate, 0.0);
        assert_eq!(once.sync_queue_size, 4);
        assert_eq!(once.offline_stats.total_size, 4);

        for id in &ids {
            assert!(h.service.get("clients", id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn hit_rate_covers_recent_lookups() {
        let h = harness().await;
        h.go_offline();
        for n in 0..3 {
            let miss = h.service.get("clients", &format!("absent-{n}")).await.unwrap();
            assert!(miss.is_none());
        }
        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        for _ in 0..7 {
            assert!(h.service.get("clients", &id).await.unwrap().is_some());
        }

        let metrics = h.service.get_performance_metrics().await.unwrap();
        assert!((metrics.cache_metrics.cache_hit_rate - 0.7).abs() < 1e-9);
        assert!(metrics.cache_metrics.is_offline);
        assert_eq!(metrics.cache_metrics.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn cache_never_runs_ahead_of_offline_store() {
        let h = harness().await;
        h.go_online();
        let id = h
            .service
            .create("clients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        h.service
            .update("clients", &id, fields(json!({"name": "Bea"})))
            .await
            .unwrap();
        h.clock.advance(25);
        h.drain().await;

        let key = stowage_engine::DocumentKey::new("clients", &id);
        let stored = h.offline.read(&key).await.unwrap().unwrap();
        let served = h.service.get("clients", &id).await.unwrap().unwrap();
        assert_eq!(served, stored);
        assert_eq!(stored.fields["name"], "Bea");
    }

    #[tokio::test]
    async fn query_filters_live_documents() {
        let h = harness().await;
        h.go_offline();
        let ada = h
            .service
            .create("clients", fields(json!({"city": "Oslo"})))
            .await
            .unwrap();
        let gone = h
            .service
            .create("clients", fields(json!({"city": "Oslo"})))
            .await
            .unwrap();
        h.service
            .create("clients", fields(json!({"city": "Rome"})))
            .await
            .unwrap();
        h.service.remove("clients", &gone).await.unwrap();

        let oslo = h
            .service
            .query("clients", |doc| doc.fields["city"] == "Oslo")
            .await
            .unwrap();
        assert_eq!(oslo.len(), 1);
        assert_eq!(oslo[0].id, ada);

        let metrics = h.service.get_performance_metrics().await.unwrap();
        assert_eq!(metrics.offline_stats.total_size, 2);
        assert_eq!(metrics.offline_stats.store_stats["clients"], 2);
    }
}

mod durability {
    use super::*;
    use std::sync::Arc;
    use stowage_engine::ManualClock;

    #[tokio::test]
    async fn pending_mutations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("stowage.db").display());
        let clock = Arc::new(ManualClock::new(START));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));

        let id = {
            let offline = OfflineStore::open(&url, clock.clone()).await.unwrap();
            let service =
                DataService::open(common::config(), offline, remote.clone(), clock.clone())
                    .await
                    .unwrap();
            service.connection().set_online(false);
            let id = service
                .create("clients", fields(json!({"name": "Ada"})))
                .await
                .unwrap();
            service
                .update("clients", &id, fields(json!({"visits": 1})))
                .await
                .unwrap();
            service.shutdown();
            id
        };

        let offline = OfflineStore::open(&url, clock.clone()).await.unwrap();
        let service = DataService::open(common::config(), offline, remote.clone(), clock.clone())
            .await
            .unwrap();
        assert_eq!(service.pending().len(), 1);
        assert_eq!(
            service.sync_status("clients", &id).await.unwrap(),
            Some(SyncStatus::Pending)
        );

        service.connection().set_remote_connected(true);
        let outcomes: Vec<DrainOutcome> =
            futures::StreamExt::collect(service.drain()).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(remote.write_count(), 1);

        let sent = remote.document("clients", &id).unwrap();
        assert_eq!(sent.fields["name"], "Ada");
        assert_eq!(sent.fields["visits"], 1);
    }

    #[tokio::test]
    async fn dead_letters_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("stowage.db").display());
        let clock = Arc::new(ManualClock::new(START));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));
        remote.reject_writes(Some("invalid"));

        {
            let offline = OfflineStore::open(&url, clock.clone()).await.unwrap();
            let service =
                DataService::open(common::config(), offline, remote.clone(), clock.clone())
                    .await
                    .unwrap();
            service.connection().set_remote_connected(true);
            service
                .create("clients", fields(json!({"name": "Ada"})))
                .await
                .unwrap();
            let _: Vec<DrainOutcome> = futures::StreamExt::collect(service.drain()).await;
            assert_eq!(service.dead_letters().len(), 1);
        }

        let offline = OfflineStore::open(&url, clock.clone()).await.unwrap();
        let service = DataService::open(common::config(), offline, remote, clock)
            .await
            .unwrap();
        assert!(service.pending().is_empty());
        assert_eq!(service.dead_letters().len(), 1);
        assert_eq!(service.dead_letters()[0].reason(), "remote rejected the write: invalid");
    }
}
