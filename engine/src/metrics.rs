//! Read-only metrics snapshot for the operational dashboard.
//!
//! Field names follow the dashboard's wire format.

use crate::{CacheStats, CollectionName, ConnectionHealth, ConnectionState, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub is_online: bool,
    #[serde(rename = "isFirebaseConnected")]
    pub is_remote_connected: bool,
    pub last_sync_time: Option<Timestamp>,
    pub health: ConnectionHealth,
}

impl From<ConnectionState> for ConnectionMetrics {
    fn from(state: ConnectionState) -> Self {
        Self {
            is_online: state.is_online,
            is_remote_connected: state.is_remote_connected,
            last_sync_time: state.last_sync_time,
            health: state.health(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub active_subscriptions: usize,
    pub is_offline: bool,
}

/// Record counts of the durable store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStats {
    /// Live (non-tombstoned) records across all collections
    pub total_size: usize,
    /// Live records per collection
    pub store_stats: BTreeMap<CollectionName, usize>,
}

impl OfflineStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (CollectionName, usize)>) -> Self {
        let store_stats: BTreeMap<_, _> = counts.into_iter().collect();
        Self {
            total_size: store_stats.values().sum(),
            store_stats,
        }
    }
}

/// Aggregated engine metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub connection_state: ConnectionMetrics,
    pub cache_metrics: CacheMetrics,
    pub offline_stats: OfflineStats,
    pub sync_queue_size: usize,
    pub dead_letter_count: usize,
}

impl PerformanceMetrics {
    pub fn assemble(
        connection: ConnectionState,
        cache: &CacheStats,
        active_subscriptions: usize,
        offline_stats: OfflineStats,
        sync_queue_size: usize,
        dead_letter_count: usize,
    ) -> Self {
        Self {
            connection_state: connection.into(),
            cache_metrics: CacheMetrics {
                cache_hit_rate: cache.hit_rate,
                cache_size: cache.size,
                active_subscriptions,
                is_offline: !connection.is_online,
            },
            offline_stats,
            sync_queue_size,
            dead_letter_count,
        }
    }
}
