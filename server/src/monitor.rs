//! Connection tracking for the device network and the remote session.

use stowage_engine::{ConnectionState, Timestamp};
use tokio::sync::watch;

/// Owns the current [`ConnectionState`] and broadcasts its transitions.
///
/// Observers get a [`watch::Receiver`] and see every change of either flag.
/// Recording a sync time does not wake them.
#[derive(Debug)]
pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(ConnectionState::default())
    }
}

impl ConnectionMonitor {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Record device network reachability. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            changed
        });
        if changed {
            tracing::info!(online, "device network changed");
        }
        changed
    }

    /// Record remote session liveness. Returns whether it changed.
    pub fn set_remote_connected(&self, connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            let changed = state.is_remote_connected != connected;
            state.is_remote_connected = connected;
            changed
        });
        if changed {
            tracing::info!(connected, "remote session changed");
        }
        changed
    }

    /// Record a confirmed remote write or applied snapshot.
    pub fn mark_synced(&self, at: Timestamp) {
        self.tx.send_if_modified(|state| {
            state.last_sync_time = Some(state.last_sync_time.map_or(at, |prev| prev.max(at)));
            false
        });
    }
}
