//! Connection state reported by the connection monitor.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Local network reachability plus remote session liveness.
///
/// `is_online` can be true while `is_remote_connected` is false (for example
/// after a session expires); that combination is the degraded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_online: bool,
    pub is_remote_connected: bool,
    /// Time of the last confirmed remote write or applied remote snapshot
    pub last_sync_time: Option<Timestamp>,
}

impl Default for ConnectionState {
    /// Optimistic about the local network, pessimistic about the remote, so
    /// callers prefer cached data over queuing new failures.
    fn default() -> Self {
        Self {
            is_online: true,
            is_remote_connected: false,
            last_sync_time: None,
        }
    }
}

/// Coarse health derived from a [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Online,
    Degraded,
    Offline,
}

impl ConnectionState {
    pub fn health(&self) -> ConnectionHealth {
        match (self.is_online, self.is_remote_connected) {
            (true, true) => ConnectionHealth::Online,
            (true, false) => ConnectionHealth::Degraded,
            (false, _) => ConnectionHealth::Offline,
        }
    }

    /// Whether queued mutations may be sent.
    ///
    /// An offline device cannot hold a live remote session, whatever the last
    /// remote signal said.
    pub fn can_sync(&self) -> bool {
        self.is_online && self.is_remote_connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_default_is_degraded() {
        let state = ConnectionState::default();
        assert!(state.is_online);
        assert!(!state.is_remote_connected);
        assert_eq!(state.health(), ConnectionHealth::Degraded);
        assert!(!state.can_sync());
    }

    #[test]
    fn health_states() {
        let online = ConnectionState {
            is_online: true,
            is_remote_connected: true,
            last_sync_time: Some(1),
        };
        assert_eq!(online.health(), ConnectionHealth::Online);
        assert!(online.can_sync());

        let offline = ConnectionState {
            is_online: false,
            is_remote_connected: true,
            last_sync_time: None,
        };
        assert_eq!(offline.health(), ConnectionHealth::Offline);
        assert!(!offline.can_sync());
    }
}
