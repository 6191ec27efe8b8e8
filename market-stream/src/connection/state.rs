use derive_more::Display;
use serde::Serialize;

/// Lifecycle state of a [`ConnectionManager`](super::ConnectionManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Display)]
pub enum ConnectionState {
    /// Created, never connected
    #[default]
    Idle,
    /// Waiting on the backend health check
    Probing,
    /// Socket handshake in flight
    Connecting,
    Open,
    /// Backoff timer armed, next attempt pending
    Reconnecting,
    /// Frontend-only mode: backend unavailable or retry budget spent
    Degraded,
    /// Manually disconnected, or failed with reconnect disabled
    Closed,
}

impl ConnectionState {
    /// States in which `connect()` starts a new attempt.
    pub fn accepts_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Closed)
    }

    /// States owning (or about to own) a socket.
    pub fn has_socket(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Idle.accepts_connect());
        assert!(ConnectionState::Closed.accepts_connect());
        assert!(!ConnectionState::Degraded.accepts_connect());
        assert!(!ConnectionState::Reconnecting.accepts_connect());

        assert!(ConnectionState::Connecting.has_socket());
        assert!(ConnectionState::Open.has_socket());
        assert!(!ConnectionState::Probing.has_socket());

        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
    }
}
