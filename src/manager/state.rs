//! Pure connection state machine
//!
//! All state changes go through [`transition`], which returns `None` for events
//! that are not valid in the current state. The manager applies the result on
//! the consumer context, so transitions are serialized by construction.

use std::fmt;
use tracing::{info, warn};

/// Lifecycle state of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection has been attempted yet
    #[default]
    Idle,
    /// A connect sequence is in flight
    Connecting,
    /// Handshake succeeded and topics are subscribed
    Connected,
    /// A disconnect sequence (or cancellation of a connect) is in flight
    Disconnecting,
    /// Closed, either on request or after an unsolicited loss
    Disconnected,
    /// The last connect attempt failed
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a connect or disconnect task is in flight in this state
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Disconnecting
        )
    }

    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }

    pub fn can_publish(&self) -> bool {
        self.is_connected()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConnectRequested,
    /// Handshake and subscriptions completed
    Established,
    /// Construction or handshake failed
    AttemptFailed,
    /// The connect sequence stopped at a cancellation point
    AttemptCancelled,
    DisconnectRequested,
    /// The disconnect sequence finished closing the transport
    Closed,
    /// The network task reported an unsolicited closure
    ConnectionLost,
    Shutdown,
}

/// Compute the state following `event`, or `None` if the event is not valid in `current`
pub fn transition(current: ConnectionState, event: LifecycleEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use LifecycleEvent::*;

    match (current, event) {
        (Idle | Disconnected | Failed, ConnectRequested) => Some(Connecting),
        (Connecting, Established) => Some(Connected),
        (Connecting, AttemptFailed) => Some(Failed),
        (Connecting | Disconnecting, AttemptCancelled) => Some(Disconnected),
        (Connecting | Connected, DisconnectRequested) => Some(Disconnecting),
        (Disconnecting, Closed) => Some(Disconnected),
        (Connected, ConnectionLost) => Some(Disconnected),
        (_, Shutdown) => Some(Disconnected),
        _ => None,
    }
}

/// Log a state transition
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            warn!("Broker connection lost");
        }
        (ConnectionState::Connecting, ConnectionState::Failed) => {
            warn!("Broker connection attempt failed");
        }
        _ => {
            info!("Connection state: {} -> {}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use LifecycleEvent::*;

    const ALL_STATES: [ConnectionState; 6] =
        [Idle, Connecting, Connected, Disconnecting, Disconnected, Failed];

    #[test]
    fn test_connect_only_from_resting_states() {
        for state in ALL_STATES {
            let next = transition(state, ConnectRequested);
            if state.can_connect() {
                assert_eq!(next, Some(Connecting), "connect from {state}");
            } else {
                assert_eq!(next, None, "connect must be rejected from {state}");
            }
        }
    }

    #[test]
    fn test_connect_attempt_outcomes() {
        assert_eq!(transition(Connecting, Established), Some(Connected));
        assert_eq!(transition(Connecting, AttemptFailed), Some(Failed));
        assert_eq!(transition(Connecting, AttemptCancelled), Some(Disconnected));
        assert_eq!(transition(Connected, Established), None);
        assert_eq!(transition(Idle, AttemptFailed), None);
    }

    #[test]
    fn test_disconnect_sequence() {
        assert_eq!(transition(Connected, DisconnectRequested), Some(Disconnecting));
        assert_eq!(transition(Connecting, DisconnectRequested), Some(Disconnecting));
        assert_eq!(transition(Disconnecting, Closed), Some(Disconnected));
        assert_eq!(transition(Disconnecting, AttemptCancelled), Some(Disconnected));
        assert_eq!(transition(Idle, DisconnectRequested), None);
        assert_eq!(transition(Failed, DisconnectRequested), None);
        assert_eq!(transition(Disconnecting, DisconnectRequested), None);
    }

    #[test]
    fn test_loss_only_applies_while_connected() {
        assert_eq!(transition(Connected, ConnectionLost), Some(Disconnected));
        for state in [Idle, Connecting, Disconnecting, Disconnected, Failed] {
            assert_eq!(transition(state, ConnectionLost), None, "loss from {state}");
        }
    }

    #[test]
    fn test_shutdown_from_any_state() {
        for state in ALL_STATES {
            assert_eq!(transition(state, Shutdown), Some(Disconnected));
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(Connected.can_publish());
        assert!(!Connecting.can_publish());
        assert!(Connecting.is_transitioning());
        assert!(Disconnecting.is_transitioning());
        assert!(!Failed.is_transitioning());
        assert_eq!(ConnectionState::default(), Idle);
        assert_eq!(Disconnecting.to_string(), "Disconnecting");
    }
}
