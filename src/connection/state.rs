//! Connection lifecycle state
//!
//! Transitions are a pure function so they can be tested without a transport.

/// Lifecycle state of a [`Connection`](super::Connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Released by an explicit disconnect; terminal
    Closed,
}

/// Input to [`next_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectStarted,
    Established,
    /// Peer closed the session or the transport failed
    PeerClosed,
    LocalDisconnect,
}

/// Pure transition function; events that do not apply leave the state unchanged
pub fn next_state(current: ConnectionState, event: StateEvent) -> ConnectionState {
    use ConnectionState::*;
    use StateEvent::*;

    match (current, event) {
        (Closed, _) => Closed,
        (_, LocalDisconnect) => Closed,
        (Disconnected, ConnectStarted) => Connecting,
        (Connecting, Established) => Connected,
        (Connecting | Connected, PeerClosed) => Disconnected,
        (state, _) => state,
    }
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}
