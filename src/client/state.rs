//! Connection state machine and the presence value derived from it.

/// Where a connector is in its connect/retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// The connection failed or went silent.
    Error,
    /// The server closed the stream cleanly.
    DisconnectedByPeer,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Terminal: no more attempts.
    GivenUp,
}

impl ConnectionState {
    /// Whether the cycle allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Error)
                | (Connected, DisconnectedByPeer)
                | (Error, Reconnecting)
                | (DisconnectedByPeer, Reconnecting)
                | (Reconnecting, Connecting)
                | (Connecting | Connected | Error | DisconnectedByPeer | Reconnecting, GivenUp)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::GivenUp
    }

    pub fn presence(self) -> Presence {
        match self {
            ConnectionState::Connecting | ConnectionState::Reconnecting => Presence::Connecting,
            ConnectionState::Connected => Presence::Live,
            ConnectionState::Error
            | ConnectionState::DisconnectedByPeer
            | ConnectionState::GivenUp => Presence::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::DisconnectedByPeer => "disconnected_by_peer",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::GivenUp => "given_up",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a UI shows for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    Connecting,
    Live,
    Disconnected,
}
