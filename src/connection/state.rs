//! Link state machine
//!
//! Defines the valid transitions between connection states. The manager is
//! the only caller; it consults [`next_state`] for every trigger and ignores
//! triggers that are invalid from the current state.

/// Lifecycle state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Idle, no worker running
    #[default]
    None,
    /// Waiting for an inbound connection
    Listen,
    /// Dialing a peer
    Connecting,
    /// A link to a peer is established
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::None => write!(f, "none"),
            ConnectionState::Listen => write!(f, "listening"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `start()` was called
    Start,
    /// `stop()` was called
    Stop,
    /// `connect()` was called
    Connect,
    /// The listen worker accepted an inbound link
    Accepted,
    /// The connect worker established an outbound link
    Dialed,
    /// The listen worker could not open or accept
    ListenFailed,
    /// The connect worker failed or timed out
    ConnectFailed,
    /// The transfer worker lost its link
    LinkLost,
}

/// Get the next state for a trigger, if the transition is valid
pub fn next_state(from: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;
    use Trigger::*;

    match (from, trigger) {
        (None, Start) => Some(Listen),

        // Stop and connect are accepted from anywhere
        (_, Stop) => Some(None),
        (_, Connect) => Some(Connecting),

        (Listen, Accepted) => Some(Connected),
        (Listen, ListenFailed) => Some(None),

        (Connecting, Dialed) => Some(Connected),
        (Connecting, ConnectFailed) => Some(None),

        (Connected, LinkLost) => Some(None),

        _ => Option::None,
    }
}
