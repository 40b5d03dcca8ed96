//! Consumer-facing link events

use bytes::Bytes;

use super::state::ConnectionState;

/// Events delivered to the consumer, in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The manager entered a new state
    StateChanged(ConnectionState),
    /// Bytes read from the link; `length` is the number of valid bytes
    DataReceived { bytes: Bytes, length: usize },
    /// Bytes written to the link
    DataSent(Bytes),
    /// Display name of the newly connected peer
    PeerNamed(String),
    /// Human-readable status or failure message
    Notice(String),
}
