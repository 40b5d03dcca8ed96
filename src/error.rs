//! Error taxonomy for the link manager
//!
//! Worker-side failures are converted to `Notice` events using the `Display`
//! text of these variants; only radio checks, peer selection and `write`
//! return them to the caller directly.

use thiserror::Error;

/// Errors surfaced by the connection manager and its workers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No Bluetooth adapter is present
    #[error("Bluetooth is not available")]
    RadioUnavailable,

    /// The adapter exists but is powered off
    #[error("Bluetooth is disabled, enable it first")]
    RadioDisabled,

    /// The adapter knows no paired devices
    #[error("No paired devices, pair a device first")]
    NoPairedPeers,

    /// A requested address is not among the paired devices
    #[error("Device {0} is not paired")]
    UnknownPeer(String),

    /// The listening endpoint could not be opened or accept failed
    #[error("Listen failed: {0}")]
    ListenFailed(String),

    /// An outbound connection attempt failed or timed out
    #[error("Unable to connect device: {0}")]
    ConnectFailed(String),

    /// An established link was lost
    #[error("Device connection was lost: {0}")]
    LinkBroken(String),

    /// Writing to an established link failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// `write` was called without an established link
    #[error("Not connected to a device")]
    NotConnected,

    /// The outbound queue of the transfer worker is full
    #[error("Outbound queue is full")]
    WriteQueueFull,

    /// The transport could not answer a query
    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_text() {
        assert_eq!(
            LinkError::ConnectFailed("timed out".into()).to_string(),
            "Unable to connect device: timed out"
        );
        assert_eq!(LinkError::NotConnected.to_string(), "Not connected to a device");
    }
}
