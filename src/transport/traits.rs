//! Transport trait abstraction for pluggable radio backends

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

/// Identity of a remote device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct PeerIdentity {
    /// Human-readable device name
    pub name: String,
    /// Transport address, unique per endpoint
    pub address: String,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Power state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    /// No adapter present
    Unavailable,
    /// Adapter present but powered off
    Disabled,
    /// Adapter ready for use
    Enabled,
}

/// A transport stream that can read and write bytes
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// A passive endpoint waiting for inbound connections
#[async_trait]
pub trait TransportListener: Send + 'static {
    type Stream: TransportStream;

    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<(Self::Stream, PeerIdentity)>;
}

/// Radio transport capability injected into the connection manager
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The stream type this transport produces
    type Stream: TransportStream;
    /// The listener type this transport produces
    type Listener: TransportListener<Stream = Self::Stream>;

    /// Current state of the local radio
    async fn radio_state(&self) -> RadioState;

    /// Devices already paired with the local adapter
    async fn paired_peers(&self) -> Result<Vec<PeerIdentity>>;

    /// Open a listening endpoint under the secure or insecure service
    async fn listen(&self, secure: bool) -> Result<Self::Listener>;

    /// Attempt to connect, returning a stream on success
    async fn connect(&self, peer: &PeerIdentity, secure: bool) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
