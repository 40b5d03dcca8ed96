//! Established link handle

use crate::transport::{PeerIdentity, TransportStream};

/// An established byte stream to a peer
///
/// Owned by exactly one worker at a time. The stream is closed when the link
/// is dropped, or gracefully via [`Link::close`].
pub struct Link<S> {
    stream: S,
    peer: PeerIdentity,
}

impl<S: TransportStream> Link<S> {
    pub fn new(stream: S, peer: PeerIdentity) -> Self {
        Self { stream, peer }
    }

    /// Identity of the remote device
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn into_parts(self) -> (S, PeerIdentity) {
        (self.stream, self.peer)
    }

    /// Shut the stream down and release it
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Link to {} closed uncleanly: {}", self.peer, e);
        }
    }
}

impl<S> std::fmt::Debug for Link<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}
