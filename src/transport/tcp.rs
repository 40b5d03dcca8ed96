//! TCP transport simulating an RFCOMM link for development

use crate::transport::traits::{
    PeerIdentity, RadioState, Transport, TransportListener, TransportStream,
};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Listening socket for simulated inbound links
pub struct TcpTransportListener {
    inner: TcpListener,
    peers: Vec<PeerIdentity>,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpTransportStream;

    async fn accept(&mut self) -> Result<(Self::Stream, PeerIdentity)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((TcpTransportStream::new(stream), identify(&self.peers, addr)))
    }
}

/// Name an inbound peer after the configured peer list, falling back to its address
///
/// Inbound source ports are ephemeral, so peers are matched on IP alone and
/// the first configured peer on that IP wins.
fn identify(peers: &[PeerIdentity], addr: SocketAddr) -> PeerIdentity {
    peers
        .iter()
        .find(|p| peer_ip(&p.address) == Some(addr.ip()))
        .cloned()
        .unwrap_or_else(|| {
            let address = addr.to_string();
            PeerIdentity::new(address.clone(), address)
        })
}

/// IP of a configured peer address, given as `ip:port` or a bare IP
fn peer_ip(address: &str) -> Option<IpAddr> {
    address
        .parse::<SocketAddr>()
        .map(|a| a.ip())
        .or_else(|_| address.parse::<IpAddr>())
        .ok()
}

/// TCP simulation of the radio transport
///
/// The configured peer list stands in for the adapter's paired devices. There
/// is no link-level encryption, so `secure` only affects logging.
pub struct TcpTransport {
    bind: SocketAddr,
    peers: Vec<PeerIdentity>,
}

impl TcpTransport {
    pub fn new(bind: SocketAddr, peers: Vec<PeerIdentity>) -> Self {
        Self { bind, peers }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpTransportStream;
    type Listener = TcpTransportListener;

    async fn radio_state(&self) -> RadioState {
        RadioState::Enabled
    }

    async fn paired_peers(&self) -> Result<Vec<PeerIdentity>> {
        Ok(self.peers.clone())
    }

    async fn listen(&self, secure: bool) -> Result<Self::Listener> {
        let inner = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind))?;
        debug!("[TCP] Listening on {} (secure={})", self.bind, secure);
        Ok(TcpTransportListener {
            inner,
            peers: self.peers.clone(),
        })
    }

    async fn connect(&self, peer: &PeerIdentity, secure: bool) -> Result<Self::Stream> {
        debug!("[TCP] Connecting to {} (secure={})", peer.address, secure);
        let stream = TcpStream::connect(&peer.address)
            .await
            .map_err(|e| anyhow!("TCP connect to {} failed: {}", peer.address, e))?;
        stream.set_nodelay(true)?;
        Ok(TcpTransportStream::new(stream))
    }

    fn name(&self) -> &'static str {
        "TCP simulation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_identify_known_peer() {
        let peers = vec![
            PeerIdentity::new("bench", "127.0.0.1:4000"),
            PeerIdentity::new("rig", "10.0.0.7"),
        ];

        // Inbound connections arrive from an ephemeral source port
        let known = identify(&peers, "127.0.0.1:53211".parse().unwrap());
        assert_eq!(known, peers[0]);
        let bare = identify(&peers, "10.0.0.7:40000".parse().unwrap());
        assert_eq!(bare.name, "rig");

        let unknown = identify(&peers, "10.0.0.9:5000".parse().unwrap());
        assert_eq!(unknown.name, "10.0.0.9:5000");
        assert_eq!(unknown.address, "10.0.0.9:5000");
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let transport = TcpTransport::new("127.0.0.1:0".parse().unwrap(), Vec::new());
        let mut listener = transport.listen(true).await.unwrap();
        let addr = listener.inner.local_addr().unwrap();

        let peer = PeerIdentity::new("self", addr.to_string());
        let (client, server) = tokio::join!(transport.connect(&peer, false), listener.accept());
        let mut client = client.unwrap();
        let (mut server, _) = server.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
