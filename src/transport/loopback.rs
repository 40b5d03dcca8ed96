//! In-memory loopback transport
//!
//! Endpoints created from the same [`LoopbackNetwork`] can listen for and dial
//! each other by address. Links are `tokio::io::duplex` pipes. Radio state,
//! the paired list, connect latency, connect and listen failures, and broken
//! writes are all controllable, which makes this the transport used by the
//! connection manager tests.

use crate::transport::traits::{
    PeerIdentity, RadioState, Transport, TransportListener, TransportStream,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Capacity of each direction of a loopback pipe
const PIPE_CAPACITY: usize = 64 * 1024;

type Inbound = (LoopbackStream, PeerIdentity);

struct Registration {
    id: u64,
    tx: mpsc::UnboundedSender<Inbound>,
    fail_writes: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<String, Registration>,
}

/// A shared in-memory medium connecting loopback endpoints
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint with the given local identity
    pub fn endpoint(&self, local: PeerIdentity) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            local,
            settings: Arc::new(Mutex::new(Settings::default())),
        }
    }

    /// Whether an endpoint is currently listening at `address`
    pub fn is_listening(&self, address: &str) -> bool {
        self.lock().listeners.contains_key(address)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stream half of a loopback link
pub struct LoopbackStream {
    inner: DuplexStream,
    severed: CancellationToken,
    severed_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    /// Shared with the owning endpoint's settings
    fail_writes: Arc<AtomicBool>,
}

impl LoopbackStream {
    fn new(inner: DuplexStream, severed: CancellationToken, fail_writes: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            severed_wait: Box::pin(severed.clone().cancelled_owned()),
            severed,
            fail_writes,
        }
    }

    fn poll_severed(&mut self, cx: &mut Context<'_>) -> bool {
        self.severed.is_cancelled() || self.severed_wait.as_mut().poll(cx).is_ready()
    }

    fn severed_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "loopback link severed")
    }
}

impl AsyncRead for LoopbackStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.poll_severed(cx) {
            return Poll::Ready(Err(Self::severed_error()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for LoopbackStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.poll_severed(cx) {
            return Poll::Ready(Err(Self::severed_error()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "loopback write refused",
            )));
        }
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
impl TransportStream for LoopbackStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Registered loopback listener; dropping it frees the address
pub struct LoopbackListener {
    network: LoopbackNetwork,
    address: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl TransportListener for LoopbackListener {
    type Stream = LoopbackStream;

    async fn accept(&mut self) -> Result<(Self::Stream, PeerIdentity)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("Listener at {} was replaced", self.address))
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let mut state = self.network.lock();
        if state.listeners.get(&self.address).map(|r| r.id) == Some(self.id) {
            state.listeners.remove(&self.address);
        }
    }
}

struct Settings {
    radio: RadioState,
    paired: Vec<PeerIdentity>,
    connect_delay: Duration,
    fail_connects: bool,
    fail_listen: bool,
    fail_writes: Arc<AtomicBool>,
    severed: CancellationToken,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            radio: RadioState::Enabled,
            paired: Vec::new(),
            connect_delay: Duration::ZERO,
            fail_connects: false,
            fail_listen: false,
            fail_writes: Arc::new(AtomicBool::new(false)),
            severed: CancellationToken::new(),
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`]
///
/// Clones share settings, so a test can keep a handle after giving the
/// transport to a connection manager.
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local: PeerIdentity,
    settings: Arc<Mutex<Settings>>,
}

impl LoopbackTransport {
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn set_radio_state(&self, radio: RadioState) {
        self.settings().radio = radio;
    }

    pub fn set_paired(&self, peers: Vec<PeerIdentity>) {
        self.settings().paired = peers;
    }

    /// Delay applied to every outbound connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.settings().connect_delay = delay;
    }

    pub fn set_fail_connects(&self, fail: bool) {
        self.settings().fail_connects = fail;
    }

    pub fn set_fail_listen(&self, fail: bool) {
        self.settings().fail_listen = fail;
    }

    /// Make writes on this endpoint's links fail with `BrokenPipe`
    ///
    /// Applies to links already open as well as future ones. Reads are
    /// unaffected.
    pub fn set_fail_writes(&self, fail: bool) {
        self.settings().fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Break every link this endpoint has opened or accepted so far
    ///
    /// Pending and future reads and writes on those links fail with
    /// `ConnectionReset`. Links created afterwards are unaffected.
    pub fn sever_links(&self) {
        let mut settings = self.settings();
        settings.severed.cancel();
        settings.severed = CancellationToken::new();
    }

    fn settings(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    type Stream = LoopbackStream;
    type Listener = LoopbackListener;

    async fn radio_state(&self) -> RadioState {
        self.settings().radio
    }

    async fn paired_peers(&self) -> Result<Vec<PeerIdentity>> {
        Ok(self.settings().paired.clone())
    }

    async fn listen(&self, _secure: bool) -> Result<Self::Listener> {
        if self.settings().fail_listen {
            bail!("Listen refused at {}", self.local.address);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        let fail_writes = self.settings().fail_writes.clone();
        self.network.lock().listeners.insert(
            self.local.address.clone(),
            Registration {
                id,
                tx,
                fail_writes,
            },
        );

        Ok(LoopbackListener {
            network: self.network.clone(),
            address: self.local.address.clone(),
            id,
            rx,
        })
    }

    async fn connect(&self, peer: &PeerIdentity, _secure: bool) -> Result<Self::Stream> {
        let delay = self.settings().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.settings().fail_connects {
            bail!("Connection to {} refused", peer.address);
        }

        let (tx, remote_fail_writes) = self
            .network
            .lock()
            .listeners
            .get(&peer.address)
            .map(|r| (r.tx.clone(), r.fail_writes.clone()))
            .ok_or_else(|| anyhow!("No listener at {}", peer.address))?;

        let (local_half, remote_half) = tokio::io::duplex(PIPE_CAPACITY);
        // Both halves break when the dialing endpoint severs its links.
        let (severed, fail_writes) = {
            let settings = self.settings();
            (settings.severed.clone(), settings.fail_writes.clone())
        };
        let remote = LoopbackStream::new(remote_half, severed.clone(), remote_fail_writes);
        tx.send((remote, self.local.clone()))
            .map_err(|_| anyhow!("Listener at {} closed", peer.address))?;

        Ok(LoopbackStream::new(local_half, severed, fail_writes))
    }

    fn name(&self) -> &'static str {
        "Loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::new(name, format!("{}-addr", name))
    }

    #[tokio::test]
    async fn test_connect_reaches_listener() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(peer("a"));
        let b = network.endpoint(peer("b"));

        let mut listener = b.listen(true).await.unwrap();
        let mut client = a.connect(b.local(), true).await.unwrap();
        let (mut server, from) = listener.accept().await.unwrap();
        assert_eq!(from, peer("a"));

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(peer("a"));
        assert!(a.connect(&peer("b"), true).await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_listener_frees_address() {
        let network = LoopbackNetwork::new();
        let b = network.endpoint(peer("b"));

        let listener = b.listen(true).await.unwrap();
        assert!(network.is_listening("b-addr"));
        drop(listener);
        assert!(!network.is_listening("b-addr"));
    }

    #[tokio::test]
    async fn test_stale_listener_drop_keeps_replacement() {
        let network = LoopbackNetwork::new();
        let b = network.endpoint(peer("b"));

        let old = b.listen(true).await.unwrap();
        let _new = b.listen(true).await.unwrap();
        drop(old);
        assert!(network.is_listening("b-addr"));
    }

    #[tokio::test]
    async fn test_sever_fails_pending_read() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(peer("a"));
        let b = network.endpoint(peer("b"));

        let mut listener = b.listen(true).await.unwrap();
        let mut client = a.connect(b.local(), true).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            client.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        a.sever_links();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_fail_writes_only_breaks_writes() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(peer("a"));
        let b = network.endpoint(peer("b"));

        let mut listener = b.listen(true).await.unwrap();
        let mut client = a.connect(b.local(), true).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        a.set_fail_writes(true);
        let err = client.write_all(b"hi").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // The other direction still works
        server.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_eof() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(peer("a"));
        let b = network.endpoint(peer("b"));

        let mut listener = b.listen(true).await.unwrap();
        let mut client = a.connect(b.local(), true).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
