//! RFCOMM transport implementation for Bluetooth connections

use crate::config::TransportConfig;
use crate::transport::bt_adapter::BtAdapter;
use crate::transport::traits::{
    PeerIdentity, RadioState, Transport, TransportListener, TransportStream,
};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use bluer::rfcomm::{
    Profile, ProfileHandle, Role, Security, SecurityLevel, Socket, SocketAddr as RfcommAddr,
    Stream as RfcommStream,
};
use bluer::{Address, Uuid};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
}

impl RfcommTransportStream {
    pub fn new(stream: RfcommStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
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
impl TransportStream for RfcommTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Registered RFCOMM server profile; dropping it unregisters the service
pub struct RfcommListener {
    handle: ProfileHandle,
    adapter: Arc<BtAdapter>,
}

#[async_trait]
impl TransportListener for RfcommListener {
    type Stream = RfcommTransportStream;

    async fn accept(&mut self) -> Result<(Self::Stream, PeerIdentity)> {
        let req = self
            .handle
            .next()
            .await
            .ok_or_else(|| anyhow!("RFCOMM profile was unregistered"))?;
        let addr = req.device();
        let stream = req
            .accept()
            .map_err(|e| anyhow!("RFCOMM accept from {} failed: {}", addr, e))?;

        let peer = self.adapter.peer_identity(addr).await;
        info!("[BT] Accepted connection from {}", peer);
        Ok((RfcommTransportStream::new(stream), peer))
    }
}

/// Bluetooth RFCOMM transport backed by BlueZ
pub struct RfcommTransport {
    /// `None` when no adapter could be opened
    adapter: Option<Arc<BtAdapter>>,
    channel: u8,
    service_name: String,
    secure_uuid: Uuid,
    insecure_uuid: Uuid,
}

impl RfcommTransport {
    /// Open the default adapter; a missing adapter is reported through `radio_state`
    pub async fn open(config: &TransportConfig) -> Result<Self> {
        let secure_uuid = Uuid::parse_str(&config.secure_uuid)
            .with_context(|| format!("Invalid secure service UUID: {}", config.secure_uuid))?;
        let insecure_uuid = Uuid::parse_str(&config.insecure_uuid).with_context(|| {
            format!("Invalid insecure service UUID: {}", config.insecure_uuid)
        })?;

        let adapter = match BtAdapter::open().await {
            Ok(adapter) => Some(Arc::new(adapter)),
            Err(e) => {
                warn!("[BT] No Bluetooth adapter: {}", e);
                None
            }
        };

        Ok(Self {
            adapter,
            channel: config.channel,
            service_name: config.service_name.clone(),
            secure_uuid,
            insecure_uuid,
        })
    }

    fn adapter(&self) -> Result<&Arc<BtAdapter>> {
        self.adapter
            .as_ref()
            .ok_or_else(|| anyhow!("Bluetooth adapter not available"))
    }

    fn security(secure: bool) -> Security {
        Security {
            level: if secure {
                SecurityLevel::Medium
            } else {
                SecurityLevel::Low
            },
            key_size: 0,
        }
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    type Stream = RfcommTransportStream;
    type Listener = RfcommListener;

    async fn radio_state(&self) -> RadioState {
        match &self.adapter {
            Some(adapter) => adapter.radio_state().await,
            None => RadioState::Unavailable,
        }
    }

    async fn paired_peers(&self) -> Result<Vec<PeerIdentity>> {
        self.adapter()?.paired_peers().await
    }

    async fn listen(&self, secure: bool) -> Result<Self::Listener> {
        let adapter = self.adapter()?.clone();
        let uuid = if secure {
            self.secure_uuid
        } else {
            self.insecure_uuid
        };

        let profile = Profile {
            uuid,
            name: Some(format!(
                "{}{}",
                self.service_name,
                if secure { "Secure" } else { "Insecure" }
            )),
            role: Some(Role::Server),
            channel: Some(self.channel.into()),
            require_authentication: Some(secure),
            require_authorization: Some(false),
            ..Default::default()
        };

        let handle = adapter
            .session()
            .register_profile(profile)
            .await
            .map_err(|e| anyhow!("RFCOMM profile registration failed: {}", e))?;
        debug!("[BT] Listening on service {} channel {}", uuid, self.channel);

        Ok(RfcommListener { handle, adapter })
    }

    async fn connect(&self, peer: &PeerIdentity, secure: bool) -> Result<Self::Stream> {
        let target_addr: Address = peer
            .address
            .parse()
            .map_err(|e| anyhow!("Invalid Bluetooth address {}: {}", peer.address, e))?;

        let socket = Socket::new()?;
        socket.set_security(Self::security(secure))?;

        let socket_addr = RfcommAddr::new(target_addr, self.channel);
        debug!("[BT] Connecting to {} channel {}", target_addr, self.channel);

        let stream = socket
            .connect(socket_addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;

        info!("[BT] Connected to {}", target_addr);
        Ok(RfcommTransportStream::new(stream))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}
