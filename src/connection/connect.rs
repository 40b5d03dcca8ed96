//! Connect worker: a single outbound dial bounded by a timeout

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::link::Link;
use super::worker::{Worker, WorkerContext, WorkerKind};
use crate::error::LinkError;
use crate::transport::{PeerIdentity, Transport};

/// Dials one peer, once
///
/// Secure and insecure attempts are independent; a failed secure attempt is
/// not retried insecurely.
pub struct ConnectWorker<T> {
    transport: Arc<T>,
    peer: PeerIdentity,
    secure: bool,
    connect_timeout: Duration,
}

impl<T: Transport> ConnectWorker<T> {
    pub fn new(
        transport: Arc<T>,
        peer: PeerIdentity,
        secure: bool,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            peer,
            secure,
            connect_timeout,
        }
    }
}

#[async_trait]
impl<T: Transport> Worker for ConnectWorker<T> {
    type Stream = T::Stream;

    fn kind(&self) -> WorkerKind {
        WorkerKind::Connect
    }

    async fn run(self, ctx: WorkerContext<Self::Stream>) {
        info!(
            "[CONNECT] Connecting to {} via {} (secure={})",
            self.peer,
            self.transport.name(),
            self.secure
        );

        // Cancelling drops the in-flight attempt along with any half-open socket
        let attempt = timeout(
            self.connect_timeout,
            self.transport.connect(&self.peer, self.secure),
        );

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("[CONNECT] Worker {} cancelled", ctx.id());
                return;
            }
            result = attempt => result,
        };

        match result {
            Ok(Ok(stream)) => {
                info!("[CONNECT] Connected to {}", self.peer);
                ctx.handoff(Link::new(stream, self.peer));
            }
            Ok(Err(e)) => {
                warn!("[CONNECT] Connection to {} failed: {:#}", self.peer, e);
                ctx.fail(LinkError::ConnectFailed(format!("{:#}", e)));
            }
            Err(_) => {
                warn!(
                    "[CONNECT] Connection to {} timed out after {:?}",
                    self.peer, self.connect_timeout
                );
                ctx.fail(LinkError::ConnectFailed(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        }
    }
}
