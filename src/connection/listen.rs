//! Listen worker: accepts one inbound connection

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::link::Link;
use super::worker::{Worker, WorkerContext, WorkerKind};
use crate::error::LinkError;
use crate::transport::{Transport, TransportListener};

/// Waits for a single inbound connection on the service endpoint
pub struct ListenWorker<T> {
    transport: Arc<T>,
    secure: bool,
}

impl<T: Transport> ListenWorker<T> {
    pub fn new(transport: Arc<T>, secure: bool) -> Self {
        Self { transport, secure }
    }
}

#[async_trait]
impl<T: Transport> Worker for ListenWorker<T> {
    type Stream = T::Stream;

    fn kind(&self) -> WorkerKind {
        WorkerKind::Listen
    }

    async fn run(self, ctx: WorkerContext<Self::Stream>) {
        let opened = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            result = self.transport.listen(self.secure) => result,
        };

        let mut listener = match opened {
            Ok(listener) => listener,
            Err(e) => {
                warn!("[LISTEN] Unable to open {} endpoint: {:#}", self.transport.name(), e);
                ctx.fail(LinkError::ListenFailed(format!("{:#}", e)));
                return;
            }
        };

        info!(
            "[LISTEN] Waiting for inbound {} connection (secure={})",
            self.transport.name(),
            self.secure
        );

        // Dropping the listener on exit closes the endpoint
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("[LISTEN] Worker {} cancelled", ctx.id());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("[LISTEN] Accepted connection from {}", peer);
                    ctx.handoff(Link::new(stream, peer));
                }
                Err(e) => {
                    warn!("[LISTEN] Accept failed: {:#}", e);
                    ctx.fail(LinkError::ListenFailed(format!("{:#}", e)));
                }
            },
        }
    }
}
