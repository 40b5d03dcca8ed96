//! Transfer worker: moves bytes over an established link
//!
//! Reads are forwarded as `DataReceived` events. Queued writes are flushed
//! one at a time and confirmed with `DataSent`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::event::LinkEvent;
use super::link::Link;
use super::worker::{Worker, WorkerContext, WorkerKind};
use crate::error::LinkError;
use crate::transport::TransportStream;

/// Owns an established link and moves bytes in both directions
pub struct TransferWorker<S> {
    link: Link<S>,
    outbound: mpsc::Receiver<Bytes>,
    buffer_size: usize,
}

impl<S: TransportStream> TransferWorker<S> {
    pub fn new(link: Link<S>, outbound: mpsc::Receiver<Bytes>, buffer_size: usize) -> Self {
        Self {
            link,
            outbound,
            buffer_size,
        }
    }
}

#[async_trait]
impl<S: TransportStream> Worker for TransferWorker<S> {
    type Stream = S;

    fn kind(&self) -> WorkerKind {
        WorkerKind::Transfer
    }

    async fn run(mut self, ctx: WorkerContext<Self::Stream>) {
        let (stream, peer) = self.link.into_parts();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = vec![0u8; self.buffer_size];

        info!("[TRANSFER] Link to {} established", peer);

        let failure = loop {
            tokio::select! {
                biased;

                _ = ctx.cancelled() => break None,

                // Outbound writes from the manager
                outbound = self.outbound.recv() => {
                    let Some(bytes) = outbound else {
                        break None;
                    };

                    let written = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break None,
                        result = write_flush(&mut writer, &bytes) => result,
                    };

                    match written {
                        Ok(()) => {
                            debug!("[TRANSFER] Sent {} bytes to {}", bytes.len(), peer.name);
                            ctx.emit(LinkEvent::DataSent(bytes));
                        }
                        Err(e) => break Some(LinkError::WriteFailed(e.to_string())),
                    }
                }

                // Incoming bytes from the peer
                result = reader.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            break Some(LinkError::LinkBroken("peer closed the connection".into()));
                        }
                        Ok(n) => {
                            debug!("[TRANSFER] Received {} bytes from {}", n, peer.name);
                            ctx.emit(LinkEvent::DataReceived {
                                bytes: Bytes::copy_from_slice(&read_buf[..n]),
                                length: n,
                            });
                        }
                        Err(e) => break Some(LinkError::LinkBroken(e.to_string())),
                    }
                }
            }
        };

        let mut stream = reader.unsplit(writer);
        match failure {
            None => {
                debug!("[TRANSFER] Worker {} cancelled, closing link to {}", ctx.id(), peer);
                if let Err(e) = TransportStream::shutdown(&mut stream).await {
                    debug!("[TRANSFER] Link to {} closed uncleanly: {}", peer, e);
                }
            }
            Some(error) => {
                warn!("[TRANSFER] Link to {} lost: {}", peer, error);
                drop(stream);
                ctx.fail(error);
            }
        }
    }
}

async fn write_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}
