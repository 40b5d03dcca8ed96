//! Worker plumbing shared by the listen, connect and transfer workers
//!
//! A worker is a spawned task that owns at most one transport resource. It
//! reports outcomes to the manager over an unbounded channel tagged with its
//! id, and stops when its cancellation token is tripped.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::event::LinkEvent;
use super::link::Link;
use crate::error::LinkError;
use crate::transport::TransportStream;

/// Monotonic worker identifier, unique per manager
pub type WorkerId = u64;

/// Which worker variant is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Listen,
    Connect,
    Transfer,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Listen => write!(f, "LISTEN"),
            WorkerKind::Connect => write!(f, "CONNECT"),
            WorkerKind::Transfer => write!(f, "TRANSFER"),
        }
    }
}

/// Outcome reported by a worker
pub enum Report<S> {
    /// Forward an event to the consumer
    Event(LinkEvent),
    /// An established link is handed to the manager
    Handoff(Link<S>),
    /// The worker failed and exited
    Failed(LinkError),
}

pub(crate) type ReportSender<S> = mpsc::UnboundedSender<(WorkerId, Report<S>)>;
pub(crate) type ReportReceiver<S> = mpsc::UnboundedReceiver<(WorkerId, Report<S>)>;

/// Counts worker tasks that have not yet returned
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn new(running: &Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self(running.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-worker handle on the report channel and cancellation signal
pub struct WorkerContext<S> {
    id: WorkerId,
    reports: ReportSender<S>,
    cancel: CancellationToken,
    _running: RunningGuard,
}

impl<S> WorkerContext<S> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Resolves once the manager cancels this worker
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn emit(&self, event: LinkEvent) {
        self.send(Report::Event(event));
    }

    pub fn handoff(&self, link: Link<S>) {
        self.send(Report::Handoff(link));
    }

    pub fn fail(&self, error: LinkError) {
        self.send(Report::Failed(error));
    }

    fn send(&self, report: Report<S>) {
        // The manager may already be gone during shutdown
        let _ = self.reports.send((self.id, report));
    }
}

/// A cancellable background unit
#[async_trait]
pub trait Worker: Sized + Send + 'static {
    type Stream: TransportStream;

    fn kind(&self) -> WorkerKind;

    /// Run to completion, reporting through `ctx`
    ///
    /// Must return promptly and silently once `ctx` is cancelled.
    async fn run(self, ctx: WorkerContext<Self::Stream>);
}

/// Manager-side handle on a running worker; dropping it cancels the worker
pub struct WorkerHandle {
    id: WorkerId,
    kind: WorkerKind,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a worker on the current runtime
pub(crate) fn spawn<W: Worker>(
    worker: W,
    id: WorkerId,
    reports: ReportSender<W::Stream>,
    running: &Arc<AtomicUsize>,
) -> WorkerHandle {
    let cancel = CancellationToken::new();
    let kind = worker.kind();
    let ctx = WorkerContext {
        id,
        reports,
        cancel: cancel.clone(),
        _running: RunningGuard::new(running),
    };
    tokio::spawn(worker.run(ctx));

    WorkerHandle { id, kind, cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackStream;
    use std::time::Duration;

    struct IdleWorker;

    #[async_trait]
    impl Worker for IdleWorker {
        type Stream = LoopbackStream;

        fn kind(&self) -> WorkerKind {
            WorkerKind::Listen
        }

        async fn run(self, ctx: WorkerContext<Self::Stream>) {
            ctx.cancelled().await;
            ctx.emit(LinkEvent::Notice("cancelled".into()));
        }
    }

    #[tokio::test]
    async fn test_drop_cancels_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicUsize::new(0));

        let handle = spawn(IdleWorker, 7, tx, &running);
        assert_eq!(handle.id(), 7);
        assert_eq!(handle.kind(), WorkerKind::Listen);
        assert_eq!(running.load(Ordering::SeqCst), 1);

        drop(handle);
        let (id, report) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 7);
        assert!(matches!(report, Report::Event(LinkEvent::Notice(_))));

        tokio::time::timeout(Duration::from_secs(1), async {
            while running.load(Ordering::SeqCst) != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
