//! Connection manager: owns the link state and the single live worker

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::connect::ConnectWorker;
use super::event::LinkEvent;
use super::link::Link;
use super::listen::ListenWorker;
use super::state::{next_state, ConnectionState, Trigger};
use super::transfer::TransferWorker;
use super::worker::{self, Report, ReportReceiver, ReportSender, WorkerHandle, WorkerId, WorkerKind};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::transport::{PeerIdentity, RadioState, Transport};

/// Manages the link to a single peer
///
/// All mutation happens through `&mut self` on the consumer's task; workers
/// only ever report back over the internal channel. The consumer must keep
/// calling [`ConnectionManager::next_event`] for handoffs and recovery to take
/// effect. Operations that start workers must be called inside a Tokio runtime.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: LinkConfig,
    state: ConnectionState,
    /// The single live worker, if any
    worker: Option<WorkerHandle>,
    /// Write queue of the transfer worker, present only while connected
    outbound: Option<mpsc::Sender<Bytes>>,
    peer: Option<PeerIdentity>,
    next_worker_id: WorkerId,
    reports_tx: ReportSender<T::Stream>,
    reports_rx: ReportReceiver<T::Stream>,
    pending: VecDeque<LinkEvent>,
    relisten_at: Option<Instant>,
    relisten_delay: Duration,
    running: Arc<AtomicUsize>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create an idle manager over the given transport
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let relisten_delay = config.relisten_delay();

        Self {
            transport: Arc::new(transport),
            config,
            state: ConnectionState::None,
            worker: None,
            outbound: None,
            peer: None,
            next_worker_id: 0,
            reports_tx,
            reports_rx,
            pending: VecDeque::new(),
            relisten_at: None,
            relisten_delay,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Peer of the established link, while connected
    pub fn connected_peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    /// Kind of the worker the manager currently holds
    pub fn active_worker(&self) -> Option<WorkerKind> {
        self.worker.as_ref().map(|w| w.kind())
    }

    /// Number of worker tasks still running, including cancelled ones that
    /// have not exited yet
    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check that the radio is present and powered
    pub async fn check_radio(&self) -> Result<(), LinkError> {
        match self.transport.radio_state().await {
            RadioState::Enabled => Ok(()),
            RadioState::Disabled => Err(LinkError::RadioDisabled),
            RadioState::Unavailable => Err(LinkError::RadioUnavailable),
        }
    }

    /// Devices paired with the local adapter
    pub async fn paired_peers(&self) -> Result<Vec<PeerIdentity>, LinkError> {
        self.transport
            .paired_peers()
            .await
            .map_err(|e| LinkError::Transport(format!("{:#}", e)))
    }

    /// Start listening for inbound connections; no-op unless idle
    pub fn start(&mut self) {
        if self.state != ConnectionState::None {
            debug!("start() ignored in state {}", self.state);
            return;
        }

        self.relisten_at = None;
        let worker = ListenWorker::new(self.transport.clone(), self.config.secure_listen);
        self.replace_worker(worker);
        self.transition(Trigger::Start);
    }

    /// Cancel all activity and go idle until `start()` is called again
    pub fn stop(&mut self) {
        info!("Stopping link manager");
        self.relisten_at = None;
        self.relisten_delay = self.config.relisten_delay();
        self.teardown();
        self.transition(Trigger::Stop);
    }

    /// Dial `peer`, superseding any listen, connect or transfer in progress
    pub fn connect(&mut self, peer: PeerIdentity, secure: bool) {
        info!("Connecting to {}", peer);
        self.relisten_at = None;
        self.teardown();

        let worker = ConnectWorker::new(
            self.transport.clone(),
            peer,
            secure,
            self.config.connect_timeout(),
        );
        self.replace_worker(worker);
        self.transition(Trigger::Connect);
    }

    /// Dial a paired device, the one matching `address` or else the first
    ///
    /// Emits a `Notice` and leaves the state untouched when the radio is not
    /// usable or no suitable paired device exists.
    pub async fn connect_paired(
        &mut self,
        address: Option<&str>,
        secure: bool,
    ) -> Result<PeerIdentity, LinkError> {
        let selected = match self.check_radio().await {
            Ok(()) => match self.paired_peers().await {
                Ok(peers) => select_peer(peers, address),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match selected {
            Ok(peer) => {
                self.connect(peer.clone(), secure);
                Ok(peer)
            }
            Err(e) => {
                warn!("{}", e);
                self.notice(&e);
                Err(e)
            }
        }
    }

    /// Queue bytes for the connected peer
    ///
    /// A `DataSent` event follows once they are written. Empty payloads are
    /// accepted and ignored.
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<(), LinkError> {
        if self.state != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(LinkError::NotConnected)?;

        let bytes = bytes.into();
        if bytes.is_empty() {
            debug!("Skipping empty write");
            return Ok(());
        }

        outbound.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::WriteQueueFull,
            TrySendError::Closed(_) => LinkError::NotConnected,
        })
    }

    /// Receive the next event, applying worker outcomes as they arrive
    ///
    /// Events are returned strictly in the order they were produced. This
    /// method is cancel safe, so it can be used as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> LinkEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }

            let relisten_at = self.relisten_at;
            tokio::select! {
                report = self.reports_rx.recv() => {
                    // The manager holds a sender, so the channel never closes
                    if let Some((id, report)) = report {
                        self.handle_report(id, report);
                    }
                }
                _ = sleep_until(relisten_at.unwrap_or_else(Instant::now)), if relisten_at.is_some() => {
                    self.relisten_at = None;
                    info!("Retrying listen");
                    self.start();
                }
            }
        }
    }

    fn handle_report(&mut self, id: WorkerId, report: Report<T::Stream>) {
        let kind = match &self.worker {
            Some(worker) if worker.id() == id => worker.kind(),
            _ => {
                debug!("Discarding report from stale worker {}", id);
                if let Report::Handoff(link) = report {
                    tokio::spawn(link.close());
                }
                return;
            }
        };

        match report {
            Report::Event(event) => self.pending.push_back(event),
            Report::Handoff(link) => self.on_handoff(kind, link),
            Report::Failed(error) => self.on_failure(kind, error),
        }
    }

    fn on_handoff(&mut self, kind: WorkerKind, link: Link<T::Stream>) {
        let trigger = match kind {
            WorkerKind::Listen => Trigger::Accepted,
            WorkerKind::Connect => Trigger::Dialed,
            WorkerKind::Transfer => {
                warn!("Transfer worker handed off a link, dropping it");
                return;
            }
        };

        let peer = link.peer().clone();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let worker = TransferWorker::new(link, outbound_rx, self.config.read_buffer_size);
        self.replace_worker(worker);
        self.outbound = Some(outbound_tx);
        self.peer = Some(peer.clone());
        self.relisten_delay = self.config.relisten_delay();

        info!("Connected to {}", peer);
        self.transition(trigger);
        self.pending.push_back(LinkEvent::PeerNamed(peer.name));
    }

    fn on_failure(&mut self, kind: WorkerKind, error: LinkError) {
        warn!("[{}] {}", kind, error);
        self.notice(&error);
        self.teardown();

        match kind {
            WorkerKind::Listen => {
                self.transition(Trigger::ListenFailed);
                let delay = self.relisten_delay;
                self.relisten_at = Some(Instant::now() + delay);
                self.relisten_delay =
                    std::cmp::min(delay * 2, self.config.max_relisten_delay());
                info!("Listening again in {:?}", delay);
            }
            WorkerKind::Connect => {
                self.transition(Trigger::ConnectFailed);
                self.start();
            }
            WorkerKind::Transfer => {
                self.transition(Trigger::LinkLost);
                self.start();
            }
        }
    }

    /// Cancel the current worker and spawn its replacement
    fn replace_worker<W>(&mut self, next: W)
    where
        W: worker::Worker<Stream = T::Stream>,
    {
        self.retire_worker();

        self.next_worker_id += 1;
        let id = self.next_worker_id;
        let handle = worker::spawn(next, id, self.reports_tx.clone(), &self.running);
        debug!("Spawned {} worker {}", handle.kind(), id);
        self.worker = Some(handle);
    }

    /// Cancel the current worker and release any open link
    fn teardown(&mut self) {
        self.retire_worker();
        self.outbound = None;
        self.peer = None;
    }

    /// Cancel the current worker, keeping the events it already queued
    ///
    /// Those events are delivered ahead of whatever the caller emits next.
    /// A queued handoff is closed and a queued failure is ignored.
    fn retire_worker(&mut self) {
        let Some(old) = self.worker.take() else {
            return;
        };
        debug!("Cancelling {} worker {}", old.kind(), old.id());
        old.cancel();

        while let Ok((id, report)) = self.reports_rx.try_recv() {
            match report {
                Report::Event(event) if id == old.id() => self.pending.push_back(event),
                Report::Event(_) => debug!("Discarding report from stale worker {}", id),
                Report::Handoff(link) => {
                    debug!("Closing link handed off by retired worker {}", id);
                    tokio::spawn(link.close());
                }
                Report::Failed(error) => {
                    debug!("Ignoring failure of retired worker {}: {}", id, error);
                }
            }
        }
    }

    fn transition(&mut self, trigger: Trigger) {
        match next_state(self.state, trigger) {
            Some(next) if next != self.state => {
                info!("State {} -> {}", self.state, next);
                self.state = next;
                self.pending.push_back(LinkEvent::StateChanged(next));
            }
            Some(_) => {}
            None => warn!("Ignoring {:?} in state {}", trigger, self.state),
        }
    }

    fn notice(&mut self, error: &LinkError) {
        self.pending.push_back(LinkEvent::Notice(error.to_string()));
    }
}

fn select_peer(peers: Vec<PeerIdentity>, address: Option<&str>) -> Result<PeerIdentity, LinkError> {
    if peers.is_empty() {
        return Err(LinkError::NoPairedPeers);
    }
    match address {
        Some(address) => peers
            .into_iter()
            .find(|p| p.address.eq_ignore_ascii_case(address))
            .ok_or_else(|| LinkError::UnknownPeer(address.to_string())),
        None => peers.into_iter().next().ok_or(LinkError::NoPairedPeers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackNetwork, LoopbackTransport};

    fn manager(network: &LoopbackNetwork, name: &str) -> ConnectionManager<LoopbackTransport> {
        let transport = network.endpoint(PeerIdentity::new(name, format!("{}-addr", name)));
        ConnectionManager::new(transport, LinkConfig::default())
    }

    async fn next(mgr: &mut ConnectionManager<LoopbackTransport>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), mgr.next_event())
            .await
            .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_start_enters_listen() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");

        mgr.start();
        assert_eq!(mgr.state(), ConnectionState::Listen);
        assert_eq!(mgr.active_worker(), Some(WorkerKind::Listen));
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::Listen));
    }

    #[tokio::test]
    async fn test_start_is_noop_unless_idle() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");

        mgr.start();
        mgr.start();
        assert_eq!(mgr.pending.len(), 1);

        mgr.connect(PeerIdentity::new("b", "b-addr"), true);
        mgr.start();
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert_eq!(mgr.active_worker(), Some(WorkerKind::Connect));
    }

    #[tokio::test]
    async fn test_connect_sets_connecting_synchronously() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");

        mgr.connect(PeerIdentity::new("nobody", "nowhere"), true);
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert_eq!(mgr.active_worker(), Some(WorkerKind::Connect));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");

        assert_eq!(mgr.write("hello"), Err(LinkError::NotConnected));
        mgr.start();
        assert_eq!(mgr.write("hello"), Err(LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");

        mgr.start();
        mgr.stop();
        assert_eq!(mgr.state(), ConnectionState::None);
        assert_eq!(mgr.active_worker(), None);
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::Listen));
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::None));

        let quiet = tokio::time::timeout(Duration::from_millis(100), mgr.next_event()).await;
        assert!(quiet.is_err());
        assert_eq!(mgr.state(), ConnectionState::None);
    }

    #[tokio::test]
    async fn test_check_radio() {
        let network = LoopbackNetwork::new();
        let mgr = manager(&network, "a");

        assert_eq!(mgr.check_radio().await, Ok(()));
        mgr.transport().set_radio_state(RadioState::Disabled);
        assert_eq!(mgr.check_radio().await, Err(LinkError::RadioDisabled));
        mgr.transport().set_radio_state(RadioState::Unavailable);
        assert_eq!(mgr.check_radio().await, Err(LinkError::RadioUnavailable));
    }

    #[tokio::test]
    async fn test_connect_paired_unknown_address() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");
        mgr.transport()
            .set_paired(vec![PeerIdentity::new("b", "b-addr")]);

        mgr.start();
        let result = mgr.connect_paired(Some("c-addr"), true).await;
        assert_eq!(result, Err(LinkError::UnknownPeer("c-addr".into())));
        assert_eq!(mgr.state(), ConnectionState::Listen);
    }

    #[tokio::test]
    async fn test_connect_paired_reports_missing_radio() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");
        mgr.transport()
            .set_paired(vec![PeerIdentity::new("b", "b-addr")]);
        mgr.transport().set_radio_state(RadioState::Unavailable);

        let result = mgr.connect_paired(None, true).await;
        assert_eq!(result, Err(LinkError::RadioUnavailable));
        assert_eq!(
            next(&mut mgr).await,
            LinkEvent::Notice(LinkError::RadioUnavailable.to_string())
        );
        assert_eq!(mgr.state(), ConnectionState::None);
        assert_eq!(mgr.active_worker(), None);
    }

    #[tokio::test]
    async fn test_connect_paired_picks_address() {
        let network = LoopbackNetwork::new();
        let mut mgr = manager(&network, "a");
        mgr.transport().set_paired(vec![
            PeerIdentity::new("b", "b-addr"),
            PeerIdentity::new("c", "c-addr"),
        ]);

        let peer = mgr.connect_paired(Some("C-ADDR"), false).await.unwrap();
        assert_eq!(peer.name, "c");
        assert_eq!(mgr.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_listen_failure_backs_off_and_retries() {
        let network = LoopbackNetwork::new();
        let config = LinkConfig {
            relisten_delay_ms: 20,
            max_relisten_delay_ms: 80,
            ..LinkConfig::default()
        };
        let transport = network.endpoint(PeerIdentity::new("a", "a-addr"));
        transport.set_fail_listen(true);
        let handle = transport.clone();
        let mut mgr = ConnectionManager::new(transport, config);

        mgr.start();
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::Listen));
        assert!(matches!(next(&mut mgr).await, LinkEvent::Notice(_)));
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::None));
        assert_eq!(mgr.relisten_delay, Duration::from_millis(40));

        handle.set_fail_listen(false);
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::Listen));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !network.is_listening("a-addr") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_relisten() {
        let network = LoopbackNetwork::new();
        let config = LinkConfig {
            relisten_delay_ms: 20,
            ..LinkConfig::default()
        };
        let transport = network.endpoint(PeerIdentity::new("a", "a-addr"));
        transport.set_fail_listen(true);
        let mut mgr = ConnectionManager::new(transport, config);

        mgr.start();
        next(&mut mgr).await;
        next(&mut mgr).await;
        assert_eq!(next(&mut mgr).await, LinkEvent::StateChanged(ConnectionState::None));
        assert!(mgr.relisten_at.is_some());

        mgr.stop();
        assert!(mgr.relisten_at.is_none());
        let quiet = tokio::time::timeout(Duration::from_millis(100), mgr.next_event()).await;
        assert!(quiet.is_err());
    }
}
