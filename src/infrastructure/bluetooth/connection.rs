//! Connection Orchestrator
//!
//! Owns the session state machine and the sockets behind it. At most one
//! attempt (acceptor or initiator) is live at a time; starting a new one
//! tears the previous one down first, so the most recent command wins.
//!
//! Each attempt runs in its own task and reports through an outcome
//! channel:
//!
//! ```text
//! wait_for_incoming ──> listen ──> accept ──┐
//!                                           ├──> DataTransferChannel ──> MessageReceived...
//! connect(address) ──────> open stream ─────┘
//! ```
//!
//! State changes are published through a `watch` channel and only ever
//! follow [`ConnectionState::can_transition_to`]. Transitions from an attempt
//! task are applied only while that attempt is still the current one.

use crate::domain::error::{Permission, SessionError};
use crate::domain::models::{ConnectionOutcome, ConnectionState, Message, RemoteDevice};
use crate::infrastructure::bluetooth::adapter::{BluetoothAdapter, PeerStream, PermissionChecker};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::transfer::{DataTransferChannel, TransferSender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type OutcomeReceiver = mpsc::UnboundedReceiver<ConnectionOutcome>;
type OutcomeSender = mpsc::UnboundedSender<ConnectionOutcome>;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service record shared by acceptor and initiator
    pub service_id: Uuid,
    /// Inbound payload cap handed to the transfer channel
    pub max_payload_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_id: protocol::SERVICE_ID,
            max_payload_bytes: protocol::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Resources of the current attempt
struct ActiveAttempt {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    sender: Option<Arc<TransferSender>>,
}

pub struct ConnectionOrchestrator {
    adapter: Arc<dyn BluetoothAdapter>,
    permissions: Arc<dyn PermissionChecker>,
    registry: Arc<DeviceRegistry>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    attempt: Mutex<Option<ActiveAttempt>>,
    next_attempt: AtomicU64,
}

impl ConnectionOrchestrator {
    pub fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        permissions: Arc<dyn PermissionChecker>,
        registry: Arc<DeviceRegistry>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            adapter,
            permissions,
            registry,
            config,
            state,
            attempt: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether a transfer channel is up
    pub fn is_connected(&self) -> bool {
        self.lock_attempt()
            .as_ref()
            .is_some_and(|a| a.sender.is_some())
    }

    /// Open an acceptor on the service identifier and wait for one peer.
    ///
    /// The acceptor is closed after the first successful accept.
    pub async fn wait_for_incoming(self: &Arc<Self>) -> Result<OutcomeReceiver, SessionError> {
        self.permissions.require(Permission::Connect)?;
        self.close_connection().await;

        let (id, cancel, outcomes, receiver) = self.begin_attempt(ConnectionState::Listening);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_acceptor(id, cancel, outcomes).await });
        self.attach_task(id, task);
        Ok(receiver)
    }

    /// Open an outbound stream to `address` on the service identifier.
    ///
    /// Any in-progress discovery is cancelled first; scanning degrades
    /// RFCOMM throughput.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<OutcomeReceiver, SessionError> {
        self.permissions.require(Permission::Connect)?;
        if !RemoteDevice::is_valid_address(address) {
            return Err(SessionError::InvalidAddress(address.to_string()));
        }
        if !self.registry.is_bonded(address) {
            debug!("Connecting to {} which is not bonded", address);
        }

        self.close_connection().await;
        self.cancel_discovery();

        let (id, cancel, outcomes, receiver) = self.begin_attempt(ConnectionState::Connecting);
        let this = Arc::clone(self);
        let address = address.to_string();
        let task =
            tokio::spawn(async move { this.run_connector(id, cancel, outcomes, address).await });
        self.attach_task(id, task);
        Ok(receiver)
    }

    /// Send `body` over the active channel. A write failure tears the
    /// session down.
    pub async fn send(&self, body: &str, sender_label: &str) -> Result<Message, SessionError> {
        self.permissions.require(Permission::Connect)?;

        let (id, cancel, sender) = {
            let slot = self.lock_attempt();
            match slot.as_ref() {
                Some(ActiveAttempt {
                    id,
                    cancel,
                    sender: Some(sender),
                    ..
                }) => (*id, cancel.clone(), Arc::clone(sender)),
                _ => return Err(SessionError::NotConnected),
            }
        };

        let message = Message::local(body, sender_label);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SessionError::Transport("send abandoned, connection closed".to_string()));
            }
            r = sender.send(&message) => r,
        };

        match result {
            Ok(()) => Ok(message),
            Err(e) => {
                error!("Send failed, tearing down session: {}", e);
                self.teardown(Some(id)).await;
                Err(e.into_transport())
            }
        }
    }

    /// Close any acceptor or peer socket and return to `Idle`.
    ///
    /// Idempotent; safe from any state.
    pub async fn close_connection(&self) {
        self.teardown(None).await;
    }

    fn cancel_discovery(&self) {
        if !self.permissions.has_scan_permission() || !self.adapter.is_discovering() {
            return;
        }
        match self.adapter.cancel_discovery() {
            Ok(()) => debug!("Cancelled discovery before connecting"),
            Err(e) => warn!("Failed to cancel discovery: {}", e),
        }
    }

    /// Tear down the current attempt (or only attempt `only`) and go `Idle`.
    async fn teardown(&self, only: Option<u64>) {
        let attempt = {
            let mut slot = self.lock_attempt();
            let current = slot.as_ref().map(|a| a.id);
            if only.is_some() && current != only {
                return;
            }
            slot.take()
        };

        if let Some(mut attempt) = attempt {
            if self.state() == ConnectionState::Connected {
                self.apply(ConnectionState::Disconnecting);
            }
            attempt.cancel.cancel();
            if let Some(task) = attempt.task.take() {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
            if let Some(sender) = attempt.sender.take() {
                sender.shutdown().await;
            }
            info!("Connection closed");
        }
        self.apply(ConnectionState::Idle);
    }

    fn begin_attempt(
        &self,
        initial: ConnectionState,
    ) -> (u64, CancellationToken, OutcomeSender, OutcomeReceiver) {
        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (outcomes, receiver) = mpsc::unbounded_channel();

        let mut slot = self.lock_attempt();
        if let Some(stale) = slot.take() {
            // Another command slipped in between teardown and here.
            warn!("Superseding attempt {}", stale.id);
            stale.cancel.cancel();
            self.apply(ConnectionState::Idle);
        }
        self.apply(initial);
        *slot = Some(ActiveAttempt {
            id,
            cancel: cancel.clone(),
            task: None,
            sender: None,
        });
        (id, cancel, outcomes, receiver)
    }

    fn attach_task(&self, id: u64, task: JoinHandle<()>) {
        let mut slot = self.lock_attempt();
        if let Some(attempt) = slot.as_mut().filter(|a| a.id == id) {
            attempt.task = Some(task);
        }
    }

    async fn run_acceptor(self: Arc<Self>, id: u64, cancel: CancellationToken, outcomes: OutcomeSender) {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = self.adapter.listen(self.config.service_id) => r,
        };
        let mut acceptor = match opened {
            Ok(acceptor) => acceptor,
            Err(e) => {
                self.fail(id, &outcomes, SessionError::from(e));
                return;
            }
        };
        info!(
            "Waiting for incoming connection on {} ({})",
            protocol::SERVICE_NAME,
            self.config.service_id
        );

        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = acceptor.accept() => Some(r),
        };
        // Single-session policy: stop listening after the first peer.
        acceptor.close();

        match accepted {
            None => debug!("Accept cancelled"),
            Some(Err(e)) => self.fail(id, &outcomes, SessionError::from(e)),
            Some(Ok(stream)) => {
                info!("Incoming connection accepted");
                if self.publish(id, ConnectionState::Connecting) {
                    self.run_session(id, cancel, outcomes, stream).await;
                }
            }
        }
    }

    async fn run_connector(
        self: Arc<Self>,
        id: u64,
        cancel: CancellationToken,
        outcomes: OutcomeSender,
        address: String,
    ) {
        info!("Connecting to {}", address);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = self.adapter.connect(&address, self.config.service_id) => r,
        };
        match opened {
            Ok(stream) => self.run_session(id, cancel, outcomes, stream).await,
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                self.fail(id, &outcomes, SessionError::from(e));
            }
        }
    }

    async fn run_session(
        &self,
        id: u64,
        cancel: CancellationToken,
        outcomes: OutcomeSender,
        stream: PeerStream,
    ) {
        let (sender, mut listener) = DataTransferChannel::open(stream, self.config.max_payload_bytes);
        let sender = Arc::new(sender);
        if !self.establish(id, Arc::clone(&sender)) {
            sender.shutdown().await;
            return;
        }
        let _ = outcomes.send(ConnectionOutcome::Established);

        let ended = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                r = listener.next() => r,
            };
            match next {
                Ok(Some(message)) => {
                    if cancel.is_cancelled() {
                        break None;
                    }
                    debug!("Received message from {}", message.sender_label());
                    if outcomes.send(ConnectionOutcome::MessageReceived(message)).is_err() {
                        debug!("Outcome receiver dropped, ending session");
                        break Some(Ok(()));
                    }
                }
                Ok(None) => break Some(Ok(())),
                Err(e) => break Some(Err(e.into_transport())),
            }
        };

        drop(listener);
        sender.shutdown().await;

        match ended {
            None => debug!("Session cancelled"),
            Some(Ok(())) => {
                info!("Peer closed the connection");
                self.finish(id, ConnectionState::Idle);
            }
            Some(Err(e)) => {
                warn!("Session ended with error: {}", e);
                if self.finish(id, ConnectionState::Idle) {
                    let _ = outcomes.send(ConnectionOutcome::Failed(e.reason()));
                }
            }
        }
    }

    /// Record the channel and move to `Connected`.
    fn establish(&self, id: u64, sender: Arc<TransferSender>) -> bool {
        let mut slot = self.lock_attempt();
        match slot.as_mut().filter(|a| a.id == id) {
            Some(attempt) if self.apply(ConnectionState::Connected) => {
                attempt.sender = Some(sender);
                info!("Connection established");
                true
            }
            _ => false,
        }
    }

    fn fail(&self, id: u64, outcomes: &OutcomeSender, err: SessionError) {
        let reason = err.reason();
        if self.finish(id, ConnectionState::Failed(reason.clone())) {
            let _ = outcomes.send(ConnectionOutcome::Failed(reason));
        }
    }

    /// Apply `next` if attempt `id` is still current.
    fn publish(&self, id: u64, next: ConnectionState) -> bool {
        let slot = self.lock_attempt();
        slot.as_ref().is_some_and(|a| a.id == id) && self.apply(next)
    }

    /// Apply a terminal state and drop attempt `id`.
    fn finish(&self, id: u64, next: ConnectionState) -> bool {
        let mut slot = self.lock_attempt();
        if slot.as_ref().map(|a| a.id) != Some(id) {
            return false;
        }
        *slot = None;
        self.apply(next);
        true
    }

    /// Publish `next` if it is a legal edge. Repeating the current state is a no-op.
    fn apply(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                warn!("Rejected transition {} -> {}", current, next);
                return false;
            }
            debug!("Connection state {} -> {}", current, next);
            *current = next;
            applied = true;
            true
        });
        applied
    }

    fn lock_attempt(&self) -> MutexGuard<'_, Option<ActiveAttempt>> {
        self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::adapter::{Acceptor, StaticPermissions};
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Adapter whose sockets are scripted by the test
    #[derive(Default)]
    struct ScriptedAdapter {
        journal: Arc<Mutex<Vec<String>>>,
        inbound: Mutex<Option<DuplexStream>>,
        outbound: Mutex<Option<DuplexStream>>,
        discovering: std::sync::atomic::AtomicBool,
    }

    impl ScriptedAdapter {
        fn log(&self, entry: &str) {
            self.journal.lock().unwrap().push(entry.to_string());
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }
    }

    struct ScriptedAcceptor {
        journal: Arc<Mutex<Vec<String>>>,
        stream: Option<DuplexStream>,
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        async fn accept(&mut self) -> io::Result<PeerStream> {
            match self.stream.take() {
                Some(stream) => Ok(Box::new(stream)),
                None => std::future::pending().await,
            }
        }

        fn close(&mut self) {
            self.journal.lock().unwrap().push("acceptor.close".to_string());
        }
    }

    #[async_trait]
    impl BluetoothAdapter for ScriptedAdapter {
        fn name(&self) -> Option<String> {
            Some("Scripted".to_string())
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn is_discovering(&self) -> bool {
            self.discovering.load(Ordering::SeqCst)
        }
        fn start_discovery(&self) -> io::Result<()> {
            self.discovering.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn cancel_discovery(&self) -> io::Result<()> {
            self.log("cancel_discovery");
            self.discovering.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn bonded_devices(&self) -> Vec<RemoteDevice> {
            Vec::new()
        }
        async fn listen(&self, _service_id: Uuid) -> io::Result<Box<dyn Acceptor>> {
            self.log("listen");
            Ok(Box::new(ScriptedAcceptor {
                journal: Arc::clone(&self.journal),
                stream: self.inbound.lock().unwrap().take(),
            }))
        }
        async fn connect(&self, address: &str, _service_id: Uuid) -> io::Result<PeerStream> {
            self.log(&format!("connect {}", address));
            match self.outbound.lock().unwrap().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "host is down")),
            }
        }
    }

    fn orchestrator(adapter: Arc<ScriptedAdapter>) -> Arc<ConnectionOrchestrator> {
        let permissions: Arc<dyn PermissionChecker> = Arc::new(StaticPermissions::granted());
        let registry = Arc::new(DeviceRegistry::new(adapter.clone(), permissions.clone()));
        ConnectionOrchestrator::new(adapter, permissions, registry, ConnectionConfig::default())
    }

    async fn next_outcome(rx: &mut OutcomeReceiver) -> Option<ConnectionOutcome> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outcome")
    }

    async fn wait_state(orch: &ConnectionOrchestrator, want: ConnectionState) {
        let mut rx = orch.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_connect_while_listening_closes_acceptor_first() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let orch = orchestrator(adapter.clone());

        let _listening = orch.wait_for_incoming().await.unwrap();
        assert_eq!(orch.state(), ConnectionState::Listening);
        // Let the acceptor task open its socket.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut outcomes = orch.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(matches!(next_outcome(&mut outcomes).await, Some(ConnectionOutcome::Failed(_))));

        assert_eq!(
            adapter.journal(),
            vec!["listen", "acceptor.close", "connect AA:BB:CC:DD:EE:FF"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let orch = orchestrator(adapter);
        let mut states = orch.subscribe_state();

        let mut outcomes = orch.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        let outcome = next_outcome(&mut outcomes).await;
        assert!(matches!(outcome, Some(ConnectionOutcome::Failed(ref r)) if r.contains("host is down")));
        assert!(matches!(orch.state(), ConnectionState::Failed(_)));
        assert!(next_outcome(&mut outcomes).await.is_none());

        // Idle -> Connecting -> Failed, nothing else.
        assert!(states.has_changed().unwrap());
        assert!(matches!(*states.borrow_and_update(), ConnectionState::Failed(_)));

        orch.close_connection().await;
        assert_eq!(orch.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_cancels_discovery() {
        let adapter = Arc::new(ScriptedAdapter::default());
        adapter.start_discovery().unwrap();
        let orch = orchestrator(adapter.clone());

        let _outcomes = orch.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(!adapter.is_discovering());
        assert_eq!(adapter.journal().first().map(String::as_str), Some("cancel_discovery"));
    }

    #[tokio::test]
    async fn test_invalid_address_and_missing_permission_leave_state_alone() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let permissions = Arc::new(StaticPermissions::new(false, true));
        let registry = Arc::new(DeviceRegistry::new(adapter.clone(), permissions.clone()));
        let orch = ConnectionOrchestrator::new(
            adapter.clone(),
            permissions.clone(),
            registry,
            ConnectionConfig::default(),
        );

        assert_eq!(
            orch.wait_for_incoming().await.err(),
            Some(SessionError::PermissionDenied(Permission::Connect))
        );
        permissions.set(Permission::Connect, true);
        assert_eq!(
            orch.connect("not-an-address").await.err(),
            Some(SessionError::InvalidAddress("not-an-address".to_string()))
        );
        assert_eq!(orch.state(), ConnectionState::Idle);
        assert!(adapter.journal().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_session_forwards_messages() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let (local, mut peer) = tokio::io::duplex(4096);
        *adapter.inbound.lock().unwrap() = Some(local);
        let orch = orchestrator(adapter.clone());

        let mut outcomes = orch.wait_for_incoming().await.unwrap();
        assert_eq!(next_outcome(&mut outcomes).await, Some(ConnectionOutcome::Established));
        assert_eq!(orch.state(), ConnectionState::Connected);
        assert!(orch.is_connected());
        assert!(adapter.journal().contains(&"acceptor.close".to_string()));

        peer.write_all(b"{\"message\":\"hi\",\"senderName\":\"Bob\",\"isFromLocalUser\":true}\n")
            .await
            .unwrap();
        assert_eq!(
            next_outcome(&mut outcomes).await,
            Some(ConnectionOutcome::MessageReceived(Message::remote("hi", "Bob")))
        );

        let sent = orch.send("hello", "Alice").await.unwrap();
        assert!(sent.origin_local());
        let mut line = vec![0u8; 256];
        let n = peer.read(&mut line).await.unwrap();
        assert!(std::str::from_utf8(&line[..n]).unwrap().contains("\"message\":\"hello\""));

        // Peer hangs up: Connected -> Idle.
        drop(peer);
        assert!(next_outcome(&mut outcomes).await.is_none());
        wait_state(&orch, ConnectionState::Idle).await;
        assert!(!orch.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_payload_ends_session() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let (local, mut peer) = tokio::io::duplex(4096);
        *adapter.outbound.lock().unwrap() = Some(local);
        let orch = orchestrator(adapter);

        let mut outcomes = orch.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(next_outcome(&mut outcomes).await, Some(ConnectionOutcome::Established));

        peer.write_all(b"garbage\n").await.unwrap();
        let outcome = next_outcome(&mut outcomes).await;
        assert!(matches!(outcome, Some(ConnectionOutcome::Failed(ref r)) if r.contains("malformed payload")));
        wait_state(&orch, ConnectionState::Idle).await;
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket_and_stops_outcomes() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let (local, mut peer) = tokio::io::duplex(4096);
        *adapter.outbound.lock().unwrap() = Some(local);
        let orch = orchestrator(adapter);

        let mut outcomes = orch.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(next_outcome(&mut outcomes).await, Some(ConnectionOutcome::Established));

        orch.close_connection().await;
        assert_eq!(orch.state(), ConnectionState::Idle);
        assert_eq!(orch.send("late", "Alice").await.err(), Some(SessionError::NotConnected));

        let _ = peer
            .write_all(b"{\"message\":\"late\",\"senderName\":\"Bob\",\"isFromLocalUser\":false}\n")
            .await;
        assert!(next_outcome(&mut outcomes).await.is_none());

        let mut rest = Vec::new();
        assert_eq!(peer.read_to_end(&mut rest).await.unwrap(), 0);

        // Closing again is a no-op.
        orch.close_connection().await;
        assert_eq!(orch.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_close_from_idle_is_noop() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::default()));
        let mut states = orch.subscribe_state();
        orch.close_connection().await;
        orch.close_connection().await;
        assert!(!states.has_changed().unwrap());
    }
}
