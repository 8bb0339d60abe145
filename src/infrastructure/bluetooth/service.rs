//! Bluetooth Session Service
//!
//! The object UI collaborators talk to. Commands are queued onto a single
//! worker task, which is the only writer of the observable state: device
//! list, adapter state, connection flags, message log and last error.
//! Observers get `watch` receivers and always see whole values.

use crate::domain::error::{Permission, SessionError};
use crate::domain::models::{
    AdapterState, ConnectionOutcome, ConnectionState, Message, SessionCommand,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::{BluetoothAdapter, PermissionChecker};
use crate::infrastructure::bluetooth::connection::{
    ConnectionConfig, ConnectionOrchestrator, OutcomeReceiver,
};
use crate::infrastructure::bluetooth::events::{
    DomainEvent, EventSubscription, EventTranslator, RawEvent,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::registry::{DeviceList, DeviceRegistry};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_id: Uuid,
    /// Overrides the adapter name as sender label
    pub local_name: Option<String>,
    pub max_payload_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_id: protocol::SERVICE_ID,
            local_name: None,
            max_payload_bytes: protocol::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let service_id = match protocol::parse_uuid(&settings.service_uuid) {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Invalid service UUID {:?} in settings ({}), using {}",
                    settings.service_uuid,
                    e,
                    protocol::SERVICE_UUID
                );
                protocol::SERVICE_ID
            }
        };
        let max_payload_bytes = match settings.max_payload_bytes {
            0 => {
                warn!(
                    "Payload cap of 0 bytes in settings, using {}",
                    protocol::DEFAULT_MAX_PAYLOAD_BYTES
                );
                protocol::DEFAULT_MAX_PAYLOAD_BYTES
            }
            bytes if bytes > protocol::MAX_PAYLOAD_BYTES_LIMIT => {
                warn!(
                    "Payload cap of {} bytes in settings exceeds {}, clamping",
                    bytes,
                    protocol::MAX_PAYLOAD_BYTES_LIMIT
                );
                protocol::MAX_PAYLOAD_BYTES_LIMIT
            }
            bytes => bytes,
        };
        Self {
            service_id,
            local_name: settings.local_name.clone(),
            max_payload_bytes,
        }
    }
}

/// Write side of every observable value. Owned by the worker.
struct SessionState {
    adapter_state: watch::Sender<AdapterState>,
    is_connected: watch::Sender<bool>,
    is_connecting: watch::Sender<bool>,
    is_discovering: watch::Sender<bool>,
    messages: watch::Sender<Arc<Vec<Message>>>,
    error: watch::Sender<Option<SessionError>>,
}

/// Facade over discovery, connection and messaging for one session
pub struct BluetoothSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    devices: watch::Receiver<DeviceList>,
    adapter_state: watch::Receiver<AdapterState>,
    connection_state: watch::Receiver<ConnectionState>,
    is_connected: watch::Receiver<bool>,
    is_connecting: watch::Receiver<bool>,
    is_discovering: watch::Receiver<bool>,
    messages: watch::Receiver<Arc<Vec<Message>>>,
    error: watch::Receiver<Option<SessionError>>,
}

impl BluetoothSession {
    /// Build the session and start its worker on the current runtime.
    ///
    /// `raw_events` is the host's platform event feed; it is translated and
    /// consumed until [`release`](Self::release).
    pub fn spawn(
        adapter: Arc<dyn BluetoothAdapter>,
        permissions: Arc<dyn PermissionChecker>,
        raw_events: mpsc::UnboundedReceiver<RawEvent>,
        config: SessionConfig,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(adapter.clone(), permissions.clone()));
        let orchestrator = ConnectionOrchestrator::new(
            adapter.clone(),
            permissions.clone(),
            registry.clone(),
            ConnectionConfig {
                service_id: config.service_id,
                max_payload_bytes: config.max_payload_bytes,
            },
        );

        let initial_adapter_state = if adapter.is_enabled() {
            AdapterState::On
        } else {
            AdapterState::Off
        };
        let (adapter_state, adapter_state_rx) = watch::channel(initial_adapter_state);
        let (is_connected, is_connected_rx) = watch::channel(false);
        let (is_connecting, is_connecting_rx) = watch::channel(false);
        let (is_discovering, is_discovering_rx) = watch::channel(adapter.is_discovering());
        let (messages, messages_rx) = watch::channel(Arc::new(Vec::new()));
        let (error, error_rx) = watch::channel(None);

        let (event_tx, events) = mpsc::unbounded_channel();
        let subscription = EventTranslator::subscribe(raw_events, event_tx);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (send_results_tx, send_results) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            orchestrator.clone(),
            outgoing_rx,
            send_results_tx,
        ));

        let devices = registry.subscribe();
        let connection_state = orchestrator.subscribe_state();

        let worker = SessionWorker {
            adapter,
            permissions,
            registry,
            orchestrator: orchestrator.clone(),
            config,
            state: SessionState {
                adapter_state,
                is_connected,
                is_connecting,
                is_discovering,
                messages,
                error,
            },
            commands: command_rx,
            events,
            subscription,
            connection_state: orchestrator.subscribe_state(),
            outcomes: None,
            epoch: 0,
            outgoing,
            writer,
            send_results,
        };
        let worker = tokio::spawn(worker.run());

        Self {
            commands,
            worker: Mutex::new(Some(worker)),
            devices,
            adapter_state: adapter_state_rx,
            connection_state,
            is_connected: is_connected_rx,
            is_connecting: is_connecting_rx,
            is_discovering: is_discovering_rx,
            messages: messages_rx,
            error: error_rx,
        }
    }

    pub fn devices(&self) -> watch::Receiver<DeviceList> {
        self.devices.clone()
    }

    pub fn adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.adapter_state.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    pub fn is_connected(&self) -> watch::Receiver<bool> {
        self.is_connected.clone()
    }

    pub fn is_connecting(&self) -> watch::Receiver<bool> {
        self.is_connecting.clone()
    }

    pub fn is_discovering(&self) -> watch::Receiver<bool> {
        self.is_discovering.clone()
    }

    pub fn messages(&self) -> watch::Receiver<Arc<Vec<Message>>> {
        self.messages.clone()
    }

    pub fn error(&self) -> watch::Receiver<Option<SessionError>> {
        self.error.clone()
    }

    /// Reload known devices and (re)start scanning.
    pub fn start_discovery(&self) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::StartDiscovery)
    }

    pub fn stop_discovery(&self) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::StopDiscovery)
    }

    pub fn clear_devices(&self) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::ClearDevices)
    }

    pub fn connect(&self, address: &str) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::Connect(address.to_string()))
    }

    pub fn wait_for_incoming(&self) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::WaitForIncoming)
    }

    pub fn send(&self, text: &str) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::Send(text.to_string()))
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::Disconnect)
    }

    /// Unregister from platform events and tear down any live session.
    ///
    /// Call once at end of life; later commands fail with
    /// [`SessionError::Released`].
    pub async fn release(&self) -> Result<(), SessionError> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::Released)?;
        let _ = self.commands.send(SessionCommand::Release);
        if let Err(e) = worker.await {
            error!("Session worker failed: {}", e);
        }
        Ok(())
    }

    fn dispatch(&self, command: SessionCommand) -> Result<(), SessionError> {
        if matches!(command, SessionCommand::Release) {
            return Err(SessionError::Released);
        }
        debug!("Queueing {:?}", command);
        self.commands
            .send(command)
            .map_err(|_| SessionError::Released)
    }
}

impl Drop for BluetoothSession {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            warn!("BluetoothSession dropped without release()");
            let _ = self.commands.send(SessionCommand::Release);
        }
    }
}

type SendResult = (u64, Result<Message, SessionError>);

/// A message waiting for the writer
struct OutgoingMessage {
    epoch: u64,
    body: String,
    sender_label: String,
}

/// Serialized execution context behind the facade
struct SessionWorker {
    adapter: Arc<dyn BluetoothAdapter>,
    permissions: Arc<dyn PermissionChecker>,
    registry: Arc<DeviceRegistry>,
    orchestrator: Arc<ConnectionOrchestrator>,
    config: SessionConfig,
    state: SessionState,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedReceiver<DomainEvent>,
    subscription: EventSubscription,
    connection_state: watch::Receiver<ConnectionState>,
    /// Outcomes of the current attempt
    outcomes: Option<OutcomeReceiver>,
    /// Bumped whenever the current attempt is replaced or closed
    epoch: u64,
    /// Queue of the single writer task; sends reach the wire in command order
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
    writer: JoinHandle<()>,
    send_results: mpsc::UnboundedReceiver<SendResult>,
}

impl SessionWorker {
    async fn run(mut self) {
        info!("Bluetooth session started");
        loop {
            // Connection progress is drained before the next command so a
            // command never observes a half-applied attempt.
            tokio::select! {
                biased;
                changed = self.connection_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = self.connection_state.borrow_and_update().clone();
                    self.handle_state(&state);
                }
                outcome = next_outcome(&mut self.outcomes) => match outcome {
                    Some(outcome) => self.handle_outcome(outcome),
                    None => self.outcomes = None,
                },
                Some((epoch, result)) = self.send_results.recv() => self.handle_send_result(epoch, result),
                Some(event) = self.events.recv() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Release) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartDiscovery => self.start_discovery(),
            SessionCommand::StopDiscovery => self.stop_discovery(),
            SessionCommand::ClearDevices => self.registry.clear(),
            SessionCommand::Connect(address) => {
                self.replace_attempt();
                match self.orchestrator.connect(&address).await {
                    Ok(outcomes) => self.outcomes = Some(outcomes),
                    Err(e) => self.report(e),
                }
            }
            SessionCommand::WaitForIncoming => {
                self.replace_attempt();
                match self.orchestrator.wait_for_incoming().await {
                    Ok(outcomes) => self.outcomes = Some(outcomes),
                    Err(e) => self.report(e),
                }
            }
            SessionCommand::Send(text) => self.send(text),
            SessionCommand::Disconnect => {
                self.replace_attempt();
                self.orchestrator.close_connection().await;
                self.state.is_connected.send_replace(false);
                self.state.is_connecting.send_replace(false);
            }
            SessionCommand::Release => {}
        }
    }

    /// Forget the current attempt; anything it still has buffered is dropped.
    fn replace_attempt(&mut self) {
        self.epoch += 1;
        self.outcomes = None;
    }

    fn start_discovery(&mut self) {
        if let Err(e) = self.registry.load_known_devices() {
            self.report(e);
        }
        if let Err(e) = self.permissions.require(Permission::Scan) {
            self.report(e);
            return;
        }
        if self.adapter.is_discovering() {
            if let Err(e) = self.adapter.cancel_discovery() {
                warn!("Failed to cancel running discovery: {}", e);
            }
        }
        match self.adapter.start_discovery() {
            Ok(()) => info!("Discovery started"),
            Err(e) => self.report(SessionError::from(e)),
        }
    }

    fn stop_discovery(&mut self) {
        if let Err(e) = self.permissions.require(Permission::Scan) {
            self.report(e);
            return;
        }
        if let Err(e) = self.adapter.cancel_discovery() {
            self.report(SessionError::from(e));
        }
    }

    fn send(&mut self, text: String) {
        if !self.orchestrator.is_connected() {
            self.report(SessionError::NotConnected);
            return;
        }
        let message = OutgoingMessage {
            epoch: self.epoch,
            body: text,
            sender_label: self.sender_label(),
        };
        if self.outgoing.send(message).is_err() {
            error!("Writer task is gone, dropping message");
            self.report(SessionError::Transport("writer stopped".to_string()));
        }
    }

    fn sender_label(&self) -> String {
        self.config
            .local_name
            .clone()
            .or_else(|| self.adapter.name())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| protocol::UNKNOWN_SENDER.to_string())
    }

    fn handle_send_result(&mut self, epoch: u64, result: Result<Message, SessionError>) {
        if epoch != self.epoch {
            debug!("Dropping result of abandoned send");
            return;
        }
        match result {
            Ok(message) => self.append(message),
            Err(e) => self.report(e),
        }
    }

    fn handle_outcome(&mut self, outcome: ConnectionOutcome) {
        match outcome {
            ConnectionOutcome::Established => {
                info!("Session established");
                self.state.error.send_replace(None);
            }
            ConnectionOutcome::MessageReceived(message) => self.append(message),
            ConnectionOutcome::Failed(reason) => self.report(SessionError::Transport(reason)),
        }
    }

    fn handle_state(&mut self, state: &ConnectionState) {
        debug!("Connection state is now {}", state);
        self.state.is_connecting.send_replace(state.is_pending());
        match state {
            ConnectionState::Connected => {
                self.state.is_connected.send_replace(true);
            }
            ConnectionState::Connecting | ConnectionState::Listening => {}
            _ => {
                self.state.is_connected.send_replace(false);
            }
        }
    }

    fn handle_event(&mut self, event: DomainEvent) {
        match event {
            DomainEvent::AdapterStateChanged(adapter_state) => {
                info!("Adapter state: {:?}", adapter_state);
                if adapter_state == AdapterState::Off {
                    self.registry.clear();
                    self.state.is_discovering.send_replace(false);
                }
                self.state.adapter_state.send_replace(adapter_state);
            }
            DomainEvent::DeviceFound(device) => {
                self.registry.record_discovered(device);
            }
            DomainEvent::DiscoveryStarted => {
                self.state.is_discovering.send_replace(true);
            }
            DomainEvent::DiscoveryFinished => {
                self.state.is_discovering.send_replace(false);
            }
            DomainEvent::AclConnectionChanged { device, connected } => {
                if self.registry.is_bonded(&device.address) {
                    debug!("ACL link to {} is {}", device, if connected { "up" } else { "down" });
                    self.state.is_connected.send_replace(connected);
                } else {
                    self.report(SessionError::NonPairedTarget(device.address));
                }
            }
        }
    }

    fn append(&self, message: Message) {
        self.state.messages.send_modify(|log| {
            let mut next = Vec::with_capacity(log.len() + 1);
            next.extend(log.iter().cloned());
            next.push(message);
            *log = Arc::new(next);
        });
    }

    fn report(&self, err: SessionError) {
        warn!("{}", err);
        self.state.error.send_replace(Some(err));
    }

    async fn shutdown(mut self) {
        info!("Releasing Bluetooth session");
        self.subscription.unregister();
        self.replace_attempt();
        self.orchestrator.close_connection().await;
        self.state.is_connected.send_replace(false);
        self.state.is_connecting.send_replace(false);
        drop(self.outgoing);
        if let Err(e) = self.writer.await {
            warn!("Writer task ended abnormally: {}", e);
        }
    }
}

/// Sends queued messages one at a time so the wire sees them in command order.
async fn run_writer(
    orchestrator: Arc<ConnectionOrchestrator>,
    mut outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
    results: mpsc::UnboundedSender<SendResult>,
) {
    while let Some(message) = outgoing.recv().await {
        let result = orchestrator
            .send(&message.body, &message.sender_label)
            .await;
        if results.send((message.epoch, result)).is_err() {
            break;
        }
    }
    debug!("Writer stopped");
}

async fn next_outcome(outcomes: &mut Option<OutcomeReceiver>) -> Option<ConnectionOutcome> {
    match outcomes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
