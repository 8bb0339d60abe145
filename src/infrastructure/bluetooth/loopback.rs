//! Loopback Transport
//!
//! An in-process "radio" implementing [`BluetoothAdapter`] over
//! `tokio::io::duplex` pipes. Every adapter attached to the same
//! [`LoopbackRadio`] can discover and connect to the others, which makes it
//! usable for demos and tests without hardware.

use crate::domain::models::{AdapterState, RemoteDevice};
use crate::infrastructure::bluetooth::adapter::{Acceptor, BluetoothAdapter, PeerStream};
use crate::infrastructure::bluetooth::events::{
    RawEvent, RawPayload, ACTION_DISCOVERY_FINISHED, ACTION_DISCOVERY_STARTED, ACTION_FOUND,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Buffer size of each duplex pipe
const PIPE_CAPACITY: usize = 64 * 1024;

struct Listener {
    token: u64,
    incoming: mpsc::UnboundedSender<PeerStream>,
}

#[derive(Default)]
struct RadioState {
    /// Attached nodes by address
    nodes: HashMap<String, Option<String>>,
    /// Open acceptors by (address, service)
    listeners: HashMap<(String, Uuid), Listener>,
}

/// Shared medium connecting loopback adapters
#[derive(Clone, Default)]
pub struct LoopbackRadio {
    state: Arc<Mutex<RadioState>>,
    next_token: Arc<AtomicU64>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Returns its adapter and the raw platform events it emits.
    pub fn attach(
        &self,
        address: &str,
        name: Option<&str>,
    ) -> (Arc<LoopbackAdapter>, mpsc::UnboundedReceiver<RawEvent>) {
        let (events, raw_events) = mpsc::unbounded_channel();
        self.lock()
            .nodes
            .insert(address.to_string(), name.map(str::to_string));
        let adapter = Arc::new(LoopbackAdapter {
            radio: self.clone(),
            device: RemoteDevice::new(name, address),
            bonded: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
            discovering: AtomicBool::new(false),
            events,
        });
        (adapter, raw_events)
    }

    /// Whether an acceptor is open for `service_id` at `address`.
    pub fn has_listener(&self, address: &str, service_id: Uuid) -> bool {
        self.lock()
            .listeners
            .contains_key(&(address.to_string(), service_id))
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn others(&self, address: &str) -> Vec<RemoteDevice> {
        let mut found: Vec<RemoteDevice> = self
            .lock()
            .nodes
            .iter()
            .filter(|(a, _)| a.as_str() != address)
            .map(|(a, name)| RemoteDevice::new(name.as_deref(), a))
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        found
    }
}

/// One node on a [`LoopbackRadio`]
pub struct LoopbackAdapter {
    radio: LoopbackRadio,
    device: RemoteDevice,
    bonded: Mutex<Vec<RemoteDevice>>,
    enabled: AtomicBool,
    discovering: AtomicBool,
    events: mpsc::UnboundedSender<RawEvent>,
}

impl LoopbackAdapter {
    /// This node as seen by its peers
    pub fn device(&self) -> RemoteDevice {
        self.device.clone()
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    /// Pair with `device`
    pub fn bond(&self, device: RemoteDevice) {
        let mut bonded = self.bonded.lock().unwrap_or_else(PoisonError::into_inner);
        if !bonded.iter().any(|d| d.address == device.address) {
            bonded.push(device);
        }
    }

    /// Inject a raw platform event as if the host had broadcast it.
    pub fn emit(&self, event: RawEvent) {
        let _ = self.events.send(event);
    }

    /// Power the radio on or off, emitting the intermediate state.
    pub fn set_enabled(&self, enabled: bool) {
        let (transition, settled) = if enabled {
            (AdapterState::TurningOn, AdapterState::On)
        } else {
            (AdapterState::TurningOff, AdapterState::Off)
        };
        self.emit(RawEvent::adapter_state(transition));
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.discovering.store(false, Ordering::SeqCst);
        }
        self.emit(RawEvent::adapter_state(settled));
    }

    fn ensure_enabled(&self) -> io::Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "bluetooth adapter is off"))
        }
    }
}

#[async_trait]
impl BluetoothAdapter for LoopbackAdapter {
    fn name(&self) -> Option<String> {
        self.device.name.clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    /// Scans complete instantly: every other attached node is reported
    /// between the started and finished events.
    fn start_discovery(&self) -> io::Result<()> {
        self.ensure_enabled()?;
        self.discovering.store(true, Ordering::SeqCst);
        self.emit(RawEvent::new(ACTION_DISCOVERY_STARTED, RawPayload::None));
        for device in self.radio.others(self.address()) {
            self.emit(RawEvent::device(ACTION_FOUND, &device));
        }
        self.discovering.store(false, Ordering::SeqCst);
        self.emit(RawEvent::new(ACTION_DISCOVERY_FINISHED, RawPayload::None));
        Ok(())
    }

    fn cancel_discovery(&self) -> io::Result<()> {
        if self.discovering.swap(false, Ordering::SeqCst) {
            self.emit(RawEvent::new(ACTION_DISCOVERY_FINISHED, RawPayload::None));
        }
        Ok(())
    }

    fn bonded_devices(&self) -> Vec<RemoteDevice> {
        self.bonded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn listen(&self, service_id: Uuid) -> io::Result<Box<dyn Acceptor>> {
        self.ensure_enabled()?;
        let key = (self.address().to_string(), service_id);
        let token = self.radio.next_token.fetch_add(1, Ordering::Relaxed);
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        let mut state = self.radio.lock();
        if state.listeners.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("service {} already has a listener", service_id),
            ));
        }
        state.listeners.insert(
            key.clone(),
            Listener {
                token,
                incoming: incoming_tx,
            },
        );
        debug!("Loopback listener {} open on {}", token, key.0);

        Ok(Box::new(LoopbackAcceptor {
            radio: self.radio.clone(),
            key,
            token,
            incoming,
            closed: false,
        }))
    }

    async fn connect(&self, address: &str, service_id: Uuid) -> io::Result<PeerStream> {
        self.ensure_enabled()?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

        let state = self.radio.lock();
        let listener = state
            .listeners
            .get(&(address.to_string(), service_id))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no service {} at {}", service_id, address),
                )
            })?;
        listener
            .incoming
            .send(Box::new(remote))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;

        info!("Loopback link {} -> {}", self.address(), address);
        Ok(Box::new(local))
    }
}

struct LoopbackAcceptor {
    radio: LoopbackRadio,
    key: (String, Uuid),
    token: u64,
    incoming: mpsc::UnboundedReceiver<PeerStream>,
    closed: bool,
}

#[async_trait]
impl Acceptor for LoopbackAcceptor {
    async fn accept(&mut self) -> io::Result<PeerStream> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "acceptor closed"))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.incoming.close();
        let mut state = self.radio.lock();
        if state.listeners.get(&self.key).map(|l| l.token) == Some(self.token) {
            state.listeners.remove(&self.key);
            debug!("Loopback listener {} closed", self.token);
        }
    }
}

impl Drop for LoopbackAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}
