//! Platform Transport Boundary
//!
//! The session core never talks to a radio directly. Hosts provide an
//! adapter (RFCOMM sockets, discovery, bonded devices) and a permission
//! check; everything above this module is platform independent.

use crate::domain::error::{Permission, SessionError};
use crate::domain::models::RemoteDevice;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// A connected duplex byte stream to a peer.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub type PeerStream = Box<dyn PeerIo>;

/// Listening endpoint bound to a service identifier.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next peer to complete the accept handshake.
    async fn accept(&mut self) -> io::Result<PeerStream>;

    /// Stop listening and release the server socket.
    fn close(&mut self);
}

/// Local Bluetooth adapter capability.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
    /// Friendly name of the local adapter, if known
    fn name(&self) -> Option<String>;

    fn is_enabled(&self) -> bool;

    fn is_discovering(&self) -> bool;

    fn start_discovery(&self) -> io::Result<()>;

    fn cancel_discovery(&self) -> io::Result<()>;

    fn bonded_devices(&self) -> Vec<RemoteDevice>;

    /// Open an acceptor for `service_id`.
    async fn listen(&self, service_id: Uuid) -> io::Result<Box<dyn Acceptor>>;

    /// Open an outbound stream to `address` on `service_id`.
    async fn connect(&self, address: &str, service_id: Uuid) -> io::Result<PeerStream>;
}

/// Runtime permission capability. Version-gated permission sets are the
/// host's business; the core only asks yes or no.
pub trait PermissionChecker: Send + Sync + 'static {
    fn has_connect_permission(&self) -> bool;

    fn has_scan_permission(&self) -> bool;

    fn require(&self, permission: Permission) -> Result<(), SessionError> {
        let granted = match permission {
            Permission::Connect => self.has_connect_permission(),
            Permission::Scan => self.has_scan_permission(),
        };
        if granted {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied(permission))
        }
    }
}

/// Permission flags that can be flipped at runtime
#[derive(Debug)]
pub struct StaticPermissions {
    connect: AtomicBool,
    scan: AtomicBool,
}

impl StaticPermissions {
    pub fn new(connect: bool, scan: bool) -> Self {
        Self {
            connect: AtomicBool::new(connect),
            scan: AtomicBool::new(scan),
        }
    }

    pub fn granted() -> Self {
        Self::new(true, true)
    }

    pub fn set(&self, permission: Permission, granted: bool) {
        match permission {
            Permission::Connect => self.connect.store(granted, Ordering::SeqCst),
            Permission::Scan => self.scan.store(granted, Ordering::SeqCst),
        }
    }
}

impl PermissionChecker for StaticPermissions {
    fn has_connect_permission(&self) -> bool {
        self.connect.load(Ordering::SeqCst)
    }

    fn has_scan_permission(&self) -> bool {
        self.scan.load(Ordering::SeqCst)
    }
}
