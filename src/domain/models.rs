use std::fmt;

/// A remote Bluetooth device. Identity is the address; the name is
/// informational and may be missing or stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteDevice {
    pub name: Option<String>,
    pub address: String,
}

impl RemoteDevice {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }

    /// Name to show for this device
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown",
        }
    }

    /// Check for the `XX:XX:XX:XX:XX:XX` hardware address form.
    pub fn is_valid_address(address: &str) -> bool {
        let parts: Vec<&str> = address.split(':').collect();
        parts.len() == 6
            && parts
                .iter()
                .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.address)
    }
}

/// One row of the device list: bonded devices first, then a separator,
/// then discovered devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListEntry {
    Section(String),
    DeviceRow(RemoteDevice),
}

impl DeviceListEntry {
    pub fn device(&self) -> Option<&RemoteDevice> {
        match self {
            Self::DeviceRow(device) => Some(device),
            Self::Section(_) => None,
        }
    }
}

/// Radio power state. Externally driven; read-only to the session core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    On,
    TurningOn,
    TurningOff,
}

impl AdapterState {
    /// Map a platform adapter-state code (10..=13) to a state.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(Self::Off),
            11 => Some(Self::TurningOn),
            12 => Some(Self::On),
            13 => Some(Self::TurningOff),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Off => 10,
            Self::TurningOn => 11,
            Self::On => 12,
            Self::TurningOff => 13,
        }
    }
}

/// State of the single tracked session.
///
/// ```text
/// Idle -> Listening -> Connecting -> Connected -> Disconnecting -> Idle
/// Idle -> Connecting
/// Listening | Connecting -> Failed
/// any -> Idle
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl ConnectionState {
    /// Waiting on a peer
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Listening | Self::Connecting)
    }

    /// Whether `next` is a legal edge from this state.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            // Closing is allowed from anywhere.
            (_, Idle) => true,
            (Idle, Listening) | (Idle, Connecting) => true,
            (Listening, Connecting) => true,
            (Connecting, Connected) => true,
            (Listening, Failed(_)) | (Connecting, Failed(_)) => true,
            (Connected, Disconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Listening => write!(f, "listening"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A chat message. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: String,
    sender_label: String,
    origin_local: bool,
}

impl Message {
    /// Message written by this node
    pub fn local(body: impl Into<String>, sender_label: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            sender_label: sender_label.into(),
            origin_local: true,
        }
    }

    /// Message decoded off the wire
    pub fn remote(body: impl Into<String>, sender_label: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            sender_label: sender_label.into(),
            origin_local: false,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn sender_label(&self) -> &str {
        &self.sender_label
    }

    pub fn origin_local(&self) -> bool {
        self.origin_local
    }
}

/// Events emitted while a session attempt is in flight or active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Established,
    MessageReceived(Message),
    Failed(String),
}

/// Commands accepted by the session worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartDiscovery,
    StopDiscovery,
    ClearDevices,
    Connect(String),
    WaitForIncoming,
    Send(String),
    Disconnect,
    Release,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert!(RemoteDevice::is_valid_address("AA:BB:CC:DD:EE:FF"));
        assert!(RemoteDevice::is_valid_address("00:1a:7d:da:71:13"));
        assert!(!RemoteDevice::is_valid_address("AA:BB:CC:DD:EE"));
        assert!(!RemoteDevice::is_valid_address("AA:BB:CC:DD:EE:GG"));
        assert!(!RemoteDevice::is_valid_address(""));
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(RemoteDevice::new(None, "AA:BB:CC:DD:EE:FF").display_name(), "Unknown");
        assert_eq!(RemoteDevice::new(Some(""), "AA:BB:CC:DD:EE:FF").display_name(), "Unknown");
        assert_eq!(RemoteDevice::new(Some("Pixel"), "AA:BB:CC:DD:EE:FF").display_name(), "Pixel");
    }

    #[test]
    fn test_adapter_state_codes() {
        for state in [
            AdapterState::Off,
            AdapterState::On,
            AdapterState::TurningOn,
            AdapterState::TurningOff,
        ] {
            assert_eq!(AdapterState::from_code(state.code()), Some(state));
        }
        assert_eq!(AdapterState::from_code(-2147483648), None);
    }

    #[test]
    fn test_transition_edges() {
        use ConnectionState::*;
        let failed = Failed("boom".to_string());

        assert!(Idle.can_transition_to(&Listening));
        assert!(Idle.can_transition_to(&Connecting));
        assert!(Listening.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&Connected));
        assert!(Connecting.can_transition_to(&failed));
        assert!(Listening.can_transition_to(&failed));
        assert!(Connected.can_transition_to(&Disconnecting));
        assert!(failed.can_transition_to(&Idle));
        assert!(Disconnecting.can_transition_to(&Idle));

        assert!(!Idle.can_transition_to(&Connected));
        assert!(!Listening.can_transition_to(&Connected));
        assert!(!Connected.can_transition_to(&failed));
        assert!(!failed.can_transition_to(&Connecting));
        assert!(!Connected.can_transition_to(&Listening));
    }

    #[test]
    fn test_message_locality_is_fixed_by_constructor() {
        let sent = Message::local("hello", "Alice");
        let received = Message::remote("hello", "Alice");
        assert!(sent.origin_local());
        assert!(!received.origin_local());
        assert_eq!(sent.body(), received.body());
    }
}
