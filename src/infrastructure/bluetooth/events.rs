//! Platform Event Translation
//!
//! Hosts forward raw broadcast notifications as [`RawEvent`] records over a
//! channel. The translator maps each one to at most one [`DomainEvent`] so
//! platform action names never travel past this module.

use crate::domain::models::{AdapterState, RemoteDevice};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const ACTION_STATE_CHANGED: &str = "android.bluetooth.adapter.action.STATE_CHANGED";
pub const ACTION_DISCOVERY_STARTED: &str = "android.bluetooth.adapter.action.DISCOVERY_STARTED";
pub const ACTION_DISCOVERY_FINISHED: &str = "android.bluetooth.adapter.action.DISCOVERY_FINISHED";
pub const ACTION_FOUND: &str = "android.bluetooth.device.action.FOUND";
pub const ACTION_ACL_CONNECTED: &str = "android.bluetooth.device.action.ACL_CONNECTED";
pub const ACTION_ACL_DISCONNECTED: &str = "android.bluetooth.device.action.ACL_DISCONNECTED";

/// Opaque payload attached to a raw platform event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    None,
    /// Adapter state code
    State(i32),
    /// Device descriptor; either field may be missing
    Device {
        name: Option<String>,
        address: Option<String>,
    },
}

/// A platform notification as delivered by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub action: String,
    pub payload: RawPayload,
}

impl RawEvent {
    pub fn new(action: &str, payload: RawPayload) -> Self {
        Self {
            action: action.to_string(),
            payload,
        }
    }

    pub fn adapter_state(state: AdapterState) -> Self {
        Self::new(ACTION_STATE_CHANGED, RawPayload::State(state.code()))
    }

    pub fn device(action: &str, device: &RemoteDevice) -> Self {
        Self::new(
            action,
            RawPayload::Device {
                name: device.name.clone(),
                address: Some(device.address.clone()),
            },
        )
    }
}

/// Typed connectivity and discovery events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    AdapterStateChanged(AdapterState),
    DeviceFound(RemoteDevice),
    DiscoveryStarted,
    DiscoveryFinished,
    AclConnectionChanged {
        device: RemoteDevice,
        connected: bool,
    },
}

/// Stateless mapping from raw platform events to [`DomainEvent`]s.
pub struct EventTranslator;

impl EventTranslator {
    /// Translate one raw event. Unknown actions and payloads that don't fit
    /// the action are dropped.
    pub fn translate(raw: &RawEvent) -> Option<DomainEvent> {
        match raw.action.as_str() {
            ACTION_STATE_CHANGED => match raw.payload {
                RawPayload::State(code) => {
                    AdapterState::from_code(code).map(DomainEvent::AdapterStateChanged)
                }
                _ => None,
            },
            ACTION_DISCOVERY_STARTED => Some(DomainEvent::DiscoveryStarted),
            ACTION_DISCOVERY_FINISHED => Some(DomainEvent::DiscoveryFinished),
            ACTION_FOUND => device_of(&raw.payload).map(DomainEvent::DeviceFound),
            ACTION_ACL_CONNECTED => device_of(&raw.payload).map(|device| {
                DomainEvent::AclConnectionChanged {
                    device,
                    connected: true,
                }
            }),
            ACTION_ACL_DISCONNECTED => device_of(&raw.payload).map(|device| {
                DomainEvent::AclConnectionChanged {
                    device,
                    connected: false,
                }
            }),
            _ => None,
        }
    }

    /// Translate and hand the result to `handler`, at most once.
    pub fn dispatch(raw: &RawEvent, handler: impl FnOnce(DomainEvent)) {
        match Self::translate(raw) {
            Some(event) => handler(event),
            None => trace!("Dropped platform event {}", raw.action),
        }
    }

    /// Forward every translatable event from `raw_events` to `sink` in
    /// arrival order until either side closes or the subscription is dropped.
    pub fn subscribe(
        mut raw_events: mpsc::UnboundedReceiver<RawEvent>,
        sink: mpsc::UnboundedSender<DomainEvent>,
    ) -> EventSubscription {
        let task = tokio::spawn(async move {
            while let Some(raw) = raw_events.recv().await {
                let mut closed = false;
                Self::dispatch(&raw, |event| closed = sink.send(event).is_err());
                if closed {
                    break;
                }
            }
            debug!("Platform event pump stopped");
        });
        EventSubscription { task: Some(task) }
    }
}

fn device_of(payload: &RawPayload) -> Option<RemoteDevice> {
    match payload {
        RawPayload::Device {
            name,
            address: Some(address),
        } if !address.is_empty() => Some(RemoteDevice {
            name: name.clone(),
            address: address.clone(),
        }),
        _ => None,
    }
}

/// Registration with the platform event source. Dropping it unregisters.
pub struct EventSubscription {
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    pub fn unregister(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_registered(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(address: Option<&str>) -> RawEvent {
        RawEvent::new(
            ACTION_FOUND,
            RawPayload::Device {
                name: Some("Phone".to_string()),
                address: address.map(str::to_string),
            },
        )
    }

    #[test]
    fn test_state_change() {
        assert_eq!(
            EventTranslator::translate(&RawEvent::new(ACTION_STATE_CHANGED, RawPayload::State(12))),
            Some(DomainEvent::AdapterStateChanged(AdapterState::On))
        );
        assert_eq!(
            EventTranslator::translate(&RawEvent::new(ACTION_STATE_CHANGED, RawPayload::State(99))),
            None
        );
        assert_eq!(
            EventTranslator::translate(&RawEvent::new(ACTION_STATE_CHANGED, RawPayload::None)),
            None
        );
    }

    #[test]
    fn test_device_found_requires_address() {
        assert_eq!(
            EventTranslator::translate(&found(Some("AA:BB:CC:DD:EE:FF"))),
            Some(DomainEvent::DeviceFound(RemoteDevice::new(
                Some("Phone"),
                "AA:BB:CC:DD:EE:FF"
            )))
        );
        assert_eq!(EventTranslator::translate(&found(None)), None);
        assert_eq!(EventTranslator::translate(&found(Some(""))), None);
    }

    #[test]
    fn test_discovery_and_acl() {
        assert_eq!(
            EventTranslator::translate(&RawEvent::new(ACTION_DISCOVERY_STARTED, RawPayload::None)),
            Some(DomainEvent::DiscoveryStarted)
        );
        assert_eq!(
            EventTranslator::translate(&RawEvent::new(ACTION_DISCOVERY_FINISHED, RawPayload::None)),
            Some(DomainEvent::DiscoveryFinished)
        );

        let device = RemoteDevice::new(None, "11:22:33:44:55:66");
        assert_eq!(
            EventTranslator::translate(&RawEvent::device(ACTION_ACL_DISCONNECTED, &device)),
            Some(DomainEvent::AclConnectionChanged {
                device,
                connected: false
            })
        );
    }

    #[test]
    fn test_unknown_action_is_not_dispatched() {
        let mut calls = 0;
        EventTranslator::dispatch(
            &RawEvent::new("android.bluetooth.device.action.UUID", RawPayload::None),
            |_| calls += 1,
        );
        assert_eq!(calls, 0);

        EventTranslator::dispatch(&RawEvent::new(ACTION_DISCOVERY_STARTED, RawPayload::None), |_| {
            calls += 1
        });
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_subscription_preserves_order_and_unregisters() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (sink, mut events) = mpsc::unbounded_channel();
        let mut subscription = EventTranslator::subscribe(raw_rx, sink);

        raw_tx.send(found(Some("AA:AA:AA:AA:AA:01"))).unwrap();
        raw_tx.send(found(None)).unwrap();
        raw_tx.send(found(Some("AA:AA:AA:AA:AA:02"))).unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(first, DomainEvent::DeviceFound(d) if d.address.ends_with("01")));
        assert!(matches!(second, DomainEvent::DeviceFound(d) if d.address.ends_with("02")));

        subscription.unregister();
        assert!(!subscription.is_registered());
        assert!(events.recv().await.is_none());
    }
}
