//! Device Registry
//!
//! Keeps the ordered device list (bonded devices, a separator, discovered
//! devices). Readers only ever see whole snapshots published through a
//! `watch` channel; every mutation replaces the list.

use crate::domain::error::{Permission, SessionError};
use crate::domain::models::{DeviceListEntry, RemoteDevice};
use crate::infrastructure::bluetooth::adapter::{BluetoothAdapter, PermissionChecker};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

pub const PAIRED_SECTION: &str = "Paired";
pub const AVAILABLE_SECTION: &str = "Available";

pub type DeviceList = Arc<Vec<DeviceListEntry>>;

pub struct DeviceRegistry {
    adapter: Arc<dyn BluetoothAdapter>,
    permissions: Arc<dyn PermissionChecker>,
    /// Bonded addresses as of the last successful load
    bonded: Mutex<HashSet<String>>,
    devices: watch::Sender<DeviceList>,
}

impl DeviceRegistry {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, permissions: Arc<dyn PermissionChecker>) -> Self {
        let (devices, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            adapter,
            permissions,
            bonded: Mutex::new(HashSet::new()),
            devices,
        }
    }

    /// Replace the list with the bonded devices and an empty "Available" section.
    ///
    /// Without the connect permission the list is left untouched.
    pub fn load_known_devices(&self) -> Result<(), SessionError> {
        self.permissions.require(Permission::Connect)?;

        let bonded = self.adapter.bonded_devices();
        let mut entries = Vec::with_capacity(bonded.len() + 2);
        let mut addresses = HashSet::with_capacity(bonded.len());

        entries.push(DeviceListEntry::Section(PAIRED_SECTION.to_string()));
        for device in bonded {
            if addresses.insert(device.address.clone()) {
                entries.push(DeviceListEntry::DeviceRow(device));
            }
        }
        entries.push(DeviceListEntry::Section(AVAILABLE_SECTION.to_string()));

        info!("Loaded {} paired devices", addresses.len());
        *self.bonded.lock().unwrap_or_else(PoisonError::into_inner) = addresses;
        self.devices.send_replace(Arc::new(entries));
        Ok(())
    }

    /// Append a discovered device unless its address is bonded or already
    /// listed. Returns whether the list changed.
    pub fn record_discovered(&self, device: RemoteDevice) -> bool {
        let bonded = self.bonded_addresses();
        self.devices.send_if_modified(|list| {
            if bonded.contains(&device.address) || contains_address(list, &device.address) {
                debug!("Ignoring known device {}", device.address);
                return false;
            }
            debug!("Discovered {}", device);
            let mut next = Vec::with_capacity(list.len() + 1);
            next.extend(list.iter().cloned());
            next.push(DeviceListEntry::DeviceRow(device));
            *list = Arc::new(next);
            true
        })
    }

    /// Empty the list (adapter turned off).
    pub fn clear(&self) {
        self.devices.send_if_modified(|list| {
            if list.is_empty() {
                return false;
            }
            *list = Arc::new(Vec::new());
            true
        });
    }

    /// Whether `address` is currently bonded. Asks the adapter when allowed,
    /// otherwise falls back to the last loaded bonded set.
    pub fn is_bonded(&self, address: &str) -> bool {
        self.bonded_addresses().contains(address)
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceList> {
        self.devices.subscribe()
    }

    fn bonded_addresses(&self) -> HashSet<String> {
        if self.permissions.has_connect_permission() {
            self.adapter
                .bonded_devices()
                .into_iter()
                .map(|d| d.address)
                .collect()
        } else {
            self.bonded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }
}

fn contains_address(list: &[DeviceListEntry], address: &str) -> bool {
    list.iter()
        .filter_map(DeviceListEntry::device)
        .any(|d| d.address == address)
}
