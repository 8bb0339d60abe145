//! Bluetooth RFCOMM chat core.
//!
//! Hosts plug a platform radio in through
//! [`BluetoothAdapter`](infrastructure::bluetooth::BluetoothAdapter) and drive
//! everything through [`BluetoothSession`].

pub mod domain;
pub mod infrastructure;

pub use domain::error::{Permission, SessionError};
pub use domain::models::{
    AdapterState, ConnectionState, DeviceListEntry, Message, RemoteDevice,
};
pub use infrastructure::bluetooth::{BluetoothSession, SessionConfig};
