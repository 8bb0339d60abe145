//! Bluetooth Module
//!
//! Single-session RFCOMM chat: discovery, one peer connection at a time, and
//! line-framed JSON messages over the stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   BluetoothSession                       │
//! │  (Facade - commands in, observable state out)            │
//! └──────┬──────────────┬──────────────────┬────────────────┘
//!        │              │                  │
//!        ▼              ▼                  ▼
//! ┌─────────────┐ ┌──────────────┐ ┌───────────────┐
//! │   Events    │ │   Registry   │ │  Connection   │
//! │             │ │              │ │               │
//! │ - platform  │ │ - paired +   │ │ - listen /    │
//! │   actions   │ │   discovered │ │   connect     │
//! │ - typed     │ │ - dedup      │ │ - state       │
//! │   events    │ │              │ │   machine     │
//! └─────────────┘ └──────────────┘ └───────┬───────┘
//!                                          ▼
//!                                  ┌───────────────┐
//!                                  │   Transfer    │
//!                                  │ - framing     │
//!                                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Radio and permission seams implemented by the host
//! - [`events`] - Raw platform event translation
//! - [`registry`] - Device list
//! - [`connection`] - Connection orchestration and state machine
//! - [`transfer`] - Message framing over a connected stream
//! - [`protocol`] - Service identifier and wire envelope
//! - [`loopback`] - In-process adapter for demos and tests
//! - [`service`] - Session facade

pub mod adapter;
pub mod connection;
pub mod events;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod transfer;

pub use adapter::{BluetoothAdapter, PermissionChecker, StaticPermissions};
pub use loopback::{LoopbackAdapter, LoopbackRadio};
pub use service::{BluetoothSession, SessionConfig};
