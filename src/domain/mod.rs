//! Domain types: devices, connection states, messages, errors and settings.

pub mod error;
pub mod models;
pub mod settings;
