//! Chat Wire Protocol
//!
//! Defines the rendezvous service identifier and the message envelope
//! exchanged between two peers once an RFCOMM session is up.

use crate::domain::error::SessionError;
use crate::domain::models::Message;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

pub use crate::domain::settings::{DEFAULT_MAX_PAYLOAD_BYTES, MAX_PAYLOAD_BYTES_LIMIT, SERVICE_UUID};

/// [`SERVICE_UUID`] as a typed identifier
pub const SERVICE_ID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

/// Service record name advertised by the acceptor
pub const SERVICE_NAME: &str = "BluetoothChatApp";

/// Terminates every encoded payload. Compact JSON never contains a raw newline.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Sender label used when neither settings nor the adapter provide a name
pub const UNKNOWN_SENDER: &str = "Unknown name";

/// Message envelope as it appears on the wire
///
/// ```text
/// {"message":"hi","senderName":"Bob","isFromLocalUser":true}\n
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub message: String,
    pub sender_name: String,
    pub is_from_local_user: bool,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            message: message.body().to_string(),
            sender_name: message.sender_label().to_string(),
            is_from_local_user: message.origin_local(),
        }
    }
}

/// Encode a message as one delimited frame, ready for a single write.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, SessionError> {
    let mut frame = serde_json::to_vec(&WireMessage::from(message))
        .map_err(|e| SessionError::MalformedPayload(e.to_string()))?;
    frame.push(FRAME_DELIMITER);
    Ok(frame)
}

/// Decode one frame (with or without its delimiter) into a received message.
///
/// The envelope's `isFromLocalUser` flag is ignored: anything read off the
/// wire originated remotely.
pub fn decode_message(frame: &[u8]) -> Result<Message, SessionError> {
    let payload = trim_delimiter(frame);
    let wire: WireMessage = serde_json::from_slice(payload)
        .map_err(|e| SessionError::MalformedPayload(e.to_string()))?;

    if wire.is_from_local_user {
        trace!("Peer claimed local origin, overriding");
    }

    Ok(Message::remote(wire.message, wire.sender_name))
}

fn trim_delimiter(frame: &[u8]) -> &[u8] {
    let mut end = frame.len();
    while end > 0 && matches!(frame[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &frame[..end]
}

/// Parse a service UUID from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(uuid_str.trim())
}
