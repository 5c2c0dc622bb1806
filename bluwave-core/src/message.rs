//! Chat message model and the serde payload that crosses the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::DeviceId;

/// Message class. System messages are local state reflections (joined/left)
/// and never travel over the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageKind {
    Text,
    System,
}

/// One entry in the append-only chat log. Immutable once created; the log is
/// ordered by insertion and never reordered or deduplicated.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    /// None for system messages.
    pub sender_id: Option<DeviceId>,
    pub sender_name: String,
    pub timestamp_ms: u64,
    pub originated_locally: bool,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// A message typed on this device.
    pub fn local(text: String, sender_id: DeviceId, sender_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            sender_id: Some(sender_id),
            sender_name,
            timestamp_ms: now_millis(),
            originated_locally: true,
            kind: MessageKind::Text,
        }
    }

    /// A message received from a peer, attributed by the wire payload's
    /// embedded sender fields (the host relays ciphertext unchanged, so the
    /// arrival connection is not the author).
    pub fn remote(payload: WirePayload) -> Self {
        Self {
            id: payload.id,
            text: payload.text,
            sender_id: Some(payload.sender_id),
            sender_name: payload.sender_name,
            timestamp_ms: payload.timestamp_ms,
            originated_locally: false,
            kind: MessageKind::Text,
        }
    }

    /// A locally synthesized system notice (device joined/left, etc).
    pub fn system(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            sender_id: None,
            sender_name: "System".to_string(),
            timestamp_ms: now_millis(),
            originated_locally: true,
            kind: MessageKind::System,
        }
    }
}

/// The encrypted chat payload: everything a recipient needs to render and
/// attribute the message, independent of which connection delivered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePayload {
    pub id: Uuid,
    pub text: String,
    pub sender_id: DeviceId,
    pub sender_name: String,
    pub timestamp_ms: u64,
}

impl WirePayload {
    pub fn from_message(msg: &ChatMessage, sender_id: DeviceId) -> Self {
        Self {
            id: msg.id,
            text: msg.text.clone(),
            sender_id,
            sender_name: msg.sender_name.clone(),
            timestamp_ms: msg.timestamp_ms,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
