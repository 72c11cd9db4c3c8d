use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Event type of an encrypted room event.
pub const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";
/// The only room-message algorithm the relay decrypts.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Reasons a payload is not a decryptable room event.
#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("event type '{0}' is not {ENCRYPTED_EVENT_TYPE}")]
    NotEncrypted(String),
    #[error("unsupported encryption algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("malformed encrypted event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Megolm-encrypted room event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EncryptedEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub origin_server_ts: Option<u64>,
    pub content: MegolmContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MegolmContent {
    pub algorithm: String,
    pub ciphertext: String,
    pub session_id: String,
    #[serde(default)]
    pub sender_key: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl EncryptedEvent {
    /// Parse a raw event payload, accepting only megolm room events.
    pub fn parse(payload: &Value) -> Result<Self, EventParseError> {
        let event_type = event_type(payload).unwrap_or_default();
        if event_type != ENCRYPTED_EVENT_TYPE {
            return Err(EventParseError::NotEncrypted(event_type.to_owned()));
        }

        let algorithm = payload
            .pointer("/content/algorithm")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if algorithm != MEGOLM_ALGORITHM {
            return Err(EventParseError::UnsupportedAlgorithm(algorithm.to_owned()));
        }

        Ok(Self::deserialize(payload)?)
    }

    pub fn session_id(&self) -> &str {
        &self.content.session_id
    }

    pub fn sender_device(&self) -> Option<&str> {
        self.content.device_id.as_deref()
    }
}

/// The `type` field of an event payload.
pub fn event_type(payload: &Value) -> Option<&str> {
    payload.get("type").and_then(Value::as_str)
}

/// Whether a payload is typed as an encrypted room event.
pub fn is_encrypted(payload: &Value) -> bool {
    event_type(payload) == Some(ENCRYPTED_EVENT_TYPE)
}
