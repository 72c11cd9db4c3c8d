use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle state of a session's sync loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncLoopState {
    /// Loop has not been started yet.
    Idle,
    /// A sync round or its post-processing is running.
    Syncing,
    /// Loop is waiting out the reconnect delay after a transport fault.
    Backoff,
    /// Loop terminated; the session cannot sync again.
    Stopped,
}

/// Filter sent with every `/sync` request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncFilter {
    /// Ask the server for lazy-loaded room membership.
    pub lazy_load_members: bool,
}

impl Default for SyncFilter {
    fn default() -> Self {
        Self {
            lazy_load_members: true,
        }
    }
}

impl SyncFilter {
    /// Render the filter in its wire shape.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "room": {
                "state": { "lazy_load_members": self.lazy_load_members }
            }
        })
    }
}

/// One long-poll sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Server-side long-poll timeout in milliseconds.
    pub timeout_ms: u64,
    /// Filter applied to the response.
    pub filter: SyncFilter,
    /// `next_batch` token of the previous successful sync.
    pub since: Option<String>,
}

/// Raw outcome of a sync call that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// HTTP status reported by the transport.
    pub status: u16,
    /// Decoded response body.
    pub body: Value,
}

impl SyncResponse {
    /// Successful response with the given body.
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Token to pass as `since` on the next request.
    pub fn next_batch(&self) -> Option<&str> {
        self.body.get("next_batch").and_then(Value::as_str)
    }
}

/// A device as last reported by a key query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub user_id: String,
    pub device_id: String,
    pub display_name: Option<String>,
    /// Device was removed by its owner.
    pub deleted: bool,
    /// Device is marked trusted in the crypto store.
    pub verified: bool,
}

impl DeviceRecord {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            display_name: None,
            deleted: false,
            verified: false,
        }
    }
}

/// user id -> device id -> device record, for devices whose keys changed.
pub type ChangedDevices = BTreeMap<String, BTreeMap<String, DeviceRecord>>;

/// Notification handed to the downstream consumer after a key query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceChangeNotification {
    /// User the session belongs to.
    pub user_id: String,
    /// Devices reported as changed by the key query.
    pub devices: ChangedDevices,
}

/// Device-targeted message queued by the crypto engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingToDeviceMessage {
    /// Transaction id used for the `sendToDevice` request.
    pub txn_id: String,
    /// Event type, for example `m.room_key_request`.
    pub event_type: String,
    /// user id -> device id -> content.
    pub messages: Value,
}

impl OutgoingToDeviceMessage {
    /// Create a message with a fresh transaction id.
    pub fn new(event_type: impl Into<String>, messages: Value) -> Self {
        Self {
            txn_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            messages,
        }
    }
}

/// Server answer to a to-device send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToDeviceResponse {
    pub status: u16,
}

/// Inbound interactive-verification protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    /// `m.key.verification.start`
    Start {
        transaction_id: String,
        sender: String,
        from_device: String,
    },
    /// `m.key.verification.accept`
    Accept {
        transaction_id: String,
        sender: String,
    },
    /// `m.key.verification.key`
    Key {
        transaction_id: String,
        sender: String,
    },
    /// `m.key.verification.mac`
    Mac {
        transaction_id: String,
        sender: String,
    },
    /// `m.key.verification.cancel`
    Cancel {
        transaction_id: String,
        sender: String,
        reason: String,
    },
}

impl VerificationEvent {
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Start { transaction_id, .. }
            | Self::Accept { transaction_id, .. }
            | Self::Key { transaction_id, .. }
            | Self::Mac { transaction_id, .. }
            | Self::Cancel { transaction_id, .. } => transaction_id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::Start { sender, .. }
            | Self::Accept { sender, .. }
            | Self::Key { sender, .. }
            | Self::Mac { sender, .. }
            | Self::Cancel { sender, .. } => sender,
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Accept { .. } => "accept",
            Self::Key { .. } => "key",
            Self::Mac { .. } => "mac",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Snapshot of an in-progress SAS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasInfo {
    pub transaction_id: String,
    pub other_user_id: String,
    pub other_device_id: String,
    /// (emoji, description) pairs, seven for the emoji method.
    pub emoji: Vec<(String, String)>,
}

/// What the session knows about a joined room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: String,
    pub display_name: String,
    pub encrypted: bool,
}

/// Plaintext produced by the crypto engine for one encrypted event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedEvent {
    /// Top-level event fields to merge over the encrypted payload.
    pub source: Map<String, Value>,
    /// Sender device is trusted.
    pub verified: bool,
}
