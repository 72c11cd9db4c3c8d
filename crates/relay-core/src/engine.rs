//! Collaborator contracts.
//!
//! The relay never ciphers, stores keys, or speaks HTTP itself. It drives a
//! [`CryptoEngine`] and a [`Transport`] supplied by the embedding proxy, and
//! receives engine callbacks through a [`CryptoEventHandler`].

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{CryptoError, DecryptionError, TransportError},
    event::EncryptedEvent,
    types::{
        ChangedDevices, DecryptedEvent, DeviceRecord, OutgoingToDeviceMessage, RoomInfo, SasInfo,
        SyncRequest, SyncResponse, ToDeviceResponse, VerificationEvent,
    },
};

/// Callbacks fired by the crypto engine while it ingests a sync response.
///
/// Handlers run synchronously on the ingesting task and must not block.
pub trait CryptoEventHandler: Send + Sync {
    /// A to-device key-verification event arrived.
    fn on_key_verification(&self, event: &VerificationEvent);

    /// A room event could not be decrypted.
    fn on_undecryptable_event(&self, room_id: &str, event: &EncryptedEvent);
}

#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Register the handler that receives engine callbacks.
    fn register_handler(&self, handler: Weak<dyn CryptoEventHandler>);

    /// Feed a successful sync response into the engine.
    async fn receive_sync_response(&self, response: &SyncResponse) -> Result<(), CryptoError>;

    /// Encrypt room message content.
    fn encrypt(&self, room_id: &str, event_type: &str, content: &Value)
    -> Result<Value, CryptoError>;

    /// Create and share an outbound group session for a room.
    async fn share_group_session(&self, room_id: &str) -> Result<(), CryptoError>;

    fn decrypt(&self, event: &EncryptedEvent) -> Result<DecryptedEvent, DecryptionError>;

    /// Remove and return every queued to-device message.
    fn take_outgoing_to_device_messages(&self) -> Vec<OutgoingToDeviceMessage>;

    fn should_upload_keys(&self) -> bool;

    fn should_query_keys(&self) -> bool;

    async fn upload_keys(&self) -> Result<(), CryptoError>;

    /// Query device keys; returns the devices whose keys changed.
    async fn query_keys(&self) -> Result<ChangedDevices, CryptoError>;

    /// Ask the sender's devices to re-share the room key for an event.
    async fn request_room_key(&self, event: &EncryptedEvent) -> Result<(), CryptoError>;

    /// Whether a room key request for this session id is already outstanding.
    fn has_outgoing_key_request(&self, session_id: &str) -> bool;

    async fn accept_verification(&self, transaction_id: &str) -> Result<(), CryptoError>;

    async fn accept_short_auth_string(&self, transaction_id: &str) -> Result<(), CryptoError>;

    /// In-progress SAS handshake for a transaction, if any.
    fn verification(&self, transaction_id: &str) -> Option<SasInfo>;

    /// Mark a device as trusted.
    fn verify_device(&self, device: &DeviceRecord) -> Result<(), CryptoError>;

    fn room(&self, room_id: &str) -> Option<RoomInfo>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn is_logged_in(&self) -> bool;

    async fn login(&self) -> Result<(), TransportError>;

    /// Long-poll `/sync`.
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;

    async fn send_to_device(
        &self,
        message: &OutgoingToDeviceMessage,
    ) -> Result<ToDeviceResponse, TransportError>;
}
