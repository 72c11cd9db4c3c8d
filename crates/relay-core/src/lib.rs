//! Core contract of the decrypting relay.
//!
//! This crate defines the protocol types, collaborator traits, lifecycle
//! model, retry policy, notification queue and payload helpers shared by the
//! session runtime.

/// Outbound device-change notification queue.
pub mod channel;
/// Crypto engine and transport contracts.
pub mod engine;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Encrypted room event parsing.
pub mod event;
/// Decrypted-payload annotation and the undecryptable placeholder.
pub mod normalization;
/// Backoff policy used by the sync loop.
pub mod retry;
/// Sync loop lifecycle state machine.
pub mod state_machine;
/// Sync and messages body accessors.
pub mod timeline;
/// Protocol types exchanged with collaborators.
pub mod types;

pub use channel::{
    Backpressure, Delivery, NotificationQueue, NotificationQueueError, NotificationReceiver,
};
pub use engine::{CryptoEngine, CryptoEventHandler, Transport};
pub use error::{
    CryptoError, DecryptionError, RelayError, RelayErrorCategory, TransportError,
    classify_http_status,
};
pub use event::{ENCRYPTED_EVENT_TYPE, EncryptedEvent, EventParseError, MEGOLM_ALGORITHM};
pub use normalization::{
    UNABLE_TO_DECRYPT_BODY, annotate_decrypted, annotate_undecryptable, unable_to_decrypt_event,
};
pub use retry::{DEFAULT_RECONNECT_DELAY_MS, RetryPolicy};
pub use state_machine::SyncLoopStateMachine;
pub use timeline::{RoomTimeline, joined_room_timelines, messages_chunk};
pub use types::{
    ChangedDevices, DecryptedEvent, DeviceChangeNotification, DeviceRecord,
    OutgoingToDeviceMessage, RoomInfo, SasInfo, SyncFilter, SyncLoopState, SyncRequest,
    SyncResponse, ToDeviceResponse, VerificationEvent,
};
