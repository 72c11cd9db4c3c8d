use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{retry::DEFAULT_RECONNECT_DELAY_MS, types::SyncLoopState};

/// Broad error category used for logging and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by homeserver.
    RateLimited,
    /// Illegal verification-protocol transition.
    Protocol,
    /// Cryptographic/encryption failure.
    Crypto,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal relay bug or invariant break.
    Internal,
}

/// Stable error payload surfaced to callers of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct RelayError {
    /// High-level error category.
    pub category: RelayErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl RelayError {
    pub fn new(
        category: RelayErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SyncLoopState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            RelayErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while sync loop is in state {current:?}"),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> RelayErrorCategory {
    match status {
        401 | 403 => RelayErrorCategory::Auth,
        408 | 429 => RelayErrorCategory::RateLimited,
        400..=499 => RelayErrorCategory::Config,
        500..=599 => RelayErrorCategory::Network,
        _ => RelayErrorCategory::Internal,
    }
}

/// Failures reported by the transport collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("server disconnected")]
    ServerDisconnected,
    #[error("proxy connection failed: {0}")]
    ProxyConnectionFailure(String),
    #[error("request timed out")]
    Timeout,
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Connection-level faults that the sync loop rides out with a backoff.
    pub fn is_network_class(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused
                | Self::ServerDisconnected
                | Self::ProxyConnectionFailure(_)
                | Self::Timeout
        )
    }
}

/// Failures of the decrypt operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecryptionError {
    /// No inbound group session is known for the event.
    #[error("missing inbound group session {session_id}")]
    MissingSession { session_id: String },
    #[error("decryption failed: {0}")]
    Failed(String),
}

/// Failures reported by the crypto engine collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// No outbound group session is shared for the room yet.
    #[error("no group session shared for room {room_id}")]
    GroupSessionMissing { room_id: String },
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    /// Verification handshake received an event out of order.
    #[error("verification protocol error: {0}")]
    Protocol(String),
    #[error("transport failure inside crypto engine: {0}")]
    Transport(#[from] TransportError),
    #[error("crypto engine failure: {0}")]
    Engine(String),
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        if err.is_network_class() {
            return Self::new(RelayErrorCategory::Network, "transport_error", err.to_string())
                .with_retry_after(Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS));
        }
        let category = match &err {
            TransportError::Status(status) => classify_http_status(*status),
            _ => RelayErrorCategory::Internal,
        };
        Self::new(category, "transport_error", err.to_string())
    }
}

impl From<DecryptionError> for RelayError {
    fn from(err: DecryptionError) -> Self {
        Self::new(RelayErrorCategory::Crypto, "decryption_failed", err.to_string())
    }
}

impl From<CryptoError> for RelayError {
    fn from(err: CryptoError) -> Self {
        let message = err.to_string();
        match err {
            CryptoError::Decryption(err) => err.into(),
            CryptoError::Transport(err) => err.into(),
            CryptoError::GroupSessionMissing { .. } => {
                Self::new(RelayErrorCategory::Crypto, "group_session_missing", message)
            }
            CryptoError::Protocol(_) => Self::new(
                RelayErrorCategory::Protocol,
                "verification_protocol_error",
                message,
            ),
            CryptoError::Engine(_) => {
                Self::new(RelayErrorCategory::Crypto, "crypto_engine_error", message)
            }
        }
    }
}
