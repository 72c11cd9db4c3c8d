//! Sync, trust and decrypt orchestration for an end-to-end-encryption relay.
//!
//! [`Session`] keeps a sync loop running against a [`Transport`], feeds every
//! response to a [`CryptoEngine`] and reacts to the engine's callbacks:
//! verification handshakes are answered automatically, undecryptable events
//! trigger room key requests, and changed devices are trusted according to
//! [`TrustPolicy`] and reported downstream. The decryption pipeline rewrites
//! intercepted response bodies on demand.
//!
//! [`Transport`]: relay_core::Transport
//! [`CryptoEngine`]: relay_core::CryptoEngine

pub mod config;
pub mod decrypt;
pub mod dispatch;
pub mod key_requests;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod session;
pub mod tasks;
pub mod trust;
pub mod verification;

pub use config::{ConfigError, SessionConfig};
pub use decrypt::{decrypt_event, decrypt_messages_body, decrypt_sync_body, encrypt_with_session_retry};
pub use dispatch::{DispatchReport, send_outgoing_to_device};
pub use key_requests::KeyRequestRecovery;
pub use session::{Session, SyncLoopHandle};
pub use tasks::{TaskRegistry, TrackedTask};
pub use trust::{DeviceTrustNotifier, TrustPolicy, TrustReport, UnknownTrustPolicy};
pub use verification::{VerificationAutomator, VerificationReport, format_short_auth_string};
