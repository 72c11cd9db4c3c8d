//! In-memory collaborators for tests and the smoke binary.
//!
//! Neither type performs real cryptography or networking. The engine maps
//! megolm session ids to canned plaintext; the transport replays a script of
//! sync outcomes and then long-polls.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use relay_core::{
    ChangedDevices, CryptoEngine, CryptoError, CryptoEventHandler, DecryptedEvent,
    DecryptionError, DeviceRecord, EncryptedEvent, MEGOLM_ALGORITHM, OutgoingToDeviceMessage,
    RoomInfo, SasInfo, SyncRequest, SyncResponse, ToDeviceResponse, Transport, TransportError,
    VerificationEvent,
};
use serde_json::{Map, Value, json};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callback queued for the next `receive_sync_response`.
#[derive(Debug, Clone)]
enum PendingCallback {
    Verification(VerificationEvent),
    Undecryptable {
        room_id: String,
        event: EncryptedEvent,
    },
}

#[derive(Debug, Default)]
struct EngineState {
    outgoing: Vec<OutgoingToDeviceMessage>,
    pending_callbacks: Vec<PendingCallback>,
    rooms: HashMap<String, RoomInfo>,
    room_keys: HashMap<String, (Map<String, Value>, bool)>,
    outbound_sessions: BTreeSet<String>,
    share_creates_session: bool,
    share_calls: usize,
    should_upload: bool,
    should_query: bool,
    upload_checks: usize,
    query_checks: usize,
    uploads: usize,
    queries: usize,
    changed_devices: ChangedDevices,
    received_syncs: usize,
    outgoing_key_requests: BTreeSet<String>,
    key_requests: Vec<String>,
    accepted_verifications: Vec<String>,
    accepted_sas: Vec<String>,
    verification_error: Option<CryptoError>,
    key_request_delay: Option<Duration>,
    sas: HashMap<String, SasInfo>,
    verified_devices: Vec<(String, String)>,
    decrypted_rooms: Vec<Option<String>>,
}

/// Scriptable crypto engine.
pub struct MockCryptoEngine {
    state: Mutex<EngineState>,
    handler: Mutex<Option<Weak<dyn CryptoEventHandler>>>,
}

impl std::fmt::Debug for MockCryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCryptoEngine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for MockCryptoEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(EngineState {
                share_creates_session: true,
                ..EngineState::default()
            }),
            handler: Mutex::new(None),
        }
    }
}

impl MockCryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_room(&self, room_id: &str, display_name: &str, encrypted: bool) {
        lock(&self.state).rooms.insert(
            room_id.to_owned(),
            RoomInfo {
                room_id: room_id.to_owned(),
                display_name: display_name.to_owned(),
                encrypted,
            },
        );
    }

    /// Make events of `session_id` decrypt to `plaintext` (an event object).
    pub fn add_room_key(&self, session_id: &str, plaintext: Value, verified: bool) {
        let source = match plaintext {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        lock(&self.state)
            .room_keys
            .insert(session_id.to_owned(), (source, verified));
    }

    /// When `false`, sharing a group session does not make encryption succeed.
    pub fn set_share_creates_session(&self, creates: bool) {
        lock(&self.state).share_creates_session = creates;
    }

    pub fn queue_outgoing(&self, message: OutgoingToDeviceMessage) {
        lock(&self.state).outgoing.push(message);
    }

    pub fn set_should_upload_keys(&self, value: bool) {
        lock(&self.state).should_upload = value;
    }

    pub fn set_should_query_keys(&self, value: bool) {
        lock(&self.state).should_query = value;
    }

    pub fn set_changed_devices(&self, devices: ChangedDevices) {
        lock(&self.state).changed_devices = devices;
    }

    pub fn add_sas(&self, sas: SasInfo) {
        lock(&self.state)
            .sas
            .insert(sas.transaction_id.clone(), sas);
    }

    /// Make every accept call fail with `error`.
    pub fn fail_verifications_with(&self, error: CryptoError) {
        lock(&self.state).verification_error = Some(error);
    }

    /// Hold every room key request for `delay` before it is recorded.
    pub fn set_key_request_delay(&self, delay: Duration) {
        lock(&self.state).key_request_delay = Some(delay);
    }

    pub fn mark_key_requested(&self, session_id: &str) {
        lock(&self.state)
            .outgoing_key_requests
            .insert(session_id.to_owned());
    }

    /// Fire a verification callback on the next ingested sync.
    pub fn queue_verification_event(&self, event: VerificationEvent) {
        lock(&self.state)
            .pending_callbacks
            .push(PendingCallback::Verification(event));
    }

    /// Fire an undecryptable-event callback on the next ingested sync.
    pub fn queue_undecryptable_event(&self, room_id: &str, event: EncryptedEvent) {
        lock(&self.state)
            .pending_callbacks
            .push(PendingCallback::Undecryptable {
                room_id: room_id.to_owned(),
                event,
            });
    }

    pub fn pending_outgoing(&self) -> usize {
        lock(&self.state).outgoing.len()
    }

    pub fn share_calls(&self) -> usize {
        lock(&self.state).share_calls
    }

    pub fn upload_checks(&self) -> usize {
        lock(&self.state).upload_checks
    }

    pub fn query_checks(&self) -> usize {
        lock(&self.state).query_checks
    }

    pub fn uploads(&self) -> usize {
        lock(&self.state).uploads
    }

    pub fn queries(&self) -> usize {
        lock(&self.state).queries
    }

    pub fn received_syncs(&self) -> usize {
        lock(&self.state).received_syncs
    }

    pub fn key_requests(&self) -> Vec<String> {
        lock(&self.state).key_requests.clone()
    }

    pub fn accepted_verifications(&self) -> Vec<String> {
        lock(&self.state).accepted_verifications.clone()
    }

    pub fn accepted_sas(&self) -> Vec<String> {
        lock(&self.state).accepted_sas.clone()
    }

    pub fn verified_devices(&self) -> Vec<(String, String)> {
        lock(&self.state).verified_devices.clone()
    }

    /// Room ids seen by `decrypt`, in call order.
    pub fn decrypted_rooms(&self) -> Vec<Option<String>> {
        lock(&self.state).decrypted_rooms.clone()
    }

    fn handler(&self) -> Option<Arc<dyn CryptoEventHandler>> {
        lock(&self.handler).as_ref().and_then(Weak::upgrade)
    }

    fn verification_result(&self) -> Result<(), CryptoError> {
        match &lock(&self.state).verification_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CryptoEngine for MockCryptoEngine {
    fn register_handler(&self, handler: Weak<dyn CryptoEventHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    async fn receive_sync_response(&self, _response: &SyncResponse) -> Result<(), CryptoError> {
        let callbacks = {
            let mut state = lock(&self.state);
            state.received_syncs += 1;
            std::mem::take(&mut state.pending_callbacks)
        };

        let Some(handler) = self.handler() else {
            return Ok(());
        };
        for callback in callbacks {
            match callback {
                PendingCallback::Verification(event) => handler.on_key_verification(&event),
                PendingCallback::Undecryptable { room_id, event } => {
                    handler.on_undecryptable_event(&room_id, &event);
                }
            }
        }
        Ok(())
    }

    fn encrypt(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<Value, CryptoError> {
        let state = lock(&self.state);
        if !state.outbound_sessions.contains(room_id) {
            return Err(CryptoError::GroupSessionMissing {
                room_id: room_id.to_owned(),
            });
        }
        Ok(json!({
            "algorithm": MEGOLM_ALGORITHM,
            "ciphertext": json!({"type": event_type, "content": content}).to_string(),
            "session_id": format!("outbound:{room_id}"),
            "device_id": "MOCKDEVICE",
        }))
    }

    async fn share_group_session(&self, room_id: &str) -> Result<(), CryptoError> {
        let mut state = lock(&self.state);
        state.share_calls += 1;
        if state.share_creates_session {
            state.outbound_sessions.insert(room_id.to_owned());
        }
        Ok(())
    }

    fn decrypt(&self, event: &EncryptedEvent) -> Result<DecryptedEvent, DecryptionError> {
        let mut state = lock(&self.state);
        state.decrypted_rooms.push(event.room_id.clone());
        let (source, verified) = state.room_keys.get(event.session_id()).cloned().ok_or_else(|| {
            DecryptionError::MissingSession {
                session_id: event.session_id().to_owned(),
            }
        })?;
        Ok(DecryptedEvent { source, verified })
    }

    fn take_outgoing_to_device_messages(&self) -> Vec<OutgoingToDeviceMessage> {
        std::mem::take(&mut lock(&self.state).outgoing)
    }

    fn should_upload_keys(&self) -> bool {
        let mut state = lock(&self.state);
        state.upload_checks += 1;
        state.should_upload
    }

    fn should_query_keys(&self) -> bool {
        let mut state = lock(&self.state);
        state.query_checks += 1;
        state.should_query
    }

    async fn upload_keys(&self) -> Result<(), CryptoError> {
        let mut state = lock(&self.state);
        state.uploads += 1;
        state.should_upload = false;
        Ok(())
    }

    async fn query_keys(&self) -> Result<ChangedDevices, CryptoError> {
        let mut state = lock(&self.state);
        state.queries += 1;
        state.should_query = false;
        Ok(state.changed_devices.clone())
    }

    async fn request_room_key(&self, event: &EncryptedEvent) -> Result<(), CryptoError> {
        let delay = lock(&self.state).key_request_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let session_id = event.session_id().to_owned();
        state.key_requests.push(session_id.clone());
        state.outgoing_key_requests.insert(session_id.clone());
        state.outgoing.push(OutgoingToDeviceMessage::new(
            "m.room_key_request",
            json!({
                event.sender.clone(): {
                    "*": {
                        "action": "request",
                        "body": {
                            "algorithm": MEGOLM_ALGORITHM,
                            "room_id": event.room_id,
                            "session_id": session_id,
                        }
                    }
                }
            }),
        ));
        Ok(())
    }

    fn has_outgoing_key_request(&self, session_id: &str) -> bool {
        lock(&self.state).outgoing_key_requests.contains(session_id)
    }

    async fn accept_verification(&self, transaction_id: &str) -> Result<(), CryptoError> {
        self.verification_result()?;
        lock(&self.state)
            .accepted_verifications
            .push(transaction_id.to_owned());
        Ok(())
    }

    async fn accept_short_auth_string(&self, transaction_id: &str) -> Result<(), CryptoError> {
        self.verification_result()?;
        lock(&self.state).accepted_sas.push(transaction_id.to_owned());
        Ok(())
    }

    fn verification(&self, transaction_id: &str) -> Option<SasInfo> {
        lock(&self.state).sas.get(transaction_id).cloned()
    }

    fn verify_device(&self, device: &DeviceRecord) -> Result<(), CryptoError> {
        lock(&self.state)
            .verified_devices
            .push((device.user_id.clone(), device.device_id.clone()));
        Ok(())
    }

    fn room(&self, room_id: &str) -> Option<RoomInfo> {
        lock(&self.state).rooms.get(room_id).cloned()
    }
}

/// What the transport does once its sync script is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncFallback {
    /// Hold the request for its long-poll timeout, then answer with an empty body.
    #[default]
    LongPoll,
    /// Fail every further sync with this error.
    Fail(TransportError),
}

#[derive(Debug, Default)]
struct TransportState {
    logged_in: bool,
    login_calls: usize,
    script: VecDeque<Result<SyncResponse, TransportError>>,
    fallback: SyncFallback,
    requests: Vec<SyncRequest>,
    sent: Vec<OutgoingToDeviceMessage>,
    failing_sends: usize,
}

/// Scriptable transport.
///
/// Clones share state, so a test can keep one handle while the session owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that reports an existing login.
    pub fn logged_in() -> Self {
        let transport = Self::default();
        lock(&transport.state).logged_in = true;
        transport
    }

    /// Queue the outcome of the next unscripted sync call.
    pub fn push_sync(&self, outcome: Result<SyncResponse, TransportError>) {
        lock(&self.state).script.push_back(outcome);
    }

    pub fn set_fallback(&self, fallback: SyncFallback) {
        lock(&self.state).fallback = fallback;
    }

    /// Make the next `count` to-device sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        lock(&self.state).failing_sends = count;
    }

    pub fn login_calls(&self) -> usize {
        lock(&self.state).login_calls
    }

    pub fn sync_calls(&self) -> usize {
        lock(&self.state).requests.len()
    }

    pub fn sync_requests(&self) -> Vec<SyncRequest> {
        lock(&self.state).requests.clone()
    }

    /// Every attempted to-device send, failed ones included.
    pub fn sent_messages(&self) -> Vec<OutgoingToDeviceMessage> {
        lock(&self.state).sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_logged_in(&self) -> bool {
        lock(&self.state).logged_in
    }

    async fn login(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.login_calls += 1;
        state.logged_in = true;
        Ok(())
    }

    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let (scripted, fallback, call) = {
            let mut state = lock(&self.state);
            state.requests.push(request.clone());
            (
                state.script.pop_front(),
                state.fallback.clone(),
                state.requests.len(),
            )
        };

        if let Some(outcome) = scripted {
            return outcome;
        }

        match fallback {
            SyncFallback::Fail(err) => Err(err),
            SyncFallback::LongPoll => {
                tokio::time::sleep(Duration::from_millis(request.timeout_ms)).await;
                Ok(SyncResponse::ok(json!({ "next_batch": format!("mock-{call}") })))
            }
        }
    }

    async fn send_to_device(
        &self,
        message: &OutgoingToDeviceMessage,
    ) -> Result<ToDeviceResponse, TransportError> {
        let mut state = lock(&self.state);
        state.sent.push(message.clone());
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(TransportError::ServerDisconnected);
        }
        Ok(ToDeviceResponse { status: 200 })
    }
}
