//! The sync loop manager.
//!
//! A [`Session`] owns one long-running sync task. Each cycle logs in if
//! needed, long-polls `/sync`, lets the crypto engine ingest the response and
//! then runs post-processing in a fixed order:
//!
//! 1. send queued to-device messages
//! 2. await in-flight verification steps
//! 3. await in-flight room key requests
//! 4. upload keys if the engine asks for it
//! 5. query keys if the engine asks for it, then trust and notify
//!
//! The next sync is not issued before all of that completes. Transport
//! faults and non-success statuses back off and retry; cancellation is only
//! observed at suspension points and ends the loop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relay_core::{
    CryptoEngine, CryptoEventHandler, EncryptedEvent, NotificationQueue, RelayError,
    RelayErrorCategory, SyncLoopState, SyncLoopStateMachine, SyncRequest, Transport,
    TransportError, VerificationEvent, classify_http_status,
};
use serde_json::Value;
use thiserror::Error;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionConfig, decrypt, dispatch::send_outgoing_to_device,
    key_requests::KeyRequestRecovery, trust::DeviceTrustNotifier,
    verification::VerificationAutomator,
};

#[derive(Debug)]
struct RunningSyncTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Why a sync cycle ended before post-processing.
#[derive(Debug, Error)]
enum CycleError {
    #[error("login failed: {0}")]
    Login(TransportError),
    #[error("sync request failed: {0}")]
    Transport(TransportError),
    #[error("sync returned status {0}")]
    Status(u16),
}

impl CycleError {
    fn is_network_class(&self) -> bool {
        match self {
            Self::Login(err) | Self::Transport(err) => err.is_network_class(),
            Self::Status(_) => false,
        }
    }

    fn category(&self) -> RelayErrorCategory {
        match self {
            Self::Login(err) | Self::Transport(err) => RelayError::from(err.clone()).category,
            Self::Status(status) => classify_http_status(*status),
        }
    }
}

/// Observer returned by [`Session::start`].
#[derive(Debug, Clone)]
pub struct SyncLoopHandle {
    state: watch::Receiver<SyncLoopState>,
    cycles: watch::Receiver<u64>,
}

impl SyncLoopHandle {
    pub fn state(&self) -> SyncLoopState {
        *self.state.borrow()
    }

    pub fn synced_cycles(&self) -> u64 {
        *self.cycles.borrow()
    }

    /// Wait until the loop enters `target`.
    ///
    /// Returns `false` if the session was dropped first.
    pub async fn wait_for_state(&mut self, target: SyncLoopState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }
}

struct SessionInner {
    user_id: String,
    config: SessionConfig,
    engine: Arc<dyn CryptoEngine>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    verifications: VerificationAutomator,
    key_requests: KeyRequestRecovery,
    trust: DeviceTrustNotifier,
    lifecycle: Mutex<SyncLoopStateMachine>,
    state_tx: watch::Sender<SyncLoopState>,
    synced_tx: watch::Sender<u64>,
}

impl CryptoEventHandler for SessionInner {
    fn on_key_verification(&self, event: &VerificationEvent) {
        self.verifications.handle_event(event);
    }

    fn on_undecryptable_event(&self, room_id: &str, event: &EncryptedEvent) {
        self.key_requests.handle_undecryptable(room_id, event);
    }
}

impl SessionInner {
    fn lifecycle(&self) -> MutexGuard<'_, SyncLoopStateMachine> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition<F>(&self, apply: F)
    where
        F: FnOnce(&mut SyncLoopStateMachine) -> Result<SyncLoopState, RelayError>,
    {
        let result = apply(&mut *self.lifecycle());
        match result {
            Ok(state) => {
                self.state_tx.send_replace(state);
            }
            Err(err) => warn!(user_id = %self.user_id, error = %err, "ignored lifecycle transition"),
        }
    }

    async fn run(&self, stop: CancellationToken) {
        let retry = self.config.retry_policy();
        let mut since: Option<String> = None;

        info!(
            user_id = %self.user_id,
            homeserver = self.config.homeserver.as_ref().map(|url| url.as_str()).unwrap_or("<transport>"),
            "sync loop started"
        );

        loop {
            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                outcome = self.sync_cycle(&mut since) => outcome,
            };

            match outcome {
                Ok(()) => self.mark_synced(),
                Err(err) => {
                    let category = err.category();
                    if err.is_network_class() {
                        warn!(user_id = %self.user_id, ?category, error = %err, "sync failed; backing off");
                    } else {
                        error!(user_id = %self.user_id, ?category, error = %err, "sync failed; backing off");
                    }

                    self.transition(SyncLoopStateMachine::on_transport_fault);
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(retry.delay()) => {}
                    }
                    self.transition(SyncLoopStateMachine::on_backoff_elapsed);
                }
            }
        }

        self.finish();
    }

    async fn sync_cycle(&self, since: &mut Option<String>) -> Result<(), CycleError> {
        if !self.transport.is_logged_in() {
            info!(user_id = %self.user_id, "logging in");
            self.transport.login().await.map_err(CycleError::Login)?;
        }

        let request = SyncRequest {
            timeout_ms: self.config.sync_timeout_ms,
            filter: self.config.sync_filter(),
            since: since.clone(),
        };
        let response = self
            .transport
            .sync(&request)
            .await
            .map_err(CycleError::Transport)?;
        if !response.is_success() {
            return Err(CycleError::Status(response.status));
        }
        if let Some(next_batch) = response.next_batch() {
            *since = Some(next_batch.to_owned());
        }

        if let Err(err) = self.engine.receive_sync_response(&response).await {
            warn!(user_id = %self.user_id, error = %err, "crypto engine rejected sync response");
        }

        let dispatch = send_outgoing_to_device(
            self.engine.as_ref(),
            Arc::clone(&self.transport),
            &self.runtime,
        )
        .await;
        let verification = self.verifications.drain().await;
        let key_requests = self.key_requests.drain().await;

        if self.engine.should_upload_keys() {
            match self.engine.upload_keys().await {
                Ok(()) => debug!(user_id = %self.user_id, "uploaded keys"),
                Err(err) => warn!(user_id = %self.user_id, error = %err, "key upload failed"),
            }
        }

        if self.engine.should_query_keys() {
            match self.engine.query_keys().await {
                Ok(changed) => {
                    let report = self.trust.handle_changed(changed).await;
                    debug!(user_id = %self.user_id, ?report, "processed key query");
                }
                Err(err) => warn!(user_id = %self.user_id, error = %err, "key query failed"),
            }
        }

        debug!(
            user_id = %self.user_id,
            since = since.as_deref().unwrap_or_default(),
            sent = dispatch.sent,
            send_failures = dispatch.failed,
            verifications = verification.completed,
            key_requests,
            "sync cycle complete"
        );
        Ok(())
    }

    fn mark_synced(&self) {
        self.transition(SyncLoopStateMachine::on_cycle_complete);
        self.synced_tx.send_modify(|cycles| *cycles += 1);
    }

    fn finish(&self) {
        self.verifications.abort_all();
        self.key_requests.abort_all();

        let mut lifecycle = self.lifecycle();
        if lifecycle.is_running() {
            match lifecycle.stop() {
                Ok(state) => {
                    self.state_tx.send_replace(state);
                }
                Err(err) => warn!(user_id = %self.user_id, error = %err, "failed to stop lifecycle"),
            }
        }
        info!(user_id = %self.user_id, "sync loop stopped");
    }
}

/// One authenticated connection for one user/device pair.
pub struct Session {
    inner: Arc<SessionInner>,
    sync_task: tokio::sync::Mutex<Option<RunningSyncTask>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.inner.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a session and register it as the engine's event handler.
    ///
    /// All background work is spawned on `runtime`.
    pub fn new(
        user_id: impl Into<String>,
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        notifications: NotificationQueue,
        config: SessionConfig,
        runtime: Handle,
    ) -> Self {
        let user_id = user_id.into();
        let (state_tx, _) = watch::channel(SyncLoopState::Idle);
        let (synced_tx, _) = watch::channel(0);

        let inner = Arc::new(SessionInner {
            verifications: VerificationAutomator::new(Arc::clone(&engine), runtime.clone()),
            key_requests: KeyRequestRecovery::new(Arc::clone(&engine), runtime.clone()),
            trust: DeviceTrustNotifier::new(
                Arc::clone(&engine),
                config.trust_policy,
                notifications,
                user_id.clone(),
            ),
            user_id,
            config,
            engine,
            transport,
            runtime,
            lifecycle: Mutex::new(SyncLoopStateMachine::default()),
            state_tx,
            synced_tx,
        });

        let handler: std::sync::Weak<SessionInner> = Arc::downgrade(&inner);
        inner.engine.register_handler(handler);

        Self {
            inner,
            sync_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SyncLoopState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncLoopState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of sync cycles completed so far.
    pub fn synced_cycles(&self) -> u64 {
        *self.inner.synced_tx.borrow()
    }

    pub fn pending_verification_tasks(&self) -> usize {
        self.inner.verifications.pending()
    }

    pub fn pending_key_requests(&self) -> usize {
        self.inner.key_requests.pending()
    }

    /// Spawn the sync loop.
    ///
    /// A session syncs at most once in its lifetime: starting it again after
    /// [`stop`](Self::stop) is an invalid state transition.
    pub async fn start(&self) -> Result<SyncLoopHandle, RelayError> {
        let mut guard = self.sync_task.lock().await;
        if guard.is_some() {
            return Err(RelayError::new(
                RelayErrorCategory::Internal,
                "sync_already_running",
                "sync task is already running",
            ));
        }

        let state = self.inner.lifecycle().start()?;
        self.inner.state_tx.send_replace(state);

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let inner = Arc::clone(&self.inner);
        let task = self
            .inner
            .runtime
            .spawn(async move { inner.run(stop_child).await });

        *guard = Some(RunningSyncTask { stop, task });
        Ok(SyncLoopHandle {
            state: self.inner.state_tx.subscribe(),
            cycles: self.inner.synced_tx.subscribe(),
        })
    }

    /// Cancel the sync loop and wait until it has terminated.
    ///
    /// Returns immediately when the loop is not running.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let running = {
            let mut guard = self.sync_task.lock().await;
            guard.take()
        };

        let Some(running) = running else {
            debug!(user_id = %self.inner.user_id, "stop requested while sync loop is not running");
            return Ok(());
        };

        running.stop.cancel();
        match running.task.await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.finish();
                Err(RelayError::new(
                    RelayErrorCategory::Internal,
                    "sync_task_failed",
                    format!("sync task did not shut down cleanly: {err}"),
                ))
            }
        }
    }

    /// Wait for the next successful sync cycle and return its number.
    ///
    /// Edge-triggered: a cycle that completed before the call does not count.
    pub async fn await_synced(&self) -> u64 {
        let mut cycles = self.inner.synced_tx.subscribe();
        // The session owns the sender, so `changed` cannot fail here.
        let _ = cycles.changed().await;
        *cycles.borrow_and_update()
    }

    /// Decrypt one event payload in place. See [`decrypt::decrypt_event`].
    pub fn decrypt_event(
        &self,
        payload: &mut Value,
        room_id_hint: Option<&str>,
        ignore_failures: bool,
    ) -> Result<bool, RelayError> {
        let decrypted = decrypt::decrypt_event(
            self.inner.engine.as_ref(),
            payload,
            room_id_hint,
            ignore_failures,
        )?;
        Ok(decrypted)
    }

    pub fn decrypt_sync_body(&self, body: &mut Value, ignore_failures: bool) -> Result<(), RelayError> {
        decrypt::decrypt_sync_body(self.inner.engine.as_ref(), body, ignore_failures)?;
        Ok(())
    }

    pub fn decrypt_messages_body(&self, body: &mut Value) {
        decrypt::decrypt_messages_body(self.inner.engine.as_ref(), body);
    }

    /// Encrypt room content, establishing a group session on first use.
    pub async fn encrypt(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<Value, RelayError> {
        let encrypted = decrypt::encrypt_with_session_retry(
            self.inner.engine.as_ref(),
            room_id,
            event_type,
            content,
        )
        .await?;
        Ok(encrypted)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(running) = self.sync_task.get_mut().take() {
            running.stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use relay_core::{
        CryptoError, DeviceRecord, MEGOLM_ALGORITHM, NotificationReceiver, SyncResponse,
    };
    use serde_json::json;
    use tokio::time::{Instant, timeout};

    use super::*;
    use crate::mock::{MockCryptoEngine, MockTransport, SyncFallback};

    const TEST_DEADLINE: Duration = Duration::from_secs(120);

    struct Harness {
        session: Session,
        engine: Arc<MockCryptoEngine>,
        transport: MockTransport,
        notifications: NotificationReceiver,
    }

    fn harness(transport: MockTransport) -> Harness {
        let engine = Arc::new(MockCryptoEngine::new());
        let config = SessionConfig::default();
        let (queue, notifications) = config.notification_queue();
        let session = Session::new(
            "@relay:example.org",
            engine.clone(),
            Arc::new(transport.clone()),
            queue,
            config,
            Handle::current(),
        );
        Harness {
            session,
            engine,
            transport,
            notifications,
        }
    }

    fn ok_sync(next_batch: &str) -> Result<SyncResponse, TransportError> {
        Ok(SyncResponse::ok(json!({ "next_batch": next_batch })))
    }

    fn undecryptable(session_id: &str) -> EncryptedEvent {
        EncryptedEvent::parse(&json!({
            "type": "m.room.encrypted",
            "sender": "@alice:example.org",
            "content": {
                "algorithm": MEGOLM_ALGORITHM,
                "ciphertext": "AwgAEpAB",
                "session_id": session_id
            }
        }))
        .expect("valid megolm event")
    }

    async fn wait_for_cycles(session: &Session, cycles: u64) {
        timeout(TEST_DEADLINE, async {
            while session.synced_cycles() < cycles {
                session.await_synced().await;
            }
        })
        .await
        .expect("sync cycles should complete");
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_after_each_refused_connection() {
        let transport = MockTransport::logged_in();
        for _ in 0..3 {
            transport.push_sync(Err(TransportError::ConnectionRefused));
        }
        transport.push_sync(ok_sync("s1"));
        let h = harness(transport);

        let started = Instant::now();
        h.session.start().await.expect("start");
        let cycle = timeout(TEST_DEADLINE, h.session.await_synced())
            .await
            .expect("sync should eventually succeed");

        assert_eq!(cycle, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert!(h.transport.sync_calls() >= 4);
        assert_eq!(h.engine.upload_checks(), 1);
        assert_eq!(h.engine.query_checks(), 1);
        assert_eq!(h.engine.received_syncs(), 1);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn non_success_status_skips_processing_and_backs_off() {
        let transport = MockTransport::logged_in();
        transport.push_sync(Ok(SyncResponse {
            status: 502,
            body: json!({"errcode": "M_UNKNOWN"}),
        }));
        transport.push_sync(ok_sync("s1"));
        let h = harness(transport);

        let started = Instant::now();
        h.session.start().await.expect("start");
        timeout(TEST_DEADLINE, h.session.await_synced())
            .await
            .expect("second sync succeeds");

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(h.engine.received_syncs(), 1);
        assert_eq!(h.engine.upload_checks(), 1);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn await_synced_blocks_while_sync_keeps_failing() {
        let transport = MockTransport::logged_in();
        transport.set_fallback(SyncFallback::Fail(TransportError::ServerDisconnected));
        let h = harness(transport);

        h.session.start().await.expect("start");
        let waited = timeout(Duration::from_secs(60), h.session.await_synced()).await;

        assert!(waited.is_err(), "no cycle may be reported as synced");
        assert_eq!(h.session.synced_cycles(), 0);
        assert!(h.transport.sync_calls() > 1);
        assert_eq!(h.engine.received_syncs(), 0);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_terminates_loop() {
        let transport = MockTransport::logged_in();
        transport.set_fallback(SyncFallback::Fail(TransportError::ConnectionRefused));
        let h = harness(transport);

        let mut handle = h.session.start().await.expect("start");
        assert!(handle.wait_for_state(SyncLoopState::Backoff).await);

        timeout(Duration::from_secs(1), h.session.stop())
            .await
            .expect("stop must not wait out the backoff")
            .expect("stop");

        assert_eq!(h.session.state(), SyncLoopState::Stopped);
        assert_eq!(handle.state(), SyncLoopState::Stopped);
        assert_eq!(h.transport.sync_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_long_poll_terminates_loop() {
        let h = harness(MockTransport::logged_in());

        h.session.start().await.expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.transport.sync_calls(), 1);

        timeout(Duration::from_secs(1), h.session.stop())
            .await
            .expect("stop must interrupt the long poll")
            .expect("stop");
        assert_eq!(h.session.state(), SyncLoopState::Stopped);
        assert_eq!(h.session.synced_cycles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn logs_in_and_threads_sync_token() {
        let transport = MockTransport::new();
        transport.push_sync(ok_sync("s1"));
        transport.push_sync(ok_sync("s2"));
        let h = harness(transport);

        h.session.start().await.expect("start");
        wait_for_cycles(&h.session, 2).await;

        let requests = h.transport.sync_requests();
        assert_eq!(h.transport.login_calls(), 1);
        assert_eq!(requests[0].since, None);
        assert_eq!(requests[1].since.as_deref(), Some("s1"));
        assert_eq!(requests[0].timeout_ms, 30_000);
        assert!(requests[0].filter.lazy_load_members);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn drains_verification_and_key_request_tasks_each_cycle() {
        let h = harness(MockTransport::logged_in());
        h.transport.push_sync(ok_sync("s1"));
        h.engine.queue_verification_event(VerificationEvent::Start {
            transaction_id: "txn-1".into(),
            sender: "@bob:example.org".into(),
            from_device: "BOBDEVICE".into(),
        });
        h.engine.queue_verification_event(VerificationEvent::Mac {
            transaction_id: "txn-1".into(),
            sender: "@bob:example.org".into(),
        });
        h.engine
            .queue_undecryptable_event("!room:example.org", undecryptable("session-a"));
        h.engine
            .queue_undecryptable_event("!room:example.org", undecryptable("session-a"));

        h.session.start().await.expect("start");
        wait_for_cycles(&h.session, 1).await;

        assert_eq!(h.engine.accepted_verifications(), vec!["txn-1".to_owned()]);
        assert_eq!(h.engine.accepted_sas(), vec!["txn-1".to_owned()]);
        assert_eq!(h.engine.key_requests(), vec!["session-a".to_owned()]);
        assert_eq!(h.session.pending_verification_tasks(), 0);
        assert_eq!(h.session.pending_key_requests(), 0);

        // The key request queued its to-device message after this cycle's
        // dispatch step; it goes out with the next one.
        assert!(h.transport.sent_messages().is_empty());
        wait_for_cycles(&h.session, 2).await;
        let sent = h.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key_request");

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_drain_aborts_in_flight_key_requests() {
        let h = harness(MockTransport::logged_in());
        h.transport.push_sync(ok_sync("s1"));
        h.engine.set_key_request_delay(Duration::from_secs(60));
        h.engine
            .queue_undecryptable_event("!room:example.org", undecryptable("session-slow"));

        h.session.start().await.expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.engine.received_syncs(), 1);
        assert_eq!(h.session.synced_cycles(), 0, "cycle is still draining");

        timeout(Duration::from_secs(1), h.session.stop())
            .await
            .expect("stop must not wait for the drain")
            .expect("stop");
        assert_eq!(h.session.state(), SyncLoopState::Stopped);
        assert_eq!(h.session.pending_key_requests(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(
            h.engine.key_requests().is_empty(),
            "no engine call may complete after stop returns"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn await_synced_releases_once_per_successful_cycle() {
        let transport = MockTransport::logged_in();
        transport.push_sync(ok_sync("s1"));
        transport.push_sync(Err(TransportError::ConnectionRefused));
        transport.push_sync(Err(TransportError::ConnectionRefused));
        transport.push_sync(ok_sync("s2"));
        let h = harness(transport);

        h.session.start().await.expect("start");
        let first = timeout(TEST_DEADLINE, h.session.await_synced())
            .await
            .expect("first cycle completes");
        assert_eq!(first, 1);

        let waited_from = Instant::now();
        let second = timeout(TEST_DEADLINE, h.session.await_synced())
            .await
            .expect("second cycle completes");

        assert_eq!(second, 2);
        assert_eq!(waited_from.elapsed(), Duration::from_secs(10));
        assert_eq!(h.session.synced_cycles(), 2);
        assert_eq!(h.engine.received_syncs(), 2);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_verification_does_not_stop_the_loop() {
        let h = harness(MockTransport::logged_in());
        h.transport.push_sync(ok_sync("s1"));
        h.transport.push_sync(ok_sync("s2"));
        h.engine
            .fail_verifications_with(CryptoError::Protocol("unknown transaction".into()));
        h.engine.queue_verification_event(VerificationEvent::Mac {
            transaction_id: "txn-9".into(),
            sender: "@bob:example.org".into(),
        });

        h.session.start().await.expect("start");
        wait_for_cycles(&h.session, 2).await;

        assert_eq!(h.session.state(), SyncLoopState::Syncing);
        assert_eq!(h.session.pending_verification_tasks(), 0);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn key_query_trusts_devices_and_notifies() {
        let mut h = harness(MockTransport::logged_in());
        h.transport.push_sync(ok_sync("s1"));
        h.engine.set_should_upload_keys(true);
        h.engine.set_should_query_keys(true);

        let mut deleted = DeviceRecord::new("@bob:example.org", "OLD");
        deleted.deleted = true;
        let devices = BTreeMap::from([(
            "@bob:example.org".to_owned(),
            BTreeMap::from([
                ("NEW".to_owned(), DeviceRecord::new("@bob:example.org", "NEW")),
                ("OLD".to_owned(), deleted),
            ]),
        )]);
        h.engine.set_changed_devices(devices.clone());

        h.session.start().await.expect("start");
        wait_for_cycles(&h.session, 1).await;

        assert_eq!(h.engine.uploads(), 1);
        assert_eq!(h.engine.queries(), 1);
        assert_eq!(
            h.engine.verified_devices(),
            vec![("@bob:example.org".to_owned(), "NEW".to_owned())]
        );
        let notification = h.notifications.try_recv().expect("notification published");
        assert_eq!(notification.user_id, "@relay:example.org");
        assert_eq!(notification.devices, devices);

        h.session.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn lifecycle_rejects_double_start_and_restart() {
        let h = harness(MockTransport::logged_in());

        h.session.stop().await.expect("stop before start is a no-op");
        assert_eq!(h.session.state(), SyncLoopState::Idle);

        h.session.start().await.expect("first start");
        let err = h.session.start().await.expect_err("second start");
        assert_eq!(err.code, "sync_already_running");

        h.session.stop().await.expect("stop");
        assert_eq!(h.session.state(), SyncLoopState::Stopped);
        h.session.stop().await.expect("second stop is a no-op");

        let err = h.session.start().await.expect_err("restart");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[tokio::test]
    async fn exposes_decryption_pipeline() {
        let h = harness(MockTransport::logged_in());
        h.engine.add_room("!room:example.org", "Room", true);
        h.engine.add_room_key(
            "session-a",
            json!({"type": "m.room.message", "content": {"msgtype": "m.text", "body": "hi"}}),
            false,
        );

        let mut body = json!({
            "rooms": {"join": {"!room:example.org": {"timeline": {"events": [{
                "type": "m.room.encrypted",
                "sender": "@alice:example.org",
                "content": {
                    "algorithm": MEGOLM_ALGORITHM,
                    "ciphertext": "AwgAEpAB",
                    "session_id": "session-a"
                }
            }]}}}}
        });
        h.session
            .decrypt_sync_body(&mut body, true)
            .expect("ignored failures");

        let event = &body["rooms"]["join"]["!room:example.org"]["timeline"]["events"][0];
        assert_eq!(event["content"]["body"], "hi");
        assert_eq!(event["decrypted"], true);
        assert_eq!(event["verified"], false);

        let ciphertext = h
            .session
            .encrypt("!room:example.org", "m.room.message", &json!({"body": "out"}))
            .await
            .expect("encrypts after sharing");
        assert_eq!(ciphertext["algorithm"], MEGOLM_ALGORITHM);
    }

    #[tokio::test]
    async fn surfaces_crypto_failures_as_stable_error_codes() {
        let h = harness(MockTransport::logged_in());
        h.engine.add_room("!room:example.org", "Room", true);
        h.engine.set_share_creates_session(false);

        let err = h
            .session
            .encrypt("!room:example.org", "m.room.message", &json!({"body": "out"}))
            .await
            .expect_err("sharing never yields a session");
        assert_eq!(err.code, "group_session_missing");
        assert_eq!(err.category, RelayErrorCategory::Crypto);
        assert_eq!(h.engine.share_calls(), 1);

        let mut payload = json!({
            "type": "m.room.encrypted",
            "sender": "@alice:example.org",
            "content": {
                "algorithm": MEGOLM_ALGORITHM,
                "ciphertext": "AwgAEpAB",
                "session_id": "missing"
            }
        });
        let err = h
            .session
            .decrypt_event(&mut payload, Some("!room:example.org"), false)
            .expect_err("no key for session");
        assert_eq!(err.code, "decryption_failed");
        assert_eq!(err.category, RelayErrorCategory::Crypto);
    }
}
