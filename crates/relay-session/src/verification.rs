//! Automated side of interactive SAS device verification.
//!
//! Start and mac events are answered without operator confirmation of the
//! short authentication string. The string is still rendered and logged so an
//! operator can compare it out of band.

use std::sync::Arc;

use relay_core::{CryptoEngine, CryptoError, VerificationEvent};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::tasks::{TaskRegistry, join_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AcceptVerification,
    AcceptShortAuthString,
}

/// Counts from one drain of the verification task set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub completed: usize,
    pub protocol_errors: usize,
    pub failed: usize,
}

pub struct VerificationAutomator {
    engine: Arc<dyn CryptoEngine>,
    runtime: Handle,
    tasks: TaskRegistry<Result<(), CryptoError>>,
}

impl std::fmt::Debug for VerificationAutomator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationAutomator")
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl VerificationAutomator {
    pub fn new(engine: Arc<dyn CryptoEngine>, runtime: Handle) -> Self {
        Self {
            engine,
            runtime,
            tasks: TaskRegistry::new(),
        }
    }

    /// React to one inbound verification event.
    pub fn handle_event(&self, event: &VerificationEvent) {
        let transaction_id = event.transaction_id();
        info!(
            kind = event.kind(),
            transaction_id,
            sender = event.sender(),
            "received key verification event"
        );

        match event {
            VerificationEvent::Start { .. } => {
                self.spawn_step(transaction_id, Step::AcceptVerification);
            }
            VerificationEvent::Key { .. } => self.log_short_auth_string(transaction_id),
            VerificationEvent::Mac { .. } => {
                self.spawn_step(transaction_id, Step::AcceptShortAuthString);
            }
            VerificationEvent::Accept { .. } => {}
            VerificationEvent::Cancel { reason, .. } => {
                info!(transaction_id, %reason, "key verification cancelled by peer");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Await every spawned step and clear the set.
    ///
    /// Failures are logged and never returned; protocol-state errors are
    /// expected when a peer aborts or replays a handshake.
    pub async fn drain(&self) -> VerificationReport {
        let mut report = VerificationReport::default();

        for (transaction_id, result) in join_all(self.tasks.drain()).await {
            match result {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(CryptoError::Protocol(message))) => {
                    report.protocol_errors += 1;
                    info!(%transaction_id, %message, "verification step rejected");
                }
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(%transaction_id, error = %err, "verification step failed");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(%transaction_id, error = %err, "verification task did not complete");
                }
            }
        }

        report
    }

    pub fn abort_all(&self) {
        self.tasks.abort_all();
    }

    fn spawn_step(&self, transaction_id: &str, step: Step) {
        let engine = Arc::clone(&self.engine);
        let txn = transaction_id.to_owned();
        let handle = self.runtime.spawn(async move {
            match step {
                Step::AcceptVerification => engine.accept_verification(&txn).await,
                Step::AcceptShortAuthString => engine.accept_short_auth_string(&txn).await,
            }
        });

        debug!(transaction_id, ?step, "spawned verification step");
        self.tasks.track(transaction_id, handle);
    }

    fn log_short_auth_string(&self, transaction_id: &str) {
        let Some(sas) = self.engine.verification(transaction_id) else {
            debug!(transaction_id, "no verification in progress; ignoring key event");
            return;
        };

        info!(
            transaction_id,
            "Short authentication string for {} via {}:\n{}",
            sas.other_user_id,
            sas.other_device_id,
            format_short_auth_string(&sas.emoji)
        );
    }
}

/// Render SAS emoji as two centered rows: symbols, then descriptions.
pub fn format_short_auth_string(emoji: &[(String, String)]) -> String {
    let symbols: String = emoji
        .iter()
        .map(|(symbol, _)| format!("{symbol:^10}"))
        .collect();
    let descriptions: String = emoji
        .iter()
        .map(|(_, description)| format!("{description:^11}"))
        .collect();
    format!("{symbols}\n{descriptions}")
}

#[cfg(test)]
mod tests {
    use relay_core::SasInfo;

    use super::*;
    use crate::mock::MockCryptoEngine;

    fn automator(engine: &Arc<MockCryptoEngine>) -> VerificationAutomator {
        VerificationAutomator::new(engine.clone(), Handle::current())
    }

    fn start(txn: &str) -> VerificationEvent {
        VerificationEvent::Start {
            transaction_id: txn.to_owned(),
            sender: "@bob:example.org".to_owned(),
            from_device: "BOBDEVICE".to_owned(),
        }
    }

    fn mac(txn: &str) -> VerificationEvent {
        VerificationEvent::Mac {
            transaction_id: txn.to_owned(),
            sender: "@bob:example.org".to_owned(),
        }
    }

    #[test]
    fn formats_fixed_width_columns() {
        let emoji = vec![
            ("🐶".to_owned(), "Dog".to_owned()),
            ("🔑".to_owned(), "Key".to_owned()),
        ];
        let rendered = format_short_auth_string(&emoji);
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].chars().count(), 20);
        assert_eq!(lines[1], "    Dog        Key    ");
    }

    #[tokio::test]
    async fn start_and_mac_spawn_accept_steps() {
        let engine = Arc::new(MockCryptoEngine::new());
        let automator = automator(&engine);

        automator.handle_event(&start("txn-1"));
        automator.handle_event(&mac("txn-1"));
        assert_eq!(automator.pending(), 2);

        let report = automator.drain().await;
        assert_eq!(report.completed, 2);
        assert_eq!(automator.pending(), 0);
        assert_eq!(engine.accepted_verifications(), vec!["txn-1".to_owned()]);
        assert_eq!(engine.accepted_sas(), vec!["txn-1".to_owned()]);
    }

    #[tokio::test]
    async fn key_event_is_informational_only() {
        let engine = Arc::new(MockCryptoEngine::new());
        engine.add_sas(SasInfo {
            transaction_id: "txn-2".into(),
            other_user_id: "@bob:example.org".into(),
            other_device_id: "BOBDEVICE".into(),
            emoji: vec![("🐶".into(), "Dog".into())],
        });
        let automator = automator(&engine);

        automator.handle_event(&VerificationEvent::Key {
            transaction_id: "txn-2".into(),
            sender: "@bob:example.org".into(),
        });
        automator.handle_event(&VerificationEvent::Key {
            transaction_id: "unknown".into(),
            sender: "@bob:example.org".into(),
        });

        assert_eq!(automator.pending(), 0);
    }

    #[tokio::test]
    async fn accept_and_cancel_spawn_nothing() {
        let engine = Arc::new(MockCryptoEngine::new());
        let automator = automator(&engine);

        automator.handle_event(&VerificationEvent::Accept {
            transaction_id: "txn-3".into(),
            sender: "@bob:example.org".into(),
        });
        automator.handle_event(&VerificationEvent::Cancel {
            transaction_id: "txn-3".into(),
            sender: "@bob:example.org".into(),
            reason: "m.user".into(),
        });

        assert_eq!(automator.pending(), 0);
    }

    #[tokio::test]
    async fn protocol_errors_are_swallowed() {
        let engine = Arc::new(MockCryptoEngine::new());
        engine.fail_verifications_with(CryptoError::Protocol("unexpected mac".into()));
        let automator = automator(&engine);

        automator.handle_event(&start("txn-4"));
        automator.handle_event(&mac("txn-5"));

        let report = automator.drain().await;
        assert_eq!(report.protocol_errors, 2);
        assert_eq!(report.completed, 0);
        assert_eq!(automator.pending(), 0);
    }
}
