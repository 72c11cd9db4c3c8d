//! Concurrent delivery of the engine's queued to-device messages.

use std::sync::Arc;

use relay_core::{CryptoEngine, Transport};
use tokio::{runtime::Handle, task::JoinSet};
use tracing::{debug, warn};

/// Outcome counts of one dispatch round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.sent + self.failed
    }
}

/// Send every pending to-device message in parallel and wait for all of them.
///
/// Messages are removed from the engine up front. Failed sends are logged and
/// not retried; the engine regenerates whatever is still needed.
pub async fn send_outgoing_to_device(
    engine: &dyn CryptoEngine,
    transport: Arc<dyn Transport>,
    runtime: &Handle,
) -> DispatchReport {
    let messages = engine.take_outgoing_to_device_messages();
    let mut report = DispatchReport::default();
    if messages.is_empty() {
        return report;
    }

    debug!(count = messages.len(), "sending to-device messages");

    let mut sends = JoinSet::new();
    for message in messages {
        let transport = Arc::clone(&transport);
        sends.spawn_on(
            async move {
                let response = transport.send_to_device(&message).await;
                (message, response)
            },
            runtime,
        );
    }

    while let Some(joined) = sends.join_next().await {
        match joined {
            Ok((message, Ok(response))) if response.status == 200 => {
                report.sent += 1;
                debug!(txn_id = %message.txn_id, event_type = %message.event_type, "to-device message sent");
            }
            Ok((message, Ok(response))) => {
                report.failed += 1;
                warn!(
                    txn_id = %message.txn_id,
                    event_type = %message.event_type,
                    status = response.status,
                    "to-device message rejected"
                );
            }
            Ok((message, Err(err))) => {
                report.failed += 1;
                warn!(
                    txn_id = %message.txn_id,
                    event_type = %message.event_type,
                    error = %err,
                    "failed to send to-device message"
                );
            }
            Err(err) => {
                report.failed += 1;
                warn!(error = %err, "to-device send task did not complete");
            }
        }
    }

    report
}
