//! Trust decisions for devices reported by a key query, and the downstream
//! device-change notification.

use std::{str::FromStr, sync::Arc};

use relay_core::{
    ChangedDevices, CryptoEngine, Delivery, DeviceChangeNotification, NotificationQueue,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How devices with changed identity keys are treated.
///
/// `AutoTrust` is trust-on-first-use: every non-deleted device is marked
/// trusted without comparing a short authentication string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    #[default]
    AutoTrust,
    /// Leave changed devices untrusted for an operator to confirm.
    RequireConfirmation,
}

impl TrustPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoTrust => "auto",
            Self::RequireConfirmation => "confirm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown trust policy '{0}', expected 'auto' or 'confirm'")]
pub struct UnknownTrustPolicy(pub String);

impl FromStr for TrustPolicy {
    type Err = UnknownTrustPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::AutoTrust),
            "confirm" => Ok(Self::RequireConfirmation),
            _ => Err(UnknownTrustPolicy(value.to_owned())),
        }
    }
}

/// What happened to the devices of one key-query result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrustReport {
    pub trusted: usize,
    pub skipped_deleted: usize,
    pub pending_confirmation: usize,
    pub failed: usize,
    pub published: bool,
}

pub struct DeviceTrustNotifier {
    engine: Arc<dyn CryptoEngine>,
    policy: TrustPolicy,
    queue: NotificationQueue,
    user_id: String,
}

impl std::fmt::Debug for DeviceTrustNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTrustNotifier")
            .field("policy", &self.policy)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl DeviceTrustNotifier {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        policy: TrustPolicy,
        queue: NotificationQueue,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            policy,
            queue,
            user_id: user_id.into(),
        }
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Apply the trust policy to `devices`, then publish them downstream.
    pub async fn handle_changed(&self, devices: ChangedDevices) -> TrustReport {
        let mut report = TrustReport::default();

        for (user_id, user_devices) in &devices {
            for (device_id, device) in user_devices {
                if device.deleted {
                    report.skipped_deleted += 1;
                    debug!(%user_id, %device_id, "skipping deleted device");
                    continue;
                }

                match self.policy {
                    TrustPolicy::AutoTrust => match self.engine.verify_device(device) {
                        Ok(()) => {
                            report.trusted += 1;
                            info!(
                                %user_id,
                                %device_id,
                                display_name = device.display_name.as_deref().unwrap_or_default(),
                                "automatically trusting device"
                            );
                        }
                        Err(err) => {
                            report.failed += 1;
                            warn!(%user_id, %device_id, error = %err, "failed to trust device");
                        }
                    },
                    TrustPolicy::RequireConfirmation => {
                        report.pending_confirmation += 1;
                        info!(%user_id, %device_id, "device changed; awaiting operator confirmation");
                    }
                }
            }
        }

        let notification = DeviceChangeNotification {
            user_id: self.user_id.clone(),
            devices,
        };
        match self.queue.publish(notification).await {
            Ok(Delivery::Queued) => report.published = true,
            Ok(Delivery::Dropped) => {
                warn!(user_id = %self.user_id, "notification queue full; dropped device change");
            }
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "device change not delivered");
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use relay_core::{Backpressure, DeviceRecord};

    use super::*;
    use crate::mock::MockCryptoEngine;

    fn changed() -> ChangedDevices {
        let mut deleted = DeviceRecord::new("@bob:example.org", "OLDPHONE");
        deleted.deleted = true;

        let mut bob = BTreeMap::new();
        bob.insert(
            "LAPTOP".to_owned(),
            DeviceRecord::new("@bob:example.org", "LAPTOP"),
        );
        bob.insert("OLDPHONE".to_owned(), deleted);

        let mut devices = ChangedDevices::new();
        devices.insert("@bob:example.org".to_owned(), bob);
        devices
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("auto".parse::<TrustPolicy>(), Ok(TrustPolicy::AutoTrust));
        assert_eq!(" Confirm ".parse::<TrustPolicy>(), Ok(TrustPolicy::RequireConfirmation));
        assert!("always".parse::<TrustPolicy>().is_err());
        assert_eq!(TrustPolicy::default().as_str(), "auto");
    }

    #[tokio::test]
    async fn auto_trust_skips_deleted_devices_and_publishes() {
        let engine = Arc::new(MockCryptoEngine::new());
        let (queue, mut rx) = NotificationQueue::new(4, Backpressure::Block);
        let notifier =
            DeviceTrustNotifier::new(engine.clone(), TrustPolicy::AutoTrust, queue, "@alice:example.org");

        let report = notifier.handle_changed(changed()).await;

        assert_eq!(report.trusted, 1);
        assert_eq!(report.skipped_deleted, 1);
        assert!(report.published);
        assert_eq!(
            engine.verified_devices(),
            vec![("@bob:example.org".to_owned(), "LAPTOP".to_owned())]
        );

        let notification = rx.recv().await.expect("notification");
        assert_eq!(notification.user_id, "@alice:example.org");
        assert_eq!(notification.devices, changed());
    }

    #[tokio::test]
    async fn confirmation_policy_leaves_devices_untrusted() {
        let engine = Arc::new(MockCryptoEngine::new());
        let (queue, mut rx) = NotificationQueue::new(4, Backpressure::Block);
        let notifier = DeviceTrustNotifier::new(
            engine.clone(),
            TrustPolicy::RequireConfirmation,
            queue,
            "@alice:example.org",
        );

        let report = notifier.handle_changed(changed()).await;

        assert_eq!(report.trusted, 0);
        assert_eq!(report.pending_confirmation, 1);
        assert!(engine.verified_devices().is_empty());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_queue_is_not_fatal() {
        let engine = Arc::new(MockCryptoEngine::new());
        let (queue, rx) = NotificationQueue::new(1, Backpressure::DropNewest);
        drop(rx);
        let notifier =
            DeviceTrustNotifier::new(engine, TrustPolicy::AutoTrust, queue, "@alice:example.org");

        let report = notifier.handle_changed(changed()).await;

        assert_eq!(report.trusted, 1);
        assert!(!report.published);
    }
}
