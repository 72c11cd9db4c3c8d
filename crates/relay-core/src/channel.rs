use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::DeviceChangeNotification;

/// Receiving half handed to the single downstream consumer.
pub type NotificationReceiver = mpsc::Receiver<DeviceChangeNotification>;

/// What to do when the consumer is not keeping up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait until the consumer frees a slot.
    #[default]
    Block,
    /// Drop the new notification.
    DropNewest,
}

/// Errors returned by notification queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationQueueError {
    /// The consumer side is closed.
    #[error("notification queue is closed")]
    Closed,
}

/// Outcome of a publish that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Dropped,
}

/// Single-producer queue carrying device-change notifications.
#[derive(Clone, Debug)]
pub struct NotificationQueue {
    tx: mpsc::Sender<DeviceChangeNotification>,
    backpressure: Backpressure,
}

impl NotificationQueue {
    /// Create a queue and return it with its receiver.
    pub fn new(capacity: usize, backpressure: Backpressure) -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, backpressure }, rx)
    }

    pub fn backpressure(&self) -> Backpressure {
        self.backpressure
    }

    /// Publish one notification according to the back-pressure policy.
    pub async fn publish(
        &self,
        notification: DeviceChangeNotification,
    ) -> Result<Delivery, NotificationQueueError> {
        match self.backpressure {
            Backpressure::Block => self
                .tx
                .send(notification)
                .await
                .map(|()| Delivery::Queued)
                .map_err(|_| NotificationQueueError::Closed),
            Backpressure::DropNewest => match self.tx.try_send(notification) {
                Ok(()) => Ok(Delivery::Queued),
                Err(TrySendError::Full(_)) => Ok(Delivery::Dropped),
                Err(TrySendError::Closed(_)) => Err(NotificationQueueError::Closed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::types::ChangedDevices;

    fn notification(user_id: &str) -> DeviceChangeNotification {
        DeviceChangeNotification {
            user_id: user_id.to_owned(),
            devices: ChangedDevices::new(),
        }
    }

    #[tokio::test]
    async fn delivers_notifications_in_order() {
        let (queue, mut rx) = NotificationQueue::new(4, Backpressure::Block);
        queue
            .publish(notification("@alice:example.org"))
            .await
            .expect("publish should work");
        queue
            .publish(notification("@bob:example.org"))
            .await
            .expect("publish should work");

        let first = rx.recv().await.expect("first notification");
        let second = rx.recv().await.expect("second notification");
        assert_eq!(first.user_id, "@alice:example.org");
        assert_eq!(second.user_id, "@bob:example.org");
    }

    #[tokio::test]
    async fn drop_policy_discards_when_full() {
        let (queue, mut rx) = NotificationQueue::new(1, Backpressure::DropNewest);
        let first = queue
            .publish(notification("@alice:example.org"))
            .await
            .expect("publish should work");
        let second = queue
            .publish(notification("@bob:example.org"))
            .await
            .expect("full queue is not an error");

        assert_eq!(first, Delivery::Queued);
        assert_eq!(second, Delivery::Dropped);
        assert_eq!(
            rx.recv().await.expect("queued notification").user_id,
            "@alice:example.org"
        );
    }

    #[tokio::test]
    async fn block_policy_waits_for_capacity() {
        let (queue, mut rx) = NotificationQueue::new(1, Backpressure::Block);
        queue
            .publish(notification("@alice:example.org"))
            .await
            .expect("publish should work");

        let blocked = timeout(
            Duration::from_millis(50),
            queue.publish(notification("@bob:example.org")),
        )
        .await;
        assert!(blocked.is_err(), "second publish should wait for capacity");

        rx.recv().await.expect("drain one");
        queue
            .publish(notification("@bob:example.org"))
            .await
            .expect("publish after drain should work");
    }

    #[tokio::test]
    async fn reports_closed_consumer() {
        let (queue, rx) = NotificationQueue::new(1, Backpressure::Block);
        drop(rx);
        let err = queue
            .publish(notification("@alice:example.org"))
            .await
            .expect_err("closed queue must fail");
        assert_eq!(err, NotificationQueueError::Closed);
    }
}
