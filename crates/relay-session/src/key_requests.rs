//! Room key re-requests for events the engine could not decrypt.

use std::sync::Arc;

use relay_core::{CryptoEngine, CryptoError, EncryptedEvent};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::tasks::{TaskRegistry, join_all};

/// Issues at most one outstanding room key request per megolm session.
pub struct KeyRequestRecovery {
    engine: Arc<dyn CryptoEngine>,
    runtime: Handle,
    tasks: TaskRegistry<Result<(), CryptoError>>,
}

impl std::fmt::Debug for KeyRequestRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRequestRecovery")
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl KeyRequestRecovery {
    pub fn new(engine: Arc<dyn CryptoEngine>, runtime: Handle) -> Self {
        Self {
            engine,
            runtime,
            tasks: TaskRegistry::new(),
        }
    }

    /// Spawn a key request for `event` unless one is already outstanding.
    ///
    /// Returns `true` when a request task was spawned.
    pub fn handle_undecryptable(&self, room_id: &str, event: &EncryptedEvent) -> bool {
        let session_id = event.session_id();

        if self.engine.has_outgoing_key_request(session_id) {
            debug!(room_id, session_id, "room key already requested");
            return false;
        }

        let spawned = self.tasks.track_unique(session_id, || {
            let engine = Arc::clone(&self.engine);
            let mut event = event.clone();
            if event.room_id.is_none() {
                event.room_id = Some(room_id.to_owned());
            }
            self.runtime
                .spawn(async move { engine.request_room_key(&event).await })
        });

        if spawned {
            info!(
                room_id,
                session_id,
                sender = %event.sender,
                "requesting room key for undecryptable event"
            );
        } else {
            debug!(room_id, session_id, "room key request already in flight");
        }
        spawned
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Await every outstanding request and clear the set.
    ///
    /// Returns how many requests completed without error.
    pub async fn drain(&self) -> usize {
        let mut completed = 0;
        for (session_id, result) in join_all(self.tasks.drain()).await {
            match result {
                Ok(Ok(())) => completed += 1,
                Ok(Err(err)) => {
                    warn!(%session_id, error = %err, "room key request failed");
                }
                Err(err) => {
                    warn!(%session_id, error = %err, "room key request task did not complete");
                }
            }
        }
        completed
    }

    pub fn abort_all(&self) {
        self.tasks.abort_all();
    }
}
