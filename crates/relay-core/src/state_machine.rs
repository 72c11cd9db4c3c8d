use crate::{error::RelayError, types::SyncLoopState};

/// `Idle -> Syncing -> {Syncing, Backoff, Stopped}`, `Backoff -> {Syncing, Stopped}`.
#[derive(Debug, Clone)]
pub struct SyncLoopStateMachine {
    state: SyncLoopState,
}

impl Default for SyncLoopStateMachine {
    fn default() -> Self {
        Self {
            state: SyncLoopState::Idle,
        }
    }
}

impl SyncLoopStateMachine {
    pub fn state(&self) -> SyncLoopState {
        self.state
    }

    pub fn start(&mut self) -> Result<SyncLoopState, RelayError> {
        self.transition_from_state(SyncLoopState::Idle, SyncLoopState::Syncing, "start")
    }

    pub fn on_cycle_complete(&mut self) -> Result<SyncLoopState, RelayError> {
        self.transition_from_state(
            SyncLoopState::Syncing,
            SyncLoopState::Syncing,
            "cycle_complete",
        )
    }

    pub fn on_transport_fault(&mut self) -> Result<SyncLoopState, RelayError> {
        self.transition_from_state(
            SyncLoopState::Syncing,
            SyncLoopState::Backoff,
            "transport_fault",
        )
    }

    pub fn on_backoff_elapsed(&mut self) -> Result<SyncLoopState, RelayError> {
        self.transition_from_state(
            SyncLoopState::Backoff,
            SyncLoopState::Syncing,
            "backoff_elapsed",
        )
    }

    pub fn stop(&mut self) -> Result<SyncLoopState, RelayError> {
        self.transition_from_any_of(
            &[SyncLoopState::Syncing, SyncLoopState::Backoff],
            SyncLoopState::Stopped,
            "stop",
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            SyncLoopState::Syncing | SyncLoopState::Backoff
        )
    }

    fn transition_from_state(
        &mut self,
        expected: SyncLoopState,
        next: SyncLoopState,
        action: &str,
    ) -> Result<SyncLoopState, RelayError> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SyncLoopState],
        next: SyncLoopState,
        action: &str,
    ) -> Result<SyncLoopState, RelayError> {
        if !expected.contains(&self.state) {
            return Err(RelayError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
