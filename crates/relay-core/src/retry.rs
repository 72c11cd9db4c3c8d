use std::time::Duration;

/// Reconnect delay used by the sync loop.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Delay between a failed sync and the next attempt.
///
/// The delay does not grow with repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay_ms: u64,
}

impl RetryPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self { delay_ms }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY_MS)
    }
}
