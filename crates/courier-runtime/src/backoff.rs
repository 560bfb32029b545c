//! Failure-count backoff for background loops.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff shape applied after consecutive loop failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub step_ms: u64,
    pub max_steps: u32,
    pub ceiling_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step_ms: 100,
            max_steps: 5,
            ceiling_ms: 1000,
        }
    }
}

/// Tracks consecutive failures of one loop.
///
/// The n-th consecutive failure waits `n * step` up to `max_steps`; past `max_steps` the wait is
/// pinned at `ceiling`. No wait exceeds `ceiling`.
#[derive(Debug, Clone)]
pub struct FailureBackoff {
    config: BackoffConfig,
    failures: u32,
}

impl FailureBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long the loop should wait
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.config.max_steps {
            return Duration::from_millis(self.config.ceiling_ms);
        }
        let stepped = self.config.step_ms.saturating_mul(u64::from(self.failures));
        Duration::from_millis(stepped.min(self.config.ceiling_ms))
    }

    /// Reset after a successful iteration
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures seen so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Sleep for `duration` unless the token is cancelled first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
