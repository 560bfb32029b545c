//! Rolling-window circuit breaker used by listener receive loops.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CircuitBreakerConfig, CircuitMetrics, CircuitState};
use crate::backoff::sleep_or_cancel;

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
struct InternalState {
    /// Outcomes inside the tracking period, oldest first
    window: VecDeque<(Instant, bool)>,

    consecutive_failures: u32,

    /// Set while the breaker is open
    paused_until: Option<Instant>,

    trip_count: u64,
}

impl InternalState {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            consecutive_failures: 0,
            paused_until: None,
            trip_count: 0,
        }
    }

    fn failures(&self) -> usize {
        self.window.iter().filter(|(_, success)| !success).count()
    }

    fn failure_percentage(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 * 100.0 / self.window.len() as f64
        }
    }

    fn prune(&mut self, now: Instant, tracking_period: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > tracking_period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Close the breaker if its pause has expired
    fn refresh(&mut self, now: Instant) {
        if matches!(self.paused_until, Some(until) if until <= now) {
            self.paused_until = None;
            self.window.clear();
            self.consecutive_failures = 0;
        }
    }

    fn current_state(&self, now: Instant) -> CircuitState {
        match self.paused_until {
            Some(until) if until > now => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }
}

// ============================================================================
// Listener Circuit Breaker
// ============================================================================

/// Circuit breaker guarding one listener's receive loop.
pub struct ListenerCircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<InternalState>,
}

impl ListenerCircuitBreaker {
    /// Create new circuit breaker with configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(InternalState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InternalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one receive outcome.
    ///
    /// Returns the pause duration when this outcome trips the breaker. Outcomes arriving
    /// while the breaker is open are ignored.
    pub fn record(&self, success: bool) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        state.refresh(now);

        if state.current_state(now) == CircuitState::Open {
            return None;
        }

        state.prune(now, self.config.tracking_period());
        state.window.push_back((now, success));

        if success {
            state.consecutive_failures = 0;
            return None;
        }

        state.consecutive_failures += 1;

        let samples = state.window.len();
        let percentage = state.failure_percentage();
        if samples >= self.config.minimum_throughput as usize
            && percentage >= f64::from(self.config.failure_percentage_threshold)
        {
            let pause = self.config.pause_time();
            state.paused_until = Some(now + pause);
            state.trip_count += 1;
            warn!(
                listener = %self.name,
                samples,
                failure_percentage = percentage,
                pause_ms = pause.as_millis() as u64,
                "Circuit breaker tripped, pausing listener"
            );
            return Some(pause);
        }

        None
    }

    /// Get current circuit breaker state.
    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        let mut state = self.lock();
        state.refresh(now);
        state.current_state(now)
    }

    /// Wait until the breaker is closed.
    ///
    /// Returns `false` if the token was cancelled while waiting.
    pub async fn wait_while_paused(&self, token: &CancellationToken) -> bool {
        loop {
            let remaining = {
                let now = Instant::now();
                let mut state = self.lock();
                state.refresh(now);
                state
                    .paused_until
                    .map(|until| until.saturating_duration_since(now))
            };

            match remaining {
                None => return true,
                Some(pause) => {
                    if !sleep_or_cancel(token, pause).await {
                        return false;
                    }
                    info!(listener = %self.name, "Circuit breaker pause elapsed, resuming listener");
                }
            }
        }
    }

    /// Get circuit breaker metrics and statistics.
    pub fn metrics(&self) -> CircuitMetrics {
        let now = Instant::now();
        let mut state = self.lock();
        state.refresh(now);
        state.prune(now, self.config.tracking_period());

        CircuitMetrics {
            state: state.current_state(now),
            samples_in_window: state.window.len(),
            failures_in_window: state.failures(),
            failure_percentage: state.failure_percentage(),
            consecutive_failures: state.consecutive_failures,
            trip_count: state.trip_count,
            remaining_pause: state
                .paused_until
                .map(|until| until.saturating_duration_since(now)),
        }
    }

    /// Force the breaker closed and clear the window (admin operation).
    pub fn reset(&self) {
        let mut state = self.lock();
        state.paused_until = None;
        state.window.clear();
        state.consecutive_failures = 0;
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
