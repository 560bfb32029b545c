//! Listener circuit breaker.
//!
//! Tracks receive outcomes over a rolling window. Once the window holds at least
//! `minimum_throughput` samples and the failure percentage reaches
//! `failure_percentage_threshold`, the breaker opens and the receive loop stops pulling for
//! `pause_time`. After the pause the breaker closes again with an empty window.
//!
//! # States
//!
//! - **Closed**: Normal operation, outcomes are recorded
//! - **Open**: Receiving is paused until the pause expires
//!
//! The breaker is independent of the per-loop [`FailureBackoff`](crate::backoff::FailureBackoff);
//! a loop may use both.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod breaker;
pub use breaker::ListenerCircuitBreaker;

// ============================================================================
// Circuit State
// ============================================================================

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Receiving normally while tracking outcomes.
    Closed,

    /// Receiving is paused.
    Open,
}

impl CircuitState {
    /// Check if the listener may receive in this state.
    pub fn allows_requests(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Configuration for circuit breaker behavior.
///
/// # Default Configuration
///
/// - Failure percentage threshold: 10%
/// - Minimum throughput: 10 samples
/// - Tracking period: 10 minutes
/// - Pause time: 3 minutes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (1-100) that trips the breaker
    pub failure_percentage_threshold: u32,

    /// Samples required in the window before the breaker can trip
    pub minimum_throughput: u32,

    /// Length of the rolling window in milliseconds
    pub tracking_period_ms: u64,

    /// How long receiving stays paused once tripped
    pub pause_time_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_percentage_threshold: 10,
            minimum_throughput: 10,
            tracking_period_ms: 600_000,
            pause_time_ms: 180_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn tracking_period(&self) -> Duration {
        Duration::from_millis(self.tracking_period_ms)
    }

    pub fn pause_time(&self) -> Duration {
        Duration::from_millis(self.pause_time_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_percentage_threshold == 0 || self.failure_percentage_threshold > 100 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "circuit_breaker.failure_percentage_threshold must be 1-100, got {}",
                    self.failure_percentage_threshold
                ),
            });
        }

        if self.minimum_throughput == 0 {
            return Err(ConfigurationError::Invalid {
                message: "circuit_breaker.minimum_throughput must be greater than 0".to_string(),
            });
        }

        if self.tracking_period_ms == 0 || self.pause_time_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "circuit_breaker periods must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub samples_in_window: usize,
    pub failures_in_window: usize,
    pub failure_percentage: f64,
    pub consecutive_failures: u32,
    pub trip_count: u64,
    pub remaining_pause: Option<Duration>,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
