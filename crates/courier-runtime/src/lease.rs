//! Lease renewal for brokers that hide in-flight messages behind a visibility timeout.
//!
//! A [`LeaseRenewer`] spawns one task per in-flight message. The task extends the lease every
//! `renewal_fraction * lease_duration` until it is stopped, the broker reports the lease as
//! gone, or the total extension budget is used up.

use crate::backoff::sleep_or_cancel;
use crate::error::{ConfigurationError, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease renewal settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Extension requested on every renewal
    pub lease_duration_ms: u64,

    /// Renewing stops once this much time has passed since the first renewal was scheduled
    pub max_total_extension_ms: u64,

    /// Fraction of the lease after which a renewal is attempted
    pub renewal_fraction: f64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 30_000,
            max_total_extension_ms: 300_000,
            renewal_fraction: 0.7,
        }
    }
}

impl LeaseConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn max_total_extension(&self) -> Duration {
        Duration::from_millis(self.max_total_extension_ms)
    }

    /// Interval between renewals
    pub fn renewal_interval(&self) -> Duration {
        self.lease_duration().mul_f64(self.renewal_fraction)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.lease_duration_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "lease.lease_duration_ms must be greater than 0".to_string(),
            });
        }

        if !(self.renewal_fraction > 0.0 && self.renewal_fraction < 1.0) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "lease.renewal_fraction must be between 0 and 1 (exclusive), got {}",
                    self.renewal_fraction
                ),
            });
        }

        Ok(())
    }
}

/// Failure reported by a broker when extending a lease
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Lease for message {message_id} is no longer valid")]
    Invalid { message_id: String },

    #[error("Lease for message {message_id} has expired")]
    Expired { message_id: String },

    #[error("Lease renewal failed: {message}")]
    Transient { message: String },
}

impl LeaseError {
    /// Check if the lease is definitely gone
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Invalid { .. } | Self::Expired { .. })
    }
}

impl From<LeaseError> for TransportError {
    fn from(error: LeaseError) -> Self {
        match error {
            LeaseError::Invalid { message_id } | LeaseError::Expired { message_id } => {
                TransportError::LeaseLost {
                    message: "lease no longer held".to_string(),
                    message_id,
                }
            }
            LeaseError::Transient { message } => TransportError::ConnectionFailed { message },
        }
    }
}

/// Broker primitive that extends a message lease
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn renew(&self, message_id: &str, extension: Duration) -> Result<(), LeaseError>;
}

/// Why a renewal task finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Stopped,
    LeaseLost,
    MaxExtensionReached,
}

/// Spawns lease renewal tasks
#[derive(Clone)]
pub struct LeaseRenewer {
    client: Arc<dyn LeaseClient>,
    config: LeaseConfig,
    cancellation: CancellationToken,
}

impl LeaseRenewer {
    /// Tasks spawned by this renewer stop when `cancellation` is cancelled
    pub fn new(
        client: Arc<dyn LeaseClient>,
        config: LeaseConfig,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            cancellation,
        }
    }

    /// Start renewing the lease of one message
    pub fn spawn(&self, message_id: impl Into<String>) -> LeaseRenewal {
        let message_id = message_id.into();
        let token = self.cancellation.child_token();
        let client = self.client.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(renew_loop(client, config, message_id, token.clone()));

        LeaseRenewal { token, handle }
    }
}

async fn renew_loop(
    client: Arc<dyn LeaseClient>,
    config: LeaseConfig,
    message_id: String,
    token: CancellationToken,
) -> RenewalOutcome {
    let interval = config.renewal_interval();
    let started = Instant::now();

    loop {
        if !sleep_or_cancel(&token, interval).await {
            return RenewalOutcome::Stopped;
        }

        if started.elapsed() >= config.max_total_extension() {
            info!(message_id = %message_id, "Lease reached maximum total extension, no longer renewing");
            return RenewalOutcome::MaxExtensionReached;
        }

        match client.renew(&message_id, config.lease_duration()).await {
            Ok(()) => {
                debug!(message_id = %message_id, "Lease renewed");
            }
            Err(e) if e.is_lost() => {
                warn!(message_id = %message_id, error = %e, "Lease lost, stopping renewal");
                return RenewalOutcome::LeaseLost;
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Lease renewal failed, retrying next tick");
            }
        }
    }
}

/// Handle to a running renewal task
pub struct LeaseRenewal {
    token: CancellationToken,
    handle: JoinHandle<RenewalOutcome>,
}

impl LeaseRenewal {
    /// Check if the task already exited on its own
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop renewing and wait for the task to exit
    pub async fn stop(self) -> RenewalOutcome {
        self.token.cancel();
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Lease renewal task failed");
                RenewalOutcome::Stopped
            }
        }
    }
}

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;
