//! Message handler registry and the receiving pipeline built on it.
//!
//! Handlers are registered per message type at startup. [`HandlerPipeline`] is a [`Receiver`]
//! that runs the matching handler for each envelope and settles it through the acknowledger:
//!
//! - success completes the envelope;
//! - a retryable failure below `max_attempts` reschedules it (or defers it when no delay is
//!   configured for that attempt);
//! - anything else, including a missing handler, dead-letters it.

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::listener::{Acknowledger, DeliveryFailure, Receiver};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Exception type recorded when no handler is registered for a message type
pub const NO_HANDLER_EXCEPTION: &str = "NoHandlerForMessage";

/// Exception type recorded for handler failures
pub const HANDLER_EXCEPTION: &str = "HandlerFailed";

/// Failure reported by a message handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Application code for one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Message type to handler map, built once at startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any earlier registration
    pub fn register(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    pub fn handler_for(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Retry behaviour of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Attempts allowed before an envelope is dead-lettered
    pub max_attempts: u32,
    /// Delay before attempt `n + 1`, indexed by `n - 1`; missing entries defer immediately
    pub retry_delays: Vec<Duration>,
}

impl FailurePolicy {
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        let index = usize::try_from(attempts.checked_sub(1)?).ok()?;
        self.retry_delays.get(index).copied()
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delays: vec![Duration::from_secs(1), Duration::from_secs(5)],
        }
    }
}

/// [`Receiver`] dispatching envelopes to registered handlers
pub struct HandlerPipeline {
    registry: Arc<HandlerRegistry>,
    policy: FailurePolicy,
}

impl HandlerPipeline {
    pub fn new(registry: Arc<HandlerRegistry>, policy: FailurePolicy) -> Self {
        Self { registry, policy }
    }

    async fn settle(
        &self,
        acknowledger: &dyn Acknowledger,
        mut envelope: Envelope,
    ) -> Result<(), TransportError> {
        envelope.attempts += 1;

        if envelope.is_ping() {
            return acknowledger.complete(&envelope).await;
        }

        let Some(handler) = self.registry.handler_for(&envelope.message_type) else {
            warn!(
                envelope_id = %envelope.id,
                message_type = %envelope.message_type,
                "No handler registered, dead-lettering"
            );
            let failure = DeliveryFailure::new(
                NO_HANDLER_EXCEPTION,
                format!("no handler for message type '{}'", envelope.message_type),
            );
            return acknowledger.move_to_dead_letter(&envelope, &failure).await;
        };

        let error = match handler.handle(&envelope).await {
            Ok(()) => {
                debug!(envelope_id = %envelope.id, "Envelope handled");
                return acknowledger.complete(&envelope).await;
            }
            Err(e) => e,
        };

        if error.retryable && envelope.attempts < self.policy.max_attempts {
            warn!(
                envelope_id = %envelope.id,
                attempts = envelope.attempts,
                error = %error,
                "Handler failed, retrying"
            );
            return match self.policy.delay_for(envelope.attempts) {
                Some(delay) => {
                    let at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    acknowledger.move_to_scheduled(envelope, at).await
                }
                None => acknowledger.defer(envelope).await,
            };
        }

        info!(
            envelope_id = %envelope.id,
            attempts = envelope.attempts,
            error = %error,
            "Dead-lettering envelope"
        );
        let failure = DeliveryFailure::new(HANDLER_EXCEPTION, error.message);
        acknowledger.move_to_dead_letter(&envelope, &failure).await
    }
}

#[async_trait]
impl Receiver for HandlerPipeline {
    async fn receive(
        &self,
        acknowledger: Arc<dyn Acknowledger>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), TransportError> {
        let mut last_error = None;

        for envelope in envelopes {
            let envelope_id = envelope.id;
            if let Err(e) = self.settle(acknowledger.as_ref(), envelope).await {
                error!(envelope_id = %envelope_id, error = %e, "Failed to settle envelope");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
