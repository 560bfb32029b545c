//! Retry-topic redelivery for brokers without a visibility timeout.

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::listener::DeliveryFailure;
use crate::uri::EndpointUri;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{EXCEPTION_MESSAGE_HEADER, EXCEPTION_TYPE_HEADER};

/// Header carrying the attempt count on retry copies
pub const ATTEMPTS_HEADER: &str = "courier-attempts";

/// Per-attempt redelivery delays.
///
/// The delay for an envelope that failed on attempt `n` is entry `n - 1`; once the table is
/// exhausted the envelope is dead-lettered.
///
/// # Examples
///
/// ```rust
/// use courier_runtime::dead_letter::RetryTopicPolicy;
/// use std::time::Duration;
///
/// let policy = RetryTopicPolicy::new(vec![Duration::from_secs(1), Duration::from_secs(30)]);
/// assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
/// assert_eq!(policy.delay_for(3), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopicPolicy {
    delays: Vec<Duration>,
}

impl RetryTopicPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay before redelivering an envelope that failed on attempt `attempts`
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        let index = attempts.checked_sub(1)? as usize;
        self.delays.get(index).copied()
    }

    /// Number of redeliveries the policy allows
    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }
}

impl Default for RetryTopicPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(60),
        ])
    }
}

/// Broker operations needed for retry-topic redelivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Remove the original from the source subscription
    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Publish to a destination, delivered after `delay` when given
    async fn publish(
        &self,
        destination: &EndpointUri,
        envelope: Envelope,
        delay: Option<Duration>,
    ) -> Result<(), TransportError>;
}

/// What happened to a failed envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryOutcome {
    Retried { attempt: u32, delay: Duration },
    DeadLettered,
}

/// Routes failures to a retry destination or the dead-letter destination
pub struct RetryTopicRedelivery {
    publisher: Arc<dyn BrokerPublisher>,
    policy: RetryTopicPolicy,
    retry_destination: EndpointUri,
    dead_letter_destination: EndpointUri,
}

impl RetryTopicRedelivery {
    pub fn new(
        publisher: Arc<dyn BrokerPublisher>,
        policy: RetryTopicPolicy,
        retry_destination: EndpointUri,
        dead_letter_destination: EndpointUri,
    ) -> Self {
        Self {
            publisher,
            policy,
            retry_destination,
            dead_letter_destination,
        }
    }

    /// Settle a failed envelope.
    ///
    /// `envelope.attempts` is the attempt that just failed.
    pub async fn handle_failure(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
        retryable: bool,
    ) -> Result<RedeliveryOutcome, TransportError> {
        self.publisher.acknowledge(envelope).await?;

        let delay = if retryable {
            self.policy.delay_for(envelope.attempts)
        } else {
            None
        };

        match delay {
            Some(delay) => {
                let mut copy = envelope.clone();
                copy.attempts = envelope.attempts + 1;
                copy.headers
                    .insert(ATTEMPTS_HEADER.to_string(), copy.attempts.to_string());

                self.publisher
                    .publish(&self.retry_destination, copy, Some(delay))
                    .await?;

                info!(
                    envelope_id = %envelope.id,
                    attempt = envelope.attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled redelivery through retry destination"
                );

                Ok(RedeliveryOutcome::Retried {
                    attempt: envelope.attempts + 1,
                    delay,
                })
            }
            None => {
                let mut copy = envelope.clone();
                copy.headers
                    .insert(EXCEPTION_MESSAGE_HEADER.to_string(), failure.message.clone());
                copy.headers.insert(
                    EXCEPTION_TYPE_HEADER.to_string(),
                    failure.exception_type.clone(),
                );

                self.publisher
                    .publish(&self.dead_letter_destination, copy, None)
                    .await?;

                warn!(
                    envelope_id = %envelope.id,
                    attempts = envelope.attempts,
                    retryable,
                    "Envelope dead-lettered"
                );

                Ok(RedeliveryOutcome::DeadLettered)
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
