//! Dead-letter and retry policy.
//!
//! Every endpoint picks one [`DeadLetterStrategy`] from its [`DeadLetterConfig`]:
//!
//! - **Native**: the broker's own dead-letter primitive
//! - **InteropFriendly**: a copy is published to a dead-letter destination with the failure
//!   recorded in headers
//! - **DurableStorage**: the envelope is written to the dead-letter table of the runtime's
//!   own store, from where it can be replayed
//!
//! Brokers without a visibility timeout redeliver through retry topics, see
//! [`RetryTopicRedelivery`].

use crate::envelope::{Envelope, EnvelopeId, EnvelopeSerializer};
use crate::error::TransportError;
use crate::listener::DeliveryFailure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

mod retry;
mod strategy;

pub use retry::{BrokerPublisher, RedeliveryOutcome, RetryTopicPolicy, RetryTopicRedelivery, ATTEMPTS_HEADER};
pub use strategy::{InteropDeadLetter, NativeDeadLetter, NativeDeadLettering, StorageDeadLetter};

/// Queue used when no dead-letter destination is configured
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "courier-dead-letter-queue";

/// Header carrying the failure message on interop dead-letter copies
pub const EXCEPTION_MESSAGE_HEADER: &str = "exception-message";

/// Header carrying the failure type on interop dead-letter copies
pub const EXCEPTION_TYPE_HEADER: &str = "exception-type";

// ============================================================================
// Configuration
// ============================================================================

/// How failed envelopes leave an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterMode {
    Native,
    InteropFriendly,
    DurableStorage,
}

/// Hook applied to every dead-letter copy before it is published
pub type ConfigureDeadLetter = Arc<dyn Fn(&mut Envelope) + Send + Sync>;

/// Dead-letter destination of an endpoint.
///
/// Two configurations are equal when they point at the same destination, regardless of mode
/// or hook.
#[derive(Clone)]
pub struct DeadLetterConfig {
    pub mode: DeadLetterMode,
    pub queue_name: String,
    pub topic_name: Option<String>,
    pub namespace: Option<String>,
    configure: Option<ConfigureDeadLetter>,
}

impl DeadLetterConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            mode: DeadLetterMode::Native,
            queue_name: queue_name.into(),
            topic_name: None,
            namespace: None,
            configure: None,
        }
    }

    pub fn with_mode(mut self, mode: DeadLetterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_topic(mut self, topic_name: impl Into<String>) -> Self {
        self.topic_name = Some(topic_name.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_configure<F>(mut self, configure: F) -> Self
    where
        F: Fn(&mut Envelope) + Send + Sync + 'static,
    {
        self.configure = Some(Arc::new(configure));
        self
    }

    /// Topic if configured, otherwise the queue
    pub fn destination_name(&self) -> &str {
        self.topic_name.as_deref().unwrap_or(&self.queue_name)
    }

    /// Run the configured hook on a dead-letter copy
    pub fn apply(&self, envelope: &mut Envelope) {
        if let Some(configure) = &self.configure {
            configure(envelope);
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_QUEUE)
    }
}

impl PartialEq for DeadLetterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.queue_name == other.queue_name
            && self.topic_name == other.topic_name
            && self.namespace == other.namespace
    }
}

impl Eq for DeadLetterConfig {}

impl fmt::Debug for DeadLetterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterConfig")
            .field("mode", &self.mode)
            .field("queue_name", &self.queue_name)
            .field("topic_name", &self.topic_name)
            .field("namespace", &self.namespace)
            .field("configure", &self.configure.is_some())
            .finish()
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Moves one failed envelope out of its endpoint
#[async_trait]
pub trait DeadLetterStrategy: Send + Sync {
    fn mode(&self) -> DeadLetterMode;

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError>;
}

// ============================================================================
// Dead Letter Storage
// ============================================================================

/// A dead-lettered envelope at rest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: EnvelopeId,
    /// Logical name of the queue the envelope failed on
    pub queue_name: String,
    pub message_type: String,
    pub body: Vec<u8>,
    pub exception_type: String,
    pub exception_message: String,
    pub sent_at: DateTime<Utc>,
    pub replayable: bool,
    pub expires: Option<DateTime<Utc>>,
}

/// Storage for dead-lettered envelopes
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store_dead_letter(&self, record: DeadLetterRecord) -> Result<(), TransportError>;

    async fn dead_letter_count(&self) -> Result<u64, TransportError>;

    /// Oldest records first
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, TransportError>;

    async fn mark_replayable(&self, ids: &[EnvelopeId]) -> Result<u64, TransportError>;

    /// Move every replayable record back into its source queue with attempts reset.
    ///
    /// Records whose body cannot be decoded stay in place.
    async fn replay_dead_letters(
        &self,
        serializer: &dyn EnvelopeSerializer,
    ) -> Result<u64, TransportError>;

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, TransportError>;

    /// Drop records whose `expires` has passed
    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, TransportError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
