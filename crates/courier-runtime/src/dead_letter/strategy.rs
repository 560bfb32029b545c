//! The three dead-letter strategies.

use super::{
    DeadLetterConfig, DeadLetterMode, DeadLetterRecord, DeadLetterStore, DeadLetterStrategy,
    EXCEPTION_MESSAGE_HEADER, EXCEPTION_TYPE_HEADER,
};
use crate::envelope::{Envelope, EnvelopeSerializer};
use crate::error::TransportError;
use crate::listener::DeliveryFailure;
use crate::sender::Sender;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

// ============================================================================
// Native
// ============================================================================

/// Broker-side dead-letter primitive
#[async_trait]
pub trait NativeDeadLettering: Send + Sync {
    async fn dead_letter_natively(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError>;
}

/// Delegates to the broker's own dead-letter queue
pub struct NativeDeadLetter {
    broker: Arc<dyn NativeDeadLettering>,
}

impl NativeDeadLetter {
    pub fn new(broker: Arc<dyn NativeDeadLettering>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl DeadLetterStrategy for NativeDeadLetter {
    fn mode(&self) -> DeadLetterMode {
        DeadLetterMode::Native
    }

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        self.broker.dead_letter_natively(envelope, failure).await
    }
}

// ============================================================================
// Interop
// ============================================================================

/// Publishes a copy carrying the failure in headers to a dead-letter destination
pub struct InteropDeadLetter {
    sender: Arc<dyn Sender>,
    config: DeadLetterConfig,
}

impl InteropDeadLetter {
    pub fn new(sender: Arc<dyn Sender>, config: DeadLetterConfig) -> Self {
        Self { sender, config }
    }

    fn dead_letter_copy(&self, envelope: &Envelope, failure: &DeliveryFailure) -> Envelope {
        let mut copy = envelope.clone();
        copy.scheduled_time = None;
        copy.persisted_outgoing = false;
        copy.destination = Some(self.sender.destination().clone());
        copy.headers
            .insert(EXCEPTION_MESSAGE_HEADER.to_string(), failure.message.clone());
        copy.headers.insert(
            EXCEPTION_TYPE_HEADER.to_string(),
            failure.exception_type.clone(),
        );
        self.config.apply(&mut copy);
        copy
    }
}

#[async_trait]
impl DeadLetterStrategy for InteropDeadLetter {
    fn mode(&self) -> DeadLetterMode {
        DeadLetterMode::InteropFriendly
    }

    #[instrument(skip(self, envelope, failure), fields(envelope_id = %envelope.id, destination = %self.sender.destination()))]
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        let copy = self.dead_letter_copy(envelope, failure);
        self.sender.send(copy).await?;
        info!(exception_type = %failure.exception_type, "Published dead-letter copy");
        Ok(())
    }
}

// ============================================================================
// Durable Storage
// ============================================================================

/// Writes failed envelopes to a [`DeadLetterStore`]
pub struct StorageDeadLetter {
    store: Arc<dyn DeadLetterStore>,
    queue_name: String,
    serializer: Arc<dyn EnvelopeSerializer>,
    expiration: Option<chrono::Duration>,
}

impl StorageDeadLetter {
    /// `queue_name` is the logical queue replayed records return to
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        queue_name: impl Into<String>,
        serializer: Arc<dyn EnvelopeSerializer>,
    ) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            serializer,
            expiration: None,
        }
    }

    /// Expire stored records after `expiration`
    pub fn with_expiration(mut self, expiration: Option<chrono::Duration>) -> Self {
        self.expiration = expiration;
        self
    }
}

#[async_trait]
impl DeadLetterStrategy for StorageDeadLetter {
    fn mode(&self) -> DeadLetterMode {
        DeadLetterMode::DurableStorage
    }

    #[instrument(skip(self, envelope, failure), fields(envelope_id = %envelope.id, queue = %self.queue_name))]
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        let now = Utc::now();
        let record = DeadLetterRecord {
            id: envelope.id,
            queue_name: self.queue_name.clone(),
            message_type: envelope.message_type.clone(),
            body: self.serializer.serialize(envelope)?,
            exception_type: failure.exception_type.clone(),
            exception_message: failure.message.clone(),
            sent_at: now,
            replayable: false,
            expires: self.expiration.map(|expiration| now + expiration),
        };

        self.store.store_dead_letter(record).await?;
        info!(exception_type = %failure.exception_type, "Stored dead letter");
        Ok(())
    }
}

#[cfg(test)]
#[path = "strategy_tests.rs"]
mod tests;
