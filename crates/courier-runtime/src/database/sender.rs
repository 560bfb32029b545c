//! Database queue sender.

use super::store::{QueueRecord, QueueStore, QueueTable};
use crate::endpoint::EndpointMode;
use crate::envelope::{Envelope, EnvelopeSerializer};
use crate::error::TransportError;
use crate::sender::Sender;
use crate::uri::EndpointUri;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Writes envelopes into one queue of one physical store.
///
/// Durable endpoints move envelopes the caller already persisted to the outbox instead of
/// inserting them a second time.
pub struct DatabaseSender {
    destination: EndpointUri,
    table: QueueTable,
    store: Arc<dyn QueueStore>,
    serializer: Arc<dyn EnvelopeSerializer>,
    mode: EndpointMode,
}

impl DatabaseSender {
    pub fn new(
        destination: EndpointUri,
        table: QueueTable,
        store: Arc<dyn QueueStore>,
        serializer: Arc<dyn EnvelopeSerializer>,
        mode: EndpointMode,
    ) -> Self {
        Self {
            destination,
            table,
            store,
            serializer,
            mode,
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Queue row for `envelope` and its execution time when it is due later
    fn record_for(
        &self,
        envelope: &Envelope,
    ) -> Result<(QueueRecord, Option<DateTime<Utc>>), TransportError> {
        let record = QueueRecord {
            id: envelope.id,
            body: self.serializer.serialize(envelope)?,
            message_type: envelope.message_type.clone(),
            keep_until: envelope.deliver_by,
        };
        let execution_time = envelope
            .scheduled_time
            .filter(|_| envelope.is_scheduled_for_later(Utc::now()));
        Ok((record, execution_time))
    }

    /// Re-send an envelope held in this store's inbox.
    ///
    /// The inbox row is released in the same store operation, so a concurrent claim of the
    /// re-sent row keeps its own inbox row.
    #[instrument(skip(self, envelope), fields(envelope_id = %envelope.id, queue = %self.table.queue_name))]
    pub async fn resend_incoming(&self, envelope: Envelope) -> Result<(), TransportError> {
        let (record, execution_time) = self.record_for(&envelope)?;
        self.store
            .requeue_incoming(&self.table, record, execution_time)
            .await
    }

    async fn move_from_outbox(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let execution_time = envelope
            .scheduled_time
            .filter(|_| envelope.is_scheduled_for_later(Utc::now()));

        let moved = self
            .store
            .move_outgoing(&self.table, envelope.id, execution_time)
            .await?;

        if !moved {
            warn!(
                envelope_id = %envelope.id,
                queue = %self.table.queue_name,
                "Outgoing envelope not found, assuming it was already moved"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for DatabaseSender {
    fn destination(&self) -> &EndpointUri {
        &self.destination
    }

    fn supports_native_scheduled_send(&self) -> bool {
        true
    }

    #[instrument(skip(self, envelope), fields(envelope_id = %envelope.id, queue = %self.table.queue_name))]
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.mode == EndpointMode::Durable && envelope.persisted_outgoing {
            return self.move_from_outbox(&envelope).await;
        }

        let (record, execution_time) = self.record_for(&envelope)?;
        match execution_time {
            Some(time) => {
                debug!(execution_time = %time, "Scheduling envelope");
                self.store.send_scheduled(&self.table, record, time).await
            }
            None => self.store.send_ready(&self.table, record).await,
        }
    }

    async fn ping(&self) -> Result<bool, TransportError> {
        match self.store.ping().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => {
                warn!(data_source = %self.store.identifier(), error = %e, "Ping failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
