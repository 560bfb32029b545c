//! Listener, receiver and acknowledger contracts.
//!
//! A [`Listener`] pulls envelopes in background loops and hands each batch to a [`Receiver`]
//! together with an [`Acknowledger`]. The receiver settles every envelope through exactly one
//! acknowledger call.

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::uri::EndpointUri;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Why an envelope is being dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Kind of failure, e.g. the handler error type
    pub exception_type: String,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }
}

/// Settles envelopes handed out by a listener
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Processing succeeded; the envelope is gone for good
    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Give the envelope back to the queue for another attempt
    async fn defer(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Redeliver no earlier than `time`
    async fn move_to_scheduled(
        &self,
        envelope: Envelope,
        time: DateTime<Utc>,
    ) -> Result<(), TransportError>;

    /// Hand the envelope to the endpoint's dead-letter strategy
    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError>;
}

/// Background pull loop over one endpoint
#[async_trait]
pub trait Listener: Acknowledger {
    /// Address being listened to
    fn address(&self) -> &EndpointUri;

    /// Start the pull loops; starting a running listener is a no-op
    async fn start(&self) -> Result<(), TransportError>;

    /// Cancel the loops and wait for them to exit
    async fn stop(&self);

    /// Stop and release everything the listener owns
    async fn dispose(&self);

    fn is_running(&self) -> bool;
}

/// Application-side consumer of received batches
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive(
        &self,
        acknowledger: Arc<dyn Acknowledger>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), TransportError>;
}
