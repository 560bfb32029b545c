//! Sender contract.

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::uri::EndpointUri;
use async_trait::async_trait;

/// Delivers envelopes to one destination
#[async_trait]
pub trait Sender: Send + Sync {
    fn destination(&self) -> &EndpointUri;

    /// Whether the destination can hold envelopes until their scheduled time
    fn supports_native_scheduled_send(&self) -> bool;

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Check that the destination is reachable
    async fn ping(&self) -> Result<bool, TransportError>;
}
