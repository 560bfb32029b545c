//! Endpoints and the per-transport endpoint registry.

use crate::config::TransportSettings;
use crate::dead_letter::DeadLetterConfig;
use crate::envelope::{EnvelopeSerializer, JsonEnvelopeSerializer, NodeId};
use crate::error::TransportError;
use crate::listener::{Listener, Receiver};
use crate::sender::Sender;
use crate::uri::EndpointUri;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Delivery guarantee of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointMode {
    /// Claimed envelopes are recorded in the local inbox until completed
    Durable,
    /// Claimed envelopes are held in memory only
    BufferedInMemory,
    /// Envelopes are handled on the receiving task
    Inline,
}

/// Whether an endpoint carries application or runtime-internal traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointRole {
    Application,
    System,
}

/// Process-wide services handed to endpoints when they build listeners and senders
#[derive(Clone)]
pub struct RuntimeContext {
    pub node_id: NodeId,
    pub settings: Arc<TransportSettings>,
    pub serializer: Arc<dyn EnvelopeSerializer>,
    /// Root token; every background loop runs under a child of it
    pub cancellation: CancellationToken,
}

impl RuntimeContext {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            node_id: settings.resolve_node_id(),
            settings: Arc::new(settings),
            serializer: Arc::new(JsonEnvelopeSerializer),
            cancellation: CancellationToken::new(),
        }
    }

    /// Replace the envelope serializer
    pub fn with_serializer(mut self, serializer: Arc<dyn EnvelopeSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Cancel every loop started under this runtime
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }
}

/// An addressable source and destination of envelopes
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &EndpointUri;

    fn endpoint_name(&self) -> &str;

    fn mode(&self) -> EndpointMode;

    fn role(&self) -> EndpointRole;

    fn supports_mode(&self, mode: EndpointMode) -> bool;

    /// Build and start a listener delivering to `receiver`
    async fn build_listener(
        &self,
        runtime: &RuntimeContext,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Listener>, TransportError>;

    /// Sender for this endpoint, created once and cached
    fn create_sender(&self, runtime: &RuntimeContext) -> Result<Arc<dyn Sender>, TransportError>;

    fn dead_letter(&self) -> &DeadLetterConfig;
}

/// Caches endpoints of one transport by URI
pub struct EndpointRegistry<E> {
    endpoints: RwLock<HashMap<EndpointUri, Arc<E>>>,
}

impl<E> EndpointRegistry<E> {
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached endpoint for `uri`, creating it on first use
    pub fn find_or_create<F>(&self, uri: &EndpointUri, create: F) -> Result<Arc<E>, TransportError>
    where
        F: FnOnce() -> Result<E, TransportError>,
    {
        if let Some(existing) = self.get(uri) {
            return Ok(existing);
        }

        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = endpoints.get(uri) {
            return Ok(existing.clone());
        }

        let endpoint = Arc::new(create()?);
        endpoints.insert(uri.clone(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn get(&self, uri: &EndpointUri) -> Option<Arc<E>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(uri)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<E>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl<E> Default for EndpointRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
