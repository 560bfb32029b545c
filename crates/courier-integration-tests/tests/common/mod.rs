//! Common test utilities for courier-runtime integration tests
//!
//! This module provides:
//! - Fast transport settings for time-driven loops
//! - A receiver that records and completes everything it is handed
//! - Polling helpers for asynchronous assertions

use async_trait::async_trait;
use bytes::Bytes;
use courier_runtime::database::{DatabaseTransport, InMemoryQueueStore, QueueStores};
use courier_runtime::{
    Acknowledger, DurabilitySettings, Envelope, EnvelopeId, Receiver, RuntimeContext,
    TransportError, TransportSettings,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Settings with short polling intervals and no mover jitter
#[allow(dead_code)]
pub fn fast_settings() -> TransportSettings {
    TransportSettings {
        node_id: Some(1),
        durability: DurabilitySettings {
            scheduled_polling_interval_ms: 50,
            scheduled_first_execution_max_jitter_ms: 0,
            idle_poll_delay_ms: 10,
            tenant_check_period_ms: 50,
            ..DurabilitySettings::default()
        },
        ..TransportSettings::default()
    }
}

/// Transport over a single in-memory store plus a matching runtime
#[allow(dead_code)]
pub fn single_store(store: &InMemoryQueueStore) -> (DatabaseTransport, RuntimeContext) {
    let transport = DatabaseTransport::new(
        QueueStores::Single(Arc::new(store.clone())),
        Arc::new(fast_settings()),
    );
    (transport, RuntimeContext::new(fast_settings()))
}

#[allow(dead_code)]
pub fn envelope(message_type: &str) -> Envelope {
    Envelope::new(message_type.to_string(), Bytes::from_static(b"{\"amount\":42}"))
}

// ============================================================================
// Collecting Receiver
// ============================================================================

/// Records every envelope and completes it
#[derive(Default)]
#[allow(dead_code)]
pub struct CollectingReceiver {
    received: Mutex<Vec<Envelope>>,
}

#[allow(dead_code)]
impl CollectingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<EnvelopeId> {
        self.received().iter().map(|envelope| envelope.id).collect()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl Receiver for CollectingReceiver {
    async fn receive(
        &self,
        acknowledger: Arc<dyn Acknowledger>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), TransportError> {
        for envelope in envelopes {
            acknowledger.complete(&envelope).await?;
            self.received.lock().unwrap().push(envelope);
        }
        Ok(())
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` every 10ms until it holds or `timeout` passes
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    eventually(timeout, || {
        let holds = condition();
        async move { holds }
    })
    .await
}

/// Async variant of [`wait_until`]
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
