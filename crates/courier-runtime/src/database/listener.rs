//! Database queue listener and scheduled-message mover.
//!
//! A started listener runs two background tasks under a child of the runtime token:
//!
//! - the receive loop claims batches of ready rows and hands them to the [`Receiver`];
//! - the mover promotes due scheduled rows and deletes expired ones.
//!
//! Both loops keep their own failure-count backoff. Cancellation ends them without logging
//! failures.

use super::sender::DatabaseSender;
use super::store::{QueueRecord, QueueStore, QueueTable};
use crate::backoff::{sleep_or_cancel, FailureBackoff};
use crate::circuit_breaker::ListenerCircuitBreaker;
use crate::dead_letter::DeadLetterStrategy;
use crate::endpoint::{EndpointMode, RuntimeContext};
use crate::envelope::{Envelope, TenantId};
use crate::error::TransportError;
use crate::listener::{Acknowledger, DeliveryFailure, Listener, Receiver};
use crate::sender::Sender;
use crate::uri::EndpointUri;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Everything a listener needs to know about the queue it drains
#[derive(Clone)]
pub struct ListenerBinding {
    pub address: EndpointUri,
    pub table: QueueTable,
    pub store: Arc<dyn QueueStore>,
    pub mode: EndpointMode,
    /// Stamped on received envelopes that carry no tenant
    pub tenant_id: Option<TenantId>,
    /// Re-sends deferred and rescheduled envelopes
    pub sender: Arc<DatabaseSender>,
    pub dead_letter: Arc<dyn DeadLetterStrategy>,
}

// ============================================================================
// Listener Core
// ============================================================================

struct ListenerCore {
    binding: ListenerBinding,
    receiver: Arc<dyn Receiver>,
    runtime: RuntimeContext,
    circuit_breaker: Option<ListenerCircuitBreaker>,
}

impl ListenerCore {
    fn decode(&self, record: QueueRecord) -> Envelope {
        let mut envelope = match self.runtime.serializer.deserialize(&record.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    envelope_id = %record.id,
                    message_type = %record.message_type,
                    error = %e,
                    "Failed to deserialize envelope, substituting a ping"
                );
                Envelope::ping_for(record.id, Some(self.binding.address.clone()))
            }
        };

        if envelope.tenant_id.is_none() {
            envelope.tenant_id = self.binding.tenant_id.clone();
        }
        envelope
    }

    /// Claim up to one batch of ready rows
    async fn claim(&self) -> Result<Vec<Envelope>, TransportError> {
        let table = &self.binding.table;
        let max = self.runtime.settings.durability.maximum_messages_to_receive;

        let records = match self.binding.mode {
            EndpointMode::Durable => {
                self.binding
                    .store
                    .claim_durable(
                        table,
                        max,
                        self.runtime.node_id,
                        self.binding.address.as_str(),
                    )
                    .await?
            }
            EndpointMode::BufferedInMemory | EndpointMode::Inline => {
                self.binding.store.claim_buffered(table, max).await?
            }
        };

        Ok(records.into_iter().map(|r| self.decode(r)).collect())
    }

    /// Hand a claimed batch to the receiver; returns the batch size
    async fn deliver(self: &Arc<Self>, envelopes: Vec<Envelope>) -> Result<usize, TransportError> {
        if envelopes.is_empty() {
            return Ok(0);
        }

        let count = envelopes.len();
        debug!(queue = %self.binding.table.queue_name, count, "Received batch");

        let acknowledger: Arc<dyn Acknowledger> = self.clone();
        self.receiver.receive(acknowledger, envelopes).await?;
        Ok(count)
    }

    /// One mover pass over the queue tables
    async fn move_scheduled(&self, now: DateTime<Utc>) -> Result<(), TransportError> {
        let store = &self.binding.store;
        let table = &self.binding.table;

        let promoted = store.move_due_scheduled(table, now).await?;
        let expired = store.delete_expired(table, now).await?;
        let expired_dead_letters = store.delete_expired_dead_letters(now).await?;

        if promoted > 0 || expired > 0 || expired_dead_letters > 0 {
            debug!(
                queue = %table.queue_name,
                promoted,
                expired,
                expired_dead_letters,
                "Mover pass finished"
            );
        }
        Ok(())
    }

    /// Drop the inbox row of a settled envelope
    async fn release(&self, envelope: &Envelope) -> Result<(), TransportError> {
        match self.binding.mode {
            EndpointMode::Durable => self.binding.store.complete_incoming(envelope.id).await,
            EndpointMode::BufferedInMemory | EndpointMode::Inline => Ok(()),
        }
    }

    /// Put a received envelope back on its queue through the sender.
    ///
    /// Durable listeners hand over the inbox row in the same store operation.
    async fn requeue(&self, envelope: Envelope) -> Result<(), TransportError> {
        match self.binding.mode {
            EndpointMode::Durable => self.binding.sender.resend_incoming(envelope).await,
            EndpointMode::BufferedInMemory | EndpointMode::Inline => {
                self.binding.sender.send(envelope).await
            }
        }
    }
}

#[async_trait]
impl Acknowledger for ListenerCore {
    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.release(envelope).await
    }

    async fn defer(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.requeue(envelope).await
    }

    async fn move_to_scheduled(
        &self,
        mut envelope: Envelope,
        time: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        envelope.scheduled_time = Some(time);
        self.requeue(envelope).await
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        self.binding
            .dead_letter
            .dead_letter(envelope, failure)
            .await?;
        self.release(envelope).await
    }
}

// ============================================================================
// Background Loops
// ============================================================================

async fn receive_loop(core: Arc<ListenerCore>, token: CancellationToken) {
    let durability = &core.runtime.settings.durability;
    let idle_delay = durability.idle_poll_delay();
    let mut backoff = FailureBackoff::new(durability.backoff.clone());

    loop {
        if let Some(breaker) = &core.circuit_breaker {
            if !breaker.wait_while_paused(&token).await {
                break;
            }
        }

        // A claimed batch always runs to completion; stopping only takes effect between batches
        if token.is_cancelled() {
            break;
        }
        let result = match core.claim().await {
            Ok(envelopes) => core.deliver(envelopes).await,
            Err(e) => Err(e),
        };

        let delay = match result {
            Ok(count) => {
                backoff.record_success();
                if let Some(breaker) = &core.circuit_breaker {
                    breaker.record(true);
                }
                if count == 0 {
                    idle_delay
                } else {
                    Duration::ZERO
                }
            }
            Err(e) => {
                if token.is_cancelled() {
                    break;
                }
                warn!(
                    queue = %core.binding.table.queue_name,
                    error = %e,
                    failures = backoff.failures() + 1,
                    "Receive failed"
                );
                if let Some(breaker) = &core.circuit_breaker {
                    if let Some(pause) = breaker.record(false) {
                        warn!(
                            queue = %core.binding.table.queue_name,
                            pause_ms = pause.as_millis() as u64,
                            "Circuit breaker opened, pausing receives"
                        );
                    }
                }
                backoff.record_failure()
            }
        };

        if delay.is_zero() {
            // Store futures may complete without ever suspending
            tokio::task::yield_now().await;
        } else if !sleep_or_cancel(&token, delay).await {
            break;
        }
    }

    debug!(queue = %core.binding.table.queue_name, "Receive loop stopped");
}

async fn mover_loop(core: Arc<ListenerCore>, token: CancellationToken) {
    let durability = &core.runtime.settings.durability;
    let polling_interval = durability.scheduled_polling_interval();
    let max_jitter_ms = durability.scheduled_first_execution_max_jitter_ms;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms));

    if !sleep_or_cancel(&token, jitter).await {
        return;
    }

    let mut backoff = FailureBackoff::new(durability.backoff.clone());
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = core.move_scheduled(Utc::now()) => result,
        };

        let delay = match result {
            Ok(()) => {
                backoff.record_success();
                polling_interval
            }
            Err(e) => {
                warn!(
                    queue = %core.binding.table.queue_name,
                    error = %e,
                    "Scheduled message mover failed"
                );
                backoff.record_failure()
            }
        };

        if !sleep_or_cancel(&token, delay).await {
            break;
        }
    }

    debug!(queue = %core.binding.table.queue_name, "Scheduled message mover stopped");
}

// ============================================================================
// Database Listener
// ============================================================================

struct RunningLoops {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Listener over one queue in one physical store
pub struct DatabaseListener {
    core: Arc<ListenerCore>,
    loops: Mutex<Option<RunningLoops>>,
    running: AtomicBool,
}

impl DatabaseListener {
    pub fn new(binding: ListenerBinding, receiver: Arc<dyn Receiver>, runtime: RuntimeContext) -> Self {
        let circuit_breaker = runtime
            .settings
            .circuit_breaker
            .clone()
            .map(|config| ListenerCircuitBreaker::new(binding.address.to_string(), config));

        Self {
            core: Arc::new(ListenerCore {
                binding,
                receiver,
                runtime,
                circuit_breaker,
            }),
            loops: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn store_identifier(&self) -> &str {
        self.core.binding.store.identifier()
    }

    pub fn circuit_breaker(&self) -> Option<&ListenerCircuitBreaker> {
        self.core.circuit_breaker.as_ref()
    }
}

#[async_trait]
impl Acknowledger for DatabaseListener {
    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.core.complete(envelope).await
    }

    async fn defer(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.core.defer(envelope).await
    }

    async fn move_to_scheduled(
        &self,
        envelope: Envelope,
        time: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        self.core.move_to_scheduled(envelope, time).await
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        self.core.move_to_dead_letter(envelope, failure).await
    }
}

#[async_trait]
impl Listener for DatabaseListener {
    fn address(&self) -> &EndpointUri {
        &self.core.binding.address
    }

    #[instrument(skip(self), fields(queue = %self.core.binding.table.queue_name, data_source = %self.store_identifier()))]
    async fn start(&self) -> Result<(), TransportError> {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return Ok(());
        }

        let token = self.core.runtime.cancellation.child_token();
        let handles = vec![
            tokio::spawn(receive_loop(self.core.clone(), token.clone())),
            tokio::spawn(mover_loop(self.core.clone(), token.clone())),
        ];
        *loops = Some(RunningLoops { token, handles });
        self.running.store(true, Ordering::SeqCst);

        info!(mode = ?self.core.binding.mode, "Database listener started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.loops.lock().await.take() else {
            return;
        };

        running.token.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.core.binding.table.queue_name, "Database listener stopped");
    }

    async fn dispose(&self) {
        self.stop().await;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
