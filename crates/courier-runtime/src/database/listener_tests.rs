//! Tests for the database listener loops and acknowledger.

use super::*;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use crate::config::TransportSettings;
use crate::database::memory::InMemoryQueueStore;
use crate::database::sender::DatabaseSender;
use crate::dead_letter::{DeadLetterStore, StorageDeadLetter};
use crate::envelope::{EnvelopeId, EnvelopeSerializer, JsonEnvelopeSerializer, NodeId};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex as StdMutex;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Settle {
    Complete,
    DeferOnce,
    DeadLetter,
    ScheduleOnce,
}

struct RecordingReceiver {
    settle: Settle,
    received: StdMutex<Vec<Envelope>>,
    retried: StdMutex<HashSet<EnvelopeId>>,
}

impl RecordingReceiver {
    fn new(settle: Settle) -> Arc<Self> {
        Arc::new(Self {
            settle,
            received: StdMutex::new(Vec::new()),
            retried: StdMutex::new(HashSet::new()),
        })
    }

    fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    fn first_attempt(&self, id: EnvelopeId) -> bool {
        self.retried.lock().unwrap().insert(id)
    }
}

#[async_trait]
impl Receiver for RecordingReceiver {
    async fn receive(
        &self,
        acknowledger: Arc<dyn Acknowledger>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), TransportError> {
        self.received.lock().unwrap().extend(envelopes.iter().cloned());

        for envelope in envelopes {
            match self.settle {
                Settle::Complete => acknowledger.complete(&envelope).await?,
                Settle::DeferOnce if self.first_attempt(envelope.id) => {
                    acknowledger.defer(envelope).await?
                }
                Settle::ScheduleOnce if self.first_attempt(envelope.id) => {
                    let at = Utc::now() + chrono::Duration::milliseconds(200);
                    acknowledger.move_to_scheduled(envelope, at).await?
                }
                Settle::DeferOnce | Settle::ScheduleOnce => acknowledger.complete(&envelope).await?,
                Settle::DeadLetter => {
                    let failure = DeliveryFailure::new("HandlerFailed", "boom");
                    acknowledger.move_to_dead_letter(&envelope, &failure).await?
                }
            }
        }
        Ok(())
    }
}

fn settings() -> TransportSettings {
    let mut settings = TransportSettings::default();
    settings.node_id = Some(7);
    settings.durability.scheduled_first_execution_max_jitter_ms = 0;
    settings.durability.scheduled_polling_interval_ms = 100;
    settings
}

struct Fixture {
    store: InMemoryQueueStore,
    table: QueueTable,
    sender: Arc<DatabaseSender>,
}

async fn fixture() -> Fixture {
    let store = InMemoryQueueStore::new("main");
    let table = QueueTable::for_queue("orders");
    store.ensure_schema(&table).await.unwrap();

    let sender = Arc::new(DatabaseSender::new(
        EndpointUri::parse("postgresql://orders").unwrap(),
        table.clone(),
        Arc::new(store.clone()),
        Arc::new(JsonEnvelopeSerializer),
        EndpointMode::Durable,
    ));

    Fixture {
        store,
        table,
        sender,
    }
}

fn binding(fixture: &Fixture, mode: EndpointMode, tenant_id: Option<TenantId>) -> ListenerBinding {
    ListenerBinding {
        address: EndpointUri::parse("postgresql://orders").unwrap(),
        table: fixture.table.clone(),
        store: Arc::new(fixture.store.clone()),
        mode,
        tenant_id,
        sender: fixture.sender.clone(),
        dead_letter: Arc::new(StorageDeadLetter::new(
            Arc::new(fixture.store.clone()),
            "orders",
            Arc::new(JsonEnvelopeSerializer),
        )),
    }
}

fn listener(
    fixture: &Fixture,
    settings: TransportSettings,
    mode: EndpointMode,
    tenant_id: Option<TenantId>,
    receiver: Arc<dyn Receiver>,
) -> DatabaseListener {
    DatabaseListener::new(
        binding(fixture, mode, tenant_id),
        receiver,
        RuntimeContext::new(settings),
    )
}

/// Completes each batch only after a pause
struct SlowReceiver {
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl SlowReceiver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Receiver for SlowReceiver {
    async fn receive(
        &self,
        acknowledger: Arc<dyn Acknowledger>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), TransportError> {
        self.started.fetch_add(envelopes.len(), Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        for envelope in envelopes {
            acknowledger.complete(&envelope).await?;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Rejects every batch until marked healthy
struct FlakyReceiver {
    healthy: AtomicBool,
    recorder: Arc<RecordingReceiver>,
}

#[async_trait]
impl Receiver for FlakyReceiver {
    async fn receive(
        &self,
        acknowledger: Arc<dyn Acknowledger>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), TransportError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed {
                message: "handler unavailable".to_string(),
            });
        }
        self.recorder.receive(acknowledger, envelopes).await
    }
}

// ============================================================================
// Receive Loop Tests
// ============================================================================

mod receive_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_receives_in_insertion_order_and_completes() {
        let fixture = fixture().await;
        let ids: Vec<_> = (0..3).map(envelope).collect();
        for envelope in &ids {
            fixture.sender.send(envelope.clone()).await.unwrap();
        }

        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 3).await;
        listener.stop().await;

        let received: Vec<_> = receiver.received().iter().map(|e| e.id).collect();
        let expected: Vec<_> = ids.iter().map(|e| e.id).collect();
        assert_eq!(received, expected);
        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 0);
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_body_becomes_ping_with_same_id() {
        let fixture = fixture().await;
        let id = EnvelopeId::new();
        fixture
            .store
            .send_ready(
                &fixture.table,
                QueueRecord {
                    id,
                    body: b"not json".to_vec(),
                    message_type: "OrderPlaced".to_string(),
                    keep_until: None,
                },
            )
            .await
            .unwrap();

        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 1).await;
        listener.stop().await;

        let received = receiver.received();
        assert_eq!(received[0].id, id);
        assert!(received[0].is_ping());
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_tenant_is_stamped_on_untenanted_envelopes() {
        let fixture = fixture().await;
        fixture.sender.send(envelope(1)).await.unwrap();
        fixture
            .sender
            .send(envelope(2).with_tenant_id(TenantId::new("tenant-b")))
            .await
            .unwrap();

        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(
            &fixture,
            settings(),
            EndpointMode::Durable,
            Some(TenantId::new("tenant-a")),
            receiver.clone(),
        );
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 2).await;
        listener.stop().await;

        let tenants: Vec<_> = receiver
            .received()
            .iter()
            .map(|e| e.tenant_id.clone().unwrap())
            .collect();
        assert_eq!(tenants, vec![TenantId::new("tenant-a"), TenantId::new("tenant-b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_claim_records_inbox_until_settled() {
        let fixture = fixture().await;
        let sent = envelope(1);
        fixture.sender.send(sent.clone()).await.unwrap();

        let table = fixture.table.clone();
        let claimed = fixture
            .store
            .claim_durable(&table, 10, NodeId::new(7), "postgresql://orders")
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let incoming = fixture.store.incoming(sent.id).unwrap();
        assert_eq!(incoming.owner_id, NodeId::new(7));
        assert_eq!(incoming.received_at, "postgresql://orders");
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_mode_keeps_no_inbox() {
        let fixture = fixture().await;
        fixture.sender.send(envelope(1)).await.unwrap();

        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(
            &fixture,
            settings(),
            EndpointMode::BufferedInMemory,
            None,
            receiver.clone(),
        );
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 1).await;
        listener.stop().await;

        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 0);
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_recovers_after_transient_failures() {
        let fixture = fixture().await;
        fixture.sender.send(envelope(1)).await.unwrap();
        fixture.store.inject_failures(4);

        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 1).await;
        listener.stop().await;
        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_pauses_receiving_then_resumes() {
        let fixture = fixture().await;
        let mut settings = settings();
        settings.durability.maximum_messages_to_receive = 1;
        settings.circuit_breaker = Some(CircuitBreakerConfig {
            failure_percentage_threshold: 50,
            minimum_throughput: 2,
            tracking_period_ms: 60_000,
            pause_time_ms: 10_000,
        });
        fixture.sender.send(envelope(1)).await.unwrap();
        fixture.sender.send(envelope(2)).await.unwrap();

        let recorder = RecordingReceiver::new(Settle::Complete);
        let receiver = Arc::new(FlakyReceiver {
            healthy: AtomicBool::new(false),
            recorder: recorder.clone(),
        });
        let listener = listener(&fixture, settings, EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        let breaker = listener.circuit_breaker().unwrap();
        wait_until(|| breaker.metrics().trip_count > 0).await;

        // Nothing is claimed while the breaker is open
        receiver.healthy.store(true, Ordering::SeqCst);
        let pending = envelope(3);
        fixture.sender.send(pending.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(recorder.received().is_empty());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 1);

        // Receiving resumes once the pause elapses, with a fresh window
        tokio::time::sleep(Duration::from_secs(2)).await;
        let received: Vec<_> = recorder.received().iter().map(|e| e.id).collect();
        assert_eq!(received, vec![pending.id]);

        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failures_in_window, 0);
        assert_eq!(metrics.trip_count, 1);
        listener.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_batch_being_handled() {
        for mode in [EndpointMode::BufferedInMemory, EndpointMode::Durable] {
            let fixture = fixture().await;
            fixture.sender.send(envelope(1)).await.unwrap();

            let receiver = SlowReceiver::new();
            let listener = listener(&fixture, settings(), mode, None, receiver.clone());
            listener.start().await.unwrap();

            wait_until(|| receiver.started.load(Ordering::SeqCst) == 1).await;
            listener.stop().await;

            assert_eq!(receiver.finished.load(Ordering::SeqCst), 1, "{mode:?}");
            assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 0);
            assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
        }
    }
}

// ============================================================================
// Acknowledger Tests
// ============================================================================

mod acknowledger_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_defer_requeues_and_releases_inbox_row() {
        let fixture = fixture().await;
        let sent = envelope(1);
        fixture.sender.send(sent.clone()).await.unwrap();

        let receiver = RecordingReceiver::new(Settle::DeferOnce);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 2).await;
        listener.stop().await;

        assert!(receiver.received().iter().all(|e| e.id == sent.id));
        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 0);
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_envelope_claimed_elsewhere_keeps_new_inbox_row() {
        let fixture = fixture().await;
        let sent = envelope(1);
        fixture.sender.send(sent.clone()).await.unwrap();

        // Node 7 holds the envelope; the listener is never started
        let claimed = fixture
            .store
            .claim_durable(&fixture.table, 10, NodeId::new(7), "postgresql://orders")
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let listener = DatabaseListener::new(
            binding(&fixture, EndpointMode::Durable, None),
            RecordingReceiver::new(Settle::Complete),
            RuntimeContext::new(settings()),
        );

        listener.defer(sent.clone()).await.unwrap();
        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 1);
        assert!(fixture.store.incoming(sent.id).is_none());

        // Another node claims the requeued row straight away
        let reclaimed = fixture
            .store
            .claim_durable(&fixture.table, 10, NodeId::new(8), "postgresql://orders")
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        let incoming = fixture.store.incoming(sent.id).unwrap();
        assert_eq!(incoming.owner_id, NodeId::new(8));
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_move_to_scheduled_releases_inbox_row() {
        let fixture = fixture().await;
        let sent = envelope(1);
        fixture.sender.send(sent.clone()).await.unwrap();
        fixture
            .store
            .claim_durable(&fixture.table, 10, NodeId::new(7), "postgresql://orders")
            .await
            .unwrap();

        let listener = DatabaseListener::new(
            binding(&fixture, EndpointMode::Durable, None),
            RecordingReceiver::new(Settle::Complete),
            RuntimeContext::new(settings()),
        );
        listener
            .move_to_scheduled(sent.clone(), Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(fixture.store.scheduled_count(&fixture.table).await.unwrap(), 1);
        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 0);
        assert!(fixture.store.incoming(sent.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_defer_resends_to_ready() {
        let fixture = fixture().await;
        let listener = DatabaseListener::new(
            binding(&fixture, EndpointMode::BufferedInMemory, None),
            RecordingReceiver::new(Settle::Complete),
            RuntimeContext::new(settings()),
        );

        listener.defer(envelope(1)).await.unwrap();

        assert_eq!(fixture.store.count(&fixture.table).await.unwrap(), 1);
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }

    // Scheduled rows are compared against the wall clock, so this one runs in real time
    #[tokio::test]
    async fn test_move_to_scheduled_redelivers_after_mover_pass() {
        let fixture = fixture().await;
        fixture.sender.send(envelope(1)).await.unwrap();

        let receiver = RecordingReceiver::new(Settle::ScheduleOnce);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 2).await;
        listener.stop().await;

        let received = receiver.received();
        assert!(received[1].scheduled_time.is_some());
        assert_eq!(fixture.store.scheduled_count(&fixture.table).await.unwrap(), 0);
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_to_dead_letter_stores_record_and_releases() {
        let fixture = fixture().await;
        let sent = envelope(1);
        fixture.sender.send(sent.clone()).await.unwrap();

        let receiver = RecordingReceiver::new(Settle::DeadLetter);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        wait_until(|| receiver.received().len() == 1).await;
        listener.stop().await;

        let dead_letters = fixture.store.dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].id, sent.id);
        assert_eq!(dead_letters[0].queue_name, "orders");
        assert_eq!(dead_letters[0].exception_type, "HandlerFailed");
        assert_eq!(fixture.store.incoming_count().await.unwrap(), 0);
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_joins() {
        let fixture = fixture().await;
        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver);

        assert!(!listener.is_running());
        listener.start().await.unwrap();
        listener.start().await.unwrap();
        assert!(listener.is_running());

        listener.stop().await;
        assert!(!listener.is_running());

        // Stopping twice is harmless
        listener.dispose().await;
        assert!(!listener.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_shutdown_stops_loops() {
        let fixture = fixture().await;
        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver.clone());
        listener.start().await.unwrap();

        listener.core.runtime.shutdown();
        listener.stop().await;

        fixture.sender.send(envelope(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(receiver.received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mover_deletes_expired_rows() {
        let fixture = fixture().await;
        let expired = envelope(1).with_deliver_by(Utc::now() - chrono::Duration::seconds(1));
        fixture
            .store
            .send_scheduled(
                &fixture.table,
                QueueRecord {
                    id: expired.id,
                    body: JsonEnvelopeSerializer.serialize(&expired).unwrap(),
                    message_type: expired.message_type.clone(),
                    keep_until: expired.deliver_by,
                },
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        let receiver = RecordingReceiver::new(Settle::Complete);
        let listener = listener(&fixture, settings(), EndpointMode::Durable, None, receiver);
        listener.start().await.unwrap();

        let store = fixture.store.clone();
        let table = fixture.table.clone();
        for _ in 0..40 {
            if store.scheduled_count(&table).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        listener.stop().await;
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 0);
    }
}
