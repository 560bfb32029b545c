//! Tests for dead-letter strategies.

use super::*;
use crate::dead_letter::DEFAULT_DEAD_LETTER_QUEUE;
use crate::envelope::{EnvelopeId, JsonEnvelopeSerializer};
use crate::uri::EndpointUri;
use bytes::Bytes;
use chrono::DateTime;
use std::sync::Mutex;

// ============================================================================
// Mocks
// ============================================================================

struct RecordingSender {
    destination: EndpointUri,
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSender {
    fn new(uri: &str) -> Self {
        Self {
            destination: EndpointUri::parse(uri).unwrap(),
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Sender for RecordingSender {
    fn destination(&self) -> &EndpointUri {
        &self.destination
    }

    fn supports_native_scheduled_send(&self) -> bool {
        false
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn ping(&self) -> Result<bool, TransportError> {
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingDeadLetterStore {
    records: Mutex<Vec<DeadLetterRecord>>,
}

#[async_trait]
impl DeadLetterStore for RecordingDeadLetterStore {
    async fn store_dead_letter(&self, record: DeadLetterRecord) -> Result<(), TransportError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn dead_letter_count(&self) -> Result<u64, TransportError> {
        Ok(self.records.lock().unwrap().len() as u64)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, TransportError> {
        Ok(self.records.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn mark_replayable(&self, _ids: &[EnvelopeId]) -> Result<u64, TransportError> {
        unimplemented!("Replay not needed for strategy tests")
    }

    async fn replay_dead_letters(
        &self,
        _serializer: &dyn EnvelopeSerializer,
    ) -> Result<u64, TransportError> {
        unimplemented!("Replay not needed for strategy tests")
    }

    async fn delete_dead_letters(&self, _ids: &[EnvelopeId]) -> Result<u64, TransportError> {
        unimplemented!("Deletion not needed for strategy tests")
    }

    async fn delete_expired_dead_letters(
        &self,
        _now: DateTime<Utc>,
    ) -> Result<u64, TransportError> {
        unimplemented!("Expiry not needed for strategy tests")
    }
}

struct RecordingBroker {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl NativeDeadLettering for RecordingBroker {
    async fn dead_letter_natively(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", envelope.id, failure.exception_type));
        Ok(())
    }
}

fn failed_envelope() -> Envelope {
    Envelope::new("order-placed", Bytes::from("{}"))
        .with_scheduled_time(Utc::now() + chrono::Duration::minutes(5))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_interop_publishes_copy_with_failure_headers() {
    let sender = Arc::new(RecordingSender::new("postgresql://courier-dead-letter-queue"));
    let config = DeadLetterConfig::new(DEFAULT_DEAD_LETTER_QUEUE)
        .with_mode(DeadLetterMode::InteropFriendly)
        .with_configure(|envelope| envelope.group_id = Some("failed".to_string()));
    let strategy = InteropDeadLetter::new(sender.clone(), config);

    let envelope = failed_envelope();
    let failure = DeliveryFailure::new("InvalidOrder", "order total is negative");
    strategy.dead_letter(&envelope, &failure).await.unwrap();

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let copy = &sent[0];
    assert_eq!(copy.id, envelope.id);
    assert_eq!(copy.scheduled_time, None);
    assert_eq!(copy.group_id.as_deref(), Some("failed"));
    assert_eq!(
        copy.headers.get(EXCEPTION_MESSAGE_HEADER).map(String::as_str),
        Some("order total is negative")
    );
    assert_eq!(
        copy.headers.get(EXCEPTION_TYPE_HEADER).map(String::as_str),
        Some("InvalidOrder")
    );
    assert_eq!(strategy.mode(), DeadLetterMode::InteropFriendly);
}

#[tokio::test]
async fn test_storage_writes_record() {
    let store = Arc::new(RecordingDeadLetterStore::default());
    let strategy = StorageDeadLetter::new(store.clone(), "orders", Arc::new(JsonEnvelopeSerializer))
        .with_expiration(Some(chrono::Duration::days(7)));

    let envelope = failed_envelope();
    let failure = DeliveryFailure::new("InvalidOrder", "order total is negative");
    strategy.dead_letter(&envelope, &failure).await.unwrap();

    let records = store.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, envelope.id);
    assert_eq!(record.queue_name, "orders");
    assert_eq!(record.exception_type, "InvalidOrder");
    assert!(!record.replayable);
    assert!(record.expires.unwrap() > record.sent_at);

    let decoded = JsonEnvelopeSerializer.deserialize(&record.body).unwrap();
    assert_eq!(decoded.id, envelope.id);
}

#[tokio::test]
async fn test_native_delegates_to_broker() {
    let broker = Arc::new(RecordingBroker {
        calls: Mutex::new(Vec::new()),
    });
    let strategy = NativeDeadLetter::new(broker.clone());

    let envelope = failed_envelope();
    strategy
        .dead_letter(&envelope, &DeliveryFailure::new("Boom", "boom"))
        .await
        .unwrap();

    assert_eq!(
        broker.calls.lock().unwrap().as_slice(),
        &[format!("{}:Boom", envelope.id)]
    );
}
