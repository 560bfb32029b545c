//! Tests for the in-memory queue store.

use super::*;
use crate::envelope::{Envelope, JsonEnvelopeSerializer};
use bytes::Bytes;
use chrono::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn record(message_type: &str) -> QueueRecord {
    QueueRecord {
        id: EnvelopeId::new(),
        body: b"{}".to_vec(),
        message_type: message_type.to_string(),
        keep_until: None,
    }
}

async fn store_with_queue(name: &str) -> (InMemoryQueueStore, QueueTable) {
    let store = InMemoryQueueStore::new("main");
    let table = QueueTable::for_queue(name);
    store.ensure_schema(&table).await.unwrap();
    (store, table)
}

// ============================================================================
// Schema Tests
// ============================================================================

mod schema_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_table_reports_schema_missing() {
        let store = InMemoryQueueStore::new("main");
        let table = QueueTable::for_queue("orders");

        let err = store.send_ready(&table, record("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::SchemaMissing { .. }));
        assert!(!store.check_schema(&table).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let (store, table) = store_with_queue("orders").await;
        store.send_ready(&table, record("a")).await.unwrap();

        store.ensure_schema(&table).await.unwrap();
        assert_eq!(store.count(&table).await.unwrap(), 1);
        assert!(store.check_schema(&table).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let (store, table) = store_with_queue("orders").await;
        store.send_ready(&table, record("a")).await.unwrap();
        store
            .send_scheduled(&table, record("b"), Utc::now() + Duration::minutes(1))
            .await
            .unwrap();

        store.purge(&table).await.unwrap();
        store.purge(&table).await.unwrap();
        assert_eq!(store.count(&table).await.unwrap(), 0);
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 0);

        // Purging a queue that was never created is not an error
        store.purge(&QueueTable::for_queue("other")).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_schema_removes_tables() {
        let (store, table) = store_with_queue("orders").await;
        store.drop_schema(&table).await.unwrap();
        store.drop_schema(&table).await.unwrap();
        assert!(store.count(&table).await.is_err());
    }
}

// ============================================================================
// Claim Tests
// ============================================================================

mod claim_tests {
    use super::*;

    #[tokio::test]
    async fn test_claims_are_fifo() {
        let (store, table) = store_with_queue("orders").await;
        let records: Vec<QueueRecord> = (0..5).map(|_| record("a")).collect();
        for r in &records {
            store.send_ready(&table, r.clone()).await.unwrap();
        }

        let first = store.claim_buffered(&table, 2).await.unwrap();
        let rest = store.claim_buffered(&table, 10).await.unwrap();

        let claimed: Vec<EnvelopeId> = first.iter().chain(rest.iter()).map(|r| r.id).collect();
        let expected: Vec<EnvelopeId> = records.iter().map(|r| r.id).collect();
        assert_eq!(claimed, expected);
        assert_eq!(store.count(&table).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_durable_claim_moves_rows_into_inbox() {
        let (store, table) = store_with_queue("orders").await;
        let r = record("order-placed");
        store.send_ready(&table, r.clone()).await.unwrap();

        let claimed = store
            .claim_durable(&table, 10, NodeId::new(3), "postgresql://orders")
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(store.count(&table).await.unwrap(), 0);

        let incoming = store.incoming(r.id).unwrap();
        assert_eq!(incoming.status, STATUS_INCOMING);
        assert_eq!(incoming.owner_id, NodeId::new(3));
        assert_eq!(incoming.received_at, "postgresql://orders");

        store.complete_incoming(r.id).await.unwrap();
        assert_eq!(store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let (store, table) = store_with_queue("orders").await;
        for _ in 0..100 {
            store.send_ready(&table, record("a")).await.unwrap();
        }

        let mut tasks = Vec::new();
        for node in 0..4 {
            let store = store.clone();
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let batch = store
                        .claim_durable(&table, 7, NodeId::new(node), "postgresql://orders")
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    ids.extend(batch.into_iter().map(|r| r.id));
                    tokio::task::yield_now().await;
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 100);
        assert_eq!(unique.len(), 100);
    }

    #[tokio::test]
    async fn test_requeue_swaps_inbox_row_for_ready_row() {
        let (store, table) = store_with_queue("orders").await;
        let r = record("order-placed");
        store.send_ready(&table, r.clone()).await.unwrap();
        store
            .claim_durable(&table, 10, NodeId::new(3), "postgresql://orders")
            .await
            .unwrap();

        store.requeue_incoming(&table, r.clone(), None).await.unwrap();
        assert_eq!(store.count(&table).await.unwrap(), 1);
        assert!(store.incoming(r.id).is_none());

        // A second node picks it up and owns the only inbox row
        store
            .claim_durable(&table, 10, NodeId::new(4), "postgresql://orders")
            .await
            .unwrap();
        assert_eq!(store.incoming(r.id).unwrap().owner_id, NodeId::new(4));
        assert_eq!(store.incoming_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requeue_into_scheduled() {
        let (store, table) = store_with_queue("orders").await;
        let r = record("order-placed");
        store.send_ready(&table, r.clone()).await.unwrap();
        store
            .claim_durable(&table, 10, NodeId::new(3), "postgresql://orders")
            .await
            .unwrap();

        let later = Utc::now() + Duration::minutes(5);
        store
            .requeue_incoming(&table, r.clone(), Some(later))
            .await
            .unwrap();

        assert_eq!(store.count(&table).await.unwrap(), 0);
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 1);
        assert_eq!(store.incoming_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_into_missing_queue_keeps_inbox_row() {
        let (store, table) = store_with_queue("orders").await;
        let r = record("order-placed");
        store.send_ready(&table, r.clone()).await.unwrap();
        store
            .claim_durable(&table, 10, NodeId::new(3), "postgresql://orders")
            .await
            .unwrap();

        let missing = QueueTable::for_queue("gone");
        let err = store.requeue_incoming(&missing, r.clone(), None).await.unwrap_err();

        assert!(matches!(err, TransportError::SchemaMissing { .. }));
        assert!(store.incoming(r.id).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_ready_insert_is_ignored() {
        let (store, table) = store_with_queue("orders").await;
        let r = record("a");
        store.send_ready(&table, r.clone()).await.unwrap();
        store.send_ready(&table, r).await.unwrap();
        assert_eq!(store.count(&table).await.unwrap(), 1);
    }
}

// ============================================================================
// Scheduled Tests
// ============================================================================

mod scheduled_tests {
    use super::*;

    #[tokio::test]
    async fn test_due_rows_promoted_with_original_timestamp() {
        let (store, table) = store_with_queue("orders").await;
        let now = Utc::now();

        let early = record("early");
        store
            .send_scheduled(&table, early.clone(), now + Duration::seconds(1))
            .await
            .unwrap();
        let later = record("later");
        store.send_ready(&table, later.clone()).await.unwrap();

        assert_eq!(store.move_due_scheduled(&table, now).await.unwrap(), 0);
        assert_eq!(
            store
                .move_due_scheduled(&table, now + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );

        // The scheduled row was inserted first, so it is claimed first
        assert_eq!(store.ready_ids(&table), vec![early.id, later.id]);
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_row_already_ready_is_not_promoted() {
        let (store, table) = store_with_queue("orders").await;
        let r = record("a");
        store.send_ready(&table, r.clone()).await.unwrap();
        store
            .send_scheduled(&table, r.clone(), Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(store.move_due_scheduled(&table, Utc::now()).await.unwrap(), 0);
        assert_eq!(store.count(&table).await.unwrap(), 1);
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_rows_deleted_from_both_sets() {
        let (store, table) = store_with_queue("orders").await;
        let now = Utc::now();
        let mut expired = record("a");
        expired.keep_until = Some(now - Duration::seconds(1));
        let mut scheduled_expired = record("b");
        scheduled_expired.keep_until = Some(now);

        store.send_ready(&table, expired).await.unwrap();
        store.send_ready(&table, record("c")).await.unwrap();
        store
            .send_scheduled(&table, scheduled_expired, now + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(store.delete_expired(&table, now).await.unwrap(), 2);
        assert_eq!(store.count(&table).await.unwrap(), 1);
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 0);
    }
}

// ============================================================================
// Outbox Tests
// ============================================================================

mod outbox_tests {
    use super::*;

    fn outgoing(id: EnvelopeId) -> OutgoingRecord {
        OutgoingRecord {
            id,
            owner_id: NodeId::new(1),
            destination: "postgresql://orders".to_string(),
            deliver_by: None,
            body: b"{}".to_vec(),
            message_type: "a".to_string(),
        }
    }

    #[tokio::test]
    async fn test_move_outgoing_into_ready() {
        let (store, table) = store_with_queue("orders").await;
        let id = EnvelopeId::new();
        store.persist_outgoing(outgoing(id)).await.unwrap();

        assert!(store.move_outgoing(&table, id, None).await.unwrap());
        assert_eq!(store.ready_ids(&table), vec![id]);
        assert_eq!(store.outgoing_count(), 0);

        // Second move finds nothing and does not duplicate
        assert!(!store.move_outgoing(&table, id, None).await.unwrap());
        assert_eq!(store.count(&table).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_move_outgoing_into_scheduled() {
        let (store, table) = store_with_queue("orders").await;
        let id = EnvelopeId::new();
        store.persist_outgoing(outgoing(id)).await.unwrap();

        assert!(store
            .move_outgoing(&table, id, Some(Utc::now() + Duration::minutes(5)))
            .await
            .unwrap());
        assert_eq!(store.count(&table).await.unwrap(), 0);
        assert_eq!(store.scheduled_count(&table).await.unwrap(), 1);
    }
}

// ============================================================================
// Dead Letter Tests
// ============================================================================

mod dead_letter_tests {
    use super::*;

    fn dead_letter(envelope: &Envelope, queue_name: &str) -> DeadLetterRecord {
        DeadLetterRecord {
            id: envelope.id,
            queue_name: queue_name.to_string(),
            message_type: envelope.message_type.clone(),
            body: JsonEnvelopeSerializer.serialize(envelope).unwrap(),
            exception_type: "Boom".to_string(),
            exception_message: "boom".to_string(),
            sent_at: Utc::now(),
            replayable: false,
            expires: None,
        }
    }

    #[tokio::test]
    async fn test_replay_moves_only_replayable_records() {
        let (store, table) = store_with_queue("orders").await;
        let mut first = Envelope::new("a", Bytes::from("1"));
        first.attempts = 3;
        let second = Envelope::new("a", Bytes::from("2"));

        store.store_dead_letter(dead_letter(&first, "orders")).await.unwrap();
        store.store_dead_letter(dead_letter(&second, "orders")).await.unwrap();
        assert_eq!(store.dead_letter_count().await.unwrap(), 2);

        assert_eq!(store.mark_replayable(&[first.id]).await.unwrap(), 1);
        assert_eq!(
            store.replay_dead_letters(&JsonEnvelopeSerializer).await.unwrap(),
            1
        );

        assert_eq!(store.dead_letter_count().await.unwrap(), 1);
        let claimed = store.claim_buffered(&table, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let replayed = JsonEnvelopeSerializer.deserialize(&claimed[0].body).unwrap();
        assert_eq!(replayed.id, first.id);
        assert_eq!(replayed.attempts, 0);
    }

    #[tokio::test]
    async fn test_replay_into_missing_queue_changes_nothing() {
        let store = InMemoryQueueStore::new("main");
        let envelope = Envelope::new("a", Bytes::new());
        store
            .store_dead_letter(dead_letter(&envelope, "gone"))
            .await
            .unwrap();
        store.mark_replayable(&[envelope.id]).await.unwrap();

        assert!(store.replay_dead_letters(&JsonEnvelopeSerializer).await.is_err());
        assert_eq!(store.dead_letter_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_expire_dead_letters() {
        let store = InMemoryQueueStore::new("main");
        let kept = Envelope::new("a", Bytes::new());
        let deleted = Envelope::new("a", Bytes::new());
        let expiring = Envelope::new("a", Bytes::new());

        store.store_dead_letter(dead_letter(&kept, "orders")).await.unwrap();
        store.store_dead_letter(dead_letter(&deleted, "orders")).await.unwrap();
        let mut record = dead_letter(&expiring, "orders");
        record.expires = Some(Utc::now() - Duration::seconds(1));
        store.store_dead_letter(record).await.unwrap();

        assert_eq!(store.delete_dead_letters(&[deleted.id]).await.unwrap(), 1);
        assert_eq!(
            store.delete_expired_dead_letters(Utc::now()).await.unwrap(),
            1
        );

        let remaining = store.dead_letters(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);
    }
}

#[tokio::test]
async fn test_injected_failures_are_transient() {
    let (store, table) = store_with_queue("orders").await;
    store.inject_failures(2);

    assert!(store.count(&table).await.unwrap_err().is_transient());
    assert!(store.ping().await.is_err());
    assert!(store.ping().await.is_ok());
}
