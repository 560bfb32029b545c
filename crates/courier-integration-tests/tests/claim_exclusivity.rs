//! Integration tests for exclusive claiming of durable envelopes
//!
//! These tests verify:
//! - Concurrent claims never hand the same envelope to two claimers
//! - Every ready envelope is claimed exactly once
//! - Competing listeners on one queue split the work without duplicates

mod common;

use common::CollectingReceiver;
use courier_runtime::database::{InMemoryQueueStore, QueueRecord, QueueStore, QueueTable};
use courier_runtime::{BrokerQueue, Endpoint, EnvelopeId, Listener, NodeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn record() -> QueueRecord {
    QueueRecord {
        id: EnvelopeId::new(),
        body: b"{}".to_vec(),
        message_type: "OrderPlaced".to_string(),
        keep_until: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_an_envelope() {
    // Arrange
    let store = Arc::new(InMemoryQueueStore::new("main"));
    let table = QueueTable::for_queue("orders");
    store.ensure_schema(&table).await.unwrap();
    for _ in 0..200 {
        store.send_ready(&table, record()).await.unwrap();
    }

    // Act: eight claimers drain the queue in small batches
    let claimers = (0..8).map(|node| {
        let store = store.clone();
        let table = table.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store
                    .claim_durable(&table, 7, NodeId::new(node), "postgresql://orders")
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|record| record.id));
            }
            claimed
        })
    });
    let results = futures::future::join_all(claimers).await;

    // Assert
    let all: Vec<EnvelopeId> = results
        .into_iter()
        .flat_map(|result| result.unwrap())
        .collect();
    let distinct: HashSet<EnvelopeId> = all.iter().copied().collect();

    assert_eq!(all.len(), 200);
    assert_eq!(distinct.len(), 200);
    assert_eq!(store.count(&table).await.unwrap(), 0);
    assert_eq!(store.incoming_count().await.unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_listeners_deliver_each_envelope_once() {
    let store = InMemoryQueueStore::new("main");
    let (transport, runtime) = common::single_store(&store);
    let queue = transport.queue("orders").unwrap();
    queue.setup().await.unwrap();

    let sender = queue.create_sender(&runtime).unwrap();
    let mut sent = HashSet::new();
    for _ in 0..60 {
        let envelope = common::envelope("OrderPlaced");
        sent.insert(envelope.id);
        sender.send(envelope).await.unwrap();
    }

    let first = CollectingReceiver::new();
    let second = CollectingReceiver::new();
    let first_listener = queue.build_listener(&runtime, first.clone()).await.unwrap();
    let second_listener = queue.build_listener(&runtime, second.clone()).await.unwrap();

    assert!(
        common::wait_until(Duration::from_secs(5), || first.len() + second.len() >= 60).await
    );
    // Late duplicates would show up here
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first_ids: HashSet<EnvelopeId> = first.ids().into_iter().collect();
    let second_ids: HashSet<EnvelopeId> = second.ids().into_iter().collect();

    assert_eq!(first.len() + second.len(), 60);
    assert!(first_ids.is_disjoint(&second_ids));
    let delivered: HashSet<EnvelopeId> = first_ids.union(&second_ids).copied().collect();
    assert_eq!(delivered, sent);
    assert_eq!(store.incoming_count().await.unwrap(), 0);

    first_listener.dispose().await;
    second_listener.dispose().await;
}
