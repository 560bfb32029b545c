//! Integration tests for multi-tenant fan-out
//!
//! These tests verify:
//! - Envelopes are routed to the store of their tenant, or the master by default
//! - One listener receives from every tenant store
//! - Tenants registered after the listener started are picked up by the refresh
//! - A tenant store that cannot be listened to does not hold back the others

mod common;

use common::CollectingReceiver;
use courier_runtime::database::{DatabaseTransport, InMemoryQueueStore, QueueStores, QueueTable};
use courier_runtime::{
    BrokerQueue, Endpoint, Listener, QueueStore, RuntimeContext, StaticTenantSource, TenantId,
    TransportError,
};
use std::sync::Arc;
use std::time::Duration;

struct Tenancy {
    master: InMemoryQueueStore,
    source: Arc<StaticTenantSource>,
    transport: DatabaseTransport,
    runtime: RuntimeContext,
}

fn tenancy() -> Tenancy {
    let master = InMemoryQueueStore::new("master");
    let source = Arc::new(StaticTenantSource::new(Some(Arc::new(master.clone()))));
    let transport = DatabaseTransport::new(
        QueueStores::Tenanted(source.clone()),
        Arc::new(common::fast_settings()),
    );
    Tenancy {
        master,
        source,
        transport,
        runtime: RuntimeContext::new(common::fast_settings()),
    }
}

#[tokio::test]
async fn test_sender_routes_by_tenant() {
    // Arrange
    let tenancy = tenancy();
    let tenant_a = InMemoryQueueStore::new("tenant-a");
    tenancy
        .source
        .add_tenant(TenantId::new("a"), Arc::new(tenant_a.clone()));
    let queue = tenancy.transport.queue("orders").unwrap();
    let sender = queue.create_sender(&tenancy.runtime).unwrap();

    // Act
    sender.send(common::envelope("OrderPlaced")).await.unwrap();
    sender
        .send(common::envelope("OrderPlaced").with_tenant_id(TenantId::new("a")))
        .await
        .unwrap();
    sender
        .send(common::envelope("OrderPlaced").with_tenant_id(TenantId::new("a")))
        .await
        .unwrap();

    // Assert
    let table = QueueTable::for_queue("orders");
    assert_eq!(tenancy.master.count(&table).await.unwrap(), 1);
    assert_eq!(tenant_a.count(&table).await.unwrap(), 2);
    assert_eq!(queue.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_unknown_tenant_is_rejected() {
    let tenancy = tenancy();
    let queue = tenancy.transport.queue("orders").unwrap();
    let sender = queue.create_sender(&tenancy.runtime).unwrap();

    let result = sender
        .send(common::envelope("OrderPlaced").with_tenant_id(TenantId::new("ghost")))
        .await;

    assert!(matches!(result, Err(TransportError::UnknownTenant { .. })));
}

#[tokio::test]
async fn test_listener_converges_on_tenants_added_later() {
    // Arrange: one tenant known at start
    let tenancy = tenancy();
    let tenant_a = InMemoryQueueStore::new("tenant-a");
    tenancy
        .source
        .add_tenant(TenantId::new("a"), Arc::new(tenant_a.clone()));
    let queue = tenancy.transport.queue("orders").unwrap();
    let sender = queue.create_sender(&tenancy.runtime).unwrap();

    let receiver = CollectingReceiver::new();
    let listener = queue
        .build_listener(&tenancy.runtime, receiver.clone())
        .await
        .unwrap();

    let to_master = common::envelope("OrderPlaced");
    let to_a = common::envelope("OrderPlaced").with_tenant_id(TenantId::new("a"));
    let mut expected = vec![to_master.id, to_a.id];
    sender.send(to_master).await.unwrap();
    sender.send(to_a).await.unwrap();

    // Act: a second tenant joins while the listener runs
    let tenant_b = InMemoryQueueStore::new("tenant-b");
    tenancy
        .source
        .add_tenant(TenantId::new("b"), Arc::new(tenant_b.clone()));
    let to_b = common::envelope("OrderPlaced").with_tenant_id(TenantId::new("b"));
    expected.push(to_b.id);
    sender.send(to_b).await.unwrap();

    // Assert
    assert!(common::wait_until(Duration::from_secs(5), || receiver.len() == 3).await);

    let mut received = receiver.ids();
    received.sort();
    expected.sort();
    assert_eq!(received, expected);

    let from_b = receiver
        .received()
        .into_iter()
        .find(|envelope| envelope.tenant_id == Some(TenantId::new("b")));
    assert!(from_b.is_some());

    let table = QueueTable::for_queue("orders");
    assert_eq!(tenant_b.count(&table).await.unwrap(), 0);

    listener.dispose().await;
}

#[tokio::test]
async fn test_setup_provisions_every_tenant_store() {
    let tenancy = tenancy();
    let tenant_a = InMemoryQueueStore::new("tenant-a");
    let tenant_b = InMemoryQueueStore::new("tenant-b");
    tenancy
        .source
        .add_tenant(TenantId::new("a"), Arc::new(tenant_a.clone()));
    tenancy
        .source
        .add_tenant(TenantId::new("b"), Arc::new(tenant_b.clone()));

    let queue = tenancy.transport.queue("orders").unwrap();
    queue.setup().await.unwrap();

    let table = QueueTable::for_queue("orders");
    for store in [&tenancy.master, &tenant_a, &tenant_b] {
        assert!(store.check_schema(&table).await.unwrap().is_ok());
    }
    let stores: Vec<String> = queue
        .attributes()
        .await
        .unwrap()
        .into_iter()
        .map(|attributes| attributes.store)
        .collect();
    assert_eq!(stores, vec!["master", "tenant-a", "tenant-b"]);
}

#[tokio::test]
async fn test_unprovisioned_tenant_does_not_block_healthy_tenant() {
    // Arrange: no provisioning on demand, so a store without tables cannot get a listener
    let mut settings = common::fast_settings();
    settings.durability.auto_provision = false;
    let table = QueueTable::for_queue("orders");

    let master = InMemoryQueueStore::new("master");
    master.ensure_schema(&table).await.unwrap();
    let source = Arc::new(StaticTenantSource::new(Some(Arc::new(master.clone()))));
    let transport =
        DatabaseTransport::new(QueueStores::Tenanted(source.clone()), Arc::new(settings.clone()));
    let runtime = RuntimeContext::new(settings);
    let queue = transport.queue("orders").unwrap();

    let receiver = CollectingReceiver::new();
    let listener = queue.build_listener(&runtime, receiver.clone()).await.unwrap();

    // Act: a broken and a healthy tenant join in the same refresh period
    let unprovisioned = InMemoryQueueStore::new("tenant-b");
    let healthy = InMemoryQueueStore::new("tenant-c");
    healthy.ensure_schema(&table).await.unwrap();
    source.add_tenant(TenantId::new("b"), Arc::new(unprovisioned));
    source.add_tenant(TenantId::new("c"), Arc::new(healthy.clone()));

    let to_c = common::envelope("OrderPlaced").with_tenant_id(TenantId::new("c"));
    let id = to_c.id;
    queue
        .create_sender(&runtime)
        .unwrap()
        .send(to_c)
        .await
        .unwrap();

    // Assert
    assert!(common::wait_until(Duration::from_secs(5), || receiver.ids() == vec![id]).await);
    assert_eq!(healthy.count(&table).await.unwrap(), 0);
    assert!(listener.is_running());

    listener.dispose().await;
}
