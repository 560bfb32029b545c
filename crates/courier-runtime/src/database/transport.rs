//! Transport owning every database queue endpoint.

use super::queue::{DatabaseQueue, QueueOptions, QueueStores};
use crate::config::TransportSettings;
use crate::endpoint::EndpointRegistry;
use crate::error::TransportError;
use crate::uri::{DatabaseQueueAddress, EndpointUri, DATABASE_SCHEME};
use std::sync::Arc;
use tracing::debug;

/// Database-backed transport for the `postgresql` scheme
///
/// # Examples
///
/// ```
/// use courier_runtime::database::{DatabaseTransport, InMemoryQueueStore, QueueStores};
/// use courier_runtime::{BrokerQueue, Endpoint, Envelope, RuntimeContext, TransportSettings};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let settings = TransportSettings::default();
/// let transport = DatabaseTransport::new(
///     QueueStores::Single(Arc::new(InMemoryQueueStore::new("main"))),
///     Arc::new(settings.clone()),
/// );
/// let queue = transport.queue("orders")?;
/// queue.setup().await?;
///
/// let runtime = RuntimeContext::new(settings);
/// let sender = queue.create_sender(&runtime)?;
/// sender
///     .send(Envelope::new("OrderPlaced", bytes::Bytes::from_static(b"{}")))
///     .await?;
/// assert_eq!(queue.count().await?, 1);
/// # Ok::<(), courier_runtime::TransportError>(())
/// # }).unwrap();
/// ```
pub struct DatabaseTransport {
    stores: QueueStores,
    settings: Arc<TransportSettings>,
    endpoints: EndpointRegistry<DatabaseQueue>,
}

impl DatabaseTransport {
    pub fn new(stores: QueueStores, settings: Arc<TransportSettings>) -> Self {
        Self {
            stores,
            settings,
            endpoints: EndpointRegistry::new(),
        }
    }

    /// Connect to PostgreSQL as configured, fanning out over tenant databases when
    /// `postgres.multi_tenant` is set
    #[cfg(feature = "postgres")]
    pub async fn connect(settings: Arc<TransportSettings>) -> Result<Self, TransportError> {
        use super::postgres::{PostgresQueueStore, PostgresTenantSource};

        let postgres = settings.postgres.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError(crate::error::ConfigurationError::Missing {
                key: "postgres".to_string(),
            })
        })?;

        let master = Arc::new(PostgresQueueStore::connect(postgres).await?);
        let stores = if postgres.multi_tenant {
            let source = PostgresTenantSource::new(master, postgres.max_connections);
            source.ensure_schema().await?;
            QueueStores::Tenanted(Arc::new(source))
        } else {
            QueueStores::Single(master)
        };

        Ok(Self::new(stores, settings))
    }

    pub fn protocol(&self) -> &'static str {
        DATABASE_SCHEME
    }

    pub fn settings(&self) -> &Arc<TransportSettings> {
        &self.settings
    }

    pub fn stores(&self) -> &QueueStores {
        &self.stores
    }

    /// Queue endpoint by name, created with default options on first use
    pub fn queue(&self, name: &str) -> Result<Arc<DatabaseQueue>, TransportError> {
        self.queue_with_options(name, QueueOptions::default())
    }

    /// Queue endpoint by name; `options` only apply when the endpoint is created
    pub fn queue_with_options(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<Arc<DatabaseQueue>, TransportError> {
        self.endpoint_for(DatabaseQueueAddress::new(name), options)
    }

    /// Queue endpoint addressed by `uri`
    pub fn find_endpoint(&self, uri: &EndpointUri) -> Result<Arc<DatabaseQueue>, TransportError> {
        let address = DatabaseQueueAddress::from_uri(uri)?;
        self.endpoint_for(address, QueueOptions::default())
    }

    pub fn endpoints(&self) -> Vec<Arc<DatabaseQueue>> {
        self.endpoints.all()
    }

    fn endpoint_for(
        &self,
        address: DatabaseQueueAddress,
        options: QueueOptions,
    ) -> Result<Arc<DatabaseQueue>, TransportError> {
        let uri = address.to_uri()?;
        self.endpoints.find_or_create(&uri, || {
            debug!(uri = %uri, "Creating database queue endpoint");
            DatabaseQueue::new(
                address,
                self.stores.clone(),
                options,
                self.settings.durability.auto_provision,
            )
        })
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
