//! Database queue endpoint and broker-queue administration.

use super::listener::{DatabaseListener, ListenerBinding};
use super::sender::DatabaseSender;
use super::store::{QueueStore, QueueTable, SchemaCheck};
use crate::dead_letter::{
    DeadLetterConfig, DeadLetterMode, DeadLetterStore, DeadLetterStrategy, InteropDeadLetter,
    StorageDeadLetter, DEFAULT_DEAD_LETTER_QUEUE,
};
use crate::endpoint::{Endpoint, EndpointMode, EndpointRole, RuntimeContext};
use crate::envelope::TenantId;
use crate::error::TransportError;
use crate::listener::{Listener, Receiver};
use crate::sender::Sender;
use crate::tenancy::{TenantBinding, TenantSource, TenantedListener, TenantedSender};
use crate::uri::{DatabaseQueueAddress, EndpointUri};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{info, instrument};

// ============================================================================
// Store Topology
// ============================================================================

/// Physical stores behind a database queue
#[derive(Clone)]
pub enum QueueStores {
    /// One database holds every envelope
    Single(Arc<dyn QueueStore>),
    /// One database per tenant, plus an optional master for the default tenant
    Tenanted(Arc<dyn TenantSource>),
}

impl QueueStores {
    /// Every distinct store currently known, master first
    pub async fn all(&self) -> Result<Vec<Arc<dyn QueueStore>>, TransportError> {
        match self {
            Self::Single(store) => Ok(vec![store.clone()]),
            Self::Tenanted(source) => {
                let mut stores: Vec<Arc<dyn QueueStore>> = source.master().into_iter().collect();
                for tenant in source.refresh().await? {
                    if !stores
                        .iter()
                        .any(|s| s.identifier() == tenant.store.identifier())
                    {
                        stores.push(tenant.store);
                    }
                }
                Ok(stores)
            }
        }
    }
}

// ============================================================================
// Broker Queue Administration
// ============================================================================

/// Per-store statistics of one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    pub store: String,
    pub queue_name: String,
    pub count: u64,
    pub scheduled_count: u64,
}

/// Idempotent administration of a broker-side queue
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Create the queue in every store
    async fn setup(&self) -> Result<(), TransportError>;

    /// Remove the queue from every store
    async fn teardown(&self) -> Result<(), TransportError>;

    /// Delete every envelope, ready and scheduled
    async fn purge(&self) -> Result<(), TransportError>;

    /// Verify the queue without changing anything
    async fn check(&self) -> Result<SchemaCheck, TransportError>;

    async fn attributes(&self) -> Result<Vec<QueueAttributes>, TransportError>;

    /// Ready envelopes across all stores
    async fn count(&self) -> Result<u64, TransportError>;

    /// Scheduled envelopes across all stores
    async fn scheduled_count(&self) -> Result<u64, TransportError>;
}

// ============================================================================
// Queue Binding
// ============================================================================

/// Per-queue knowledge shared by the endpoint and its tenant fan-out
pub struct QueueBinding {
    uri: EndpointUri,
    table: QueueTable,
    mode: EndpointMode,
    dead_letter: DeadLetterConfig,
    auto_provision: bool,
    /// Identifiers of stores whose schema was applied by this process
    provisioned: Mutex<HashSet<String>>,
}

impl QueueBinding {
    fn dead_letter_table(&self) -> Option<QueueTable> {
        (self.dead_letter.mode == DeadLetterMode::InteropFriendly)
            .then(|| QueueTable::for_queue(self.dead_letter.destination_name()))
    }

    /// Apply the schema unconditionally and remember the store
    async fn setup_store(&self, store: &Arc<dyn QueueStore>) -> Result<(), TransportError> {
        let mut provisioned = self.provisioned.lock().await;
        store.ensure_schema(&self.table).await?;
        if let Some(dead_letter_table) = self.dead_letter_table() {
            store.ensure_schema(&dead_letter_table).await?;
        }
        provisioned.insert(store.identifier().to_string());
        Ok(())
    }

    async fn forget_store(&self, store: &Arc<dyn QueueStore>) {
        self.provisioned.lock().await.remove(store.identifier());
    }

    fn database_sender(
        &self,
        runtime: &RuntimeContext,
        store: Arc<dyn QueueStore>,
    ) -> Arc<DatabaseSender> {
        Arc::new(DatabaseSender::new(
            self.uri.clone(),
            self.table.clone(),
            store,
            runtime.serializer.clone(),
            self.mode,
        ))
    }

    fn dead_letter_strategy(
        &self,
        runtime: &RuntimeContext,
        store: &Arc<dyn QueueStore>,
    ) -> Result<Arc<dyn DeadLetterStrategy>, TransportError> {
        match self.dead_letter.mode {
            // The dead-letter table is the database's native dead-letter queue
            DeadLetterMode::Native | DeadLetterMode::DurableStorage => {
                let dead_letters: Arc<dyn DeadLetterStore> = store.clone();
                Ok(Arc::new(
                    StorageDeadLetter::new(
                        dead_letters,
                        self.table.queue_name.clone(),
                        runtime.serializer.clone(),
                    )
                    .with_expiration(runtime.settings.durability.dead_letter_expiration()),
                ))
            }
            DeadLetterMode::InteropFriendly => {
                let queue_name = self.dead_letter.destination_name();
                let address = DatabaseQueueAddress::new(queue_name).to_uri()?;
                let sender = Arc::new(DatabaseSender::new(
                    address,
                    QueueTable::for_queue(queue_name),
                    store.clone(),
                    runtime.serializer.clone(),
                    EndpointMode::BufferedInMemory,
                ));
                Ok(Arc::new(InteropDeadLetter::new(
                    sender,
                    self.dead_letter.clone(),
                )))
            }
        }
    }
}

#[async_trait]
impl TenantBinding for QueueBinding {
    fn address(&self) -> &EndpointUri {
        &self.uri
    }

    async fn provision(&self, store: &Arc<dyn QueueStore>) -> Result<(), TransportError> {
        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(store.identifier()) {
            return Ok(());
        }

        if self.auto_provision {
            store.ensure_schema(&self.table).await?;
            if let Some(dead_letter_table) = self.dead_letter_table() {
                store.ensure_schema(&dead_letter_table).await?;
            }
            info!(
                queue = %self.table.queue_name,
                data_source = %store.identifier(),
                "Provisioned queue tables"
            );
        } else if !store.check_schema(&self.table).await?.is_ok() {
            return Err(TransportError::SchemaMissing {
                table: self.table.ready_table.clone(),
            });
        }

        provisioned.insert(store.identifier().to_string());
        Ok(())
    }

    async fn build_listener(
        &self,
        runtime: &RuntimeContext,
        receiver: Arc<dyn Receiver>,
        store: Arc<dyn QueueStore>,
        tenant_id: Option<TenantId>,
    ) -> Result<Arc<dyn Listener>, TransportError> {
        self.provision(&store).await?;

        let binding = ListenerBinding {
            address: self.uri.clone(),
            table: self.table.clone(),
            sender: self.database_sender(runtime, store.clone()),
            dead_letter: self.dead_letter_strategy(runtime, &store)?,
            store,
            mode: self.mode,
            tenant_id,
        };

        let listener = Arc::new(DatabaseListener::new(binding, receiver, runtime.clone()));
        listener.start().await?;
        Ok(listener)
    }

    fn create_sender(
        &self,
        runtime: &RuntimeContext,
        store: Arc<dyn QueueStore>,
    ) -> Result<Arc<dyn Sender>, TransportError> {
        Ok(self.database_sender(runtime, store))
    }
}

// ============================================================================
// Database Queue Endpoint
// ============================================================================

/// Options applied when a queue endpoint is first created
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub mode: EndpointMode,
    pub role: EndpointRole,
    pub dead_letter: DeadLetterConfig,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            mode: EndpointMode::Durable,
            role: EndpointRole::Application,
            dead_letter: DeadLetterConfig::new(DEFAULT_DEAD_LETTER_QUEUE)
                .with_mode(DeadLetterMode::DurableStorage),
        }
    }
}

/// One logical queue, possibly spread over many tenant stores
pub struct DatabaseQueue {
    address: DatabaseQueueAddress,
    role: EndpointRole,
    stores: QueueStores,
    binding: Arc<QueueBinding>,
    sender: OnceLock<Arc<dyn Sender>>,
}

impl DatabaseQueue {
    pub fn new(
        address: DatabaseQueueAddress,
        stores: QueueStores,
        options: QueueOptions,
        auto_provision: bool,
    ) -> Result<Self, TransportError> {
        let uri = address.to_uri()?;
        Ok(Self {
            binding: Arc::new(QueueBinding {
                uri,
                table: QueueTable::for_queue(&address.queue_name),
                mode: options.mode,
                dead_letter: options.dead_letter,
                auto_provision,
                provisioned: Mutex::new(HashSet::new()),
            }),
            address,
            role: options.role,
            stores,
            sender: OnceLock::new(),
        })
    }

    pub fn address(&self) -> &DatabaseQueueAddress {
        &self.address
    }

    pub fn table(&self) -> &QueueTable {
        &self.binding.table
    }

    pub fn stores(&self) -> &QueueStores {
        &self.stores
    }
}

#[async_trait]
impl Endpoint for DatabaseQueue {
    fn uri(&self) -> &EndpointUri {
        &self.binding.uri
    }

    fn endpoint_name(&self) -> &str {
        &self.address.queue_name
    }

    fn mode(&self) -> EndpointMode {
        self.binding.mode
    }

    fn role(&self) -> EndpointRole {
        self.role
    }

    fn supports_mode(&self, mode: EndpointMode) -> bool {
        matches!(mode, EndpointMode::Durable | EndpointMode::BufferedInMemory)
    }

    #[instrument(skip(self, runtime, receiver), fields(queue = %self.address.queue_name))]
    async fn build_listener(
        &self,
        runtime: &RuntimeContext,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Listener>, TransportError> {
        match &self.stores {
            QueueStores::Single(store) => {
                self.binding
                    .build_listener(runtime, receiver, store.clone(), None)
                    .await
            }
            QueueStores::Tenanted(source) => {
                let binding: Arc<dyn TenantBinding> = self.binding.clone();
                let listener = Arc::new(TenantedListener::new(
                    binding,
                    source.clone(),
                    runtime.clone(),
                    receiver,
                ));
                listener.start().await?;
                Ok(listener)
            }
        }
    }

    fn create_sender(&self, runtime: &RuntimeContext) -> Result<Arc<dyn Sender>, TransportError> {
        if let Some(sender) = self.sender.get() {
            return Ok(sender.clone());
        }

        let sender: Arc<dyn Sender> = match &self.stores {
            QueueStores::Single(store) => self.binding.create_sender(runtime, store.clone())?,
            QueueStores::Tenanted(source) => {
                let binding: Arc<dyn TenantBinding> = self.binding.clone();
                Arc::new(TenantedSender::new(
                    binding,
                    source.clone(),
                    runtime.clone(),
                )?)
            }
        };

        Ok(self.sender.get_or_init(|| sender).clone())
    }

    fn dead_letter(&self) -> &DeadLetterConfig {
        &self.binding.dead_letter
    }
}

#[async_trait]
impl BrokerQueue for DatabaseQueue {
    #[instrument(skip(self), fields(queue = %self.address.queue_name))]
    async fn setup(&self) -> Result<(), TransportError> {
        for store in self.stores.all().await? {
            self.binding.setup_store(&store).await?;
        }
        info!("Queue set up");
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.address.queue_name))]
    async fn teardown(&self) -> Result<(), TransportError> {
        for store in self.stores.all().await? {
            store.drop_schema(&self.binding.table).await?;
            self.binding.forget_store(&store).await;
        }
        info!("Queue torn down");
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.address.queue_name))]
    async fn purge(&self) -> Result<(), TransportError> {
        for store in self.stores.all().await? {
            store.purge(&self.binding.table).await?;
        }
        Ok(())
    }

    async fn check(&self) -> Result<SchemaCheck, TransportError> {
        let mut report = SchemaCheck {
            ready_table_exists: true,
            scheduled_table_exists: true,
            missing_columns: Vec::new(),
        };

        for store in self.stores.all().await? {
            let check = store.check_schema(&self.binding.table).await?;
            report.ready_table_exists &= check.ready_table_exists;
            report.scheduled_table_exists &= check.scheduled_table_exists;
            report.missing_columns.extend(
                check
                    .missing_columns
                    .into_iter()
                    .map(|column| format!("{}:{}", store.identifier(), column)),
            );
        }
        Ok(report)
    }

    async fn attributes(&self) -> Result<Vec<QueueAttributes>, TransportError> {
        let mut attributes = Vec::new();
        for store in self.stores.all().await? {
            attributes.push(QueueAttributes {
                store: store.identifier().to_string(),
                queue_name: self.address.queue_name.clone(),
                count: store.count(&self.binding.table).await?,
                scheduled_count: store.scheduled_count(&self.binding.table).await?,
            });
        }
        Ok(attributes)
    }

    async fn count(&self) -> Result<u64, TransportError> {
        let mut total = 0;
        for store in self.stores.all().await? {
            total += store.count(&self.binding.table).await?;
        }
        Ok(total)
    }

    async fn scheduled_count(&self) -> Result<u64, TransportError> {
        let mut total = 0;
        for store in self.stores.all().await? {
            total += store.scheduled_count(&self.binding.table).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
