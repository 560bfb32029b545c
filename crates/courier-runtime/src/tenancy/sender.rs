//! Sender routing each envelope to the store of its tenant.

use super::{SnapshotMap, TenantBinding, TenantSource};
use crate::database::QueueStore;
use crate::endpoint::RuntimeContext;
use crate::envelope::{is_default_tenant, Envelope, TenantId, DEFAULT_TENANT};
use crate::error::TransportError;
use crate::sender::Sender;
use crate::uri::EndpointUri;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Resolves and caches one physical sender per tenant.
///
/// Tenants that share a store share its sender. Resolution of an unseen tenant happens once,
/// under a mutex; later sends read lock-free snapshots.
pub struct TenantedSender {
    destination: EndpointUri,
    binding: Arc<dyn TenantBinding>,
    source: Arc<dyn TenantSource>,
    runtime: RuntimeContext,
    master: Option<(Arc<dyn QueueStore>, Arc<dyn Sender>)>,
    by_tenant: SnapshotMap<TenantId, Arc<dyn Sender>>,
    by_store: SnapshotMap<String, Arc<dyn Sender>>,
    resolve_lock: Mutex<()>,
}

impl TenantedSender {
    pub fn new(
        binding: Arc<dyn TenantBinding>,
        source: Arc<dyn TenantSource>,
        runtime: RuntimeContext,
    ) -> Result<Self, TransportError> {
        let by_store = SnapshotMap::new();
        let master = match source.master() {
            Some(store) => {
                let sender = binding.create_sender(&runtime, store.clone())?;
                by_store.insert(store.identifier().to_string(), sender.clone());
                Some((store, sender))
            }
            None => None,
        };

        Ok(Self {
            destination: binding.address().clone(),
            binding,
            source,
            runtime,
            master,
            by_tenant: SnapshotMap::new(),
            by_store,
            resolve_lock: Mutex::new(()),
        })
    }

    /// Number of distinct physical senders created so far
    pub fn store_sender_count(&self) -> usize {
        self.by_store.len()
    }

    async fn resolve_master(&self) -> Result<Arc<dyn Sender>, TransportError> {
        let (store, sender) =
            self.master
                .as_ref()
                .ok_or_else(|| TransportError::UnknownTenant {
                    tenant_id: DEFAULT_TENANT.to_string(),
                })?;
        self.binding.provision(store).await?;
        Ok(sender.clone())
    }

    /// Physical sender for `tenant_id`
    #[instrument(skip(self))]
    pub async fn resolve(&self, tenant_id: Option<&TenantId>) -> Result<Arc<dyn Sender>, TransportError> {
        let tenant_id = match tenant_id {
            Some(tenant_id) if !is_default_tenant(Some(tenant_id)) => tenant_id,
            _ => return self.resolve_master().await,
        };

        if let Some(sender) = self.by_tenant.get(tenant_id) {
            return Ok(sender);
        }

        let _guard = self.resolve_lock.lock().await;
        if let Some(sender) = self.by_tenant.get(tenant_id) {
            return Ok(sender);
        }

        let store = self
            .source
            .find_store(tenant_id)
            .await?
            .ok_or_else(|| TransportError::UnknownTenant {
                tenant_id: tenant_id.as_str().to_string(),
            })?;
        let identifier = store.identifier().to_string();

        let sender = match self.by_store.get(&identifier) {
            Some(existing) => existing,
            None => {
                self.binding.provision(&store).await?;
                let sender = self.binding.create_sender(&self.runtime, store)?;
                self.by_store.insert(identifier.clone(), sender.clone());
                sender
            }
        };

        self.by_tenant.insert(tenant_id.clone(), sender.clone());
        debug!(tenant_id = %tenant_id, data_source = %identifier, "Resolved tenant sender");
        Ok(sender)
    }
}

#[async_trait]
impl Sender for TenantedSender {
    fn destination(&self) -> &EndpointUri {
        &self.destination
    }

    fn supports_native_scheduled_send(&self) -> bool {
        true
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let sender = self.resolve(envelope.tenant_id.as_ref()).await?;
        sender.send(envelope).await
    }

    async fn ping(&self) -> Result<bool, TransportError> {
        match &self.master {
            Some((_, master)) => master.ping().await,
            None => Ok(false),
        }
    }
}
