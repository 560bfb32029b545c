//! Multi-tenant fan-out.
//!
//! Each tenant lives in its own physical store. A [`TenantSource`] reports which stores exist;
//! [`TenantedListener`] runs one inner listener per store and [`TenantedSender`] routes each
//! envelope to the store of its tenant. Tenant membership is refreshed periodically, so it is
//! eventually consistent.

use crate::database::QueueStore;
use crate::endpoint::RuntimeContext;
use crate::envelope::TenantId;
use crate::error::TransportError;
use crate::listener::{Listener, Receiver};
use crate::sender::Sender;
use crate::uri::EndpointUri;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

mod listener;
mod sender;

pub use listener::TenantedListener;
pub use sender::TenantedSender;

// ============================================================================
// Snapshot Map
// ============================================================================

/// Copy-on-write map; readers see an immutable snapshot without locking.
///
/// Writers replace the whole map, so they should be serialized by the owner when a
/// read-modify-write must not race.
pub struct SnapshotMap<K, V> {
    inner: ArcSwap<HashMap<K, V>>,
}

impl<K, V> SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.load().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.load().contains_key(key)
    }

    /// Publish a new snapshot containing `key`
    pub fn insert(&self, key: K, value: V) {
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), value.clone());
            next
        });
    }

    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        self.inner.load_full()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

impl<K, V> Default for SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tenant Sources
// ============================================================================

/// A tenant and the physical store holding its queues
#[derive(Clone)]
pub struct TenantStore {
    pub tenant_id: TenantId,
    pub store: Arc<dyn QueueStore>,
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore")
            .field("tenant_id", &self.tenant_id)
            .field("store", &self.store.identifier())
            .finish()
    }
}

/// Where tenant stores come from
#[async_trait]
pub trait TenantSource: Send + Sync {
    /// Store used for envelopes of the default tenant
    fn master(&self) -> Option<Arc<dyn QueueStore>>;

    /// Re-read tenant membership and return the current tenant stores
    async fn refresh(&self) -> Result<Vec<TenantStore>, TransportError>;

    /// Tenant stores known as of the last refresh
    fn active_stores(&self) -> Vec<TenantStore>;

    /// Store of `tenant_id`, refreshing once when the tenant is not yet known
    async fn find_store(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Arc<dyn QueueStore>>, TransportError>;
}

/// Tenants registered in-process
#[derive(Default)]
pub struct StaticTenantSource {
    master: Option<Arc<dyn QueueStore>>,
    tenants: RwLock<Vec<TenantStore>>,
}

impl StaticTenantSource {
    pub fn new(master: Option<Arc<dyn QueueStore>>) -> Self {
        Self {
            master,
            tenants: RwLock::new(Vec::new()),
        }
    }

    /// Register a tenant, replacing an earlier registration of the same id
    pub fn add_tenant(&self, tenant_id: TenantId, store: Arc<dyn QueueStore>) {
        let mut tenants = self
            .tenants
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tenants.retain(|existing| existing.tenant_id != tenant_id);
        tenants.push(TenantStore { tenant_id, store });
    }

    fn tenants(&self) -> Vec<TenantStore> {
        self.tenants
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TenantSource for StaticTenantSource {
    fn master(&self) -> Option<Arc<dyn QueueStore>> {
        self.master.clone()
    }

    async fn refresh(&self) -> Result<Vec<TenantStore>, TransportError> {
        Ok(self.tenants())
    }

    fn active_stores(&self) -> Vec<TenantStore> {
        self.tenants()
    }

    async fn find_store(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Arc<dyn QueueStore>>, TransportError> {
        Ok(self
            .tenants()
            .into_iter()
            .find(|tenant| &tenant.tenant_id == tenant_id)
            .map(|tenant| tenant.store))
    }
}

// ============================================================================
// Binding
// ============================================================================

/// How a fan-out endpoint builds its per-store listeners and senders
#[async_trait]
pub trait TenantBinding: Send + Sync {
    fn address(&self) -> &EndpointUri;

    /// Make the queue usable in `store`; applied once per store per process
    async fn provision(&self, store: &Arc<dyn QueueStore>) -> Result<(), TransportError>;

    /// Build and start a listener over one store
    async fn build_listener(
        &self,
        runtime: &RuntimeContext,
        receiver: Arc<dyn Receiver>,
        store: Arc<dyn QueueStore>,
        tenant_id: Option<TenantId>,
    ) -> Result<Arc<dyn Listener>, TransportError>;

    fn create_sender(
        &self,
        runtime: &RuntimeContext,
        store: Arc<dyn QueueStore>,
    ) -> Result<Arc<dyn Sender>, TransportError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
