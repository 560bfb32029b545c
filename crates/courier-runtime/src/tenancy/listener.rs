//! Listener fanning out over every tenant store.

use super::{SnapshotMap, TenantBinding, TenantSource};
use crate::backoff::sleep_or_cancel;
use crate::database::QueueStore;
use crate::endpoint::RuntimeContext;
use crate::envelope::{is_default_tenant, Envelope, TenantId, DEFAULT_TENANT};
use crate::error::TransportError;
use crate::listener::{Acknowledger, DeliveryFailure, Listener, Receiver};
use crate::uri::EndpointUri;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

struct FanOut {
    binding: Arc<dyn TenantBinding>,
    source: Arc<dyn TenantSource>,
    runtime: RuntimeContext,
    receiver: Arc<dyn Receiver>,
    /// Inner listeners keyed by store identifier
    listeners: SnapshotMap<String, Arc<dyn Listener>>,
    write_lock: Mutex<()>,
}

impl FanOut {
    /// Start a listener for `store` unless one already runs
    async fn add_store(
        &self,
        store: Arc<dyn QueueStore>,
        tenant_id: Option<TenantId>,
    ) -> Result<bool, TransportError> {
        let identifier = store.identifier().to_string();
        if self.listeners.contains_key(&identifier) {
            return Ok(false);
        }

        let _guard = self.write_lock.lock().await;
        if self.listeners.contains_key(&identifier) {
            return Ok(false);
        }

        let listener = self
            .binding
            .build_listener(&self.runtime, self.receiver.clone(), store, tenant_id.clone())
            .await?;
        self.listeners.insert(identifier.clone(), listener);

        info!(
            data_source = %identifier,
            tenant_id = tenant_id.as_ref().map(TenantId::as_str).unwrap_or(DEFAULT_TENANT),
            "Started tenant listener"
        );
        Ok(true)
    }

    /// Re-read tenant membership and start listeners for new stores.
    ///
    /// A store whose listener cannot be built is skipped and retried on the next refresh.
    async fn refresh(&self) -> Result<usize, TransportError> {
        let mut added = 0;
        for tenant in self.source.refresh().await? {
            let identifier = tenant.store.identifier().to_string();
            match self.add_store(tenant.store, Some(tenant.tenant_id.clone())).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    tenant_id = %tenant.tenant_id.as_str(),
                    data_source = %identifier,
                    error = %e,
                    "Failed to start tenant listener"
                ),
            }
        }
        Ok(added)
    }

    async fn listener_for(&self, envelope: &Envelope) -> Result<Arc<dyn Listener>, TransportError> {
        let store = if is_default_tenant(envelope.tenant_id.as_ref()) {
            self.source.master()
        } else {
            match &envelope.tenant_id {
                Some(tenant_id) => self.source.find_store(tenant_id).await?,
                None => None,
            }
        };

        store
            .and_then(|store| self.listeners.get(&store.identifier().to_string()))
            .ok_or_else(|| TransportError::UnknownTenant {
                tenant_id: envelope
                    .tenant_id
                    .as_ref()
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            })
    }
}

async fn refresh_loop(fan_out: Arc<FanOut>, token: CancellationToken) {
    let period = fan_out.runtime.settings.durability.tenant_check_period();

    while sleep_or_cancel(&token, period).await {
        // Not raced against cancellation: a listener started mid-refresh must land in the map
        match fan_out.refresh().await {
            Ok(0) => {}
            Ok(added) => debug!(added, "Added listeners for new tenant stores"),
            Err(e) => warn!(error = %e, "Tenant refresh failed"),
        }
    }

    debug!("Tenant refresh loop stopped");
}

struct RefreshTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs one inner listener per distinct tenant store.
///
/// New tenant stores are picked up by a periodic refresh; stores are never removed while
/// the listener runs.
pub struct TenantedListener {
    fan_out: Arc<FanOut>,
    refresh: Mutex<Option<RefreshTask>>,
    running: AtomicBool,
}

impl TenantedListener {
    pub fn new(
        binding: Arc<dyn TenantBinding>,
        source: Arc<dyn TenantSource>,
        runtime: RuntimeContext,
        receiver: Arc<dyn Receiver>,
    ) -> Self {
        Self {
            fan_out: Arc::new(FanOut {
                binding,
                source,
                runtime,
                receiver,
                listeners: SnapshotMap::new(),
                write_lock: Mutex::new(()),
            }),
            refresh: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Identifiers of stores with a running inner listener
    pub fn store_identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> =
            self.fan_out.listeners.snapshot().keys().cloned().collect();
        identifiers.sort();
        identifiers
    }
}

#[async_trait]
impl Acknowledger for TenantedListener {
    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.fan_out.listener_for(envelope).await?.complete(envelope).await
    }

    async fn defer(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.fan_out.listener_for(&envelope).await?.defer(envelope).await
    }

    async fn move_to_scheduled(
        &self,
        envelope: Envelope,
        time: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        self.fan_out
            .listener_for(&envelope)
            .await?
            .move_to_scheduled(envelope, time)
            .await
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        failure: &DeliveryFailure,
    ) -> Result<(), TransportError> {
        self.fan_out
            .listener_for(envelope)
            .await?
            .move_to_dead_letter(envelope, failure)
            .await
    }
}

#[async_trait]
impl Listener for TenantedListener {
    fn address(&self) -> &EndpointUri {
        self.fan_out.binding.address()
    }

    #[instrument(skip(self), fields(address = %self.address()))]
    async fn start(&self) -> Result<(), TransportError> {
        let mut refresh = self.refresh.lock().await;
        if refresh.is_some() {
            return Ok(());
        }

        if let Some(master) = self.fan_out.source.master() {
            self.fan_out.add_store(master, None).await?;
        }
        self.fan_out.refresh().await?;

        let token = self.fan_out.runtime.cancellation.child_token();
        let handle = tokio::spawn(refresh_loop(self.fan_out.clone(), token.clone()));
        *refresh = Some(RefreshTask { token, handle });
        self.running.store(true, Ordering::SeqCst);

        info!(stores = self.fan_out.listeners.len(), "Tenanted listener started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(task) = self.refresh.lock().await.take() else {
            return;
        };

        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Tenant refresh task ended abnormally");
        }

        for listener in self.fan_out.listeners.values() {
            listener.stop().await;
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Tenanted listener stopped");
    }

    async fn dispose(&self) {
        self.stop().await;
        for listener in self.fan_out.listeners.values() {
            listener.dispose().await;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
