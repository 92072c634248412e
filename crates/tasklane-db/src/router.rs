//! Database router: one embedded handle per remote tenant, one shared handle
//! for everyone else.
//!
//! The registry is an explicit object. Each cache slot is a
//! [`tokio::sync::OnceCell`], so concurrent activations of the same tenant
//! await a single construction and observe the same `Arc<LocalDb>`.
//!
//! Eviction and teardown retire a slot. A construction that is still in
//! flight at that point finishes against the retired slot and closes its own
//! link, so a tenant key never has more than one live link.

use crate::error::{DbError, DbResult};
use crate::local::{DbHandle, HandleKey, LocalDb, LocalDbOptions};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tasklane_core::{
    Config, CredentialBroker, RemoteConnectionConfig, RouteTarget, TenantDescriptor, TenantId,
};
use tokio::sync::OnceCell;

/// File name of the shared local store.
pub const SHARED_DB_FILE: &str = "shared.sqlite3";

/// Establishes the live remote connection for a freshly opened handle.
///
/// Implementations attach a [`crate::RemoteLink`] to the handle and drive its
/// connection flag. An error leaves the handle usable but disconnected.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, db: DbHandle, remote: RemoteConnectionConfig) -> DbResult<()>;
}

/// Connector that never goes online. Handles stay local until replaced.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineConnector;

#[async_trait]
impl Connector for OfflineConnector {
    async fn connect(&self, db: DbHandle, remote: RemoteConnectionConfig) -> DbResult<()> {
        tracing::debug!(handle = %db.key(), tenant = %remote.tenant_id, "offline connector: not connecting");
        Ok(())
    }
}

/// Where the router keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// `None` keeps every handle in memory.
    pub data_dir: Option<PathBuf>,
    pub max_transaction_mutations: usize,
}

impl RouterConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: Some(config.data_dir.clone()),
            max_transaction_mutations: config.max_transaction_mutations,
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            max_transaction_mutations: tasklane_core::config::DEFAULT_MAX_TRANSACTION_MUTATIONS,
        }
    }

    const fn db_options(&self) -> LocalDbOptions {
        LocalDbOptions {
            max_transaction_mutations: self.max_transaction_mutations,
        }
    }
}

type SharedSlot = Arc<OnceCell<DbHandle>>;

/// Cache entry for one remote tenant.
#[derive(Default)]
struct TenantSlot {
    cell: OnceCell<DbHandle>,
    retired: Mutex<bool>,
}

impl TenantSlot {
    /// Mark the slot retired and return its handle if construction finished.
    ///
    /// Checked under the same lock as [`Self::is_retired`], so either this
    /// call sees the handle or the constructor sees the flag.
    fn retire(&self) -> Option<DbHandle> {
        let mut retired = self
            .retired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *retired = true;
        self.cell.get().cloned()
    }

    fn is_retired(&self) -> bool {
        *self
            .retired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registry of live embedded database handles.
pub struct DbRegistry {
    config: RouterConfig,
    broker: Arc<CredentialBroker>,
    connector: Arc<dyn Connector>,
    shared: Mutex<SharedSlot>,
    tenants: Mutex<HashMap<TenantId, Arc<TenantSlot>>>,
    constructions: AtomicU64,
}

impl DbRegistry {
    pub fn new(
        config: RouterConfig,
        broker: Arc<CredentialBroker>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            broker,
            connector,
            shared: Mutex::new(Arc::new(OnceCell::new())),
            tenants: Mutex::new(HashMap::new()),
            constructions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Build the tenant descriptor and return its handle.
    pub async fn activate(
        &self,
        id: TenantId,
        display_name: &str,
    ) -> DbResult<(TenantDescriptor, DbHandle)> {
        let descriptor = self.broker.describe(id, display_name);
        let handle = self.get_handle(&descriptor).await?;
        Ok((descriptor, handle))
    }

    /// Handle for `descriptor`, constructing it at most once per key.
    pub async fn get_handle(&self, descriptor: &TenantDescriptor) -> DbResult<DbHandle> {
        match self.broker.resolve(&descriptor.display_name) {
            RouteTarget::Local => self.shared_handle().await,
            RouteTarget::Remote(endpoint) => {
                let remote = endpoint.into_connection(descriptor.id.clone());
                self.tenant_handle(remote).await
            }
        }
    }

    async fn shared_handle(&self) -> DbResult<DbHandle> {
        let slot = Arc::clone(
            &self
                .shared
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let handle = slot
            .get_or_try_init(|| async { self.open(HandleKey::Shared) })
            .await?;
        Ok(Arc::clone(handle))
    }

    async fn tenant_handle(&self, remote: RemoteConnectionConfig) -> DbResult<DbHandle> {
        let slot = {
            let mut tenants = self
                .tenants
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(tenants.entry(remote.tenant_id.clone()).or_default())
        };
        let handle = slot
            .cell
            .get_or_try_init(|| async move {
                let handle = self.open(HandleKey::Tenant(remote.tenant_id.clone()))?;
                let tenant = remote.tenant_id.clone();
                if let Err(err) = self.connector.connect(Arc::clone(&handle), remote).await {
                    tracing::warn!(%tenant, error = %err, "remote connection failed; handle stays local");
                    handle.mark_disconnected(err.to_string());
                }
                Ok::<_, DbError>(handle)
            })
            .await?;
        if slot.is_retired() {
            // Evicted or torn down while connecting.
            handle.close_link();
            tracing::debug!(handle = %handle.key(), "construction finished after retirement; link closed");
        }
        Ok(Arc::clone(handle))
    }

    fn open(&self, key: HandleKey) -> DbResult<DbHandle> {
        let options = self.config.db_options();
        let db = match &self.config.data_dir {
            None => LocalDb::open_memory(key.clone(), options)?,
            Some(dir) => {
                let file = match &key {
                    HandleKey::Shared => SHARED_DB_FILE.to_string(),
                    HandleKey::Tenant(id) => tenant_file_name(id),
                };
                LocalDb::open(&dir.join(file), key.clone(), options)?
            }
        };
        self.constructions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(handle = %key, path = ?db.path(), "opened embedded database");
        Ok(Arc::new(db))
    }

    /// Drop a tenant's cached handle and close its link.
    ///
    /// Holders of the old `Arc` keep a working local handle; the next
    /// activation builds a fresh one. A construction still in flight closes
    /// its link when it completes.
    pub fn evict(&self, tenant_id: &TenantId) -> bool {
        let slot = self
            .tenants
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(tenant_id);
        let Some(slot) = slot else {
            return false;
        };
        if let Some(handle) = slot.retire() {
            handle.close_link();
        }
        tracing::debug!(tenant = %tenant_id, "evicted tenant handle");
        true
    }

    /// Close every remote link and forget all handles.
    ///
    /// Links are signalled, not awaited: an upload already in flight runs to
    /// completion in the background. Use [`Self::shutdown`] to wait for it.
    pub fn teardown(&self) {
        let handles = self.retire_all();
        for handle in &handles {
            handle.close_link();
        }
        tracing::info!(closed = handles.len(), "database registry torn down");
    }

    /// Like [`Self::teardown`], then wait until every closed link has
    /// finished its background work.
    pub async fn shutdown(&self) {
        let handles = self.retire_all();
        for handle in &handles {
            handle.shutdown_link().await;
        }
        tracing::info!(closed = handles.len(), "database registry shut down");
    }

    fn retire_all(&self) -> Vec<DbHandle> {
        let tenants: Vec<Arc<TenantSlot>> = self
            .tenants
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let shared = std::mem::replace(
            &mut *self
                .shared
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            Arc::new(OnceCell::new()),
        );
        tenants
            .iter()
            .filter_map(|slot| slot.retire())
            .chain(shared.get().cloned())
            .collect()
    }

    /// Tenants whose handle has been constructed, sorted.
    #[must_use]
    pub fn cached_tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self
            .tenants
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|(_, slot)| slot.cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Total number of handles this registry has opened.
    #[must_use]
    pub fn construction_count(&self) -> u64 {
        self.constructions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DbRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRegistry")
            .field("config", &self.config)
            .field("cached_tenants", &self.cached_tenants())
            .field("constructions", &self.construction_count())
            .finish_non_exhaustive()
    }
}

/// Stable, filesystem-safe database file name for a tenant.
///
/// The readable prefix is lossy; the hash suffix keeps distinct ids apart.
#[must_use]
pub fn tenant_file_name(id: &TenantId) -> String {
    let slug: String = id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    let digest = hex::encode(Sha256::digest(id.as_str().as_bytes()));
    format!("tenant-{slug}-{}.sqlite3", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_file_names_are_safe_and_distinct() {
        let a = tenant_file_name(&TenantId::new("Proj/One"));
        let b = tenant_file_name(&TenantId::new("proj_one"));
        assert!(a.starts_with("tenant-proj_one-"));
        assert!(a.ends_with(".sqlite3"));
        assert_ne!(a, b);
        assert!(!a.contains('/'));
        assert_eq!(a, tenant_file_name(&TenantId::new("Proj/One")));
    }

    #[test]
    fn long_ids_are_truncated() {
        let name = tenant_file_name(&TenantId::new("x".repeat(200)));
        assert!(name.len() < 64);
    }

    #[tokio::test]
    async fn local_tenants_share_one_handle() {
        let registry = DbRegistry::new(
            RouterConfig::in_memory(),
            Arc::new(CredentialBroker::local_only()),
            Arc::new(OfflineConnector),
        );
        let (first, a) = registry.activate(TenantId::new("p1"), "Alpha").await.unwrap();
        let (_, b) = registry.activate(TenantId::new("p2"), "Beta").await.unwrap();
        assert_eq!(first.routing_mode, tasklane_core::RoutingMode::Local);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.construction_count(), 1);
        assert!(registry.cached_tenants().is_empty());
    }

    #[tokio::test]
    async fn teardown_resets_shared_handle() {
        let registry = DbRegistry::new(
            RouterConfig::in_memory(),
            Arc::new(CredentialBroker::local_only()),
            Arc::new(OfflineConnector),
        );
        let (_, a) = registry.activate(TenantId::new("p1"), "Alpha").await.unwrap();
        registry.teardown();
        let (_, b) = registry.activate(TenantId::new("p1"), "Alpha").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.construction_count(), 2);
    }
}
