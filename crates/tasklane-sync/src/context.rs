//! Application context: tenant activation and teardown.
//!
//! [`SyncContext`] owns the router registry and the sync connector. Each
//! activation returns a [`TenantSession`] carrying the tenant's handle and,
//! for remote tenants, a health monitor.

use crate::connector::{DrainReport, DrainState, UploadConnector};
use crate::error::{SyncError, SyncResult};
use crate::link::{SyncConnector, SyncSettings};
use crate::remote::{BackendFactory, RestBackendFactory};
use crate::token::{EnvTokenProvider, TokenProvider};
use serde::Serialize;
use std::sync::Arc;
use tasklane_core::{Config, CredentialBroker, HealthRecord, RoutingMode, TenantDescriptor, TenantId};
use tasklane_db::{DbHandle, DbRegistry, HealthConfig, HealthMonitor, RouterConfig};

/// Coarse sync status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Healthy,
    Syncing,
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Syncing => write!(f, "syncing"),
            Self::Error => write!(f, "error"),
        }
    }
}

pub struct SyncContext {
    registry: Arc<DbRegistry>,
    sync: Arc<SyncConnector>,
    health: HealthConfig,
}

impl SyncContext {
    pub fn new(
        router: RouterConfig,
        broker: Arc<CredentialBroker>,
        sync: Arc<SyncConnector>,
        health: HealthConfig,
    ) -> Self {
        let registry = Arc::new(DbRegistry::new(
            router,
            broker,
            Arc::clone(&sync) as Arc<dyn tasklane_db::Connector>,
        ));
        Self {
            registry,
            sync,
            health,
        }
    }

    /// Production wiring: environment secrets, REST backends, env tokens.
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        let broker =
            CredentialBroker::from_config(config).map_err(|e| SyncError::Config(e.to_string()))?;
        let backends: Arc<dyn BackendFactory> = Arc::new(RestBackendFactory {
            timeout: config.http_timeout,
        });
        let tokens: Arc<dyn TokenProvider> = Arc::new(EnvTokenProvider::default());
        let sync = Arc::new(SyncConnector::new(
            SyncSettings::from_config(config),
            backends,
            tokens,
        ));
        Ok(Self::new(
            RouterConfig::from_config(config),
            Arc::new(broker),
            sync,
            HealthConfig::from_config(config),
        ))
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<DbRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn sync_connector(&self) -> &Arc<SyncConnector> {
        &self.sync
    }

    /// Resolve routing for a tenant and bring its handle up.
    ///
    /// Never fails because the remote is unreachable; the session then
    /// starts disconnected and the link keeps checking.
    pub async fn activate(&self, id: TenantId, display_name: &str) -> SyncResult<TenantSession> {
        let (descriptor, handle) = self.registry.activate(id, display_name).await?;
        let (monitor, upload) = match descriptor.routing_mode {
            RoutingMode::Local => (None, None),
            RoutingMode::Remote => (
                Some(HealthMonitor::start(
                    &handle,
                    descriptor.id.to_string(),
                    self.health,
                )),
                self.sync.upload_connector(&descriptor.id),
            ),
        };
        tracing::info!(
            tenant = %descriptor.id,
            mode = %descriptor.routing_mode,
            "tenant activated"
        );
        Ok(TenantSession {
            descriptor,
            handle,
            monitor,
            upload,
        })
    }

    /// Close every link and drop every cached handle.
    ///
    /// Returns at once; uploads already in flight finish in the background.
    pub fn teardown(&self) {
        self.registry.teardown();
    }

    /// Like [`Self::teardown`], but waits until every drain has stopped.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        tracing::info!("sync context shut down");
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("registry", &self.registry)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

/// One activation of a tenant.
///
/// Dropping the session stops its health monitor; the handle stays cached in
/// the registry.
#[derive(Debug)]
pub struct TenantSession {
    descriptor: TenantDescriptor,
    handle: DbHandle,
    monitor: Option<HealthMonitor>,
    upload: Option<Arc<UploadConnector>>,
}

impl TenantSession {
    #[must_use]
    pub const fn descriptor(&self) -> &TenantDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub const fn handle(&self) -> &DbHandle {
        &self.handle
    }

    #[must_use]
    pub fn health(&self) -> Option<HealthRecord> {
        self.monitor.as_ref().map(HealthMonitor::record)
    }

    #[must_use]
    pub const fn upload_connector(&self) -> Option<&Arc<UploadConnector>> {
        self.upload.as_ref()
    }

    /// Status derived from connection health and the last upload.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        if self.health().is_some_and(|h| !h.is_healthy) {
            return SyncStatus::Error;
        }
        let Some(upload) = &self.upload else {
            return SyncStatus::Healthy;
        };
        if upload.state() == DrainState::Draining {
            SyncStatus::Syncing
        } else if upload.last_error().is_some() {
            SyncStatus::Error
        } else {
            SyncStatus::Healthy
        }
    }

    /// Drain this tenant's queue now, outside the scheduler.
    ///
    /// Local tenants have nothing to upload and report an empty drain.
    pub async fn drain_now(&self) -> SyncResult<DrainReport> {
        match &self.upload {
            Some(upload) => upload.drain(&self.handle).await,
            None => Ok(DrainReport::default()),
        }
    }

    /// End this activation.
    pub fn deactivate(self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        tracing::debug!(tenant = %self.descriptor.id, "tenant deactivated");
    }
}
