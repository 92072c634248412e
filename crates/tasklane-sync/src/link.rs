//! Live remote links.
//!
//! [`SyncConnector`] is the router's [`Connector`] for remote tenants. For
//! each new handle it builds a backend, starts the handle's drain scheduler
//! and a health check, and attaches all of it to the handle as one
//! [`RemoteLink`]. The handle's connection flag follows the health check.

use crate::connector::UploadConnector;
use crate::remote::{BackendFactory, RemoteBackend};
use crate::scheduler::DrainScheduler;
use crate::tables::TableMap;
use crate::token::TokenProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tasklane_core::{Config, RemoteConnectionConfig, TenantId};
use tasklane_db::{Connector, DbError, DbHandle, DbResult, LocalDb, RemoteLink, RetryConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Tunables shared by every link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub retry: RetryConfig,
    /// How often a link pings its backend to detect loss and recovery.
    pub reconnect_interval: Duration,
    pub tables: TableMap,
    pub token_template: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            reconnect_interval: Duration::from_millis(
                tasklane_core::config::DEFAULT_HEALTH_INTERVAL_MS,
            ),
            tables: TableMap::passthrough(),
            token_template: None,
        }
    }
}

impl SyncSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryConfig::from_config(config),
            reconnect_interval: config.health_interval,
            tables: TableMap::from_config(config),
            token_template: config.token_template.clone(),
        }
    }
}

/// Router connector that brings remote tenants online.
pub struct SyncConnector {
    settings: SyncSettings,
    backends: Arc<dyn BackendFactory>,
    tokens: Arc<dyn TokenProvider>,
    uploads: Mutex<HashMap<TenantId, Arc<UploadConnector>>>,
}

impl SyncConnector {
    pub fn new(
        settings: SyncSettings,
        backends: Arc<dyn BackendFactory>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            settings,
            backends,
            tokens,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Upload connector of the most recent link built for `tenant`.
    #[must_use]
    pub fn upload_connector(&self, tenant: &TenantId) -> Option<Arc<UploadConnector>> {
        self.uploads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }
}

#[async_trait]
impl Connector for SyncConnector {
    async fn connect(&self, db: DbHandle, remote: RemoteConnectionConfig) -> DbResult<()> {
        let tenant = remote.tenant_id.clone();
        let backend = self
            .backends
            .build(&remote)
            .map_err(|e| DbError::Connection(e.to_string()))?;
        let upload = Arc::new(UploadConnector::new(
            Arc::clone(&backend),
            Arc::clone(&self.tokens),
            self.settings.tables.clone(),
            self.settings.token_template.clone(),
        ));
        let scheduler = DrainScheduler::start(&db, Arc::clone(&upload), self.settings.retry);

        let initial = backend.ping().await;
        if initial.is_ok() {
            db.mark_connected();
            scheduler.trigger();
        }

        let health = tokio::spawn(watch_health(
            Arc::downgrade(&db),
            backend,
            scheduler.notifier(),
            self.settings.reconnect_interval,
            tenant.clone(),
        ));
        db.attach_link(Box::new(SyncLink {
            tenant: tenant.clone(),
            scheduler,
            health,
        }));
        self.uploads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(tenant.clone(), upload);

        match initial {
            Ok(()) => {
                tracing::info!(%tenant, "remote link established");
                Ok(())
            }
            Err(err) => Err(DbError::Connection(err.to_string())),
        }
    }
}

impl std::fmt::Debug for SyncConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConnector")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Everything a live remote tenant runs in the background.
struct SyncLink {
    tenant: TenantId,
    scheduler: DrainScheduler,
    health: JoinHandle<()>,
}

#[async_trait]
impl RemoteLink for SyncLink {
    fn close(&self) {
        self.scheduler.stop();
        self.health.abort();
        tracing::debug!(tenant = %self.tenant, "remote link closing");
    }

    async fn closed(&self) {
        self.scheduler.stopped().await;
        tracing::debug!(tenant = %self.tenant, "remote link closed");
    }
}

impl Drop for SyncLink {
    fn drop(&mut self) {
        self.health.abort();
    }
}

/// Periodically ping the backend and keep the handle's flag in step.
async fn watch_health(
    db: Weak<LocalDb>,
    backend: Arc<dyn RemoteBackend>,
    trigger: Arc<Notify>,
    every: Duration,
    tenant: TenantId,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let result = backend.ping().await;
        let Some(db) = db.upgrade() else {
            break;
        };
        match result {
            Ok(()) if !db.is_connected() => {
                db.mark_connected();
                tracing::info!(%tenant, "remote link reconnected");
                trigger.notify_one();
            }
            Err(err) if db.is_connected() => {
                tracing::warn!(%tenant, error = %err, "remote link lost");
                db.mark_disconnected(err.to_string());
            }
            _ => {}
        }
    }
}
