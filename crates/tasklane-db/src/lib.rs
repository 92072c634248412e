//! Database layer for Tasklane
//!
//! This crate provides:
//! - Embedded `SQLite` handles (`LocalDb`) with a write-ahead mutation queue
//! - The database router (`DbRegistry`) caching one handle per key
//! - Connection health monitoring
//! - Exponential backoff for drain retries

#![forbid(unsafe_code)]

pub mod error;
pub mod health;
pub mod local;
pub mod retry;
pub mod router;
pub mod schema;

pub use error::{DbError, DbResult};
pub use health::{HealthConfig, HealthMonitor, HealthTracker, HealthTransition};
pub use local::{
    ConnectionStatus, DbHandle, HandleKey, LocalDb, LocalDbOptions, PendingTransaction,
    QueuedMutation, RemoteLink, WriteBatch,
};
pub use retry::RetryConfig;
pub use router::{Connector, DbRegistry, OfflineConnector, RouterConfig, tenant_file_name};
