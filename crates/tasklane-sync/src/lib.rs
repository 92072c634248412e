//! Sync layer for Tasklane
//!
//! This crate provides:
//! - The mutation upload connector draining a handle's queue to a remote
//! - A per-handle drain scheduler with coalesced triggers and backoff
//! - The remote backend trait and its PostgREST client
//! - Remote links that keep each handle's connection flag current
//! - `SyncContext`, which activates tenants and tears everything down

#![forbid(unsafe_code)]

pub mod connector;
pub mod context;
pub mod error;
pub mod link;
pub mod metrics;
pub mod remote;
pub mod scheduler;
pub mod tables;
pub mod token;

pub use connector::{DrainOutcome, DrainReport, DrainState, UploadConnector};
pub use context::{SyncContext, SyncStatus, TenantSession};
pub use error::{SyncError, SyncResult};
pub use link::{SyncConnector, SyncSettings};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use remote::{
    BackendFactory, NO_ROWS_CODE, RemoteBackend, RemoteError, RestBackend, RestBackendFactory,
};
pub use scheduler::DrainScheduler;
pub use tables::TableMap;
pub use token::{EnvTokenProvider, StaticTokenProvider, TokenProvider};
