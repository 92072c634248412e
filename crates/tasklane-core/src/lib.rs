//! Core types, configuration and pure routing logic for Tasklane
//!
//! This crate provides:
//! - Configuration management (`Config`, environment + `.env` parsing)
//! - Data models (`TenantDescriptor`, `PendingMutation`, `HealthRecord`, ...)
//! - The credential broker deciding local vs. remote routing per tenant
//! - The order reindexer used to minimize writes after a reorder
//! - Common error types

#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod models;
pub mod reindex;

// Re-export key types for convenience
pub use config::{Config, EnvKeySource, KeySource};
pub use credentials::{
    AdminKeyTable, AdminKeys, BrokerDiagnostic, CredentialBroker, RemoteTenantEntry,
    RemoteTenantTable, RouteTarget, TenantKey, TrustedContext,
};
pub use error::{Error as CoreError, Result as CoreResult};
pub use models::{
    GroupChange, HealthRecord, MutationOp, OrderUpdate, OrderedItem, PendingMutation,
    RemoteConnectionConfig, RemoteEndpoint, RoutingMode, TenantDescriptor, TenantId,
};
