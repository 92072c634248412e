//! Error types for Tasklane core
//!
//! Core operations are pure lookups and computations; errors here are
//! validation and configuration failures, never transport failures.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tasklane core
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Invalid tenant key: {0:?}. Must contain at least one alphanumeric character")]
    InvalidTenantKey(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    #[error("Invalid configuration value for {key}: {message}")]
    Config { key: String, message: String },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error for `key`.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTenantKey(_) => "INVALID_TENANT_KEY",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::ItemNotFound(_) => "NOT_FOUND",
            Self::Config { .. } => "CONFIGURATION_ERROR",
            Self::Io(_) | Self::Serialization(_) => "INTERNAL_ERROR",
        }
    }
}
