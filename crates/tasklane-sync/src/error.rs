//! Error types for the sync layer

use crate::remote::RemoteError;
use tasklane_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote backend rejected a write. `code` and `message` are the
    /// backend's own, unmodified.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        status: Option<u16>,
        /// Replaying the same write cannot succeed.
        permanent: bool,
    },

    #[error("Token provider failed: {0}")]
    Token(String),

    #[error("Invalid remote configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether leaving the batch queued and retrying later can help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { permanent, .. } => !permanent,
            Self::Token(_) => true,
            Self::Db(e) => e.is_retryable(),
            Self::Config(_) | Self::Serialization(_) => false,
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &str {
        match self {
            Self::Remote { code, .. } => code,
            Self::Token(_) => "TOKEN_UNAVAILABLE",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Db(e) => e.error_code(),
            Self::Serialization(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        let permanent = e.is_permanent();
        Self::Remote {
            code: e.code,
            message: e.message,
            status: e.status,
            permanent,
        }
    }
}

impl From<SyncError> for DbError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Db(inner) => inner,
            other => Self::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_backend_code_verbatim() {
        let err: SyncError = RemoteError::new("PGRST116", "The result contains 0 rows").into();
        assert_eq!(err.error_code(), "PGRST116");
        assert_eq!(err.to_string(), "Remote error PGRST116: The result contains 0 rows");
    }

    #[test]
    fn retryability_follows_the_remote_failure_kind() {
        let retryable = |e: RemoteError| SyncError::from(e).is_retryable();
        assert!(!retryable(RemoteError::no_rows()));
        assert!(!retryable(RemoteError::new("PGRST116", "no rows")));
        assert!(!retryable(RemoteError::from_body(400, r#"{"code":"22P02","message":"bad"}"#)));
        assert!(!retryable(RemoteError::from_body(409, "")));
        assert!(retryable(RemoteError::from_body(429, "")));
        assert!(retryable(RemoteError::from_body(401, "")));
        assert!(retryable(RemoteError::from_body(503, "")));
        assert!(retryable(RemoteError::new("NETWORK_ERROR", "connection refused")));
    }

    #[test]
    fn config_errors_are_not_retryable() {
        let err = SyncError::Config("bad url".into());
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn converts_into_connection_error() {
        let db: DbError = SyncError::Token("expired".into()).into();
        assert_eq!(db.error_code(), "CONNECTION_FAILED");
    }
}
