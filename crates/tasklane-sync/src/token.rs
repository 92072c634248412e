//! Bearer token providers.
//!
//! The connector asks for a token at the start of every upload so rotated
//! credentials take effect on the next drain.

use crate::error::SyncResult;
use async_trait::async_trait;
use tasklane_core::TenantKey;

/// Supplies the bearer token used for remote writes.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token for `template`, or `None` to fall back to the tenant
    /// credential.
    async fn get_token(&self, template: Option<&str>) -> SyncResult<Option<String>>;
}

/// Always returns the same token.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider(Option<String>);

impl StaticTokenProvider {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Provider that never has a token.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _template: Option<&str>) -> SyncResult<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Reads the token from the environment (with `.env` fallback) on every call.
///
/// With a template, `<PREFIX>_<TEMPLATE>` is tried before `<PREFIX>`.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    prefix: String,
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self {
            prefix: "TASKLANE_TOKEN".to_string(),
        }
    }
}

impl EnvTokenProvider {
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn candidates(&self, template: Option<&str>) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(template) = template {
            let slug = TenantKey::env_slug(&TenantKey::normalize(template));
            if !slug.is_empty() {
                keys.push(format!("{}_{slug}", self.prefix));
            }
        }
        keys.push(self.prefix.clone());
        keys
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn get_token(&self, template: Option<&str>) -> SyncResult<Option<String>> {
        Ok(self
            .candidates(template)
            .iter()
            .find_map(|key| tasklane_core::config::env_value(key).filter(|v| !v.trim().is_empty())))
    }
}
