//! Credential brokering: which tenants get an isolated remote backend.
//!
//! Resolution is a static allow-list lookup. The list of remote tenants and
//! the names of the secrets each one needs are fixed when the broker is
//! built; resolving a key never consults anything but that table and the
//! configured [`KeySource`]. No network I/O happens here.

use crate::config::{Config, EnvKeySource, KeySource, non_blank};
use crate::error::{Error, Result};
use crate::models::{RemoteEndpoint, RoutingMode, TenantDescriptor, TenantId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Tenant keys
// ---------------------------------------------------------------------------

/// Normalization rules for tenant keys.
pub struct TenantKey;

impl TenantKey {
    /// Trim, case-fold and strip all whitespace.
    ///
    /// `"  Acme Corp "` and `"acmecorp"` normalize to the same key.
    #[must_use]
    pub fn normalize(raw: &str) -> String {
        raw.trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    }

    /// Environment-variable stem for a normalized key (`acme-corp` -> `ACME_CORP`).
    #[must_use]
    pub fn env_slug(normalized: &str) -> String {
        normalized
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn validate(raw: &str) -> Result<String> {
        let normalized = Self::normalize(raw);
        if !normalized.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidTenantKey(raw.to_string()));
        }
        Ok(normalized)
    }
}

// ---------------------------------------------------------------------------
// Remote tenant table
// ---------------------------------------------------------------------------

/// Secret names for one allow-listed remote tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTenantEntry {
    pub key: String,
    pub endpoint_var: String,
    pub credential_var: String,
    pub backend_api_var: String,
}

impl RemoteTenantEntry {
    fn for_key(key: String) -> Self {
        let slug = TenantKey::env_slug(&key);
        Self {
            endpoint_var: format!("{slug}_ENDPOINT_URL"),
            credential_var: format!("{slug}_CREDENTIAL"),
            backend_api_var: format!("{slug}_BACKEND_API_URL"),
            key,
        }
    }
}

/// Closed set of tenants allowed to resolve to a remote backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTenantTable {
    entries: BTreeMap<String, RemoteTenantEntry>,
}

impl RemoteTenantTable {
    /// Build and validate the table. Keys are normalized; duplicates collapse.
    pub fn new<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = BTreeMap::new();
        let mut slugs: HashMap<String, String> = HashMap::new();
        for raw in keys {
            let key = TenantKey::validate(raw.as_ref())?;
            let slug = TenantKey::env_slug(&key);
            if let Some(other) = slugs.get(&slug)
                && *other != key
            {
                return Err(Error::config(
                    "TASKLANE_REMOTE_TENANTS",
                    format!("tenants {other:?} and {key:?} share secret prefix {slug}"),
                ));
            }
            slugs.insert(slug, key.clone());
            entries
                .entry(key.clone())
                .or_insert_with(|| RemoteTenantEntry::for_key(key));
        }
        Ok(Self { entries })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.remote_tenants)
    }

    #[must_use]
    pub fn get(&self, normalized_key: &str) -> Option<&RemoteTenantEntry> {
        self.entries.get(normalized_key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Outcome of resolving a tenant key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Local,
    Remote(RemoteEndpoint),
}

impl RouteTarget {
    #[must_use]
    pub const fn mode(&self) -> RoutingMode {
        match self {
            Self::Local => RoutingMode::Local,
            Self::Remote(_) => RoutingMode::Remote,
        }
    }
}

/// Why an allow-listed tenant fell back to local routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerDiagnostic {
    MissingSecrets { missing: Vec<String> },
}

/// Resolves tenant keys to local or remote routing.
pub struct CredentialBroker {
    table: RemoteTenantTable,
    source: Arc<dyn KeySource>,
    diagnostics: Mutex<HashMap<String, BrokerDiagnostic>>,
}

impl CredentialBroker {
    #[must_use]
    pub fn new(table: RemoteTenantTable, source: Arc<dyn KeySource>) -> Self {
        Self {
            table,
            source,
            diagnostics: Mutex::new(HashMap::new()),
        }
    }

    /// Broker reading secrets from the environment, allow-list from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            RemoteTenantTable::from_config(config)?,
            Arc::new(EnvKeySource),
        ))
    }

    /// Broker that routes every tenant locally.
    #[must_use]
    pub fn local_only() -> Self {
        Self::new(RemoteTenantTable::default(), Arc::new(EnvKeySource))
    }

    #[must_use]
    pub const fn table(&self) -> &RemoteTenantTable {
        &self.table
    }

    /// Resolve `tenant_key` (a display name or slug).
    ///
    /// Keys outside the allow-list are local. Allow-listed keys whose
    /// endpoint or credential is missing also resolve local, with a single
    /// warning per key.
    pub fn resolve(&self, tenant_key: &str) -> RouteTarget {
        let key = TenantKey::normalize(tenant_key);
        let Some(entry) = self.table.get(&key) else {
            return RouteTarget::Local;
        };

        let endpoint_url = non_blank(self.source.as_ref(), &entry.endpoint_var);
        let credential = non_blank(self.source.as_ref(), &entry.credential_var);
        match (endpoint_url, credential) {
            (Some(endpoint_url), Some(credential)) => {
                self.clear_diagnostic(&key);
                RouteTarget::Remote(RemoteEndpoint {
                    endpoint_url,
                    credential,
                    backend_api_url: non_blank(self.source.as_ref(), &entry.backend_api_var),
                })
            }
            (endpoint_url, credential) => {
                let mut missing = Vec::new();
                if endpoint_url.is_none() {
                    missing.push(entry.endpoint_var.clone());
                }
                if credential.is_none() {
                    missing.push(entry.credential_var.clone());
                }
                self.record_missing(&key, missing);
                RouteTarget::Local
            }
        }
    }

    /// Build the descriptor for one activation of a tenant.
    pub fn describe(&self, id: TenantId, display_name: &str) -> TenantDescriptor {
        TenantDescriptor {
            id,
            display_name: display_name.to_string(),
            routing_mode: self.resolve(display_name).mode(),
        }
    }

    /// Last diagnostic recorded for `tenant_key`, if it fell back to local.
    #[must_use]
    pub fn diagnose(&self, tenant_key: &str) -> Option<BrokerDiagnostic> {
        let key = TenantKey::normalize(tenant_key);
        self.diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn record_missing(&self, key: &str, missing: Vec<String>) {
        let mut guard = self
            .diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(
            guard.get(key),
            Some(BrokerDiagnostic::MissingSecrets { missing: seen }) if *seen == missing
        ) {
            return;
        }
        tracing::warn!(
            tenant = key,
            missing = ?missing,
            "remote tenant is missing connection secrets; routing locally"
        );
        guard.insert(key.to_string(), BrokerDiagnostic::MissingSecrets { missing });
    }

    fn clear_diagnostic(&self, key: &str) {
        self.diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Server-side administrative keys
// ---------------------------------------------------------------------------

/// Proof that the caller runs in a trusted, server-side process.
///
/// Administrative keys bypass per-user access rules; only server entry
/// points should ever construct this.
#[derive(Debug, Clone, Copy)]
pub struct TrustedContext {
    _private: (),
}

impl TrustedContext {
    #[must_use]
    pub const fn assert_server_side() -> Self {
        Self { _private: () }
    }
}

/// Administrative connection for one tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminKeys {
    pub url: String,
    pub service_key: String,
}

impl std::fmt::Debug for AdminKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminKeys")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .finish()
    }
}

/// Per-tenant admin keys (`<SLUG>_URL`, `<SLUG>_SERVICE_KEY`), read once.
#[derive(Debug, Default)]
pub struct AdminKeyTable {
    keys: HashMap<String, AdminKeys>,
}

impl AdminKeyTable {
    /// Read admin keys for every tenant slug up front.
    ///
    /// Tenants without both keys are simply absent; that is the normal state
    /// for most tenants and not an error.
    pub fn load<I, S>(_ctx: TrustedContext, slugs: I, source: &dyn KeySource) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys = HashMap::new();
        for raw in slugs {
            let key = TenantKey::normalize(raw.as_ref());
            if key.is_empty() {
                continue;
            }
            let slug = TenantKey::env_slug(&key);
            let url = non_blank(source, &format!("{slug}_URL"));
            let service_key = non_blank(source, &format!("{slug}_SERVICE_KEY"));
            if let (Some(url), Some(service_key)) = (url, service_key) {
                keys.insert(key, AdminKeys { url, service_key });
            } else {
                tracing::debug!(tenant = %key, "no admin keys configured");
            }
        }
        Self { keys }
    }

    #[must_use]
    pub fn get(&self, tenant_slug: &str) -> Option<&AdminKeys> {
        self.keys.get(&TenantKey::normalize(tenant_slug))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(pairs: &[(&str, &str)]) -> Arc<dyn KeySource> {
        Arc::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<HashMap<String, String>>(),
        )
    }

    fn broker(keys: &[&str], pairs: &[(&str, &str)]) -> CredentialBroker {
        CredentialBroker::new(RemoteTenantTable::new(keys).unwrap(), secrets(pairs))
    }

    #[test]
    fn normalize_trims_folds_and_strips_whitespace() {
        assert_eq!(TenantKey::normalize("  Acme Corp\t"), "acmecorp");
        assert_eq!(TenantKey::normalize("GLOBEX"), "globex");
        assert_eq!(TenantKey::env_slug("acme-corp"), "ACME_CORP");
    }

    #[test]
    fn unknown_tenant_is_local() {
        let b = broker(&["acme"], &[("ACME_ENDPOINT_URL", "https://a"), ("ACME_CREDENTIAL", "k")]);
        assert_eq!(b.resolve("initech"), RouteTarget::Local);
        assert!(b.diagnose("initech").is_none());
    }

    #[test]
    fn allow_listed_tenant_with_secrets_is_remote() {
        let b = broker(
            &["Acme"],
            &[
                ("ACME_ENDPOINT_URL", "https://acme.sync.example"),
                ("ACME_CREDENTIAL", "anon-key"),
                ("ACME_BACKEND_API_URL", "https://acme.api.example"),
            ],
        );
        let RouteTarget::Remote(endpoint) = b.resolve("  ACME ") else {
            panic!("expected remote routing");
        };
        assert_eq!(endpoint.endpoint_url, "https://acme.sync.example");
        assert_eq!(endpoint.credential, "anon-key");
        assert_eq!(
            endpoint.backend_api_url.as_deref(),
            Some("https://acme.api.example")
        );
    }

    #[test]
    fn missing_secret_degrades_to_local_with_diagnostic() {
        let b = broker(&["acme"], &[("ACME_ENDPOINT_URL", "https://a")]);
        assert_eq!(b.resolve("Acme"), RouteTarget::Local);
        assert_eq!(
            b.diagnose("acme"),
            Some(BrokerDiagnostic::MissingSecrets {
                missing: vec!["ACME_CREDENTIAL".to_string()]
            })
        );
    }

    #[test]
    fn repeated_resolution_keeps_one_diagnostic() {
        let b = broker(&["acme"], &[]);
        for _ in 0..3 {
            assert_eq!(b.resolve("acme"), RouteTarget::Local);
        }
        assert_eq!(
            b.diagnose("ACME"),
            Some(BrokerDiagnostic::MissingSecrets {
                missing: vec![
                    "ACME_ENDPOINT_URL".to_string(),
                    "ACME_CREDENTIAL".to_string()
                ]
            })
        );
    }

    #[test]
    fn blank_secret_counts_as_missing() {
        let b = broker(&["acme"], &[("ACME_ENDPOINT_URL", "  "), ("ACME_CREDENTIAL", "k")]);
        assert_eq!(b.resolve("acme"), RouteTarget::Local);
    }

    #[test]
    fn describe_derives_routing_from_display_name() {
        let b = broker(&["acme"], &[("ACME_ENDPOINT_URL", "https://a"), ("ACME_CREDENTIAL", "k")]);
        let d = b.describe(TenantId::from("p-1"), "Acme");
        assert_eq!(d.routing_mode, RoutingMode::Remote);
        let d = b.describe(TenantId::from("p-2"), "Someone Else");
        assert_eq!(d.routing_mode, RoutingMode::Local);
    }

    #[test]
    fn table_rejects_keys_without_alphanumerics() {
        assert!(matches!(
            RemoteTenantTable::new(["   "]),
            Err(Error::InvalidTenantKey(_))
        ));
    }

    #[test]
    fn table_rejects_slug_collisions() {
        assert!(RemoteTenantTable::new(["acme-corp", "acme_corp"]).is_err());
        let table = RemoteTenantTable::new(["Acme", "acme", " ACME "]).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn admin_keys_absent_is_none_not_error() {
        let source: HashMap<String, String> = [
            ("ACME_URL".to_string(), "https://acme.admin".to_string()),
            ("ACME_SERVICE_KEY".to_string(), "svc".to_string()),
            ("GLOBEX_URL".to_string(), "https://globex.admin".to_string()),
        ]
        .into_iter()
        .collect();
        let table = AdminKeyTable::load(
            TrustedContext::assert_server_side(),
            ["acme", "globex", "initech"],
            &source,
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("Acme").unwrap().service_key, "svc");
        assert!(table.get("globex").is_none());
        assert!(table.get("initech").is_none());
        assert!(!format!("{:?}", table.get("acme").unwrap()).contains("svc"));
    }
}
