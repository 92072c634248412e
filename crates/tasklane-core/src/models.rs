//! Data models shared by the routing, queue and reindex layers.
//!
//! Wire shapes follow the embedded database's mutation log: `op`, `table`
//! (or `type`), `id`, and an optional `data` payload. Anything else in a raw
//! record is kept in [`PendingMutation::extra`] so a missing payload can be
//! rebuilt from the record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// =============================================================================
// Tenants
// =============================================================================

/// Opaque tenant ("project") identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where a tenant's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Shared local embedded database, no isolated backend.
    Local,
    /// Tenant-specific embedded database mirrored to an isolated backend.
    Remote,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A tenant as seen by one activation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDescriptor {
    pub id: TenantId,
    pub display_name: String,
    pub routing_mode: RoutingMode,
}

// =============================================================================
// Remote connection config
// =============================================================================

/// Remote endpoint + credential resolved for an allow-listed tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub endpoint_url: String,
    pub credential: String,
    pub backend_api_url: Option<String>,
}

impl RemoteEndpoint {
    /// Bind this endpoint to the tenant it was resolved for.
    #[must_use]
    pub fn into_connection(self, tenant_id: TenantId) -> RemoteConnectionConfig {
        RemoteConnectionConfig {
            tenant_id,
            endpoint_url: self.endpoint_url,
            credential: self.credential,
            backend_api_url: self.backend_api_url,
        }
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("endpoint_url", &self.endpoint_url)
            .field("credential", &"<redacted>")
            .field("backend_api_url", &self.backend_api_url)
            .finish()
    }
}

/// Connection settings for a remote tenant. Lives in memory only.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConnectionConfig {
    pub tenant_id: TenantId,
    pub endpoint_url: String,
    #[serde(serialize_with = "serialize_redacted")]
    pub credential: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_api_url: Option<String>,
}

impl RemoteConnectionConfig {
    /// Base URL for table writes: the backend API when configured, else the endpoint.
    #[must_use]
    pub fn api_base(&self) -> &str {
        self.backend_api_url
            .as_deref()
            .unwrap_or(self.endpoint_url.as_str())
    }
}

impl fmt::Debug for RemoteConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnectionConfig")
            .field("tenant_id", &self.tenant_id)
            .field("endpoint_url", &self.endpoint_url)
            .field("credential", &"<redacted>")
            .field("backend_api_url", &self.backend_api_url)
            .finish()
    }
}

fn serialize_redacted<S: serde::Serializer>(_: &str, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str("<redacted>")
}

// =============================================================================
// Pending mutations
// =============================================================================

/// Kind of local write recorded in the write-ahead queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationOp {
    /// Full record write; upsert by primary key.
    #[serde(rename = "PUT")]
    Put,
    /// Partial update of an existing record.
    #[serde(rename = "PATCH")]
    Patch,
    /// Delete by primary key.
    #[serde(rename = "DELETE")]
    Delete,
}

impl MutationOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only write-ahead entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub op: MutationOp,
    #[serde(alias = "type")]
    pub table: String,
    #[serde(rename = "id")]
    pub record_id: String,
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Raw record fields outside the known shape.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PendingMutation {
    #[must_use]
    pub fn new(
        op: MutationOp,
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            op,
            table: table.into(),
            record_id: record_id.into(),
            payload,
            extra: Map::new(),
        }
    }

    /// Payload to send remotely.
    ///
    /// Uses the inline payload when present; otherwise round-trips the raw
    /// record through JSON and keeps everything but the envelope keys
    /// (`op`, `table`, `type`, `data`). The record id stays in the result.
    pub fn effective_payload(&self) -> serde_json::Result<Value> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone());
        }
        let raw = serde_json::to_string(self)?;
        let mut record: Map<String, Value> = serde_json::from_str(&raw)?;
        for key in ["op", "table", "type", "data"] {
            record.remove(key);
        }
        Ok(Value::Object(record))
    }
}

// =============================================================================
// Health
// =============================================================================

/// Live connection health, owned by one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            last_checked_at: None,
        }
    }
}

// =============================================================================
// Ordering
// =============================================================================

/// Last known position of an item in an ordered collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedItem {
    pub id: String,
    pub sort_order: i64,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl OrderedItem {
    #[must_use]
    pub fn new(id: impl Into<String>, sort_order: i64, group_id: Option<&str>) -> Self {
        Self {
            id: id.into(),
            sort_order,
            group_id: group_id.map(str::to_string),
        }
    }
}

/// Group part of a proposed order update.
///
/// `Keep` is "not changing group" and never counts as a change; `To(None)`
/// explicitly moves the item out of any group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupChange {
    #[default]
    Keep,
    To(Option<String>),
}

impl GroupChange {
    #[must_use]
    pub const fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// Proposed new position (and optionally group) for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    #[serde(rename = "id")]
    pub item_id: String,
    pub sort_order: i64,
    #[serde(
        rename = "groupId",
        default,
        with = "group_change_serde",
        skip_serializing_if = "GroupChange::is_keep"
    )]
    pub group: GroupChange,
}

impl OrderUpdate {
    #[must_use]
    pub fn new(item_id: impl Into<String>, sort_order: i64) -> Self {
        Self {
            item_id: item_id.into(),
            sort_order,
            group: GroupChange::Keep,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group_id: Option<&str>) -> Self {
        self.group = GroupChange::To(group_id.map(str::to_string));
        self
    }
}

mod group_change_serde {
    use super::GroupChange;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &GroupChange, s: S) -> Result<S::Ok, S::Error> {
        match value {
            GroupChange::Keep | GroupChange::To(None) => s.serialize_none(),
            GroupChange::To(Some(group)) => s.serialize_some(group),
        }
    }

    // Only called when the key is present; a missing key falls back to `Keep`.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<GroupChange, D::Error> {
        Option::<String>::deserialize(d).map(GroupChange::To)
    }
}
