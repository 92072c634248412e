//! Remote backend API and its REST implementation.
//!
//! [`RestBackend`] speaks the PostgREST dialect: tables live under
//! `<api_base>/rest/v1/<table>`, rows are addressed with `?id=eq.<id>`, and
//! errors come back as `{ "code", "message", ... }` JSON bodies.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tasklane_core::RemoteConnectionConfig;
use tracing::instrument;

/// Code PostgREST returns when a single-row request matched nothing.
pub const NO_ROWS_CODE: &str = "PGRST116";

/// Code used when the request never produced an HTTP response.
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";

/// Error reported by a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    /// HTTP status, when there was a response at all.
    pub status: Option<u16>,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn no_rows() -> Self {
        Self::new(NO_ROWS_CODE, "The result contains 0 rows").with_status(406)
    }

    /// Whether retrying the same request cannot help.
    ///
    /// A missing row and client errors are permanent, except for timeouts,
    /// rate limiting and auth failures, which a later attempt with a fresh
    /// token may pass.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        if self.code == NO_ROWS_CODE {
            return true;
        }
        matches!(
            self.status,
            Some(status) if (400..500).contains(&status) && !matches!(status, 401 | 408 | 429)
        )
    }

    /// Build from an error response body, keeping the backend's code when present.
    #[must_use]
    pub fn from_body(status: u16, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let code = field("code").unwrap_or_else(|| format!("HTTP{status}"));
        let message = field("message").unwrap_or_else(|| {
            if body.trim().is_empty() {
                StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.trim().to_string()
            }
        });
        Self::new(code, message).with_status(status)
    }
}

/// Table-level write API of an isolated tenant backend.
///
/// `token` is the bearer token fetched for the current drain; `None` falls
/// back to the tenant credential.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert or replace `record` by primary key.
    async fn upsert(&self, table: &str, record: &Value, token: Option<&str>)
    -> Result<(), RemoteError>;

    /// Update an existing row. A missing row is an error.
    async fn update(
        &self,
        table: &str,
        id: &str,
        fields: &Value,
        token: Option<&str>,
    ) -> Result<(), RemoteError>;

    /// Delete a row. Deleting an absent row succeeds.
    async fn delete(&self, table: &str, id: &str, token: Option<&str>) -> Result<(), RemoteError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Builds a backend for a freshly resolved tenant connection.
pub trait BackendFactory: Send + Sync {
    fn build(
        &self,
        remote: &RemoteConnectionConfig,
    ) -> Result<std::sync::Arc<dyn RemoteBackend>, RemoteError>;
}

/// Factory producing [`RestBackend`]s.
#[derive(Debug, Clone, Copy)]
pub struct RestBackendFactory {
    pub timeout: Duration,
}

impl BackendFactory for RestBackendFactory {
    fn build(
        &self,
        remote: &RemoteConnectionConfig,
    ) -> Result<std::sync::Arc<dyn RemoteBackend>, RemoteError> {
        Ok(std::sync::Arc::new(RestBackend::new(remote, self.timeout)?))
    }
}

// ---------------------------------------------------------------------------
// REST backend
// ---------------------------------------------------------------------------

pub struct RestBackend {
    client: Client,
    rest_base: Url,
    api_key: String,
}

impl RestBackend {
    pub fn new(remote: &RemoteConnectionConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let base = remote.api_base().trim_end_matches('/');
        let rest_base = Url::parse(&format!("{base}/rest/v1/"))
            .map_err(|e| RemoteError::new("INVALID_URL", format!("invalid backend url: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RemoteError::new("CLIENT_INIT", e.to_string()))?;
        Ok(Self {
            client,
            rest_base,
            api_key: remote.credential.clone(),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
        self.rest_base
            .join(table)
            .map_err(|e| RemoteError::new("INVALID_URL", format!("invalid table {table:?}: {e}")))
    }

    fn headers(&self, token: Option<&str>) -> Result<HeaderMap, RemoteError> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            RemoteError::new("INVALID_HEADER", format!("invalid auth header: {e}"))
        };
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(&self.api_key).map_err(invalid)?);
        let bearer = token.unwrap_or(&self.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer}")).map_err(invalid)?,
        );
        Ok(headers)
    }
}

fn transport(e: &reqwest::Error) -> RemoteError {
    RemoteError::new(NETWORK_ERROR_CODE, e.to_string())
}

async fn check(resp: Response) -> Result<Response, RemoteError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::from_body(status, &body))
}

#[async_trait]
impl RemoteBackend for RestBackend {
    #[instrument(name = "rest_upsert", skip(self, record, token))]
    async fn upsert(
        &self,
        table: &str,
        record: &Value,
        token: Option<&str>,
    ) -> Result<(), RemoteError> {
        let resp = self
            .client
            .post(self.table_url(table)?)
            .headers(self.headers(token)?)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        check(resp).await.map(drop)
    }

    #[instrument(name = "rest_update", skip(self, fields, token))]
    async fn update(
        &self,
        table: &str,
        id: &str,
        fields: &Value,
        token: Option<&str>,
    ) -> Result<(), RemoteError> {
        let resp = self
            .client
            .patch(self.table_url(table)?)
            .query(&[("id", format!("eq.{id}"))])
            .headers(self.headers(token)?)
            .header("Prefer", "return=representation")
            .json(fields)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        let rows: Vec<Value> = check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::new("INVALID_RESPONSE", e.to_string()))?;
        if rows.is_empty() {
            return Err(RemoteError::no_rows());
        }
        Ok(())
    }

    #[instrument(name = "rest_delete", skip(self, token))]
    async fn delete(&self, table: &str, id: &str, token: Option<&str>) -> Result<(), RemoteError> {
        let resp = self
            .client
            .delete(self.table_url(table)?)
            .query(&[("id", format!("eq.{id}"))])
            .headers(self.headers(token)?)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await.map(drop)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let resp = self
            .client
            .get(self.rest_base.clone())
            .headers(self.headers(None)?)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        check(resp).await.map(drop)
    }
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("rest_base", &self.rest_base.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::TenantId;

    fn remote(endpoint: &str, api: Option<&str>) -> RemoteConnectionConfig {
        RemoteConnectionConfig {
            tenant_id: TenantId::new("t1"),
            endpoint_url: endpoint.to_string(),
            credential: "anon-key".to_string(),
            backend_api_url: api.map(str::to_string),
        }
    }

    #[test]
    fn error_body_keeps_backend_code() {
        let err = RemoteError::from_body(
            406,
            r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#,
        );
        assert_eq!(err.code, "PGRST116");
        assert_eq!(
            err.message,
            "JSON object requested, multiple (or no) rows returned"
        );
        assert_eq!(err.status, Some(406));
    }

    #[test]
    fn error_body_falls_back_to_status() {
        let err = RemoteError::from_body(502, "");
        assert_eq!(err.code, "HTTP502");
        assert_eq!(err.message, "Bad Gateway");

        let err = RemoteError::from_body(500, "upstream exploded");
        assert_eq!(err.message, "upstream exploded");
    }

    #[test]
    fn table_urls_use_backend_api_when_configured() {
        let backend = RestBackend::new(
            &remote("https://db.example.test/", Some("https://api.example.test")),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            backend.table_url("tasks").unwrap().as_str(),
            "https://api.example.test/rest/v1/tasks"
        );

        let backend =
            RestBackend::new(&remote("https://db.example.test/", None), Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            backend.table_url("tasks").unwrap().as_str(),
            "https://db.example.test/rest/v1/tasks"
        );
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let err = RestBackend::new(&remote("not a url", None), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code, "INVALID_URL");
    }

    #[test]
    fn debug_output_hides_the_credential() {
        let backend =
            RestBackend::new(&remote("https://db.example.test", None), Duration::from_secs(1))
                .unwrap();
        assert!(!format!("{backend:?}").contains("anon-key"));
    }
}
