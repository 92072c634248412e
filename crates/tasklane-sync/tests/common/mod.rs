//! In-memory remote backend with failure injection.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasklane_core::{CredentialBroker, RemoteConnectionConfig, RemoteTenantTable};
use tasklane_sync::{
    BackendFactory, RemoteBackend, RemoteError, StaticTokenProvider, TokenProvider,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub table: String,
    pub id: String,
    pub token: Option<String>,
}

#[derive(Default)]
pub struct FakeBackend {
    rows: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    calls: Mutex<Vec<Call>>,
    writes: AtomicUsize,
    fail_at: Mutex<Option<(usize, RemoteError)>>,
    unreachable: AtomicBool,
    latency: Mutex<Duration>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the `n`-th write from now (0-based) fail once with `err`.
    pub fn fail_write(&self, n: usize, err: RemoteError) {
        let at = self.writes.load(Ordering::SeqCst) + n;
        *self.fail_at.lock().unwrap() = Some((at, err));
    }

    /// Delay every write by `latency` before it reaches the table.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    async fn settle(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .and_then(|t| t.get(id))
            .cloned()
    }

    pub fn insert_row(&self, table: &str, id: &str, value: Value) {
        self.rows
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), value);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn begin(&self, op: &'static str, table: &str, id: &str, token: Option<&str>) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::new("NETWORK_ERROR", "connection refused"));
        }
        let index = self.writes.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            op,
            table: table.to_string(),
            id: id.to_string(),
            token: token.map(str::to_string),
        });
        let mut fail_at = self.fail_at.lock().unwrap();
        if fail_at.as_ref().is_some_and(|(at, _)| *at == index) {
            let (_, err) = fail_at.take().unwrap();
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for FakeBackend {
    async fn upsert(&self, table: &str, record: &Value, token: Option<&str>) -> Result<(), RemoteError> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.settle().await;
        self.begin("upsert", table, &id, token)?;
        self.insert_row(table, &id, record.clone());
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        fields: &Value,
        token: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.settle().await;
        self.begin("update", table, id, token)?;
        let mut rows = self.rows.lock().unwrap();
        let Some(Value::Object(row)) = rows.get_mut(table).and_then(|t| t.get_mut(id)) else {
            return Err(RemoteError::no_rows());
        };
        if let Value::Object(fields) = fields {
            for (key, value) in fields {
                row.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str, token: Option<&str>) -> Result<(), RemoteError> {
        self.settle().await;
        self.begin("delete", table, id, token)?;
        if let Some(rows) = self.rows.lock().unwrap().get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::new("NETWORK_ERROR", "connection refused"));
        }
        Ok(())
    }
}

/// Factory handing out the same fake for every tenant.
pub struct FakeFactory(pub Arc<FakeBackend>);

impl BackendFactory for FakeFactory {
    fn build(&self, _remote: &RemoteConnectionConfig) -> Result<Arc<dyn RemoteBackend>, RemoteError> {
        Ok(Arc::clone(&self.0) as Arc<dyn RemoteBackend>)
    }
}

/// Token provider returning `tok-1`, `tok-2`, ... on successive calls.
#[derive(Default)]
pub struct CountingTokens(AtomicUsize);

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn get_token(&self, _template: Option<&str>) -> tasklane_sync::SyncResult<Option<String>> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("tok-{n}")))
    }
}

pub fn static_tokens() -> Arc<dyn TokenProvider> {
    Arc::new(StaticTokenProvider::new("test-token"))
}

/// Broker with `acme` allow-listed and fully configured.
pub fn acme_broker() -> Arc<CredentialBroker> {
    let table = RemoteTenantTable::new(["acme"]).unwrap();
    let source: HashMap<String, String> = [
        ("ACME_ENDPOINT_URL", "https://acme.example.test"),
        ("ACME_CREDENTIAL", "anon-key"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    Arc::new(CredentialBroker::new(table, Arc::new(source)))
}

pub fn object(pairs: &[(&str, Value)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect::<Map<String, Value>>(),
    )
}
