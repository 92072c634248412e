//! Embedded database handle with a write-ahead mutation queue.
//!
//! Every local write is applied to the `records` table and appended to the
//! queue inside one `SQLite` transaction, so the queue can never disagree
//! with local state. Writes made inside [`LocalDb::write_transaction`] share
//! one queue transaction and are later acknowledged together.
//!
//! The handle also carries the connection flag that the remote link drives
//! and the health monitor samples. Opening a handle never touches the
//! network.

use crate::error::{DbError, DbResult};
use crate::schema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tasklane_core::{MutationOp, PendingMutation, TenantId};
use tokio::sync::{Notify, watch};

/// Shared pointer to a live embedded database.
pub type DbHandle = Arc<LocalDb>;

/// Cache key of a handle: the shared local store or one tenant's store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleKey {
    Shared,
    Tenant(TenantId),
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Tenant(id) => write!(f, "tenant:{id}"),
        }
    }
}

/// Connection state as reported by the attached remote link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A remote link attached to a handle; closed on eviction or teardown.
#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Signal background work to stop. An upload already in flight is not
    /// interrupted.
    fn close(&self);

    /// Resolves once the work stopped by [`Self::close`] has finished.
    async fn closed(&self) {}
}

/// One queued mutation with its queue position.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
    pub seq: i64,
    pub mutation: PendingMutation,
}

/// The unit drained from the queue and acknowledged atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    pub tx_id: i64,
    pub mutations: Vec<QueuedMutation>,
}

impl PendingTransaction {
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    fn last_seq(&self) -> i64 {
        self.mutations.last().map_or(0, |m| m.seq)
    }
}

/// Options applied when opening a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDbOptions {
    /// Upper bound on mutations in one local write transaction.
    pub max_transaction_mutations: usize,
}

impl Default for LocalDbOptions {
    fn default() -> Self {
        Self {
            max_transaction_mutations: tasklane_core::config::DEFAULT_MAX_TRANSACTION_MUTATIONS,
        }
    }
}

/// Embedded database handle.
pub struct LocalDb {
    key: HandleKey,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    options: LocalDbOptions,
    status: watch::Sender<ConnectionStatus>,
    changes: Arc<Notify>,
    link: Mutex<Option<Box<dyn RemoteLink>>>,
}

impl LocalDb {
    /// Open (creating if needed) a file-backed handle.
    pub fn open(path: &Path, key: HandleKey, options: LocalDbOptions) -> DbResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, key, Some(path.to_path_buf()), options)
    }

    /// Open an in-memory handle (tests, ephemeral tenants).
    pub fn open_memory(key: HandleKey, options: LocalDbOptions) -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?, key, None, options)
    }

    fn init(
        conn: Connection,
        key: HandleKey,
        path: Option<PathBuf>,
        options: LocalDbOptions,
    ) -> DbResult<Self> {
        if options.max_transaction_mutations == 0 {
            return Err(DbError::invalid(
                "max_transaction_mutations",
                "must be greater than zero",
            ));
        }
        conn.execute_batch(schema::PRAGMA_DB_INIT_SQL)?;
        conn.execute_batch(schema::INIT_SCHEMA_SQL)?;
        let (status, _) = watch::channel(ConnectionStatus::default());
        Ok(Self {
            key,
            path,
            conn: Mutex::new(conn),
            options,
            status,
            changes: Arc::new(Notify::new()),
            link: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn key(&self) -> &HandleKey {
        &self.key
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------------

    /// Execute raw SQL. Does not enqueue anything.
    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        Ok(self.conn().execute(sql, params)?)
    }

    /// Run a read closure against the underlying connection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> DbResult<T> {
        Ok(f(&self.conn())?)
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    /// Write a full record and enqueue a `PUT`. Returns the queue transaction id.
    pub fn put(&self, table: &str, id: &str, data: Value) -> DbResult<i64> {
        self.write_transaction(|batch| batch.put(table, id, data))
            .map(|((), tx_id)| tx_id)
    }

    /// Merge fields into an existing record and enqueue a `PATCH`.
    pub fn patch(&self, table: &str, id: &str, data: Value) -> DbResult<i64> {
        self.write_transaction(|batch| batch.patch(table, id, data))
            .map(|((), tx_id)| tx_id)
    }

    /// Delete a record (absent is fine) and enqueue a `DELETE`.
    pub fn delete(&self, table: &str, id: &str) -> DbResult<i64> {
        self.write_transaction(|batch| batch.delete(table, id))
            .map(|((), tx_id)| tx_id)
    }

    /// Group several writes into one queue transaction.
    ///
    /// Either every write and its queue entry commits, or none does. Returns
    /// the closure's value and the queue transaction id. A batch with no
    /// writes is rolled back and rejected, so no id is ever handed out for
    /// an empty transaction.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut WriteBatch<'_>) -> DbResult<T>,
    ) -> DbResult<(T, i64)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO pending_transactions (created_at) VALUES (?1)",
            params![Utc::now().to_rfc3339()],
        )?;
        let tx_id = tx.last_insert_rowid();
        let (value, written) = {
            let mut batch = WriteBatch {
                tx,
                tx_id,
                written: 0,
                limit: self.options.max_transaction_mutations,
            };
            let value = f(&mut batch)?;
            let WriteBatch { tx, written, .. } = batch;
            if written == 0 {
                // Dropping the transaction frees the id for the next batch.
                tx.rollback()?;
                return Err(DbError::invalid("transaction", "no mutations written"));
            }
            tx.commit()?;
            (value, written)
        };
        drop(conn);
        tracing::debug!(handle = %self.key, tx_id, written, "local write committed");
        self.changes.notify_one();
        Ok((value, tx_id))
    }

    /// Read one record.
    pub fn get(&self, table: &str, id: &str) -> DbResult<Option<Value>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT data FROM records WHERE table_name = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(DbError::from))
            .transpose()
    }

    /// All records of a table, ordered by id.
    pub fn list(&self, table: &str) -> DbResult<Vec<(String, Value)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, data FROM records WHERE table_name = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            out.push((id, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Write-ahead queue
    // -----------------------------------------------------------------------

    /// Oldest pending transaction, if any.
    pub fn next_pending_transaction(&self) -> DbResult<Option<PendingTransaction>> {
        let conn = self.conn();
        let tx_id: Option<i64> = conn
            .query_row(
                "SELECT tx_id FROM pending_mutations ORDER BY seq LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(tx_id) = tx_id else {
            return Ok(None);
        };
        let mutations = load_transaction(&conn, tx_id)?;
        Ok(Some(PendingTransaction { tx_id, mutations }))
    }

    /// Every pending transaction in FIFO order.
    pub fn pending_transactions(&self) -> DbResult<Vec<PendingTransaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT tx_id FROM pending_mutations ORDER BY tx_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.into_iter()
            .map(|tx_id| {
                Ok(PendingTransaction {
                    tx_id,
                    mutations: load_transaction(&conn, tx_id)?,
                })
            })
            .collect()
    }

    /// Acknowledge a drained transaction, removing all of its entries at once.
    pub fn complete(&self, transaction: &PendingTransaction) -> DbResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM pending_mutations WHERE tx_id = ?1 AND seq <= ?2",
            params![transaction.tx_id, transaction.last_seq()],
        )?;
        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM pending_mutations WHERE tx_id = ?1",
            params![transaction.tx_id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            tx.execute(
                "DELETE FROM pending_transactions WHERE tx_id = ?1",
                params![transaction.tx_id],
            )?;
        }
        tx.commit()?;
        tracing::debug!(handle = %self.key, tx_id = transaction.tx_id, removed, "transaction acknowledged");
        Ok(())
    }

    /// Number of queued mutations.
    pub fn pending_count(&self) -> DbResult<usize> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| {
                    row.get(0)
                })?;
        usize::try_from(count).map_err(|_| DbError::Internal("negative queue length".into()))
    }

    /// Change notifier fired after every committed local write.
    #[must_use]
    pub fn changes(&self) -> Arc<Notify> {
        Arc::clone(&self.changes)
    }

    // -----------------------------------------------------------------------
    // Connection state
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Mark the remote connection up.
    pub fn mark_connected(&self) {
        self.status.send_modify(|status| {
            status.connected = true;
            status.last_connected_at = Some(Utc::now());
            status.last_error = None;
        });
    }

    /// Mark the remote connection down, keeping the reason.
    pub fn mark_disconnected(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status.send_modify(|status| {
            status.connected = false;
            status.last_error = Some(reason);
        });
    }

    /// Attach the live link, closing any previous one.
    pub fn attach_link(&self, link: Box<dyn RemoteLink>) {
        let previous = self
            .link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(link);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Close and drop the attached link, if any.
    pub fn close_link(&self) {
        let link = self
            .link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            link.close();
            self.mark_disconnected("link closed");
        }
    }

    /// Close the attached link and wait for its background work to end.
    pub async fn shutdown_link(&self) {
        let link = self
            .link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            link.close();
            self.mark_disconnected("link closed");
            link.closed().await;
        }
    }

    #[must_use]
    pub fn has_link(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for LocalDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDb")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Drop for LocalDb {
    fn drop(&mut self) {
        if let Some(link) = self
            .link
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            link.close();
        }
    }
}

fn load_transaction(conn: &Connection, tx_id: i64) -> DbResult<Vec<QueuedMutation>> {
    let mut stmt =
        conn.prepare("SELECT seq, data FROM pending_mutations WHERE tx_id = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![tx_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, raw) = row?;
        out.push(QueuedMutation {
            seq,
            mutation: serde_json::from_str(&raw)?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Write batch
// ---------------------------------------------------------------------------

/// Writes staged inside one queue transaction.
pub struct WriteBatch<'conn> {
    tx: Transaction<'conn>,
    tx_id: i64,
    written: usize,
    limit: usize,
}

impl WriteBatch<'_> {
    #[must_use]
    pub const fn tx_id(&self) -> i64 {
        self.tx_id
    }

    pub fn put(&mut self, table: &str, id: &str, data: Value) -> DbResult<()> {
        validate_target(table, id)?;
        if !data.is_object() {
            return Err(DbError::invalid("data", "PUT payload must be a JSON object"));
        }
        self.store(table, id, &data)?;
        self.enqueue(PendingMutation::new(MutationOp::Put, table, id, Some(data)))
    }

    pub fn patch(&mut self, table: &str, id: &str, data: Value) -> DbResult<()> {
        validate_target(table, id)?;
        let Value::Object(fields) = data else {
            return Err(DbError::invalid("data", "PATCH payload must be a JSON object"));
        };
        let current: Option<String> = self
            .tx
            .query_row(
                "SELECT data FROM records WHERE table_name = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(DbError::not_found("Record", format!("{table}/{id}")));
        };
        let mut merged: Map<String, Value> = serde_json::from_str(&current)?;
        for (key, value) in &fields {
            merged.insert(key.clone(), value.clone());
        }
        self.store(table, id, &Value::Object(merged))?;
        self.enqueue(PendingMutation::new(
            MutationOp::Patch,
            table,
            id,
            Some(Value::Object(fields)),
        ))
    }

    pub fn delete(&mut self, table: &str, id: &str) -> DbResult<()> {
        validate_target(table, id)?;
        self.tx.execute(
            "DELETE FROM records WHERE table_name = ?1 AND id = ?2",
            params![table, id],
        )?;
        self.enqueue(PendingMutation::new(MutationOp::Delete, table, id, None))
    }

    /// Append a raw mutation record without touching local records.
    ///
    /// Used when replaying a mutation log produced elsewhere.
    pub fn enqueue(&mut self, mutation: PendingMutation) -> DbResult<()> {
        if self.written >= self.limit {
            return Err(DbError::invalid(
                "transaction",
                format!("more than {} mutations in one write transaction", self.limit),
            ));
        }
        self.tx.execute(
            "INSERT INTO pending_mutations (tx_id, data) VALUES (?1, ?2)",
            params![self.tx_id, serde_json::to_string(&mutation)?],
        )?;
        self.written += 1;
        Ok(())
    }

    fn store(&self, table: &str, id: &str, data: &Value) -> DbResult<()> {
        self.tx.execute(
            "INSERT INTO records (table_name, id, data, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(table_name, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![table, id, serde_json::to_string(data)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn validate_target(table: &str, id: &str) -> DbResult<()> {
    if table.trim().is_empty() {
        return Err(DbError::invalid("table", "table name must not be empty"));
    }
    if id.trim().is_empty() {
        return Err(DbError::invalid("id", "record id must not be empty"));
    }
    Ok(())
}
