//! Mutation upload connector.
//!
//! Drains a handle's write-ahead queue one transaction at a time. A
//! transaction is acknowledged only after every mutation in it was applied
//! remotely; on failure the whole transaction stays queued and is replayed
//! from the start next time. Upserts and deletes are idempotent and a
//! replayed patch rewrites the same fields, so replay is safe.

use crate::error::SyncResult;
use crate::metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::remote::RemoteBackend;
use crate::tables::TableMap;
use crate::token::TokenProvider;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tasklane_core::{MutationOp, PendingMutation};
use tasklane_db::{LocalDb, PendingTransaction};
use tokio::sync::watch;

/// Whether an upload is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainState {
    Idle,
    Draining,
}

/// Result of one [`UploadConnector::upload_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue was empty.
    Idle,
    /// One transaction was applied and acknowledged.
    Acknowledged {
        tx_id: i64,
        applied: usize,
        skipped: usize,
    },
}

/// Totals for a [`UploadConnector::drain`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub transactions: usize,
    pub applied: usize,
    pub skipped: usize,
}

/// Uploads one handle's queue to its remote backend.
pub struct UploadConnector {
    backend: Arc<dyn RemoteBackend>,
    tokens: Arc<dyn TokenProvider>,
    tables: TableMap,
    token_template: Option<String>,
    metrics: SyncMetrics,
    state: watch::Sender<DrainState>,
    last_error: Mutex<Option<String>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl UploadConnector {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        tokens: Arc<dyn TokenProvider>,
        tables: TableMap,
        token_template: Option<String>,
    ) -> Self {
        let (state, _) = watch::channel(DrainState::Idle);
        Self {
            backend,
            tokens,
            tables,
            token_template,
            metrics: SyncMetrics::default(),
            state,
            last_error: Mutex::new(None),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
        &self.backend
    }

    #[must_use]
    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Message of the most recent failed upload, cleared by the next success.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = error;
    }

    /// Upload and acknowledge the oldest pending transaction.
    ///
    /// Calls are serialized, so a transaction is never uploaded twice
    /// concurrently.
    pub async fn upload_next(&self, db: &LocalDb) -> SyncResult<DrainOutcome> {
        let _in_flight = self.in_flight.lock().await;
        let token = self
            .tokens
            .get_token(self.token_template.as_deref())
            .await?;
        let Some(transaction) = db.next_pending_transaction()? else {
            return Ok(DrainOutcome::Idle);
        };

        self.state.send_replace(DrainState::Draining);
        let result = self.apply(&transaction, token.as_deref()).await;
        self.state.send_replace(DrainState::Idle);

        let (applied, skipped) = match result {
            Ok(counts) => counts,
            Err(err) => {
                self.metrics.record_failure();
                self.set_last_error(Some(err.to_string()));
                tracing::warn!(
                    handle = %db.key(),
                    tx_id = transaction.tx_id,
                    error_code = err.error_code(),
                    error = %err,
                    "upload failed; transaction stays queued"
                );
                return Err(err);
            }
        };

        db.complete(&transaction)?;
        self.set_last_error(None);
        self.metrics
            .record_acknowledged(applied as u64, skipped as u64);
        tracing::debug!(handle = %db.key(), tx_id = transaction.tx_id, applied, skipped, "transaction uploaded");
        Ok(DrainOutcome::Acknowledged {
            tx_id: transaction.tx_id,
            applied,
            skipped,
        })
    }

    /// Upload transactions in FIFO order until the queue is empty.
    ///
    /// Stops at the first failure; earlier transactions stay acknowledged.
    pub async fn drain(&self, db: &LocalDb) -> SyncResult<DrainReport> {
        self.drain_while(db, || true).await
    }

    /// [`Self::drain`], consulting `keep_going` before each transaction.
    ///
    /// A transaction that has started always runs to completion or failure.
    #[tracing::instrument(skip_all, fields(handle = %db.key()))]
    pub async fn drain_while(
        &self,
        db: &LocalDb,
        keep_going: impl Fn() -> bool + Send,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        while keep_going() {
            match self.upload_next(db).await? {
                DrainOutcome::Idle => break,
                DrainOutcome::Acknowledged {
                    applied, skipped, ..
                } => {
                    report.transactions += 1;
                    report.applied += applied;
                    report.skipped += skipped;
                }
            }
        }
        if report.transactions > 0 {
            tracing::info!(
                transactions = report.transactions,
                applied = report.applied,
                skipped = report.skipped,
                "queue drained"
            );
        }
        Ok(report)
    }

    async fn apply(
        &self,
        transaction: &PendingTransaction,
        token: Option<&str>,
    ) -> SyncResult<(usize, usize)> {
        let mut applied = 0;
        let mut skipped = 0;
        for queued in &transaction.mutations {
            let mutation = &queued.mutation;
            let Some(table) = self.tables.resolve(&mutation.table) else {
                tracing::warn!(
                    table = %mutation.table,
                    id = %mutation.record_id,
                    seq = queued.seq,
                    "no remote table for mutation; skipping"
                );
                skipped += 1;
                continue;
            };
            self.apply_one(table, mutation, token).await?;
            applied += 1;
        }
        Ok((applied, skipped))
    }

    async fn apply_one(
        &self,
        table: &str,
        mutation: &PendingMutation,
        token: Option<&str>,
    ) -> SyncResult<()> {
        let id = mutation.record_id.as_str();
        match mutation.op {
            MutationOp::Put => {
                let mut record = mutation.effective_payload()?;
                if let Value::Object(fields) = &mut record {
                    fields
                        .entry("id")
                        .or_insert_with(|| Value::String(id.to_string()));
                }
                self.backend.upsert(table, &record, token).await?;
            }
            MutationOp::Patch => {
                let fields = mutation.effective_payload()?;
                self.backend.update(table, id, &fields, token).await?;
            }
            MutationOp::Delete => {
                self.backend.delete(table, id, token).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for UploadConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConnector")
            .field("tables", &self.tables)
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}
