//! Local schema: a JSON record store plus the write-ahead mutation queue.
//!
//! `pending_transactions.tx_id` is `AUTOINCREMENT` so a transaction id is
//! never reused, even after the queue has been fully drained. Completing a
//! stale transaction object can therefore never delete newer entries.

/// Connection-level PRAGMAs applied on open.
pub const PRAGMA_DB_INIT_SQL: &str = "\
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;
";

/// Idempotent schema creation.
pub const INIT_SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, id)
);

CREATE TABLE IF NOT EXISTS pending_transactions (
    tx_id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL REFERENCES pending_transactions(tx_id) ON DELETE CASCADE,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_tx ON pending_mutations(tx_id, seq);
";
