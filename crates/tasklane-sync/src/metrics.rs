//! Upload counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by a connector and its observers.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    transactions_acknowledged: AtomicU64,
    mutations_applied: AtomicU64,
    mutations_skipped: AtomicU64,
    drain_failures: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetricsSnapshot {
    pub transactions_acknowledged: u64,
    pub mutations_applied: u64,
    pub mutations_skipped: u64,
    pub drain_failures: u64,
}

impl SyncMetrics {
    pub(crate) fn record_acknowledged(&self, applied: u64, skipped: u64) {
        self.transactions_acknowledged.fetch_add(1, Ordering::Relaxed);
        self.mutations_applied.fetch_add(applied, Ordering::Relaxed);
        self.mutations_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.drain_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            transactions_acknowledged: self.transactions_acknowledged.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_skipped: self.mutations_skipped.load(Ordering::Relaxed),
            drain_failures: self.drain_failures.load(Ordering::Relaxed),
        }
    }
}
