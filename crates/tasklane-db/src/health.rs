//! Connection health monitoring.
//!
//! A monitor samples one handle's connection flag at a fixed interval and
//! keeps a [`HealthRecord`]. It only observes: reconnecting is the remote
//! link's job. Transitions are logged once each, never per sample.

use crate::local::DbHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::{Config, HealthRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Consecutive failed samples before the connection counts as unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(tasklane_core::config::DEFAULT_HEALTH_INTERVAL_MS),
            failure_threshold: tasklane_core::config::DEFAULT_HEALTH_FAILURE_THRESHOLD,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            interval: config.health_interval,
            failure_threshold: config.health_failure_threshold,
        }
    }
}

/// A change of the healthy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnhealthy,
    Recovered,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Pure failure counting, independent of any runtime.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    record: HealthRecord,
    threshold: u32,
}

impl HealthTracker {
    /// A threshold of zero is treated as one.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            record: HealthRecord::default(),
            threshold: threshold.max(1),
        }
    }

    /// Fold one sample into the record.
    pub fn observe(&mut self, connected: bool, at: DateTime<Utc>) -> Option<HealthTransition> {
        let was_healthy = self.record.is_healthy;
        if connected {
            self.record.consecutive_failures = 0;
        } else {
            self.record.consecutive_failures = self.record.consecutive_failures.saturating_add(1);
        }
        self.record.is_healthy = self.record.consecutive_failures < self.threshold;
        self.record.last_checked_at = Some(at);

        match (was_healthy, self.record.is_healthy) {
            (true, false) => Some(HealthTransition::BecameUnhealthy),
            (false, true) => Some(HealthTransition::Recovered),
            _ => None,
        }
    }

    #[must_use]
    pub const fn record(&self) -> &HealthRecord {
        &self.record
    }

    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Background sampler for one handle. Aborts its task on drop.
#[derive(Debug)]
pub struct HealthMonitor {
    label: String,
    record: watch::Receiver<HealthRecord>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the sampling task. Must be called inside a tokio runtime.
    ///
    /// The first sample is taken one interval after start. The task holds
    /// only a weak reference and exits once the handle is gone.
    pub fn start(handle: &DbHandle, label: impl Into<String>, config: HealthConfig) -> Self {
        let label = label.into();
        let (tx, rx) = watch::channel(HealthRecord::default());
        let weak = Arc::downgrade(handle);
        let task_label = label.clone();

        let task = tokio::spawn(async move {
            let mut tracker = HealthTracker::new(config.failure_threshold);
            let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(db) = weak.upgrade() else {
                    tracing::debug!(tenant = %task_label, "handle dropped; health monitor exiting");
                    break;
                };
                let connected = db.is_connected();
                drop(db);

                match tracker.observe(connected, Utc::now()) {
                    Some(HealthTransition::BecameUnhealthy) => tracing::warn!(
                        tenant = %task_label,
                        consecutive_failures = tracker.record().consecutive_failures,
                        "connection unhealthy"
                    ),
                    Some(HealthTransition::Recovered) => {
                        tracing::info!(tenant = %task_label, "connection recovered");
                    }
                    None => {}
                }
                tx.send_replace(tracker.record().clone());
            }
        });

        Self {
            label,
            record: rx,
            task,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Latest health record.
    #[must_use]
    pub fn record(&self) -> HealthRecord {
        self.record.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthRecord> {
        self.record.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
