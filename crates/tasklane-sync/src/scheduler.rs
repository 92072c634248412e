//! Drain scheduling: at most one drain in flight per handle.
//!
//! Local writes and explicit triggers wake the scheduler through
//! [`tokio::sync::Notify`], which stores at most one permit, so any number
//! of triggers during a drain collapse into a single rerun. A failed drain
//! is retried with exponential backoff while the handle stays connected.
//!
//! Stopping is cooperative. The stop flag is read between transactions, so a
//! transaction that is being uploaded finishes (or fails) before the task
//! exits.

use crate::connector::UploadConnector;
use std::sync::{Arc, Weak};
use tasklane_db::{DbHandle, LocalDb, RetryConfig};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct DrainScheduler {
    trigger: Arc<Notify>,
    stop: watch::Sender<bool>,
    /// Never written; the task drops its sender on exit.
    finished: watch::Receiver<()>,
    task: JoinHandle<()>,
}

impl DrainScheduler {
    /// Spawn the scheduling task. Must be called inside a tokio runtime.
    ///
    /// The task keeps only a weak reference to the handle.
    pub fn start(db: &DbHandle, connector: Arc<UploadConnector>, retry: RetryConfig) -> Self {
        let trigger = Arc::new(Notify::new());
        let (stop, stop_rx) = watch::channel(false);
        let (done, finished) = watch::channel(());
        let task = tokio::spawn({
            let run = run(
                Arc::downgrade(db),
                db.changes(),
                Arc::clone(&trigger),
                stop_rx,
                connector,
                retry,
            );
            async move {
                let _done = done;
                run.await;
            }
        });
        Self {
            trigger,
            stop,
            finished,
            task,
        }
    }

    /// Request a drain. Coalesces with any pending request.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// The notifier behind [`Self::trigger`], for tasks that outlive a borrow.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Ask the task to exit after the transaction in flight, if any.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until the task has exited.
    pub async fn stopped(&self) {
        let mut finished = self.finished.clone();
        while finished.changed().await.is_ok() {}
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for DrainScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    db: Weak<LocalDb>,
    changes: Arc<Notify>,
    trigger: Arc<Notify>,
    mut stop: watch::Receiver<bool>,
    connector: Arc<UploadConnector>,
    retry: RetryConfig,
) {
    let mut failures: u32 = 0;
    loop {
        if failures == 0 {
            tokio::select! {
                () = stop_requested(&mut stop) => break,
                () = changes.notified() => {}
                () = trigger.notified() => {}
            }
        } else {
            tokio::select! {
                () = stop_requested(&mut stop) => break,
                () = tokio::time::sleep(retry.delay_for_attempt(failures - 1)) => {}
            }
        }

        let Some(db) = db.upgrade() else {
            tracing::debug!("handle dropped; drain scheduler exiting");
            break;
        };
        if !db.is_connected() {
            // Connecting triggers a fresh drain.
            failures = 0;
            continue;
        }

        match connector.drain_while(&db, || !*stop.borrow()).await {
            Ok(_) => failures = 0,
            Err(err) if err.is_retryable() => {
                failures = failures.saturating_add(1);
                tracing::debug!(handle = %db.key(), failures, error = %err, "drain will be retried");
            }
            Err(err) => {
                failures = 0;
                tracing::error!(
                    handle = %db.key(),
                    error_code = err.error_code(),
                    error = %err,
                    "drain failed permanently; waiting for next trigger"
                );
            }
        }
    }
    tracing::debug!("drain scheduler stopped");
}

/// Resolves once stop is set or the scheduler is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
