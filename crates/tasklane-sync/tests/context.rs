//! End-to-end activation: routing, background drains, reconnects, status.

mod common;

use common::{FakeBackend, FakeFactory, acme_broker, static_tokens};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::{RoutingMode, TenantId};
use tasklane_db::{HealthConfig, RetryConfig, RouterConfig};
use tasklane_sync::{SyncConnector, SyncContext, SyncSettings, SyncStatus, TableMap};

const TICK: Duration = Duration::from_secs(1);

fn context(backend: &Arc<FakeBackend>) -> SyncContext {
    let settings = SyncSettings {
        retry: RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        reconnect_interval: TICK,
        tables: TableMap::passthrough(),
        token_template: None,
    };
    let sync = Arc::new(SyncConnector::new(
        settings,
        Arc::new(FakeFactory(Arc::clone(backend))),
        static_tokens(),
    ));
    SyncContext::new(
        RouterConfig::in_memory(),
        acme_broker(),
        sync,
        HealthConfig {
            interval: TICK,
            failure_threshold: 3,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn local_writes_reach_the_remote_in_the_background() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();
    assert_eq!(session.descriptor().routing_mode, RoutingMode::Remote);
    assert!(session.handle().is_connected());

    session
        .handle()
        .put("tasks", "t1", json!({"title": "hello"}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.handle().pending_count().unwrap(), 0);
    assert_eq!(
        backend.row("tasks", "t1"),
        Some(json!({"id": "t1", "title": "hello"}))
    );
    assert_eq!(session.status(), SyncStatus::Healthy);
    ctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_queues_then_recovers() {
    let backend = FakeBackend::new();
    backend.set_reachable(false);
    let ctx = context(&backend);

    let session = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();
    assert!(!session.handle().is_connected());
    session
        .handle()
        .put("tasks", "t1", json!({"title": "offline"}))
        .unwrap();

    tokio::time::sleep(TICK * 3 + Duration::from_millis(100)).await;
    assert_eq!(session.handle().pending_count().unwrap(), 1);
    let health = session.health().unwrap();
    assert!(!health.is_healthy);
    assert_eq!(session.status(), SyncStatus::Error);

    backend.set_reachable(true);
    tokio::time::sleep(TICK * 2).await;
    assert!(session.handle().is_connected());
    assert_eq!(session.handle().pending_count().unwrap(), 0);
    assert!(backend.row("tasks", "t1").is_some());
    assert!(session.health().unwrap().is_healthy);
    assert_eq!(session.status(), SyncStatus::Healthy);

    ctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn failed_drain_is_retried_with_backoff() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();

    backend.fail_write(0, tasklane_sync::RemoteError::new("HTTP500", "boom"));
    session.handle().put("tasks", "t1", json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.handle().pending_count().unwrap(), 1);
    assert_eq!(session.status(), SyncStatus::Error);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.handle().pending_count().unwrap(), 0);
    assert_eq!(session.status(), SyncStatus::Healthy);
    let upload = session.upload_connector().unwrap();
    assert_eq!(upload.metrics().drain_failures, 1);
    assert_eq!(upload.metrics().transactions_acknowledged, 1);

    ctx.teardown();
}

#[tokio::test]
async fn local_tenants_have_no_remote_machinery() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ctx.activate(TenantId::new("t-x"), "Someone Else").await.unwrap();
    assert_eq!(session.descriptor().routing_mode, RoutingMode::Local);
    assert!(session.health().is_none());
    assert!(session.upload_connector().is_none());
    assert_eq!(session.status(), SyncStatus::Healthy);

    session.handle().put("tasks", "t1", json!({})).unwrap();
    assert_eq!(session.drain_now().await.unwrap().transactions, 0);
    assert!(backend.calls().is_empty());
    session.deactivate();
}

#[tokio::test]
async fn reactivation_reuses_the_cached_handle() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let first = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();
    let second = ctx.activate(TenantId::new("t-acme"), " ACME ").await.unwrap();
    assert!(Arc::ptr_eq(first.handle(), second.handle()));
    assert_eq!(ctx.registry().construction_count(), 1);
    first.deactivate();
    second.deactivate();
    ctx.teardown();
}

/// One transaction of three writes, then a second single-write transaction.
fn queue_two_transactions(session: &tasklane_sync::TenantSession) {
    session
        .handle()
        .write_transaction(|batch| {
            batch.put("tasks", "a", json!({}))?;
            batch.put("tasks", "b", json!({}))?;
            batch.put("tasks", "c", json!({}))
        })
        .unwrap();
    session.handle().put("tasks", "d", json!({})).unwrap();
}

#[tokio::test(start_paused = true)]
async fn teardown_lets_an_in_flight_transaction_finish() {
    let backend = FakeBackend::new();
    backend.set_latency(Duration::from_millis(100));
    let ctx = context(&backend);
    let session = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();

    queue_two_transactions(&session);
    // Midway through the second write of the first transaction.
    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.teardown();
    tokio::time::sleep(Duration::from_millis(500)).await;

    for id in ["a", "b", "c"] {
        assert!(backend.row("tasks", id).is_some(), "row {id} missing");
    }
    assert!(backend.row("tasks", "d").is_none());
    assert_eq!(session.handle().pending_count().unwrap(), 1);
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_returns_once_the_in_flight_transaction_is_settled() {
    let backend = FakeBackend::new();
    backend.set_latency(Duration::from_millis(100));
    let ctx = context(&backend);
    let session = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();

    queue_two_transactions(&session);
    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.shutdown().await;

    for id in ["a", "b", "c"] {
        assert!(backend.row("tasks", id).is_some(), "row {id} missing");
    }
    assert_eq!(session.handle().pending_count().unwrap(), 1);
    assert!(!session.handle().has_link());
    assert!(!session.handle().is_connected());
    assert!(ctx.registry().cached_tenants().is_empty());

    // Nothing keeps uploading after shutdown.
    tokio::time::sleep(TICK * 3).await;
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_remote_row_is_reported_without_retrying() {
    let backend = FakeBackend::new();
    let ctx = context(&backend);
    let session = ctx.activate(TenantId::new("t-acme"), "Acme").await.unwrap();

    backend.fail_write(0, tasklane_sync::RemoteError::no_rows());
    session.handle().put("tasks", "t1", json!({})).unwrap();
    tokio::time::sleep(TICK * 5).await;

    assert_eq!(backend.calls().len(), 1);
    assert_eq!(session.handle().pending_count().unwrap(), 1);
    assert_eq!(session.status(), SyncStatus::Error);
    let upload = session.upload_connector().unwrap();
    assert!(upload.last_error().is_some());
    assert_eq!(upload.metrics().drain_failures, 1);

    ctx.teardown();
}
