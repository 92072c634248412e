//! Upload connector against an in-memory backend.

mod common;

use common::{Call, CountingTokens, FakeBackend, static_tokens};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tasklane_core::{MutationOp, PendingMutation};
use tasklane_db::{HandleKey, LocalDb, LocalDbOptions};
use tasklane_sync::{
    DrainOutcome, DrainReport, DrainState, RemoteBackend, RemoteError, SyncError, TableMap,
    TokenProvider, UploadConnector,
};

fn db() -> LocalDb {
    LocalDb::open_memory(HandleKey::Shared, LocalDbOptions::default()).unwrap()
}

fn connector(backend: &Arc<FakeBackend>, tokens: Arc<dyn TokenProvider>) -> UploadConnector {
    UploadConnector::new(
        Arc::clone(backend) as Arc<dyn RemoteBackend>,
        tokens,
        TableMap::passthrough(),
        None,
    )
}

fn ops(calls: &[Call]) -> Vec<(&'static str, String)> {
    calls.iter().map(|c| (c.op, c.id.clone())).collect()
}

#[tokio::test]
async fn drains_transactions_in_fifo_order() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, static_tokens());
    let db = db();

    db.put("tasks", "a", json!({"title": "A"})).unwrap();
    db.write_transaction(|batch| {
        batch.put("tasks", "b", json!({"title": "B"}))?;
        batch.patch("tasks", "a", json!({"done": true}))
    })
    .unwrap();
    db.delete("tasks", "b").unwrap();

    let report = upload.drain(&db).await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            transactions: 3,
            applied: 4,
            skipped: 0
        }
    );
    assert_eq!(
        ops(&backend.calls()),
        vec![
            ("upsert", "a".to_string()),
            ("upsert", "b".to_string()),
            ("update", "a".to_string()),
            ("delete", "b".to_string()),
        ]
    );
    assert_eq!(
        backend.row("tasks", "a"),
        Some(json!({"id": "a", "title": "A", "done": true}))
    );
    assert_eq!(backend.row("tasks", "b"), None);
    assert_eq!(db.pending_count().unwrap(), 0);
    assert_eq!(upload.state(), DrainState::Idle);
    assert_eq!(upload.metrics().transactions_acknowledged, 3);
    assert_eq!(upload.metrics().mutations_applied, 4);
}

#[tokio::test]
async fn empty_queue_is_idle() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, static_tokens());
    assert_eq!(upload.upload_next(&db()).await.unwrap(), DrainOutcome::Idle);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn failed_batch_stays_queued_and_replays_safely() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, static_tokens());
    let db = db();
    db.write_transaction(|batch| {
        batch.put("tasks", "a", json!({"sort": 0}))?;
        batch.put("tasks", "b", json!({"sort": 1}))?;
        batch.put("tasks", "c", json!({"sort": 2}))
    })
    .unwrap();

    backend.fail_write(1, RemoteError::new("HTTP503", "Service Unavailable").with_status(503));
    let err = upload.drain(&db).await.unwrap_err();
    assert!(matches!(&err, SyncError::Remote { code, .. } if code == "HTTP503"));
    assert_eq!(db.pending_count().unwrap(), 3);
    assert!(upload.last_error().is_some());
    assert_eq!(upload.metrics().drain_failures, 1);
    // The first write landed before the failure.
    assert_eq!(backend.row("tasks", "a"), Some(json!({"id": "a", "sort": 0})));

    let report = upload.drain(&db).await.unwrap();
    assert_eq!(report.transactions, 1);
    assert_eq!(db.pending_count().unwrap(), 0);
    assert!(upload.last_error().is_none());
    assert_eq!(
        ops(&backend.calls()),
        vec![
            ("upsert", "a".to_string()),
            ("upsert", "b".to_string()),
            ("upsert", "a".to_string()),
            ("upsert", "b".to_string()),
            ("upsert", "c".to_string()),
        ]
    );
    for (id, sort) in [("a", 0), ("b", 1), ("c", 2)] {
        assert_eq!(backend.row("tasks", id), Some(json!({"id": id, "sort": sort})));
    }
}

#[tokio::test]
async fn patch_of_missing_remote_record_surfaces_backend_error() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, static_tokens());
    let db = db();
    db.write_transaction(|batch| {
        batch.enqueue(PendingMutation::new(
            MutationOp::Patch,
            "tasks",
            "ghost",
            Some(json!({"done": true})),
        ))
    })
    .unwrap();

    let err = upload.drain(&db).await.unwrap_err();
    let err_retryable = err.is_retryable();
    match err {
        SyncError::Remote { code, message, .. } => {
            assert_eq!(code, "PGRST116");
            assert_eq!(message, "The result contains 0 rows");
            assert!(!err_retryable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(db.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn delete_of_absent_remote_record_succeeds() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, static_tokens());
    let db = db();
    db.delete("tasks", "never-synced").unwrap();

    let report = upload.drain(&db).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(db.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn unresolved_tables_are_skipped_and_batch_continues() {
    let backend = FakeBackend::new();
    let upload = UploadConnector::new(
        Arc::clone(&backend) as Arc<dyn RemoteBackend>,
        static_tokens(),
        TableMap::with_aliases([("tasks", "tasks")]),
        None,
    );
    let db = db();
    db.write_transaction(|batch| {
        batch.put("drafts", "d1", json!({"body": "local only"}))?;
        batch.put("tasks", "t1", json!({"title": "synced"}))
    })
    .unwrap();

    let report = upload.drain(&db).await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            transactions: 1,
            applied: 1,
            skipped: 1
        }
    );
    assert_eq!(ops(&backend.calls()), vec![("upsert", "t1".to_string())]);
    assert_eq!(db.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn aliases_route_to_remote_table_names() {
    let backend = FakeBackend::new();
    let upload = UploadConnector::new(
        Arc::clone(&backend) as Arc<dyn RemoteBackend>,
        static_tokens(),
        TableMap::with_aliases([("todo", "tasks")]),
        None,
    );
    let db = db();
    db.put("todo", "t1", json!({"title": "aliased"})).unwrap();
    upload.drain(&db).await.unwrap();
    assert_eq!(backend.calls()[0].table, "tasks");
    assert!(backend.row("tasks", "t1").is_some());
}

#[tokio::test]
async fn token_is_refreshed_for_every_upload() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, Arc::new(CountingTokens::default()));
    let db = db();
    db.put("tasks", "a", json!({})).unwrap();
    upload.drain(&db).await.unwrap();
    db.put("tasks", "b", json!({})).unwrap();
    upload.drain(&db).await.unwrap();

    let tokens: Vec<Option<String>> = backend.calls().into_iter().map(|c| c.token).collect();
    // Each drain fetches once per transaction plus once for the final empty check.
    assert_eq!(
        tokens,
        vec![Some("tok-1".to_string()), Some("tok-3".to_string())]
    );
}

#[tokio::test]
async fn missing_payload_is_derived_from_the_raw_record() {
    let backend = FakeBackend::new();
    let upload = connector(&backend, static_tokens());
    let db = db();
    let raw: PendingMutation = serde_json::from_value(json!({
        "op": "PUT",
        "type": "tasks",
        "id": "t9",
        "title": "from raw record",
        "sortOrder": 4
    }))
    .unwrap();
    assert!(raw.payload.is_none());
    db.write_transaction(|batch| batch.enqueue(raw)).unwrap();

    upload.drain(&db).await.unwrap();
    let mut expected = Map::new();
    expected.insert("id".into(), Value::from("t9"));
    expected.insert("title".into(), Value::from("from raw record"));
    expected.insert("sortOrder".into(), Value::from(4));
    assert_eq!(backend.row("tasks", "t9"), Some(Value::Object(expected)));
}
