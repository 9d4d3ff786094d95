//! Integration tests for pull/push synchronization
//!
//! These tests verify that:
//! 1. Pending local documents survive a pull of the remote snapshot
//! 2. Retried pushes converge to one remote record per key
//! 3. Queued deletions reach the remote and are not undone by a pull
//! 4. Overlapping runs on one collection are refused
//! 5. Reconnecting triggers a full synchronization

use chrono::Utc;
use portaria_sync::{
    AccessRecord, Collection, ConnectivityService, LocalDbConfig, LocalStore, MemoryRemote, Movement,
    OperationKind, Student, SyncConfig, SyncError, SyncFilter, SyncFlag, SyncQueue, SyncService,
    SystemClock,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    queue: SyncQueue,
    remote: Arc<MemoryRemote>,
    connectivity: Arc<ConnectivityService>,
    service: Arc<SyncService>,
}

/// Helper to wire a sync service over a fresh store
async fn harness_with(remote: MemoryRemote, online: bool) -> Harness {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = LocalDbConfig {
        db_path: dir.path().join("sync.db"),
        ..LocalDbConfig::default()
    };
    let store = LocalStore::open(&config).await.expect("Failed to open store");
    let queue = SyncQueue::new(store, Arc::new(SystemClock));
    let remote = Arc::new(remote);
    let connectivity = Arc::new(ConnectivityService::new(online));
    let service = Arc::new(SyncService::new(
        queue.clone(),
        remote.clone(),
        connectivity.clone(),
        SyncConfig::default(),
    ));
    Harness {
        _dir: dir,
        queue,
        remote,
        connectivity,
        service,
    }
}

async fn harness() -> Harness {
    harness_with(MemoryRemote::new(), true).await
}

fn remote_student(id: usize) -> Value {
    json!({
        "matricula": format!("2023{:03}", id),
        "nome": format!("Aluno {}", id),
        "status": "ACTIVE",
        "sincronizado": 1,
    })
}

#[tokio::test]
async fn test_pull_keeps_student_created_offline() {
    let h = harness().await;
    h.queue
        .store()
        .save(&Student::new("2024001", "Carla Souza", None))
        .await
        .unwrap();
    h.remote
        .seed(Collection::Students, (0..50).map(remote_student).collect());

    let applied = h.service.pull_collection(Collection::Students).await.unwrap();

    assert_eq!(applied, 50);
    assert_eq!(h.queue.store().count(Collection::Students).await.unwrap(), 51);
    let kept: Student = h.queue.store().load("2024001").await.unwrap().unwrap();
    assert_eq!(kept.sync, SyncFlag::Pending);
    assert_eq!(kept.name, "Carla Souza");
}

#[tokio::test]
async fn test_malformed_remote_student_does_not_break_reads() {
    let h = harness().await;
    h.remote.seed(
        Collection::Students,
        vec![json!({"matricula": "x", "nome": "y"}), remote_student(1)],
    );

    let applied = h.service.pull_collection(Collection::Students).await.unwrap();
    assert_eq!(applied, 1);

    let students: Vec<Student> = h.queue.store().load_all().await.unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(students[0].id, "2023001");
}

#[tokio::test]
async fn test_pending_documents_are_unchanged_by_pull() {
    let h = harness().await;
    let store = h.queue.store();

    // a pending local edit of a record the remote also holds
    let mut edited = Student::new("2023001", "Nome Corrigido", None);
    edited.sync = SyncFlag::Pending;
    store.save(&edited).await.unwrap();
    let mut confirmed = Student::new("9999999", "Removido no servidor", None);
    confirmed.sync = SyncFlag::Confirmed;
    store.save(&confirmed).await.unwrap();

    let before = store.get(Collection::Students, "2023001").await.unwrap();
    h.remote
        .seed(Collection::Students, (1..=3).map(remote_student).collect());

    h.service.pull_collection(Collection::Students).await.unwrap();

    let after = store.get(Collection::Students, "2023001").await.unwrap();
    assert_eq!(before, after);
    // confirmed documents the remote no longer has are dropped
    assert!(store.get(Collection::Students, "9999999").await.unwrap().is_none());
    let pulled: Student = store.load("2023002").await.unwrap().unwrap();
    assert_eq!(pulled.sync, SyncFlag::Confirmed);
}

#[tokio::test]
async fn test_lost_ack_retry_leaves_single_remote_record() {
    let h = harness().await;
    let record = AccessRecord::new("2024001", Movement::Entry, Utc::now());
    h.queue.store().save(&record).await.unwrap();
    h.remote.lose_ack(record.id.clone());

    let first = h
        .service
        .push_pending_records(Collection::AccessRecords)
        .await
        .unwrap();
    assert_eq!(first.confirmed, 0);
    assert_eq!(first.failed, vec![record.id.clone()]);
    assert_eq!(h.remote.count(Collection::AccessRecords), 1);
    assert_eq!(h.queue.pending_count(Collection::AccessRecords).await.unwrap(), 1);

    let second = h
        .service
        .push_pending_records(Collection::AccessRecords)
        .await
        .unwrap();
    assert_eq!(second.confirmed, 1);
    assert!(second.failed.is_empty());
    assert_eq!(h.remote.count(Collection::AccessRecords), 1);
    assert_eq!(h.queue.pending_count(Collection::AccessRecords).await.unwrap(), 0);

    let stored = h.remote.record(Collection::AccessRecords, &record.id).unwrap();
    assert_eq!(stored["sincronizado"], json!(1));
}

#[tokio::test]
async fn test_single_record_push_isolates_failures() {
    let h = harness().await;
    for id in ["1", "2", "3"] {
        h.queue
            .store()
            .save(&Student::new(id, format!("Aluno {}", id), None))
            .await
            .unwrap();
    }
    h.remote.reject("2");

    let report = h
        .service
        .push_pending_records(Collection::Students)
        .await
        .unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.failed, vec!["2".to_string()]);
    let left: Student = h.queue.store().load("2").await.unwrap().unwrap();
    assert!(left.sync.is_pending());
}

#[tokio::test]
async fn test_queued_delete_is_replayed_and_not_resurrected() {
    let h = harness().await;
    h.remote.seed(Collection::Students, vec![remote_student(7)]);
    h.service.pull_collection(Collection::Students).await.unwrap();

    h.queue.store().delete(Collection::Students, "2023007").await.unwrap();
    h.queue
        .queue_operation(OperationKind::Delete, Collection::Students, "2023007", None)
        .await
        .unwrap();

    // a pull before the replay must not bring the record back
    h.service.pull_collection(Collection::Students).await.unwrap();
    assert!(h.queue.store().get(Collection::Students, "2023007").await.unwrap().is_none());

    let summary = h.service.sync_all().await;
    let replay = summary.replay.as_ref().unwrap();
    assert_eq!(replay.completed, 1);
    assert_eq!(replay.failed, 0);
    assert!(h.remote.record(Collection::Students, "2023007").is_none());
    assert!(h.queue.pending_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_replay_counts_attempts() {
    let h = harness().await;
    h.queue
        .queue_operation(OperationKind::Update, Collection::Students, "1", None)
        .await
        .unwrap();

    let report = h.service.replay_pending_operations().await.unwrap();
    assert_eq!(report.failed, 1);

    let operations = h.queue.pending_operations().await.unwrap();
    assert_eq!(operations[0].attempts, 1);
    assert!(operations[0].last_error.is_some());
}

#[tokio::test]
async fn test_overlapping_runs_on_a_collection_are_refused() {
    let h = harness_with(MemoryRemote::with_latency(Duration::from_millis(100)), true).await;

    let (first, second) = tokio::join!(
        h.service.pull_collection(Collection::Students),
        h.service.pull_collection(Collection::Students),
    );
    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::Busy(_))));

    let filter = SyncFilter::only(vec![Collection::Classes]);
    let (a, b) = tokio::join!(
        h.service.sync_collection(Collection::Classes, &filter),
        h.service.sync_collection(Collection::Classes, &filter),
    );
    assert!(!a.skipped);
    assert!(b.skipped);
    assert!(!h.service.is_running(Collection::Classes));
}

#[tokio::test]
async fn test_offline_sync_is_deferred() {
    let h = harness_with(MemoryRemote::new(), false).await;
    h.queue.store().save(&Student::new("1", "Ana", None)).await.unwrap();

    let result = h.service.pull_collection(Collection::Students).await;
    assert!(matches!(result, Err(SyncError::Network(_))));

    let summary = h.service.sync_all().await;
    assert!(!summary.online);
    assert!(!summary.is_clean());
    assert!(summary.collections.is_empty());
    assert_eq!(h.remote.upsert_calls(), 0);
}

#[tokio::test]
async fn test_sync_all_clears_debt() {
    let h = harness().await;
    let store = h.queue.store();
    store.save(&Student::new("1", "Ana", None)).await.unwrap();
    store
        .save(&AccessRecord::new("1", Movement::Entry, Utc::now()))
        .await
        .unwrap();
    assert_eq!(h.service.sync_debt().await.unwrap().total(), 2);

    let summary = h.service.sync_all().await;

    assert!(summary.is_clean(), "failed: {:?}", summary.failed_collections());
    assert!(h.service.sync_debt().await.unwrap().is_empty());
    assert_eq!(h.remote.count(Collection::Students), 1);
    assert_eq!(h.remote.count(Collection::AccessRecords), 1);
}

#[tokio::test]
async fn test_reconnect_triggers_synchronization() {
    let h = harness_with(MemoryRemote::new(), false).await;
    assert!(h.service.on_reconnect().is_some());
    assert!(h.service.on_reconnect().is_none());

    h.queue.store().save(&Student::new("1", "Ana", None)).await.unwrap();
    h.connectivity.set_online(true);

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        while h.remote.count(Collection::Students) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "reconnect did not push the pending student");
}
