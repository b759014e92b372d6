use super::*;
use crate::keys::{KeyManager, KeyPolicy, MemoryKeyStore, SqliteKeyStore};
use crate::sync::{ChangeOp, ConflictRecord, ConflictStrategy, Priority};
use crate::DecryptionFailure;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn service() -> Arc<EncryptionService> {
    let keys = Arc::new(KeyManager::new(
        Arc::new(MemoryKeyStore::new()),
        KeyPolicy::default(),
    ));
    Arc::new(EncryptionService::new(keys, "primary").unwrap())
}

fn store() -> LocalStore {
    LocalStore::in_memory(service()).unwrap()
}

fn file_store(dir: &TempDir) -> LocalStore {
    let key_store = Arc::new(SqliteKeyStore::open(dir.path().join("keys.db")).unwrap());
    let keys = Arc::new(KeyManager::new(key_store, KeyPolicy::default()));
    let encryption = Arc::new(EncryptionService::new(keys, "primary").unwrap());
    LocalStore::open(dir.path().join("store.db"), encryption, None).unwrap()
}

fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_put_get_delete() {
    let store = store();
    let record = store.encryption().encrypt_default(b"raw bytes").unwrap();

    store.put("r1", "blob", &record).unwrap();
    assert_eq!(store.get("r1").unwrap(), Some(record));
    assert!(store.list_changes(&ChangeFilter::default()).unwrap().is_empty());

    assert!(store.delete("r1").unwrap());
    assert!(store.get("r1").unwrap().is_none());
    assert!(!store.delete("r1").unwrap());
}

#[test]
fn test_write_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = file_store(&dir);
        store
            .write_document("symptom_log", "log-1", fields(&[("pain", json!(7))]), Priority::High)
            .unwrap()
            .unwrap();
    }

    let store = file_store(&dir);
    let doc = store.read_document("log-1").unwrap().unwrap();
    assert_eq!(doc.fields["pain"], json!(7));
    assert_eq!(doc.version, 1);

    let queued = store.list_changes(&ChangeFilter::record("log-1")).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].op, ChangeOp::Create);
    assert_eq!(queued[0].priority, Priority::High);
}

#[test]
fn test_write_document_patches_and_skips_noops() {
    let store = store();
    store
        .write_document("journal", "j1", fields(&[("mood", json!(3)), ("notes", json!("ok"))]), Priority::Medium)
        .unwrap();
    let change = store
        .write_document("journal", "j1", fields(&[("mood", json!(4))]), Priority::Medium)
        .unwrap()
        .unwrap();
    assert_eq!(change.op, ChangeOp::Update);
    assert_eq!(change.changed_fields, vec!["mood".to_string()]);

    let doc = store.read_document("j1").unwrap().unwrap();
    assert_eq!(doc.fields["mood"], json!(4));
    assert_eq!(doc.fields["notes"], json!("ok"));

    assert!(store
        .write_document("journal", "j1", fields(&[("mood", json!(4))]), Priority::Medium)
        .unwrap()
        .is_none());
    assert!(matches!(
        store.write_document("other", "j1", fields(&[("x", json!(1))]), Priority::Low),
        Err(SyncCoreError::InvalidInput(_))
    ));
}

#[test]
fn test_failed_change_insert_rolls_back_record_write() {
    let store = store();
    let id = Uuid::new_v4();
    let envelope = store.encryption().encrypt_default(b"{}").unwrap();

    store
        .put_with_change(
            "a",
            "journal",
            &envelope,
            1,
            false,
            NewChange::new(ChangeOp::Create, Priority::Low).with_change_id(id),
        )
        .unwrap();

    let duplicate = store.put_with_change(
        "b",
        "journal",
        &envelope,
        1,
        false,
        NewChange::new(ChangeOp::Create, Priority::Low).with_change_id(id),
    );
    assert!(duplicate.is_err());
    assert!(store.get("b").unwrap().is_none());
    assert_eq!(store.list_changes(&ChangeFilter::default()).unwrap().len(), 1);
}

#[test]
fn test_enqueue_change_requires_record() {
    let store = store();
    assert!(matches!(
        store.enqueue_change("ghost", NewChange::new(ChangeOp::Update, Priority::Low)),
        Err(SyncCoreError::NotFound(_))
    ));

    let record = store.encryption().encrypt_default(b"{}").unwrap();
    store.put("r1", "blob", &record).unwrap();
    let change = store
        .enqueue_change("r1", NewChange::new(ChangeOp::Update, Priority::Low))
        .unwrap();
    assert_eq!(change.entity_type, "blob");
    assert_eq!(
        store.record_info("r1").unwrap().unwrap().sync_state,
        SyncState::Pending
    );
}

#[test]
fn test_dequeue_orders_by_priority_then_clock() {
    let store = store();
    for (id, priority) in [
        ("low", Priority::Low),
        ("critical", Priority::Critical),
        ("medium", Priority::Medium),
        ("high", Priority::High),
        ("medium-2", Priority::Medium),
    ] {
        store
            .write_document("journal", id, fields(&[("v", json!(1))]), priority)
            .unwrap();
    }

    let now = now_millis();
    let mut order = Vec::new();
    while let Some(change) = store.dequeue_next(now).unwrap() {
        assert_eq!(change.state, ChangeState::InFlight);
        order.push(change.record_id);
    }
    assert_eq!(order, vec!["critical", "high", "medium", "medium-2", "low"]);
}

#[test]
fn test_head_of_record_blocks_followers() {
    let store = store();
    store
        .write_document("journal", "r1", fields(&[("v", json!(1))]), Priority::Low)
        .unwrap();
    store
        .write_document("journal", "r1", fields(&[("v", json!(2))]), Priority::Critical)
        .unwrap();

    let now = now_millis();
    let head = store.dequeue_next(now).unwrap().unwrap();
    assert_eq!(head.priority, Priority::Low);
    assert!(store.dequeue_next(now).unwrap().is_none());

    let followers = store.absorb_followers(&head, 8).unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].priority, Priority::Critical);
    assert!(followers[0].logical_ts > head.logical_ts);
}

#[test]
fn test_retry_schedule_defers_change() {
    let store = store();
    let change = store
        .write_document("journal", "r1", fields(&[("v", json!(1))]), Priority::Medium)
        .unwrap()
        .unwrap();
    let now = now_millis();
    store.dequeue_next(now).unwrap().unwrap();

    store
        .schedule_retry(&[change.change_id], 1, now + 60_000, Some("offline"))
        .unwrap();
    assert!(store.dequeue_next(now).unwrap().is_none());
    assert_eq!(store.next_ready_at().unwrap(), Some(now + 60_000));

    let again = store.dequeue_next(now + 60_000).unwrap().unwrap();
    assert_eq!(again.retry_count, 1);
    assert_eq!(again.failure_reason.as_deref(), Some("offline"));
}

#[test]
fn test_failed_changes_can_be_requeued() {
    let store = store();
    let change = store
        .write_document("journal", "r1", fields(&[("v", json!(1))]), Priority::Medium)
        .unwrap()
        .unwrap();
    store.dequeue_next(now_millis()).unwrap();
    store.mark_failed(change.change_id, "rejected").unwrap();

    let stats = store.queue_stats(now_millis()).unwrap();
    assert_eq!(stats.failed, 1);
    assert!(store.dequeue_next(now_millis()).unwrap().is_none());

    assert_eq!(store.requeue_failed(Some("r1")).unwrap(), 1);
    let change = store.get_change(change.change_id).unwrap().unwrap();
    assert_eq!(change.state, ChangeState::Queued);
    assert_eq!(change.retry_count, 0);
    assert!(change.failure_reason.is_none());
}

#[test]
fn test_in_flight_changes_recover_on_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = file_store(&dir);
        store
            .write_document("journal", "r1", fields(&[("v", json!(1))]), Priority::Medium)
            .unwrap();
        store.dequeue_next(now_millis()).unwrap().unwrap();
        assert_eq!(store.count_changes(ChangeState::InFlight).unwrap(), 1);
    }

    let store = file_store(&dir);
    assert_eq!(store.count_changes(ChangeState::InFlight).unwrap(), 0);
    assert!(store.dequeue_next(now_millis()).unwrap().is_some());
}

#[test]
fn test_acknowledge_rebases_and_purges_tombstones() {
    let store = store();
    let first = store
        .write_document("journal", "r1", fields(&[("v", json!(1))]), Priority::Medium)
        .unwrap()
        .unwrap();
    let second = store
        .write_document("journal", "r1", fields(&[("v", json!(2))]), Priority::Medium)
        .unwrap()
        .unwrap();

    store.dequeue_next(now_millis()).unwrap();
    store.acknowledge("r1", &[first.change_id], 3).unwrap();

    let info = store.record_info("r1").unwrap().unwrap();
    assert_eq!(info.synced_version, 3);
    assert_eq!(info.sync_state, SyncState::Pending);
    assert_eq!(store.get_change(second.change_id).unwrap().unwrap().base_version, 3);

    store.dequeue_next(now_millis()).unwrap();
    store.acknowledge("r1", &[second.change_id], 4).unwrap();
    assert_eq!(
        store.record_info("r1").unwrap().unwrap().sync_state,
        SyncState::Synced
    );

    let tombstone = store.delete_document("r1", Priority::Medium).unwrap();
    assert_eq!(tombstone.base_version, 4);
    assert!(store.read_document("r1").unwrap().unwrap().deleted);

    store.dequeue_next(now_millis()).unwrap();
    store.acknowledge("r1", &[tombstone.change_id], 5).unwrap();
    assert!(store.get("r1").unwrap().is_none());
}

#[test]
fn test_conflict_park_and_commit() {
    let store = store();
    let change = store
        .write_document("journal", "r1", fields(&[("notes", json!("local"))]), Priority::Medium)
        .unwrap()
        .unwrap();
    store.dequeue_next(now_millis()).unwrap();

    let local = store.read_document("r1").unwrap().unwrap();
    let mut remote_doc = RecordDocument::new("r1", "journal");
    remote_doc.set("notes", json!("remote"), 1);
    remote_doc.version = 2;

    let conflict = ConflictRecord {
        conflict_id: Uuid::new_v4(),
        record_id: "r1".to_string(),
        entity_type: "journal".to_string(),
        change_ids: vec![change.change_id],
        local,
        remote: RemoteVersion {
            version: 2,
            document: remote_doc.clone(),
        },
        diffs: Vec::new(),
        strategy: ConflictStrategy::Manual,
        merged: None,
        created_at: now_millis(),
    };
    store.park_conflict(&conflict).unwrap();

    assert_eq!(store.list_conflicts().unwrap(), vec![conflict.clone()]);
    let stats = store.queue_stats(now_millis()).unwrap();
    assert_eq!(stats.conflicted, 1);
    assert_eq!(stats.unresolved_conflicts, 1);
    assert_eq!(
        store.record_info("r1").unwrap().unwrap().sync_state,
        SyncState::Conflict
    );

    store
        .commit_resolution(ResolutionCommit {
            record_id: "r1",
            resolved: &remote_doc,
            based_on: 1,
            remote_version: 2,
            settled: &[change.change_id],
            conflict_id: Some(conflict.conflict_id),
            requeue: None,
        })
        .unwrap();

    assert!(store.list_conflicts().unwrap().is_empty());
    let info = store.record_info("r1").unwrap().unwrap();
    assert_eq!(info.sync_state, SyncState::Synced);
    assert_eq!(info.synced_version, 2);
    assert_eq!(
        store.read_document("r1").unwrap().unwrap().fields["notes"],
        json!("remote")
    );
}

#[test]
fn test_commit_resolution_requeues_against_remote_version() {
    let store = store();
    let change = store
        .write_document("journal", "r1", fields(&[("mood", json!(2))]), Priority::High)
        .unwrap()
        .unwrap();
    store.dequeue_next(now_millis()).unwrap();

    let mut merged = store.read_document("r1").unwrap().unwrap();
    merged.set("sleep", json!(8), now_millis());
    merged.version = 6;

    let requeued = store
        .commit_resolution(ResolutionCommit {
            record_id: "r1",
            resolved: &merged,
            based_on: 1,
            remote_version: 5,
            settled: &[change.change_id],
            conflict_id: None,
            requeue: Some((Priority::High, 1)),
        })
        .unwrap()
        .unwrap();

    assert_eq!(requeued.base_version, 5);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.op, ChangeOp::Update);
    assert!(store.get_change(change.change_id).unwrap().is_none());
    assert_eq!(store.read_document("r1").unwrap().unwrap(), merged);
}

#[test]
fn test_commit_resolution_refuses_newer_local_version() {
    let store = store();
    let change = store
        .write_document("journal", "r1", fields(&[("pain", json!(3))]), Priority::High)
        .unwrap()
        .unwrap();
    store.dequeue_next(now_millis()).unwrap();
    let sent = store.read_document("r1").unwrap().unwrap();

    let edit = store
        .write_document("journal", "r1", fields(&[("pain", json!(9))]), Priority::High)
        .unwrap()
        .unwrap();

    let mut remote_doc = RecordDocument::new("r1", "journal");
    remote_doc.set("pain", json!(1), 1);
    let mut resolved = sent.clone();
    resolved.version = 3;

    match store.commit_resolution(ResolutionCommit {
        record_id: "r1",
        resolved: &resolved,
        based_on: sent.version,
        remote_version: 2,
        settled: &[change.change_id],
        conflict_id: None,
        requeue: Some((Priority::High, 1)),
    }) {
        Err(SyncCoreError::StaleResolution { expected, found, .. }) => {
            assert_eq!(expected, 1);
            assert_eq!(found, 2);
        }
        other => panic!("unexpected: {:?}", other),
    }

    let current = store.read_document("r1").unwrap().unwrap();
    assert_eq!(current.fields["pain"], json!(9));
    assert_eq!(current.version, 2);
    assert_eq!(
        store.get_change(change.change_id).unwrap().unwrap().state,
        ChangeState::InFlight
    );
    assert!(store.get_change(edit.change_id).unwrap().is_some());
}

#[test]
fn test_apply_remote_respects_local_changes() {
    let store = store();
    let mut remote = RecordDocument::new("r1", "journal");
    remote.set("v", json!("server"), 10);
    remote.version = 1;

    assert!(store
        .apply_remote(&RemoteVersion {
            version: 1,
            document: remote.clone(),
        })
        .unwrap());
    assert_eq!(store.read_document("r1").unwrap().unwrap(), remote);
    assert!(!store
        .apply_remote(&RemoteVersion {
            version: 1,
            document: remote.clone(),
        })
        .unwrap());

    store
        .write_document("journal", "r1", fields(&[("v", json!("local"))]), Priority::Low)
        .unwrap();
    remote.set("v", json!("server-2"), 20);
    assert!(!store
        .apply_remote(&RemoteVersion {
            version: 2,
            document: remote,
        })
        .unwrap());
    assert_eq!(
        store.read_document("r1").unwrap().unwrap().fields["v"],
        json!("local")
    );
}

#[test]
fn test_quota_rejects_oversized_write() {
    let store = LocalStore::open(
        ":memory:",
        service(),
        Some(600),
    )
    .unwrap();

    store
        .write_document("journal", "small", fields(&[("v", json!(1))]), Priority::Low)
        .unwrap();
    let used = store.stored_bytes().unwrap();

    let big = "x".repeat(2_000);
    match store.write_document("journal", "big", fields(&[("notes", json!(big))]), Priority::Low) {
        Err(SyncCoreError::QuotaExceeded { limit, .. }) => assert_eq!(limit, 600),
        other => panic!("unexpected: {:?}", other),
    }

    assert!(store.get("big").unwrap().is_none());
    assert_eq!(store.stored_bytes().unwrap(), used);
    assert_eq!(store.list_changes(&ChangeFilter::default()).unwrap().len(), 1);
}

#[test]
fn test_snapshot_skips_tombstones_and_filters() {
    let store = store();
    for id in ["a", "b", "c"] {
        store
            .write_document("journal", id, fields(&[("id", json!(id))]), Priority::Low)
            .unwrap();
    }
    store.delete_document("c", Priority::Low).unwrap();

    let all = store.snapshot(None).unwrap();
    let ids: Vec<_> = all.documents.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let only_b = store.snapshot(Some(&["b".to_string()][..])).unwrap();
    assert_eq!(only_b.documents.len(), 1);
    assert_eq!(only_b.documents[0].fields["id"], json!("b"));
}

#[test]
fn test_reencrypt_after_rotation() {
    let store = store();
    for id in ["a", "b"] {
        store
            .write_document("journal", id, fields(&[("v", json!(id))]), Priority::Low)
            .unwrap();
    }
    assert!(store.stale_records("primary").unwrap().is_empty());

    store.encryption().keys().rotate_key("primary").unwrap();
    assert_eq!(store.stale_records("primary").unwrap(), vec!["a", "b"]);

    assert_eq!(store.reencrypt_records("primary").unwrap(), 2);
    assert!(store.stale_records("primary").unwrap().is_empty());
    assert_eq!(
        store.read_document("a").unwrap().unwrap().fields["v"],
        json!("a")
    );
    assert_eq!(store.reencrypt_records("primary").unwrap(), 0);
}

#[test]
fn test_missing_key_surfaces_as_key_not_found() {
    let store = store();
    let record = store.encryption().encrypt(b"{}", "scratch").unwrap();
    store.put("r1", "blob", &record).unwrap();
    store.encryption().keys().delete_key("scratch").unwrap();

    assert!(matches!(
        store.read_document("r1"),
        Err(SyncCoreError::Decryption(DecryptionFailure::KeyNotFound { .. }))
    ));
}

#[test]
fn test_key_usage_tracks_records_per_key() {
    let store = store();
    store
        .write_document("journal", "a", fields(&[("v", json!(1))]), Priority::Low)
        .unwrap();
    let scratch = store.encryption().encrypt(b"{}", "scratch").unwrap();
    store.put("s1", "blob", &scratch).unwrap();

    let usage = store.key_usage().unwrap();
    let primary = usage.iter().find(|u| u.key_id == "primary").unwrap();
    let ephemeral = usage.iter().find(|u| u.key_id == "scratch").unwrap();
    assert!(primary.persisted);
    assert_eq!(primary.record_count, 1);
    assert!(!ephemeral.persisted);

    store.delete("s1").unwrap();
    let usage = store.key_usage().unwrap();
    let ephemeral = usage.iter().find(|u| u.key_id == "scratch").unwrap();
    assert_eq!(ephemeral.record_count, 0);
}
