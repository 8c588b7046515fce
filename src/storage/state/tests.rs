//! Tests for the column-family state store.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use tempfile::TempDir;

use super::*;
use crate::error::StorageError;
use crate::types::UNSET_POSITION;

fn open(dir: &TempDir) -> Arc<StateDb> {
    StateDb::open(StateDbOptions {
        dir: dir.path().to_path_buf(),
        sync_on_commit: false,
    })
    .unwrap()
}

fn orders() -> TypedColumnFamily<i64, String> {
    TypedColumnFamily::new(ColumnFamily::Custom(FIRST_CUSTOM_COLUMN_FAMILY))
}

#[test]
fn test_transaction_reads_own_writes_until_commit() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cf = orders();

    let mut txn = db.transaction();
    cf.insert(&mut txn, &1, &"created".to_string()).unwrap();
    assert_eq!(cf.get(&txn, &1).unwrap().as_deref(), Some("created"));

    // Other transactions see nothing yet
    assert!(cf.get(&db.transaction(), &1).unwrap().is_none());

    txn.commit().unwrap();
    assert_eq!(
        cf.get(&db.transaction(), &1).unwrap().as_deref(),
        Some("created")
    );
}

#[test]
fn test_rollback_discards_writes() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cf = orders();

    let mut txn = db.transaction();
    cf.upsert(&mut txn, &7, &"x".to_string()).unwrap();
    txn.rollback();
    assert!(!txn.has_pending_writes());
    txn.commit().unwrap();

    assert!(cf.is_empty(&db.transaction()));
    assert!(db.is_empty());
}

#[test]
fn test_insert_update_delete_contracts() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let cf = orders();
    let mut txn = db.transaction();

    assert!(matches!(
        cf.update(&mut txn, &1, &"a".to_string()),
        Err(StorageError::KeyNotFound { .. })
    ));
    cf.insert(&mut txn, &1, &"a".to_string()).unwrap();
    assert!(matches!(
        cf.insert(&mut txn, &1, &"b".to_string()),
        Err(StorageError::KeyExists { .. })
    ));
    cf.update(&mut txn, &1, &"b".to_string()).unwrap();
    assert!(cf.exists(&txn, &1));

    cf.delete_existing(&mut txn, &1).unwrap();
    assert!(matches!(
        cf.delete_existing(&mut txn, &1),
        Err(StorageError::KeyNotFound { .. })
    ));
    assert!(!cf.delete_if_exists(&mut txn, &1));
}

#[test]
fn test_families_do_not_overlap() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let a: TypedColumnFamily<u64, u64> = TypedColumnFamily::new(ColumnFamily::Custom(20));
    let b: TypedColumnFamily<u64, u64> = TypedColumnFamily::new(ColumnFamily::Custom(21));

    let mut txn = db.transaction();
    a.upsert(&mut txn, &1, &10).unwrap();
    b.upsert(&mut txn, &1, &20).unwrap();
    txn.commit().unwrap();

    let txn = db.transaction();
    let mut seen = Vec::new();
    a.for_each(&txn, |k, v| seen.push((k, v))).unwrap();
    assert_eq!(seen, vec![(1, 10)]);
    assert_eq!(b.get(&txn, &1).unwrap(), Some(20));
}

#[test]
fn test_while_equal_prefix_visits_scope_only() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let requests: TypedColumnFamily<(i64, u16, u8), u64> =
        TypedColumnFamily::new(ColumnFamily::Custom(30));

    let mut txn = db.transaction();
    requests.insert(&mut txn, &(100, 2, 1), &1).unwrap();
    requests.insert(&mut txn, &(100, 1, 3), &2).unwrap();
    requests.insert(&mut txn, &(101, 0, 0), &3).unwrap();
    requests.insert(&mut txn, &(99, 9, 9), &4).unwrap();

    // Uncommitted writes take part in iteration
    let mut scope = Vec::new();
    requests
        .while_equal_prefix(&txn, &100i64, |key, value| {
            scope.push((key, value));
            true
        })
        .unwrap();
    assert_eq!(scope, vec![((100, 1, 3), 2), ((100, 2, 1), 1)]);

    txn.commit().unwrap();

    let mut first = Vec::new();
    requests
        .while_true(&db.transaction(), |key, _| {
            first.push(key.0);
            false
        })
        .unwrap();
    assert_eq!(first, vec![99]);
}

#[test]
fn test_last_processed_position_defaults_to_unset() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let state = LastProcessedPositionState::new();

    let mut txn = db.transaction();
    assert_eq!(state.get(&txn).unwrap(), UNSET_POSITION);
    state.mark_as_processed(&mut txn, 42).unwrap();
    txn.commit().unwrap();

    assert_eq!(state.get(&db.transaction()).unwrap(), 42);
}

#[test]
fn test_reopen_replays_committed_batches() {
    let dir = TempDir::new().unwrap();
    let cf = orders();
    {
        let db = open(&dir);
        let mut txn = db.transaction();
        cf.insert(&mut txn, &1, &"one".to_string()).unwrap();
        txn.commit().unwrap();
        cf.insert(&mut txn, &2, &"two".to_string()).unwrap();
        cf.delete_existing(&mut txn, &1).unwrap();
        txn.commit().unwrap();
    }

    let db = open(&dir);
    let txn = db.transaction();
    assert!(cf.get(&txn, &1).unwrap().is_none());
    assert_eq!(cf.get(&txn, &2).unwrap().as_deref(), Some("two"));
}

#[test]
fn test_failed_sync_leaves_no_batch_behind() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("state.log");
    let db = open(&dir);
    let mut txn = db.transaction();
    orders().insert(&mut txn, &1, &"kept".to_string()).unwrap();
    txn.commit().unwrap();
    let size = std::fs::metadata(&log_path).unwrap().len();

    let lost = WriteBatch {
        ops: vec![WriteOp::Put {
            key: b"lost".to_vec(),
            value: b"value".to_vec(),
        }],
    };
    let result = db.write_with(lost, |_| Err(std::io::Error::other("sync failed")));
    assert!(matches!(result, Err(StorageError::Io(_))));
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), size);
    assert!(db.get(b"lost").is_none());

    // Later batches land right after the last good one
    let mut txn = db.transaction();
    orders().insert(&mut txn, &2, &"after".to_string()).unwrap();
    txn.commit().unwrap();
    drop(txn);
    drop(db);

    let db = open(&dir);
    assert_eq!(db.len(), 2);
    assert!(db.get(b"lost").is_none());
}

#[test]
fn test_torn_transaction_is_dropped_whole() {
    let dir = TempDir::new().unwrap();
    let cf = orders();
    {
        let db = open(&dir);
        let mut txn = db.transaction();
        cf.insert(&mut txn, &1, &"kept".to_string()).unwrap();
        txn.commit().unwrap();
    }

    // Half-written frame after the last good batch
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join("state.log"))
        .unwrap();
    file.write_all(&[40, 0, 0, 0, 2, 0, 0, 0, 0x78]).unwrap();
    drop(file);

    let db = open(&dir);
    assert_eq!(db.len(), 1);

    // Log is usable again after the tail was cut
    let mut txn = db.transaction();
    cf.insert(&mut txn, &2, &"after".to_string()).unwrap();
    txn.commit().unwrap();
    drop(db);
    assert_eq!(open(&dir).len(), 2);
}

#[test]
fn test_export_and_restore() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let cf = orders();

    let db = open(&source_dir);
    let mut txn = db.transaction();
    for i in 0..10 {
        cf.insert(&mut txn, &i, &format!("order-{}", i)).unwrap();
    }
    txn.commit().unwrap();
    let export = db.export().unwrap();

    assert!(StateDb::is_empty_dir(target_dir.path()));
    let restored = StateDb::open_from_export(
        StateDbOptions {
            dir: target_dir.path().to_path_buf(),
            sync_on_commit: false,
        },
        &export,
    )
    .unwrap();
    assert!(!StateDb::is_empty_dir(target_dir.path()));
    assert_eq!(restored.entries(), db.entries());
}

#[test]
fn test_checkpoint_compacts_log() {
    let dir = TempDir::new().unwrap();
    let cf: TypedColumnFamily<u64, u64> = TypedColumnFamily::new(ColumnFamily::Custom(40));
    let db = open(&dir);

    for i in 0..50u64 {
        let mut txn = db.transaction();
        cf.upsert(&mut txn, &1, &i).unwrap();
        txn.commit().unwrap();
    }
    let before = std::fs::metadata(dir.path().join("state.log")).unwrap().len();
    db.checkpoint().unwrap();
    let after = std::fs::metadata(dir.path().join("state.log")).unwrap().len();
    assert!(after < before);

    let mut txn = db.transaction();
    cf.upsert(&mut txn, &2, &7).unwrap();
    txn.commit().unwrap();
    drop(txn);
    drop(db);

    let db = open(&dir);
    let txn = db.transaction();
    assert_eq!(cf.get(&txn, &1).unwrap(), Some(49));
    assert_eq!(cf.get(&txn, &2).unwrap(), Some(7));
}
