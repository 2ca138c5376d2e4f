use tempfile::tempdir;

use crate::btree::Direction;
use crate::codec::Value;
use crate::schema::{Column, ColumnType, IndexKind, IndexSpec, Schema, WalMode};
use crate::table::{OpenMode, Table, TableConfig, TableError};

fn user_schema() -> Schema {
    Schema::builder()
        .column(Column::new("id", ColumnType::I64, false))
        .column(Column::new("email", ColumnType::Str(64), false))
        .column(Column::new("age", ColumnType::I32, true))
        .index(IndexSpec::new("primary", IndexKind::Primary, vec!["id".into()]))
        .index(IndexSpec::new("by_email", IndexKind::Hash, vec!["email".into()]))
        .index(IndexSpec::new("by_age", IndexKind::Sort, vec!["age".into()]))
        .wal_mode(WalMode::Truncate)
        .build()
        .unwrap()
}

fn row(id: i64, email: &str, age: i32) -> Vec<Value> {
    vec![Value::I64(id), Value::Str(email.to_string()), Value::I32(age)]
}

fn small_config() -> TableConfig {
    TableConfig {
        btree_page_size: 512,
        hash_page_size: 512,
        hash_initial_buckets: 4,
        hash_max_buckets: 64,
        ..TableConfig::default()
    }
}

#[test]
fn apply_then_read_round_trips() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    let rowid = table.apply(&row(1, "a@example.com", 30), false).unwrap();
    let got = table.read(rowid).unwrap().unwrap();
    assert_eq!(got, row(1, "a@example.com", 30));
    assert_eq!(table.rows(), 1);
}

#[test]
fn duplicate_primary_without_upsert_is_a_constraint_error() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    table.apply(&row(1, "a@example.com", 30), false).unwrap();
    let err = table.apply(&row(1, "b@example.com", 40), false).unwrap_err();
    assert!(matches!(err, TableError::Constraint(_)));
    assert_eq!(table.rows(), 1);
}

#[test]
fn upsert_replaces_the_prior_row_and_its_index_entries() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    let first = table.apply(&row(1, "old@example.com", 20), false).unwrap();
    let second = table.apply(&row(1, "new@example.com", 21), true).unwrap();

    assert_eq!(table.rows(), 1);
    assert_eq!(table.read(first).unwrap(), None);
    assert_eq!(table.read(second).unwrap().unwrap(), row(1, "new@example.com", 21));

    let hits = table.lookup_hash("by_email", b"new@example.com").unwrap();
    assert!(hits.is_empty(), "hash keys aren't padded raw strings; exact lookup needs the encoded key");
}

#[test]
fn lookup_hash_uses_the_encoded_key_and_verifies_candidates() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();
    let schema = table.schema().clone();

    let r = row(1, "a@example.com", 30);
    let rowid = table.apply(&r, false).unwrap();

    let key = crate::table::encode_index_key(&schema, &["email".to_string()], &r).unwrap();
    let hits = table.lookup_hash("by_email", &key).unwrap();
    assert_eq!(hits, vec![rowid]);
}

#[test]
fn delete_removes_row_and_is_idempotent() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    let rowid = table.apply(&row(1, "a@example.com", 30), false).unwrap();
    assert!(table.delete(rowid).unwrap());
    assert!(!table.delete(rowid).unwrap());
    assert_eq!(table.read(rowid).unwrap(), None);
    assert_eq!(table.rows(), 0);
}

#[test]
fn find_scans_the_sort_index_in_order() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    for (id, age) in [(1, 40), (2, 20), (3, 30)] {
        table.apply(&row(id, &format!("u{id}@example.com"), age), false).unwrap();
    }

    let rowids = table
        .find("by_age", Direction::Forward, None, None, |_| true, 0, None)
        .unwrap();
    assert_eq!(rowids.len(), 3);

    let ages: Vec<i32> = rowids
        .iter()
        .map(|&id| match &table.read(id).unwrap().unwrap()[2] {
            Value::I32(a) => *a,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(ages, vec![20, 30, 40]);
}

#[test]
fn persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("users");

    let rowid = {
        let table = Table::create(&path, user_schema(), small_config()).unwrap();
        let rowid = table.apply(&row(1, "a@example.com", 30), false).unwrap();
        table.checkpoint().unwrap();
        table.close().unwrap();
        rowid
    };

    let table = Table::open(&path, small_config()).unwrap();
    assert_eq!(table.read(rowid).unwrap().unwrap(), row(1, "a@example.com", 30));
    assert_eq!(table.rows(), 1);
    table.close().unwrap();
}

#[test]
fn wal_replay_reconstructs_indexes_after_a_dirty_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("users");

    let rowid = {
        let table = Table::create(&path, user_schema(), small_config()).unwrap();
        let rowid = table.apply(&row(1, "a@example.com", 30), false).unwrap();
        table.apply(&row(2, "b@example.com", 31), false).unwrap();
        table.delete(rowid).unwrap();
        // No checkpoint, no explicit close: simulates a process kill after
        // the WAL committed these transactions but before anyone asked for
        // a clean shutdown.
        std::mem::forget(table);
        rowid
    };

    let table = Table::open(&path, small_config()).unwrap();
    assert_eq!(table.read(rowid).unwrap(), None);
    assert_eq!(table.rows(), 1);
    let hits = table
        .find("by_age", Direction::Forward, None, None, |_| true, 0, None)
        .unwrap();
    assert_eq!(hits.len(), 1);
    table.close().unwrap();
}

#[test]
fn truncate_mode_close_resets_the_wal_to_header_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("users");
    let table = Table::create(&path, user_schema(), small_config()).unwrap();
    table.apply(&row(1, "a@example.com", 30), false).unwrap();
    table.close().unwrap();

    let wal_path = {
        let mut p = path.clone().into_os_string();
        p.push(".wal");
        std::path::PathBuf::from(p)
    };
    let len = std::fs::metadata(&wal_path).unwrap().len();
    assert_eq!(len, crate::wal::TABLE_WAL_HEADER_SIZE);
}

#[test]
fn read_only_table_rejects_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("users");
    {
        let table = Table::create(&path, user_schema(), small_config()).unwrap();
        table.apply(&row(1, "a@example.com", 30), false).unwrap();
        table.close().unwrap();
    }

    let config = TableConfig {
        mode: OpenMode::ReadOnly,
        ..small_config()
    };
    let table = Table::open(&path, config).unwrap();
    assert!(table.read(1).unwrap().is_some());
    let err = table.apply(&row(2, "b@example.com", 20), false).unwrap_err();
    assert!(matches!(err, TableError::Constraint(_)));
}

#[test]
fn not_null_violation_surfaces_as_a_codec_constraint_error() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    let err = table.apply(&[Value::I64(1), Value::Null, Value::I32(1)], false).unwrap_err();
    assert_eq!(err.kind(), crate::table::ErrorKind::Constraint);
}

#[test]
fn compact_reclaims_tombstoned_blocks() {
    let dir = tempdir().unwrap();
    let table = Table::create(dir.path().join("users"), user_schema(), small_config()).unwrap();

    for id in 0..10 {
        table.apply(&row(id, &format!("u{id}@example.com"), 20), false).unwrap();
    }
    for id in 0..5 {
        table.delete(id).unwrap();
    }
    let stats = table.compact().unwrap();
    assert!(stats.reclaimed_records >= 5);
    assert_eq!(table.rows(), 5);
}
