//! [`Table`] — composes [`crate::storage::BlockStorage`] (primary data),
//! [`crate::codec::RowCodec`], a PRIMARY [`crate::btree::BPlusTree`] plus any
//! declared SORT/HASH secondary indexes, [`crate::wal::TableWal`] and
//! [`crate::cache::Cache`] into the engine's single public entry point.
//!
//! This mirrors the role the teacher's `Engine`/`EngineInner` pair plays:
//! one coordinator type that owns every subsystem for the lifetime of an
//! open handle and serializes writers behind a single latch while readers
//! proceed lock-free through each subsystem's own concurrency story.
//!
//! # Write path
//!
//! `apply`/`delete` mutate [`crate::storage::BlockStorage`] and every index
//! synchronously (each already `pwrite`s its own state durably) and only
//! afterward submit a WAL record describing the change, rather than the
//! reverse. Storage and index mutations already survive a process kill
//! (the kernel buffers the write; only in-process state is lost), so the
//! WAL's job here is narrower than a textbook redo log: it delimits
//! transaction boundaries so recovery can tell which multi-index updates
//! completed, and lets [`Table::open`] reconcile index state against
//! whatever rows a committed transaction says should exist. See
//! `reconcile_committed` below and the Open Questions in `DESIGN.md`.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::btree::{BPlusTree, BTreeError, Direction, Rowid};
use crate::cache::{Cache, CacheConfig};
use crate::codec::{CodecError, Row, RowCodec, Value};
use crate::hash_index::{HashIndex, HashIndexError};
use crate::schema::{Column, ColumnType, IndexKind, IndexSpec, Schema, SchemaError, WalMode};
use crate::storage::{BlockStorage, BlockStorageConfig, CompactionStats, StorageError};
use crate::wal::{RecoveredRecord, SyncPolicy, TableRecordKind, TableWal, TableWalError};

/// Errors raised by [`Table`] operations, aggregating every subsystem's
/// error type behind a single taxonomy (see `ErrorKind`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    BTree(#[from] BTreeError),

    #[error(transparent)]
    Hash(#[from] HashIndexError),

    #[error(transparent)]
    Wal(#[from] TableWalError),

    /// NOT NULL, type mismatch, or duplicate PRIMARY without `upsert`.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The writer latch could not be acquired before the caller's deadline.
    #[error("operation cancelled: deadline exceeded")]
    Cancelled,

    /// Requested non-blocking but the writer latch was held.
    #[error("writer latch busy")]
    Busy,

    #[error("internal error: {0}")]
    Internal(String),
}

/// The error taxonomy from the spec's error-handling design, independent of
/// which subsystem actually raised the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Corruption,
    Constraint,
    TypeMismatch,
    NumericOverflow,
    Busy,
    Cancelled,
    Internal,
}

impl TableError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TableError::Io(_) => ErrorKind::Io,
            TableError::Schema(SchemaError::Io(_)) => ErrorKind::Io,
            TableError::Schema(_) => ErrorKind::Corruption,
            TableError::Storage(StorageError::Io(_)) => ErrorKind::Io,
            TableError::Storage(StorageError::HeaderCorrupt(_) | StorageError::ChecksumMismatch(_)) => ErrorKind::Corruption,
            TableError::Storage(_) => ErrorKind::Internal,
            TableError::Codec(CodecError::TypeMismatch { .. }) => ErrorKind::TypeMismatch,
            TableError::Codec(CodecError::NumericOverflow(_)) => ErrorKind::NumericOverflow,
            TableError::Codec(CodecError::Constraint(_)) => ErrorKind::Constraint,
            TableError::Codec(_) => ErrorKind::Internal,
            TableError::BTree(BTreeError::Io(_)) => ErrorKind::Io,
            TableError::BTree(BTreeError::HeaderCorrupt(_)) => ErrorKind::Corruption,
            TableError::BTree(_) => ErrorKind::Internal,
            TableError::Hash(HashIndexError::Io(_)) => ErrorKind::Io,
            TableError::Hash(HashIndexError::HeaderCorrupt(_)) => ErrorKind::Corruption,
            TableError::Hash(_) => ErrorKind::Internal,
            TableError::Wal(TableWalError::Io(_)) => ErrorKind::Io,
            TableError::Wal(TableWalError::HeaderCorrupt(_) | TableWalError::RecordCorrupt { .. }) => ErrorKind::Corruption,
            TableError::Wal(_) => ErrorKind::Internal,
            TableError::Constraint(_) => ErrorKind::Constraint,
            TableError::Cancelled => ErrorKind::Cancelled,
            TableError::Busy => ErrorKind::Busy,
            TableError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// `open(path, schema?, mode)`'s `mode` parameter: whether writes are
/// accepted. Enforced at the `Table` level; the underlying files are always
/// opened read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Open-time configuration for a [`Table`]. `sync_policy` and
/// `checkpoint_interval` fall back to the `WAL_SYNC`/`WAL_CHECKPOINT_INTERVAL`
/// environment variables (see `SPEC_FULL.md` §A.3) when left `None`;
/// explicit fields always win over the environment. `cache` and
/// `mmap_growth_blocks` likewise fall back to the schema's persisted
/// `cache_capacity`/`mmap_increment_blocks` (see `Schema`'s `.desc` fields)
/// when left `None`, so a bare reopen honors whatever was set at
/// `Table::create` time instead of silently reverting to a hardcoded
/// default. There is deliberately no `growth_blocks` field here distinct
/// from `mmap_growth_blocks` — `BlockStorageConfig::growth_blocks` is fixed
/// at creation per block store, so `Table` owns that knob through the
/// schema instead of exposing a second, easily-stale copy of it.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    pub mode: OpenMode,
    pub cache: Option<CacheConfig>,
    /// Fixed at creation time; block size cannot change across a reopen.
    pub block_size: u32,
    /// Blocks to grow by on demand; `None` defers to the schema's
    /// `mmap_increment_blocks`.
    pub mmap_growth_blocks: Option<u64>,
    pub btree_page_size: u32,
    pub btree_growth_pages: u64,
    pub hash_page_size: u32,
    pub hash_growth_pages: u64,
    pub hash_initial_buckets: u32,
    pub hash_max_buckets: u32,
    pub sync_policy: Option<SyncPolicy>,
    /// Advisory only: this implementation checkpoints on explicit
    /// `Table::checkpoint()` calls and always on `close`, not on an internal
    /// timer. A caller wanting periodic checkpoints schedules them using
    /// this interval as a hint (see `DESIGN.md`'s Open Questions).
    pub checkpoint_interval: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            mode: OpenMode::ReadWrite,
            cache: None,
            block_size: BlockStorageConfig::default().block_size,
            mmap_growth_blocks: None,
            btree_page_size: 4096,
            btree_growth_pages: 256,
            hash_page_size: 4096,
            hash_growth_pages: 256,
            hash_initial_buckets: 16,
            hash_max_buckets: 1 << 16,
            sync_policy: None,
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

fn resolve_sync_policy(explicit: Option<SyncPolicy>) -> SyncPolicy {
    explicit
        .or_else(|| std::env::var("WAL_SYNC").ok().and_then(|s| SyncPolicy::from_env_str(&s)))
        .unwrap_or(SyncPolicy::Data)
}

/// Stamp any explicit `TableConfig` overrides onto the schema's persisted
/// `cache_capacity`/`mmap_increment_blocks` before it is written to (or
/// re-derived from) the `.desc` descriptor, so the descriptor always
/// reflects what the table is actually using rather than going stale the
/// first time a caller passes a non-default `TableConfig`.
fn apply_config_overrides(mut schema: Schema, config: &TableConfig) -> Schema {
    if let Some(cache) = config.cache {
        schema.cache_capacity = (cache.per_shard_capacity * cache.shards) as u32;
    }
    if let Some(growth) = config.mmap_growth_blocks {
        schema.mmap_increment_blocks = growth as u32;
    }
    schema
}

fn desc_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".desc");
    PathBuf::from(s)
}

fn wal_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".wal");
    PathBuf::from(s)
}

fn index_path(path: &Path, index_name: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".i.");
    s.push(index_name);
    PathBuf::from(s)
}

/// Fixed on-disk width, in key bytes, that `encode_index_key` produces for
/// one column of this type.
fn key_component_width(ty: ColumnType) -> usize {
    match ty {
        ColumnType::Str(n) | ColumnType::Bytes(n) => n as usize,
        other => other.fixed_width().unwrap_or(0),
    }
}

fn key_width_for(schema: &Schema, columns: &[String]) -> Result<usize, TableError> {
    let mut width = 0;
    for name in columns {
        let col = schema
            .column(name)
            .ok_or_else(|| TableError::Internal(format!("index references unknown column {name:?}")))?;
        width += key_component_width(col.ty);
    }
    Ok(width)
}

fn order_preserving_f32(v: f32) -> [u8; 4] {
    let bits = v.to_bits();
    let t = if bits & (1 << 31) != 0 { !bits } else { bits | (1 << 31) };
    t.to_be_bytes()
}

fn order_preserving_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let t = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    t.to_be_bytes()
}

/// Append the order-preserving key-encoding of one column value to `out`.
/// NULLs sort first, encoded as a zero-filled component of the column's
/// fixed key width.
fn encode_key_component(col: &Column, value: &Value, out: &mut Vec<u8>) -> Result<(), TableError> {
    if matches!(value, Value::Null) {
        out.extend(std::iter::repeat_n(0u8, key_component_width(col.ty)));
        return Ok(());
    }
    match value {
        Value::I8(v) => out.push((*v as u8) ^ 0x80),
        Value::U8(v) => out.push(*v),
        Value::I16(v) => out.extend_from_slice(&((*v as u16) ^ 0x8000).to_be_bytes()),
        Value::U16(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I32(v) => out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes()),
        Value::U32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => out.extend_from_slice(&crate::btree::encode_i64_key(*v)),
        Value::U64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::F32(v) => out.extend_from_slice(&order_preserving_f32(*v)),
        Value::F64(v) => out.extend_from_slice(&order_preserving_f64(*v)),
        Value::Decimal(v) => out.extend_from_slice(&crate::btree::encode_i64_key(*v)),
        Value::Date(v) => out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes()),
        Value::Time(v) => out.extend_from_slice(&crate::btree::encode_i64_key(*v)),
        Value::Uuid(v) | Value::Ipv6(v) => out.extend_from_slice(v),
        Value::Str(s) => {
            let ColumnType::Str(max) = col.ty else {
                return Err(TableError::Internal(format!("column {:?} is not STRING", col.name)));
            };
            let mut buf = vec![0u8; max as usize];
            let bytes = s.as_bytes();
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            out.extend_from_slice(&buf);
        }
        Value::Bytes(b) => {
            let ColumnType::Bytes(max) = col.ty else {
                return Err(TableError::Internal(format!("column {:?} is not BYTES", col.name)));
            };
            let mut buf = vec![0u8; max as usize];
            let n = b.len().min(buf.len());
            buf[..n].copy_from_slice(&b[..n]);
            out.extend_from_slice(&buf);
        }
        Value::Null => unreachable!("handled above"),
    }
    Ok(())
}

/// Encode a composite index key by concatenating the fixed-width,
/// order-preserving encoding of each named column's value, in index order.
pub fn encode_index_key(schema: &Schema, columns: &[String], row: &[Value]) -> Result<Vec<u8>, TableError> {
    let mut out = Vec::new();
    for name in columns {
        let idx = schema
            .column_index(name)
            .ok_or_else(|| TableError::Internal(format!("index references unknown column {name:?}")))?;
        let col = &schema.columns[idx];
        encode_key_component(col, &row[idx], &mut out)?;
    }
    Ok(out)
}

/// A table: composes primary storage, a row codec, indexes, a WAL and a
/// cache behind one handle. Cheap to share across reader threads via `&`;
/// writes serialize behind an internal latch.
pub struct Table {
    path: PathBuf,
    schema: Schema,
    codec: RowCodec,
    storage: BlockStorage,
    primary: BPlusTree,
    sort_indexes: Vec<(IndexSpec, BPlusTree)>,
    hash_indexes: Vec<(IndexSpec, HashIndex)>,
    wal: Option<TableWal>,
    cache: Cache<Rowid, Row>,
    write_latch: Mutex<()>,
    read_only: bool,
}

impl Table {
    /// Create a new table at `path`, writing its `.desc` descriptor and
    /// every backing file fresh.
    pub fn create<P: AsRef<Path>>(path: P, schema: Schema, config: TableConfig) -> Result<Self, TableError> {
        let path = path.as_ref();
        let schema = apply_config_overrides(schema, &config);
        std::fs::write(desc_path(path), schema.to_descriptor())?;
        Self::open_with_schema(path, schema, config, true)
    }

    /// Open an existing table at `path`, reading back its `.desc`
    /// descriptor and running WAL recovery.
    pub fn open<P: AsRef<Path>>(path: P, config: TableConfig) -> Result<Self, TableError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(desc_path(path))?;
        let schema = Schema::from_descriptor(&text)?;
        let schema = apply_config_overrides(schema, &config);
        Self::open_with_schema(path, schema, config, false)
    }

    fn open_with_schema(path: &Path, schema: Schema, config: TableConfig, creating: bool) -> Result<Self, TableError> {
        let codec = RowCodec::new(&schema);
        let growth_blocks = schema.mmap_increment_blocks as u64;
        let storage = if creating {
            BlockStorage::create(
                path,
                BlockStorageConfig {
                    block_size: config.block_size,
                    growth_blocks,
                },
            )?
        } else {
            BlockStorage::open(path, growth_blocks)?
        };

        let primary_spec = schema.primary_index().clone();
        let primary_width = key_width_for(&schema, &primary_spec.columns)?;
        let primary_path = index_path(path, &primary_spec.name);
        let primary = if creating {
            BPlusTree::create(&primary_path, primary_width, config.btree_page_size, config.btree_growth_pages)?
        } else {
            BPlusTree::open(&primary_path, config.btree_growth_pages)?
        };

        let mut sort_indexes = Vec::new();
        let mut hash_indexes = Vec::new();
        for spec in schema.secondary_indexes() {
            let ipath = index_path(path, &spec.name);
            match spec.kind {
                IndexKind::Sort => {
                    let width = key_width_for(&schema, &spec.columns)?;
                    let tree = if creating {
                        BPlusTree::create(&ipath, width, config.btree_page_size, config.btree_growth_pages)?
                    } else {
                        BPlusTree::open(&ipath, config.btree_growth_pages)?
                    };
                    sort_indexes.push((spec.clone(), tree));
                }
                IndexKind::Hash => {
                    let hash = if creating {
                        HashIndex::create(
                            &ipath,
                            config.hash_page_size,
                            config.hash_growth_pages,
                            config.hash_initial_buckets,
                            config.hash_max_buckets,
                        )?
                    } else {
                        HashIndex::open(&ipath, config.hash_growth_pages)?
                    };
                    hash_indexes.push((spec.clone(), hash));
                }
                IndexKind::Primary => unreachable!("Schema::secondary_indexes excludes PRIMARY"),
            }
        }

        let sync_policy = resolve_sync_policy(config.sync_policy);
        let wal = if schema.wal_mode == WalMode::Off {
            None
        } else {
            let (wal, recovered) = TableWal::open(wal_path(path), schema.wal_mode, sync_policy)?;
            Some((wal, recovered))
        };

        let (wal, recovered) = match wal {
            Some((wal, recovered)) => (Some(wal), recovered),
            None => (None, Vec::new()),
        };

        let cache_config = config.cache.unwrap_or_else(|| CacheConfig::with_total_capacity(schema.cache_capacity as usize, 16));

        let table = Self {
            path: path.to_path_buf(),
            schema,
            codec,
            storage,
            primary,
            sort_indexes,
            hash_indexes,
            wal,
            cache: Cache::new(cache_config),
            write_latch: Mutex::new(()),
            read_only: matches!(config.mode, OpenMode::ReadOnly),
        };

        if !recovered.is_empty() {
            table.reconcile_committed(&recovered)?;
        }

        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of live rows (exactly the PRIMARY index's entry count, per I1).
    pub fn rows(&self) -> u64 {
        self.primary.count()
    }

    fn check_writable(&self) -> Result<(), TableError> {
        if self.read_only {
            return Err(TableError::Constraint("table opened read-only".into()));
        }
        Ok(())
    }

    fn lock_writer(&self, deadline: Option<Instant>) -> Result<std::sync::MutexGuard<'_, ()>, TableError> {
        match deadline {
            None => self.write_latch.lock().map_err(|_| TableError::Internal("write latch poisoned".into())),
            Some(d) => loop {
                match self.write_latch.try_lock() {
                    Ok(g) => return Ok(g),
                    Err(TryLockError::WouldBlock) => {
                        if Instant::now() >= d {
                            return Err(TableError::Cancelled);
                        }
                        std::thread::sleep(Duration::from_micros(200));
                    }
                    Err(TryLockError::Poisoned(_)) => return Err(TableError::Internal("write latch poisoned".into())),
                },
            },
        }
    }

    /// Insert or, if `upsert`, replace the row sharing its PRIMARY key.
    /// Returns the assigned rowid.
    pub fn apply(&self, row: &[Value], upsert: bool) -> Result<Rowid, TableError> {
        self.apply_deadline(row, upsert, None)
    }

    pub fn apply_deadline(&self, row: &[Value], upsert: bool, deadline: Option<Instant>) -> Result<Rowid, TableError> {
        self.check_writable()?;
        let _guard = self.lock_writer(deadline)?;

        let primary_spec = self.schema.primary_index();
        let key = encode_index_key(&self.schema, &primary_spec.columns, row)?;
        let existing = self.primary.find(&key)?;
        if existing.is_some() && !upsert {
            return Err(TableError::Constraint("duplicate PRIMARY key without upsert".into()));
        }
        let encoded = self.codec.encode(row)?;

        let txn = match &self.wal {
            Some(wal) => Some(wal.begin()?),
            None => None,
        };

        match self.apply_txn_body(row, &encoded, existing, txn) {
            Ok(rowid) => {
                if let (Some(wal), Some(txn)) = (&self.wal, txn) {
                    wal.commit(txn)?;
                }
                Ok(rowid)
            }
            Err(e) => {
                if let (Some(wal), Some(txn)) = (&self.wal, txn) {
                    let _ = wal.rollback(txn);
                }
                Err(e)
            }
        }
    }

    fn apply_txn_body(&self, row: &[Value], encoded: &[u8], existing: Option<Rowid>, txn: Option<u64>) -> Result<Rowid, TableError> {
        if let Some(old_rowid) = existing {
            let old_bytes = self.storage.read(old_rowid as u64)?;
            let old_row = self.codec.decode(&old_bytes)?;
            self.remove_from_indexes(&old_row, old_rowid)?;
            self.storage.delete(old_rowid as u64)?;
            self.cache.invalidate(&old_rowid);
            if let (Some(wal), Some(txn)) = (&self.wal, txn) {
                wal.append_data(txn, old_rowid, Some(&old_bytes), &[])?;
            }
        }

        let block = self.storage.append(encoded)?;
        let rowid = block as Rowid;
        self.insert_into_indexes(row, rowid)?;
        if let (Some(wal), Some(txn)) = (&self.wal, txn) {
            wal.append_data(txn, rowid, None, encoded)?;
        }
        self.cache.insert(rowid, row.to_vec());
        Ok(rowid)
    }

    /// Remove the row identified by `rowid`. Returns `false` if it was
    /// already gone.
    pub fn delete(&self, rowid: Rowid) -> Result<bool, TableError> {
        self.delete_deadline(rowid, None)
    }

    pub fn delete_deadline(&self, rowid: Rowid, deadline: Option<Instant>) -> Result<bool, TableError> {
        self.check_writable()?;
        let _guard = self.lock_writer(deadline)?;

        if self.storage.is_deleted(rowid as u64) {
            return Ok(false);
        }
        let bytes = match self.storage.read(rowid as u64) {
            Ok(b) => b,
            Err(StorageError::InvalidBlockId(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let row = self.codec.decode(&bytes)?;

        let txn = match &self.wal {
            Some(wal) => Some(wal.begin()?),
            None => None,
        };

        let outcome: Result<(), TableError> = (|| {
            self.remove_from_indexes(&row, rowid)?;
            self.storage.delete(rowid as u64)?;
            self.cache.invalidate(&rowid);
            if let (Some(wal), Some(txn)) = (&self.wal, txn) {
                wal.append_data(txn, rowid, Some(&bytes), &[])?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                if let (Some(wal), Some(txn)) = (&self.wal, txn) {
                    wal.commit(txn)?;
                }
                Ok(true)
            }
            Err(e) => {
                if let (Some(wal), Some(txn)) = (&self.wal, txn) {
                    let _ = wal.rollback(txn);
                }
                Err(e)
            }
        }
    }

    /// Read a row by rowid, consulting the cache first.
    pub fn read(&self, rowid: Rowid) -> Result<Option<Row>, TableError> {
        if let Some(row) = self.cache.get(&rowid) {
            return Ok(Some(row));
        }
        if self.storage.is_deleted(rowid as u64) {
            return Ok(None);
        }
        match self.storage.read(rowid as u64) {
            Ok(bytes) => {
                let row = self.codec.decode(&bytes)?;
                self.cache.insert(rowid, row.clone());
                Ok(Some(row))
            }
            Err(StorageError::InvalidBlockId(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn insert_into_indexes(&self, row: &[Value], rowid: Rowid) -> Result<(), TableError> {
        let primary = self.schema.primary_index();
        let key = encode_index_key(&self.schema, &primary.columns, row)?;
        self.primary.insert(&key, rowid)?;
        for (spec, tree) in &self.sort_indexes {
            let key = encode_index_key(&self.schema, &spec.columns, row)?;
            tree.insert(&key, rowid)?;
        }
        for (spec, hash) in &self.hash_indexes {
            let key = encode_index_key(&self.schema, &spec.columns, row)?;
            hash.insert(&key, rowid)?;
        }
        Ok(())
    }

    fn remove_from_indexes(&self, row: &[Value], rowid: Rowid) -> Result<(), TableError> {
        let primary = self.schema.primary_index();
        let key = encode_index_key(&self.schema, &primary.columns, row)?;
        self.primary.delete(&key, rowid)?;
        for (spec, tree) in &self.sort_indexes {
            let key = encode_index_key(&self.schema, &spec.columns, row)?;
            tree.delete(&key, rowid)?;
        }
        for (spec, hash) in &self.hash_indexes {
            let key = encode_index_key(&self.schema, &spec.columns, row)?;
            hash.delete(&key, rowid)?;
        }
        Ok(())
    }

    /// Reconcile index state against every committed, replayed WAL record.
    /// `storage.append`/`delete` already durably happened before the WAL
    /// commit for each of these (see module docs); this pass only redoes
    /// index mutations, idempotently (`delete`-then-`insert`/`delete`), so
    /// a crash between a partial index update and the WAL commit cannot
    /// leave a row visible through some indexes but not others. Records are
    /// replayed in LSN order so a later tombstone always wins over an
    /// earlier insert of the same rowid.
    fn reconcile_committed(&self, records: &[RecoveredRecord]) -> Result<(), TableError> {
        for rec in records {
            if rec.kind != TableRecordKind::Data {
                continue;
            }
            if rec.target_id < 0 {
                continue;
            }
            let rowid = rec.target_id;

            if rec.after_image.is_empty() {
                match self.storage.read(rowid as u64) {
                    Ok(bytes) => {
                        if let Ok(row) = self.codec.decode(&bytes) {
                            self.remove_from_indexes(&row, rowid)?;
                        }
                        self.storage.delete(rowid as u64)?;
                        self.cache.invalidate(&rowid);
                    }
                    Err(StorageError::InvalidBlockId(_)) => {}
                    Err(StorageError::ChecksumMismatch(_)) => {
                        warn!(rowid, "skipping reconciliation of a torn block past checkpoint");
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            match self.storage.read(rowid as u64) {
                Ok(bytes) => {
                    let row = self.codec.decode(&bytes)?;
                    self.remove_from_indexes(&row, rowid)?;
                    self.insert_into_indexes(&row, rowid)?;
                }
                Err(StorageError::InvalidBlockId(_)) => {
                    warn!(rowid, "committed WAL record references a row missing from storage; skipping");
                }
                Err(StorageError::ChecksumMismatch(_)) => {
                    warn!(rowid, "skipping reconciliation of a torn block past checkpoint");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn tree_for<'a>(&'a self, index_name: &str) -> Option<&'a BPlusTree> {
        if self.schema.primary_index().name == index_name {
            return Some(&self.primary);
        }
        self.sort_indexes.iter().find(|(spec, _)| spec.name == index_name).map(|(_, t)| t)
    }

    /// Stream rowids from a PRIMARY or SORT index's range, filtering with
    /// `predicate`, skipping `skip` matches, and stopping after `limit` (if
    /// any).
    pub fn find(
        &self,
        index_name: &str,
        direction: Direction,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        mut predicate: impl FnMut(Rowid) -> bool,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Rowid>, TableError> {
        let tree = self
            .tree_for(index_name)
            .ok_or_else(|| TableError::Internal(format!("no ordered index named {index_name:?}")))?;
        let cursor = tree.range(start, end, direction)?;

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for item in cursor {
            let (_key, rowid) = item?;
            if !predicate(rowid) {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            out.push(rowid);
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Equality lookup against a HASH index. Candidates are verified by
    /// re-reading the row and re-encoding its key, so a hash collision
    /// never produces a false match.
    pub fn lookup_hash(&self, index_name: &str, key: &[u8]) -> Result<Vec<Rowid>, TableError> {
        let (spec, hash) = self
            .hash_indexes
            .iter()
            .find(|(spec, _)| spec.name == index_name)
            .ok_or_else(|| TableError::Internal(format!("no hash index named {index_name:?}")))?;

        let candidates = hash.lookup(key)?;
        let mut verified = Vec::with_capacity(candidates.len());
        for rowid in candidates {
            if let Some(row) = self.read(rowid)? {
                let actual_key = encode_index_key(&self.schema, &spec.columns, &row)?;
                if actual_key == key {
                    verified.push(rowid);
                }
            }
        }
        Ok(verified)
    }

    pub fn compact(&self) -> Result<CompactionStats, TableError> {
        Ok(self.storage.compact()?)
    }

    /// Checkpoint every subsystem. Takes the same writer latch `apply`/
    /// `delete` do: a WAL checkpoint in `WalMode::Truncate` physically
    /// truncates the file, which must never run concurrently with a
    /// transaction that has begun writing but not yet committed — doing so
    /// would destroy that transaction's BEGIN/DATA bytes out from under it
    /// while leaving its later COMMIT record referencing nothing.
    pub fn checkpoint(&self) -> Result<(), TableError> {
        let _guard = self.lock_writer(None)?;
        self.storage.checkpoint()?;
        self.primary.checkpoint()?;
        for (_, tree) in &self.sort_indexes {
            tree.checkpoint()?;
        }
        for (_, hash) in &self.hash_indexes {
            hash.checkpoint()?;
        }
        if let Some(wal) = &self.wal {
            wal.checkpoint()?;
        }
        Ok(())
    }

    /// Close the table, checkpointing every subsystem (and, in `TRUNCATE`
    /// mode, truncating the WAL) along the way.
    pub fn close(self) -> Result<(), TableError> {
        if let Some(wal) = self.wal {
            wal.close()?;
        }
        self.storage.close()?;
        self.primary.close()?;
        for (_, tree) in self.sort_indexes {
            tree.close()?;
        }
        for (_, hash) in self.hash_indexes {
            hash.close()?;
        }
        Ok(())
    }
}
