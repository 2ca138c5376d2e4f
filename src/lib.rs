//! # FlintDB
//!
//! An embeddable, columnar/row-oriented storage engine exposing typed tables
//! persisted as memory-mapped files, with secondary indexes (B+ tree, hash),
//! an append-only block store, tombstoning, and a crash-safe write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                            Table                                │
//! │  ┌───────────┐  ┌─────────────┐  ┌─────────┐  ┌──────────────┐ │
//! │  │  RowCodec  │  │ BlockStorage │  │   WAL   │  │ Cache (LRU)  │ │
//! │  │ (schema)   │  │  (primary)   │  │         │  │              │ │
//! │  └───────────┘  └─────────────┘  └─────────┘  └──────────────┘ │
//! │        ┌────────────────┐       ┌────────────────┐              │
//! │        │  B+ tree index  │       │  Hash index    │              │
//! │        └────────────────┘       └────────────────┘              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`storage`] | Fixed-block, mmap-backed, appendable slot store with tombstones |
//! | [`schema`] | Column/index/WAL-mode metadata and the `.desc` descriptor format |
//! | [`codec`] | Typed row ↔ bytes encoding (fixed-width binary, text tuple) |
//! | [`btree`] | Persistent ordered B+ tree index |
//! | [`hash_index`] | Persistent linear-probed hash index |
//! | [`wal`] | Header-stamped write-ahead log with group commit and checkpointing |
//! | [`cache`] | Bounded, sharded LRU of decoded rows and index pages |
//! | [`table`] | Composes storage, codec, indexes, WAL, and cache into a table |
//! | [`sort`] | Disk-backed multi-way external merge sort |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is durably framed in the WAL
//!   (unless the table opts out) before being applied to the primary block
//!   store.
//! - **Crash recovery** — WAL replay is idempotent and bounded by the
//!   recorded `committed_offset`, never proportional to a padded/zeroed tail.
//! - **Tombstone-aware indexes** — deleted slots are never reachable from
//!   any index, primary or secondary.
//! - **Block-level CRC32C integrity** — every block and WAL record carries a
//!   checksum, detecting torn writes on reopen.
//! - **Epoch-guarded mmap growth** — readers holding an old mapping are
//!   never handed a window that has since been unmapped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flintdb::schema::{Column, ColumnType, IndexKind, IndexSpec, Schema, WalMode};
//! use flintdb::table::{Table, TableConfig};
//!
//! let schema = Schema::builder()
//!     .column(Column::new("id", ColumnType::U32, false))
//!     .column(Column::new("name", ColumnType::Str(100), false))
//!     .index(IndexSpec::new("primary", IndexKind::Primary, vec!["id".into()]))
//!     .wal_mode(WalMode::Truncate)
//!     .build()
//!     .unwrap();
//!
//! let table = Table::create("/tmp/flintdb-quickstart", schema, TableConfig::default()).unwrap();
//! table.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod btree;
pub mod cache;
mod checksum;
pub mod codec;
pub mod encoding;
pub mod hash_index;
mod pagefile;
pub mod schema;
pub mod sort;
pub mod storage;
pub mod table;
pub mod wal;

pub use table::{Table, TableConfig, TableError};
