//! Write-Ahead Logging (WAL) Module
//!
//! `Table` durability is built on [`table_wal::TableWal`]: a transactional,
//! group-committing, checkpointable log of BEGIN/DATA/COMMIT/ROLLBACK/
//! CHECKPOINT records framed with the crate's own [`crate::checksum::crc32c`].
//! See [`table_wal`] for the on-disk layout, concurrency model, and recovery
//! protocol.

mod table_wal;

pub use table_wal::{
    RecordKind as TableRecordKind, RecoveredRecord, SyncPolicy, TableWal, TableWalError, HEADER_SIZE as TABLE_WAL_HEADER_SIZE,
};
