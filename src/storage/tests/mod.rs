use std::os::unix::fs::FileExt;

use tempfile::tempdir;

use crate::storage::{BlockStorage, BlockStorageConfig, StorageError};

fn small_config() -> BlockStorageConfig {
    // Deliberately tiny so a handful of test records span multiple blocks.
    BlockStorageConfig {
        block_size: 64,
        growth_blocks: 4,
    }
}

#[test]
fn round_trips_a_small_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    let store = BlockStorage::create(&path, small_config()).unwrap();

    let id = store.append(b"hello world").unwrap();
    let data = store.read(id).unwrap();
    assert_eq!(data, b"hello world");
}

#[test]
fn round_trips_a_record_spanning_many_blocks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    let store = BlockStorage::create(&path, small_config()).unwrap();

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let id = store.append(&payload).unwrap();
    let data = store.read(id).unwrap();
    assert_eq!(data, payload);
}

#[test]
fn deleted_record_is_unreadable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    let store = BlockStorage::create(&path, small_config()).unwrap();

    let id = store.append(b"gone soon").unwrap();
    store.delete(id).unwrap();
    assert!(store.is_deleted(id));
    assert!(matches!(store.read(id), Err(StorageError::InvalidBlockId(_))));
}

#[test]
fn compact_reclaims_blocks_for_reuse() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    let store = BlockStorage::create(&path, small_config()).unwrap();

    let big: Vec<u8> = vec![7u8; 500];
    let id = store.append(&big).unwrap();
    let capacity_before = store.capacity_blocks();
    store.delete(id).unwrap();

    let stats = store.compact().unwrap();
    assert!(stats.reclaimed_blocks > 0);
    assert_eq!(stats.reclaimed_records, 1);

    // A second append of similar size should not need to grow the file,
    // since it can reuse the blocks just freed.
    let id2 = store.append(&big).unwrap();
    assert_eq!(store.capacity_blocks(), capacity_before);
    assert_eq!(store.read(id2).unwrap(), big);
}

#[test]
fn tombstones_survive_checkpoint_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    {
        let store = BlockStorage::create(&path, small_config()).unwrap();
        let id = store.append(b"will be deleted").unwrap();
        store.delete(id).unwrap();
        store.checkpoint().unwrap();
        // id is dropped here, running another checkpoint on close; harmless.
    }

    let reopened = BlockStorage::open(&path, 4).unwrap();
    // The id that was deleted before close must still read back as gone.
    assert!(reopened.is_deleted(0));
}

#[test]
fn corrupted_block_is_detected_on_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    let id = {
        let store = BlockStorage::create(&path, small_config()).unwrap();
        let id = store.append(b"intact data").unwrap();
        store.checkpoint().unwrap();
        id
    };

    // Flip a payload byte directly on disk, invalidating its CRC32C.
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    let header_page = 4096u64;
    let payload_offset = header_page + id * 64 + 19;
    let mut byte = [0u8; 1];
    file.read_at(&mut byte, payload_offset).unwrap();
    byte[0] ^= 0xFF;
    file.write_at(&byte, payload_offset).unwrap();
    drop(file);

    let reopened = BlockStorage::open(&path, 4).unwrap();
    assert!(matches!(
        reopened.read(id),
        Err(StorageError::ChecksumMismatch(_))
    ));
}

#[test]
fn grows_file_when_free_list_is_exhausted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.blk");
    let store = BlockStorage::create(&path, small_config()).unwrap();

    let initial_capacity = store.capacity_blocks();
    for i in 0..200u32 {
        store.append(&i.to_le_bytes()).unwrap();
    }
    assert!(store.capacity_blocks() > initial_capacity);
}
