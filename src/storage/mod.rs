//! Fixed-block, mmap-backed append store.
//!
//! `BlockStorage` is the lowest layer of a table: a single file laid out as
//! a 4096-byte header page followed by fixed-size blocks. Records are
//! chains of one or more blocks linked by an on-disk `next` pointer, so a
//! record larger than one block does not need to be contiguous. Deletes are
//! logical — a record's starting block id is marked in an in-memory
//! tombstone bitmap, persisted only at [`BlockStorage::checkpoint`] or
//! close, not on every delete. [`BlockStorage::compact`] walks tombstoned
//! chains and returns their blocks to the free list.
//!
//! # On-disk layout
//!
//! ```text
//! [header page: 4096 bytes, two 2048-byte shadow slots]
//! [block 0][block 1][block 2]...
//! ```
//!
//! Each block is `block_size` bytes:
//!
//! ```text
//! first block:        [flags:1][payload_len:2][crc32c:4][total_len:4][next:8][payload...]
//! continuation block:  [flags:1][payload_len:2][crc32c:4][next:8][payload...]
//! free block:          [flags:1][next_free:8][...unused]
//! ```
//!
//! `next`/`next_free` is [`NONE_BLOCK`] (`u64::MAX`) when there is none.
//! The CRC32C in every block covers only that block's payload bytes, so a
//! torn append (crash mid-write) is detected at the first block whose
//! stored checksum does not match — recovery treats that block and
//! everything after it in the chain as never written.
//!
//! # Concurrency
//!
//! Writers serialize through the single [`BlockStorage`] handle (there is
//! no multi-writer support, matching the single-writer-per-table model).
//! Readers take a snapshot of the current memory map under a
//! [`crossbeam_epoch`] guard; when a write grows the file and remaps,
//! the old mapping is retired via `guard.defer_destroy` rather than
//! unmapped immediately, so a reader that loaded the old pointer just
//! before the swap always finishes against valid memory.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crossbeam::epoch::{self, Atomic, Owned};
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::checksum::crc32c;
use crate::encoding::{self, Decode, Encode, EncodingError};

/// The id of a record's first block; the handle callers use to read or
/// delete a record.
pub type BlockId = u64;

/// Sentinel meaning "no block" (end of chain, empty free list).
pub const NONE_BLOCK: BlockId = u64::MAX;

const HEADER_PAGE_SIZE: usize = 4096;
const HEADER_SLOT_SIZE: usize = HEADER_PAGE_SIZE / 2;
const MAGIC: [u8; 4] = *b"FSTR";
const VERSION: u32 = 1;

const FLAG_CONTINUES: u8 = 0x01;
const FLAG_FREE: u8 = 0x04;

const FIRST_HEADER_SIZE: usize = 1 + 2 + 4 + 4 + 8;
const CONT_HEADER_SIZE: usize = 1 + 2 + 4 + 8;

/// Errors raised by [`BlockStorage`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Both header shadow slots failed validation — the file is not usable.
    #[error("storage header corrupt: {0}")]
    HeaderCorrupt(String),

    /// A block's stored CRC32C did not match its payload.
    #[error("block {0} checksum mismatch")]
    ChecksumMismatch(BlockId),

    /// A record referenced a block id past the end of the file, or a free
    /// block was read as if it held record data.
    #[error("invalid block id {0}")]
    InvalidBlockId(BlockId),

    /// A record exceeded `u32::MAX` bytes.
    #[error("record of {0} bytes exceeds the maximum record size")]
    RecordTooLarge(usize),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Open-time configuration for a new [`BlockStorage`] file.
#[derive(Debug, Clone, Copy)]
pub struct BlockStorageConfig {
    /// Size of each block in bytes, including its header. Must be large
    /// enough to hold [`FIRST_HEADER_SIZE`] plus at least one payload byte.
    pub block_size: u32,
    /// Number of blocks to grow the file by when the free list is empty
    /// and a new block is needed.
    pub growth_blocks: u64,
}

impl Default for BlockStorageConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            growth_blocks: 256,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StorageHeader {
    block_size: u32,
    capacity_blocks: u64,
    block_count: u64,
    free_list_head: BlockId,
    tombstone_root: BlockId,
    tombstone_len: u64,
    generation: u64,
}

impl Encode for StorageHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        self.block_size.encode_to(buf)?;
        self.capacity_blocks.encode_to(buf)?;
        self.block_count.encode_to(buf)?;
        self.free_list_head.encode_to(buf)?;
        self.tombstone_root.encode_to(buf)?;
        self.tombstone_len.encode_to(buf)?;
        self.generation.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for StorageHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
        offset += n;
        if magic != MAGIC {
            return Err(EncodingError::Custom("bad magic".into()));
        }
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if version != VERSION {
            return Err(EncodingError::Custom(format!("unsupported version {version}")));
        }
        let (block_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (capacity_blocks, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (block_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (free_list_head, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tombstone_root, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tombstone_len, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (generation, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                block_size,
                capacity_blocks,
                block_count,
                free_list_head,
                tombstone_root,
                tombstone_len,
                generation,
            },
            offset,
        ))
    }
}

fn write_header_slot(file: &File, slot: usize, header: &StorageHeader) -> Result<(), StorageError> {
    let body = encoding::encode_to_vec(header)?;
    if body.len() + 4 + 4 > HEADER_SLOT_SIZE {
        return Err(StorageError::Internal("header too large for shadow slot".into()));
    }
    let mut page = vec![0u8; HEADER_SLOT_SIZE];
    let len = body.len() as u32;
    page[0..4].copy_from_slice(&len.to_le_bytes());
    page[4..4 + body.len()].copy_from_slice(&body);
    let crc = crc32c(&body);
    let crc_off = 4 + body.len();
    page[crc_off..crc_off + 4].copy_from_slice(&crc.to_le_bytes());
    file.write_at(&page, (slot * HEADER_SLOT_SIZE) as u64)?;
    Ok(())
}

fn read_header_slot(file: &File, slot: usize) -> Option<StorageHeader> {
    let mut page = vec![0u8; HEADER_SLOT_SIZE];
    file.read_at(&mut page, (slot * HEADER_SLOT_SIZE) as u64).ok()?;
    let len = u32::from_le_bytes(page[0..4].try_into().ok()?) as usize;
    if len == 0 || len + 8 > HEADER_SLOT_SIZE {
        return None;
    }
    let body = &page[4..4 + len];
    let crc_off = 4 + len;
    let stored_crc = u32::from_le_bytes(page[crc_off..crc_off + 4].try_into().ok()?);
    if crc32c(body) != stored_crc {
        return None;
    }
    let (header, _) = StorageHeader::decode_from(body).ok()?;
    Some(header)
}

/// Write `header` to whichever shadow slot is not currently the most
/// recent, so a crash during the write never leaves both slots invalid.
fn commit_header(file: &File, header: &mut StorageHeader) -> Result<(), StorageError> {
    let current = read_newest_header(file);
    header.generation = current.map(|h| h.generation).unwrap_or(0).wrapping_add(1);
    let target_slot = match current {
        Some(_) => (header.generation as usize) % 2,
        None => 0,
    };
    write_header_slot(file, target_slot, header)?;
    file.sync_data()?;
    Ok(())
}

fn read_newest_header(file: &File) -> Option<StorageHeader> {
    let a = read_header_slot(file, 0);
    let b = read_header_slot(file, 1);
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.generation >= b.generation { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// A simple growable bitset tracking which starting-block ids are
/// logically deleted.
#[derive(Debug, Default)]
struct TombstoneSet {
    words: Vec<u64>,
}

impl TombstoneSet {
    fn ensure(&mut self, id: BlockId) {
        let word = (id / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
    }

    fn set(&mut self, id: BlockId) {
        self.ensure(id);
        self.words[(id / 64) as usize] |= 1 << (id % 64);
    }

    fn clear(&mut self, id: BlockId) {
        let word = (id / 64) as usize;
        if word < self.words.len() {
            self.words[word] &= !(1 << (id % 64));
        }
    }

    fn get(&self, id: BlockId) -> bool {
        let word = (id / 64) as usize;
        self.words
            .get(word)
            .is_some_and(|w| (w >> (id % 64)) & 1 == 1)
    }

    fn iter_set(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            (0..64).filter_map(move |b| {
                if (word >> b) & 1 == 1 {
                    Some((w as u64) * 64 + b as u64)
                } else {
                    None
                }
            })
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let words = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
            .collect();
        Self { words }
    }
}

struct StorageState {
    capacity_blocks: u64,
    block_count: u64,
    free_list_head: BlockId,
    tombstone_root: BlockId,
    tombstone_len: u64,
    generation: u64,
}

/// A fixed-block, mmap-backed append store with logical delete and a
/// reusable free list.
pub struct BlockStorage {
    file: File,
    path: PathBuf,
    block_size: u32,
    growth_blocks: u64,
    mmap: Atomic<Mmap>,
    state: Mutex<StorageState>,
    tombstones: RwLock<TombstoneSet>,
}

impl BlockStorage {
    /// Create a new, empty block store at `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: BlockStorageConfig) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if config.block_size as usize <= FIRST_HEADER_SIZE {
            return Err(StorageError::Internal(
                "block_size must exceed the first-block header size".into(),
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(HEADER_PAGE_SIZE as u64)?;

        let mut header = StorageHeader {
            block_size: config.block_size,
            capacity_blocks: 0,
            block_count: 0,
            free_list_head: NONE_BLOCK,
            tombstone_root: NONE_BLOCK,
            tombstone_len: 0,
            generation: 0,
        };
        write_header_slot(&file, 0, &header)?;
        write_header_slot(&file, 1, &header)?;
        header.generation = 0;
        file.sync_all()?;

        info!(path = %path.display(), block_size = config.block_size, "block storage created");

        Self::from_parts(file, path.to_path_buf(), config.growth_blocks, header, TombstoneSet::default())
    }

    /// Open an existing block store, validating its header and replaying
    /// its persisted tombstone bitmap.
    pub fn open<P: AsRef<Path>>(path: P, growth_blocks: u64) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = read_newest_header(&file)
            .ok_or_else(|| StorageError::HeaderCorrupt("no valid header slot".into()))?;

        let tombstones = if header.tombstone_root != NONE_BLOCK {
            let bytes = read_chain_via_file(&file, header.block_size, header.tombstone_root)?;
            TombstoneSet::from_bytes(&bytes[..bytes.len().min(header.tombstone_len as usize)])
        } else {
            TombstoneSet::default()
        };

        debug!(path = %path.display(), blocks = header.block_count, "block storage opened");
        Self::from_parts(file, path.to_path_buf(), growth_blocks, header, tombstones)
    }

    fn from_parts(
        file: File,
        path: PathBuf,
        growth_blocks: u64,
        header: StorageHeader,
        tombstones: TombstoneSet,
    ) -> Result<Self, StorageError> {
        let mmap = map_current(&file)?;
        Ok(Self {
            file,
            path,
            block_size: header.block_size,
            growth_blocks: growth_blocks.max(1),
            mmap: Atomic::new(mmap),
            state: Mutex::new(StorageState {
                capacity_blocks: header.capacity_blocks,
                block_count: header.block_count,
                free_list_head: header.free_list_head,
                tombstone_root: header.tombstone_root,
                tombstone_len: header.tombstone_len,
                generation: header.generation,
            }),
            tombstones: RwLock::new(tombstones),
        })
    }

    fn block_offset(&self, id: BlockId) -> u64 {
        HEADER_PAGE_SIZE as u64 + id * self.block_size as u64
    }

    fn capacity_first(&self) -> usize {
        self.block_size as usize - FIRST_HEADER_SIZE
    }

    fn capacity_cont(&self) -> usize {
        self.block_size as usize - CONT_HEADER_SIZE
    }

    /// Append `data` as a new record, returning the id of its first block.
    pub fn append(&self, data: &[u8]) -> Result<BlockId, StorageError> {
        let total_len = u32::try_from(data.len()).map_err(|_| StorageError::RecordTooLarge(data.len()))?;

        let cap_first = self.capacity_first();
        let cap_cont = self.capacity_cont();
        let mut chunks: Vec<&[u8]> = Vec::new();
        if data.len() <= cap_first {
            chunks.push(data);
        } else {
            chunks.push(&data[..cap_first]);
            let mut rest = &data[cap_first..];
            while !rest.is_empty() {
                let take = rest.len().min(cap_cont);
                chunks.push(&rest[..take]);
                rest = &rest[take..];
            }
        }

        let mut state = self.state.lock().map_err(|_| StorageError::Internal("state lock poisoned".into()))?;
        let mut ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            ids.push(self.allocate_block(&mut state)?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(NONE_BLOCK);
            let mut block = vec![0u8; self.block_size as usize];
            let crc = crc32c(chunk);
            if i == 0 {
                let flags = if next != NONE_BLOCK { FLAG_CONTINUES } else { 0 };
                block[0] = flags;
                block[1..3].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
                block[3..7].copy_from_slice(&crc.to_le_bytes());
                block[7..11].copy_from_slice(&total_len.to_le_bytes());
                block[11..19].copy_from_slice(&next.to_le_bytes());
                block[19..19 + chunk.len()].copy_from_slice(chunk);
            } else {
                let flags = if next != NONE_BLOCK { FLAG_CONTINUES } else { 0 };
                block[0] = flags;
                block[1..3].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
                block[3..7].copy_from_slice(&crc.to_le_bytes());
                block[7..15].copy_from_slice(&next.to_le_bytes());
                block[15..15 + chunk.len()].copy_from_slice(chunk);
            }
            self.file.write_at(&block, self.block_offset(ids[i]))?;
        }
        self.file.sync_data()?;

        trace!(blocks = ids.len(), len = total_len, "record appended");
        Ok(ids[0])
    }

    fn allocate_block(&self, state: &mut StorageState) -> Result<BlockId, StorageError> {
        if state.free_list_head != NONE_BLOCK {
            let id = state.free_list_head;
            let mut buf = vec![0u8; 9];
            self.file.read_at(&mut buf, self.block_offset(id))?;
            if buf[0] & FLAG_FREE == 0 {
                return Err(StorageError::Internal(format!(
                    "free list corrupt: block {id} is not marked free"
                )));
            }
            let next = u64::from_le_bytes(buf[1..9].try_into().unwrap());
            state.free_list_head = next;
            return Ok(id);
        }

        let id = state.block_count;
        state.block_count += 1;
        if state.block_count > state.capacity_blocks {
            self.grow(state, state.block_count)?;
        }
        Ok(id)
    }

    fn grow(&self, state: &mut StorageState, at_least: u64) -> Result<(), StorageError> {
        let new_capacity = at_least.max(state.capacity_blocks + self.growth_blocks);
        let new_len = HEADER_PAGE_SIZE as u64 + new_capacity * self.block_size as u64;
        self.file.set_len(new_len)?;
        let new_map = map_current(&self.file)?;

        let guard = epoch::pin();
        let old = self
            .mmap
            .swap(Owned::new(new_map), std::sync::atomic::Ordering::AcqRel, &guard);
        // SAFETY: `old` was produced by a previous `Owned::new` stored into
        // this same `Atomic`; nothing else retires it.
        unsafe {
            if !old.is_null() {
                guard.defer_destroy(old);
            }
        }
        state.capacity_blocks = new_capacity;
        info!(path = %self.path.display(), capacity_blocks = new_capacity, "block storage grown");
        Ok(())
    }

    /// Read the record whose first block is `id`.
    pub fn read(&self, id: BlockId) -> Result<Vec<u8>, StorageError> {
        if self.tombstones.read().map_err(|_| StorageError::Internal("tombstone lock poisoned".into()))?.get(id) {
            return Err(StorageError::InvalidBlockId(id));
        }

        let guard = epoch::pin();
        let shared = self.mmap.load(std::sync::atomic::Ordering::Acquire, &guard);
        // SAFETY: the atomic always holds a live mapping once constructed.
        let mmap = unsafe { shared.as_ref() }.ok_or_else(|| StorageError::Internal("mmap pointer is null".into()))?;

        let mut cur = id;
        let mut out: Option<Vec<u8>> = None;
        let mut first = true;
        loop {
            let offset = self.block_offset(cur) as usize;
            let header_size = if first { FIRST_HEADER_SIZE } else { CONT_HEADER_SIZE };
            if offset + header_size > mmap.len() {
                return Err(StorageError::InvalidBlockId(cur));
            }
            let block = &mmap[offset..offset + self.block_size as usize];
            let flags = block[0];
            if flags & FLAG_FREE != 0 {
                return Err(StorageError::InvalidBlockId(cur));
            }
            let payload_len = u16::from_le_bytes([block[1], block[2]]) as usize;
            let crc = u32::from_le_bytes([block[3], block[4], block[5], block[6]]);
            let (total_len, next, payload_start) = if first {
                let total_len = u32::from_le_bytes([block[7], block[8], block[9], block[10]]);
                let next = u64::from_le_bytes(block[11..19].try_into().unwrap());
                (Some(total_len), next, 19usize)
            } else {
                let next = u64::from_le_bytes(block[7..15].try_into().unwrap());
                (None, next, 15usize)
            };
            let payload = &block[payload_start..payload_start + payload_len];
            if crc32c(payload) != crc {
                warn!(block = cur, "block checksum mismatch (torn write)");
                return Err(StorageError::ChecksumMismatch(cur));
            }

            if first {
                out = Some(Vec::with_capacity(total_len.unwrap_or(0) as usize));
            }
            out.as_mut().unwrap().extend_from_slice(payload);

            if flags & FLAG_CONTINUES == 0 {
                break;
            }
            cur = next;
            first = false;
        }

        Ok(out.unwrap_or_default())
    }

    /// Logically delete the record whose first block is `id`. The blocks
    /// remain on disk (and reachable via the raw file) until
    /// [`BlockStorage::compact`] reclaims them.
    pub fn delete(&self, id: BlockId) -> Result<(), StorageError> {
        let mut tombstones = self
            .tombstones
            .write()
            .map_err(|_| StorageError::Internal("tombstone lock poisoned".into()))?;
        tombstones.set(id);
        Ok(())
    }

    /// Whether `id` is currently tombstoned.
    pub fn is_deleted(&self, id: BlockId) -> bool {
        self.tombstones
            .read()
            .map(|t| t.get(id))
            .unwrap_or(false)
    }

    /// Number of blocks the file currently has capacity for.
    pub fn capacity_blocks(&self) -> u64 {
        self.state.lock().map(|s| s.capacity_blocks).unwrap_or(0)
    }

    /// Number of blocks ever handed out by [`BlockStorage::append`]
    /// (including ones since freed).
    pub fn count(&self) -> u64 {
        self.state.lock().map(|s| s.block_count).unwrap_or(0)
    }

    /// Current on-disk file size in bytes.
    pub fn bytes(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    /// The next block id that would be handed out by an append with an
    /// empty free list — i.e. the logical write head of the store.
    pub fn head(&self) -> BlockId {
        self.state.lock().map(|s| s.block_count).unwrap_or(0)
    }

    /// Walk every tombstoned record's block chain and return its blocks to
    /// the free list. Must not be called while any reader might still
    /// dereference a tombstoned block id (the table layer guarantees this
    /// by removing index entries before compacting).
    pub fn compact(&self) -> Result<CompactionStats, StorageError> {
        let mut tombstones = self
            .tombstones
            .write()
            .map_err(|_| StorageError::Internal("tombstone lock poisoned".into()))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::Internal("state lock poisoned".into()))?;

        let guard = epoch::pin();
        let shared = self.mmap.load(std::sync::atomic::Ordering::Acquire, &guard);
        let mmap = unsafe { shared.as_ref() }.ok_or_else(|| StorageError::Internal("mmap pointer is null".into()))?;

        let mut reclaimed_blocks = 0u64;
        let mut reclaimed_records = 0u64;
        let ids: Vec<BlockId> = tombstones.iter_set().collect();
        for id in ids {
            let mut chain = Vec::new();
            let mut cur = id;
            let mut first = true;
            loop {
                let offset = self.block_offset(cur) as usize;
                let header_size = if first { FIRST_HEADER_SIZE } else { CONT_HEADER_SIZE };
                if offset + header_size > mmap.len() {
                    break;
                }
                let block = &mmap[offset..offset + self.block_size as usize];
                let flags = block[0];
                if flags & FLAG_FREE != 0 {
                    break;
                }
                let next = if first {
                    u64::from_le_bytes(block[11..19].try_into().unwrap())
                } else {
                    u64::from_le_bytes(block[7..15].try_into().unwrap())
                };
                chain.push(cur);
                if flags & FLAG_CONTINUES == 0 {
                    break;
                }
                cur = next;
                first = false;
            }

            for block_id in chain {
                let mut freed = vec![0u8; self.block_size as usize];
                freed[0] = FLAG_FREE;
                freed[1..9].copy_from_slice(&state.free_list_head.to_le_bytes());
                self.file.write_at(&freed[..9], self.block_offset(block_id))?;
                state.free_list_head = block_id;
                reclaimed_blocks += 1;
            }
            tombstones.clear(id);
            reclaimed_records += 1;
        }
        self.file.sync_data()?;

        info!(reclaimed_records, reclaimed_blocks, "block storage compacted");
        Ok(CompactionStats {
            reclaimed_records,
            reclaimed_blocks,
        })
    }

    /// Persist the header and in-memory tombstone bitmap to disk.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let tombstone_bytes = {
            let tombstones = self
                .tombstones
                .read()
                .map_err(|_| StorageError::Internal("tombstone lock poisoned".into()))?;
            tombstones.to_bytes()
        };

        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::Internal("state lock poisoned".into()))?;

        let new_root = if tombstone_bytes.is_empty() {
            NONE_BLOCK
        } else {
            drop(state);
            let id = self.append(&tombstone_bytes)?;
            state = self.state.lock().map_err(|_| StorageError::Internal("state lock poisoned".into()))?;
            id
        };

        let mut header = StorageHeader {
            block_size: self.block_size,
            capacity_blocks: state.capacity_blocks,
            block_count: state.block_count,
            free_list_head: state.free_list_head,
            tombstone_root: new_root,
            tombstone_len: tombstone_bytes.len() as u64,
            generation: state.generation,
        };
        commit_header(&self.file, &mut header)?;
        state.generation = header.generation;
        state.tombstone_root = header.tombstone_root;
        state.tombstone_len = header.tombstone_len;

        debug!(path = %self.path.display(), "block storage checkpointed");
        Ok(())
    }

    /// Flush and close the store.
    pub fn close(self) -> Result<(), StorageError> {
        self.checkpoint()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BlockStorage {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint() {
            tracing::error!(path = %self.path.display(), error = %e, "block storage checkpoint failed on drop");
        }
    }
}

/// Outcome of a [`BlockStorage::compact`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStats {
    pub reclaimed_records: u64,
    pub reclaimed_blocks: u64,
}

/// Read a record's block chain directly via `pread`, without a memory map
/// or a constructed [`BlockStorage`]. Used only during [`BlockStorage::open`]
/// to bootstrap the in-memory tombstone set before the store is otherwise
/// usable.
fn read_chain_via_file(file: &File, block_size: u32, id: BlockId) -> Result<Vec<u8>, StorageError> {
    let block_offset = |id: BlockId| HEADER_PAGE_SIZE as u64 + id * block_size as u64;
    let mut cur = id;
    let mut first = true;
    let mut out: Option<Vec<u8>> = None;
    loop {
        let mut block = vec![0u8; block_size as usize];
        file.read_at(&mut block, block_offset(cur))?;
        let flags = block[0];
        if flags & FLAG_FREE != 0 {
            return Err(StorageError::InvalidBlockId(cur));
        }
        let payload_len = u16::from_le_bytes([block[1], block[2]]) as usize;
        let crc = u32::from_le_bytes([block[3], block[4], block[5], block[6]]);
        let (total_len, next, payload_start) = if first {
            let total_len = u32::from_le_bytes([block[7], block[8], block[9], block[10]]);
            let next = u64::from_le_bytes(block[11..19].try_into().unwrap());
            (Some(total_len), next, 19usize)
        } else {
            let next = u64::from_le_bytes(block[7..15].try_into().unwrap());
            (None, next, 15usize)
        };
        let payload = &block[payload_start..payload_start + payload_len];
        if crc32c(payload) != crc {
            return Err(StorageError::ChecksumMismatch(cur));
        }
        if first {
            out = Some(Vec::with_capacity(total_len.unwrap_or(0) as usize));
        }
        out.as_mut().unwrap().extend_from_slice(payload);
        if flags & FLAG_CONTINUES == 0 {
            break;
        }
        cur = next;
        first = false;
    }
    Ok(out.unwrap_or_default())
}

fn map_current(file: &File) -> Result<Mmap, StorageError> {
    // SAFETY: the file is exclusively owned by this `BlockStorage` (or a
    // clone of its handle created under the same discipline); nothing
    // truncates it concurrently with a live mapping.
    let mmap = unsafe { Mmap::map(file)? };
    Ok(mmap)
}
