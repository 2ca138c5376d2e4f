//! Persistent, linear-probed-by-chaining hash index.
//!
//! Complements [`crate::btree::BPlusTree`] for equality-only secondary
//! indexes where ordering is not needed. Buckets are fixed-size pages of
//! `(hash64, fingerprint, rowid)` entries; a bucket that fills chains to an
//! overflow page of the same layout. Growth is lazy: the index only
//! rehashes (doubling the active bucket count and redistributing every
//! entry) once the load factor crosses 0.75, rather than eagerly splitting
//! on every insert the way extendible hashing does.
//!
//! Lookups return every rowid whose stored hash matches; a genuine hash
//! collision between two distinct keys is possible, so [`crate::table::Table`]
//! always re-reads the candidate row and compares the real key before
//! trusting a hit.

#[cfg(test)]
mod tests;

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, trace};

use crate::pagefile::PageFile;

pub type Rowid = i64;

const NONE_PAGE: u64 = u64::MAX;
const MAGIC: [u8; 4] = *b"FHSH";
const VERSION: u32 = 1;
const BUCKET_HEADER_SIZE: usize = 2 + 8;
const ENTRY_SIZE: usize = 8 + 4 + 8;
const FIXED_HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8;
const LOAD_FACTOR_THRESHOLD: f64 = 0.75;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HashIndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("header corrupt: {0}")]
    HeaderCorrupt(String),

    #[error("page size too small for max_buckets={0}")]
    PageTooSmall(u32),

    #[error("bucket capacity of at least 1 entry required for this page size")]
    BucketTooSmall,

    #[error("internal error: {0}")]
    Internal(String),
}

/// FNV-1a, 64-bit. Used for bucket selection.
fn hash64(key: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// A second, independently-seeded FNV-1a variant stored alongside the hash
/// purely as a cheap pre-filter before the caller re-reads the candidate row.
fn fingerprint32(key: &[u8]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for &b in key {
        h ^= b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

#[derive(Clone, Copy)]
struct Entry {
    hash: u64,
    fingerprint: u32,
    rowid: Rowid,
}

struct Header {
    page_size: u32,
    max_buckets: u32,
    num_buckets: u64,
    count: u64,
    free_head: u64,
    generation: u64,
    dir: Vec<u64>,
}

fn encode_header(h: &Header) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FIXED_HEADER_SIZE + h.dir.len() * 8);
    buf.extend_from_slice(&h.page_size.to_le_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&h.max_buckets.to_le_bytes());
    buf.extend_from_slice(&h.num_buckets.to_le_bytes());
    buf.extend_from_slice(&h.count.to_le_bytes());
    buf.extend_from_slice(&h.free_head.to_le_bytes());
    buf.extend_from_slice(&h.generation.to_le_bytes());
    for id in &h.dir {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

fn decode_header(buf: &[u8]) -> Result<Header, HashIndexError> {
    if buf.len() < FIXED_HEADER_SIZE || buf[4..8] != MAGIC {
        return Err(HashIndexError::HeaderCorrupt("bad magic".into()));
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != VERSION {
        return Err(HashIndexError::HeaderCorrupt(format!("unsupported version {version}")));
    }
    let page_size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let max_buckets = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let num_buckets = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let count = u64::from_le_bytes(buf[24..32].try_into().unwrap());
    let free_head = u64::from_le_bytes(buf[32..40].try_into().unwrap());
    let generation = u64::from_le_bytes(buf[40..48].try_into().unwrap());
    let mut dir = Vec::with_capacity(max_buckets as usize);
    let mut off = FIXED_HEADER_SIZE;
    for _ in 0..max_buckets {
        if off + 8 > buf.len() {
            return Err(HashIndexError::HeaderCorrupt("directory truncated".into()));
        }
        dir.push(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        off += 8;
    }
    Ok(Header {
        page_size,
        max_buckets,
        num_buckets,
        count,
        free_head,
        generation,
        dir,
    })
}

fn encode_bucket(page_size: usize, entries: &[Entry], overflow: u64) -> Vec<u8> {
    let mut buf = vec![0u8; page_size];
    buf[0..2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    buf[2..10].copy_from_slice(&overflow.to_le_bytes());
    let mut off = BUCKET_HEADER_SIZE;
    for e in entries {
        buf[off..off + 8].copy_from_slice(&e.hash.to_le_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&e.fingerprint.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&e.rowid.to_le_bytes());
        off += 8;
    }
    buf
}

fn decode_bucket(buf: &[u8]) -> (Vec<Entry>, u64) {
    let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let overflow = u64::from_le_bytes(buf[2..10].try_into().unwrap());
    let mut entries = Vec::with_capacity(count);
    let mut off = BUCKET_HEADER_SIZE;
    for _ in 0..count {
        let hash = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let fingerprint = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let rowid = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        entries.push(Entry { hash, fingerprint, rowid });
    }
    (entries, overflow)
}

fn read_page_size_prefix(path: &Path) -> io::Result<u32> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut buf = [0u8; 4];
    file.read_at(&mut buf, 0)?;
    Ok(u32::from_le_bytes(buf))
}

fn bucket_capacity(page_size: u32) -> Result<usize, HashIndexError> {
    let usable = (page_size as usize).checked_sub(BUCKET_HEADER_SIZE).ok_or(HashIndexError::BucketTooSmall)?;
    let cap = usable / ENTRY_SIZE;
    if cap < 1 {
        return Err(HashIndexError::BucketTooSmall);
    }
    Ok(cap)
}

/// A persistent, disk-backed linear-probed-by-chaining hash index.
pub struct HashIndex {
    pages: PageFile,
    path: PathBuf,
    max_buckets: u32,
    bucket_capacity: usize,
    state: Mutex<HashState>,
    generation: AtomicU64,
}

struct HashState {
    num_buckets: u64,
    count: u64,
    free_head: u64,
    dir: Vec<u64>,
}

impl HashIndex {
    /// Create a new, empty index. `initial_buckets` must be a power of two
    /// and `max_buckets` (also a power of two, `>= initial_buckets`) bounds
    /// how far lazy resizing can grow the active bucket count — beyond that
    /// cap, additional entries only lengthen overflow chains.
    pub fn create<P: AsRef<Path>>(
        path: P,
        page_size: u32,
        growth_pages: u64,
        initial_buckets: u32,
        max_buckets: u32,
    ) -> Result<Self, HashIndexError> {
        assert!(initial_buckets.is_power_of_two() && max_buckets.is_power_of_two());
        assert!(max_buckets >= initial_buckets);
        let path = path.as_ref();
        let bucket_capacity = bucket_capacity(page_size)?;
        let header_bytes = FIXED_HEADER_SIZE + max_buckets as usize * 8;
        if header_bytes > page_size as usize {
            return Err(HashIndexError::PageTooSmall(max_buckets));
        }

        let pages = PageFile::create(path, page_size, growth_pages)?;

        let mut dir = vec![NONE_PAGE; max_buckets as usize];
        for slot in dir.iter_mut().take(initial_buckets as usize) {
            let page = pages.allocate_page()?;
            pages.write_page(page, &encode_bucket(page_size as usize, &[], NONE_PAGE))?;
            *slot = page;
        }

        let header = Header {
            page_size,
            max_buckets,
            num_buckets: initial_buckets as u64,
            count: 0,
            free_head: NONE_PAGE,
            generation: 0,
            dir: dir.clone(),
        };
        pages.write_page(0, &encode_header(&header))?;
        pages.sync()?;

        debug!(path = %path.display(), initial_buckets, max_buckets, "hash index created");

        Ok(Self {
            pages,
            path: path.to_path_buf(),
            max_buckets,
            bucket_capacity,
            state: Mutex::new(HashState {
                num_buckets: initial_buckets as u64,
                count: 0,
                free_head: NONE_PAGE,
                dir,
            }),
            generation: AtomicU64::new(0),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, growth_pages: u64) -> Result<Self, HashIndexError> {
        let path = path.as_ref();
        let page_size = read_page_size_prefix(path)?;
        let pages = PageFile::open(path, page_size, growth_pages)?;
        let header = decode_header(&pages.read_page(0)?)?;
        let bucket_capacity = bucket_capacity(page_size)?;

        debug!(path = %path.display(), num_buckets = header.num_buckets, count = header.count, "hash index opened");

        Ok(Self {
            pages,
            path: path.to_path_buf(),
            max_buckets: header.max_buckets,
            bucket_capacity,
            state: Mutex::new(HashState {
                num_buckets: header.num_buckets,
                count: header.count,
                free_head: header.free_head,
                dir: header.dir,
            }),
            generation: AtomicU64::new(header.generation),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.state.lock().expect("hash index state lock poisoned").count
    }

    fn persist_header(&self, state: &HashState) -> Result<(), HashIndexError> {
        let header = Header {
            page_size: self.pages.page_size(),
            max_buckets: self.max_buckets,
            num_buckets: state.num_buckets,
            count: state.count,
            free_head: state.free_head,
            generation: self.generation.load(Ordering::Acquire),
            dir: state.dir.clone(),
        };
        self.pages.write_page(0, &encode_header(&header))?;
        Ok(())
    }

    fn allocate_bucket_page(&self, state: &mut HashState) -> Result<u64, HashIndexError> {
        if state.free_head != NONE_PAGE {
            let page = state.free_head;
            let raw = self.pages.read_page(page)?;
            state.free_head = u64::from_le_bytes(raw[0..8].try_into().unwrap());
            return Ok(page);
        }
        Ok(self.pages.allocate_page()?)
    }

    fn free_bucket_page(&self, state: &mut HashState, page: u64) -> Result<(), HashIndexError> {
        let mut buf = vec![0u8; self.pages.page_size() as usize];
        buf[0..8].copy_from_slice(&state.free_head.to_le_bytes());
        self.pages.write_page(page, &buf)?;
        state.free_head = page;
        Ok(())
    }

    /// Insert `(key, rowid)`. Duplicate keys are allowed; secondary indexes
    /// rely on this.
    pub fn insert(&self, key: &[u8], rowid: Rowid) -> Result<(), HashIndexError> {
        let mut state = self.state.lock().expect("hash index state lock poisoned");
        let h = hash64(key);
        let fp = fingerprint32(key);
        self.insert_raw(&mut state, h, fp, rowid)?;
        state.count += 1;

        let load_factor = state.count as f64 / (state.num_buckets as f64 * self.bucket_capacity as f64);
        if load_factor > LOAD_FACTOR_THRESHOLD && state.num_buckets < self.max_buckets as u64 {
            self.grow(&mut state)?;
        }

        self.persist_header(&state)?;
        self.pages.sync()?;
        Ok(())
    }

    /// Insert without touching `count` or triggering a resize check; used
    /// both by `insert` and by the rehash path while redistributing.
    fn insert_raw(&self, state: &mut HashState, hash: u64, fingerprint: u32, rowid: Rowid) -> Result<(), HashIndexError> {
        let bucket_idx = (hash % state.num_buckets) as usize;
        let mut page = state.dir[bucket_idx];
        loop {
            let (mut entries, overflow) = decode_bucket(&self.pages.read_page(page)?);
            if entries.len() < self.bucket_capacity {
                entries.push(Entry { hash, fingerprint, rowid });
                self.pages.write_page(page, &encode_bucket(self.pages.page_size() as usize, &entries, overflow))?;
                return Ok(());
            }
            if overflow != NONE_PAGE {
                page = overflow;
                continue;
            }
            // Bucket chain is full; append a fresh overflow page.
            let new_page = self.allocate_bucket_page(state)?;
            self.pages.write_page(
                new_page,
                &encode_bucket(self.pages.page_size() as usize, &[Entry { hash, fingerprint, rowid }], NONE_PAGE),
            )?;
            self.pages.write_page(page, &encode_bucket(self.pages.page_size() as usize, &entries, new_page))?;
            return Ok(());
        }
    }

    /// Return every rowid whose stored `(hash, fingerprint)` matches `key`.
    /// A match here is a *candidate*, not proof of equality — the caller
    /// must re-read the row and compare real keys to rule out a genuine
    /// hash collision.
    pub fn lookup(&self, key: &[u8]) -> Result<Vec<Rowid>, HashIndexError> {
        let state = self.state.lock().expect("hash index state lock poisoned");
        let h = hash64(key);
        let fp = fingerprint32(key);
        let bucket_idx = (h % state.num_buckets) as usize;
        let mut page = state.dir[bucket_idx];
        let mut out = Vec::new();
        loop {
            let (entries, overflow) = decode_bucket(&self.pages.read_page(page)?);
            out.extend(entries.iter().filter(|e| e.hash == h && e.fingerprint == fp).map(|e| e.rowid));
            if overflow == NONE_PAGE {
                break;
            }
            page = overflow;
        }
        Ok(out)
    }

    /// Remove the exact `(key, rowid)` entry. Returns whether it was found.
    pub fn delete(&self, key: &[u8], rowid: Rowid) -> Result<bool, HashIndexError> {
        let mut state = self.state.lock().expect("hash index state lock poisoned");
        let h = hash64(key);
        let fp = fingerprint32(key);
        let bucket_idx = (h % state.num_buckets) as usize;

        let mut page = state.dir[bucket_idx];
        let mut prev: Option<u64> = None;
        loop {
            let (mut entries, overflow) = decode_bucket(&self.pages.read_page(page)?);
            if let Some(idx) = entries.iter().position(|e| e.hash == h && e.fingerprint == fp && e.rowid == rowid) {
                entries.remove(idx);
                if entries.is_empty() && overflow == NONE_PAGE && prev.is_some() {
                    // An emptied overflow page (never the bucket head) is
                    // unlinked and freed.
                    let prev_page = prev.unwrap();
                    let (prev_entries, _) = decode_bucket(&self.pages.read_page(prev_page)?);
                    self.pages.write_page(
                        prev_page,
                        &encode_bucket(self.pages.page_size() as usize, &prev_entries, NONE_PAGE),
                    )?;
                    self.free_bucket_page(&mut state, page)?;
                } else {
                    self.pages.write_page(page, &encode_bucket(self.pages.page_size() as usize, &entries, overflow))?;
                }
                state.count -= 1;
                self.persist_header(&state)?;
                self.pages.sync()?;
                return Ok(true);
            }
            if overflow == NONE_PAGE {
                return Ok(false);
            }
            prev = Some(page);
            page = overflow;
        }
    }

    /// Double the active bucket count (bounded by `max_buckets`) and
    /// redistribute every entry. Invoked automatically from `insert` once
    /// the load factor crosses 0.75.
    fn grow(&self, state: &mut HashState) -> Result<(), HashIndexError> {
        let old_num_buckets = state.num_buckets;
        let new_num_buckets = (old_num_buckets * 2).min(self.max_buckets as u64);
        if new_num_buckets == old_num_buckets {
            return Ok(());
        }

        trace!(old_num_buckets, new_num_buckets, "hash index rehashing");

        let mut collected = Vec::new();
        let mut old_pages = Vec::new();
        for &head in state.dir.iter().take(old_num_buckets as usize) {
            let mut page = head;
            loop {
                let (entries, overflow) = decode_bucket(&self.pages.read_page(page)?);
                collected.extend(entries);
                old_pages.push(page);
                if overflow == NONE_PAGE {
                    break;
                }
                page = overflow;
            }
        }

        for idx in 0..new_num_buckets as usize {
            if state.dir[idx] == NONE_PAGE {
                let page = self.allocate_bucket_page(state)?;
                self.pages.write_page(page, &encode_bucket(self.pages.page_size() as usize, &[], NONE_PAGE))?;
                state.dir[idx] = page;
            } else {
                self.pages.write_page(
                    state.dir[idx],
                    &encode_bucket(self.pages.page_size() as usize, &[], NONE_PAGE),
                )?;
            }
        }

        state.num_buckets = new_num_buckets;
        for e in collected {
            self.insert_raw(state, e.hash, e.fingerprint, e.rowid)?;
        }

        for page in old_pages {
            if !state.dir[..new_num_buckets as usize].contains(&page) {
                self.free_bucket_page(state, page)?;
            }
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<(), HashIndexError> {
        let state = self.state.lock().expect("hash index state lock poisoned");
        self.persist_header(&state)?;
        self.pages.sync()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), HashIndexError> {
        self.checkpoint()
    }
}

impl Drop for HashIndex {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint() {
            tracing::error!(path = %self.path.display(), error = %e, "hash index checkpoint failed on drop");
        }
    }
}
