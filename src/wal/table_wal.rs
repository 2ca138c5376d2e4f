//! The transactional, checkpointed write-ahead log a [`crate::table::Table`]
//! appends to before mutating its primary [`crate::storage::BlockStorage`]
//! or any index — the concrete log format [`super::Wal`] is a generic
//! building block for, but does not itself implement.
//!
//! # On-disk layout
//!
//! ```text
//! [4096-byte header] [record] [record] ...
//! ```
//!
//! The header occupies two 2048-byte shadow halves so it can be rewritten
//! atomically: both halves are read back on open, and whichever carries the
//! higher `commit_counter` wins, the same technique
//! [`crate::storage::BlockStorage`] uses for its own header. A record frame
//! is:
//!
//! ```text
//! [len:4][kind:1][txn_id:8][target_id:8][before_len:4][before][after_len:4][after][crc32c:4]
//! ```
//!
//! `len` covers every field from `kind` through the trailing `crc32c`, so a
//! reader can tell whether a candidate record's bytes even fit inside the
//! file before trusting anything else about it — this is what lets recovery
//! stop at the first implausible frame instead of scanning through
//! gigabytes of zero-padded preallocation.
//!
//! # Group commit
//!
//! Every append — `BEGIN`, `DATA`, `INDEX`, `COMMIT`, `ROLLBACK`, or
//! `CHECKPOINT` — is handed to a single background writer thread over a
//! [`crossbeam::channel`]. The thread drains whatever has accumulated since
//! its last cycle (bounded by a byte budget or a short time budget,
//! whichever comes first), issues one `write_all` and, unless the sync
//! policy is [`SyncPolicy::None`], one `fsync`, then replies to every
//! caller in that batch with the byte offset (LSN) their record landed at.
//! Concurrent `apply` calls on a busy table collapse into a handful of
//! physical writes instead of one each.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::checksum::crc32c;
use crate::schema::WalMode;

pub const HEADER_SIZE: u64 = 4096;
const SHADOW_SIZE: usize = 2048;
const MAGIC: [u8; 4] = *b"FWAL";
const VERSION: u32 = 1;
/// `kind(1) + txn_id(8) + target_id(8) + before_len(4) + after_len(4) + crc32c(4)`,
/// i.e. the smallest possible frame body (no before/after payload).
const MIN_RECORD_BODY: usize = 1 + 8 + 8 + 4 + 4 + 4;
const BATCH_BYTE_BUDGET: usize = 256 * 1024;
const BATCH_TIME_BUDGET: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TableWalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL header corrupt: {0}")]
    HeaderCorrupt(String),

    #[error("WAL record corrupt at offset {offset}: {reason}")]
    RecordCorrupt { offset: u64, reason: String },

    #[error("unknown transaction {0}")]
    UnknownTxn(u64),

    #[error("writer thread is no longer running")]
    WriterGone,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Process-wide fsync aggressiveness, configured once per table (see
/// `WAL_SYNC` in the crate's environment-variable configuration surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// No fsync at all. Fast, unsafe across power loss.
    None,
    /// fsync the WAL file after every batch.
    Data,
    /// fsync the WAL file after every batch, plus the WAL's parent
    /// directory and the table's data file at checkpoint time.
    Full,
}

impl SyncPolicy {
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "data" => Some(Self::Data),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 0,
    Commit = 1,
    Rollback = 2,
    Data = 3,
    Index = 4,
    Checkpoint = 5,
}

impl RecordKind {
    fn from_u8(tag: u8) -> Result<Self, TableWalError> {
        Ok(match tag {
            0 => Self::Begin,
            1 => Self::Commit,
            2 => Self::Rollback,
            3 => Self::Data,
            4 => Self::Index,
            5 => Self::Checkpoint,
            other => return Err(TableWalError::Internal(format!("unknown record kind tag {other}"))),
        })
    }
}

/// A record replayed from a committed transaction during recovery. Records
/// from transactions that never reached `COMMIT` (or that were explicitly
/// rolled back) are discarded before this is produced.
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    pub lsn: u64,
    pub txn_id: u64,
    pub kind: RecordKind,
    pub target_id: i64,
    pub after_image: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct HeaderState {
    created_ts: u64,
    last_txn_id: u64,
    committed_offset: u64,
    checkpoint_offset: u64,
    mode: WalMode,
    commit_counter: u64,
}

fn mode_tag(mode: WalMode) -> u8 {
    match mode {
        WalMode::Off => 0,
        WalMode::Log => 1,
        WalMode::Truncate => 2,
    }
}

fn mode_from_tag(tag: u8) -> Result<WalMode, TableWalError> {
    Ok(match tag {
        0 => WalMode::Off,
        1 => WalMode::Log,
        2 => WalMode::Truncate,
        other => return Err(TableWalError::HeaderCorrupt(format!("unknown WAL mode tag {other}"))),
    })
}

fn encode_shadow(h: &HeaderState) -> [u8; SHADOW_SIZE] {
    let mut buf = [0u8; SHADOW_SIZE];
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&MAGIC);
    body.extend_from_slice(&VERSION.to_le_bytes());
    body.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    body.extend_from_slice(&h.created_ts.to_le_bytes());
    body.extend_from_slice(&h.last_txn_id.to_le_bytes());
    body.extend_from_slice(&h.committed_offset.to_le_bytes());
    body.extend_from_slice(&h.checkpoint_offset.to_le_bytes());
    body.push(mode_tag(h.mode));
    body.extend_from_slice(&h.commit_counter.to_le_bytes());
    let crc = crc32c(&body);
    buf[..body.len()].copy_from_slice(&body);
    buf[body.len()..body.len() + 4].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_shadow(buf: &[u8]) -> Option<HeaderState> {
    if buf.len() < 4 || buf[0..4] != MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    if version != VERSION {
        return None;
    }
    let header_size = u32::from_le_bytes(buf[8..12].try_into().ok()?);
    if header_size as u64 != HEADER_SIZE {
        return None;
    }
    let created_ts = u64::from_le_bytes(buf[12..20].try_into().ok()?);
    let last_txn_id = u64::from_le_bytes(buf[20..28].try_into().ok()?);
    let committed_offset = u64::from_le_bytes(buf[28..36].try_into().ok()?);
    let checkpoint_offset = u64::from_le_bytes(buf[36..44].try_into().ok()?);
    let mode = mode_from_tag(buf[44]).ok()?;
    let commit_counter = u64::from_le_bytes(buf[45..53].try_into().ok()?);
    let body_len = 53;
    let crc = u32::from_le_bytes(buf[body_len..body_len + 4].try_into().ok()?);
    if crc32c(&buf[..body_len]) != crc {
        return None;
    }
    Some(HeaderState {
        created_ts,
        last_txn_id,
        committed_offset,
        checkpoint_offset,
        mode,
        commit_counter,
    })
}

fn encode_record(kind: RecordKind, txn_id: u64, target_id: i64, before: Option<&[u8]>, after: Option<&[u8]>) -> Vec<u8> {
    let before = before.unwrap_or(&[]);
    let after = after.unwrap_or(&[]);
    let mut body = Vec::with_capacity(MIN_RECORD_BODY + before.len() + after.len());
    body.push(kind as u8);
    body.extend_from_slice(&txn_id.to_le_bytes());
    body.extend_from_slice(&target_id.to_le_bytes());
    body.extend_from_slice(&(before.len() as u32).to_le_bytes());
    body.extend_from_slice(before);
    body.extend_from_slice(&(after.len() as u32).to_le_bytes());
    body.extend_from_slice(after);
    let crc = crc32c(&body);

    let mut frame = Vec::with_capacity(4 + body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

struct DecodedRecord {
    kind: RecordKind,
    txn_id: u64,
    target_id: i64,
    before_image: Vec<u8>,
    after_image: Vec<u8>,
    frame_len: u64,
}

/// Attempt to decode one record frame starting at `buf[0..]`. Returns
/// `Ok(None)` when `buf` does not begin with a plausible frame — either
/// because the declared length is absurd or doesn't fit, which is the
/// signal recovery uses to stop scanning instead of chasing zero padding.
fn try_decode_record(buf: &[u8]) -> Result<Option<DecodedRecord>, TableWalError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let body_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if body_len < MIN_RECORD_BODY || 4 + body_len + 4 > buf.len() {
        return Ok(None);
    }
    let body = &buf[4..4 + body_len];
    let stored_crc = u32::from_le_bytes(buf[4 + body_len..4 + body_len + 4].try_into().unwrap());
    if crc32c(body) != stored_crc {
        return Ok(None);
    }

    let kind = RecordKind::from_u8(body[0])?;
    let txn_id = u64::from_le_bytes(body[1..9].try_into().unwrap());
    let target_id = i64::from_le_bytes(body[9..17].try_into().unwrap());
    let before_len = u32::from_le_bytes(body[17..21].try_into().unwrap()) as usize;
    let before_start = 21;
    if before_start + before_len > body.len() {
        return Ok(None);
    }
    let before_image = body[before_start..before_start + before_len].to_vec();
    let after_len_start = before_start + before_len;
    if after_len_start + 4 > body.len() {
        return Ok(None);
    }
    let after_len = u32::from_le_bytes(body[after_len_start..after_len_start + 4].try_into().unwrap()) as usize;
    let after_start = after_len_start + 4;
    if after_start + after_len > body.len() {
        return Ok(None);
    }
    let after_image = body[after_start..after_start + after_len].to_vec();

    Ok(Some(DecodedRecord {
        kind,
        txn_id,
        target_id,
        before_image,
        after_image,
        frame_len: (4 + body_len + 4) as u64,
    }))
}

struct AppendRequest {
    bytes: Vec<u8>,
    kind: RecordKind,
    reply: Sender<Result<u64, TableWalError>>,
}

enum WriterMessage {
    Append(AppendRequest),
    Shutdown,
}

struct WriterShared {
    file: File,
    write_cursor: u64,
    header: HeaderState,
    sync_policy: SyncPolicy,
}

/// The transactional write-ahead log a [`crate::table::Table`] appends to.
pub struct TableWal {
    path: PathBuf,
    mode: WalMode,
    sync_policy: SyncPolicy,
    sender: Sender<WriterMessage>,
    worker: Option<JoinHandle<()>>,
    next_txn_id: AtomicU64,
    /// Snapshot of header offsets kept locally for cheap reads; the writer
    /// thread is the sole source of truth and updates this after every
    /// batch.
    offsets: Arc<Mutex<(u64, u64)>>,
    open_txns: Mutex<HashMap<u64, u64>>,
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TableWal {
    /// Open (creating if necessary) the WAL at `path`, running crash
    /// recovery per spec: validate the header, scan forward from
    /// `checkpoint_offset` bounded by the first implausible frame, discard
    /// uncommitted transactions, checkpoint, and (in `TRUNCATE` mode)
    /// truncate. Returns the live handle plus every record that belongs to
    /// a transaction that reached `COMMIT`, in LSN order, ready for the
    /// caller to replay against storage and indexes.
    pub fn open<P: AsRef<Path>>(path: P, mode: WalMode, sync_policy: SyncPolicy) -> Result<(Self, Vec<RecoveredRecord>), TableWalError> {
        let path = path.as_ref();
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;

        let (header, recovered) = if is_new {
            file.set_len(HEADER_SIZE)?;
            let header = HeaderState {
                created_ts: now_unix(),
                last_txn_id: 0,
                committed_offset: HEADER_SIZE,
                checkpoint_offset: HEADER_SIZE,
                mode,
                commit_counter: 0,
            };
            write_shadow(&file, 0, &header)?;
            file.sync_all()?;
            debug!(path = %path.display(), "table WAL created");
            (header, Vec::new())
        } else {
            recover(&file, mode)?
        };

        let offsets = Arc::new(Mutex::new((header.committed_offset, header.checkpoint_offset)));
        let write_cursor = file.metadata()?.len().max(header.committed_offset);

        let (sender, receiver) = channel::unbounded::<WriterMessage>();

        let shared = WriterShared {
            file,
            write_cursor,
            header,
            sync_policy,
        };
        let offsets_for_worker = Arc::clone(&offsets);
        let worker = std::thread::Builder::new()
            .name("flintdb-wal-writer".into())
            .spawn(move || writer_loop(shared, receiver, offsets_for_worker))
            .map_err(io::Error::other)?;

        info_opened(path, header.committed_offset, recovered.len());

        Ok((
            Self {
                path: path.to_path_buf(),
                mode,
                sync_policy,
                sender,
                worker: Some(worker),
                next_txn_id: AtomicU64::new(header.last_txn_id),
                offsets,
                open_txns: Mutex::new(HashMap::new()),
            },
            recovered,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> WalMode {
        self.mode
    }

    pub fn committed_offset(&self) -> u64 {
        self.offsets.lock().expect("wal offsets lock poisoned").0
    }

    pub fn checkpoint_offset(&self) -> u64 {
        self.offsets.lock().expect("wal offsets lock poisoned").1
    }

    /// Begin a new transaction, writing its `BEGIN` record. Returns the
    /// transaction id every subsequent `append_*`/`commit`/`rollback` call
    /// for this transaction must use.
    pub fn begin(&self) -> Result<u64, TableWalError> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = encode_record(RecordKind::Begin, txn_id, -1, None, None);
        let lsn = self.submit(frame, RecordKind::Begin)?;
        self.open_txns.lock().expect("open txns lock poisoned").insert(txn_id, lsn);
        Ok(txn_id)
    }

    /// Append a primary-storage mutation record for `txn_id`.
    pub fn append_data(&self, txn_id: u64, target_id: i64, before: Option<&[u8]>, after: &[u8]) -> Result<u64, TableWalError> {
        self.ensure_open(txn_id)?;
        let frame = encode_record(RecordKind::Data, txn_id, target_id, before, Some(after));
        self.submit(frame, RecordKind::Data)
    }

    /// Append an index mutation record for `txn_id`.
    pub fn append_index(&self, txn_id: u64, target_id: i64, before: Option<&[u8]>, after: &[u8]) -> Result<u64, TableWalError> {
        self.ensure_open(txn_id)?;
        let frame = encode_record(RecordKind::Index, txn_id, target_id, before, Some(after));
        self.submit(frame, RecordKind::Index)
    }

    /// Commit `txn_id`. Once this returns, every record appended for this
    /// transaction is durable per the configured [`SyncPolicy`].
    pub fn commit(&self, txn_id: u64) -> Result<u64, TableWalError> {
        self.ensure_open(txn_id)?;
        let frame = encode_record(RecordKind::Commit, txn_id, -1, None, None);
        let lsn = self.submit(frame, RecordKind::Commit)?;
        self.open_txns.lock().expect("open txns lock poisoned").remove(&txn_id);
        Ok(lsn)
    }

    /// Roll back `txn_id`: writes a `ROLLBACK` record so recovery knows to
    /// discard every prior record for this transaction.
    pub fn rollback(&self, txn_id: u64) -> Result<u64, TableWalError> {
        self.ensure_open(txn_id)?;
        let frame = encode_record(RecordKind::Rollback, txn_id, -1, None, None);
        let lsn = self.submit(frame, RecordKind::Rollback)?;
        self.open_txns.lock().expect("open txns lock poisoned").remove(&txn_id);
        Ok(lsn)
    }

    fn ensure_open(&self, txn_id: u64) -> Result<(), TableWalError> {
        if self.open_txns.lock().expect("open txns lock poisoned").contains_key(&txn_id) {
            Ok(())
        } else {
            Err(TableWalError::UnknownTxn(txn_id))
        }
    }

    /// Write a `CHECKPOINT` record recording the smallest in-progress
    /// transaction's begin-LSN (or the current committed offset if none are
    /// in progress), then advance `checkpoint_offset`. In `TRUNCATE` mode
    /// this also truncates the file back to the 4096-byte header.
    pub fn checkpoint(&self) -> Result<u64, TableWalError> {
        let min_open_lsn = {
            let open = self.open_txns.lock().expect("open txns lock poisoned");
            open.values().copied().min()
        };
        let target = min_open_lsn.map(|l| l as i64).unwrap_or(-1);
        let frame = encode_record(RecordKind::Checkpoint, 0, target, None, None);

        let lsn = self.submit(frame, RecordKind::Checkpoint)?;

        if self.mode == WalMode::Truncate {
            self.submit(Vec::new(), RecordKind::Checkpoint)?;
        }

        Ok(lsn)
    }

    fn submit(&self, bytes: Vec<u8>, kind: RecordKind) -> Result<u64, TableWalError> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.sender
            .send(WriterMessage::Append(AppendRequest { bytes, kind, reply: reply_tx }))
            .map_err(|_| TableWalError::WriterGone)?;
        reply_rx.recv().map_err(|_| TableWalError::WriterGone)?
    }

    /// Flush any pending batch, and in `TRUNCATE` mode checkpoint and
    /// truncate, per the "clean close always truncates" invariant — the
    /// 60-second `WAL_CHECKPOINT_INTERVAL` governs *periodic* checkpoints
    /// only, never whether a clean shutdown leaves the file truncated.
    pub fn close(mut self) -> Result<(), TableWalError> {
        self.shutdown_worker()
    }

    fn shutdown_worker(&mut self) -> Result<(), TableWalError> {
        if self.mode == WalMode::Truncate {
            self.checkpoint()?;
        }
        let _ = self.sender.send(WriterMessage::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for TableWal {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_worker() {
            error!(path = %self.path.display(), error = %e, "table WAL checkpoint failed on drop");
        }
    }
}

fn info_opened(path: &Path, committed_offset: u64, recovered: usize) {
    tracing::info!(path = %path.display(), committed_offset, recovered, "table WAL opened");
}

fn write_shadow(file: &File, commit_counter: u64, header: &HeaderState) -> io::Result<()> {
    let mut h = *header;
    h.commit_counter = commit_counter;
    let slot = (commit_counter % 2) as u64;
    let bytes = encode_shadow(&h);
    file.write_at(&bytes, slot * SHADOW_SIZE as u64)
}

fn writer_loop(mut shared: WriterShared, receiver: Receiver<WriterMessage>, offsets: Arc<Mutex<(u64, u64)>>) {
    loop {
        let first = match receiver.recv() {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let first = match first {
            WriterMessage::Append(req) => req,
            WriterMessage::Shutdown => return,
        };

        let mut shutdown_requested = false;
        let mut batch = vec![first];
        let deadline = Instant::now() + BATCH_TIME_BUDGET;
        let mut total_bytes = batch[0].bytes.len();
        while total_bytes < BATCH_BYTE_BUDGET && Instant::now() < deadline {
            match receiver.try_recv() {
                Ok(WriterMessage::Append(req)) => {
                    total_bytes += req.bytes.len();
                    batch.push(req);
                }
                Ok(WriterMessage::Shutdown) => {
                    shutdown_requested = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = apply_batch(&mut shared, &batch, &offsets) {
            for req in batch {
                let _ = req.reply.send(Err(clone_err(&e)));
            }
            if shutdown_requested {
                return;
            }
            continue;
        }

        if shutdown_requested {
            return;
        }
    }
}

fn clone_err(e: &TableWalError) -> TableWalError {
    TableWalError::Internal(e.to_string())
}

fn apply_batch(shared: &mut WriterShared, batch: &[AppendRequest], offsets: &Arc<Mutex<(u64, u64)>>) -> Result<(), TableWalError> {
    let mut buf = Vec::new();
    let mut lsns = Vec::with_capacity(batch.len());
    for req in batch {
        lsns.push(shared.write_cursor + buf.len() as u64);
        buf.extend_from_slice(&req.bytes);
    }

    if !buf.is_empty() {
        shared.file.write_at(&buf, shared.write_cursor)?;
        shared.write_cursor += buf.len() as u64;
    }

    if !matches!(shared.sync_policy, SyncPolicy::None) {
        shared.file.sync_data()?;
    }

    for (req, &lsn) in batch.iter().zip(lsns.iter()) {
        if matches!(req.kind, RecordKind::Commit | RecordKind::Checkpoint) {
            let frame_len = req.bytes.len() as u64;
            shared.header.committed_offset = shared.header.committed_offset.max(lsn + frame_len);
            if matches!(req.kind, RecordKind::Checkpoint) {
                // `target_id` carries the smallest in-progress txn's begin LSN
                // (or -1 if none was open). checkpoint_offset must stop there
                // instead of advancing past a transaction that hasn't committed.
                let target_id = try_decode_record(&req.bytes).ok().flatten().map(|r| r.target_id);
                shared.header.checkpoint_offset = match target_id {
                    Some(t) if t >= 0 => shared.header.committed_offset.min(t as u64),
                    _ => shared.header.committed_offset,
                };
            }
        }
    }

    let any_checkpoint = batch.iter().any(|r| matches!(r.kind, RecordKind::Checkpoint));
    let truncate_now = any_checkpoint && batch.iter().any(|r| r.bytes.is_empty());
    if any_checkpoint {
        shared.header.commit_counter += 1;
        write_shadow(&shared.file, shared.header.commit_counter, &shared.header)?;
        shared.file.sync_all()?;
    }

    if truncate_now {
        shared.file.set_len(HEADER_SIZE)?;
        shared.write_cursor = HEADER_SIZE;
        shared.header.committed_offset = HEADER_SIZE;
        shared.header.checkpoint_offset = HEADER_SIZE;
        shared.header.commit_counter += 1;
        write_shadow(&shared.file, shared.header.commit_counter, &shared.header)?;
        shared.file.sync_all()?;
        trace!("table WAL truncated at checkpoint");
    }

    {
        let mut guard = offsets.lock().expect("wal offsets lock poisoned");
        *guard = (shared.header.committed_offset, shared.header.checkpoint_offset);
    }

    for (req, &lsn) in batch.iter().zip(lsns.iter()) {
        let _ = req.reply.send(Ok(lsn));
    }
    Ok(())
}

/// Recovery per spec §4.6: validate the header (picking the fresher
/// shadow), scan forward from `checkpoint_offset` bounded by the first
/// implausible frame, determine which transactions reached `COMMIT`, and
/// return their `DATA`/`INDEX` records in LSN order. Advances the
/// checkpoint to the end of the scanned region and — in `TRUNCATE` mode —
/// truncates the file.
fn recover(file: &File, requested_mode: WalMode) -> Result<(HeaderState, Vec<RecoveredRecord>), TableWalError> {
    let mut shadow0 = vec![0u8; SHADOW_SIZE];
    let mut shadow1 = vec![0u8; SHADOW_SIZE];
    file.read_at(&mut shadow0, 0)?;
    file.read_at(&mut shadow1, SHADOW_SIZE as u64)?;

    let candidates: Vec<HeaderState> = [decode_shadow(&shadow0), decode_shadow(&shadow1)].into_iter().flatten().collect();
    let mut header = candidates
        .into_iter()
        .max_by_key(|h| h.commit_counter)
        .ok_or_else(|| TableWalError::HeaderCorrupt("no valid header shadow".into()))?;

    let file_len = file.metadata()?.len();
    let mut offset = header.checkpoint_offset.min(file_len);
    let mut all = Vec::new();
    let scan_end = file_len;

    while offset < scan_end {
        let remaining = (scan_end - offset).min(16 * 1024 * 1024) as usize;
        let mut peek = vec![0u8; remaining];
        let n = read_at_partial(file, &mut peek, offset)?;
        peek.truncate(n);
        match try_decode_record(&peek)? {
            Some(rec) => {
                all.push((offset, rec));
                offset += all.last().unwrap().1.frame_len;
            }
            None => break,
        }
    }

    warn_if_tail_skipped(offset, scan_end);

    let mut committed: std::collections::HashSet<u64> = std::collections::HashSet::new();
    let mut rolled_back: std::collections::HashSet<u64> = std::collections::HashSet::new();
    for (_, rec) in &all {
        match rec.kind {
            RecordKind::Commit => {
                committed.insert(rec.txn_id);
            }
            RecordKind::Rollback => {
                rolled_back.insert(rec.txn_id);
            }
            _ => {}
        }
    }

    let mut recovered = Vec::new();
    for (lsn, rec) in &all {
        if !matches!(rec.kind, RecordKind::Data | RecordKind::Index) {
            continue;
        }
        if rolled_back.contains(&rec.txn_id) || !committed.contains(&rec.txn_id) {
            continue;
        }
        recovered.push(RecoveredRecord {
            lsn: *lsn,
            txn_id: rec.txn_id,
            kind: rec.kind,
            target_id: rec.target_id,
            after_image: rec.after_image.clone(),
        });
    }

    header.committed_offset = offset.max(header.committed_offset);
    header.checkpoint_offset = header.committed_offset;
    header.mode = requested_mode;
    header.commit_counter += 1;
    write_shadow(file, header.commit_counter, &header)?;

    if requested_mode == WalMode::Truncate {
        file.set_len(HEADER_SIZE)?;
        header.committed_offset = HEADER_SIZE;
        header.checkpoint_offset = HEADER_SIZE;
        header.commit_counter += 1;
        write_shadow(file, header.commit_counter, &header)?;
    }
    file.sync_all()?;

    Ok((header, recovered))
}

fn warn_if_tail_skipped(stopped_at: u64, file_len: u64) {
    if file_len > stopped_at {
        warn!(stopped_at, file_len, "table WAL recovery stopped at first implausible frame; remainder ignored");
    }
}

fn read_at_partial(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
