//! Persistent, disk-resident B+ tree index.
//!
//! Keys are fixed-width byte strings (an `i64` rowid encoded order-preserving,
//! or a composite key packed by [`crate::table`] by concatenating column
//! encodings to a fixed per-column width — see [`crate::table::encode_index_key`]).
//! Leaf values are `i64` rowids into the owning table's primary
//! [`crate::storage::BlockStorage`]. Duplicate keys are tolerated by the tree
//! itself (it orders entries lexicographically by `(key, rowid)`); whether
//! duplicates are a constraint violation is a policy the [`crate::table::Table`]
//! layer enforces for `PRIMARY` indexes only.
//!
//! # On-disk layout
//!
//! The backing file is a [`crate::pagefile::PageFile`]: page 0 holds the
//! tree-level header (key width, root page id, live entry count, a
//! structural generation counter), and every other page is a node:
//!
//! ```text
//! [kind:1][key_count:2][left_sibling:8][right_sibling:8][parent_hint:8]
//! leaf:     [key_0][rowid_0] [key_1][rowid_1] ...
//! internal: [key_0][key_1]...[key_{n-1}] [child_0][child_1]...[child_n]
//! ```
//!
//! `left_sibling`/`right_sibling` are meaningful only for leaves and form the
//! doubly linked list range scans walk. `parent_hint` is an optimization a
//! cursor can use to avoid a full re-descend after a split; this
//! implementation re-descends from the root on generation mismatch, which is
//! always correct and simpler to reason about than hint-chasing.

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

/// A logical row id stored as a B+ tree leaf value.
pub type Rowid = i64;

const NONE_PAGE: u64 = u64::MAX;
const MAGIC: [u8; 4] = *b"FBPT";
const VERSION: u32 = 1;
const NODE_HEADER_SIZE: usize = 1 + 2 + 8 + 8 + 8;
const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;

/// Errors raised by [`BPlusTree`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BTreeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A key of the wrong width was passed to an operation.
    #[error("key width {actual} does not match tree key width {expected}")]
    KeyWidthMismatch { expected: usize, actual: usize },

    /// A page could not hold even a single entry at the configured key width.
    #[error("page size too small for key width {0}")]
    PageTooSmall(usize),

    #[error("tree header corrupt: {0}")]
    HeaderCorrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy)]
struct TreeHeader {
    /// Stored first so a plain `pread` of the file's first 4 bytes recovers
    /// it before a [`PageFile`] (which needs `page_size` up front) can be
    /// constructed at all.
    page_size: u32,
    key_width: u32,
    root: u64,
    count: u64,
    generation: u64,
}

fn encode_header(h: &TreeHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&h.page_size.to_le_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&h.key_width.to_le_bytes());
    buf.extend_from_slice(&h.root.to_le_bytes());
    buf.extend_from_slice(&h.count.to_le_bytes());
    buf.extend_from_slice(&h.generation.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8]) -> Result<TreeHeader, BTreeError> {
    if buf.len() < 40 || buf[4..8] != MAGIC {
        return Err(BTreeError::HeaderCorrupt("bad magic".into()));
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != VERSION {
        return Err(BTreeError::HeaderCorrupt(format!("unsupported version {version}")));
    }
    Ok(TreeHeader {
        page_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        key_width: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        root: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        count: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        generation: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
    })
}

/// A decoded node, materialized from a page for in-memory manipulation.
#[derive(Debug, Clone)]
struct Node {
    is_leaf: bool,
    left: u64,
    right: u64,
    parent_hint: u64,
    /// Leaf: one key per (key, rowid) entry. Internal: separator keys,
    /// `children.len() == keys.len() + 1`.
    keys: Vec<Vec<u8>>,
    rowids: Vec<Rowid>,
    children: Vec<u64>,
}

impl Node {
    fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            left: NONE_PAGE,
            right: NONE_PAGE,
            parent_hint: NONE_PAGE,
            keys: Vec::new(),
            rowids: Vec::new(),
            children: Vec::new(),
        }
    }

    fn new_internal() -> Self {
        Self {
            is_leaf: false,
            left: NONE_PAGE,
            right: NONE_PAGE,
            parent_hint: NONE_PAGE,
            keys: Vec::new(),
            rowids: Vec::new(),
            children: Vec::new(),
        }
    }

    fn encode(&self, page_size: usize, key_width: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        buf[0] = if self.is_leaf { KIND_LEAF } else { KIND_INTERNAL };
        buf[1..3].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[3..11].copy_from_slice(&self.left.to_le_bytes());
        buf[11..19].copy_from_slice(&self.right.to_le_bytes());
        buf[19..27].copy_from_slice(&self.parent_hint.to_le_bytes());
        let mut off = NODE_HEADER_SIZE;
        if self.is_leaf {
            for (k, rid) in self.keys.iter().zip(self.rowids.iter()) {
                buf[off..off + key_width].copy_from_slice(k);
                off += key_width;
                buf[off..off + 8].copy_from_slice(&rid.to_le_bytes());
                off += 8;
            }
        } else {
            for k in &self.keys {
                buf[off..off + key_width].copy_from_slice(k);
                off += key_width;
            }
            for c in &self.children {
                buf[off..off + 8].copy_from_slice(&c.to_le_bytes());
                off += 8;
            }
        }
        buf
    }

    fn decode(buf: &[u8], key_width: usize) -> Result<Self, BTreeError> {
        let kind = buf[0];
        let key_count = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let left = u64::from_le_bytes(buf[3..11].try_into().unwrap());
        let right = u64::from_le_bytes(buf[11..19].try_into().unwrap());
        let parent_hint = u64::from_le_bytes(buf[19..27].try_into().unwrap());
        let mut off = NODE_HEADER_SIZE;
        let is_leaf = kind == KIND_LEAF;
        let mut keys = Vec::with_capacity(key_count);
        let mut rowids = Vec::new();
        let mut children = Vec::new();
        if is_leaf {
            rowids.reserve(key_count);
            for _ in 0..key_count {
                keys.push(buf[off..off + key_width].to_vec());
                off += key_width;
                rowids.push(i64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
                off += 8;
            }
        } else {
            for _ in 0..key_count {
                keys.push(buf[off..off + key_width].to_vec());
                off += key_width;
            }
            children.reserve(key_count + 1);
            for _ in 0..=key_count {
                children.push(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
                off += 8;
            }
        }
        Ok(Self {
            is_leaf,
            left,
            right,
            parent_hint,
            keys,
            rowids,
            children,
        })
    }
}

/// Direction a range scan or cursor walks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A persistent, ordered, disk-backed B+ tree index over fixed-width byte
/// string keys.
pub struct BPlusTree {
    pages: PageFile,
    path: PathBuf,
    key_width: usize,
    max_leaf: usize,
    max_internal: usize,
    root: AtomicU64,
    count: AtomicU64,
    generation: AtomicU64,
    /// Serializes structural mutation (insert/delete); reads (find, range
    /// iteration) do not take this lock — they observe whatever generation
    /// of nodes is currently on disk, consistent with the single-writer /
    /// many-reader model the rest of the engine uses.
    write_latch: Mutex<()>,
}

fn read_page_size_prefix(path: &Path) -> io::Result<u32> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut buf = [0u8; 4];
    file.read_at(&mut buf, 0)?;
    Ok(u32::from_le_bytes(buf))
}

impl BPlusTree {
    /// Create a new, empty tree at `path`. `key_width` bounds every key this
    /// tree will ever store.
    pub fn create<P: AsRef<Path>>(
        path: P,
        key_width: usize,
        page_size: u32,
        growth_pages: u64,
    ) -> Result<Self, BTreeError> {
        let path = path.as_ref();
        let pages = PageFile::create(path, page_size, growth_pages)?;

        let (max_leaf, max_internal) = capacities(page_size as usize, key_width)?;

        let root_page = pages.allocate_page()?;
        pages.write_page(root_page, &Node::new_leaf().encode(page_size as usize, key_width))?;

        let header = TreeHeader {
            page_size,
            key_width: key_width as u32,
            root: root_page,
            count: 0,
            generation: 0,
        };
        // Page 0's first 4 bytes double as the bootstrap page-size prefix
        // `open` reads before it can construct a `PageFile` at all.
        pages.write_page(0, &encode_header(&header))?;
        pages.sync()?;

        debug!(path = %path.display(), key_width, "btree created");

        Ok(Self {
            pages,
            path: path.to_path_buf(),
            key_width,
            max_leaf,
            max_internal,
            root: AtomicU64::new(root_page),
            count: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            write_latch: Mutex::new(()),
        })
    }

    /// Open an existing tree.
    pub fn open<P: AsRef<Path>>(path: P, growth_pages: u64) -> Result<Self, BTreeError> {
        let path = path.as_ref();
        let page_size = read_page_size_prefix(path)?;
        let pages = PageFile::open(path, page_size, growth_pages)?;
        let header = decode_header(&pages.read_page(0)?)?;
        let key_width = header.key_width as usize;
        let (max_leaf, max_internal) = capacities(page_size as usize, key_width)?;

        debug!(path = %path.display(), key_width, count = header.count, "btree opened");

        Ok(Self {
            pages,
            path: path.to_path_buf(),
            key_width,
            max_leaf,
            max_internal,
            root: AtomicU64::new(header.root),
            count: AtomicU64::new(header.count),
            generation: AtomicU64::new(header.generation),
            write_latch: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    /// Number of live (key, rowid) entries.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    fn check_width(&self, key: &[u8]) -> Result<(), BTreeError> {
        if key.len() != self.key_width {
            return Err(BTreeError::KeyWidthMismatch {
                expected: self.key_width,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn load_node(&self, page: u64) -> Result<Node, BTreeError> {
        Node::decode(&self.pages.read_page(page)?, self.key_width)
    }

    fn store_node(&self, page: u64, node: &Node) -> Result<(), BTreeError> {
        self.pages.write_page(page, &node.encode(self.pages.page_size() as usize, self.key_width))?;
        Ok(())
    }

    fn persist_header(&self) -> Result<(), BTreeError> {
        let header = TreeHeader {
            page_size: self.pages.page_size(),
            key_width: self.key_width as u32,
            root: self.root.load(Ordering::Acquire),
            count: self.count.load(Ordering::Acquire),
            generation: self.generation.load(Ordering::Acquire),
        };
        self.pages.write_page(0, &encode_header(&header))?;
        Ok(())
    }

    /// Point lookup: returns the first matching rowid for `key`, if any.
    /// For a tree with duplicate keys, use [`BPlusTree::range`] to see all
    /// matches.
    pub fn find(&self, key: &[u8]) -> Result<Option<Rowid>, BTreeError> {
        self.check_width(key)?;
        let leaf = self.find_leaf(key)?;
        match leaf.keys.iter().position(|k| k.as_slice() == key) {
            Some(idx) => Ok(Some(leaf.rowids[idx])),
            None => Ok(None),
        }
    }

    fn find_leaf(&self, key: &[u8]) -> Result<Node, BTreeError> {
        let (_path, leaf) = self.descend(key)?;
        Ok(leaf)
    }

    /// Descend from the root to the leaf that would contain `key`, returning
    /// the chain of (page id, node) visited (root first) and the leaf node.
    fn descend(&self, key: &[u8]) -> Result<(Vec<(u64, Node)>, Node), BTreeError> {
        let mut path = Vec::new();
        let mut page = self.root.load(Ordering::Acquire);
        loop {
            let node = self.load_node(page)?;
            if node.is_leaf {
                return Ok((path, node));
            }
            let child_idx = child_index_for(&node.keys, key);
            path.push((page, node.clone()));
            page = node.children[child_idx];
        }
    }

    /// Insert `(key, rowid)`. Duplicate keys are allowed; callers that need
    /// PRIMARY-style uniqueness must check with [`BPlusTree::find`] first.
    pub fn insert(&self, key: &[u8], rowid: Rowid) -> Result<(), BTreeError> {
        self.check_width(key)?;
        let _guard = self.write_latch.lock().map_err(|_| BTreeError::Internal("write latch poisoned".into()))?;

        let (mut path, mut leaf) = self.descend(key)?;
        let leaf_page = match path.last() {
            Some((_, parent)) => parent.children[child_index_for(&parent.keys, key)],
            None => self.root.load(Ordering::Acquire),
        };

        let insert_at = leaf
            .keys
            .iter()
            .zip(leaf.rowids.iter())
            .position(|(k, r)| (k.as_slice(), *r) > (key, rowid))
            .unwrap_or(leaf.keys.len());
        leaf.keys.insert(insert_at, key.to_vec());
        leaf.rowids.insert(insert_at, rowid);

        if leaf.keys.len() <= self.max_leaf {
            self.store_node(leaf_page, &leaf)?;
            self.count.fetch_add(1, Ordering::AcqRel);
            self.persist_header()?;
            self.pages.sync()?;
            return Ok(());
        }

        // Split the overflowing leaf.
        let mid = leaf.keys.len() / 2;
        let mut right = Node::new_leaf();
        right.keys = leaf.keys.split_off(mid);
        right.rowids = leaf.rowids.split_off(mid);
        right.right = leaf.right;
        right.left = leaf_page;

        let right_page = self.pages.allocate_page()?;
        leaf.right = right_page;
        if right.right != NONE_PAGE {
            let mut further = self.load_node(right.right)?;
            further.left = right_page;
            self.store_node(right.right, &further)?;
        }

        let separator = right.keys[0].clone();
        self.store_node(leaf_page, &leaf)?;
        self.store_node(right_page, &right)?;
        self.count.fetch_add(1, Ordering::AcqRel);

        self.insert_into_parent(&mut path, leaf_page, separator, right_page)?;
        self.bump_generation();
        self.persist_header()?;
        self.pages.sync()?;
        Ok(())
    }

    /// Propagate a split upward: insert `separator` into the parent of
    /// `left_page`, pointing at `right_page`. Recurses (iteratively) on
    /// internal-node overflow; creates a new root if `path` is empty.
    fn insert_into_parent(
        &self,
        path: &mut Vec<(u64, Node)>,
        left_page: u64,
        separator: Vec<u8>,
        right_page: u64,
    ) -> Result<(), BTreeError> {
        let Some((parent_page, mut parent)) = path.pop() else {
            // `left_page` was the root; create a fresh internal root.
            let mut new_root = Node::new_internal();
            new_root.keys.push(separator);
            new_root.children.push(left_page);
            new_root.children.push(right_page);
            let new_root_page = self.pages.allocate_page()?;
            self.store_node(new_root_page, &new_root)?;
            self.root.store(new_root_page, Ordering::Release);
            return Ok(());
        };

        let left_idx = parent.children.iter().position(|&c| c == left_page).ok_or_else(|| {
            BTreeError::Internal("split child not found in parent during propagation".into())
        })?;
        parent.keys.insert(left_idx, separator);
        parent.children.insert(left_idx + 1, right_page);

        if parent.keys.len() <= self.max_internal {
            self.store_node(parent_page, &parent)?;
            return Ok(());
        }

        // Split the overflowing internal node; its median key is promoted,
        // not duplicated into either child (unlike a leaf split).
        let mid = parent.keys.len() / 2;
        let promoted = parent.keys[mid].clone();
        let mut right = Node::new_internal();
        right.keys = parent.keys.split_off(mid + 1);
        right.children = parent.children.split_off(mid + 1);
        parent.keys.pop(); // drop the promoted key from the left node

        let right_page = self.pages.allocate_page()?;
        self.store_node(parent_page, &parent)?;
        self.store_node(right_page, &right)?;

        self.insert_into_parent(path, parent_page, promoted, right_page)
    }

    /// Delete the exact `(key, rowid)` entry. Returns whether an entry was
    /// removed.
    pub fn delete(&self, key: &[u8], rowid: Rowid) -> Result<bool, BTreeError> {
        self.check_width(key)?;
        let _guard = self.write_latch.lock().map_err(|_| BTreeError::Internal("write latch poisoned".into()))?;

        let (path, mut leaf_page_and_node) = {
            let (path, leaf) = self.descend(key)?;
            let leaf_page = path
                .last()
                .map(|(_, n)| n.children[child_index_for(&n.keys, key)])
                .unwrap_or_else(|| self.root.load(Ordering::Acquire));
            (path, (leaf_page, leaf))
        };
        let (leaf_page, leaf) = &mut leaf_page_and_node;

        let Some(idx) = leaf
            .keys
            .iter()
            .zip(leaf.rowids.iter())
            .position(|(k, r)| k.as_slice() == key && *r == rowid)
        else {
            return Ok(false);
        };
        leaf.keys.remove(idx);
        leaf.rowids.remove(idx);
        self.store_node(*leaf_page, leaf)?;
        self.count.fetch_sub(1, Ordering::AcqRel);

        let min_leaf = self.max_leaf.div_ceil(2);
        let mut path = path;
        if path.is_empty() || leaf.keys.len() >= min_leaf {
            self.bump_generation();
            self.persist_header()?;
            self.pages.sync()?;
            return Ok(true);
        }

        self.rebalance_leaf(&mut path, *leaf_page)?;
        self.bump_generation();
        self.persist_header()?;
        self.pages.sync()?;
        Ok(true)
    }

    fn rebalance_leaf(&self, path: &mut Vec<(u64, Node)>, page: u64) -> Result<(), BTreeError> {
        let Some((parent_page, mut parent)) = path.pop() else {
            return Ok(());
        };
        let idx = parent
            .children
            .iter()
            .position(|&c| c == page)
            .ok_or_else(|| BTreeError::Internal("child not found in parent during rebalance".into()))?;

        let left_sib = if idx > 0 { Some((idx - 1, parent.children[idx - 1])) } else { None };
        let right_sib = if idx + 1 < parent.children.len() {
            Some((idx + 1, parent.children[idx + 1]))
        } else {
            None
        };

        let mut node = self.load_node(page)?;
        let min_leaf = self.max_leaf.div_ceil(2);

        // Prefer the sibling with higher occupancy; tie -> left.
        let left_occ = match left_sib {
            Some((_, p)) => self.load_node(p)?.keys.len(),
            None => 0,
        };
        let right_occ = match right_sib {
            Some((_, p)) => self.load_node(p)?.keys.len(),
            None => 0,
        };

        if let Some((lidx, lpage)) = left_sib
            && left_occ >= right_occ
            && left_occ > min_leaf
        {
            let mut left = self.load_node(lpage)?;
            let k = left.keys.pop().unwrap();
            let r = left.rowids.pop().unwrap();
            node.keys.insert(0, k.clone());
            node.rowids.insert(0, r);
            self.store_node(lpage, &left)?;
            self.store_node(page, &node)?;
            parent.keys[lidx] = k;
            self.store_node(parent_page, &parent)?;
            return Ok(());
        }
        if let Some((ridx, rpage)) = right_sib
            && right_occ > min_leaf
        {
            let mut right = self.load_node(rpage)?;
            let k = right.keys.remove(0);
            let r = right.rowids.remove(0);
            node.keys.push(k);
            node.rowids.push(r);
            self.store_node(page, &node)?;
            parent.keys[ridx - 1] = right.keys.first().cloned().unwrap_or_default();
            self.store_node(parent_page, &parent)?;
            self.store_node(rpage, &right)?;
            return Ok(());
        }

        // Merge with a sibling (prefer left, matching the redistribution tie-break).
        if let Some((lidx, lpage)) = left_sib {
            let mut left = self.load_node(lpage)?;
            left.keys.extend(node.keys.drain(..));
            left.rowids.extend(node.rowids.drain(..));
            left.right = node.right;
            if node.right != NONE_PAGE {
                let mut further = self.load_node(node.right)?;
                further.left = lpage;
                self.store_node(node.right, &further)?;
            }
            self.store_node(lpage, &left)?;
            parent.keys.remove(lidx);
            parent.children.remove(idx);
            self.fixup_internal(path, parent_page, parent)?;
        } else if let Some((ridx, rpage)) = right_sib {
            let mut right = self.load_node(rpage)?;
            node.keys.append(&mut right.keys);
            node.rowids.append(&mut right.rowids);
            node.right = right.right;
            if right.right != NONE_PAGE {
                let mut further = self.load_node(right.right)?;
                further.left = page;
                self.store_node(right.right, &further)?;
            }
            self.store_node(page, &node)?;
            parent.keys.remove(ridx - 1);
            parent.children.remove(ridx);
            self.fixup_internal(path, parent_page, parent)?;
        }
        Ok(())
    }

    /// Called after removing a key/child from an internal node during merge
    /// propagation: checks for underflow and recurses, or collapses the root.
    fn fixup_internal(&self, path: &mut Vec<(u64, Node)>, page: u64, node: Node) -> Result<(), BTreeError> {
        let min_internal = self.max_internal.div_ceil(2);

        if path.is_empty() {
            // Root collapses to its single remaining child.
            if node.children.len() == 1 {
                self.root.store(node.children[0], Ordering::Release);
            } else {
                self.store_node(page, &node)?;
            }
            return Ok(());
        }

        if node.keys.len() >= min_internal {
            self.store_node(page, &node)?;
            return Ok(());
        }

        let (parent_page, mut parent) = path.pop().unwrap();
        let idx = parent
            .children
            .iter()
            .position(|&c| c == page)
            .ok_or_else(|| BTreeError::Internal("internal child not found during fixup".into()))?;

        let left_sib = if idx > 0 { Some((idx - 1, parent.children[idx - 1])) } else { None };
        let right_sib = if idx + 1 < parent.children.len() {
            Some((idx + 1, parent.children[idx + 1]))
        } else {
            None
        };

        let mut node = node;

        if let Some((lidx, lpage)) = left_sib {
            let mut left = self.load_node(lpage)?;
            if left.keys.len() > min_internal {
                // Redistribute one entry from the left sibling through the parent.
                let borrowed_key = left.keys.pop().unwrap();
                let borrowed_child = left.children.pop().unwrap();
                node.keys.insert(0, parent.keys[lidx].clone());
                node.children.insert(0, borrowed_child);
                parent.keys[lidx] = borrowed_key;
                self.store_node(lpage, &left)?;
                self.store_node(page, &node)?;
                self.store_node(parent_page, &parent)?;
                return Ok(());
            }
        }
        if let Some((ridx, rpage)) = right_sib {
            let mut right = self.load_node(rpage)?;
            if right.keys.len() > min_internal {
                let borrowed_key = right.keys.remove(0);
                let borrowed_child = right.children.remove(0);
                node.keys.push(parent.keys[ridx - 1].clone());
                node.children.push(borrowed_child);
                parent.keys[ridx - 1] = borrowed_key;
                self.store_node(rpage, &right)?;
                self.store_node(page, &node)?;
                self.store_node(parent_page, &parent)?;
                return Ok(());
            }
        }

        // Merge with a sibling, pulling the separator key down from the parent.
        if let Some((lidx, lpage)) = left_sib {
            let mut left = self.load_node(lpage)?;
            left.keys.push(parent.keys[lidx].clone());
            left.keys.extend(node.keys.drain(..));
            left.children.extend(node.children.drain(..));
            self.store_node(lpage, &left)?;
            parent.keys.remove(lidx);
            parent.children.remove(idx);
        } else if let Some((ridx, rpage)) = right_sib {
            let mut right = self.load_node(rpage)?;
            node.keys.push(parent.keys[ridx - 1].clone());
            node.keys.append(&mut right.keys);
            node.children.append(&mut right.children);
            self.store_node(page, &node)?;
            parent.keys.remove(ridx - 1);
            parent.children.remove(ridx);
        }

        self.fixup_internal(path, parent_page, parent)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Stream entries in `[start, end)` (end exclusive; `None` means
    /// unbounded on that side) in the given direction.
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, direction: Direction) -> Result<Cursor<'_>, BTreeError> {
        if let Some(k) = start {
            self.check_width(k)?;
        }
        if let Some(k) = end {
            self.check_width(k)?;
        }
        let seek_key = match direction {
            Direction::Forward => start,
            Direction::Backward => end,
        };
        let (leaf_page, idx) = match seek_key {
            Some(k) => {
                let (path, leaf) = self.descend(k)?;
                let leaf_page = path
                    .last()
                    .map(|(_, n)| n.children[child_index_for(&n.keys, k)])
                    .unwrap_or_else(|| self.root.load(Ordering::Acquire));
                let idx = leaf.keys.iter().position(|key| key.as_slice() >= k).unwrap_or(leaf.keys.len());
                (leaf_page, idx)
            }
            None => {
                let mut page = self.root.load(Ordering::Acquire);
                loop {
                    let node = self.load_node(page)?;
                    if node.is_leaf {
                        break (page, if direction == Direction::Forward { 0 } else { node.keys.len().saturating_sub(1) });
                    }
                    page = if direction == Direction::Forward {
                        node.children[0]
                    } else {
                        *node.children.last().unwrap()
                    };
                }
            }
        };

        Ok(Cursor {
            tree: self,
            leaf_page,
            slot: idx as i64,
            direction,
            end: end.map(|k| k.to_vec()),
            start: start.map(|k| k.to_vec()),
            generation: self.generation.load(Ordering::Acquire),
            exhausted: false,
        })
    }

    pub fn checkpoint(&self) -> Result<(), BTreeError> {
        self.persist_header()?;
        self.pages.sync()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), BTreeError> {
        self.checkpoint()
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint() {
            tracing::error!(path = %self.path.display(), error = %e, "btree checkpoint failed on drop");
        }
    }
}

/// Given an internal node's separator keys, the child index to descend into
/// for `key`: the largest index `i` such that `keys[i] <= key`, plus one
/// (i.e. the last child whose entire subtree could hold `key`).
fn child_index_for(keys: &[Vec<u8>], key: &[u8]) -> usize {
    match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

fn capacities(page_size: usize, key_width: usize) -> Result<(usize, usize), BTreeError> {
    let usable = page_size.checked_sub(NODE_HEADER_SIZE).ok_or(BTreeError::PageTooSmall(key_width))?;
    let leaf_entry = key_width + 8;
    let max_leaf = usable / leaf_entry;
    if max_leaf < 3 {
        return Err(BTreeError::PageTooSmall(key_width));
    }
    let internal_usable = usable.checked_sub(8).ok_or(BTreeError::PageTooSmall(key_width))?;
    let max_internal = internal_usable / (key_width + 8);
    if max_internal < 3 {
        return Err(BTreeError::PageTooSmall(key_width));
    }
    Ok((max_leaf, max_internal))
}

/// Encode an `i64` as an 8-byte big-endian, order-preserving key: flipping
/// the sign bit makes two's-complement ordering agree with unsigned
/// lexicographic byte ordering.
pub fn encode_i64_key(v: i64) -> [u8; 8] {
    ((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

/// Inverse of [`encode_i64_key`].
pub fn decode_i64_key(bytes: &[u8; 8]) -> i64 {
    (u64::from_be_bytes(*bytes) ^ 0x8000_0000_0000_0000) as i64
}

/// A streaming, stateful range iterator over a [`BPlusTree`].
///
/// Tolerates concurrent structural mutation: if the tree's generation
/// counter has advanced since the cursor's current position was computed,
/// `next()` re-descends from the root using the last-returned key before
/// continuing, rather than dereferencing a leaf page that may have been
/// split, merged, or freed.
pub struct Cursor<'a> {
    tree: &'a BPlusTree,
    leaf_page: u64,
    slot: i64,
    direction: Direction,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    generation: u64,
    exhausted: bool,
}

impl Cursor<'_> {
    fn revalidate(&mut self, last: &(Vec<u8>, Rowid)) -> Result<(), BTreeError> {
        let seek = match self.direction {
            Direction::Forward => last.0.as_slice(),
            Direction::Backward => last.0.as_slice(),
        };
        let (path, leaf) = self.tree.descend(seek)?;
        let leaf_page = path
            .last()
            .map(|(_, n)| n.children[child_index_for(&n.keys, seek)])
            .unwrap_or_else(|| self.tree.root.load(Ordering::Acquire));
        let idx = match self.direction {
            Direction::Forward => leaf
                .keys
                .iter()
                .zip(leaf.rowids.iter())
                .position(|(k, r)| (k.as_slice(), *r) > (last.0.as_slice(), last.1))
                .map(|i| i as i64)
                .unwrap_or(leaf.keys.len() as i64),
            Direction::Backward => leaf
                .keys
                .iter()
                .zip(leaf.rowids.iter())
                .rposition(|(k, r)| (k.as_slice(), *r) < (last.0.as_slice(), last.1))
                .map(|i| i as i64)
                .unwrap_or(-1),
        };
        self.leaf_page = leaf_page;
        self.slot = idx;
        self.generation = self.tree.generation.load(Ordering::Acquire);
        Ok(())
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Rowid), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        loop {
            let node = match self.tree.load_node(self.leaf_page) {
                Ok(n) => n,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            };

            if self.slot < 0 || self.slot as usize >= node.keys.len() {
                let next_leaf = if self.direction == Direction::Forward { node.right } else { node.left };
                if next_leaf == NONE_PAGE {
                    self.exhausted = true;
                    return None;
                }
                self.leaf_page = next_leaf;
                self.slot = if self.direction == Direction::Forward { 0 } else { -1 };
                if self.direction == Direction::Backward {
                    match self.tree.load_node(self.leaf_page) {
                        Ok(n) => self.slot = n.keys.len() as i64 - 1,
                        Err(e) => {
                            self.exhausted = true;
                            return Some(Err(e));
                        }
                    }
                }
                continue;
            }

            let idx = self.slot as usize;
            let key = node.keys[idx].clone();
            let rowid = node.rowids[idx];

            if let Some(end) = &self.end
                && self.direction == Direction::Forward
                && key.as_slice() >= end.as_slice()
            {
                self.exhausted = true;
                return None;
            }
            if let Some(start) = &self.start
                && self.direction == Direction::Backward
                && key.as_slice() < start.as_slice()
            {
                self.exhausted = true;
                return None;
            }

            self.slot += if self.direction == Direction::Forward { 1 } else { -1 };

            let current_gen = self.tree.generation.load(Ordering::Acquire);
            if current_gen != self.generation {
                trace!("btree cursor revalidating after structural change");
                if let Err(e) = self.revalidate(&(key.clone(), rowid)) {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }

            return Some(Ok((key, rowid)));
        }
    }
}
