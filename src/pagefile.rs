//! Shared fixed-page, mmap-backed file primitive used by [`crate::btree`]
//! and [`crate::hash_index`].
//!
//! Both index structures need the same thing `storage::BlockStorage`
//! provides for rows — a growable file of fixed-size units, read by many
//! concurrent readers through an epoch-guarded memory map while a single
//! writer rewrites whole units via `pwrite` — but addressed by plain page
//! id rather than BlockStorage's chained-record format. Factoring it here
//! keeps that concurrency discipline (and its `unsafe`) in one place
//! instead of duplicated across both index modules.
//!
//! Page 0 is reserved for the caller's own header; [`PageFile`] does not
//! interpret its contents.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crossbeam::epoch::{self, Atomic, Owned};
use memmap2::Mmap;

pub(crate) struct PageFile {
    file: File,
    page_size: u32,
    mmap: Atomic<Mmap>,
    /// Next page id that would be handed out by `allocate_page` — i.e. the
    /// logical page count, including the reserved header page.
    capacity_pages: Mutex<u64>,
    growth_pages: u64,
}

impl PageFile {
    pub(crate) fn create<P: AsRef<Path>>(path: P, page_size: u32, growth_pages: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(page_size as u64)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            file,
            page_size,
            mmap: Atomic::new(mmap),
            capacity_pages: Mutex::new(1),
            growth_pages: growth_pages.max(1),
        })
    }

    pub(crate) fn open<P: AsRef<Path>>(path: P, page_size: u32, growth_pages: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let capacity_pages = (len / page_size as u64).max(1);
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            file,
            page_size,
            mmap: Atomic::new(mmap),
            capacity_pages: Mutex::new(capacity_pages),
            growth_pages: growth_pages.max(1),
        })
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn page_count(&self) -> u64 {
        *self.capacity_pages.lock().expect("capacity_pages lock poisoned")
    }

    /// Read a copy of page `id`.
    pub(crate) fn read_page(&self, id: u64) -> io::Result<Vec<u8>> {
        let guard = epoch::pin();
        let shared = self.mmap.load(std::sync::atomic::Ordering::Acquire, &guard);
        let mmap = unsafe { shared.as_ref() }
            .ok_or_else(|| io::Error::other("page file mapping is null"))?;
        let offset = id as usize * self.page_size as usize;
        if offset + self.page_size as usize > mmap.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "page id out of range"));
        }
        Ok(mmap[offset..offset + self.page_size as usize].to_vec())
    }

    /// Overwrite page `id` in place. `id` must already be within
    /// [`PageFile::page_count`].
    pub(crate) fn write_page(&self, id: u64, data: &[u8]) -> io::Result<()> {
        debug_assert!(data.len() <= self.page_size as usize);
        let mut buf = data.to_vec();
        buf.resize(self.page_size as usize, 0);
        self.file.write_at(&buf, id as u64 * self.page_size as u64)?;
        Ok(())
    }

    /// Allocate a fresh page beyond the current end of file, growing the
    /// backing file (and remapping) if necessary, and return its id.
    pub(crate) fn allocate_page(&self) -> io::Result<u64> {
        let mut capacity = self.capacity_pages.lock().expect("capacity_pages lock poisoned");
        let id = *capacity;
        *capacity += 1;
        if *capacity > self.current_file_capacity() {
            let new_capacity = *capacity + self.growth_pages;
            self.file.set_len(new_capacity * self.page_size as u64)?;
            let new_map = unsafe { Mmap::map(&self.file)? };
            let guard = epoch::pin();
            let old = self
                .mmap
                .swap(Owned::new(new_map), std::sync::atomic::Ordering::AcqRel, &guard);
            unsafe {
                if !old.is_null() {
                    guard.defer_destroy(old);
                }
            }
        }
        Ok(id)
    }

    fn current_file_capacity(&self) -> u64 {
        self.file
            .metadata()
            .map(|m| m.len() / self.page_size as u64)
            .unwrap_or(0)
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}
