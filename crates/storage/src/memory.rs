//! Persistent paged memory.
//!
//! A flat, growable byte space addressed by offset. Growth happens in whole
//! pages. The arena allocator sits on top of this.

use crate::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Page size: 64 KiB.
pub const PAGE_SIZE: u64 = 64 * 1024;

/// A growable byte space backed by pages.
///
/// Implementations are synchronous; async callers go through `spawn_blocking`.
pub trait PagedMemory: Send + Sync + 'static {
    /// Current size in pages.
    fn size_pages(&self) -> u64;

    /// Grow by `additional` pages, returning the previous size in pages.
    fn grow(&self, additional: u64) -> StorageResult<u64>;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Write `data` starting at `offset`.
    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flush written pages to durable storage.
    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Name used for logging and metrics.
    fn backend_name(&self) -> &'static str;

    /// Current size in bytes.
    fn size_bytes(&self) -> u64 {
        self.size_pages().saturating_mul(PAGE_SIZE)
    }
}

fn check_bounds(offset: u64, len: usize, size: u64) -> StorageResult<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| StorageError::InvalidRange(format!("offset {offset} + {len} overflows")))?;
    if end > size {
        return Err(StorageError::InvalidRange(format!(
            "access [{offset}, {end}) beyond memory size {size}"
        )));
    }
    Ok(())
}

/// Volatile memory held in a vector. Contents are lost on drop.
#[derive(Default)]
pub struct VecMemory {
    bytes: RwLock<Vec<u8>>,
}

impl VecMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PagedMemory for VecMemory {
    fn size_pages(&self) -> u64 {
        let bytes = self.bytes.read().unwrap_or_else(|e| e.into_inner());
        bytes.len() as u64 / PAGE_SIZE
    }

    fn grow(&self, additional: u64) -> StorageResult<u64> {
        let mut bytes = self.bytes.write().unwrap_or_else(|e| e.into_inner());
        let previous = bytes.len() as u64 / PAGE_SIZE;
        let new_len = previous
            .checked_add(additional)
            .and_then(|pages| pages.checked_mul(PAGE_SIZE))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(StorageError::ArenaExhausted {
                requested: additional.saturating_mul(PAGE_SIZE),
                limit: usize::MAX as u64,
            })?;
        bytes.resize(new_len, 0);
        Ok(previous)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let bytes = self.bytes.read().unwrap_or_else(|e| e.into_inner());
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut bytes = self.bytes.write().unwrap_or_else(|e| e.into_inner());
        check_bounds(offset, data.len(), bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct PageFile {
    file: File,
    pages: u64,
}

/// Pages stored in a single file. Survives restarts.
pub struct FileMemory {
    inner: Mutex<PageFile>,
}

impl FileMemory {
    /// Open (or create) the page file at `path`.
    ///
    /// A file whose length is not a whole number of pages is padded up.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let pages = len.div_ceil(PAGE_SIZE);
        if pages * PAGE_SIZE != len {
            file.set_len(pages * PAGE_SIZE)?;
        }
        tracing::debug!(path = %path.display(), pages, "Opened arena page file");
        Ok(Self {
            inner: Mutex::new(PageFile { file, pages }),
        })
    }
}

impl PagedMemory for FileMemory {
    fn size_pages(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pages
    }

    fn grow(&self, additional: u64) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let previous = inner.pages;
        let new_pages = previous
            .checked_add(additional)
            .filter(|p| p.checked_mul(PAGE_SIZE).is_some())
            .ok_or(StorageError::ArenaExhausted {
                requested: additional.saturating_mul(PAGE_SIZE),
                limit: u64::MAX,
            })?;
        inner.file.set_len(new_pages * PAGE_SIZE)?;
        inner.pages = new_pages;
        Ok(previous)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        check_bounds(offset, buf.len(), inner.pages * PAGE_SIZE)?;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        check_bounds(offset, data.len(), inner.pages * PAGE_SIZE)?;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.file.sync_data()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
