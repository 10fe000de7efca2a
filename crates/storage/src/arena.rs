//! Byte arena over paged memory.
//!
//! Ranges are handed out first-fit from a free list and coalesced on release.
//! The allocator state itself is not persisted: after a restart it is rebuilt
//! from the live ranges recorded in the metadata index, so space held by
//! anything the index no longer references is reclaimed automatically.

use crate::error::{StorageError, StorageResult};
use crate::memory::{PAGE_SIZE, PagedMemory};
use crate::traits::ByteStream;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Allocation granularity in bytes.
pub const ALLOC_ALIGN: u64 = 64;

/// Slice size used when streaming a range out of the arena (64 KiB).
const STREAM_CHUNK_SIZE: u64 = 64 * 1024;

/// A byte range inside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaRange {
    pub offset: u64,
    pub len: u64,
}

impl ArenaRange {
    pub const EMPTY: ArenaRange = ArenaRange { offset: 0, len: 0 };

    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually reserved for this range.
    fn block_len(&self) -> u64 {
        self.len.div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN
    }
}

#[derive(Debug, Default)]
struct Allocator {
    /// offset -> block length
    free: BTreeMap<u64, u64>,
    /// First byte past the highest allocated block.
    end: u64,
    in_use: u64,
}

impl Allocator {
    fn take_free(&mut self, block: u64) -> Option<u64> {
        let (&offset, &len) = self.free.iter().find(|(_, len)| **len >= block)?;
        self.free.remove(&offset);
        if len > block {
            self.free.insert(offset + block, len - block);
        }
        Some(offset)
    }

    fn overlaps_free(&self, offset: u64, block: u64) -> bool {
        if let Some((&p_off, &p_len)) = self.free.range(..=offset).next_back()
            && p_off + p_len > offset
        {
            return true;
        }
        self.free
            .range(offset..offset + block)
            .next()
            .is_some()
    }

    fn give_back(&mut self, offset: u64, block: u64) {
        let mut start = offset;
        let mut size = block;

        if let Some((&p_off, &p_len)) = self.free.range(..start).next_back()
            && p_off + p_len == start
        {
            self.free.remove(&p_off);
            start = p_off;
            size += p_len;
        }
        if let Some(n_len) = self.free.remove(&(start + size)) {
            size += n_len;
        }

        if start + size == self.end {
            self.end = start;
        } else {
            self.free.insert(start, size);
        }
    }
}

/// Allocator and accessor for ranges of a [`PagedMemory`].
pub struct ByteArena {
    memory: Arc<dyn PagedMemory>,
    alloc: Mutex<Allocator>,
}

impl ByteArena {
    /// Create an arena with no live ranges.
    pub fn new(memory: Arc<dyn PagedMemory>) -> Self {
        Self {
            memory,
            alloc: Mutex::new(Allocator::default()),
        }
    }

    /// Rebuild the allocator from the ranges still referenced by the index.
    ///
    /// Every gap between live ranges becomes free space. Overlapping live
    /// ranges mean the index is inconsistent and are rejected.
    pub fn restore(
        memory: Arc<dyn PagedMemory>,
        live: impl IntoIterator<Item = ArenaRange>,
    ) -> StorageResult<Self> {
        let mut ranges: Vec<ArenaRange> = live.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort_by_key(|r| r.offset);

        let mut alloc = Allocator::default();
        let mut cursor = 0u64;
        for range in &ranges {
            if range.offset < cursor {
                return Err(StorageError::ArenaCorrupt(format!(
                    "live range at offset {} overlaps previous range ending at {}",
                    range.offset, cursor
                )));
            }
            if range.offset > cursor {
                alloc.free.insert(cursor, range.offset - cursor);
            }
            cursor = range.offset + range.block_len();
            alloc.in_use += range.block_len();
        }
        alloc.end = cursor;

        if cursor > memory.size_bytes() {
            return Err(StorageError::ArenaCorrupt(format!(
                "live ranges end at {} but memory holds only {} bytes",
                cursor,
                memory.size_bytes()
            )));
        }

        tracing::info!(
            live_ranges = ranges.len(),
            bytes_in_use = alloc.in_use,
            free_blocks = alloc.free.len(),
            backend = memory.backend_name(),
            "Restored arena allocator"
        );

        Ok(Self {
            memory,
            alloc: Mutex::new(alloc),
        })
    }

    /// Reserve a range of `len` bytes. Grows the memory when no free block fits.
    pub fn allocate(&self, len: u64) -> StorageResult<ArenaRange> {
        if len == 0 {
            return Ok(ArenaRange::EMPTY);
        }
        let block = len
            .checked_next_multiple_of(ALLOC_ALIGN)
            .ok_or(StorageError::ArenaExhausted {
                requested: len,
                limit: u64::MAX,
            })?;

        let mut alloc = self.alloc.lock().unwrap_or_else(|e| e.into_inner());
        let offset = match alloc.take_free(block) {
            Some(offset) => offset,
            None => {
                let offset = alloc.end;
                let needed_end = offset.checked_add(block).ok_or(StorageError::ArenaExhausted {
                    requested: len,
                    limit: u64::MAX,
                })?;
                let size = self.memory.size_bytes();
                if needed_end > size {
                    let pages = (needed_end - size).div_ceil(PAGE_SIZE);
                    self.memory.grow(pages)?;
                }
                alloc.end = needed_end;
                offset
            }
        };
        alloc.in_use += block;
        Ok(ArenaRange::new(offset, len))
    }

    /// Return a range to the free list. Releasing an unknown range is logged and ignored.
    pub fn release(&self, range: ArenaRange) {
        if range.is_empty() {
            return;
        }
        let block = range.block_len();
        let mut alloc = self.alloc.lock().unwrap_or_else(|e| e.into_inner());
        if range.offset + block > alloc.end || alloc.overlaps_free(range.offset, block) {
            tracing::warn!(
                offset = range.offset,
                len = range.len,
                "Ignoring release of a range that is not allocated"
            );
            return;
        }
        alloc.give_back(range.offset, block);
        alloc.in_use -= block;
    }

    /// Write `data` at `at` bytes into `range`.
    pub fn write_at(&self, range: ArenaRange, at: u64, data: &[u8]) -> StorageResult<()> {
        Self::check_within(range, at, data.len() as u64)?;
        self.memory.write(range.offset + at, data)
    }

    /// Fill `buf` from `at` bytes into `range`.
    pub fn read_at(&self, range: ArenaRange, at: u64, buf: &mut [u8]) -> StorageResult<()> {
        Self::check_within(range, at, buf.len() as u64)?;
        self.memory.read(range.offset + at, buf)
    }

    fn check_within(range: ArenaRange, at: u64, len: u64) -> StorageResult<()> {
        match at.checked_add(len) {
            Some(end) if end <= range.len => Ok(()),
            _ => Err(StorageError::InvalidRange(format!(
                "access of {len} bytes at {at} exceeds range of {} bytes",
                range.len
            ))),
        }
    }

    /// Bytes currently reserved by live ranges.
    pub fn bytes_in_use(&self) -> u64 {
        self.alloc.lock().unwrap_or_else(|e| e.into_inner()).in_use
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.memory.sync()
    }

    /// [`sync`](Self::sync) on the blocking pool. Bytes must be flushed
    /// before the index records a range that points at them.
    pub async fn flush(self: &Arc<Self>) -> StorageResult<()> {
        let arena = Arc::clone(self);
        blocking(move || arena.sync()).await
    }

    /// Async write of `data` at `at` bytes into `range`.
    pub async fn write(self: &Arc<Self>, range: ArenaRange, at: u64, data: Bytes) -> StorageResult<()> {
        let arena = Arc::clone(self);
        blocking(move || arena.write_at(range, at, &data)).await
    }

    /// Async read of `len` bytes at `at` bytes into `range`.
    pub async fn read(self: &Arc<Self>, range: ArenaRange, at: u64, len: u64) -> StorageResult<Bytes> {
        let arena = Arc::clone(self);
        blocking(move || {
            let len = usize::try_from(len).map_err(|_| {
                StorageError::InvalidRange(format!("read of {len} bytes exceeds address space"))
            })?;
            let mut buf = vec![0u8; len];
            arena.read_at(range, at, &mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    /// Stream a whole range in 64 KiB slices.
    pub fn stream(self: &Arc<Self>, range: ArenaRange) -> ByteStream {
        let arena = Arc::clone(self);
        let stream = async_stream::try_stream! {
            let mut pos = 0u64;
            while pos < range.len {
                let n = STREAM_CHUNK_SIZE.min(range.len - pos);
                let slice = arena.read(range, pos, n).await?;
                pos += n;
                yield slice;
            }
        };
        Box::pin(stream)
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
}
