//! Read-through cache of a file
//!
//! Caches file contents with page granularity (4 KiB, matching the disk
//! DMA alignment). Cached pages are refcounted buffers shared with
//! readers; they are evicted by the invalidate family, by the per-file
//! page LRU when a capacity is set, or when the object is dropped.
//!
//! Reads produce a stream of page-sized chunks. The first chunk is
//! trimmed at `offset % page_size`; the last page is short when the file
//! size is not page-aligned. Write-side operations are unsupported.

use crate::lru::Lru;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::fragment::Priority;
use tessera_core::{Error, Result};

/// Page size of the cache. Aligned with disk DMA requirements; 4 KiB is
/// always safe.
pub const PAGE_SIZE: u64 = 4096;

/// Whether a read may touch the backing file or must be served from
/// resident pages only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Misses read from the backing file.
    #[default]
    ReadThrough,
    /// Misses fail with [`Error::NotCached`].
    CacheOnly,
}

/// Backing storage a cached file reads from.
pub trait PageSource: Send + Sync {
    /// Reads exactly `len` bytes at `offset`, unless the file ends first.
    fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>>;
}

impl PageSource for std::fs::File {
    fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = FileExt::read_at(self, &mut buf[read..], offset + read as u64)?;
            if n == 0 {
                buf.truncate(read);
                break;
            }
            read += n;
        }
        Ok(buf)
    }
}

/// Metrics of one or more cached files. Shared instances accumulate the
/// sum of operations on every file they are attached to.
#[derive(Debug, Default)]
pub struct FileMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    populations: AtomicU64,
    evictions: AtomicU64,
    cached_bytes: AtomicU64,
}

/// Point-in-time snapshot of [`FileMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetricsSnapshot {
    /// Page reads served from cache.
    pub hits: u64,
    /// Page reads that went to the backing file.
    pub misses: u64,
    /// Pages inserted.
    pub populations: u64,
    /// Pages evicted.
    pub evictions: u64,
    /// Bytes resident.
    pub cached_bytes: u64,
}

impl FileMetrics {
    /// Fresh zeroed metrics.
    pub fn new() -> Arc<FileMetrics> {
        Arc::new(FileMetrics::default())
    }

    /// Current values.
    pub fn snapshot(&self) -> FileMetricsSnapshot {
        FileMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            populations: self.populations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cached_bytes: self.cached_bytes.load(Ordering::Relaxed),
        }
    }
}

struct PageState {
    pages: BTreeMap<u64, Bytes>,
    lru: Lru<u64>,
    cached_bytes: u64,
}

/// A read-through page cache over one file.
pub struct CachedFile {
    source: Box<dyn PageSource>,
    metrics: Arc<FileMetrics>,
    state: Mutex<PageState>,
    size: u64,
    last_page: u64,
    last_page_size: u64,
    // Resident-page bound; None leaves eviction to invalidation only.
    capacity_pages: Option<usize>,
}

impl CachedFile {
    /// Creates a cache over `size` bytes of the given source.
    pub fn new(source: Box<dyn PageSource>, size: u64, metrics: Arc<FileMetrics>) -> CachedFile {
        Self::with_capacity(source, size, metrics, None)
    }

    /// Like [`Self::new`] with a bound on resident pages.
    pub fn with_capacity(
        source: Box<dyn PageSource>,
        size: u64,
        metrics: Arc<FileMetrics>,
        capacity_pages: Option<usize>,
    ) -> CachedFile {
        let last_byte = size.saturating_sub(1);
        CachedFile {
            source,
            metrics,
            state: Mutex::new(PageState {
                pages: BTreeMap::new(),
                lru: Lru::new(),
                cached_bytes: 0,
            }),
            size,
            last_page: last_byte / PAGE_SIZE,
            last_page_size: (last_byte % PAGE_SIZE) + u64::from(size != 0),
            capacity_pages,
        }
    }

    /// Number of bytes in the cached area.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of bytes resident.
    pub fn cached_bytes(&self) -> u64 {
        self.state.lock().cached_bytes
    }

    /// Number of pages resident.
    pub fn cached_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    fn get_page(&self, idx: u64, mode: CacheMode) -> Result<Bytes> {
        {
            let mut st = self.state.lock();
            if let Some(page) = st.pages.get(&idx) {
                let page = page.clone();
                st.lru.touch(idx);
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(page);
            }
        }
        if mode == CacheMode::CacheOnly {
            return Err(Error::NotCached);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let len = if idx == self.last_page {
            self.last_page_size
        } else {
            PAGE_SIZE
        };
        let buf = self.source.read_at(idx * PAGE_SIZE, len as usize)?;
        if (buf.len() as u64) < len {
            return Err(Error::corruption(format!(
                "short read of page {idx}: {} of {len} bytes",
                buf.len()
            )));
        }
        let page = Bytes::from(buf);
        let mut st = self.state.lock();
        if !st.pages.contains_key(&idx) {
            st.cached_bytes += page.len() as u64;
            self.metrics
                .cached_bytes
                .fetch_add(page.len() as u64, Ordering::Relaxed);
            self.metrics.populations.fetch_add(1, Ordering::Relaxed);
            st.pages.insert(idx, page.clone());
            st.lru.push_front(idx, idx);
            if let Some(cap) = self.capacity_pages {
                while st.pages.len() > cap {
                    let Some((_, victim)) = st.lru.pop_back() else {
                        break;
                    };
                    self.drop_page(&mut st, victim);
                }
            }
        }
        Ok(page)
    }

    fn drop_page(&self, st: &mut PageState, idx: u64) {
        if let Some(page) = st.pages.remove(&idx) {
            st.lru.unlink(idx);
            st.cached_bytes -= page.len() as u64;
            self.metrics
                .cached_bytes
                .fetch_sub(page.len() as u64, Ordering::Relaxed);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Opens a stream over the file contents starting at `offset`.
    pub fn read(&self, offset: u64, _priority: Priority, mode: CacheMode) -> PageStream<'_> {
        if offset >= self.size {
            return PageStream {
                file: self,
                mode,
                page_idx: u64::MAX,
                offset_in_page: 0,
                exhausted: true,
            };
        }
        PageStream {
            file: self,
            mode,
            page_idx: offset / PAGE_SIZE,
            offset_in_page: offset % PAGE_SIZE,
            exhausted: false,
        }
    }

    /// Reads `len` bytes at `offset` by concatenating stream chunks, the
    /// shape a bulk DMA read adaptor wants. Fails with corruption when the
    /// file ends first.
    pub fn read_bulk(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut stream = self.read(offset, Priority::default(), CacheMode::ReadThrough);
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            match stream.next()? {
                Some(chunk) => {
                    let take = chunk.len().min(len - out.len());
                    out.extend_from_slice(&chunk[..take]);
                }
                None => {
                    return Err(Error::corruption(format!(
                        "end of file reading {len} bytes at {offset}"
                    )))
                }
            }
        }
        Ok(Bytes::from(out))
    }

    /// Evicts only the pages fully contained in `[start, end)`; a page
    /// partially overlapping the range stays resident. A page containing
    /// offset zero is dropped when `start` is zero.
    pub fn invalidate_at_most(&self, start: u64, end: u64) {
        let lo_page = start / PAGE_SIZE + u64::from(start % PAGE_SIZE != 0 && start != 0);
        let hi_page = end / PAGE_SIZE;
        if lo_page >= hi_page {
            return;
        }
        let mut st = self.state.lock();
        let victims: Vec<u64> = st.pages.range(lo_page..hi_page).map(|(i, _)| *i).collect();
        let count = victims.len();
        for idx in victims {
            self.drop_page(&mut st, idx);
        }
        if count > 0 {
            tracing::trace!(count, lo_page, hi_page, "page cache invalidated range");
        }
    }

    /// Equivalent to `invalidate_at_most(0, end)`.
    pub fn invalidate_at_most_front(&self, end: u64) {
        self.invalidate_at_most(0, end);
    }

    /// Metrics attached to this file.
    pub fn metrics(&self) -> &Arc<FileMetrics> {
        &self.metrics
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        let victims: Vec<u64> = st.pages.keys().copied().collect();
        for idx in victims {
            self.drop_page(&mut st, idx);
        }
    }
}

/// Generator of subsequent chunks of file data. Single user; calls must
/// be serialized.
pub struct PageStream<'a> {
    file: &'a CachedFile,
    mode: CacheMode,
    page_idx: u64,
    offset_in_page: u64,
    exhausted: bool,
}

impl PageStream<'_> {
    /// Yields the next chunk, or `None` at end of stream.
    pub fn next(&mut self) -> Result<Option<Bytes>> {
        if self.exhausted || self.page_idx > self.file.last_page {
            return Ok(None);
        }
        let mut page = self.file.get_page(self.page_idx, self.mode)?;
        if self.page_idx == self.file.last_page {
            page.truncate(self.file.last_page_size as usize);
        }
        let skip = (self.offset_in_page as usize).min(page.len());
        let chunk = page.slice(skip..);
        self.offset_in_page = 0;
        self.page_idx += 1;
        Ok(Some(chunk))
    }
}
