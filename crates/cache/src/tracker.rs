//! Cache tracker: eviction policy, statistics and continuity bookkeeping
//!
//! The tracker owns the cache region and the LRU over cache entries. At
//! construction it installs its eviction callback on the region: when an
//! allocation would not fit the budget, the callback pops the LRU tail,
//! clears the `continuous` flag on the evicted entry's successor (readers
//! must no longer assume the gap is known empty) and destroys the entry.

use crate::lru::{EntryTag, Lru};
use crate::row_cache::PartitionIndex;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessera_core::{ReclaimResult, Region};
use tessera_mvcc::MvccTracker;

/// Name of the metrics group the tracker's counters belong to.
pub const METRICS_GROUP: &str = "cache";

/// Where an evicted cache entry lives, stored as the LRU payload.
pub(crate) struct EvictTarget {
    pub index: Weak<Mutex<PartitionIndex>>,
    pub key: tessera_core::DecoratedKey,
}

#[derive(Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    concurrent_misses_same_key: AtomicU64,
    merges: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
    partitions: AtomicU64,
    modification_count: AtomicU64,
    mispopulations: AtomicU64,
    rows_processed_from_memtable: AtomicU64,
    rows_merged_from_memtable: AtomicU64,
    rows_dropped_from_memtable: AtomicU64,
    rows_removed: AtomicU64,
}

/// Point-in-time statistics snapshot of the `cache` metrics group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Bytes currently used by the cache region.
    pub bytes_used: u64,
    /// Total bytes of the cache region's budget, if bounded.
    pub bytes_total: Option<u64>,
    /// Reads served from cache.
    pub hits: u64,
    /// Reads that consulted the underlying source.
    pub misses: u64,
    /// Entries inserted by populating reads and updates.
    pub insertions: u64,
    /// Misses that found the entry concurrently populated.
    pub concurrent_misses_same_key: u64,
    /// Memtable entries merged into existing cache entries.
    pub merges: u64,
    /// Entries evicted under memory pressure.
    pub evictions: u64,
    /// Entries removed by invalidation and clears.
    pub removals: u64,
    /// Partition entries resident.
    pub partitions: u64,
    /// Structure modification counter used by cursors.
    pub modification_count: u64,
    /// Populations abandoned because of a phase conflict.
    pub mispopulations: u64,
    /// Memtable rows examined by updates.
    pub rows_processed_from_memtable: u64,
    /// Memtable rows merged into cache rows.
    pub rows_merged_from_memtable: u64,
    /// Memtable rows dropped into incomplete ranges.
    pub rows_dropped_from_memtable: u64,
    /// Rows freed while destroying versions.
    pub rows_removed: u64,
}

/// Tracks accesses and performs eviction of cache entries.
pub struct CacheTracker {
    region: Arc<Region>,
    lru: Mutex<Lru<EvictTarget>>,
    stats: Stats,
    next_tag: AtomicU64,
    self_ref: Weak<CacheTracker>,
}

impl CacheTracker {
    /// Creates a tracker over a region with the given byte budget and
    /// installs its eviction callback on it.
    pub fn new(memory_budget: Option<usize>) -> Arc<CacheTracker> {
        let region = Region::with_budget(memory_budget);
        let tracker = Arc::new_cyclic(|self_ref| CacheTracker {
            region: Arc::clone(&region),
            lru: Mutex::new(Lru::new()),
            stats: Stats::default(),
            next_tag: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        });
        let weak = Arc::downgrade(&tracker);
        region.set_evictor(Box::new(move || match weak.upgrade() {
            Some(t) => t.evict_one(),
            None => ReclaimResult::ReclaimedNothing,
        }));
        tracker
    }

    /// The region this tracker controls.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// This tracker as the MVCC bookkeeping hook.
    pub fn as_mvcc(&self) -> Arc<dyn MvccTracker> {
        self.self_ref.upgrade().expect("tracker alive")
    }

    /// Allocates a fresh LRU tag for a new cache entry.
    pub(crate) fn new_tag(&self) -> EntryTag {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Links a newly inserted entry at the LRU head and bumps counters.
    pub(crate) fn insert(&self, tag: EntryTag, target: EvictTarget) {
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        self.stats.partitions.fetch_add(1, Ordering::Relaxed);
        self.bump_modification();
        self.lru.lock().push_front(tag, target);
    }

    /// Moves an entry to the LRU head.
    pub fn touch(&self, tag: EntryTag) {
        self.lru.lock().touch(tag);
    }

    /// Unlinks an entry from the LRU without destroying anything.
    pub(crate) fn unlink(&self, tag: EntryTag) {
        self.lru.lock().unlink(tag);
    }

    /// Evicts the least-recently-used cache entry.
    ///
    /// Invoked by the region when an allocation would otherwise fail. Pops
    /// the LRU tail, clears the successor's continuity and destroys the
    /// entry. A tail whose cache is already gone is skipped.
    pub fn evict_one(&self) -> ReclaimResult {
        loop {
            let popped = { self.lru.lock().pop_back() };
            let Some((_tag, target)) = popped else {
                return ReclaimResult::ReclaimedNothing;
            };
            let Some(index) = target.index.upgrade() else {
                continue;
            };
            let mut idx = index.lock();
            let Some(mut entry) = idx.remove_for_eviction(&target.key) else {
                continue;
            };
            self.region.uncharge(entry.charged());
            drop(idx);
            if let Some(mut pe) = entry.take_partition() {
                pe.evict(&self.as_mvcc());
            }
            self.stats.partitions.fetch_sub(1, Ordering::Relaxed);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            self.bump_modification();
            tracing::trace!(token = target.key.token, "evicted partition");
            return ReclaimResult::ReclaimedSomething;
        }
    }

    /// Evicts until the LRU is empty.
    pub fn clear(&self) {
        while self.evict_one() == ReclaimResult::ReclaimedSomething {}
    }

    /// The modification counter; cursors compare it to detect structure
    /// changes.
    pub fn modification_count(&self) -> u64 {
        self.stats.modification_count.load(Ordering::Acquire)
    }

    /// Resident partition count.
    pub fn partitions(&self) -> u64 {
        self.stats.partitions.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_modification(&self) {
        self.stats.modification_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_erase(&self) {
        self.stats.partitions.fetch_sub(1, Ordering::Relaxed);
        self.stats.removals.fetch_add(1, Ordering::Relaxed);
        self.bump_modification();
    }

    /// Counts a cache hit.
    pub fn on_hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a cache miss.
    pub fn on_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a miss that found the entry already populated.
    pub fn on_miss_already_populated(&self) {
        self.stats
            .concurrent_misses_same_key
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a population abandoned on phase conflict.
    pub fn on_mispopulate(&self) {
        self.stats.mispopulations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a memtable entry merged into the cache.
    pub fn on_merge(&self) {
        self.stats.merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let occ = self.region.occupancy();
        CacheStats {
            bytes_used: occ.used as u64,
            bytes_total: occ.total.map(|t| t as u64),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            concurrent_misses_same_key: self
                .stats
                .concurrent_misses_same_key
                .load(Ordering::Relaxed),
            merges: self.stats.merges.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            removals: self.stats.removals.load(Ordering::Relaxed),
            partitions: self.stats.partitions.load(Ordering::Relaxed),
            modification_count: self.stats.modification_count.load(Ordering::Relaxed),
            mispopulations: self.stats.mispopulations.load(Ordering::Relaxed),
            rows_processed_from_memtable: self
                .stats
                .rows_processed_from_memtable
                .load(Ordering::Relaxed),
            rows_merged_from_memtable: self
                .stats
                .rows_merged_from_memtable
                .load(Ordering::Relaxed),
            rows_dropped_from_memtable: self
                .stats
                .rows_dropped_from_memtable
                .load(Ordering::Relaxed),
            rows_removed: self.stats.rows_removed.load(Ordering::Relaxed),
        }
    }
}

impl MvccTracker for CacheTracker {
    fn on_version_added(&self) {
        self.bump_modification();
    }

    fn on_row_removed(&self) {
        self.stats.rows_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_row_processed_from_memtable(&self) {
        self.stats
            .rows_processed_from_memtable
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_row_merged_from_memtable(&self) {
        self.stats
            .rows_merged_from_memtable
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_row_dropped_from_memtable(&self) {
        self.stats
            .rows_dropped_from_memtable
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for CacheTracker {
    fn drop(&mut self) {
        self.region.clear_evictor();
    }
}
