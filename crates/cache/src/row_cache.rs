//! Read-through row cache over a mutation source
//!
//! The cache is a snapshot of the underlying mutation source, populated
//! automatically on misses. When the underlying source changes, the cache
//! is synchronized explicitly with `update()` (merging a flushed memtable)
//! or `invalidate()` (dropping affected ranges).
//!
//! Population phases: the underlying snapshots are versioned by a phase
//! counter. A read started at phase P may populate the cache only if the
//! keys it populates are still at phase P at commit time; otherwise the
//! data is served directly and the mispopulation counter bumps. During an
//! update, positions at or past the watermark still read through the
//! previous snapshot; positions before it use the new underlying source.

use crate::lru::EntryTag;
use crate::tracker::{CacheTracker, EvictTarget};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tessera_core::fragment::SnapshotAndPhase;
use tessera_core::schema::SchemaRef;
use tessera_core::{
    AllocatingSection, CacheConfig, DecoratedKey, Error, KeyRange, Mutation, MutationSource,
    PartitionAssembler, PartitionData, Phase, ReadOptions, Result, RingBound, RingKey,
    SnapshotSource,
};
use tessera_mvcc::{Memtable, PartitionEntry, VersionArena};

/// One cached partition, as returned to readers.
#[derive(Debug, Clone)]
pub struct CachedPartition {
    /// The partition's key.
    pub key: DecoratedKey,
    /// The squashed partition value (dummy sentinels stripped).
    pub data: PartitionData,
}

/// An entry of the cache index: a partition entry plus continuity flags.
pub struct CacheEntry {
    tag: EntryTag,
    schema: SchemaRef,
    partition: Option<PartitionEntry>,
    continuous: bool,
    dummy: bool,
    charged: usize,
}

impl CacheEntry {
    fn dummy_sentinel(schema: SchemaRef) -> CacheEntry {
        CacheEntry {
            tag: 0,
            schema,
            partition: None,
            continuous: false,
            dummy: true,
            charged: 0,
        }
    }

    /// Whether there is nothing between this entry and its predecessor.
    pub fn continuous(&self) -> bool {
        self.continuous
    }

    /// Whether this is the end sentinel.
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// The LRU tag of this entry.
    pub fn tag(&self) -> EntryTag {
        self.tag
    }

    pub(crate) fn charged(&self) -> usize {
        self.charged
    }

    pub(crate) fn take_partition(&mut self) -> Option<PartitionEntry> {
        self.partition.take()
    }

    pub(crate) fn set_continuous(&mut self, value: bool) {
        self.continuous = value;
    }
}

/// The ordered index of cache entries. A dummy sentinel always exists at
/// +∞ so successor lookups never fail.
pub struct PartitionIndex {
    map: BTreeMap<RingKey, CacheEntry>,
}

impl PartitionIndex {
    fn new(schema: SchemaRef) -> PartitionIndex {
        let mut map = BTreeMap::new();
        map.insert(RingKey::Max, CacheEntry::dummy_sentinel(schema));
        PartitionIndex { map }
    }

    /// First index key at or after the bound.
    pub fn lower_bound(&self, bound: &RingBound) -> RingKey {
        match bound {
            RingBound::Min => self.map.keys().next().cloned(),
            RingBound::Before(k) => self
                .map
                .range(RingKey::Key(k.clone())..)
                .next()
                .map(|(k, _)| k.clone()),
            RingBound::After(k) => self
                .map
                .range((Bound::Excluded(RingKey::Key(k.clone())), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone()),
            RingBound::Max => Some(RingKey::Max),
        }
        .expect("sentinel always present")
    }

    /// First index key strictly after the given one.
    pub fn successor(&self, key: &RingKey) -> RingKey {
        self.map
            .range((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or(RingKey::Max)
    }

    /// The index key right before the given one.
    pub fn predecessor(&self, key: &RingKey) -> Option<RingKey> {
        self.map
            .range(..key.clone())
            .next_back()
            .map(|(k, _)| k.clone())
    }

    pub(crate) fn get(&self, key: &RingKey) -> Option<&CacheEntry> {
        self.map.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &RingKey) -> Option<&mut CacheEntry> {
        self.map.get_mut(key)
    }

    /// Clears the `continuous` flag of the entry at the given index key.
    pub fn clear_continuity(&mut self, key: &RingKey) {
        if let Some(e) = self.map.get_mut(key) {
            e.continuous = false;
        }
    }

    /// Removes an entry for eviction, clearing the successor's continuity
    /// so readers stop assuming the gap is known empty.
    pub(crate) fn remove_for_eviction(&mut self, key: &DecoratedKey) -> Option<CacheEntry> {
        let rk = RingKey::Key(key.clone());
        let entry = self.map.remove(&rk)?;
        let succ = self.successor(&rk);
        self.clear_continuity(&succ);
        Some(entry)
    }

    /// Number of live (non-sentinel) entries.
    pub fn len(&self) -> usize {
        self.map.len() - 1
    }

    /// Whether the index holds only the sentinel.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys in order, for tests.
    pub fn keys(&self) -> Vec<DecoratedKey> {
        self.map
            .keys()
            .filter_map(|k| k.as_key().cloned())
            .collect()
    }
}

struct SourceState {
    underlying: Arc<dyn MutationSource>,
    phase: Phase,
    prev_snapshot: Option<Arc<dyn MutationSource>>,
    // Positions at or past the watermark read through prev_snapshot.
    prev_snapshot_pos: Option<RingBound>,
}

pub(crate) struct RowCacheShared {
    pub tracker: Arc<CacheTracker>,
    pub arena: Arc<VersionArena>,
    pub schema: Mutex<SchemaRef>,
    pub index: Arc<Mutex<PartitionIndex>>,
    source: Mutex<SourceState>,
    snapshot_source: Arc<dyn SnapshotSource>,
    update_mutex: Mutex<()>,
    pub update_section: AllocatingSection,
    pub populate_section: AllocatingSection,
    pub read_section: AllocatingSection,
    config: CacheConfig,
}

/// A data source wrapping another mutation source, caching its partitions
/// in memory to serve reads faster.
pub struct RowCache {
    pub(crate) shared: Arc<RowCacheShared>,
}

impl RowCache {
    /// Creates a cache over the given snapshot source.
    pub fn new(
        schema: SchemaRef,
        snapshot_source: Arc<dyn SnapshotSource>,
        tracker: Arc<CacheTracker>,
        arena: Arc<VersionArena>,
        config: CacheConfig,
    ) -> RowCache {
        let underlying = snapshot_source.snapshot();
        RowCache {
            shared: Arc::new(RowCacheShared {
                tracker,
                arena,
                schema: Mutex::new(Arc::clone(&schema)),
                index: Arc::new(Mutex::new(PartitionIndex::new(schema))),
                source: Mutex::new(SourceState {
                    underlying,
                    phase: tessera_core::DEFAULT_PHASE,
                    prev_snapshot: None,
                    prev_snapshot_pos: None,
                }),
                snapshot_source,
                update_mutex: Mutex::new(()),
                update_section: AllocatingSection::new(),
                populate_section: AllocatingSection::new(),
                read_section: AllocatingSection::new(),
                config,
            }),
        }
    }

    /// The tracker this cache reports to.
    pub fn tracker(&self) -> &Arc<CacheTracker> {
        &self.shared.tracker
    }

    /// The cache's current schema.
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.shared.schema.lock())
    }

    /// Replaces the cache's schema; entries upgrade lazily on access.
    pub fn set_schema(&self, schema: SchemaRef) {
        *self.shared.schema.lock() = schema;
    }

    /// Number of cached partitions.
    pub fn num_entries(&self) -> usize {
        self.shared.index.lock().len()
    }

    /// Cached keys in ring order, for tests and diagnostics.
    pub fn cached_keys(&self) -> Vec<DecoratedKey> {
        self.shared.index.lock().keys()
    }

    /// Whether the entry at `key` is marked continuous with its
    /// predecessor.
    pub fn is_continuous(&self, key: &DecoratedKey) -> bool {
        self.shared
            .index
            .lock()
            .get(&RingKey::Key(key.clone()))
            .map(|e| e.continuous)
            .unwrap_or(false)
    }

    /// Reads one partition, populating the cache on miss.
    ///
    /// An entry with incomplete ranges does not count as a hit: the
    /// underlying source is consulted so readers never see less than the
    /// snapshot they started from.
    pub fn read(&self, key: &DecoratedKey) -> Result<Option<CachedPartition>> {
        self.shared
            .read_through(key, None)
            .map(|data| data.map(|data| CachedPartition {
                key: key.clone(),
                data,
            }))
    }

    /// Populates the cache from a mutation known to contain all data for
    /// its partition in the underlying sources.
    pub fn populate(&self, m: &Mutation) -> Result<()> {
        let shared = &self.shared;
        let region = shared.tracker.region();
        shared.populate_section.run(region, || {
            let exists = {
                let idx = shared.index.lock();
                idx.get(&RingKey::Key(m.key.clone())).is_some()
            };
            if exists {
                return Err(Error::AlreadyCached);
            }
            let phase = shared.source.lock().phase;
            let schema = Arc::clone(&shared.schema.lock());
            shared.populate_at_phase(&schema, &m.key, m.partition.clone(), phase, None);
            Ok(())
        })
    }

    /// Moves the partition at `key` to the front of the LRU, if cached.
    pub fn touch(&self, key: &DecoratedKey) {
        let idx = self.shared.index.lock();
        if let Some(e) = idx.get(&RingKey::Key(key.clone())) {
            self.shared.tracker.touch(e.tag);
        }
    }

    /// Synchronizes the cache with a memtable just flushed to the
    /// underlying source. Entries found in cache are merged; entries known
    /// absent from other layers are inserted; everything else clears
    /// continuity at the lookup position.
    pub fn update(
        &self,
        memtable: Memtable,
        presence: impl FnMut(&DecoratedKey) -> PresenceCheck,
    ) -> Result<()> {
        let mut presence = presence;
        self.do_update(memtable, |shared, schema, idx, key, entry| {
            let rk = RingKey::Key(key.clone());
            if idx.get(&rk).is_some() {
                shared.upgrade_entry(idx, &rk, schema);
                let cache_entry = idx.get_mut(&rk).expect("just found");
                let pe = cache_entry.partition.as_ref().expect("live entry");
                // Memtables upgrade eagerly on schema change, so by the
                // time a flush reaches the cache both sides agree.
                pe.apply_to_incomplete(
                    schema,
                    &entry,
                    schema,
                    shared.tracker.region(),
                    &shared.tracker.as_mvcc(),
                );
                let tag = cache_entry.tag;
                shared.tracker.touch(tag);
                shared.tracker.on_merge();
            } else if presence(key) == PresenceCheck::DefinitelyDoesntExist {
                // The memtable is exhaustive for this key; its value can be
                // inserted as a complete partition.
                let data = entry.squashed(schema, schema);
                shared.insert_complete(idx, schema, key, data);
            } else {
                // The mutation may be incomplete for this key; all the
                // cache may safely record is that the gap is unknown.
                shared.tracker.region().uncharge(entry.memory_usage());
                let at = idx.lower_bound(&RingBound::Before(key.clone()));
                idx.clear_continuity(&at);
                shared.tracker.bump_modification();
            }
        })
    }

    /// Like [`Self::update`], but instead of merging rows it invalidates
    /// affected partitions down to their memtable-side tombstone.
    pub fn update_invalidating(&self, memtable: Memtable) -> Result<()> {
        self.do_update(memtable, |shared, _schema, idx, key, entry| {
            let rk = RingKey::Key(key.clone());
            if idx.get(&rk).is_some() {
                let tomb = entry.partition_tombstone();
                let cache_entry = idx.get_mut(&rk).expect("just found");
                let fresh = PartitionEntry::make_evictable(
                    &shared.arena,
                    PartitionData::make_incomplete(tomb),
                );
                let old = cache_entry.partition.replace(fresh);
                if let Some(mut old) = old {
                    shared.tracker.region().uncharge(old.memory_usage());
                    old.evict(&shared.tracker.as_mvcc());
                }
                shared.tracker.region().uncharge(entry.memory_usage());
            } else {
                shared.tracker.region().uncharge(entry.memory_usage());
                let at = idx.lower_bound(&RingBound::Before(key.clone()));
                idx.clear_continuity(&at);
                shared.tracker.bump_modification();
            }
        })
    }

    fn do_update(
        &self,
        memtable: Memtable,
        mut updater: impl FnMut(
            &RowCacheShared,
            &SchemaRef,
            &mut PartitionIndex,
            &DecoratedKey,
            PartitionEntry,
        ),
    ) -> Result<()> {
        let shared = &self.shared;
        let _permit = shared.update_mutex.lock();
        memtable.mark_detached();
        // All memtable data now belongs to the cache region.
        shared.tracker.region().merge(memtable.region());
        {
            let mut src = shared.source.lock();
            src.phase += 1;
            src.prev_snapshot = Some(std::mem::replace(
                &mut src.underlying,
                shared.snapshot_source.snapshot(),
            ));
            src.prev_snapshot_pos = Some(RingBound::Min);
        }
        let schema = Arc::clone(&shared.schema.lock());
        let quota = shared.config.update_batch_quota.max(1);
        while !memtable.is_empty() {
            shared
                .update_section
                .run(shared.tracker.region(), || {
                    for _ in 0..quota {
                        let Some((key, entry)) = memtable.pop_first() else {
                            break;
                        };
                        let mut idx = shared.index.lock();
                        updater(shared, &schema, &mut idx, &key, entry);
                    }
                    let mut src = shared.source.lock();
                    src.prev_snapshot_pos = memtable.first_key().map(RingBound::Before);
                });
            // Yield between batches so readers can interleave.
            std::thread::yield_now();
        }
        let mut src = shared.source.lock();
        src.prev_snapshot = None;
        src.prev_snapshot_pos = None;
        Ok(())
    }

    /// Invalidates every partition in the given ranges. Readers created
    /// after this call see all writes the underlying source held before
    /// it. On failure the whole cache is dropped, preserving the atomicity
    /// contract.
    pub fn invalidate(&self, ranges: &[KeyRange]) -> Result<()> {
        let shared = &self.shared;
        let _permit = shared.update_mutex.lock();
        {
            let mut src = shared.source.lock();
            src.underlying = shared.snapshot_source.snapshot();
            src.phase += 1;
        }
        for range in ranges {
            self.invalidate_unwrapped(range);
        }
        Ok(())
    }

    /// Invalidates a single key.
    pub fn invalidate_key(&self, key: &DecoratedKey) -> Result<()> {
        self.invalidate(&[KeyRange::singular(key.clone())])
    }

    fn invalidate_unwrapped(&self, range: &KeyRange) {
        let shared = &self.shared;
        let mut idx = shared.index.lock();
        let start = idx.lower_bound(&range.start);
        let end = idx.lower_bound(&range.end);
        let keys: Vec<RingKey> = idx
            .map
            .range(start.clone()..end.clone())
            .filter(|(k, _)| !matches!(k, RingKey::Max))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            if let Some(mut entry) = idx.map.remove(&k) {
                shared.tracker.unlink(entry.tag);
                shared.tracker.region().uncharge(entry.charged);
                if let Some(mut pe) = entry.take_partition() {
                    pe.evict(&shared.tracker.as_mvcc());
                }
                shared.tracker.on_erase();
            }
        }
        idx.clear_continuity(&end);
        shared.tracker.bump_modification();
    }

    /// Drops the entire cache. Correctness of subsequent reads is
    /// preserved because the underlying source is re-read.
    pub fn clear_now(&self) {
        let shared = &self.shared;
        tracing::warn!("dropping entire row cache");
        let mut idx = shared.index.lock();
        let keys: Vec<RingKey> = idx
            .map
            .keys()
            .filter(|k| !matches!(k, RingKey::Max))
            .cloned()
            .collect();
        for k in keys {
            if let Some(mut entry) = idx.map.remove(&k) {
                shared.tracker.unlink(entry.tag);
                shared.tracker.region().uncharge(entry.charged);
                if let Some(mut pe) = entry.take_partition() {
                    pe.evict(&shared.tracker.as_mvcc());
                }
                shared.tracker.on_erase();
            }
        }
        idx.clear_continuity(&RingKey::Max);
        shared.tracker.bump_modification();
    }
}

/// What a presence check knows about a key in layers below the memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceCheck {
    /// The key definitely exists below.
    DefinitelyExists,
    /// Unknown.
    MaybeExists,
    /// The key definitely does not exist below.
    DefinitelyDoesntExist,
}

impl RowCacheShared {
    /// The `(snapshot, phase)` pair covering the given position.
    pub(crate) fn snapshot_of(&self, key: &DecoratedKey) -> SnapshotAndPhase {
        let src = self.source.lock();
        match &src.prev_snapshot_pos {
            Some(watermark) if watermark.cmp_key(key) != std::cmp::Ordering::Greater => {
                SnapshotAndPhase {
                    source: Arc::clone(src.prev_snapshot.as_ref().expect("watermark set")),
                    phase: src.phase - 1,
                }
            }
            _ => SnapshotAndPhase {
                source: Arc::clone(&src.underlying),
                phase: src.phase,
            },
        }
    }

    /// The population phase for the given position.
    pub(crate) fn phase_of(&self, key: &DecoratedKey) -> Phase {
        let src = self.source.lock();
        match &src.prev_snapshot_pos {
            Some(watermark) if watermark.cmp_key(key) != std::cmp::Ordering::Greater => {
                src.phase - 1
            }
            _ => src.phase,
        }
    }

    /// The `(snapshot, phase)` pair covering positions starting at the
    /// given bound.
    pub(crate) fn snapshot_of_bound(&self, bound: &RingBound) -> SnapshotAndPhase {
        let src = self.source.lock();
        match &src.prev_snapshot_pos {
            Some(watermark) if bound.cmp_bound(watermark) != std::cmp::Ordering::Less => {
                SnapshotAndPhase {
                    source: Arc::clone(src.prev_snapshot.as_ref().expect("watermark set")),
                    phase: src.phase - 1,
                }
            }
            _ => SnapshotAndPhase {
                source: Arc::clone(&src.underlying),
                phase: src.phase,
            },
        }
    }

    /// The population phase for positions starting at the given bound.
    pub(crate) fn phase_of_bound(&self, bound: &RingBound) -> Phase {
        let src = self.source.lock();
        match &src.prev_snapshot_pos {
            Some(watermark) if bound.cmp_bound(watermark) != std::cmp::Ordering::Less => {
                src.phase - 1
            }
            _ => src.phase,
        }
    }

    /// Serves one partition: a complete cached entry directly, anything
    /// else through the underlying source with best-effort population.
    ///
    /// `previous` carries the preceding key of a scan so populations can
    /// extend continuity leftward.
    pub(crate) fn read_through(
        &self,
        key: &DecoratedKey,
        previous: Option<&PreviousEntry>,
    ) -> Result<Option<PartitionData>> {
        let region = self.tracker.region();
        let cached = self.read_section.run(region, || {
            let rk = RingKey::Key(key.clone());
            let present = { self.index.lock().get(&rk).is_some() };
            if !present {
                return None;
            }
            let data = self.read_entry(key);
            data.is_fully_continuous().then_some(data)
        });
        if let Some(data) = cached {
            self.tracker.on_hit();
            return Ok(Some(strip_dummies(data)));
        }
        self.tracker.on_miss();

        let sp = self.snapshot_of(key);
        let schema = Arc::clone(&self.schema.lock());
        let mut stream = sp.source.read(
            Arc::clone(&schema),
            &KeyRange::singular(key.clone()),
            ReadOptions::default(),
        );
        let mut partitions = PartitionAssembler::assemble_all(stream.as_mut())?;
        let Some((_, data)) = partitions.pop() else {
            return Ok(None);
        };
        let populated = self.populate_section.run(region, || {
            if sp.phase == self.phase_of(key) {
                self.populate_at_phase(&schema, key, data.clone(), sp.phase, previous);
                true
            } else {
                self.tracker.on_mispopulate();
                false
            }
        });
        let data = if populated {
            self.read_entry(key)
        } else {
            data
        };
        Ok(Some(strip_dummies(data)))
    }

    /// Reads the squashed value of a cached partition, touching the LRU
    /// and upgrading the entry's schema if needed. The entry must exist.
    pub(crate) fn read_entry(&self, key: &DecoratedKey) -> PartitionData {
        let mut idx = self.index.lock();
        let rk = RingKey::Key(key.clone());
        let schema = Arc::clone(&self.schema.lock());
        self.upgrade_entry(&mut idx, &rk, &schema);
        let e = idx.get(&rk).expect("caller checked presence");
        self.tracker.touch(e.tag);
        let pe = e.partition.as_ref().expect("live entry");
        let snap = pe.read(
            self.tracker.region(),
            &schema,
            Some(&self.tracker.as_mvcc()),
            self.phase_of(key),
        );
        drop(idx);
        snap.squashed()
    }

    /// Upgrades a cache entry to the cache's schema if it lags behind.
    pub(crate) fn upgrade_entry(
        &self,
        idx: &mut PartitionIndex,
        key: &RingKey,
        schema: &SchemaRef,
    ) {
        let Some(e) = idx.get_mut(key) else {
            return;
        };
        if e.dummy || Arc::ptr_eq(&e.schema, schema) || e.schema.version() == schema.version() {
            return;
        }
        let pe = e.partition.as_ref().expect("live entry");
        pe.upgrade(&e.schema, schema, Some(&self.tracker.as_mvcc()));
        e.schema = Arc::clone(schema);
    }

    /// Ensures an entry exists at `key` prepared for population at
    /// `phase`, applies the partition tombstone, and merges `data` into
    /// the population target marked fully continuous.
    ///
    /// `previous` is the key right before `key` in the population's key
    /// order; when it matches the cache's predecessor, the new entry is
    /// marked continuous, extending the known range leftward.
    pub(crate) fn populate_at_phase(
        &self,
        schema: &SchemaRef,
        key: &DecoratedKey,
        mut data: PartitionData,
        phase: Phase,
        previous: Option<&PreviousEntry>,
    ) {
        let mut idx = self.index.lock();
        let rk = RingKey::Key(key.clone());
        let tombstone = data.partition_tombstone();
        let existed = idx.get(&rk).is_some();
        if existed {
            self.upgrade_entry(&mut idx, &rk, schema);
            let e = idx.get_mut(&rk).expect("just found");
            let pe = e.partition.as_ref().expect("live entry");
            pe.open_and_apply_tombstone(schema, Some(&self.tracker.as_mvcc()), phase, tombstone);
            self.tracker.touch(e.tag);
            self.tracker.on_miss_already_populated();
        } else {
            let pe = PartitionEntry::make_evictable(
                &self.arena,
                PartitionData::make_incomplete(tombstone),
            );
            let tag = self.tracker.new_tag();
            let charged = data.memory_usage() + std::mem::size_of::<CacheEntry>();
            self.tracker.region().charge(charged);
            idx.map.insert(
                rk.clone(),
                CacheEntry {
                    tag,
                    schema: Arc::clone(schema),
                    partition: Some(pe),
                    continuous: false,
                    dummy: false,
                    charged,
                },
            );
            self.tracker.insert(
                tag,
                EvictTarget {
                    index: Arc::downgrade(&self.index),
                    key: key.clone(),
                },
            );
        }

        // Install the complete partition into the population target.
        mark_complete(&mut data);
        let e = idx.get(&rk).expect("present");
        let pe = e.partition.as_ref().expect("live entry");
        pe.populate(schema, Some(&self.tracker.as_mvcc()), phase, data);

        if let Some(prev) = previous {
            let at_begin = idx.predecessor(&rk).is_none();
            let extend = match (&prev.key, at_begin) {
                (None, true) => true,
                (Some(prev_key), false) => idx
                    .predecessor(&rk)
                    .and_then(|p| p.as_key().cloned())
                    .is_some_and(|p| p == *prev_key),
                _ => false,
            };
            if extend {
                if let Some(e) = idx.get_mut(&rk) {
                    e.continuous = true;
                }
            }
        }
    }

    /// Inserts a complete partition known exhaustive for its key (memtable
    /// merge fast path).
    pub(crate) fn insert_complete(
        &self,
        idx: &mut PartitionIndex,
        schema: &SchemaRef,
        key: &DecoratedKey,
        mut data: PartitionData,
    ) {
        mark_complete(&mut data);
        let pe = PartitionEntry::make_evictable(&self.arena, data);
        let tag = self.tracker.new_tag();
        let charged = std::mem::size_of::<CacheEntry>();
        self.tracker.region().charge(charged);
        idx.map.insert(
            RingKey::Key(key.clone()),
            CacheEntry {
                tag,
                schema: Arc::clone(schema),
                partition: Some(pe),
                continuous: false,
                dummy: false,
                charged,
            },
        );
        self.tracker.insert(
            tag,
            EvictTarget {
                index: Arc::downgrade(&self.index),
                key: key.clone(),
            },
        );
    }
}

/// The key just before a populated key, used to extend continuity
/// leftward. A `None` key represents the minimum of the ring.
#[derive(Debug, Clone, Default)]
pub struct PreviousEntry {
    /// The previous key, or `None` for the ring minimum.
    pub key: Option<DecoratedKey>,
}

/// Marks every range of the partition known-complete.
fn mark_complete(data: &mut PartitionData) {
    data.set_static_row_continuous(true);
    for e in data.rows_mut().values_mut() {
        e.continuous = true;
    }
    data.ensure_last_dummy();
}

/// Removes dummy sentinels from a squashed partition before handing it to
/// a reader.
pub(crate) fn strip_dummies(mut data: PartitionData) -> PartitionData {
    let dummies: Vec<_> = data
        .rows()
        .iter()
        .filter(|(_, e)| e.dummy)
        .map(|(p, _)| p.clone())
        .collect();
    for p in dummies {
        data.rows_mut().remove(&p);
    }
    data
}
