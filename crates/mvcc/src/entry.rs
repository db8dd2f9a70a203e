//! Partition entries
//!
//! A `PartitionEntry` owns the head reference of a version chain and at
//! most one attached snapshot. Writers apply mutations through it; readers
//! obtain snapshots from it. Evictable entries (row cache) carry per-range
//! continuity and always keep a dummy row at +∞; non-evictable entries
//! (memtable) are fully continuous at all times.

use crate::arena::{EntryId, EntryState, SnapshotLink, VersionArena, VersionId};
use crate::snapshot::PartitionSnapshot;
use crate::MvccTracker;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tessera_core::partition::merge_newer;
use tessera_core::position::Position;
use tessera_core::row::RowEntry;
use tessera_core::schema::{upgrade_partition, SchemaRef};
use tessera_core::{PartitionData, Phase, Region, Result, Tombstone, MAX_PHASE};

/// Row counters produced by folding a memtable entry into a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Source rows examined.
    pub processed: u64,
    /// Rows merged into already-present cache rows.
    pub merged: u64,
    /// Rows dropped because the target range was incomplete.
    pub dropped: u64,
}

/// The main handle to a partition: allows writes and reads.
///
/// The entry owns its head version reference; each non-head version is
/// owned transitively via `next` links until a version referenced by a
/// snapshot, which has a second owner.
pub struct PartitionEntry {
    arena: Arc<VersionArena>,
    id: EntryId,
}

impl PartitionEntry {
    /// Constructs a non-evictable entry holding the given partition.
    pub fn new(arena: &Arc<VersionArena>, data: PartitionData) -> PartitionEntry {
        let mut st = arena.state.lock();
        let vid = st.new_version(data);
        st.set_ref(vid);
        let id = EntryId(st.entries.insert(EntryState {
            version: Some(vid),
            snapshot: None,
            evictable: false,
        }));
        PartitionEntry {
            arena: Arc::clone(arena),
            id,
        }
    }

    /// Constructs an evictable entry. The partition gets the mandatory
    /// dummy sentinel at +∞ so it can always be made fully discontinuous.
    pub fn make_evictable(
        arena: &Arc<VersionArena>,
        mut data: PartitionData,
    ) -> PartitionEntry {
        data.ensure_last_dummy();
        let mut st = arena.state.lock();
        let vid = st.new_version(data);
        st.set_ref(vid);
        let id = EntryId(st.entries.insert(EntryState {
            version: Some(vid),
            snapshot: None,
            evictable: true,
        }));
        PartitionEntry {
            arena: Arc::clone(arena),
            id,
        }
    }

    /// The arena this entry lives in.
    pub fn arena(&self) -> &Arc<VersionArena> {
        &self.arena
    }

    /// Whether the entry was created evictable.
    pub fn is_evictable(&self) -> bool {
        self.arena.state.lock().entries.get(self.id.0).evictable
    }

    /// Estimated heap footprint of the whole chain, for region
    /// accounting.
    pub fn memory_usage(&self) -> usize {
        let st = self.arena.state.lock();
        match st.entries.get(self.id.0).version {
            Some(head) => st
                .chain_from(head)
                .into_iter()
                .map(|vid| st.node(vid).data.memory_usage())
                .sum(),
            None => 0,
        }
    }

    /// Number of versions in the chain, for tests and diagnostics.
    pub fn chain_len(&self) -> usize {
        let st = self.arena.state.lock();
        match st.entries.get(self.id.0).version {
            Some(head) => st.chain_from(head).len(),
            None => 0,
        }
    }

    /// Applies a mutation to a fully-continuous entry.
    ///
    /// If the mutation's schema version differs it is upgraded in place
    /// first. Without an attached snapshot the data is merged into the
    /// current head; when in-place merging cannot complete, the remainder
    /// is prepended as a new version, which preserves the logical value.
    pub fn apply(
        &self,
        region: &Region,
        schema: &SchemaRef,
        mut data: PartitionData,
        data_schema: &SchemaRef,
    ) -> Result<()> {
        if schema.version() != data_schema.version() {
            upgrade_partition(&mut data, data_schema, schema);
        }
        let mut st = self.arena.state.lock();
        let head = st.entries.get(self.id.0).version.expect("live entry");
        if st.entries.get(self.id.0).snapshot.is_none() && !region.take_alloc_failure() {
            let outcome = st
                .node_mut(head)
                .data
                .apply_monotonically(&mut data, None);
            if outcome == tessera_core::ApplyOutcome::Done {
                return Ok(());
            }
            // Partial progress stays merged; the remainder is prepended.
        }
        let evictable = st.entries.get(self.id.0).evictable;
        if evictable {
            data.ensure_last_dummy();
        }
        let new = st.new_version(data);
        st.insert_before(new, head);
        set_version(&mut st, self.id, new);
        Ok(())
    }

    /// Ensures the latest version can be populated with data from `phase`,
    /// prepending a fresh version if an attached snapshot is on a
    /// different phase. Does not affect the value or continuity.
    pub fn open_version(
        &self,
        schema: &SchemaRef,
        tracker: Option<&Arc<dyn MvccTracker>>,
        phase: Phase,
    ) -> VersionId {
        let mut st = self.arena.state.lock();
        open_version_locked(&mut st, self.id, schema, tracker, phase)
    }

    /// Force-prepends a new version. Evictable entries get an incomplete
    /// version carrying a dummy at +∞; the static-row continuity of the
    /// prior head is inherited.
    pub fn add_version(
        &self,
        schema: &SchemaRef,
        tracker: Option<&Arc<dyn MvccTracker>>,
    ) -> VersionId {
        let mut st = self.arena.state.lock();
        add_version_locked(&mut st, self.id, schema, tracker)
    }

    /// Folds the chain into a single partition, upgrading schemas as
    /// needed.
    pub fn squashed(&self, from: &SchemaRef, to: &SchemaRef) -> PartitionData {
        let st = self.arena.state.lock();
        let head = st.entries.get(self.id.0).version.expect("live entry");
        let mut acc = PartitionData::new();
        acc.set_static_row_continuous(st.node(head).data.static_row_continuous());
        for vid in st.chain_from(head) {
            let mut older = st.node(vid).data.clone();
            if from.version() != to.version() {
                upgrade_partition(&mut older, from, to);
            }
            acc = merge_newer(older, acc);
        }
        acc
    }

    /// The partition tombstone folded over the chain.
    pub fn partition_tombstone(&self) -> Tombstone {
        let st = self.arena.state.lock();
        let head = st.entries.get(self.id.0).version.expect("live entry");
        let mut t = Tombstone::NONE;
        for vid in st.chain_from(head) {
            t.apply(st.node(vid).data.partition_tombstone());
        }
        t
    }

    /// Replaces the chain with a single squashed-and-upgraded version.
    /// Old versions not pinned by snapshots are freed; a pinned remainder
    /// is handed to its snapshot via the unique-owner mark.
    pub fn upgrade(
        &self,
        from: &SchemaRef,
        to: &SchemaRef,
        tracker: Option<&Arc<dyn MvccTracker>>,
    ) {
        let squashed = self.squashed(from, to);
        let mut st = self.arena.state.lock();
        let evictable = st.entries.get(self.id.0).evictable;
        let old = st.entries.get(self.id.0).version.expect("live entry");
        let mut data = squashed;
        if evictable {
            data.ensure_last_dummy();
        }
        let new = st.new_version(data);
        set_version(&mut st, self.id, new);
        if let Some(t) = tracker {
            t.on_version_added();
        }
        st.remove_or_mark_as_unique_owner(Some(old), tracker.map(|t| t.as_ref()));
    }

    /// Removes data contained by this entry but not owned by snapshots.
    /// If a snapshot is attached, chain ownership transfers to it; the
    /// entry is invalid afterwards and can only be dropped.
    pub fn evict(&mut self, tracker: &Arc<dyn MvccTracker>) {
        let mut st = self.arena.state.lock();
        detach_versions(&mut st, self.id, Some(tracker.as_ref()));
    }

    /// Returns a snapshot of this entry, creating and attaching one if
    /// none is attached. Snapshots with different phases never share a
    /// version.
    pub fn read(
        &self,
        region: &Arc<Region>,
        schema: &SchemaRef,
        tracker: Option<&Arc<dyn MvccTracker>>,
        phase: Phase,
    ) -> Arc<PartitionSnapshot> {
        let mut st = self.arena.state.lock();
        open_version_locked(&mut st, self.id, schema, tracker, phase);
        let stale = match &st.entries.get(self.id.0).snapshot {
            Some(link) => match link.handle.upgrade() {
                Some(existing) => return existing,
                None => Some(link.id),
            },
            None => None,
        };
        if let Some(stale) = stale {
            // The previous snapshot is mid-drop; detach it so its cleanup
            // becomes a no-op and a fresh snapshot can attach.
            st.snapshots.get_mut(stale.0).entry = None;
            st.entries.get_mut(self.id.0).snapshot = None;
        }
        let sid = crate::arena::SnapshotId(st.snapshots.insert(crate::arena::SnapshotState {
            version: None,
            entry: Some(self.id),
            phase,
        }));
        let snap = PartitionSnapshot::create(
            Arc::clone(&self.arena),
            sid,
            Arc::clone(schema),
            phase,
            Arc::clone(region),
            tracker.cloned(),
        );
        st.entries.get_mut(self.id.0).snapshot = Some(SnapshotLink {
            id: sid,
            handle: Arc::downgrade(&snap),
        });
        snap
    }

    /// Opens the population target for `phase` and applies a partition
    /// tombstone to it.
    pub fn open_and_apply_tombstone(
        &self,
        schema: &SchemaRef,
        tracker: Option<&Arc<dyn MvccTracker>>,
        phase: Phase,
        tombstone: Tombstone,
    ) {
        let mut st = self.arena.state.lock();
        let vid = open_version_locked(&mut st, self.id, schema, tracker, phase);
        st.node_mut(vid).data.apply_tombstone(tombstone);
    }

    /// Merges externally read data into the population target for `phase`.
    /// Continuity flags carried by `data` are combined by union, so a
    /// fully-continuous payload makes the target complete.
    pub fn populate(
        &self,
        schema: &SchemaRef,
        tracker: Option<&Arc<dyn MvccTracker>>,
        phase: Phase,
        mut data: PartitionData,
    ) {
        let mut st = self.arena.state.lock();
        let vid = open_version_locked(&mut st, self.id, schema, tracker, phase);
        let outcome = st.node_mut(vid).data.apply_monotonically(&mut data, None);
        debug_assert_eq!(outcome, tessera_core::ApplyOutcome::Done);
    }

    /// Adds the value of a fully-continuous source entry to this evictable
    /// entry, intersecting with this entry's continuity: information
    /// falling into incomplete ranges is dropped, complete ranges merge
    /// normally.
    ///
    /// Interrupting and retrying is equivalent to a single success; partial
    /// progress is kept on both sides.
    pub fn apply_to_incomplete(
        &self,
        schema: &SchemaRef,
        source: &PartitionEntry,
        source_schema: &SchemaRef,
        _region: &Region,
        tracker: &Arc<dyn MvccTracker>,
    ) -> ApplyStats {
        debug_assert!(Arc::ptr_eq(&self.arena, &source.arena));
        let source_versions = if schema.version() != source_schema.version() {
            vec![source.squashed(source_schema, schema)]
        } else {
            source.take_versions()
        };
        let mut st = self.arena.state.lock();
        let dst = open_version_locked(&mut st, self.id, schema, Some(tracker), MAX_PHASE);
        let chain_head = st.entries.get(self.id.0).version.expect("live entry");
        let target_chain = st.chain_from(chain_head);
        let static_continuous = st.node(chain_head).data.static_row_continuous();

        let mut rows: Vec<RowEntry> = Vec::new();
        for mut data in source_versions {
            st.node_mut(dst)
                .data
                .apply_tombstone(data.partition_tombstone());
            if static_continuous {
                let static_row = std::mem::take(data.static_row_mut());
                st.node_mut(dst).data.static_row_mut().apply(static_row);
            }
            let tombs = std::mem::take(data.row_tombstones_mut());
            st.node_mut(dst)
                .data
                .row_tombstones_mut()
                .apply_list_owned(tombs);
            rows.extend(std::mem::take(data.rows_mut()).into_values());
        }

        let mut stats = ApplyStats::default();
        for group in merge_coincident(rows) {
            if group.iter().all(|e| e.dummy) {
                continue;
            }
            stats.processed += 1;
            tracker.on_row_processed_from_memtable();
            let pos = group[0].position.clone();
            if !chain_complete_at(&st, &target_chain, &pos) {
                stats.dropped += 1;
                tracker.on_row_dropped_from_memtable();
                continue;
            }
            let dst_data = &mut st.node_mut(dst).data;
            let inserted = !dst_data.rows().contains_key(&pos);
            if inserted {
                // Splitting a gap keeps the version's own continuity exact:
                // the new entry inherits the flag of the gap it lands in.
                let continuous = dst_data.continuous_at(&pos);
                let mut fresh = RowEntry::new(pos.clone());
                fresh.continuous = continuous;
                fresh.dummy = true;
                dst_data.rows_mut().insert(pos.clone(), fresh);
            } else {
                stats.merged += 1;
                tracker.on_row_merged_from_memtable();
            }
            let slot = st
                .node_mut(dst)
                .data
                .rows_mut()
                .get_mut(&pos)
                .expect("just ensured");
            for e in group {
                slot.apply_data(e);
            }
        }
        stats
    }

    /// Detaches every version, moving movable data out. Used when the
    /// entry is consumed by a merge into the cache.
    fn take_versions(&self) -> Vec<PartitionData> {
        let mut st = self.arena.state.lock();
        let entry = st.entries.get(self.id.0);
        let head = entry.version.expect("live entry");
        let snapshot_attached = entry
            .snapshot
            .as_ref()
            .map(|l| l.handle.strong_count() > 0)
            .unwrap_or(false);
        let chain = st.chain_from(head);
        let mut can_move = !snapshot_attached;
        let mut out = Vec::with_capacity(chain.len());
        for (i, vid) in chain.iter().enumerate() {
            if i > 0 {
                can_move &= !st.is_referenced(*vid);
            }
            if can_move {
                out.push(std::mem::take(&mut st.node_mut(*vid).data));
            } else {
                out.push(st.node(*vid).data.clone());
            }
        }
        out
    }
}

impl Drop for PartitionEntry {
    fn drop(&mut self) {
        let mut st = self.arena.state.lock();
        detach_versions(&mut st, self.id, None);
        st.entries.remove(self.id.0);
    }
}

/// Detaches the entry from its chain: transfer to the attached snapshot as
/// unique owner, or walk-and-free.
fn detach_versions(
    st: &mut crate::arena::ArenaState,
    id: EntryId,
    tracker: Option<&dyn MvccTracker>,
) {
    let entry = st.entries.get_mut(id.0);
    let version = entry.version.take();
    let link = entry.snapshot.take();
    let Some(vid) = version else {
        return;
    };
    let live_link = link.filter(|l| l.handle.strong_count() > 0);
    if let Some(link) = live_link {
        // The snapshot keeps reading its chain and becomes responsible for
        // freeing it.
        let snap = st.snapshots.get_mut(link.id.0);
        snap.version = Some(vid);
        snap.entry = None;
        st.mark_unique_owner(vid);
    } else {
        st.clear_ref(vid);
        st.remove_or_mark_as_unique_owner(Some(vid), tracker);
    }
}

/// Moves the entry's head reference to `new`. The previous reference moves
/// to the attached snapshot, or is dropped if there is none.
pub(crate) fn set_version(st: &mut crate::arena::ArenaState, id: EntryId, new: VersionId) {
    let entry = st.entries.get_mut(id.0);
    let old = entry.version.take();
    let link = entry.snapshot.take();
    let live_link = link.filter(|l| l.handle.strong_count() > 0);
    if let Some(link) = live_link {
        let snap = st.snapshots.get_mut(link.id.0);
        snap.version = old;
        snap.entry = None;
    } else if let Some(old) = old {
        st.clear_ref(old);
    }
    st.entries.get_mut(id.0).version = Some(new);
    st.set_ref(new);
}

pub(crate) fn add_version_locked(
    st: &mut crate::arena::ArenaState,
    id: EntryId,
    _schema: &SchemaRef,
    tracker: Option<&Arc<dyn MvccTracker>>,
) -> VersionId {
    let head = st.entries.get(id.0).version.expect("live entry");
    let evictable = st.entries.get(id.0).evictable;
    // Every evictable version carries the dummy at +∞ so old versions can
    // stay around fully discontinuous after eviction.
    let mut data = if evictable {
        PartitionData::make_incomplete(Tombstone::NONE)
    } else {
        PartitionData::new()
    };
    data.set_static_row_continuous(st.node(head).data.static_row_continuous());
    let new = st.new_version(data);
    st.insert_before(new, head);
    set_version(st, id, new);
    if let Some(t) = tracker {
        t.on_version_added();
    }
    new
}

pub(crate) fn open_version_locked(
    st: &mut crate::arena::ArenaState,
    id: EntryId,
    schema: &SchemaRef,
    tracker: Option<&Arc<dyn MvccTracker>>,
    phase: Phase,
) -> VersionId {
    let (attached_phase, head) = {
        let entry = st.entries.get(id.0);
        let attached = entry
            .snapshot
            .as_ref()
            .filter(|l| l.handle.strong_count() > 0)
            .map(|l| st.snapshots.get(l.id.0).phase);
        (attached, entry.version.expect("live entry"))
    };
    match attached_phase {
        Some(p) if p != phase => add_version_locked(st, id, schema, tracker),
        _ => head,
    }
}

/// Whether the union of continuities over the chain covers `pos`.
fn chain_complete_at(
    st: &crate::arena::ArenaState,
    chain: &[VersionId],
    pos: &Position,
) -> bool {
    for vid in chain {
        let data = &st.node(*vid).data;
        match data.rows().range(pos.clone()..).next() {
            Some((p, e)) if p == pos && !e.dummy => return true,
            Some((_, e)) => {
                if e.continuous {
                    return true;
                }
            }
            None => {
                // No sentinel past the position: fully-continuous version.
                return true;
            }
        }
    }
    false
}

/// Groups row entries coincident by position, preserving newest-first
/// order within each group.
fn merge_coincident(rows: Vec<RowEntry>) -> Vec<Vec<RowEntry>> {
    struct HeapItem {
        entry: RowEntry,
        rank: usize,
    }
    impl PartialEq for HeapItem {
        fn eq(&self, other: &Self) -> bool {
            self.entry.position == other.entry.position && self.rank == other.rank
        }
    }
    impl Eq for HeapItem {}
    impl PartialOrd for HeapItem {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for HeapItem {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            // BinaryHeap is a max-heap; reverse for ascending position.
            other
                .entry
                .position
                .cmp(&self.entry.position)
                .then(other.rank.cmp(&self.rank))
        }
    }

    let mut heap: BinaryHeap<HeapItem> = rows
        .into_iter()
        .enumerate()
        .map(|(rank, entry)| HeapItem { entry, rank })
        .collect();
    let mut groups: Vec<Vec<RowEntry>> = Vec::new();
    while let Some(item) = heap.pop() {
        match groups.last_mut() {
            Some(g) if g[0].position == item.entry.position => g.push(item.entry),
            _ => groups.push(vec![item.entry]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::VersionArena;
    use tessera_core::position::ClusteringPrefix;
    use tessera_core::row::{Cell, RowMarker};
    use tessera_core::schema::Schema;
    use tessera_core::{Region, DEFAULT_PHASE};

    fn schema() -> SchemaRef {
        Schema::builder("t").regular_column("v").build_shared()
    }

    fn pos(name: &[u8]) -> Position {
        Position::for_key(ClusteringPrefix::from_components([name.to_vec()]))
    }

    fn row_at(name: &[u8], ts: i64, v: &[u8]) -> RowEntry {
        let mut e = RowEntry::new(pos(name));
        e.marker = RowMarker::new(ts);
        e.row.apply_cell(0, Cell::live(ts, v.to_vec()));
        e
    }

    fn data_with(name: &[u8], ts: i64, v: &[u8]) -> PartitionData {
        let mut d = PartitionData::new();
        d.apply_row(row_at(name, ts, v));
        d
    }

    #[test]
    fn apply_merges_in_place_without_snapshot() {
        let arena = VersionArena::new();
        let region = Region::new();
        let s = schema();
        let entry = PartitionEntry::new(&arena, PartitionData::new());
        entry
            .apply(&region, &s, data_with(b"a", 1, b"x"), &s)
            .unwrap();
        entry
            .apply(&region, &s, data_with(b"b", 2, b"y"), &s)
            .unwrap();
        assert_eq!(entry.chain_len(), 1);
        assert_eq!(entry.squashed(&s, &s).live_row_count(), 2);
    }

    #[test]
    fn apply_prepends_when_snapshot_attached() {
        let arena = VersionArena::new();
        let region = Region::new();
        let s = schema();
        let entry = PartitionEntry::new(&arena, PartitionData::new());
        entry
            .apply(&region, &s, data_with(b"a", 1, b"x"), &s)
            .unwrap();
        let snap = entry.read(&region, &s, None, DEFAULT_PHASE);
        entry
            .apply(&region, &s, data_with(b"a", 2, b"y"), &s)
            .unwrap();
        assert_eq!(entry.chain_len(), 2);
        // The snapshot still sees the old value.
        let old = snap.squashed();
        assert_eq!(
            old.rows().get(&pos(b"a")).unwrap().row.cell(0).unwrap().value,
            Some(b"x".to_vec())
        );
        // A fresh read sees the new value.
        drop(snap);
        let fresh = entry.read(&region, &s, None, DEFAULT_PHASE);
        assert_eq!(
            fresh
                .squashed()
                .rows()
                .get(&pos(b"a"))
                .unwrap()
                .row
                .cell(0)
                .unwrap()
                .value,
            Some(b"y".to_vec())
        );
    }

    #[test]
    fn induced_alloc_failure_forces_prepend() {
        let arena = VersionArena::new();
        let region = Region::new();
        let s = schema();
        let entry = PartitionEntry::new(&arena, PartitionData::new());
        entry
            .apply(&region, &s, data_with(b"a", 1, b"x"), &s)
            .unwrap();
        region.fail_next_allocs(1);
        entry
            .apply(&region, &s, data_with(b"b", 2, b"y"), &s)
            .unwrap();
        assert_eq!(entry.chain_len(), 2);
        // Value is unaffected by the fallback.
        assert_eq!(entry.squashed(&s, &s).live_row_count(), 2);
    }

    #[test]
    fn upgrade_squashes_chain() {
        let arena = VersionArena::new();
        let region = Region::new();
        let v1 = schema();
        let v2 = Arc::new(v1.evolve_with_column("w"));
        let entry = PartitionEntry::new(&arena, PartitionData::new());
        entry
            .apply(&region, &v1, data_with(b"a", 1, b"x"), &v1)
            .unwrap();
        let snap = entry.read(&region, &v1, None, DEFAULT_PHASE);
        entry
            .apply(&region, &v1, data_with(b"b", 2, b"y"), &v1)
            .unwrap();
        assert_eq!(entry.chain_len(), 2);
        entry.upgrade(&v1, &v2, None);
        assert_eq!(entry.chain_len(), 1);
        assert_eq!(entry.squashed(&v2, &v2).live_row_count(), 2);
        drop(snap);
        assert_eq!(arena.version_count(), 1);
    }

    #[test]
    fn entry_drop_transfers_chain_to_snapshot() {
        let arena = VersionArena::new();
        let region = Region::new();
        let s = schema();
        let entry = PartitionEntry::new(&arena, data_with(b"a", 1, b"x"));
        let snap = entry.read(&region, &s, None, DEFAULT_PHASE);
        drop(entry);
        // The chain is still readable through the snapshot.
        assert_eq!(snap.squashed().live_row_count(), 1);
        drop(snap);
        assert_eq!(arena.version_count(), 0);
    }
}
