//! Per-partition data
//!
//! `PartitionData` is the value one MVCC version holds: partition tombstone,
//! static row, ordered clustering rows and a range tombstone list. In a
//! version chain each instance is a delta against its successor; the
//! partition's logical value is the fold of the chain with
//! [`PartitionData::apply_monotonically`].
//!
//! Continuity: each row entry's `continuous` flag describes the gap before
//! it. Fully-continuous partitions (memtable) need no sentinels; evictable
//! partitions always carry a dummy entry at +∞ so the tail gap has a flag
//! and the partition can be made fully discontinuous by eviction.

use crate::position::Position;
use crate::row::{Row, RowEntry};
use crate::schema::SchemaRef;
use crate::tombstone::{RangeTombstoneList, Tombstone};
use crate::{DecoratedKey, Timestamp};
use std::collections::BTreeMap;

/// Outcome of a bounded merge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The source was fully folded in.
    Done,
    /// The budget ran out; the source holds the remainder. Retrying until
    /// `Done` yields the same result as a single unbounded apply.
    Stopped,
}

/// A write against one partition.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Schema the partition data is expressed in.
    pub schema: SchemaRef,
    /// The partition written to.
    pub key: DecoratedKey,
    /// The written data.
    pub partition: PartitionData,
}

impl Mutation {
    /// Creates a mutation.
    pub fn new(schema: SchemaRef, key: DecoratedKey, partition: PartitionData) -> Self {
        Mutation {
            schema,
            key,
            partition,
        }
    }
}

/// The state of one partition (or one version's delta of it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionData {
    tombstone: Tombstone,
    static_row: Row,
    static_row_continuous: bool,
    rows: BTreeMap<Position, RowEntry>,
    row_tombstones: RangeTombstoneList,
}

impl PartitionData {
    /// An empty, fully-continuous partition.
    pub fn new() -> Self {
        PartitionData {
            tombstone: Tombstone::NONE,
            static_row: Row::new(),
            static_row_continuous: true,
            rows: BTreeMap::new(),
            row_tombstones: RangeTombstoneList::new(),
        }
    }

    /// A fully-discontinuous partition carrying only the partition
    /// tombstone, with the mandatory dummy sentinel at +∞.
    pub fn make_incomplete(tombstone: Tombstone) -> Self {
        let mut p = PartitionData::new();
        p.tombstone = tombstone;
        p.static_row_continuous = false;
        let sentinel = Position::after_all_clustered_rows();
        p.rows.insert(sentinel.clone(), RowEntry::dummy(sentinel, false));
        p
    }

    /// The partition tombstone.
    pub fn partition_tombstone(&self) -> Tombstone {
        self.tombstone
    }

    /// Applies a partition tombstone.
    pub fn apply_tombstone(&mut self, t: Tombstone) {
        self.tombstone.apply(t);
    }

    /// The static row.
    pub fn static_row(&self) -> &Row {
        &self.static_row
    }

    /// Mutable access to the static row.
    pub fn static_row_mut(&mut self) -> &mut Row {
        &mut self.static_row
    }

    /// Whether the static row is known complete.
    pub fn static_row_continuous(&self) -> bool {
        self.static_row_continuous
    }

    /// Sets the static-row continuity flag.
    pub fn set_static_row_continuous(&mut self, value: bool) {
        self.static_row_continuous = value;
    }

    /// The range tombstone list.
    pub fn row_tombstones(&self) -> &RangeTombstoneList {
        &self.row_tombstones
    }

    /// Mutable access to the range tombstone list.
    pub fn row_tombstones_mut(&mut self) -> &mut RangeTombstoneList {
        &mut self.row_tombstones
    }

    /// Clustering rows in position order.
    pub fn rows(&self) -> &BTreeMap<Position, RowEntry> {
        &self.rows
    }

    /// Mutable access to the clustering rows.
    pub fn rows_mut(&mut self) -> &mut BTreeMap<Position, RowEntry> {
        &mut self.rows
    }

    /// Inserts or merges a row entry at its position.
    pub fn apply_row(&mut self, entry: RowEntry) {
        match self.rows.entry(entry.position.clone()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(entry);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                e.get_mut().apply(entry);
            }
        }
    }

    /// Writes a live clustering row with cells, the way a mutation builder
    /// would.
    pub fn insert_row(&mut self, position: Position, entry: RowEntry) {
        self.apply_row(RowEntry { position, ..entry });
    }

    /// Ensures the dummy sentinel at +∞ exists. The flag on a newly made
    /// sentinel mirrors full continuity, so this is safe to call on a
    /// fully-continuous partition without changing its meaning.
    pub fn ensure_last_dummy(&mut self) {
        let sentinel = Position::after_all_clustered_rows();
        self.rows
            .entry(sentinel.clone())
            .or_insert_with(|| RowEntry::dummy(sentinel, true));
    }

    /// Whether the partition is complete at the given position: either a
    /// row exists exactly there, or the gap covering it is known empty.
    ///
    /// With no sentinel past the position the partition is treated as fully
    /// continuous (the non-evictable convention).
    pub fn continuous_at(&self, pos: &Position) -> bool {
        match self.rows.range(pos.clone()..).next() {
            Some((p, e)) if p == pos && !e.dummy => true,
            Some((_, e)) => e.continuous,
            None => true,
        }
    }

    /// Whether every range of the partition is known complete: the static
    /// row and every gap, including the tail gap when a sentinel exists.
    pub fn is_fully_continuous(&self) -> bool {
        self.static_row_continuous && self.rows.values().all(|e| e.continuous)
    }

    /// Marks every gap discontinuous while keeping the row data.
    pub fn mark_fully_discontinuous(&mut self) {
        self.static_row_continuous = false;
        for e in self.rows.values_mut() {
            e.continuous = false;
        }
    }

    /// Folds another partition into this one, bounded by `limit` row moves.
    ///
    /// This provides the monotonic weak guarantee: on [`ApplyOutcome::Stopped`]
    /// the remainder stays in `other`, and any number of retries followed by
    /// one success is equivalent to a single successful apply. Continuity
    /// flags of coinciding entries are combined by union.
    pub fn apply_monotonically(
        &mut self,
        other: &mut PartitionData,
        limit: Option<usize>,
    ) -> ApplyOutcome {
        self.tombstone.apply(other.tombstone);
        self.static_row_continuous |= other.static_row_continuous;
        // Cell reconciliation is max-based, so re-applying an already-merged
        // static row on retry is harmless.
        self.static_row.apply(std::mem::take(&mut other.static_row));
        self.row_tombstones
            .apply_list_owned(std::mem::take(&mut other.row_tombstones));

        let mut budget = limit.unwrap_or(usize::MAX);
        while let Some(pos) = other.rows.keys().next().cloned() {
            if budget == 0 {
                return ApplyOutcome::Stopped;
            }
            let entry = other.rows.remove(&pos).expect("first key exists");
            self.apply_row(entry);
            budget -= 1;
        }
        ApplyOutcome::Done
    }

    /// Whether the partition holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none()
            && self.static_row.is_empty()
            && self.rows.is_empty()
            && self.row_tombstones.is_empty()
    }

    /// Live (non-dummy) row count.
    pub fn live_row_count(&self) -> usize {
        self.rows.values().filter(|e| !e.dummy).count()
    }

    /// Drops data deleted by tombstones; used when squashing for reads.
    pub fn compact(&mut self) {
        let tomb = self.tombstone;
        self.static_row.compact(tomb);
        let row_tombs = self.row_tombstones.clone();
        self.rows.retain(|pos, e| {
            let mut covering = tomb;
            covering.apply(row_tombs.tombstone_at(pos));
            covering.apply(e.tombstone);
            e.row.compact(covering);
            if covering.deletes(e.marker.timestamp) {
                e.marker = crate::row::RowMarker::NONE;
            }
            e.dummy || e.has_data()
        });
    }

    /// Removes up to `limit` rows and tombstones. Returns true when nothing
    /// is left to free.
    pub fn clear_some(&mut self, limit: usize) -> bool {
        let mut left = limit.max(1);
        while left > 0 {
            match self.rows.keys().next_back().cloned() {
                Some(pos) => {
                    self.rows.remove(&pos);
                    left -= 1;
                }
                None => break,
            }
        }
        if !self.rows.is_empty() {
            return false;
        }
        self.row_tombstones.clear_some(left.max(1));
        self.static_row = Row::new();
        self.rows.is_empty() && self.row_tombstones.is_empty()
    }

    /// Estimated heap footprint, used for region accounting.
    pub fn memory_usage(&self) -> usize {
        self.static_row.memory_usage()
            + self.rows.values().map(|e| e.memory_usage()).sum::<usize>()
            + self.row_tombstones.memory_usage()
    }

    /// The newest write timestamp present, for diagnostics.
    pub fn max_timestamp(&self) -> Timestamp {
        let mut ts = self.tombstone.timestamp;
        for e in self.rows.values() {
            ts = ts.max(e.marker.timestamp).max(e.tombstone.timestamp);
            for (_, c) in e.row.iter() {
                ts = ts.max(c.timestamp);
            }
        }
        ts
    }
}

/// Folds `newer` onto `older` and returns the combined partition.
///
/// This is the reduction step for version chains: the chain's logical value
/// is `merge_newer(head, merge_newer(second, ...))` from tail to head.
pub fn merge_newer(older: PartitionData, mut newer: PartitionData) -> PartitionData {
    let mut acc = older;
    let outcome = acc.apply_monotonically(&mut newer, None);
    debug_assert_eq!(outcome, ApplyOutcome::Done);
    acc
}
