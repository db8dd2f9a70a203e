//! Partition snapshots
//!
//! A snapshot is a read handle to some particular version: it allows only
//! reads, and the version it points to won't be modified as long as the
//! snapshot is alive. Snapshots start attached to their entry; once a
//! writer prepends a new version, the snapshot takes over the reference to
//! the version it was reading.
//!
//! Destroying a snapshot opportunistically merges adjacent versions not
//! referenced by anyone else, keeping chains short. A snapshot marked
//! unique owner instead frees the whole downstream chain, continuing the
//! walk its dead entry started.

use crate::arena::{SnapshotId, VersionArena, VersionId};
use crate::MvccTracker;
use std::sync::Arc;
use tessera_core::partition::merge_newer;
use tessera_core::position::Position;
use tessera_core::row::Row;
use tessera_core::schema::SchemaRef;
use tessera_core::tombstone::RangeTombstone;
use tessera_core::{PartitionData, Phase, Region, Tombstone};

/// Reference-stability mark: the pair of region reclaim counter and
/// snapshot version count.
///
/// Two equal marks taken from the same snapshot guarantee that iterators
/// and references obtained in between are still valid. The default mark is
/// null and compares unequal to any real mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeMark {
    reclaim_count: u64,
    version_count: usize,
    live: bool,
}

/// A read handle pinning a suffix of a partition's version chain.
pub struct PartitionSnapshot {
    arena: Arc<VersionArena>,
    id: SnapshotId,
    schema: SchemaRef,
    phase: Phase,
    region: Arc<Region>,
    tracker: Option<Arc<dyn MvccTracker>>,
}

impl PartitionSnapshot {
    pub(crate) fn create(
        arena: Arc<VersionArena>,
        id: SnapshotId,
        schema: SchemaRef,
        phase: Phase,
        region: Arc<Region>,
        tracker: Option<Arc<dyn MvccTracker>>,
    ) -> Arc<PartitionSnapshot> {
        Arc::new(PartitionSnapshot {
            arena,
            id,
            schema,
            phase,
            region,
            tracker,
        })
    }

    /// The schema the snapshot reads with.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// The population phase the snapshot was created at.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the snapshot still tracks the latest version of its entry.
    pub fn at_latest_version(&self) -> bool {
        let st = self.arena.state.lock();
        st.snapshots.get(self.id.0).entry.is_some()
    }

    fn version_locked(&self, st: &crate::arena::ArenaState) -> VersionId {
        let snap = st.snapshots.get(self.id.0);
        match snap.version {
            Some(v) => v,
            None => {
                let entry = snap.entry.expect("either version or entry");
                st.entries.get(entry.0).version.expect("live entry")
            }
        }
    }

    /// Number of versions visible to this snapshot.
    pub fn version_count(&self) -> usize {
        let st = self.arena.state.lock();
        st.chain_from(self.version_locked(&st)).len()
    }

    /// Takes a reference-stability mark.
    pub fn change_mark(&self) -> ChangeMark {
        ChangeMark {
            reclaim_count: self.region.reclaim_counter(),
            version_count: self.version_count(),
            live: true,
        }
    }

    /// The partition tombstone folded over the visible chain.
    pub fn partition_tombstone(&self) -> Tombstone {
        let st = self.arena.state.lock();
        let mut t = Tombstone::NONE;
        for vid in st.chain_from(self.version_locked(&st)) {
            t.apply(st.node(vid).data.partition_tombstone());
        }
        t
    }

    /// The static row folded over the visible chain.
    pub fn static_row(&self) -> Row {
        let st = self.arena.state.lock();
        let chain = st.chain_from(self.version_locked(&st));
        let mut row = Row::new();
        for vid in chain.iter().rev() {
            row.apply(st.node(*vid).data.static_row().clone());
        }
        row
    }

    /// Whether the static row is known complete in the newest visible
    /// version.
    pub fn static_row_continuous(&self) -> bool {
        let st = self.arena.state.lock();
        let v = self.version_locked(&st);
        st.node(v).data.static_row_continuous()
    }

    /// The whole partition folded over the visible chain.
    pub fn squashed(&self) -> PartitionData {
        let st = self.arena.state.lock();
        let chain = st.chain_from(self.version_locked(&st));
        let mut acc = PartitionData::new();
        acc.set_static_row_continuous(st.node(chain[0]).data.static_row_continuous());
        for vid in chain {
            let older = st.node(vid).data.clone();
            acc = merge_newer(older, acc);
        }
        acc
    }

    /// Range tombstones overlapping `[start, end)`, folded over the chain.
    pub fn range_tombstones(&self, start: &Position, end: &Position) -> Vec<RangeTombstone> {
        let st = self.arena.state.lock();
        let chain = st.chain_from(self.version_locked(&st));
        if chain.len() == 1 {
            return st.node(chain[0]).data.row_tombstones().slice(start, end);
        }
        let mut list = tessera_core::RangeTombstoneList::new();
        for vid in chain {
            for rt in st.node(vid).data.row_tombstones().slice(start, end) {
                list.apply(rt);
            }
        }
        list.slice(start, end)
    }

    /// All range tombstones visible to the snapshot.
    pub fn all_range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_tombstones(
            &Position::before_all_clustered_rows(),
            &Position::after_all_clustered_rows(),
        )
    }

    /// Whether the union of continuities over the visible chain covers the
    /// position.
    pub fn continuous_at(&self, pos: &Position) -> bool {
        let st = self.arena.state.lock();
        let chain = st.chain_from(self.version_locked(&st));
        for vid in chain {
            if st.node(vid).data.continuous_at(pos) {
                return true;
            }
        }
        false
    }

    /// Merges the version pointed to by this snapshot with adjacent
    /// versions not referenced by anyone else. Leaves the snapshot
    /// detached from the chain; can be retried if a previous attempt was
    /// interrupted.
    pub fn merge_partition_versions(&self) {
        let mut st = self.arena.state.lock();
        merge_versions_locked(&mut st, self.id, None);
    }

    /// Bounded variant of [`Self::merge_partition_versions`]: merges at
    /// most `budget` versions. Returns true when no mergeable versions
    /// remain.
    pub fn merge_some(&self, budget: usize) -> bool {
        let mut st = self.arena.state.lock();
        merge_versions_locked(&mut st, self.id, Some(budget))
    }

    /// True when the snapshot can be disposed without merge work: it owns
    /// no reference, or the version it references is the oldest.
    pub fn slide_to_oldest(&self) -> bool {
        let st = self.arena.state.lock();
        match st.snapshots.get(self.id.0).version {
            None => true,
            Some(v) => st.node(v).next.is_none(),
        }
    }
}

/// Shared merge walk: clears the snapshot's reference, backs up to the
/// first used boundary, then folds forward over non-referenced versions.
/// Returns true when nothing mergeable remains.
fn merge_versions_locked(
    st: &mut crate::arena::ArenaState,
    id: SnapshotId,
    budget: Option<usize>,
) -> bool {
    let snap = st.snapshots.get_mut(id.0);
    let Some(v) = snap.version else {
        return true;
    };
    if st.is_unique_owner(v) {
        return true;
    }
    st.snapshots.get_mut(id.0).version = None;
    st.clear_ref(v);

    let mut first_used = v;
    while st.node(first_used).prev.is_some() && !st.is_referenced(first_used) {
        first_used = st.node(first_used).prev.expect("checked");
    }

    let mut left = budget.unwrap_or(usize::MAX);
    let mut current = st.node(first_used).next;
    while let Some(c) = current {
        if st.is_referenced(c) {
            break;
        }
        if left == 0 {
            // Re-pin the first unmerged version so a later call can
            // continue from here. It is unreferenced, so the reference
            // slot is free.
            st.snapshots.get_mut(id.0).version = Some(c);
            st.set_ref(c);
            return false;
        }
        let next = st.node(c).next;
        let older = st.free_version(c);
        let newer = std::mem::take(&mut st.node_mut(first_used).data);
        st.node_mut(first_used).data = merge_newer(older, newer);
        current = next;
        left -= 1;
    }
    true
}

impl Drop for PartitionSnapshot {
    fn drop(&mut self) {
        let mut st = self.arena.state.lock();
        let snap = st.snapshots.get_mut(self.id.0);
        let version = snap.version;
        let entry = snap.entry;
        match version {
            Some(v) if st.is_unique_owner(v) => {
                // Sole owner of the downstream chain: continue the removal
                // walk the entry started.
                st.snapshots.get_mut(self.id.0).version = None;
                st.clear_ref(v);
                st.remove_or_mark_as_unique_owner(
                    Some(v),
                    self.tracker.as_ref().map(|t| t.as_ref()),
                );
            }
            Some(_) => {
                merge_versions_locked(&mut st, self.id, None);
            }
            None => {}
        }
        if let Some(eid) = entry {
            let e = st.entries.get_mut(eid.0);
            if e.snapshot.as_ref().map(|l| l.id) == Some(self.id) {
                e.snapshot = None;
            }
        }
        st.snapshots.remove(self.id.0);
    }
}
