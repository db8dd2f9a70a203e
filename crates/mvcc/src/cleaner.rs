//! Incremental destruction of garbage versions
//!
//! Freeing a long version chain at once can stall the shard. The cleaner
//! collects detached versions and not-yet-merged snapshots and destroys
//! them in bounded batches on a background worker, cooperating with the
//! reclaimer through `clear_some`.

use crate::arena::{VersionArena, VersionId};
use crate::snapshot::PartitionSnapshot;
use crate::MvccTracker;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tessera_core::{ReclaimResult, Region};

struct CleanerQueue {
    versions: VecDeque<VersionId>,
    snapshots: Vec<Arc<PartitionSnapshot>>,
    shutdown: bool,
}

impl CleanerQueue {
    fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.snapshots.is_empty()
    }
}

struct CleanerShared {
    queue: Mutex<CleanerQueue>,
    cv: Condvar,
}

/// Container for garbage versions, freeing them incrementally.
pub struct MutationCleaner {
    arena: Arc<VersionArena>,
    region: Arc<Region>,
    tracker: Option<Arc<dyn MvccTracker>>,
    shared: Arc<CleanerShared>,
    batch: usize,
    worker: Option<JoinHandle<()>>,
}

impl MutationCleaner {
    /// Creates a cleaner and starts its worker.
    pub fn new(
        arena: &Arc<VersionArena>,
        region: &Arc<Region>,
        tracker: Option<Arc<dyn MvccTracker>>,
        batch: usize,
    ) -> MutationCleaner {
        let shared = Arc::new(CleanerShared {
            queue: Mutex::new(CleanerQueue {
                versions: VecDeque::new(),
                snapshots: Vec::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let arena = Arc::clone(arena);
            let tracker = tracker.clone();
            std::thread::Builder::new()
                .name("mutation-cleaner".into())
                .spawn(move || worker_loop(shared, arena, tracker, batch))
                .expect("spawn cleaner worker")
        };
        MutationCleaner {
            arena: Arc::clone(arena),
            region: Arc::clone(region),
            tracker,
            shared,
            batch,
            worker: Some(worker),
        }
    }

    /// Enqueues a version for destruction. The version must be detached
    /// from every chain and entry and no longer accessed.
    pub fn destroy_later(&self, version: VersionId) {
        let mut q = self.shared.queue.lock();
        q.versions.push_back(version);
        self.shared.cv.notify_all();
    }

    /// Destroys a version now if cheap, otherwise enqueues the remainder.
    pub fn destroy_gently(&self, version: VersionId) {
        let done = free_some(&self.arena, version, self.tracker.as_deref(), self.batch);
        if !done {
            self.destroy_later(version);
        }
    }

    /// One tick of cleaning work. Returns true when the queue is empty.
    pub fn clear_gently(&self) -> bool {
        let version = {
            let mut q = self.shared.queue.lock();
            match q.versions.pop_front() {
                Some(v) => v,
                None => return q.snapshots.is_empty(),
            }
        };
        let done = free_some(&self.arena, version, self.tracker.as_deref(), self.batch);
        let mut q = self.shared.queue.lock();
        if !done {
            q.versions.push_front(version);
        }
        if q.is_empty() {
            self.shared.cv.notify_all();
        }
        false
    }

    /// Reclaimer entry point: frees a batch and reports whether any memory
    /// was released.
    pub fn clear_some(&self) -> ReclaimResult {
        if self.shared.queue.lock().is_empty() {
            return ReclaimResult::ReclaimedNothing;
        }
        self.clear_gently();
        ReclaimResult::ReclaimedSomething
    }

    /// Frees everything synchronously.
    pub fn clear(&self) {
        while !self.clear_gently() {}
    }

    /// Whether the cleaner holds no unfreed objects.
    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    /// Disposes of a snapshot: immediately when no merge work remains,
    /// otherwise on the worker.
    pub fn merge_and_destroy(&self, snapshot: Arc<PartitionSnapshot>) {
        if snapshot.slide_to_oldest() || snapshot.merge_some(self.batch) {
            drop(snapshot);
            return;
        }
        let mut q = self.shared.queue.lock();
        q.snapshots.push(snapshot);
        self.shared.cv.notify_all();
    }

    /// Splices another cleaner's work into this one. Both must operate on
    /// the same arena and region.
    pub fn merge(&self, other: &MutationCleaner) {
        assert!(Arc::ptr_eq(&self.arena, &other.arena));
        assert!(Arc::ptr_eq(&self.region, &other.region));
        let mut moved = {
            let mut oq = other.shared.queue.lock();
            let versions = std::mem::take(&mut oq.versions);
            let snapshots = std::mem::take(&mut oq.snapshots);
            (versions, snapshots)
        };
        let mut q = self.shared.queue.lock();
        q.versions.append(&mut moved.0);
        q.snapshots.append(&mut moved.1);
        if !q.is_empty() {
            self.shared.cv.notify_all();
        }
    }

    /// Blocks until nothing is left to clean.
    pub fn drain(&self) {
        let mut q = self.shared.queue.lock();
        while !q.is_empty() {
            self.shared.cv.notify_all();
            self.shared.cv.wait(&mut q);
        }
    }

}

/// Frees one batch of a version's rows, reporting removals to the tracker.
/// Returns true when the version was fully freed.
fn free_some(
    arena: &VersionArena,
    version: VersionId,
    tracker: Option<&dyn MvccTracker>,
    batch: usize,
) -> bool {
    let mut st = arena.state.lock();
    let before = st.node(version).data.live_row_count();
    let done = st.node_mut(version).data.clear_some(batch);
    let after = if done {
        0
    } else {
        st.node(version).data.live_row_count()
    };
    if let Some(t) = tracker {
        for _ in after..before {
            t.on_row_removed();
        }
    }
    if done {
        st.free_version(version);
    }
    done
}

impl Drop for MutationCleaner {
    fn drop(&mut self) {
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
            self.shared.cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // Whatever remains is freed synchronously.
        let (versions, snapshots) = {
            let mut q = self.shared.queue.lock();
            (
                std::mem::take(&mut q.versions),
                std::mem::take(&mut q.snapshots),
            )
        };
        let mut st = self.arena.state.lock();
        for v in versions {
            st.free_version(v);
        }
        drop(st);
        drop(snapshots);
    }
}

fn worker_loop(
    shared: Arc<CleanerShared>,
    arena: Arc<VersionArena>,
    tracker: Option<Arc<dyn MvccTracker>>,
    batch: usize,
) {
    loop {
        let work = {
            let mut q = shared.queue.lock();
            loop {
                if q.shutdown {
                    return;
                }
                if let Some(v) = q.versions.pop_front() {
                    break Work::Version(v);
                }
                if let Some(s) = q.snapshots.pop() {
                    break Work::Snapshot(s);
                }
                shared.cv.notify_all();
                shared.cv.wait(&mut q);
            }
        };
        match work {
            Work::Version(v) => {
                let done = free_some(&arena, v, tracker.as_deref(), batch);
                if !done {
                    shared.queue.lock().versions.push_front(v);
                }
            }
            Work::Snapshot(s) => {
                if !s.merge_some(batch) {
                    shared.queue.lock().snapshots.push(s);
                    // Let other work interleave before retrying.
                    std::thread::yield_now();
                } else {
                    drop(s);
                }
            }
        }
        let q = shared.queue.lock();
        if q.is_empty() {
            shared.cv.notify_all();
        }
    }
}

enum Work {
    Version(VersionId),
    Snapshot(Arc<PartitionSnapshot>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::PartitionEntry;
    use tessera_core::position::{ClusteringPrefix, Position};
    use tessera_core::row::{Cell, RowEntry, RowMarker};
    use tessera_core::schema::Schema;
    use tessera_core::PartitionData;

    fn big_partition(rows: usize) -> PartitionData {
        let mut d = PartitionData::new();
        for i in 0..rows {
            let mut e = RowEntry::new(Position::for_key(ClusteringPrefix::from_components([
                format!("{i:06}").into_bytes(),
            ])));
            e.marker = RowMarker::new(1);
            e.row.apply_cell(0, Cell::live(1, b"v".to_vec()));
            d.apply_row(e);
        }
        d
    }

    #[test]
    fn drain_completes_after_finite_work() {
        let arena = VersionArena::new();
        let region = Region::new();
        let cleaner = MutationCleaner::new(&arena, &region, None, 8);
        for _ in 0..4 {
            let vid = {
                let mut st = arena.state.lock();
                st.new_version(big_partition(100))
            };
            cleaner.destroy_later(vid);
        }
        cleaner.drain();
        assert!(cleaner.is_empty());
        assert_eq!(arena.version_count(), 0);
    }

    #[test]
    fn destroy_gently_frees_small_versions_inline() {
        let arena = VersionArena::new();
        let region = Region::new();
        let cleaner = MutationCleaner::new(&arena, &region, None, 8);
        let vid = {
            let mut st = arena.state.lock();
            st.new_version(big_partition(3))
        };
        cleaner.destroy_gently(vid);
        assert_eq!(arena.version_count(), 0);
        assert!(cleaner.is_empty());
    }

    #[test]
    fn clear_some_reports_progress() {
        let arena = VersionArena::new();
        let region = Region::new();
        let cleaner = MutationCleaner::new(&arena, &region, None, 8);
        assert_eq!(cleaner.clear_some(), ReclaimResult::ReclaimedNothing);
        let vid = {
            let mut st = arena.state.lock();
            st.new_version(big_partition(4))
        };
        // Keep the worker from racing for the queue entry.
        cleaner.destroy_later(vid);
        while cleaner.clear_some() == ReclaimResult::ReclaimedSomething {}
        assert!(cleaner.is_empty());
    }

    #[test]
    fn merge_and_destroy_disposes_snapshots() {
        let arena = VersionArena::new();
        let region = Region::new();
        let s = Schema::builder("t").regular_column("v").build_shared();
        let cleaner = MutationCleaner::new(&arena, &region, None, 8);
        let entry = PartitionEntry::new(&arena, big_partition(4));
        let snap = entry.read(&region, &s, None, tessera_core::DEFAULT_PHASE);
        entry
            .apply(&region, &s, big_partition(2), &s)
            .unwrap();
        cleaner.merge_and_destroy(snap);
        cleaner.drain();
        assert_eq!(entry.chain_len(), 1);
    }
}
