//! Arena region accounting and reclamation
//!
//! A region owns the memory accounting for one allocator domain (the cache,
//! or one memtable). It tracks used bytes against an optional budget and
//! carries an eviction hook, installed by the cache tracker, which is
//! invoked when usage must shrink. The reclaim counter increments on every
//! reclamation; cursors compare counters to decide whether cached iterators
//! are still valid.
//!
//! Reclamation runs only at allocating-section entry, never while the
//! caller holds index or tracker locks. Code inside a section charges and
//! uncharges freely; the next section entry settles the budget.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What an eviction hook accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimResult {
    /// Some memory was freed; the caller may retry its allocation.
    ReclaimedSomething,
    /// Nothing can be freed; the allocation fails.
    ReclaimedNothing,
}

/// Current usage of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    /// Bytes accounted as used.
    pub used: usize,
    /// The budget, if one is set.
    pub total: Option<usize>,
}

type Evictor = Box<dyn FnMut() -> ReclaimResult + Send>;

struct RegionState {
    used: usize,
    budget: Option<usize>,
    evictor: Option<Evictor>,
    // Test hook: force the next N in-place merge attempts to report failure.
    fail_allocs: usize,
}

/// A move-capable allocator domain with eviction-driven reclamation.
pub struct Region {
    state: Mutex<RegionState>,
    reclaim_count: AtomicU64,
}

impl Region {
    /// A region without a budget; nothing is ever evicted from it.
    pub fn new() -> Arc<Region> {
        Region::with_budget(None)
    }

    /// A region with an optional byte budget.
    pub fn with_budget(budget: Option<usize>) -> Arc<Region> {
        Arc::new(Region {
            state: Mutex::new(RegionState {
                used: 0,
                budget,
                evictor: None,
                fail_allocs: 0,
            }),
            reclaim_count: AtomicU64::new(0),
        })
    }

    /// Installs the eviction hook. The hook must not re-enter the region's
    /// reclamation path.
    pub fn set_evictor(&self, evictor: Evictor) {
        self.state.lock().evictor = Some(evictor);
    }

    /// Removes the eviction hook.
    pub fn clear_evictor(&self) {
        self.state.lock().evictor = None;
    }

    /// Accounts `bytes` as used. Never fails; the budget is settled at the
    /// next section entry.
    pub fn charge(&self, bytes: usize) {
        self.state.lock().used += bytes;
    }

    /// Releases `bytes`.
    pub fn uncharge(&self, bytes: usize) {
        let mut s = self.state.lock();
        s.used = s.used.saturating_sub(bytes);
    }

    /// Current occupancy.
    pub fn occupancy(&self) -> Occupancy {
        let s = self.state.lock();
        Occupancy {
            used: s.used,
            total: s.budget,
        }
    }

    /// The reclaim counter. Unchanged counter means references obtained
    /// earlier are still valid.
    pub fn reclaim_counter(&self) -> u64 {
        self.reclaim_count.load(Ordering::Acquire)
    }

    /// Absorbs the accounting of another region; the other ends up empty.
    /// This is the zero-copy hand-off of a memtable into the cache.
    pub fn merge(&self, other: &Region) {
        let moved = {
            let mut o = other.state.lock();
            std::mem::take(&mut o.used)
        };
        self.state.lock().used += moved;
    }

    /// Runs the eviction hook until usage fits the budget or nothing more
    /// can be reclaimed. Must be called without cache locks held.
    pub fn reclaim_to_budget(&self) {
        loop {
            let (over, mut evictor) = {
                let mut s = self.state.lock();
                let over = match s.budget {
                    Some(b) => s.used > b,
                    None => false,
                };
                if !over {
                    return;
                }
                (over, s.evictor.take())
            };
            debug_assert!(over);
            let Some(hook) = evictor.as_mut() else {
                return;
            };
            let result = hook();
            self.reclaim_count.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(?result, "region reclaimed");
            let mut s = self.state.lock();
            if s.evictor.is_none() {
                s.evictor = evictor;
            }
            if result == ReclaimResult::ReclaimedNothing {
                return;
            }
        }
    }

    /// Test hook: make the next `n` in-place merge attempts fail, forcing
    /// the prepend path.
    pub fn fail_next_allocs(&self, n: usize) {
        self.state.lock().fail_allocs = n;
    }

    /// Consumes one induced failure, if armed.
    pub fn take_alloc_failure(&self) -> bool {
        let mut s = self.state.lock();
        if s.fail_allocs > 0 {
            s.fail_allocs -= 1;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let occ = self.occupancy();
        f.debug_struct("Region")
            .field("used", &occ.used)
            .field("total", &occ.total)
            .field("reclaim_count", &self.reclaim_counter())
            .finish()
    }
}

/// A re-entrant bracket for code that allocates from a region.
///
/// Entry settles the budget by running the eviction hook; the closure then
/// runs with the guarantee that usage was within budget when it started.
/// Pointers cached across sections must be revalidated against the reclaim
/// counter.
#[derive(Debug, Default)]
pub struct AllocatingSection;

impl AllocatingSection {
    /// Creates a section bracket.
    pub fn new() -> Self {
        AllocatingSection
    }

    /// Runs `f` inside the section.
    pub fn run<T>(&self, region: &Region, f: impl FnOnce() -> T) -> T {
        region.reclaim_to_budget();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_merge() {
        let a = Region::new();
        let b = Region::new();
        a.charge(100);
        b.charge(50);
        a.merge(&b);
        assert_eq!(a.occupancy().used, 150);
        assert_eq!(b.occupancy().used, 0);
    }

    #[test]
    fn reclaim_runs_hook_until_within_budget() {
        let r = Region::with_budget(Some(100));
        r.charge(250);
        let freed = Arc::new(AtomicU64::new(0));
        let freed2 = Arc::clone(&freed);
        let r2 = Arc::downgrade(&r);
        r.set_evictor(Box::new(move || {
            freed2.fetch_add(1, Ordering::SeqCst);
            if let Some(r) = r2.upgrade() {
                r.uncharge(100);
            }
            ReclaimResult::ReclaimedSomething
        }));
        AllocatingSection::new().run(&r, || {});
        assert_eq!(freed.load(Ordering::SeqCst), 2);
        assert!(r.occupancy().used <= 100);
        assert_eq!(r.reclaim_counter(), 2);
    }

    #[test]
    fn reclaim_stops_when_nothing_reclaimed() {
        let r = Region::with_budget(Some(10));
        r.charge(50);
        r.set_evictor(Box::new(|| ReclaimResult::ReclaimedNothing));
        r.reclaim_to_budget();
        assert_eq!(r.occupancy().used, 50);
    }
}
