//! Stable cursor over cache entries in a partition range
//!
//! The cursor's position is always valid, but the entry it points at is
//! only valid while the region's reclaim counter and the tracker's
//! modification counter are unchanged since the last refresh. `refresh()`
//! re-seeks when either moved.

use crate::row_cache::RowCacheShared;
use std::sync::Arc;
use tessera_core::{DecoratedKey, KeyRange, RingBound, RingKey};

/// A copied view of the cache entry under the cursor.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    /// The entry's key; `None` for the end sentinel.
    pub key: Option<DecoratedKey>,
    /// Whether the gap before the entry is known empty.
    pub continuous: bool,
    /// Whether this is the end sentinel.
    pub dummy: bool,
}

/// Stable cursor over the cache index.
pub struct PartitionRangeCursor {
    shared: Arc<RowCacheShared>,
    pos: RingBound,
    end: RingBound,
    last: Option<RingKey>,
    view: Option<CursorEntry>,
    last_reclaim_count: u64,
    last_modification_count: u64,
}

impl PartitionRangeCursor {
    /// Creates a cursor positioned at the lower bound of the range. The
    /// entry view is not valid until the first refresh.
    pub(crate) fn new(shared: Arc<RowCacheShared>, range: &KeyRange) -> PartitionRangeCursor {
        PartitionRangeCursor {
            shared,
            pos: range.start.clone(),
            end: range.end.clone(),
            last: None,
            view: None,
            last_reclaim_count: u64::MAX,
            last_modification_count: u64::MAX,
        }
    }

    /// Ensures the entry view is valid. Returns true iff the cursor's
    /// position did not change.
    pub fn refresh(&mut self) -> bool {
        let reclaim_count = self.shared.tracker.region().reclaim_counter();
        let modification_count = self.shared.tracker.modification_count();
        if reclaim_count == self.last_reclaim_count
            && modification_count == self.last_modification_count
            && self.view.is_some()
        {
            return true;
        }

        if self.end.cmp_bound(&self.pos) == std::cmp::Ordering::Less {
            // next() may have moved the position past the range end.
            self.end = self.pos.clone();
        }
        let idx = self.shared.index.lock();
        let found = idx.lower_bound(&self.pos);
        let same = self.last.as_ref() == Some(&found);
        let entry = idx.get(&found).expect("lower_bound returns live key");
        self.view = Some(CursorEntry {
            key: found.as_key().cloned(),
            continuous: entry.continuous(),
            dummy: entry.is_dummy(),
        });
        drop(idx);
        self.set_position(&found);
        self.last = Some(found);
        self.last_reclaim_count = reclaim_count;
        self.last_modification_count = modification_count;
        same
    }

    fn set_position(&mut self, at: &RingKey) {
        self.pos = match at {
            RingKey::Key(k) => RingBound::Before(k.clone()),
            RingKey::Max => RingBound::Max,
        };
    }

    /// Positions the cursor at the next entry. May advance past the
    /// requested range; check `in_range()` afterwards. Call only after a
    /// successful refresh.
    pub fn next(&mut self) {
        let cur = self.last.clone().expect("cursor refreshed");
        let idx = self.shared.index.lock();
        let succ = idx.successor(&cur);
        let entry = idx.get(&succ).expect("successor is live");
        self.view = Some(CursorEntry {
            key: succ.as_key().cloned(),
            continuous: entry.continuous(),
            dummy: entry.is_dummy(),
        });
        drop(idx);
        self.set_position(&succ);
        self.last = Some(succ);
    }

    /// The entry under the cursor. Valid after refresh and before the
    /// index changes.
    pub fn entry(&self) -> &CursorEntry {
        self.view.as_ref().expect("cursor refreshed")
    }

    /// Whether the cursor still points inside the requested range.
    pub fn in_range(&self) -> bool {
        match &self.last {
            Some(RingKey::Key(k)) => self.end.cmp_key(k) == std::cmp::Ordering::Greater,
            _ => false,
        }
    }

    /// The cursor's current position.
    pub fn position(&self) -> &RingBound {
        &self.pos
    }
}
