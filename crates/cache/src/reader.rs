//! Scanning-and-populating reads
//!
//! A range scan alternates between a primary cursor over cached entries
//! and a secondary read of the underlying source. While the primary points
//! at a continuous entry it is served from cache; on transition into a
//! non-continuous gap the exact gap range is delegated to the secondary,
//! populating as it goes, and the scan resumes from the next cache entry.
//! When the secondary finishes a gap under a stable phase with a known
//! previous key, the entry bounding the gap becomes continuous.

use crate::cursor::PartitionRangeCursor;
use crate::row_cache::{strip_dummies, CachedPartition, PreviousEntry, RowCache, RowCacheShared};
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_core::{
    DecoratedKey, KeyRange, PartitionAssembler, PartitionData, Phase, ReadOptions, Result,
    RingBound, RingKey,
};

struct SecondaryState {
    partitions: VecDeque<(DecoratedKey, PartitionData)>,
    phase: Phase,
    // The key preceding the next population in key order; None means the
    // ring minimum; disengaged means continuity must not be set.
    anchor: Option<Option<DecoratedKey>>,
    gap_start: RingBound,
    gap_end: RingBound,
}

/// Iterator over a partition range, serving from cache and populating
/// misses.
pub struct ScanningReader {
    shared: Arc<RowCacheShared>,
    range: KeyRange,
    primary: PartitionRangeCursor,
    secondary: Option<SecondaryState>,
    advance_primary: bool,
    lower_bound: Option<RingBound>,
    done: bool,
}

impl RowCache {
    /// Opens a scanning reader over the given partition range.
    pub fn scan(&self, range: KeyRange) -> ScanningReader {
        let primary = PartitionRangeCursor::new(Arc::clone(&self.shared), &range);
        ScanningReader {
            shared: Arc::clone(&self.shared),
            range,
            primary,
            secondary: None,
            advance_primary: false,
            lower_bound: None,
            done: false,
        }
    }
}

impl ScanningReader {
    fn start_secondary(&mut self, gap: KeyRange) -> Result<()> {
        let anchor = match &gap.start {
            RingBound::Min => Some(None),
            RingBound::After(k) => Some(Some(k.clone())),
            _ => None,
        };
        let sp = self.shared.snapshot_of_bound(&gap.start);
        let schema = Arc::clone(&self.shared.schema.lock());
        let mut stream = sp.source.read(schema, &gap, ReadOptions::default());
        let partitions = PartitionAssembler::assemble_all(stream.as_mut())?;
        self.secondary = Some(SecondaryState {
            partitions: partitions.into(),
            phase: sp.phase,
            anchor,
            gap_start: gap.start,
            gap_end: gap.end,
        });
        Ok(())
    }

    fn read_from_secondary(&mut self) -> Option<Result<CachedPartition>> {
        let sec = self.secondary.as_mut().expect("secondary in progress");
        let Some((key, data)) = sec.partitions.pop_front() else {
            self.finish_secondary();
            return None;
        };
        self.shared.tracker.on_miss();
        let previous = sec.anchor.clone().map(|key| PreviousEntry { key });
        let phase = sec.phase;
        if sec.anchor.is_some() {
            sec.anchor = Some(Some(key.clone()));
        }
        let shared = Arc::clone(&self.shared);
        let region = shared.tracker.region();
        let populated = shared.populate_section.run(region, || {
            if phase == shared.phase_of(&key) {
                let schema = Arc::clone(&shared.schema.lock());
                shared.populate_at_phase(&schema, &key, data.clone(), phase, previous.as_ref());
                true
            } else {
                shared.tracker.on_mispopulate();
                false
            }
        });
        let data = if populated { shared.read_entry(&key) } else { data };
        Some(Ok(CachedPartition {
            key,
            data: strip_dummies(data),
        }))
    }

    /// End-of-stream from the secondary: if the phase held and the
    /// previous key is known, the cache entry at the gap's upper end
    /// becomes continuous.
    fn finish_secondary(&mut self) {
        let sec = self.secondary.take().expect("secondary in progress");
        let Some(anchor) = sec.anchor else {
            return;
        };
        if sec.phase != self.shared.phase_of_bound(&sec.gap_start) {
            return;
        }
        let target = match &sec.gap_end {
            RingBound::Before(k) => RingKey::Key(k.clone()),
            RingBound::Max => RingKey::Max,
            _ => return,
        };
        let mut idx = self.shared.index.lock();
        if idx.get(&target).is_none() {
            return;
        }
        let extend = match (&anchor, idx.predecessor(&target)) {
            (None, None) => true,
            (Some(prev_key), Some(RingKey::Key(p))) => p == *prev_key,
            _ => false,
        };
        if extend {
            if let Some(e) = idx.get_mut(&target) {
                e.set_continuous(true);
            }
        }
    }

    fn read_from_primary(&mut self) -> Option<Result<CachedPartition>> {
        loop {
            if self.done {
                return None;
            }
            let shared = Arc::clone(&self.shared);
            let region = shared.tracker.region();
            enum Step {
                Yield(DecoratedKey),
                Gap(KeyRange),
                End,
            }
            let step = shared.read_section.run(region, || {
                let mut not_moved = self.primary.refresh();
                if self.advance_primary && not_moved {
                    self.primary.next();
                    not_moved = false;
                }
                self.advance_primary = false;

                if not_moved || self.primary.entry().continuous {
                    if !self.primary.in_range() {
                        return Step::End;
                    }
                    let key = self
                        .primary
                        .entry()
                        .key
                        .clone()
                        .expect("in-range entries have keys");
                    self.lower_bound = Some(RingBound::After(key.clone()));
                    self.advance_primary = true;
                    Step::Yield(key)
                } else if self.primary.in_range() {
                    let key = self
                        .primary
                        .entry()
                        .key
                        .clone()
                        .expect("in-range entries have keys");
                    let start = self
                        .lower_bound
                        .take()
                        .unwrap_or_else(|| self.range.start.clone());
                    let gap = KeyRange {
                        start,
                        end: RingBound::Before(key.clone()),
                    };
                    self.lower_bound = Some(RingBound::Before(key));
                    Step::Gap(gap)
                } else {
                    let bound = self
                        .lower_bound
                        .take()
                        .unwrap_or_else(|| self.range.start.clone());
                    match self.range.trim_front(bound) {
                        Some(rest) => {
                            self.lower_bound = Some(RingBound::Max);
                            Step::Gap(rest)
                        }
                        None => Step::End,
                    }
                }
            });
            match step {
                Step::End => {
                    self.done = true;
                    return None;
                }
                Step::Yield(key) => {
                    match self.shared.read_through(&key, None) {
                        Ok(Some(data)) => return Some(Ok(CachedPartition { key, data })),
                        // The partition vanished from the underlying source
                        // and the cache holds nothing authoritative for it.
                        Ok(None) => continue,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
                Step::Gap(gap) => {
                    if let Err(e) = self.start_secondary(gap) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    if let Some(item) = self.read_from_secondary() {
                        return Some(item);
                    }
                    // Empty gap; continue from the next cache entry.
                }
            }
        }
    }
}

impl Iterator for ScanningReader {
    type Item = Result<CachedPartition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.secondary.is_some() {
            if let Some(item) = self.read_from_secondary() {
                return Some(item);
            }
        }
        self.read_from_primary()
    }
}
