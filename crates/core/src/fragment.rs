//! Mutation fragment streams
//!
//! The seam between this subsystem and the data sources underneath it. A
//! stream yields a partition-begin event carrying the decorated key and
//! partition tombstone, then static-row, clustering-row and range-tombstone
//! fragments in position order, then partition-end. Positions within a
//! partition are monotonically non-decreasing; a violation is a programming
//! error in the source.

use crate::error::{Error, Result};
use crate::keys::{DecoratedKey, KeyRange};
use crate::partition::PartitionData;
use crate::position::Position;
use crate::row::{Row, RowEntry};
use crate::schema::SchemaRef;
use crate::tombstone::{RangeTombstone, Tombstone};
use crate::Phase;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One fragment of a partition's content.
#[derive(Debug, Clone)]
pub enum MutationFragment {
    /// The static row.
    StaticRow(Row),
    /// One clustering row.
    ClusteringRow(RowEntry),
    /// One range tombstone, positioned at its start bound.
    RangeTombstone(RangeTombstone),
}

impl MutationFragment {
    /// The fragment's position within the partition.
    pub fn position(&self) -> Position {
        match self {
            MutationFragment::StaticRow(_) => Position::for_static_row(),
            MutationFragment::ClusteringRow(e) => e.position.clone(),
            MutationFragment::RangeTombstone(rt) => rt.start.clone(),
        }
    }
}

/// One event of a mutation stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Start of a partition.
    PartitionStart {
        /// The partition's decorated key.
        key: DecoratedKey,
        /// The partition tombstone.
        tombstone: Tombstone,
    },
    /// A fragment of the current partition.
    Fragment(MutationFragment),
    /// End of the current partition.
    PartitionEnd,
}

/// Priority class of a read, passed through to the backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Priority(pub u8);

/// Forwarding mode of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Forwarding {
    /// The stream yields the whole range in order.
    #[default]
    No,
    /// The consumer fast-forwards explicitly.
    Yes,
}

/// Options a reader passes to a mutation source.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Priority class of the read.
    pub priority: Priority,
    /// Whether to emit trace events for this read.
    pub trace: bool,
    /// Forwarding within a partition.
    pub forwarding: Forwarding,
    /// Forwarding across partitions.
    pub partition_forwarding: Forwarding,
}

/// A pull-based stream of mutation events.
pub trait MutationStream: Send {
    /// The next event, or `None` at end of stream.
    fn next_event(&mut self) -> Result<Option<StreamEvent>>;
}

/// A source of mutation fragment streams, e.g. the union of sstables under
/// the cache.
pub trait MutationSource: Send + Sync {
    /// Opens a stream over the partitions in `range`.
    fn read(&self, schema: SchemaRef, range: &KeyRange, options: ReadOptions)
        -> Box<dyn MutationStream>;
}

/// Hands out consistent snapshots of an underlying mutation source.
pub trait SnapshotSource: Send + Sync {
    /// A new snapshot reflecting everything written so far.
    fn snapshot(&self) -> Arc<dyn MutationSource>;
}

/// Rebuilds partitions from a stream, validating the ordering contract.
#[derive(Debug, Default)]
pub struct PartitionAssembler {
    current: Option<(DecoratedKey, PartitionData)>,
    last_position: Option<Position>,
}

impl PartitionAssembler {
    /// Creates an assembler.
    pub fn new() -> Self {
        PartitionAssembler::default()
    }

    /// Feeds one event. Returns an assembled partition on `PartitionEnd`.
    pub fn feed(&mut self, event: StreamEvent) -> Result<Option<(DecoratedKey, PartitionData)>> {
        match event {
            StreamEvent::PartitionStart { key, tombstone } => {
                if self.current.is_some() {
                    return Err(Error::corruption("partition-start inside open partition"));
                }
                let mut data = PartitionData::new();
                data.apply_tombstone(tombstone);
                self.current = Some((key, data));
                self.last_position = None;
                Ok(None)
            }
            StreamEvent::Fragment(fragment) => {
                let pos = fragment.position();
                if let Some(last) = &self.last_position {
                    // Fragment positions never move backwards.
                    debug_assert!(*last <= pos, "out-of-order fragment");
                    if *last > pos {
                        return Err(Error::corruption("out-of-order fragment"));
                    }
                }
                self.last_position = Some(pos);
                let (_, data) = self
                    .current
                    .as_mut()
                    .ok_or_else(|| Error::corruption("fragment outside partition"))?;
                match fragment {
                    MutationFragment::StaticRow(row) => {
                        data.static_row_mut().apply(row);
                    }
                    MutationFragment::ClusteringRow(entry) => {
                        data.apply_row(entry);
                    }
                    MutationFragment::RangeTombstone(rt) => {
                        data.row_tombstones_mut().apply(rt);
                    }
                }
                Ok(None)
            }
            StreamEvent::PartitionEnd => {
                self.last_position = None;
                self.current
                    .take()
                    .map(Some)
                    .ok_or_else(|| Error::corruption("partition-end without start"))
            }
        }
    }

    /// Drains a whole stream into `(key, partition)` pairs.
    pub fn assemble_all(
        stream: &mut dyn MutationStream,
    ) -> Result<Vec<(DecoratedKey, PartitionData)>> {
        let mut assembler = PartitionAssembler::new();
        let mut out = Vec::new();
        while let Some(event) = stream.next_event()? {
            if let Some(done) = assembler.feed(event)? {
                out.push(done);
            }
        }
        if assembler.current.is_some() {
            return Err(Error::corruption("stream ended mid-partition"));
        }
        Ok(out)
    }
}

/// Decomposes a partition into the canonical event sequence.
pub fn partition_events(key: &DecoratedKey, data: &PartitionData) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    events.push(StreamEvent::PartitionStart {
        key: key.clone(),
        tombstone: data.partition_tombstone(),
    });
    if !data.static_row().is_empty() {
        events.push(StreamEvent::Fragment(MutationFragment::StaticRow(
            data.static_row().clone(),
        )));
    }
    // Interleave rows and range tombstones in position order.
    let mut rows = data.rows().values().filter(|e| !e.dummy).peekable();
    let mut tombs = data.row_tombstones().iter().peekable();
    loop {
        let take_row = match (rows.peek(), tombs.peek()) {
            (Some(r), Some(t)) => r.position <= t.start,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_row {
            let e = rows.next().expect("peeked");
            events.push(StreamEvent::Fragment(MutationFragment::ClusteringRow(
                e.clone(),
            )));
        } else {
            let t = tombs.next().expect("peeked");
            events.push(StreamEvent::Fragment(MutationFragment::RangeTombstone(
                t.clone(),
            )));
        }
    }
    events.push(StreamEvent::PartitionEnd);
    events
}

/// An in-memory mutation source over a fixed set of partitions.
///
/// Used by tests and as the simplest snapshot source: `snapshot()` clones
/// the current content, so later writes to the source are invisible to
/// earlier snapshots.
#[derive(Debug, Default)]
pub struct MemoryMutationSource {
    partitions: parking_lot::Mutex<BTreeMap<DecoratedKey, PartitionData>>,
}

impl MemoryMutationSource {
    /// An empty source.
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryMutationSource::default())
    }

    /// Inserts or merges a partition.
    pub fn put(&self, key: DecoratedKey, mut data: PartitionData) {
        let mut guard = self.partitions.lock();
        match guard.entry(key) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(data);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                e.get_mut().apply_monotonically(&mut data, None);
            }
        }
    }

    /// Removes a partition.
    pub fn remove(&self, key: &DecoratedKey) {
        self.partitions.lock().remove(key);
    }

    /// Number of partitions held.
    pub fn len(&self) -> usize {
        self.partitions.lock().len()
    }

    /// Whether the source holds nothing.
    pub fn is_empty(&self) -> bool {
        self.partitions.lock().is_empty()
    }

    fn frozen(&self) -> BTreeMap<DecoratedKey, PartitionData> {
        self.partitions.lock().clone()
    }
}

struct MemoryStream {
    events: std::vec::IntoIter<StreamEvent>,
}

impl MutationStream for MemoryStream {
    fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        Ok(self.events.next())
    }
}

impl MutationSource for MemoryMutationSource {
    fn read(
        &self,
        _schema: SchemaRef,
        range: &KeyRange,
        _options: ReadOptions,
    ) -> Box<dyn MutationStream> {
        let mut events = Vec::new();
        for (key, data) in self.frozen() {
            if range.contains(&key) {
                events.extend(partition_events(&key, &data));
            }
        }
        Box::new(MemoryStream {
            events: events.into_iter(),
        })
    }
}

/// A frozen snapshot of a [`MemoryMutationSource`].
pub struct FrozenMemorySource {
    partitions: BTreeMap<DecoratedKey, PartitionData>,
}

impl MutationSource for FrozenMemorySource {
    fn read(
        &self,
        _schema: SchemaRef,
        range: &KeyRange,
        _options: ReadOptions,
    ) -> Box<dyn MutationStream> {
        let mut events = Vec::new();
        for (key, data) in &self.partitions {
            if range.contains(key) {
                events.extend(partition_events(key, data));
            }
        }
        Box::new(MemoryStream {
            events: events.into_iter(),
        })
    }
}

impl SnapshotSource for MemoryMutationSource {
    fn snapshot(&self) -> Arc<dyn MutationSource> {
        Arc::new(FrozenMemorySource {
            partitions: self.frozen(),
        })
    }
}

/// The `(source, phase)` pair a populating read runs against.
#[derive(Clone)]
pub struct SnapshotAndPhase {
    /// The snapshot to read from.
    pub source: Arc<dyn MutationSource>,
    /// The phase the snapshot belongs to.
    pub phase: Phase,
}
