//! Tessera - in-memory partition storage for a wide-column store
//!
//! This facade crate re-exports the workspace's public surface:
//!
//! - `tessera-core`: keys, clustering positions, tombstones, rows,
//!   partition data, mutation streams, schemas, regions.
//! - `tessera-mvcc`: partition entries, snapshots, the version arena, the
//!   mutation cleaner and the memtable.
//! - `tessera-cache`: the cache tracker and LRU, the row cache with its
//!   readers, the page cache and the promoted-index cursor.

#![warn(missing_docs)]

pub use tessera_core::{
    composite, config, error, fragment, keys, partition, position, region, row, schema, tombstone,
};
pub use tessera_core::{
    AllocatingSection, CacheConfig, Cell, ClusteringPrefix, ColumnDef, ColumnId, ColumnKind,
    Composite, DecoratedKey, Eoc, Error, KeyRange, LargeDataThresholds, MemoryMutationSource,
    Mutation, MutationFragment, MutationSource, MutationStream, Occupancy, PartitionAssembler,
    PartitionData, Phase, Position, PositionRange, RangeTombstone, RangeTombstoneList,
    ReadOptions, ReclaimResult, Region, Result, RingBound, RingKey, Row, RowEntry, RowMarker,
    Schema, SchemaRef, SchemaVersion, SnapshotSource, StreamEvent, Timestamp, Tombstone, Weight,
    DEFAULT_PHASE, MAX_PHASE,
};

pub use tessera_mvcc::{
    ApplyStats, ChangeMark, Memtable, MutationCleaner, MvccTracker, PartitionEntry,
    PartitionSnapshot, VersionArena, VersionId,
};

pub use tessera_cache::{
    BsearchCursor, CacheMode, CacheStats, CacheTracker, CachedFile, CachedPartition,
    CachedPromotedIndex, CursorEntry, EntryInfo, EntryTag, FileMetrics, FileMetricsSnapshot,
    IndexBlock, LargeDataLogger, LargeDataSink, Lru, PageSource, PartitionRangeCursor,
    PresenceCheck, PreviousEntry, RowCache, ScanningReader, SkipInfo, SstableId,
    MAX_CONCURRENT_RECORDINGS, METRICS_GROUP, PAGE_SIZE,
};
