//! Core types for the tessera partition store
//!
//! This crate defines the foundational types shared by the MVCC and cache
//! layers:
//! - Keys: DecoratedKey, RingBound, KeyRange (partition-level ordering)
//! - Position algebra: clustering positions, bounds and composites
//! - Tombstones: point and range deletions with a non-overlapping range list
//! - Rows: cells, markers and row entries with continuity flags
//! - PartitionData: the per-partition value an MVCC version holds
//! - Fragments: the mutation stream model consumed and produced at the seams
//! - Schema: column definitions, version ids and the upgrade path
//! - Region: move-capable arena accounting with an eviction hook
//! - Error: the error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composite;
pub mod config;
pub mod error;
pub mod fragment;
pub mod keys;
pub mod partition;
pub mod position;
pub mod region;
pub mod row;
pub mod schema;
pub mod tombstone;

pub use composite::{Composite, Eoc};
pub use config::{CacheConfig, LargeDataThresholds};
pub use error::{Error, Result};
pub use fragment::{
    MemoryMutationSource, MutationFragment, MutationSource, MutationStream, PartitionAssembler,
    ReadOptions, SnapshotSource, StreamEvent,
};
pub use keys::{DecoratedKey, KeyRange, RingBound, RingKey};
pub use partition::{ApplyOutcome, Mutation, PartitionData};
pub use position::{ClusteringPrefix, Position, PositionRange, Weight};
pub use region::{AllocatingSection, Occupancy, ReclaimResult, Region};
pub use row::{Cell, ColumnId, Row, RowEntry, RowMarker};
pub use schema::{ColumnDef, ColumnKind, Schema, SchemaRef, SchemaVersion};
pub use tombstone::{RangeTombstone, RangeTombstoneList, Tombstone};

/// Logical write timestamp, supplied by the caller. Larger wins.
pub type Timestamp = i64;

/// Phase of the underlying mutation source snapshot a populating read used.
///
/// Snapshots created with the same phase may point to the same version.
pub type Phase = u64;

/// The phase assigned to reads before any update has run.
pub const DEFAULT_PHASE: Phase = 0;

/// Sentinel phase which never equals an attached snapshot's phase, forcing
/// a fresh population target.
pub const MAX_PHASE: Phase = u64::MAX;
