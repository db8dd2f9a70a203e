//! Partition MVCC
//!
//! This crate implements multi-version concurrency control for partitions,
//! assumed to live in arena-managed containers (a memtable or the row
//! cache):
//!
//! - `PartitionEntry`: the main handle to a partition; allows writes and
//!   reads.
//! - Partition versions - each version is a delta against the next one in
//!   an intrusive chain; the partition's logical value is the fold of the
//!   chain from newest to oldest.
//! - `PartitionSnapshot`: a read handle pinning a chain suffix; the data
//!   it sees does not change while it is alive.
//! - `MutationCleaner`: a background worker freeing long chains in
//!   batches.
//!
//! While a writer and a reader meet on the same entry, the writer prepends
//! a new version and the reader keeps the one it started on. When the
//! entry dies first, chain ownership transfers to the snapshot via the
//! unique-owner mark on its version reference.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod cleaner;
pub mod entry;
pub mod memtable;
pub mod snapshot;

pub use arena::{VersionArena, VersionId};
pub use cleaner::MutationCleaner;
pub use entry::{ApplyStats, PartitionEntry};
pub use memtable::Memtable;
pub use snapshot::{ChangeMark, PartitionSnapshot};

/// Hooks the cache tracker implements so MVCC operations can keep LRU and
/// statistics bookkeeping consistent.
pub trait MvccTracker: Send + Sync {
    /// A population target version was prepended to an evictable entry.
    fn on_version_added(&self) {}
    /// A row was freed while destroying versions.
    fn on_row_removed(&self) {}
    /// A memtable row was examined by the cache merge.
    fn on_row_processed_from_memtable(&self) {}
    /// A memtable row was merged into an existing cache row.
    fn on_row_merged_from_memtable(&self) {}
    /// A memtable row fell into an incomplete range and was dropped.
    fn on_row_dropped_from_memtable(&self) {}
}
