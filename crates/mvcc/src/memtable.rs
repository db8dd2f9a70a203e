//! The in-memory write buffer
//!
//! An ordered collection of `(decorated key, partition entry)` over its own
//! region. Writers apply mutations; flush hands the whole memtable to the
//! row cache, which drains it in key order while merging its region.

use crate::arena::VersionArena;
use crate::entry::PartitionEntry;
use crate::snapshot::PartitionSnapshot;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::schema::SchemaRef;
use tessera_core::{DecoratedKey, Mutation, PartitionData, Region, Result, DEFAULT_PHASE};

/// An ordered write buffer of partition entries.
pub struct Memtable {
    schema: SchemaRef,
    region: Arc<Region>,
    arena: Arc<VersionArena>,
    partitions: Mutex<BTreeMap<DecoratedKey, PartitionEntry>>,
}

impl Memtable {
    /// Creates an empty memtable over the given arena and its own region.
    pub fn new(schema: SchemaRef, arena: &Arc<VersionArena>) -> Memtable {
        Memtable {
            schema,
            region: Region::new(),
            arena: Arc::clone(arena),
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    /// The memtable's schema.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// The memtable's region.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// The arena holding the memtable's version chains.
    pub fn arena(&self) -> &Arc<VersionArena> {
        &self.arena
    }

    /// Applies a mutation to the partition it addresses.
    pub fn apply(&self, mutation: Mutation) -> Result<()> {
        self.region.charge(mutation.partition.memory_usage());
        let mut partitions = self.partitions.lock();
        let entry = partitions
            .entry(mutation.key.clone())
            .or_insert_with(|| PartitionEntry::new(&self.arena, PartitionData::new()));
        entry.apply(
            &self.region,
            &self.schema,
            mutation.partition,
            &mutation.schema,
        )
    }

    /// A snapshot of the partition at `key`, if present.
    pub fn read(&self, key: &DecoratedKey) -> Option<Arc<PartitionSnapshot>> {
        let partitions = self.partitions.lock();
        partitions
            .get(key)
            .map(|e| e.read(&self.region, &self.schema, None, DEFAULT_PHASE))
    }

    /// The squashed value of the partition at `key`, if present.
    pub fn squashed(&self, key: &DecoratedKey) -> Option<PartitionData> {
        let partitions = self.partitions.lock();
        partitions.get(key).map(|e| e.squashed(&self.schema, &self.schema))
    }

    /// Number of partitions buffered.
    pub fn len(&self) -> usize {
        self.partitions.lock().len()
    }

    /// Whether the memtable holds nothing.
    pub fn is_empty(&self) -> bool {
        self.partitions.lock().is_empty()
    }

    /// The smallest buffered key.
    pub fn first_key(&self) -> Option<DecoratedKey> {
        self.partitions.lock().keys().next().cloned()
    }

    /// Removes and returns the entry with the smallest key.
    pub fn pop_first(&self) -> Option<(DecoratedKey, PartitionEntry)> {
        let mut partitions = self.partitions.lock();
        let key = partitions.keys().next().cloned()?;
        let entry = partitions.remove(&key).expect("key exists");
        Some((key, entry))
    }

    /// Marks the memtable as detached from its region group; writes are
    /// over and the cache may absorb the region.
    pub fn mark_detached(&self) {
        tracing::debug!(partitions = self.len(), "memtable detached for cache update");
    }
}
