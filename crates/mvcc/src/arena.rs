//! Version arena and chain linkage
//!
//! Versions are arena-allocated nodes owned by reference objects: the
//! entry's head reference or a snapshot's reference. A node carries chain
//! links (`prev` = newer, `next` = older) and at most one back-reference
//! slot; the unique-owner bit on the back-reference means "this reference
//! alone is responsible for freeing the whole downstream chain".
//!
//! All linkage state - nodes, entry slots and snapshot slots - lives under
//! one lock, so entry/snapshot back-pointer updates cannot race and no
//! lock-order cycles exist between the two directions.

use crate::snapshot::PartitionSnapshot;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tessera_core::{PartitionData, Phase};

/// Handle of a version node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionId(pub(crate) u32);

/// Handle of a partition entry's slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) u32);

/// Handle of a snapshot's slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backref {
    pub unique_owner: bool,
}

pub(crate) struct VersionNode {
    pub prev: Option<VersionId>,
    pub next: Option<VersionId>,
    pub backref: Option<Backref>,
    pub data: PartitionData,
}

pub(crate) struct SnapshotLink {
    pub id: SnapshotId,
    pub handle: Weak<PartitionSnapshot>,
}

#[derive(Default)]
pub(crate) struct EntryState {
    pub version: Option<VersionId>,
    pub snapshot: Option<SnapshotLink>,
    pub evictable: bool,
}

pub(crate) struct SnapshotState {
    pub version: Option<VersionId>,
    pub entry: Option<EntryId>,
    pub phase: Phase,
}

pub(crate) struct Slots<T> {
    items: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    fn new() -> Self {
        Slots {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.items[slot as usize] = Some(value);
            slot
        } else {
            self.items.push(Some(value));
            (self.items.len() - 1) as u32
        }
    }

    pub fn remove(&mut self, slot: u32) -> T {
        let value = self.items[slot as usize].take().expect("live slot");
        self.free.push(slot);
        value
    }

    pub fn get(&self, slot: u32) -> &T {
        self.items[slot as usize].as_ref().expect("live slot")
    }

    pub fn get_mut(&mut self, slot: u32) -> &mut T {
        self.items[slot as usize].as_mut().expect("live slot")
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.free.len()
    }
}

pub(crate) struct ArenaState {
    pub versions: Slots<VersionNode>,
    pub entries: Slots<EntryState>,
    pub snapshots: Slots<SnapshotState>,
}

/// Shared arena holding every version chain of one allocator domain.
pub struct VersionArena {
    pub(crate) state: Mutex<ArenaState>,
}

impl VersionArena {
    /// Creates an empty arena.
    pub fn new() -> Arc<VersionArena> {
        Arc::new(VersionArena {
            state: Mutex::new(ArenaState {
                versions: Slots::new(),
                entries: Slots::new(),
                snapshots: Slots::new(),
            }),
        })
    }

    /// Number of live version nodes, for tests and diagnostics.
    pub fn version_count(&self) -> usize {
        self.state.lock().versions.len()
    }
}

impl ArenaState {
    pub fn new_version(&mut self, data: PartitionData) -> VersionId {
        VersionId(self.versions.insert(VersionNode {
            prev: None,
            next: None,
            backref: None,
            data,
        }))
    }

    pub fn node(&self, id: VersionId) -> &VersionNode {
        self.versions.get(id.0)
    }

    pub fn node_mut(&mut self, id: VersionId) -> &mut VersionNode {
        self.versions.get_mut(id.0)
    }

    pub fn is_referenced(&self, id: VersionId) -> bool {
        self.node(id).backref.is_some()
    }

    /// True iff the version is directly referenced from a partition entry,
    /// i.e. it is a chain head whose reference is not an owner mark.
    pub fn is_referenced_from_entry(&self, id: VersionId) -> bool {
        let n = self.node(id);
        n.prev.is_none() && matches!(n.backref, Some(b) if !b.unique_owner)
    }

    pub fn set_ref(&mut self, id: VersionId) {
        let n = self.node_mut(id);
        debug_assert!(n.backref.is_none(), "a version has at most one reference");
        n.backref = Some(Backref {
            unique_owner: false,
        });
    }

    pub fn clear_ref(&mut self, id: VersionId) {
        self.node_mut(id).backref = None;
    }

    pub fn mark_unique_owner(&mut self, id: VersionId) {
        if let Some(b) = &mut self.node_mut(id).backref {
            b.unique_owner = true;
        }
    }

    pub fn is_unique_owner(&self, id: VersionId) -> bool {
        matches!(self.node(id).backref, Some(b) if b.unique_owner)
    }

    /// Links `new` into the chain right before (newer than) `before`.
    pub fn insert_before(&mut self, new: VersionId, before: VersionId) {
        let old_prev = self.node(before).prev;
        {
            let n = self.node_mut(new);
            n.prev = old_prev;
            n.next = Some(before);
        }
        self.node_mut(before).prev = Some(new);
        if let Some(p) = old_prev {
            self.node_mut(p).next = Some(new);
        }
    }

    pub fn unlink(&mut self, id: VersionId) {
        let (prev, next) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        if let Some(p) = prev {
            self.node_mut(p).next = next;
        }
        if let Some(n) = next {
            self.node_mut(n).prev = prev;
        }
        let n = self.node_mut(id);
        n.prev = None;
        n.next = None;
    }

    pub fn free_version(&mut self, id: VersionId) -> PartitionData {
        self.unlink(id);
        debug_assert!(self.node(id).backref.is_none());
        let node = self.versions.remove(id.0);
        node.data
    }

    /// The chain from `from` towards older versions, inclusive.
    pub fn chain_from(&self, from: VersionId) -> Vec<VersionId> {
        let mut out = Vec::new();
        let mut cur = Some(from);
        while let Some(id) = cur {
            out.push(id);
            cur = self.node(id).next;
        }
        out
    }

    /// Walks the chain from `current` towards older versions, freeing every
    /// version that is not referenced; the first referenced version's
    /// back-reference is marked unique-owner so its holder continues the
    /// walk on destruction.
    pub fn remove_or_mark_as_unique_owner(
        &mut self,
        mut current: Option<VersionId>,
        tracker: Option<&dyn crate::MvccTracker>,
    ) {
        while let Some(id) = current {
            if self.is_referenced(id) {
                self.mark_unique_owner(id);
                return;
            }
            let next = self.node(id).next;
            if let Some(t) = tracker {
                let rows = self.node(id).data.live_row_count();
                for _ in 0..rows {
                    t.on_row_removed();
                }
            }
            self.free_version(id);
            current = next;
        }
    }
}

impl Default for ArenaState {
    fn default() -> Self {
        ArenaState {
            versions: Slots::new(),
            entries: Slots::new(),
            snapshots: Slots::new(),
        }
    }
}
