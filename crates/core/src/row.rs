//! Cells, rows and row entries
//!
//! A row is a sparse map from column id to cell. A row entry is a row at a
//! clustering position, together with a marker, an optional row tombstone
//! and two flags: `dummy` (a position-only sentinel carrying no data) and
//! `continuous` (whether the gap preceding the entry is known empty).

use crate::position::Position;
use crate::tombstone::Tombstone;
use crate::Timestamp;
use std::collections::BTreeMap;

/// Identifier of a column within a schema.
pub type ColumnId = u32;

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Write timestamp.
    pub timestamp: Timestamp,
    /// Time-to-live in seconds, if the write was expiring.
    pub ttl: Option<u32>,
    /// Live value bytes, or `None` for a cell tombstone.
    pub value: Option<Vec<u8>>,
}

impl Cell {
    /// A live cell.
    pub fn live(timestamp: Timestamp, value: impl Into<Vec<u8>>) -> Self {
        Cell {
            timestamp,
            ttl: None,
            value: Some(value.into()),
        }
    }

    /// An expiring live cell.
    pub fn live_ttl(timestamp: Timestamp, value: impl Into<Vec<u8>>, ttl: u32) -> Self {
        Cell {
            timestamp,
            ttl: Some(ttl),
            value: Some(value.into()),
        }
    }

    /// A cell tombstone.
    pub fn dead(timestamp: Timestamp) -> Self {
        Cell {
            timestamp,
            ttl: None,
            value: None,
        }
    }

    /// Whether the cell carries a live value.
    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }

    /// Reconciles two cells; the winner is kept.
    ///
    /// Higher timestamp wins. On a timestamp tie a tombstone beats a live
    /// cell, and between live cells the larger value wins so that
    /// reconciliation is deterministic on every replica.
    pub fn apply(&mut self, other: Cell) {
        let keep_other = match other.timestamp.cmp(&self.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match (&self.value, &other.value) {
                (Some(_), None) => true,
                (None, _) => false,
                (Some(a), Some(b)) => b > a,
            },
        };
        if keep_other {
            *self = other;
        }
    }

    fn memory_usage(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0) + std::mem::size_of::<Cell>()
    }
}

/// Liveness marker of a row: the row's own write time, independent of its
/// cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMarker {
    /// Write timestamp; `i64::MIN` means the marker is missing.
    pub timestamp: Timestamp,
    /// Time-to-live in seconds.
    pub ttl: Option<u32>,
}

impl RowMarker {
    /// The missing marker.
    pub const NONE: RowMarker = RowMarker {
        timestamp: i64::MIN,
        ttl: None,
    };

    /// A live marker.
    pub fn new(timestamp: Timestamp) -> Self {
        RowMarker {
            timestamp,
            ttl: None,
        }
    }

    /// Whether the marker is missing.
    pub fn is_missing(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Merges another marker; the newer write wins.
    pub fn apply(&mut self, other: RowMarker) {
        if other.timestamp > self.timestamp {
            *self = other;
        }
    }
}

impl Default for RowMarker {
    fn default() -> Self {
        RowMarker::NONE
    }
}

/// A sparse map of column id to cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: BTreeMap<ColumnId, Cell>,
}

impl Row {
    /// The empty row.
    pub fn new() -> Self {
        Row::default()
    }

    /// Whether the row has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// The cell for a column, if set.
    pub fn cell(&self, column: ColumnId) -> Option<&Cell> {
        self.cells.get(&column)
    }

    /// Sets or reconciles a single cell.
    pub fn apply_cell(&mut self, column: ColumnId, cell: Cell) {
        match self.cells.entry(column) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(cell);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                e.get_mut().apply(cell);
            }
        }
    }

    /// Reconciles every cell of another row into this one.
    pub fn apply(&mut self, other: Row) {
        for (column, cell) in other.cells {
            self.apply_cell(column, cell);
        }
    }

    /// Cells in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&ColumnId, &Cell)> {
        self.cells.iter()
    }

    /// Drops cells whose timestamp is covered by the tombstone.
    pub fn compact(&mut self, tomb: Tombstone) {
        self.cells.retain(|_, c| !tomb.deletes(c.timestamp));
    }

    /// Rebuilds the row with new column ids, dropping unmapped columns.
    pub fn remap(self, map: impl Fn(ColumnId) -> Option<ColumnId>) -> Row {
        let mut out = Row::new();
        for (column, cell) in self.cells {
            if let Some(target) = map(column) {
                out.apply_cell(target, cell);
            }
        }
        out
    }

    /// Estimated heap footprint.
    pub fn memory_usage(&self) -> usize {
        self.cells.values().map(|c| c.memory_usage()).sum()
    }
}

/// A row at a position, with continuity bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    /// The entry's clustering position.
    pub position: Position,
    /// Row liveness marker.
    pub marker: RowMarker,
    /// Row-level deletion.
    pub tombstone: Tombstone,
    /// The cells.
    pub row: Row,
    /// Position-only sentinel carrying no live data.
    pub dummy: bool,
    /// Whether the gap between the previous entry and this one is known
    /// empty.
    pub continuous: bool,
}

impl RowEntry {
    /// A live entry at the given position.
    pub fn new(position: Position) -> Self {
        RowEntry {
            position,
            marker: RowMarker::NONE,
            tombstone: Tombstone::NONE,
            row: Row::new(),
            dummy: false,
            continuous: true,
        }
    }

    /// A dummy sentinel at the given position.
    pub fn dummy(position: Position, continuous: bool) -> Self {
        RowEntry {
            position,
            marker: RowMarker::NONE,
            tombstone: Tombstone::NONE,
            row: Row::new(),
            dummy: true,
            continuous,
        }
    }

    /// Merges the data of another entry at the same position.
    /// Continuity flags are combined by union; dummies dissolve into data.
    pub fn apply(&mut self, other: RowEntry) {
        debug_assert!(self.position == other.position);
        self.marker.apply(other.marker);
        self.tombstone.apply(other.tombstone);
        self.row.apply(other.row);
        self.dummy &= other.dummy;
        self.continuous |= other.continuous;
    }

    /// Merges only the payload (marker, tombstone, cells), leaving the
    /// flags of this entry untouched.
    pub fn apply_data(&mut self, other: RowEntry) {
        debug_assert!(self.position == other.position);
        self.marker.apply(other.marker);
        self.tombstone.apply(other.tombstone);
        self.row.apply(other.row);
        if !other.dummy {
            self.dummy = false;
        }
    }

    /// Whether the entry carries any data.
    pub fn has_data(&self) -> bool {
        !self.marker.is_missing() || !self.tombstone.is_none() || !self.row.is_empty()
    }

    /// Estimated heap footprint.
    pub fn memory_usage(&self) -> usize {
        self.position.memory_usage() + self.row.memory_usage() + std::mem::size_of::<RowEntry>()
    }
}
