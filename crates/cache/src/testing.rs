//! Test support
//!
//! In-memory page sources and small builders shared by unit tests,
//! integration tests and benchmarks.

use crate::cached_file::PageSource;
use crate::index::IndexBlock;
use tessera_core::position::{ClusteringPrefix, Position};
use tessera_core::Tombstone;

/// A page source over an in-memory byte vector.
pub struct MemoryPageSource {
    data: Vec<u8>,
}

impl MemoryPageSource {
    /// Wraps the given bytes.
    pub fn new(data: Vec<u8>) -> MemoryPageSource {
        MemoryPageSource { data }
    }

    /// Length of the backing bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the backing bytes are empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PageSource for MemoryPageSource {
    fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

/// Builds a fully-loaded index block for encoding.
pub fn index_block(
    index: u32,
    start: Position,
    end: Position,
    data_file_offset: u64,
    width: u64,
    end_open_marker: Option<Tombstone>,
) -> IndexBlock {
    IndexBlock {
        index,
        offset: 0,
        start: Some(start),
        end: Some(end),
        end_open_marker,
        data_file_offset,
        width,
    }
}

/// A single-component row position from an integer, zero-padded so the
/// bytewise order matches the numeric order.
pub fn row_position(n: u64) -> Position {
    Position::for_key(ClusteringPrefix::from_components([format!("{n:012}")
        .into_bytes()]))
}
