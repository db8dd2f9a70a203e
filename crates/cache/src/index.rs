//! Binary-searched cursor over a promoted index
//!
//! A promoted index describes one partition of a persistent table as a
//! sequence of clustering blocks: start and end positions, an optional
//! open-range tombstone active at the block's end, the data-file offset
//! and the block width. A trailing offsets map of little-endian `u32`
//! entries locates each block inside the index region.
//!
//! The cursor binary-searches blocks through the page cache, loading
//! start positions first and full block info only where needed, and
//! invalidates pages below its position as it advances so the resident
//! footprint stays O(log N).

use crate::cached_file::{CacheMode, CachedFile, PageStream};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tessera_core::fragment::Priority;
use tessera_core::position::{ClusteringPrefix, Position, Weight};
use tessera_core::{Error, Result, Tombstone};

/// One promoted-index block. `start` is present after a start-only load;
/// the remaining fields after a full load.
#[derive(Debug, Clone)]
pub struct IndexBlock {
    /// Block sequence number.
    pub index: u32,
    /// Byte offset of the block inside the index region.
    pub offset: u32,
    /// First position covered by the block.
    pub start: Option<Position>,
    /// Last position covered by the block.
    pub end: Option<Position>,
    /// Range tombstone still open at the end of the block, if any.
    pub end_open_marker: Option<Tombstone>,
    /// Offset of the block's first row in the data file.
    pub data_file_offset: u64,
    /// Width of the block in the data file.
    pub width: u64,
}

impl IndexBlock {
    fn new(index: u32, offset: u32) -> IndexBlock {
        IndexBlock {
            index,
            offset,
            start: None,
            end: None,
            end_open_marker: None,
            data_file_offset: 0,
            width: 0,
        }
    }
}

/// Skip information returned when the cursor advances into a new block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipInfo {
    /// Data-file offset to continue reading from.
    pub data_file_offset: u64,
    /// Range tombstone active at that offset.
    pub active_tombstone: Tombstone,
    /// Position at which the tombstone re-enters.
    pub active_tombstone_pos: Position,
}

/// Start, end and data-file offset of one block, for sequential iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// First position of the block.
    pub start: Position,
    /// Last position of the block.
    pub end: Position,
    /// Data-file offset of the block.
    pub data_file_offset: u64,
}

/// Pulls bytes out of a page stream, bridging chunk boundaries.
struct StreamParser<'a> {
    stream: PageStream<'a>,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> StreamParser<'a> {
    fn new(stream: PageStream<'a>) -> StreamParser<'a> {
        StreamParser {
            stream,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            match self.stream.next()? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => return Err(Error::corruption("end of stream while parsing index")),
            }
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn position(&mut self) -> Result<Position> {
        match self.u8()? {
            0 => Ok(Position::for_static_row()),
            1 => {
                let weight = match self.u8()? as i8 {
                    -1 => Weight::Before,
                    0 => Weight::At,
                    1 => Weight::After,
                    w => {
                        return Err(Error::corruption(format!("bad position weight {w}")));
                    }
                };
                let count = self.u16()? as usize;
                let mut components = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = self.u16()? as usize;
                    components.push(self.take(len)?.to_vec());
                }
                let prefix = ClusteringPrefix::from_components(components);
                Ok(match weight {
                    Weight::Before => Position::before_key(prefix),
                    Weight::At => Position::for_key(prefix),
                    Weight::After => Position::after_key(prefix),
                })
            }
            k => Err(Error::corruption(format!("bad position kind {k}"))),
        }
    }
}

/// A read-through cache of promoted index blocks. Single user; methods
/// must not be invoked concurrently.
pub struct CachedPromotedIndex {
    blocks_count: u32,
    file: CachedFile,
    blocks: Mutex<BTreeMap<u32, IndexBlock>>,
}

impl CachedPromotedIndex {
    /// Creates the block cache over an index region with `blocks_count`
    /// blocks.
    pub fn new(file: CachedFile, blocks_count: u32) -> CachedPromotedIndex {
        CachedPromotedIndex {
            blocks_count,
            file,
            blocks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of blocks in the index.
    pub fn blocks_count(&self) -> u32 {
        self.blocks_count
    }

    /// The underlying page cache.
    pub fn file(&self) -> &CachedFile {
        &self.file
    }

    /// Offset of the offsets-map entry for block `idx`, relative to the
    /// start of the index region.
    fn offset_entry_pos(&self, idx: u32) -> u64 {
        self.file.size() - u64::from(self.blocks_count - idx) * 4
    }

    fn read_block_offset(&self, idx: u32, mode: CacheMode) -> Result<u32> {
        let stream = self.file.read(self.offset_entry_pos(idx), Priority::default(), mode);
        StreamParser::new(stream).u32()
    }

    fn block_with_offset(&self, idx: u32, mode: CacheMode) -> Result<IndexBlock> {
        debug_assert!(idx < self.blocks_count);
        let mut blocks = self.blocks.lock();
        if let Some(b) = blocks.get(&idx) {
            return Ok(b.clone());
        }
        drop(blocks);
        let offset = self.read_block_offset(idx, mode)?;
        let block = IndexBlock::new(idx, offset);
        blocks = self.blocks.lock();
        blocks.insert(idx, block.clone());
        Ok(block)
    }

    /// A block with at least `index`, `offset` and `start` valid.
    pub fn get_block_with_start(&self, idx: u32) -> Result<IndexBlock> {
        let block = self.block_with_offset(idx, CacheMode::ReadThrough)?;
        if block.start.is_some() {
            return Ok(block);
        }
        let stream = self
            .file
            .read(u64::from(block.offset), Priority::default(), CacheMode::ReadThrough);
        let start = StreamParser::new(stream).position()?;
        let mut blocks = self.blocks.lock();
        let slot = blocks.get_mut(&idx).expect("just inserted");
        slot.start = Some(start);
        Ok(slot.clone())
    }

    /// A block with every field valid.
    pub fn get_block(&self, idx: u32, mode: CacheMode) -> Result<IndexBlock> {
        let block = self.block_with_offset(idx, mode)?;
        if block.end.is_some() {
            return Ok(block);
        }
        let stream = self.file.read(u64::from(block.offset), Priority::default(), mode);
        let mut parser = StreamParser::new(stream);
        let start = parser.position()?;
        let end = parser.position()?;
        let flags = parser.u8()?;
        let end_open_marker = if flags & 1 != 0 {
            let timestamp = parser.i64()?;
            let deletion_time = parser.i64()?;
            Some(Tombstone::new(timestamp, deletion_time))
        } else {
            None
        };
        let data_file_offset = parser.u64()?;
        let width = parser.u64()?;
        let mut blocks = self.blocks.lock();
        let slot = blocks.get_mut(&idx).expect("just inserted");
        slot.start = Some(start);
        slot.end = Some(end);
        slot.end_open_marker = end_open_marker;
        slot.data_file_offset = data_file_offset;
        slot.width = width;
        Ok(slot.clone())
    }

    /// Best-effort upper bound for `pos` derived from resident data only.
    /// Returns `None` when unknown; the caller should then use the end of
    /// the partition.
    pub fn upper_bound_cache_only(&self, pos: &Position) -> Result<Option<u64>> {
        let candidate = {
            let blocks = self.blocks.lock();
            blocks
                .values()
                .filter(|b| b.start.as_ref().is_some_and(|s| pos < s))
                .min_by_key(|b| b.index)
                .map(|b| (b.index, b.end.is_some(), b.data_file_offset))
        };
        let Some((idx, loaded, offset)) = candidate else {
            return Ok(None);
        };
        if loaded {
            return Ok(Some(offset));
        }
        match self.get_block(idx, CacheMode::CacheOnly) {
            Ok(b) => Ok(Some(b.data_file_offset)),
            Err(Error::NotCached) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drops cached pages and parsed blocks with smaller indexes than the
    /// given block, bounding memory as the cursor moves forward.
    pub fn invalidate_prior(&self, block: &IndexBlock) {
        self.file.invalidate_at_most_front(u64::from(block.offset));
        self.file.invalidate_at_most(
            self.offset_entry_pos(0),
            self.offset_entry_pos(block.index),
        );
        let mut blocks = self.blocks.lock();
        *blocks = blocks.split_off(&block.index);
    }
}

/// Cursor doing binary search over promoted-index blocks.
///
/// Worst-case cost per advance: O(log N) comparisons and O(log N) page
/// reads, with resident memory bounded likewise.
pub struct BsearchCursor {
    index: CachedPromotedIndex,
    blocks_count: u32,
    // Points to the first block whose start is strictly greater than the
    // cursor's position.
    current_idx: u32,
    current_pos: Option<Position>,
}

impl BsearchCursor {
    /// Creates a cursor over the given block cache.
    pub fn new(index: CachedPromotedIndex) -> BsearchCursor {
        let blocks_count = index.blocks_count();
        BsearchCursor {
            index,
            blocks_count,
            current_idx: 0,
            current_pos: None,
        }
    }

    /// The block cache backing this cursor.
    pub fn promoted_index(&self) -> &CachedPromotedIndex {
        &self.index
    }

    fn advance_to_upper_bound(&mut self, pos: &Position) -> Result<()> {
        let mut upper_idx = self.blocks_count;
        while self.current_idx < upper_idx {
            let mid = self.current_idx + (upper_idx - self.current_idx) / 2;
            let block = self.index.get_block_with_start(mid)?;
            let start = block.start.as_ref().expect("loaded with start");
            if pos < start {
                self.current_pos = Some(start.clone());
                upper_idx = mid;
            } else {
                self.current_idx = mid + 1;
            }
        }
        if self.current_idx == self.blocks_count {
            self.current_pos = Some(Position::after_all_clustered_rows());
        }
        Ok(())
    }

    /// Advances the cursor to the given position.
    ///
    /// Returns `None` while still inside the first block (the caller must
    /// scan from the partition start); otherwise skip information: the
    /// data-file offset of the block before the cursor, and the open-range
    /// tombstone carried at the end of the block before that, so the
    /// reader re-enters an active range deletion correctly.
    pub fn advance_to(&mut self, pos: &Position) -> Result<Option<SkipInfo>> {
        if let Some(current) = &self.current_pos {
            if pos < current {
                return Ok(None);
            }
            self.current_idx += 1;
        }
        self.advance_to_upper_bound(pos)?;
        if self.current_idx == 0 {
            return Ok(None);
        }
        let block = self.index.get_block(self.current_idx - 1, CacheMode::ReadThrough)?;
        let data_file_offset = block.data_file_offset;
        if self.current_idx < 2 {
            return Ok(Some(SkipInfo {
                data_file_offset,
                active_tombstone: Tombstone::NONE,
                active_tombstone_pos: Position::before_all_clustered_rows(),
            }));
        }
        let prev = self.index.get_block(self.current_idx - 2, CacheMode::ReadThrough)?;
        self.index.invalidate_prior(&prev);
        match prev.end_open_marker {
            None => Ok(Some(SkipInfo {
                data_file_offset,
                active_tombstone: Tombstone::NONE,
                active_tombstone_pos: Position::before_all_clustered_rows(),
            })),
            Some(tomb) => Ok(Some(SkipInfo {
                data_file_offset,
                active_tombstone: tomb,
                active_tombstone_pos: prev.end.clone().expect("fully loaded"),
            })),
        }
    }

    /// Best-effort upper bound with no I/O, from resident pages only.
    pub fn probe_upper_bound(&self, pos: &Position) -> Result<Option<u64>> {
        self.index.upper_bound_cache_only(pos)
    }

    /// Sequential iteration over blocks.
    pub fn next_entry(&mut self) -> Result<Option<EntryInfo>> {
        if self.current_idx == self.blocks_count {
            return Ok(None);
        }
        let block = self.index.get_block(self.current_idx, CacheMode::ReadThrough)?;
        self.current_idx += 1;
        Ok(Some(EntryInfo {
            start: block.start.clone().expect("fully loaded"),
            end: block.end.clone().expect("fully loaded"),
            data_file_offset: block.data_file_offset,
        }))
    }
}

/// Serializes promoted-index blocks into the on-disk region layout, for
/// tests and tools.
pub fn encode_promoted_index(blocks: &[IndexBlock]) -> Vec<u8> {
    fn put_position(out: &mut Vec<u8>, pos: &Position) {
        match pos.prefix() {
            None => out.push(0),
            Some(prefix) => {
                out.push(1);
                let weight = pos.weight().expect("clustered").as_i8();
                out.push(weight as u8);
                let mut n = [0u8; 2];
                LittleEndian::write_u16(&mut n, prefix.len() as u16);
                out.extend_from_slice(&n);
                for c in prefix.components() {
                    LittleEndian::write_u16(&mut n, c.len() as u16);
                    out.extend_from_slice(&n);
                    out.extend_from_slice(c);
                }
            }
        }
    }

    let mut out = Vec::new();
    let mut offsets = Vec::with_capacity(blocks.len());
    for b in blocks {
        offsets.push(out.len() as u32);
        put_position(&mut out, b.start.as_ref().expect("block start"));
        put_position(&mut out, b.end.as_ref().expect("block end"));
        out.push(u8::from(b.end_open_marker.is_some()));
        if let Some(t) = &b.end_open_marker {
            let mut n = [0u8; 8];
            LittleEndian::write_i64(&mut n, t.timestamp);
            out.extend_from_slice(&n);
            LittleEndian::write_i64(&mut n, t.deletion_time);
            out.extend_from_slice(&n);
        }
        let mut n = [0u8; 8];
        LittleEndian::write_u64(&mut n, b.data_file_offset);
        out.extend_from_slice(&n);
        LittleEndian::write_u64(&mut n, b.width);
        out.extend_from_slice(&n);
    }
    for o in offsets {
        let mut n = [0u8; 4];
        LittleEndian::write_u32(&mut n, o);
        out.extend_from_slice(&n);
    }
    out
}
