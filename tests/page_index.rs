//! Page cache and promoted-index cursor: bounded footprint and skip info.

use tessera::{
    BsearchCursor, CacheMode, CachedFile, CachedPromotedIndex, FileMetrics, Position, Tombstone,
    PAGE_SIZE,
};
use tessera_cache::index::encode_promoted_index;
use tessera_cache::testing::{index_block, row_position, MemoryPageSource};

const BLOCKS: u32 = 200_000;
const ROWS_PER_BLOCK: u64 = 10;
const BLOCK_WIDTH: u64 = 1000;

// Block i covers rows [i*10, i*10+9]; every third block leaves a range
// tombstone open at its end.
fn build_index() -> Vec<u8> {
    let blocks: Vec<_> = (0..BLOCKS)
        .map(|i| {
            let first = u64::from(i) * ROWS_PER_BLOCK;
            let marker = (i % 3 == 0).then(|| Tombstone::new(i64::from(i), 0));
            index_block(
                i,
                row_position(first),
                row_position(first + ROWS_PER_BLOCK - 1),
                u64::from(i) * BLOCK_WIDTH,
                BLOCK_WIDTH,
                marker,
            )
        })
        .collect();
    encode_promoted_index(&blocks)
}

fn cursor_over(bytes: Vec<u8>) -> BsearchCursor {
    let len = bytes.len() as u64;
    let file = CachedFile::new(Box::new(MemoryPageSource::new(bytes)), len, FileMetrics::new());
    BsearchCursor::new(CachedPromotedIndex::new(file, BLOCKS))
}

// Walking a large index keeps the resident page count bounded while the
// returned skip info matches the block layout.
#[test]
fn bounded_footprint_over_large_index() {
    let mut cursor = cursor_over(build_index());
    let mut max_resident = 0;

    // Jump through the index at a coarse stride.
    for step in 1..200u64 {
        let target_row = step * 977; // coarse, deliberately unaligned
        let block = target_row / ROWS_PER_BLOCK;
        let skip = cursor
            .advance_to(&row_position(target_row))
            .unwrap()
            .expect("past the first block");
        assert_eq!(skip.data_file_offset, block * BLOCK_WIDTH);
        if block >= 1 {
            let prior = block - 1;
            if prior % 3 == 0 {
                assert_eq!(skip.active_tombstone, Tombstone::new(prior as i64, 0));
                assert_eq!(
                    skip.active_tombstone_pos,
                    row_position(prior * ROWS_PER_BLOCK + ROWS_PER_BLOCK - 1)
                );
            } else {
                assert!(skip.active_tombstone.is_none());
                assert_eq!(
                    skip.active_tombstone_pos,
                    Position::before_all_clustered_rows()
                );
            }
        }
        let resident = cursor.promoted_index().file().cached_pages();
        max_resident = max_resident.max(resident);
    }
    // O(log N) pages per bisection, not O(N).
    assert!(
        max_resident <= 100,
        "resident pages grew to {max_resident}"
    );
    let total_pages = cursor.promoted_index().file().size() / PAGE_SIZE;
    assert!(u64::try_from(max_resident).unwrap() * 20 < total_pages);
}

// Positions inside the block the cursor already covers return no skip
// info; the caller keeps scanning.
#[test]
fn advance_within_current_block_is_noop() {
    let mut cursor = cursor_over(build_index());
    let skip = cursor.advance_to(&row_position(55)).unwrap();
    assert!(skip.is_some());
    // Still below the upper bound of the bisection: nothing to skip.
    assert!(cursor.advance_to(&row_position(56)).unwrap().is_none());
}

// Before the first block's start there is nothing to skip to; the caller
// scans from the partition start.
#[test]
fn before_first_block_yields_no_skip() {
    let mut cursor = cursor_over(build_index());
    assert!(cursor
        .advance_to(&Position::before_all_clustered_rows())
        .unwrap()
        .is_none());
    // Inside the first block the skip degenerates to its own offset.
    let skip = cursor.advance_to(&row_position(3)).unwrap().unwrap();
    assert_eq!(skip.data_file_offset, 0);
    assert!(skip.active_tombstone.is_none());
}

// probe_upper_bound answers only from resident pages.
#[test]
fn probe_upper_bound_is_cache_only() {
    let mut cursor = cursor_over(build_index());
    // Nothing resident yet.
    assert_eq!(cursor.probe_upper_bound(&row_position(0)).unwrap(), None);
    cursor.advance_to(&row_position(100_000)).unwrap();
    // The bisection has materialized blocks above the position.
    let probe = cursor.probe_upper_bound(&row_position(100_000)).unwrap();
    if let Some(offset) = probe {
        assert!(offset > 100_000 / ROWS_PER_BLOCK * BLOCK_WIDTH);
    }
}

// Sequential iteration visits blocks in order with full info.
#[test]
fn next_entry_iterates_blocks() {
    let blocks: Vec<_> = (0..4u32)
        .map(|i| {
            let first = u64::from(i) * ROWS_PER_BLOCK;
            index_block(
                i,
                row_position(first),
                row_position(first + ROWS_PER_BLOCK - 1),
                u64::from(i) * BLOCK_WIDTH,
                BLOCK_WIDTH,
                None,
            )
        })
        .collect();
    let bytes = encode_promoted_index(&blocks);
    let len = bytes.len() as u64;
    let file = CachedFile::new(Box::new(MemoryPageSource::new(bytes)), len, FileMetrics::new());
    let mut cursor = BsearchCursor::new(CachedPromotedIndex::new(file, 4));

    let mut offsets = Vec::new();
    while let Some(entry) = cursor.next_entry().unwrap() {
        assert_eq!(entry.end, row_position(offsets.len() as u64 * 10 + 9));
        offsets.push(entry.data_file_offset);
    }
    assert_eq!(offsets, vec![0, 1000, 2000, 3000]);
}

// Cache-only reads surface NotCached instead of touching the source.
#[test]
fn cache_only_block_load_fails_cleanly() {
    let bytes = build_index();
    let len = bytes.len() as u64;
    let file = CachedFile::new(Box::new(MemoryPageSource::new(bytes)), len, FileMetrics::new());
    let index = CachedPromotedIndex::new(file, BLOCKS);
    assert!(matches!(
        index.get_block(17, CacheMode::CacheOnly),
        Err(tessera::Error::NotCached)
    ));
}
