//! MVCC scenarios: snapshot stability, chain folding and cleanup.

use std::sync::Arc;
use tessera::{
    Cell, ClusteringPrefix, DecoratedKey, Memtable, Mutation, MutationCleaner, PartitionData,
    PartitionEntry, Position, Region, RowEntry, RowMarker, Schema, SchemaRef, VersionArena,
    DEFAULT_PHASE,
};

fn schema() -> SchemaRef {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Schema::builder("t").regular_column("v").build_shared()
}

fn key(t: u64) -> DecoratedKey {
    DecoratedKey::new(t, t.to_be_bytes().to_vec())
}

fn ck(n: u64) -> Position {
    Position::for_key(ClusteringPrefix::from_components([format!("{n:04}")
        .into_bytes()]))
}

fn row(n: u64, ts: i64, v: &[u8]) -> RowEntry {
    let mut e = RowEntry::new(ck(n));
    e.marker = RowMarker::new(ts);
    e.row.apply_cell(0, Cell::live(ts, v.to_vec()));
    e
}

fn partition_with(rows: &[(u64, i64, &[u8])]) -> PartitionData {
    let mut d = PartitionData::new();
    for (n, ts, v) in rows {
        d.apply_row(row(*n, *ts, v));
    }
    d
}

fn cell_value(data: &PartitionData, n: u64) -> Option<(i64, Vec<u8>)> {
    data.rows().get(&ck(n)).and_then(|e| {
        e.row
            .cell(0)
            .and_then(|c| c.value.clone().map(|v| (c.timestamp, v)))
    })
}

// Write then read through the memtable: a single row comes back verbatim.
#[test]
fn write_then_read_fast_path() {
    let arena = VersionArena::new();
    let s = schema();
    let mt = Memtable::new(Arc::clone(&s), &arena);
    mt.apply(Mutation::new(
        Arc::clone(&s),
        key(1),
        partition_with(&[(10, 1, b"A")]),
    ))
    .unwrap();

    let snap = mt.read(&key(1)).expect("partition present");
    let data = snap.squashed();
    assert_eq!(data.live_row_count(), 1);
    assert_eq!(cell_value(&data, 10), Some((1, b"A".to_vec())));
    assert!(data.partition_tombstone().is_none());
    assert!(data.row_tombstones().is_empty());
}

// A writer prepends a new version; the open snapshot keeps its view.
#[test]
fn writer_beats_reader_reader_sees_old() {
    let arena = VersionArena::new();
    let region = Region::new();
    let s = schema();
    let entry = PartitionEntry::new(&arena, PartitionData::new());
    entry
        .apply(&region, &s, partition_with(&[(10, 1, b"A")]), &s)
        .unwrap();

    let snap = entry.read(&region, &s, None, DEFAULT_PHASE);
    entry
        .apply(&region, &s, partition_with(&[(10, 2, b"B")]), &s)
        .unwrap();

    assert_eq!(cell_value(&snap.squashed(), 10), Some((1, b"A".to_vec())));
    drop(snap);
    let fresh = entry.read(&region, &s, None, DEFAULT_PHASE);
    assert_eq!(cell_value(&fresh.squashed(), 10), Some((2, b"B".to_vec())));
}

// Ten generations of writers and readers; dropping the snapshots in
// reverse order merges the chain back to a single version.
#[test]
fn snapshot_destruction_merges_chain() {
    let arena = VersionArena::new();
    let region = Region::new();
    let s = schema();
    let entry = PartitionEntry::new(&arena, PartitionData::new());
    let values: [&[u8]; 10] = [b"A", b"B", b"C", b"D", b"E", b"F", b"G", b"H", b"I", b"J"];

    let mut snapshots = Vec::new();
    for (i, v) in values.iter().enumerate() {
        entry
            .apply(&region, &s, partition_with(&[(10, i as i64 + 1, v)]), &s)
            .unwrap();
        snapshots.push(entry.read(&region, &s, None, DEFAULT_PHASE));
    }
    assert!(entry.chain_len() > 1);

    while let Some(snap) = snapshots.pop() {
        drop(snap);
    }
    assert_eq!(entry.chain_len(), 1);
    assert_eq!(
        cell_value(&entry.squashed(&s, &s), 10),
        Some((10, b"J".to_vec()))
    );
}

// Snapshot stability: the squashed view of a snapshot is invariant under
// later applies and upgrades to the entry.
#[test]
fn snapshot_stability_under_writes() {
    let arena = VersionArena::new();
    let region = Region::new();
    let s = schema();
    let entry = PartitionEntry::new(&arena, PartitionData::new());
    entry
        .apply(&region, &s, partition_with(&[(1, 1, b"x"), (2, 2, b"y")]), &s)
        .unwrap();

    let snap = entry.read(&region, &s, None, DEFAULT_PHASE);
    let before = snap.squashed();
    entry
        .apply(&region, &s, partition_with(&[(1, 5, b"z"), (3, 6, b"w")]), &s)
        .unwrap();
    assert_eq!(snap.squashed(), before);

    let s2 = Arc::new(s.evolve_with_column("w"));
    entry.upgrade(&s, &s2, None);
    assert_eq!(snap.squashed(), before);
}

// Chain-fold equality: squashing the chain equals applying the same
// mutations to a single fully-merged partition.
#[test]
fn chain_fold_equals_flat_apply() {
    let arena = VersionArena::new();
    let region = Region::new();
    let s = schema();
    let entry = PartitionEntry::new(&arena, PartitionData::new());
    let mutations = [
        partition_with(&[(1, 1, b"a"), (2, 1, b"b")]),
        partition_with(&[(2, 3, b"c")]),
        partition_with(&[(3, 2, b"d"), (1, 4, b"e")]),
    ];

    let mut flat = PartitionData::new();
    let mut pinned = Vec::new();
    for m in &mutations {
        // Pin a snapshot before each apply so the chain keeps growing.
        pinned.push(entry.read(&region, &s, None, DEFAULT_PHASE));
        entry.apply(&region, &s, m.clone(), &s).unwrap();
        let mut m = m.clone();
        flat.apply_monotonically(&mut m, None);
    }
    assert!(entry.chain_len() > 1);
    assert_eq!(entry.squashed(&s, &s), flat);
    drop(pinned);
    assert_eq!(entry.squashed(&s, &s), flat);
}

// Apply monotonicity: applying m1 then m2 equals applying merge(m1, m2).
#[test]
fn apply_is_associative_in_value() {
    let arena = VersionArena::new();
    let region = Region::new();
    let s = schema();

    let m1 = partition_with(&[(1, 1, b"a"), (2, 5, b"b")]);
    let m2 = partition_with(&[(2, 3, b"c"), (3, 4, b"d")]);

    let split = PartitionEntry::new(&arena, PartitionData::new());
    split.apply(&region, &s, m1.clone(), &s).unwrap();
    split.apply(&region, &s, m2.clone(), &s).unwrap();

    let merged = PartitionEntry::new(&arena, PartitionData::new());
    let mut combined = m1;
    let mut m2 = m2;
    combined.apply_monotonically(&mut m2, None);
    merged.apply(&region, &s, combined, &s).unwrap();

    assert_eq!(split.squashed(&s, &s), merged.squashed(&s, &s));
}

// Cleaner liveness: drain returns once queued versions are destroyed.
#[test]
fn cleaner_drains_to_empty() {
    let arena = VersionArena::new();
    let region = Region::new();
    let s = schema();
    let cleaner = MutationCleaner::new(&arena, &region, None, 16);

    for _ in 0..8 {
        let entry = PartitionEntry::new(&arena, PartitionData::new());
        entry
            .apply(
                &region,
                &s,
                partition_with(&[(1, 1, b"a"), (2, 1, b"b"), (3, 1, b"c")]),
                &s,
            )
            .unwrap();
        let snap = entry.read(&region, &s, None, DEFAULT_PHASE);
        entry
            .apply(&region, &s, partition_with(&[(4, 2, b"d")]), &s)
            .unwrap();
        cleaner.merge_and_destroy(snap);
        drop(entry);
    }
    cleaner.drain();
    assert!(cleaner.is_empty());
}
