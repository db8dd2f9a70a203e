//! Clustering positions and their total order
//!
//! A position in a partition is either the static-row sentinel or a
//! clustering key prefix paired with a weight. The weight places the
//! position before (−1), at (0) or after (+1) all rows sharing the prefix.
//! An empty prefix with weight −1/+1 gives the before-all/after-all
//! clustered-row sentinels.
//!
//! The order must be total and agree with the range-bound semantics used by
//! queries: for identical prefixes −1 < 0 < +1, and a proper prefix sorts
//! before its extensions unless its weight is +1.

use crate::schema::Schema;
use smallvec::SmallVec;
use std::cmp::Ordering;

/// Clustering key component values. Most keys have few components.
pub type Components = SmallVec<[Vec<u8>; 4]>;

/// A (possibly partial) clustering key: a sequence of component values
/// compared bytewise per component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClusteringPrefix {
    components: Components,
}

impl ClusteringPrefix {
    /// The empty prefix.
    pub fn empty() -> Self {
        ClusteringPrefix::default()
    }

    /// Builds a prefix from component values.
    pub fn from_components<I, T>(components: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        ClusteringPrefix {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the prefix has no components.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Component values in order.
    pub fn components(&self) -> &[Vec<u8>] {
        &self.components
    }

    /// Estimated heap footprint, used for region accounting.
    pub fn memory_usage(&self) -> usize {
        self.components.iter().map(|c| c.len()).sum::<usize>()
            + self.components.len() * std::mem::size_of::<Vec<u8>>()
    }
}

/// Before/at/after marker relative to rows sharing a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum Weight {
    /// Before all rows with this prefix.
    Before = -1,
    /// At the row with this exact key.
    At = 0,
    /// After all rows with this prefix.
    After = 1,
}

impl Weight {
    /// The weight as a signed integer.
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Kind {
    Static,
    Clustered { prefix: ClusteringPrefix, weight: Weight },
}

/// A position in a partition: the static row sentinel or a clustering
/// prefix with a weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    kind: Kind,
}

impl Position {
    /// Position of the static row. Sorts strictly before every clustered
    /// position.
    pub fn for_static_row() -> Self {
        Position { kind: Kind::Static }
    }

    /// Position of the row with the given key.
    pub fn for_key(key: ClusteringPrefix) -> Self {
        Position {
            kind: Kind::Clustered {
                prefix: key,
                weight: Weight::At,
            },
        }
    }

    /// Position right after the row with the given key.
    pub fn after_key(key: ClusteringPrefix) -> Self {
        Position {
            kind: Kind::Clustered {
                prefix: key,
                weight: Weight::After,
            },
        }
    }

    /// Position right before the row with the given key.
    pub fn before_key(key: ClusteringPrefix) -> Self {
        Position {
            kind: Kind::Clustered {
                prefix: key,
                weight: Weight::Before,
            },
        }
    }

    /// Before every clustered row.
    pub fn before_all_clustered_rows() -> Self {
        Position::before_key(ClusteringPrefix::empty())
    }

    /// After every clustered row.
    pub fn after_all_clustered_rows() -> Self {
        Position::after_key(ClusteringPrefix::empty())
    }

    /// Whether this is the static-row position.
    pub fn is_static_row(&self) -> bool {
        matches!(self.kind, Kind::Static)
    }

    /// Whether this is a full-row position (weight 0).
    pub fn is_clustering_row(&self) -> bool {
        matches!(
            self.kind,
            Kind::Clustered {
                weight: Weight::At,
                ..
            }
        )
    }

    /// The clustering prefix; `None` for the static row.
    pub fn prefix(&self) -> Option<&ClusteringPrefix> {
        match &self.kind {
            Kind::Static => None,
            Kind::Clustered { prefix, .. } => Some(prefix),
        }
    }

    /// The weight; `None` for the static row.
    pub fn weight(&self) -> Option<Weight> {
        match &self.kind {
            Kind::Static => None,
            Kind::Clustered { weight, .. } => Some(*weight),
        }
    }

    /// True iff every fragment visible for the given schema has a position
    /// at or after this one. The empty prefix with weight −1 counts only for
    /// schemas without static columns; otherwise the static row sorts below.
    pub fn is_before_all_fragments(&self, schema: &Schema) -> bool {
        match &self.kind {
            Kind::Static => true,
            Kind::Clustered { prefix, weight } => {
                !schema.has_static_columns() && *weight == Weight::Before && prefix.is_empty()
            }
        }
    }

    /// True iff this is the after-all-clustered-rows sentinel.
    pub fn is_after_all_clustered_rows(&self, _schema: &Schema) -> bool {
        match &self.kind {
            Kind::Static => false,
            Kind::Clustered { prefix, weight } => prefix.is_empty() && *weight == Weight::After,
        }
    }

    /// Estimated heap footprint.
    pub fn memory_usage(&self) -> usize {
        self.prefix().map(|p| p.memory_usage()).unwrap_or(0)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.kind, &other.kind) {
            (Kind::Static, Kind::Static) => Ordering::Equal,
            (Kind::Static, _) => Ordering::Less,
            (_, Kind::Static) => Ordering::Greater,
            (
                Kind::Clustered {
                    prefix: pa,
                    weight: wa,
                },
                Kind::Clustered {
                    prefix: pb,
                    weight: wb,
                },
            ) => compare_prefixed(pa, *wa, pb, *wb),
        }
    }
}

fn compare_prefixed(pa: &ClusteringPrefix, wa: Weight, pb: &ClusteringPrefix, wb: Weight) -> Ordering {
    let a = pa.components();
    let b = pb.components();
    let shared = a.len().min(b.len());
    for i in 0..shared {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    match a.len().cmp(&b.len()) {
        Ordering::Equal => wa.as_i8().cmp(&wb.as_i8()),
        // The shorter side is a proper prefix of the longer; its weight
        // decides on which side of the extension set it falls.
        Ordering::Less => {
            if wa.as_i8() <= 0 {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        Ordering::Greater => {
            if wb.as_i8() <= 0 {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    }
}

/// True iff no full-row position fits strictly between `a` and `b`.
/// Assumes `a <= b`.
pub fn no_clustering_row_between(a: &Position, b: &Position) -> bool {
    match (a.prefix(), b.prefix()) {
        (Some(pa), Some(pb)) => {
            pa == pb && (a.weight().unwrap().as_i8() >= 0 || b.weight().unwrap().as_i8() <= 0)
        }
        (None, None) => true,
        _ => false,
    }
}

/// A half-open interval of positions: includes every position `p` with
/// `start <= p < end`, and only those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRange {
    start: Position,
    end: Position,
}

impl PositionRange {
    /// Builds `[start, end)`.
    pub fn new(start: Position, end: Position) -> Self {
        PositionRange { start, end }
    }

    /// The static row only.
    pub fn for_static_row() -> Self {
        PositionRange {
            start: Position::for_static_row(),
            end: Position::before_all_clustered_rows(),
        }
    }

    /// Everything in the partition.
    pub fn full() -> Self {
        PositionRange {
            start: Position::for_static_row(),
            end: Position::after_all_clustered_rows(),
        }
    }

    /// All clustered rows.
    pub fn all_clustered_rows() -> Self {
        PositionRange {
            start: Position::before_all_clustered_rows(),
            end: Position::after_all_clustered_rows(),
        }
    }

    /// Range start (inclusive).
    pub fn start(&self) -> &Position {
        &self.start
    }

    /// Range end (exclusive).
    pub fn end(&self) -> &Position {
        &self.end
    }

    /// Whether the range contains the position.
    pub fn contains(&self, pos: &Position) -> bool {
        *pos >= self.start && *pos < self.end
    }

    /// Whether the range overlaps `[start, end)`.
    pub fn overlaps(&self, start: &Position, end: &Position) -> bool {
        !(*end < self.start) && *start < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn ck(parts: &[&[u8]]) -> ClusteringPrefix {
        ClusteringPrefix::from_components(parts.iter().map(|p| p.to_vec()))
    }

    #[test]
    fn static_row_sorts_first() {
        let s = Position::for_static_row();
        assert!(s < Position::before_all_clustered_rows());
        assert!(s < Position::for_key(ck(&[b"a"])));
    }

    #[test]
    fn weights_order_same_prefix() {
        let key = ck(&[b"k"]);
        let before = Position::before_key(key.clone());
        let at = Position::for_key(key.clone());
        let after = Position::after_key(key);
        assert!(before < at);
        assert!(at < after);
    }

    #[test]
    fn prefix_weight_decides_against_extension() {
        let short = ck(&[b"a"]);
        let long = ck(&[b"a", b"b"]);
        assert!(Position::before_key(short.clone()) < Position::for_key(long.clone()));
        assert!(Position::for_key(short.clone()) < Position::for_key(long.clone()));
        assert!(Position::after_key(short) > Position::for_key(long));
    }

    #[test]
    fn sentinels_bracket_everything_clustered() {
        let row = Position::for_key(ck(&[&[0xffu8] as &[u8]]));
        assert!(Position::before_all_clustered_rows() < row);
        assert!(row < Position::after_all_clustered_rows());
    }

    #[test]
    fn before_all_fragments_depends_on_statics() {
        let with_static = Schema::builder("t")
            .static_column("s")
            .regular_column("v")
            .build();
        let without_static = Schema::builder("t").regular_column("v").build();
        let bottom = Position::before_all_clustered_rows();
        assert!(!bottom.is_before_all_fragments(&with_static));
        assert!(bottom.is_before_all_fragments(&without_static));
        assert!(Position::for_static_row().is_before_all_fragments(&with_static));
    }

    #[test]
    fn no_row_between() {
        let key = ck(&[b"k"]);
        let at = Position::for_key(key.clone());
        let after = Position::after_key(key.clone());
        let before = Position::before_key(key.clone());
        assert!(no_clustering_row_between(&before, &at));
        assert!(no_clustering_row_between(&at, &after));
        assert!(no_clustering_row_between(&before, &before));
        let other = Position::for_key(ck(&[b"l"]));
        assert!(!no_clustering_row_between(&at, &other));
        // A row with this exact key fits between before and after.
        assert!(!no_clustering_row_between(&before, &after));
    }

    #[test]
    fn range_contains_half_open() {
        let r = PositionRange::new(
            Position::for_key(ck(&[b"b"])),
            Position::for_key(ck(&[b"d"])),
        );
        assert!(!r.contains(&Position::for_key(ck(&[b"a"]))));
        assert!(r.contains(&Position::for_key(ck(&[b"b"]))));
        assert!(r.contains(&Position::for_key(ck(&[b"c"]))));
        assert!(!r.contains(&Position::for_key(ck(&[b"d"]))));
    }
}
