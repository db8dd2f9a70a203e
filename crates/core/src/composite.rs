//! Storage-side cell names and the mixed composite/position comparator
//!
//! Persistent tables name cells with composites: a component sequence plus
//! an end-of-component marker. The comparator here defines a total order on
//! the union of composites and clustering positions which is compatible
//! with the storage-side cell-name order, so a range expressed in either
//! form selects the same rows.

use crate::position::{ClusteringPrefix, Position, Weight};
use std::cmp::Ordering;

/// End-of-component marker of a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Eoc {
    /// Marks a bound before all names prefixed by the composite.
    Start = -1,
    /// No marker: an exact cell-name prefix.
    None = 0,
    /// Marks a bound after all names prefixed by the composite.
    End = 1,
}

/// A storage-side cell name: component values with an end-of-component
/// marker, optionally in the static-row prefix space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Composite {
    prefix: ClusteringPrefix,
    eoc: Eoc,
    is_static: bool,
}

impl Composite {
    /// Builds a composite from a prefix and marker.
    pub fn new(prefix: ClusteringPrefix, eoc: Eoc) -> Self {
        Composite {
            prefix,
            eoc,
            is_static: false,
        }
    }

    /// Builds a static-prefix composite.
    pub fn new_static(prefix: ClusteringPrefix, eoc: Eoc) -> Self {
        Composite {
            prefix,
            eoc,
            is_static: true,
        }
    }

    /// The empty composite, which sorts before every position.
    pub fn empty() -> Self {
        Composite::new(ClusteringPrefix::empty(), Eoc::None)
    }

    /// Whether the composite has no components and no static marker.
    pub fn is_empty(&self) -> bool {
        !self.is_static && self.prefix.is_empty() && self.eoc == Eoc::None
    }

    /// Whether the composite addresses the static-row prefix space.
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// The component prefix.
    pub fn prefix(&self) -> &ClusteringPrefix {
        &self.prefix
    }

    /// The end-of-component marker.
    pub fn eoc(&self) -> Eoc {
        self.eoc
    }
}

/// Placement of a prefixed object relative to the set of names sharing its
/// prefix, used as the tail tie-breaker of lexicographic comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
enum Relation {
    BeforeAllPrefixed = -1,
    BeforeAllStrictlyPrefixed = 0,
    AfterAllPrefixed = 1,
}

fn relation_for_position(p: &Position) -> Relation {
    match p.weight() {
        Some(w) if w.as_i8() > 0 => Relation::AfterAllPrefixed,
        _ => Relation::BeforeAllPrefixed,
    }
}

/// Relation of a composite used as a range lower bound.
fn relation_for_lower_bound(c: &Composite) -> Relation {
    match c.eoc() {
        Eoc::Start | Eoc::None => Relation::BeforeAllPrefixed,
        Eoc::End => Relation::AfterAllPrefixed,
    }
}

/// Relation of a composite used as a range upper bound.
fn relation_for_upper_bound(c: &Composite) -> Relation {
    match c.eoc() {
        Eoc::Start => Relation::BeforeAllPrefixed,
        Eoc::None => Relation::BeforeAllStrictlyPrefixed,
        Eoc::End => Relation::AfterAllPrefixed,
    }
}

fn lexicographic(a: &[Vec<u8>], ra: Relation, b: &[Vec<u8>], rb: Relation) -> Ordering {
    let shared = a.len().min(b.len());
    for i in 0..shared {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    match (a.len() == shared, b.len() == shared) {
        (true, true) => ra.cmp(&rb),
        (true, false) => {
            if ra == Relation::AfterAllPrefixed {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, true) => {
            if rb == Relation::AfterAllPrefixed {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, false) => unreachable!("one side must be exhausted"),
    }
}

/// Three-way comparison of two positions in the composite-compatible order.
///
/// This order is compatible with but weaker than [`Position`]'s own order:
/// a row position and the bound just before it compare equal here.
pub fn compare_positions(a: &Position, b: &Position) -> Ordering {
    if a.is_static_row() || b.is_static_row() {
        return (b.is_static_row() as i8).cmp(&(a.is_static_row() as i8));
    }
    lexicographic(
        a.prefix().expect("clustered").components(),
        relation_for_position(a),
        b.prefix().expect("clustered").components(),
        relation_for_position(b),
    )
}

/// Three-way comparison of a position against a composite lower bound.
pub fn compare_position_composite(a: &Position, b: &Composite) -> Ordering {
    if b.is_empty() {
        // A position can never be empty.
        return Ordering::Greater;
    }
    if a.is_static_row() || b.is_static() {
        return (b.is_static() as i8).cmp(&(a.is_static_row() as i8));
    }
    lexicographic(
        a.prefix().expect("clustered").components(),
        relation_for_position(a),
        b.prefix().components(),
        relation_for_lower_bound(b),
    )
}

/// Three-way comparison of a composite against a position.
pub fn compare_composite_position(a: &Composite, b: &Position) -> Ordering {
    compare_position_composite(b, a).reverse()
}

/// Three-way comparison of two composites used as lower bounds.
pub fn compare_composites(a: &Composite, b: &Composite) -> Ordering {
    if a.is_static() != b.is_static() {
        return if a.is_static() {
            Ordering::Less
        } else {
            Ordering::Greater
        };
    }
    lexicographic(
        a.prefix().components(),
        relation_for_lower_bound(a),
        b.prefix().components(),
        relation_for_lower_bound(b),
    )
}

/// Three-way comparison of two composites used as upper bounds.
pub fn compare_upper_bounds(a: &Composite, b: &Composite) -> Ordering {
    lexicographic(
        a.prefix().components(),
        relation_for_upper_bound(a),
        b.prefix().components(),
        relation_for_upper_bound(b),
    )
}

impl From<&Position> for Composite {
    fn from(p: &Position) -> Self {
        match (p.prefix(), p.weight()) {
            (None, _) => Composite::new_static(ClusteringPrefix::empty(), Eoc::Start),
            (Some(prefix), Some(w)) => Composite::new(
                prefix.clone(),
                match w {
                    Weight::Before => Eoc::Start,
                    Weight::At => Eoc::None,
                    Weight::After => Eoc::End,
                },
            ),
            (Some(prefix), None) => Composite::new(prefix.clone(), Eoc::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ck(parts: &[&[u8]]) -> ClusteringPrefix {
        ClusteringPrefix::from_components(parts.iter().map(|p| p.to_vec()))
    }

    #[test]
    fn empty_composite_sorts_below_positions() {
        let p = Position::for_key(ck(&[b"a"]));
        assert_eq!(compare_position_composite(&p, &Composite::empty()), Ordering::Greater);
    }

    #[test]
    fn static_composites_sort_first() {
        let s = Composite::new_static(ck(&[]), Eoc::Start);
        let c = Composite::new(ck(&[b"a"]), Eoc::None);
        assert_eq!(compare_composites(&s, &c), Ordering::Less);
        assert_eq!(
            compare_position_composite(&Position::for_static_row(), &c),
            Ordering::Less
        );
    }

    #[test]
    fn eoc_brackets_prefix_extensions() {
        let long = Position::for_key(ck(&[b"a", b"b"]));
        let start = Composite::new(ck(&[b"a"]), Eoc::Start);
        let end = Composite::new(ck(&[b"a"]), Eoc::End);
        assert_eq!(compare_position_composite(&long, &start), Ordering::Greater);
        assert_eq!(compare_position_composite(&long, &end), Ordering::Less);
    }

    #[test]
    fn weak_order_conflates_row_and_its_lower_bound(){
        let key = ck(&[b"k"]);
        let at = Position::for_key(key.clone());
        let before = Position::before_key(key);
        assert_eq!(compare_positions(&before, &at), Ordering::Equal);
        assert!(at > before);
    }

    #[test]
    fn composite_order_matches_position_order_for_rows() {
        let a = Position::for_key(ck(&[b"a"]));
        let b = Position::for_key(ck(&[b"b"]));
        let ca = Composite::from(&a);
        let cb = Composite::from(&b);
        assert_eq!(compare_positions(&a, &b), Ordering::Less);
        assert_eq!(compare_composites(&ca, &cb), Ordering::Less);
        assert_eq!(compare_position_composite(&a, &cb), Ordering::Less);
        assert_eq!(compare_composite_position(&ca, &b), Ordering::Less);
    }
}
