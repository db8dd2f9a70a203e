//! Ordering properties of positions, composites and tombstone lists.

use proptest::prelude::*;
use std::cmp::Ordering;
use tessera::position::no_clustering_row_between;
use tessera::{ClusteringPrefix, Composite, Position, RangeTombstone, RangeTombstoneList, Tombstone, Weight};
use tessera_core::composite::{
    compare_composite_position, compare_composites, compare_position_composite, compare_positions,
};

fn weight_strategy() -> impl Strategy<Value = Weight> {
    prop_oneof![
        Just(Weight::Before),
        Just(Weight::At),
        Just(Weight::After),
    ]
}

fn prefix_strategy() -> impl Strategy<Value = ClusteringPrefix> {
    proptest::collection::vec(proptest::collection::vec(0u8..4, 0..3), 0..3)
        .prop_map(ClusteringPrefix::from_components)
}

fn position_strategy() -> impl Strategy<Value = Position> {
    prop_oneof![
        1 => Just(Position::for_static_row()),
        8 => (prefix_strategy(), weight_strategy()).prop_map(|(p, w)| match w {
            Weight::Before => Position::before_key(p),
            Weight::At => Position::for_key(p),
            Weight::After => Position::after_key(p),
        }),
    ]
}

proptest! {
    // The position order is total and antisymmetric.
    #[test]
    fn position_order_is_total(a in position_strategy(), b in position_strategy()) {
        let ab = a.cmp(&b);
        let ba = b.cmp(&a);
        prop_assert_eq!(ab, ba.reverse());
        prop_assert_eq!(ab == Ordering::Equal, a == b);
    }

    // Transitivity over triples.
    #[test]
    fn position_order_is_transitive(
        a in position_strategy(),
        b in position_strategy(),
        c in position_strategy(),
    ) {
        let mut v = [a, b, c];
        v.sort();
        prop_assert!(v[0] <= v[1] && v[1] <= v[2] && v[0] <= v[2]);
    }

    // The composite-compatible order is consistent with the strong
    // position order: it never inverts strictly ordered row positions.
    #[test]
    fn composite_order_is_compatible(a in position_strategy(), b in position_strategy()) {
        let weak = compare_positions(&a, &b);
        match a.cmp(&b) {
            Ordering::Less => prop_assert_ne!(weak, Ordering::Greater),
            Ordering::Greater => prop_assert_ne!(weak, Ordering::Less),
            Ordering::Equal => prop_assert_eq!(weak, Ordering::Equal),
        }
    }

    // A range expressed as composites selects the same rows as the same
    // range expressed as positions.
    #[test]
    fn composite_bounds_select_same_rows(
        bound in position_strategy(),
        row in prefix_strategy(),
    ) {
        prop_assume!(!bound.is_static_row());
        // An empty exact prefix has no composite form; only the ±∞ bound
        // weights are meaningful for the empty prefix.
        prop_assume!(
            !(bound.prefix().unwrap().is_empty() && bound.weight() == Some(Weight::At))
        );
        let row_pos = Position::for_key(row);
        let composite = Composite::from(&bound);
        let by_position = compare_positions(&bound, &row_pos);
        let by_composite = compare_composite_position(&composite, &row_pos);
        prop_assert_eq!(by_position, by_composite);
        prop_assert_eq!(
            compare_position_composite(&row_pos, &composite),
            by_composite.reverse()
        );
    }

    // Composite self-comparison agrees with the mixed comparator.
    #[test]
    fn composite_comparators_agree(a in position_strategy(), b in position_strategy()) {
        prop_assume!(!a.is_static_row() && !b.is_static_row());
        let ca = Composite::from(&a);
        let cb = Composite::from(&b);
        prop_assert_eq!(compare_composites(&ca, &cb), compare_positions(&a, &b));
    }

    // no_clustering_row_between is exact: it answers true iff no weight-0
    // position with an extension-free key fits strictly between.
    #[test]
    fn no_row_between_matches_definition(a in position_strategy(), b in position_strategy()) {
        prop_assume!(!a.is_static_row() && !b.is_static_row());
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if no_clustering_row_between(&lo, &hi) {
            // Same prefix and touching weights: the row at that prefix is
            // not strictly inside.
            let row = Position::for_key(lo.prefix().unwrap().clone());
            prop_assert!(!(lo < row && row < hi));
        }
    }

    // Tombstone list apply is order-independent in observable coverage.
    #[test]
    fn tombstone_list_apply_commutes(
        spans in proptest::collection::vec((0u8..8, 1u8..4, 1i64..20), 1..6),
    ) {
        let pos = |n: u8| {
            Position::for_key(ClusteringPrefix::from_components([vec![n]]))
        };
        let tombs: Vec<RangeTombstone> = spans
            .iter()
            .map(|(start, len, ts)| {
                RangeTombstone::new(
                    pos(*start),
                    pos(start.saturating_add(*len)),
                    Tombstone::new(*ts, *ts),
                )
            })
            .collect();
        let mut fwd = RangeTombstoneList::new();
        for t in tombs.iter().cloned() {
            fwd.apply(t);
        }
        let mut rev = RangeTombstoneList::new();
        for t in tombs.iter().rev().cloned() {
            rev.apply(t);
        }
        for n in 0..16u8 {
            prop_assert_eq!(fwd.tombstone_at(&pos(n)), rev.tombstone_at(&pos(n)));
        }
    }
}
