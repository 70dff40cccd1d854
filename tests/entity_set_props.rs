//! Property tests for the interval-set algebra.

use proptest::prelude::*;
use rule_mesh::entity::{EntitySet, Interval};

fn arb_set() -> impl Strategy<Value = EntitySet> {
    prop::collection::vec((-500i32..500, 0i32..50), 0..8).prop_map(|raw| {
        EntitySet::from_intervals(raw.into_iter().map(|(lo, len)| (lo, lo + len)))
    })
}

/// Sorted, disjoint, non-adjacent, every interval proper.
fn assert_canonical(s: &EntitySet) {
    let ivls: &[Interval] = s.intervals();
    for &(a, b) in ivls {
        assert!(a <= b, "degenerate interval in {s:?}");
    }
    for w in ivls.windows(2) {
        assert!(
            (w[0].1 as i64) + 1 < w[1].0 as i64,
            "overlapping or adjacent intervals in {s:?}"
        );
    }
}

proptest! {
    #[test]
    fn operators_preserve_canonical_form(a in arb_set(), b in arb_set()) {
        assert_canonical(&a.union(&b));
        assert_canonical(&a.intersect(&b));
        assert_canonical(&a.difference(&b));
        assert_canonical(&a.complement());
    }

    #[test]
    fn union_absorbs_intersection(a in arb_set(), b in arb_set()) {
        prop_assert_eq!(a.union(&b).intersect(&a), a);
    }

    #[test]
    fn difference_splits_cleanly(a in arb_set(), b in arb_set()) {
        let diff = a.difference(&b);
        prop_assert!(diff.intersect(&b).is_empty());
        prop_assert_eq!(diff.union(&a.intersect(&b)), a);
    }

    #[test]
    fn inclusion_exclusion_on_sizes(a in arb_set(), b in arb_set()) {
        prop_assert_eq!(
            a.union(&b).size() + a.intersect(&b).size(),
            a.size() + b.size()
        );
    }

    #[test]
    fn complement_is_involutive(a in arb_set()) {
        prop_assert_eq!(a.complement().complement(), a.clone());
        prop_assert!(a.intersect(&a.complement()).is_empty());
        prop_assert_eq!(a.union(&a.complement()), EntitySet::universe());
    }

    #[test]
    fn interval_decomposition_round_trips(a in arb_set()) {
        let rebuilt = EntitySet::from_intervals(a.intervals().iter().copied());
        prop_assert_eq!(rebuilt, a);
    }

    #[test]
    fn membership_agrees_with_iteration(a in arb_set()) {
        for e in a.iter() {
            prop_assert!(a.contains(e));
        }
        prop_assert_eq!(a.iter().count(), a.size());
        prop_assert_eq!(a.iter().next(), a.min());
        prop_assert_eq!(a.iter().last(), a.max());
    }

    #[test]
    fn partition_is_a_balanced_disjoint_cover(a in arb_set(), n in 1usize..6) {
        let parts = a.partition(n);
        let mut whole = EntitySet::new();
        for p in &parts {
            prop_assert!(!p.is_empty());
            prop_assert!(whole.intersect(p).is_empty());
            whole.union_with(p);
        }
        prop_assert_eq!(whole, a.clone());
        if let (Some(lo), Some(hi)) = (
            parts.iter().map(EntitySet::size).min(),
            parts.iter().map(EntitySet::size).max(),
        ) {
            prop_assert!(hi - lo <= 1, "chunk sizes {lo}..{hi} differ by more than one");
        }
    }
}
