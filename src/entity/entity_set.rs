//! `EntitySet`: canonical disjoint-interval sets of entities.
//!
//! An entity is an opaque integer naming one element of a partitioned domain
//! (mesh cell, node, face, or abstract record). Rules never name entities
//! individually; they operate over `EntitySet`s. Sets are stored as sorted,
//! non-adjacent closed intervals — every algorithm downstream assumes this
//! canonical form, so all constructors and operators re-establish it.
//!
//! The same type doubles as the vertex-set representation of the dependency
//! graph (vertices are signed integers, see [`crate::graph::digraph`]),
//! which keeps graph algebra and entity algebra one implementation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque index into a partitioned data domain.
pub type Entity = i32;

/// Smallest entity id representable in a set.
///
/// One off the numeric extremes so interval arithmetic (`lo - 1`, `hi + 1`)
/// never overflows.
pub const UNIVERSE_MIN: Entity = i32::MIN + 1;
/// Largest entity id representable in a set.
pub const UNIVERSE_MAX: Entity = i32::MAX - 1;

/// A closed interval `[lo, hi]` of entity ids.
pub type Interval = (Entity, Entity);

/// Ordered, normalized union of disjoint closed intervals.
///
/// # Invariants
/// - Intervals are sorted by `lo`.
/// - Intervals never overlap and are never adjacent (`prev.hi + 1 < next.lo`).
/// - Every interval satisfies `UNIVERSE_MIN <= lo <= hi <= UNIVERSE_MAX`.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntitySet {
    ivls: Vec<Interval>,
}

impl EntitySet {
    /// The empty set, usable in const and static positions.
    pub const EMPTY: EntitySet = EntitySet { ivls: Vec::new() };

    /// Shared reference to the empty set, for `unwrap_or` defaults in
    /// accessors that return `&EntitySet`.
    #[inline]
    pub fn empty_ref() -> &'static EntitySet {
        static EMPTY: EntitySet = EntitySet::EMPTY;
        &EMPTY
    }

    /// The empty set.
    #[inline]
    pub fn new() -> Self {
        Self { ivls: Vec::new() }
    }

    /// The full representable universe.
    pub fn universe() -> Self {
        Self {
            ivls: vec![(UNIVERSE_MIN, UNIVERSE_MAX)],
        }
    }

    /// Set holding a single entity.
    pub fn singleton(e: Entity) -> Self {
        Self::from_interval(e, e)
    }

    /// Set holding the closed interval `[lo, hi]`; empty if `lo > hi`.
    pub fn from_interval(lo: Entity, hi: Entity) -> Self {
        if lo > hi {
            return Self::new();
        }
        let lo = lo.max(UNIVERSE_MIN);
        let hi = hi.min(UNIVERSE_MAX);
        Self { ivls: vec![(lo, hi)] }
    }

    /// Build from arbitrary intervals, normalizing to canonical form.
    pub fn from_intervals<I: IntoIterator<Item = Interval>>(iter: I) -> Self {
        let mut ivls: Vec<Interval> = iter
            .into_iter()
            .filter(|&(a, b)| a <= b)
            .map(|(a, b)| (a.max(UNIVERSE_MIN), b.min(UNIVERSE_MAX)))
            .collect();
        ivls.sort_unstable();
        let mut out: Vec<Interval> = Vec::with_capacity(ivls.len());
        for (a, b) in ivls {
            match out.last_mut() {
                Some(last) if a <= last.1.saturating_add(1) => {
                    if b > last.1 {
                        last.1 = b;
                    }
                }
                _ => out.push((a, b)),
            }
        }
        Self { ivls: out }
    }

    /// Number of entities in the set.
    pub fn size(&self) -> usize {
        self.ivls
            .iter()
            .map(|&(a, b)| (b as i64 - a as i64 + 1) as usize)
            .sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ivls.is_empty()
    }

    /// The canonical interval decomposition.
    #[inline]
    pub fn intervals(&self) -> &[Interval] {
        &self.ivls
    }

    /// Number of maximal intervals.
    #[inline]
    pub fn num_intervals(&self) -> usize {
        self.ivls.len()
    }

    /// Smallest member, if any.
    pub fn min(&self) -> Option<Entity> {
        self.ivls.first().map(|&(a, _)| a)
    }

    /// Largest member, if any.
    pub fn max(&self) -> Option<Entity> {
        self.ivls.last().map(|&(_, b)| b)
    }

    /// Membership test by binary search over intervals.
    pub fn contains(&self, e: Entity) -> bool {
        self.ivls
            .binary_search_by(|&(a, b)| {
                if e < a {
                    std::cmp::Ordering::Greater
                } else if e > b {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// `self ⊆ other`.
    pub fn is_subset_of(&self, other: &EntitySet) -> bool {
        self.difference(other).is_empty()
    }

    /// Insert one entity, preserving canonical form.
    pub fn insert(&mut self, e: Entity) {
        self.insert_interval(e, e);
    }

    /// Insert a closed interval, preserving canonical form.
    pub fn insert_interval(&mut self, lo: Entity, hi: Entity) {
        if lo > hi {
            return;
        }
        // Small-set fast path dominates scheduler workloads; a full re-merge
        // keeps the code obviously canonical.
        let mut ivls = std::mem::take(&mut self.ivls);
        ivls.push((lo.max(UNIVERSE_MIN), hi.min(UNIVERSE_MAX)));
        *self = Self::from_intervals(ivls);
    }

    /// Set union.
    pub fn union(&self, other: &EntitySet) -> EntitySet {
        Self::from_intervals(self.ivls.iter().chain(other.ivls.iter()).copied())
    }

    /// In-place union.
    pub fn union_with(&mut self, other: &EntitySet) {
        if other.is_empty() {
            return;
        }
        *self = self.union(other);
    }

    /// Set intersection by a two-pointer sweep.
    pub fn intersect(&self, other: &EntitySet) -> EntitySet {
        let (mut i, mut j) = (0, 0);
        let mut out = Vec::new();
        while i < self.ivls.len() && j < other.ivls.len() {
            let (a1, b1) = self.ivls[i];
            let (a2, b2) = other.ivls[j];
            let lo = a1.max(a2);
            let hi = b1.min(b2);
            if lo <= hi {
                out.push((lo, hi));
            }
            if b1 < b2 {
                i += 1;
            } else {
                j += 1;
            }
        }
        // Pieces are already sorted and disjoint.
        EntitySet { ivls: out }
    }

    /// Set difference `self − other`.
    pub fn difference(&self, other: &EntitySet) -> EntitySet {
        self.intersect(&other.complement())
    }

    /// Complement within `[UNIVERSE_MIN, UNIVERSE_MAX]`.
    pub fn complement(&self) -> EntitySet {
        let mut out = Vec::with_capacity(self.ivls.len() + 1);
        let mut prev = UNIVERSE_MIN;
        for &(a, b) in &self.ivls {
            if a > prev {
                out.push((prev, a - 1));
            }
            prev = b + 1;
        }
        if prev <= UNIVERSE_MAX {
            out.push((prev, UNIVERSE_MAX));
        }
        EntitySet { ivls: out }
    }

    /// Iterate all member entities in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.ivls.iter().flat_map(|&(a, b)| a..=b)
    }

    /// Split into `n` contiguous, near-equal chunks.
    ///
    /// The leftover `size % n` entities are balanced across the first
    /// chunks, so chunk sizes differ by at most one. Empty chunks are not
    /// emitted (a set smaller than `n` yields fewer than `n` chunks).
    pub fn partition(&self, n: usize) -> Vec<EntitySet> {
        assert!(n > 0, "partition count must be positive");
        let total = self.size();
        if total == 0 {
            return Vec::new();
        }
        let base = total / n;
        let rem = total % n;
        let mut chunks = Vec::with_capacity(n.min(total));
        let mut cursor = 0usize; // interval index
        let mut offset: i64 = 0; // consumed inside current interval
        for k in 0..n {
            let want = base + usize::from(k < rem);
            if want == 0 {
                continue;
            }
            let mut need = want as i64;
            let mut piece: Vec<Interval> = Vec::new();
            while need > 0 {
                let (a, b) = self.ivls[cursor];
                let lo = a as i64 + offset;
                let avail = b as i64 - lo + 1;
                let take = avail.min(need);
                piece.push((lo as Entity, (lo + take - 1) as Entity));
                need -= take;
                if take == avail {
                    cursor += 1;
                    offset = 0;
                } else {
                    offset += take;
                }
            }
            chunks.push(EntitySet { ivls: piece });
        }
        chunks
    }

    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    pub(crate) fn debug_assert_canonical(&self) {
        for w in self.ivls.windows(2) {
            debug_assert!(
                w[0].1 as i64 + 1 < w[1].0 as i64,
                "EntitySet intervals must be sorted and non-adjacent: {:?}",
                self.ivls
            );
        }
        for &(a, b) in &self.ivls {
            debug_assert!(a <= b && a >= UNIVERSE_MIN && b <= UNIVERSE_MAX);
        }
    }
}

impl FromIterator<Entity> for EntitySet {
    fn from_iter<I: IntoIterator<Item = Entity>>(iter: I) -> Self {
        Self::from_intervals(iter.into_iter().map(|e| (e, e)))
    }
}

impl fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (k, &(a, b)) in self.ivls.iter().enumerate() {
            if k > 0 {
                write!(f, ",")?;
            }
            if a == b {
                write!(f, "{a}")?;
            } else {
                write!(f, "[{a},{b}]")?;
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Display for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ivls: &[Interval]) -> EntitySet {
        EntitySet::from_intervals(ivls.iter().copied())
    }

    #[test]
    fn normalization_merges_overlap_and_adjacency() {
        let s = set(&[(5, 9), (1, 3), (4, 4), (12, 12)]);
        assert_eq!(s.intervals(), &[(1, 9), (12, 12)]);
        assert_eq!(s.size(), 10);
    }

    #[test]
    fn union_intersect_difference() {
        let a = set(&[(0, 9), (20, 29)]);
        let b = set(&[(5, 24)]);
        assert_eq!(a.union(&b).intervals(), &[(0, 29)]);
        assert_eq!(a.intersect(&b).intervals(), &[(5, 9), (20, 24)]);
        assert_eq!(a.difference(&b).intervals(), &[(0, 4), (25, 29)]);
        // (A ∪ B) ∩ A == A
        assert_eq!(a.union(&b).intersect(&a), a);
    }

    #[test]
    fn complement_round_trip() {
        let a = set(&[(-3, 7), (100, 200)]);
        assert_eq!(a.complement().complement(), a);
        assert!(a.intersect(&a.complement()).is_empty());
        assert_eq!(a.union(&a.complement()), EntitySet::universe());
    }

    #[test]
    fn contains_and_bounds() {
        let a = set(&[(1, 3), (7, 7)]);
        assert!(a.contains(2) && a.contains(7));
        assert!(!a.contains(0) && !a.contains(4) && !a.contains(8));
        assert_eq!(a.min(), Some(1));
        assert_eq!(a.max(), Some(7));
    }

    #[test]
    fn interval_round_trip_is_identity() {
        let a = set(&[(1, 5), (9, 9), (11, 20)]);
        let rebuilt = EntitySet::from_intervals(a.intervals().iter().copied());
        assert_eq!(rebuilt, a);
    }

    #[test]
    fn partition_balances_remainder() {
        let a = set(&[(0, 9)]); // 10 entities into 3 chunks: 4,3,3
        let parts = a.partition(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts.iter().map(|p| p.size()).collect::<Vec<_>>(),
            vec![4, 3, 3]
        );
        let mut whole = EntitySet::new();
        for p in &parts {
            assert!(whole.intersect(p).is_empty());
            whole.union_with(p);
        }
        assert_eq!(whole, a);
    }

    #[test]
    fn partition_across_interval_gaps() {
        let a = set(&[(0, 2), (10, 12), (20, 21)]); // 8 entities, 3 chunks: 3,3,2
        let parts = a.partition(3);
        assert_eq!(
            parts.iter().map(|p| p.size()).collect::<Vec<_>>(),
            vec![3, 3, 2]
        );
        assert_eq!(parts[0].intervals(), &[(0, 2)]);
        assert_eq!(parts[1].intervals(), &[(10, 12)]);
    }

    #[test]
    fn partition_more_chunks_than_entities() {
        let a = set(&[(5, 6)]);
        let parts = a.partition(4);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.size() == 1));
    }

    #[test]
    fn from_iterator_of_entities() {
        let a: EntitySet = [3, 1, 2, 10].into_iter().collect();
        assert_eq!(a.intervals(), &[(1, 3), (10, 10)]);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 3, 10]);
    }

    #[test]
    fn serde_round_trip() {
        let a = set(&[(1, 4), (8, 8)]);
        let s = serde_json::to_string(&a).unwrap();
        let b: EntitySet = serde_json::from_str(&s).unwrap();
        assert_eq!(a, b);
    }
}
