//! Concurrent-level topological ordering of a (sub-)dag.

use crate::graph::digraph::{Digraph, VertexSet};

/// Order the vertices of `g` restricted to `only` into schedule levels.
///
/// Each emitted level contains every not-yet-scheduled vertex all of whose
/// predecessors (within `only`) are already scheduled; its members are
/// therefore pairwise non-adjacent and are candidates for concurrent
/// execution. Vertices unreachable from `start` within `only` are silently
/// excluded — one call need not cover the whole graph. Vertices on a cycle
/// are never ready and are likewise excluded; callers that require acyclic
/// coverage check the flattened level count.
pub fn schedule_dag(g: &Digraph, start: &VertexSet, only: &VertexSet) -> Vec<VertexSet> {
    let gg = g.subgraph(only);
    let candidates = gg.reachable_from(&start.intersect(only));
    let preds = gg.transpose();

    let mut levels = Vec::new();
    let mut scheduled = VertexSet::new();
    loop {
        let mut ready = VertexSet::new();
        for v in candidates.difference(&scheduled).iter() {
            if preds.out(v).intersect(&candidates).is_subset_of(&scheduled) {
                ready.insert(v);
            }
        }
        if ready.is_empty() {
            break;
        }
        scheduled.union_with(&ready);
        levels.push(ready);
    }
    levels
}
