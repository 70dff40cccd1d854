//! Directed bipartite dependency graph over signed integer vertices.
//!
//! Non-negative vertices are variables ([`VarId`]); negative vertices are
//! rules ([`RuleId`], encoded as `-(id + 1)`). Neighbor sets reuse the
//! canonical interval-set representation, so graph algebra (union,
//! restriction, reachability frontiers) is the same code as entity algebra.

use crate::entity::{EntitySet, VarId};
use crate::facts::rule::RuleId;
use std::collections::BTreeMap;

/// Signed vertex id.
pub type Vertex = i32;

/// Set of vertices, canonical interval form.
pub type VertexSet = EntitySet;

#[inline]
pub fn var_vertex(v: VarId) -> Vertex {
    v.0 as Vertex
}

#[inline]
pub fn rule_vertex(r: RuleId) -> Vertex {
    -(r.0 as Vertex) - 1
}

#[inline]
pub fn as_var(v: Vertex) -> Option<VarId> {
    (v >= 0).then(|| VarId(v as u32))
}

#[inline]
pub fn as_rule(v: Vertex) -> Option<RuleId> {
    (v < 0).then(|| RuleId((-v - 1) as u32))
}

/// All rule vertices in `set`.
pub fn rules_in(set: &VertexSet) -> impl Iterator<Item = RuleId> + '_ {
    set.iter().filter_map(as_rule)
}

/// All variable vertices in `set`.
pub fn vars_in(set: &VertexSet) -> impl Iterator<Item = VarId> + '_ {
    set.iter().filter_map(as_var)
}

/// Adjacency-set digraph with deterministic iteration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Digraph {
    edges: BTreeMap<Vertex, VertexSet>,
}

impl Digraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: Vertex, to: Vertex) {
        self.edges.entry(from).or_default().insert(to);
        self.edges.entry(to).or_default();
    }

    pub fn add_edges(&mut self, from: Vertex, to: &VertexSet) {
        self.edges.entry(from).or_default().union_with(to);
        for v in to.iter() {
            self.edges.entry(v).or_default();
        }
    }

    /// Successor set of `v`; empty for unknown vertices.
    pub fn out(&self, v: Vertex) -> &VertexSet {
        self.edges.get(&v).unwrap_or(VertexSet::empty_ref())
    }

    pub fn has_edge(&self, from: Vertex, to: Vertex) -> bool {
        self.out(from).contains(to)
    }

    /// Every vertex mentioned as a source or a target.
    pub fn all_vertices(&self) -> VertexSet {
        let mut out: VertexSet = self.edges.keys().copied().collect();
        for s in self.edges.values() {
            out.union_with(s);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Edge-reversed copy.
    pub fn transpose(&self) -> Digraph {
        let mut t = Digraph::new();
        for (&u, outs) in &self.edges {
            t.edges.entry(u).or_default();
            for v in outs.iter() {
                t.edges.entry(v).or_default().insert(u);
            }
        }
        t
    }

    /// Restriction to `keep`: vertices outside it vanish along with their
    /// incident edges.
    pub fn subgraph(&self, keep: &VertexSet) -> Digraph {
        let mut g = Digraph::new();
        for (&u, outs) in &self.edges {
            if keep.contains(u) {
                g.edges.insert(u, outs.intersect(keep));
            }
        }
        g
    }

    /// Vertices reachable from `starts` (inclusive) following edges forward.
    pub fn reachable_from(&self, starts: &VertexSet) -> VertexSet {
        let mut visited = starts.clone();
        let mut frontier = starts.clone();
        while !frontier.is_empty() {
            let mut next = VertexSet::new();
            for v in frontier.iter() {
                next.union_with(self.out(v));
            }
            frontier = next.difference(&visited);
            visited.union_with(&frontier);
        }
        visited
    }

    pub fn iter(&self) -> impl Iterator<Item = (Vertex, &VertexSet)> {
        self.edges.iter().map(|(&v, s)| (v, s))
    }

    /// Strongly connected components in deterministic order, via iterative
    /// Tarjan. Singleton components without a self-loop are trivial.
    pub fn sccs(&self) -> Vec<VertexSet> {
        #[derive(Default)]
        struct State {
            index: BTreeMap<Vertex, usize>,
            low: BTreeMap<Vertex, usize>,
            on_stack: BTreeMap<Vertex, bool>,
            stack: Vec<Vertex>,
            counter: usize,
            out: Vec<VertexSet>,
        }
        let mut st = State::default();
        let verts = self.all_vertices();
        for root in verts.iter() {
            if st.index.contains_key(&root) {
                continue;
            }
            // Explicit DFS stack: (vertex, neighbor cursor).
            let mut dfs: Vec<(Vertex, Vec<Vertex>, usize)> = Vec::new();
            let idx = st.counter;
            st.counter += 1;
            st.index.insert(root, idx);
            st.low.insert(root, idx);
            st.stack.push(root);
            st.on_stack.insert(root, true);
            dfs.push((root, self.out(root).iter().collect(), 0));
            while let Some((v, neigh, cursor)) = dfs.last_mut() {
                if *cursor < neigh.len() {
                    let w = neigh[*cursor];
                    *cursor += 1;
                    if !st.index.contains_key(&w) {
                        let idx = st.counter;
                        st.counter += 1;
                        st.index.insert(w, idx);
                        st.low.insert(w, idx);
                        st.stack.push(w);
                        st.on_stack.insert(w, true);
                        dfs.push((w, self.out(w).iter().collect(), 0));
                    } else if st.on_stack.get(&w).copied().unwrap_or(false) {
                        let lw = st.index[&w];
                        let v = *v;
                        let lv = st.low[&v];
                        st.low.insert(v, lv.min(lw));
                    }
                } else {
                    let v = *v;
                    dfs.pop();
                    if let Some((p, _, _)) = dfs.last() {
                        let lv = st.low[&v];
                        let lp = st.low[p];
                        st.low.insert(*p, lp.min(lv));
                    }
                    if st.low[&v] == st.index[&v] {
                        let mut comp = VertexSet::new();
                        while let Some(w) = st.stack.pop() {
                            st.on_stack.insert(w, false);
                            comp.insert(w);
                            if w == v {
                                break;
                            }
                        }
                        st.out.push(comp);
                    }
                }
            }
        }
        st.out
    }
}
