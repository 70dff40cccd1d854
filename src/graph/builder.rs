//! Dependency-graph construction from a rule database plus given/target
//! variable sets, with pruning to reachable, productive vertices.

use crate::entity::{VarId, VariableRegistry};
use crate::facts::rule::{RuleDatabase, RuleId};
use crate::graph::digraph::{Digraph, VertexSet, rule_vertex, var_vertex};
use log::debug;
use std::collections::BTreeSet;

/// Build the pruned dependency graph.
///
/// Edges run variable→rule for every source/constraint/mapping input and
/// rule→variable for every target. A rule is *productive* only when every
/// variable it reads is given or produced by another productive rule; the
/// productive set is grown to a fixpoint, then intersected with backward
/// reachability from the targets. An empty result means no schedule exists —
/// the caller signals that with a null plan, not an error.
///
/// Reachability (not the returned graph) is augmented with temporal
/// recurrence edges `x{n+k} → x{n+j}` for `k > j`: a rule advancing a loop
/// variable is on the path to any consumer of that variable's earlier
/// offsets, even though the scheduling graph stays acyclic.
pub fn build_dependency_graph(
    rules: &RuleDatabase,
    vars: &VariableRegistry,
    given: &[VarId],
    targets: &[VarId],
) -> Digraph {
    // Fixpoint: grow the set of producible variables and viable rules.
    let mut have: BTreeSet<VarId> = given.iter().copied().collect();
    let mut viable: BTreeSet<RuleId> = BTreeSet::new();
    loop {
        let mut changed = false;
        for (id, r) in rules.iter() {
            if viable.contains(&id) {
                continue;
            }
            if r.input_vars().iter().all(|v| have.contains(v)) {
                viable.insert(id);
                for v in r.output_vars() {
                    have.insert(v);
                }
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut g = Digraph::new();
    for &id in &viable {
        let r = rules.get(id).expect("viable rule id");
        let rv = rule_vertex(id);
        for v in r.input_vars() {
            g.add_edge(var_vertex(v), rv);
        }
        for v in r.output_vars() {
            g.add_edge(rv, var_vertex(v));
        }
    }

    // Keep only vertices on some given→target path, judged on the graph
    // augmented with temporal recurrence edges.
    let aug = with_recurrence_edges(&g, vars);
    let given_set: VertexSet = given.iter().map(|&v| var_vertex(v)).collect();
    let target_set: VertexSet = targets.iter().map(|&v| var_vertex(v)).collect();
    let sources = source_rules(&g, &given_set);
    let forward = aug.reachable_from(&given_set.union(&sources));
    let backward = aug.transpose().reachable_from(&target_set);
    let keep = forward.intersect(&backward);

    if targets.iter().any(|&t| !keep.contains(var_vertex(t))) {
        debug!(
            "dependency graph cannot reach all targets; keeping {} of {} vertices",
            keep.size(),
            g.all_vertices().size()
        );
    }
    g.subgraph(&keep)
}

/// Copy of `g` plus an edge from each loop variable to the same variable at
/// every lower time offset present in the graph.
fn with_recurrence_edges(g: &Digraph, vars: &VariableRegistry) -> Digraph {
    let mut aug = g.clone();
    let verts = g.all_vertices();
    let mut timed: Vec<(VarId, &crate::entity::Variable)> = Vec::new();
    for v in verts.iter().filter(|&v| v >= 0) {
        let id = VarId(v as u32);
        if let Ok(desc) = vars.get(id) {
            if desc.time.is_some() {
                timed.push((id, desc));
            }
        }
    }
    for (i, (va, a)) in timed.iter().enumerate() {
        for (vb, b) in timed.iter().skip(i + 1) {
            if a.name == b.name
                && a.namespace == b.namespace
                && a.priority == b.priority
                && a.time.as_ref().map(|t| &t.level) == b.time.as_ref().map(|t| &t.level)
            {
                let (oa, ob) = (
                    a.time.as_ref().unwrap().offset,
                    b.time.as_ref().unwrap().offset,
                );
                if oa > ob {
                    aug.add_edge(var_vertex(*va), var_vertex(*vb));
                } else if ob > oa {
                    aug.add_edge(var_vertex(*vb), var_vertex(*va));
                }
            }
        }
    }
    aug
}

/// Rule vertices with no variable inputs outside `given` (in particular,
/// rules with no inputs at all) — they seed forward reachability.
fn source_rules(g: &Digraph, given: &VertexSet) -> VertexSet {
    let preds = g.transpose();
    let mut out = VertexSet::new();
    for (v, _) in g.iter() {
        if v < 0 && preds.out(v).is_subset_of(given) {
            out.insert(v);
        }
    }
    out
}

/// True when every target is still present in the pruned graph.
pub fn covers_targets(g: &Digraph, targets: &[VarId]) -> bool {
    let all = g.all_vertices();
    targets.iter().all(|&t| all.contains(var_vertex(t)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Variable;
    use crate::facts::rule::{Clause, RuleClass, RuleDescriptor};

    fn pointwise(name: &str, srcs: &[VarId], tgts: &[VarId]) -> RuleDescriptor {
        let mut r = RuleDescriptor::concrete(name, RuleClass::Pointwise);
        if !srcs.is_empty() {
            r = r.source(Clause::direct(srcs.iter().copied()));
        }
        r.target(Clause::direct(tgts.iter().copied()))
    }

    fn named(reg: &mut VariableRegistry, names: &[&str]) -> Vec<VarId> {
        names
            .iter()
            .map(|n| reg.intern(Variable::named(*n)))
            .collect()
    }

    #[test]
    fn diamond_is_fully_kept() {
        let mut reg = VariableRegistry::new();
        let v = named(&mut reg, &["a", "b", "c", "d"]);
        let (a, b, c, d) = (v[0], v[1], v[2], v[3]);
        let mut db = RuleDatabase::new();
        db.add_rule(pointwise("r1", &[], &[a]));
        db.add_rule(pointwise("r2", &[a], &[b]));
        db.add_rule(pointwise("r3", &[a], &[c]));
        db.add_rule(pointwise("r4", &[b, c], &[d]));
        let g = build_dependency_graph(&db, &reg, &[], &[d]);
        assert!(covers_targets(&g, &[d]));
        assert_eq!(g.all_vertices().size(), 8); // 4 rules + 4 variables
    }

    #[test]
    fn unproductive_branches_are_pruned() {
        let mut reg = VariableRegistry::new();
        let v = named(&mut reg, &["a", "b", "c", "x"]);
        let (a, b, c, x) = (v[0], v[1], v[2], v[3]);
        let mut db = RuleDatabase::new();
        db.add_rule(pointwise("mk_b", &[a], &[b]));
        db.add_rule(pointwise("dead", &[x], &[c])); // x is never available
        db.add_rule(pointwise("side", &[a], &[c])); // c is not requested
        let g = build_dependency_graph(&db, &reg, &[a], &[b]);
        assert!(covers_targets(&g, &[b]));
        let all = g.all_vertices();
        assert!(!all.contains(var_vertex(c)));
        assert!(!all.contains(var_vertex(x)));
    }

    #[test]
    fn advance_rules_survive_via_temporal_recurrence() {
        let mut reg = VariableRegistry::new();
        let x_init = reg.intern(Variable::named("x_init"));
        let x_cur = reg.intern(Variable::named("x").at("n", 0));
        let x_next = reg.intern(Variable::named("x").at("n", 1));
        let out = reg.intern(Variable::named("out"));
        let mut db = RuleDatabase::new();
        db.add_rule(pointwise("seed", &[], &[x_init]));
        db.add_rule(pointwise("build", &[x_init], &[x_cur]));
        db.add_rule(pointwise("advance", &[x_cur], &[x_next]));
        db.add_rule(pointwise("finish", &[x_cur], &[out]));
        let g = build_dependency_graph(&db, &reg, &[], &[out]);
        // Without recurrence edges the advance rule (producing only x{n+1},
        // which nothing reads directly) would be pruned.
        assert!(g.all_vertices().contains(var_vertex(x_next)));
        // The returned graph itself stays acyclic: no var→var edges.
        assert!(g.out(var_vertex(x_next)).is_empty());
    }

    #[test]
    fn unreachable_target_yields_graph_without_it() {
        let mut reg = VariableRegistry::new();
        let v = named(&mut reg, &["a", "b"]);
        let (a, b) = (v[0], v[1]);
        let mut db = RuleDatabase::new();
        db.add_rule(pointwise("mk_a", &[], &[a]));
        let g = build_dependency_graph(&db, &reg, &[], &[b]);
        assert!(!covers_targets(&g, &[b]));
        assert!(g.is_empty() || g.all_vertices().is_empty());
    }
}
