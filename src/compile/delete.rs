//! Deletion-placement visitor.
//!
//! Each scheduled allocation is paired with a free at the deepest supernode
//! that is still an ancestor of every reader and writer, appended after the
//! node's last schedule level. Schedule targets are never freed (they are
//! the caller's results), and neither are recurrence sources — their storage
//! has already moved down the chain. A free that would land below a reader
//! is a `PrematureDelete` and aborts plan generation.

use crate::compile::recurrence::RecurrenceChains;
use crate::entity::{VarId, VariableRegistry};
use crate::facts::rule::RuleDatabase;
use crate::graph::decompose::{MultiLevelGraph, NodeId, SupernodeKind};
use crate::graph::digraph::rules_in;
use crate::rule_error::RuleMeshError;
use log::debug;
use std::collections::BTreeMap;

/// Fill each supernode's `free` list.
pub fn place_deletions(
    mlg: &mut MultiLevelGraph,
    rules: &RuleDatabase,
    vars: &VariableRegistry,
    chains: &RecurrenceChains,
    targets: &[VarId],
) -> Result<(), RuleMeshError> {
    // Readers and writers per variable, with a witness rule for diagnostics.
    let mut touchers: BTreeMap<VarId, Vec<(NodeId, String)>> = BTreeMap::new();
    for id in mlg.ids() {
        let node = mlg.node(id)?;
        if !matches!(node.kind, SupernodeKind::Dag) {
            continue;
        }
        for rid in rules_in(&node.graph.all_vertices()) {
            let r = rules.get(rid)?;
            for v in r.input_vars().into_iter().chain(r.output_vars()) {
                touchers.entry(v).or_default().push((id, r.name.clone()));
            }
        }
    }

    let allocated: Vec<(NodeId, VarId)> = mlg
        .ids()
        .flat_map(|id| {
            mlg.node(id)
                .map(|n| n.allocate.iter().map(move |&v| (id, v)).collect())
                .unwrap_or_else(|_| Vec::new())
        })
        .collect();

    for (alloc_node, var) in allocated {
        if targets.contains(&var) || chains.storage_moves_from(var) {
            continue;
        }
        let Some(uses) = touchers.get(&var) else {
            continue;
        };
        let place = uses
            .iter()
            .map(|&(n, _)| n)
            .fold(alloc_node, |a, b| mlg.common_ancestor(a, b));

        // Every reader must execute within the subtree the free closes.
        for (reader, rule) in uses {
            if !mlg.ancestors(*reader).contains(&place) {
                return Err(RuleMeshError::PrematureDelete {
                    var: vars.name_of(var),
                    rule: rule.clone(),
                });
            }
        }

        let list = &mut mlg.node_mut(place)?.free;
        if !list.contains(&var) {
            debug!("freeing {var:?} at supernode {place}");
            list.push(var);
        }
    }

    // Chain-final holders own storage that arrived by a recurrence move
    // instead of an allocation; without a free of their own they would
    // outlive the plan. Rotation members stay alive for the whole loop, so
    // their free anchors at the loop node like their allocation does.
    let mut rotation_home: BTreeMap<VarId, NodeId> = BTreeMap::new();
    for id in mlg.ids() {
        if let SupernodeKind::Loop(info) = &mlg.node(id)?.kind {
            for chain in &info.rotate {
                for &v in chain {
                    rotation_home.insert(v, id);
                }
            }
        }
    }
    for var in chains.final_holders() {
        if targets.contains(&var) {
            continue;
        }
        let Some(uses) = touchers.get(&var) else {
            continue;
        };
        let anchor = rotation_home.get(&var).copied();
        let Some(place) = anchor
            .into_iter()
            .chain(uses.iter().map(|&(n, _)| n))
            .reduce(|a, b| mlg.common_ancestor(a, b))
        else {
            continue;
        };
        let list = &mut mlg.node_mut(place)?.free;
        if !list.contains(&var) {
            debug!("freeing chain-final {var:?} at supernode {place}");
            list.push(var);
        }
    }

    for id in mlg.ids() {
        mlg.node_mut(id)?.free.sort_unstable();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::alloc::place_allocations;
    use crate::entity::Variable;
    use crate::facts::container::SliceContainer;
    use crate::facts::rule::{Clause, Qualifier, RuleClass, RuleDescriptor};
    use crate::facts::sched_db::SchedDb;
    use crate::facts::store::{FactStore, InMemoryFacts};
    use crate::graph::builder::build_dependency_graph;
    use crate::graph::decompose::decompose;

    #[test]
    fn intermediate_freed_target_kept() {
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let b = vars.intern(Variable::named("b"));
        let c = vars.intern(Variable::named("c"));
        let mut rules = RuleDatabase::new();
        rules.add_rule(
            RuleDescriptor::concrete("mk_b", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .target(Clause::direct([b])),
        );
        rules.add_rule(
            RuleDescriptor::concrete("mk_c", RuleClass::Pointwise)
                .source(Clause::direct([b]))
                .target(Clause::direct([c])),
        );
        let g = build_dependency_graph(&rules, &vars, &[a], &[c]);
        let mut mlg = decompose(&g, &mut rules, &vars).unwrap();
        let facts = InMemoryFacts::new();
        place_allocations(&mut mlg, &rules, &facts).unwrap();

        let mut sched = SchedDb::new();
        let chains = RecurrenceChains::analyze(&rules, &mut sched, vars.len());
        place_deletions(&mut mlg, &rules, &vars, &chains, &[c]).unwrap();

        let root = mlg.node(mlg.root).unwrap();
        assert!(root.free.contains(&b));
        assert!(!root.free.contains(&c)); // schedule target survives
    }

    #[test]
    fn chain_final_holder_freed_without_allocation() {
        // a --promote--> b; c = f(b). b is never allocated (its storage
        // moves in from a) but must still be freed once c is done with it.
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let b = vars.intern(Variable::named("b"));
        let c = vars.intern(Variable::named("c"));
        let mut rules = RuleDatabase::new();
        rules.add_rule(
            RuleDescriptor::internal("a_as_b", Qualifier::Promote)
                .source(Clause::direct([a]))
                .target(Clause::direct([b])),
        );
        rules.add_rule(
            RuleDescriptor::concrete("mk_c", RuleClass::Pointwise)
                .source(Clause::direct([b]))
                .target(Clause::direct([c])),
        );
        let g = build_dependency_graph(&rules, &vars, &[a], &[c]);
        let mut mlg = decompose(&g, &mut rules, &vars).unwrap();
        let mut facts = InMemoryFacts::new();
        facts.create_fact(a, Box::new(SliceContainer::<f64>::new()));
        place_allocations(&mut mlg, &rules, &facts).unwrap();

        let mut sched = SchedDb::new();
        let chains = RecurrenceChains::analyze(&rules, &mut sched, vars.len());
        place_deletions(&mut mlg, &rules, &vars, &chains, &[c]).unwrap();

        let root = mlg.node(mlg.root).unwrap();
        assert!(!root.allocate.contains(&b));
        assert!(root.free.contains(&b));
        assert!(!root.free.contains(&a)); // storage moved away from a
        assert!(!root.free.contains(&c));
    }
}
