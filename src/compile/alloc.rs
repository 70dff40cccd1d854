//! Allocation-placement visitor.
//!
//! A variable's storage is installed by the deepest supernode that is still
//! an ancestor of every rule writing it, so short-lived intermediates live
//! inside the block that uses them while shared results live at the level
//! they are shared. Two exceptions:
//! - rotation variables allocate at their loop supernode (one buffer per
//!   offset, rotated instead of reallocated per iteration);
//! - recurrence targets never allocate — their storage arrives by move from
//!   the chain's previous holder.

use crate::entity::VarId;
use crate::facts::rule::{Qualifier, RuleDatabase};
use crate::facts::store::FactStore;
use crate::graph::decompose::{MultiLevelGraph, NodeId, SupernodeKind};
use crate::graph::digraph::rules_in;
use crate::rule_error::RuleMeshError;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Fill each supernode's `allocate` list.
pub fn place_allocations(
    mlg: &mut MultiLevelGraph,
    rules: &RuleDatabase,
    facts: &dyn FactStore,
) -> Result<(), RuleMeshError> {
    // Storage that arrives by recurrence move is never allocated directly.
    let mut arrives_by_move: BTreeSet<VarId> = BTreeSet::new();
    for (_, r) in rules.iter() {
        if r.qualifier.is_recurrence() {
            arrives_by_move.extend(r.output_vars());
        }
    }

    // Rotation variables belong to their loop node.
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

    // Writer nodes per variable, walking every Dag block (markers included:
    // they stand for their supernode's outputs at the parent level).
    let mut writers: BTreeMap<VarId, Vec<NodeId>> = BTreeMap::new();
    for id in mlg.ids() {
        let node = mlg.node(id)?;
        if !matches!(node.kind, SupernodeKind::Dag) {
            continue;
        }
        for rid in rules_in(&node.graph.all_vertices()) {
            for v in rules.get(rid)?.output_vars() {
                writers.entry(v).or_default().push(id);
            }
        }
    }

    for (var, nodes) in writers {
        if arrives_by_move.contains(&var) || facts.get_variable(var).is_ok() {
            continue;
        }
        let place = match rotation_home.get(&var) {
            Some(&home) => home,
            None => nodes
                .iter()
                .copied()
                .reduce(|a, b| mlg.common_ancestor(a, b))
                .expect("writers is non-empty"),
        };
        let list = &mut mlg.node_mut(place)?.allocate;
        if !list.contains(&var) {
            debug!("allocating {var:?} at supernode {place}");
            list.push(var);
        }
    }

    for id in mlg.ids() {
        mlg.node_mut(id)?.allocate.sort_unstable();
    }
    Ok(())
}
