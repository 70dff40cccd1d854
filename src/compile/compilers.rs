//! Supernode compilers: the fixed three-step protocol and plan emission.
//!
//! One `generate_schedule` call runs, over the whole supernode hierarchy:
//! 1. `set_var_existence`   — forward existence, topological rule order;
//! 2. `process_var_requests` — backward requests, reverse order;
//! 3. `create_execution_schedule` — plan emission per supernode kind.
//!
//! Steps 1 and 2 repeat once when loops are present, after unifying
//! existence/requests across each rotation chain (a bounded fixpoint: the
//! sets only grow and the second pass sees the post-rotation state).
//!
//! Determinism contract: every set iterated here is ordered (BTree maps,
//! sorted ids, canonical interval sets), so identical inputs on every rank
//! yield identical plans.

use crate::compile::alloc::place_allocations;
use crate::compile::context::{CompileOptions, CompilerContext, PlanOrdering};
use crate::compile::delete::place_deletions;
use crate::compile::existential::set_rule_existence;
use crate::compile::recurrence::RecurrenceChains;
use crate::compile::requests::process_rule_requests;
use crate::compile::rotate::{record_rotations, rotate_lists};
use crate::entity::{EntitySet, VarId, VariableRegistry};
use crate::exec::plan::ExecNode;
use crate::facts::rule::{Qualifier, RuleClass, RuleDatabase, RuleId};
use crate::facts::store::FactStore;
use crate::graph::builder::{build_dependency_graph, covers_targets};
use crate::graph::decompose::{MultiLevelGraph, NodeId, SupernodeKind, decompose};
use crate::graph::digraph::{Digraph, VertexSet, as_rule, vars_in};
use crate::graph::schedule_dag::schedule_dag;
use crate::rule_error::RuleMeshError;
use log::{debug, error};
use std::collections::BTreeSet;

/// Compile a rule database plus given/target variables into an executable
/// schedule. `Ok(None)` means no rule path connects the givens to the
/// targets — a valid outcome, not an error.
pub fn generate_schedule(
    rules: &mut RuleDatabase,
    vars: &VariableRegistry,
    facts: &dyn FactStore,
    given: &[VarId],
    targets: &[VarId],
    opts: CompileOptions,
) -> Result<Option<ExecNode>, RuleMeshError> {
    let g = build_dependency_graph(rules, vars, given, targets);
    if g.is_empty() || !covers_targets(&g, targets) {
        debug!("no schedule: dependency graph does not cover the targets");
        return Ok(None);
    }

    let mut mlg = decompose(&g, rules, vars)?;
    analyze_rotations(&mut mlg, vars)?;
    let rules = &*rules;

    let mut ctx = CompilerContext::new(rules, vars, facts, opts);
    let chains = RecurrenceChains::analyze(rules, &mut ctx.sched, vars.len());
    for id in mlg.ids() {
        if let SupernodeKind::Loop(info) = &mlg.node(id)?.kind {
            record_rotations(&mut ctx.sched, &info.rotate);
        }
    }

    // Seed existence from host-provided facts.
    for (vid, _) in vars.iter() {
        if let Ok(c) = facts.get_variable(vid) {
            ctx.sched.seed_existence(vid, &c.domain());
        }
    }

    let order = rule_order(&mlg, rules, mlg.root)?;
    let has_loops = mlg
        .ids()
        .any(|id| matches!(mlg.node(id).map(|n| &n.kind), Ok(SupernodeKind::Loop(_))));
    let passes = if has_loops { 2 } else { 1 };

    // Step 1: set_var_existence.
    for _ in 0..passes {
        for &id in &order {
            set_rule_existence(&mut ctx, id)?;
        }
        unify_rotation_existence(&mut ctx, &mlg)?;
    }

    // Step 2: process_var_requests.
    for &t in targets {
        let exist = ctx.sched.existence(t).clone();
        ctx.sched.add_request(t, &exist);
    }
    for _ in 0..passes {
        ctx.clear_comm();
        for &id in order.iter().rev() {
            process_rule_requests(&mut ctx, id)?;
        }
        unify_rotation_requests(&mut ctx, &mlg)?;
    }

    // Every requested entity must be producible before anything executes.
    for v in ctx.sched.touched() {
        let missing = ctx.sched.requests(v).difference(ctx.sched.existence(v));
        if !missing.is_empty() {
            error!(
                "variable {} requested over {} entities no rule produces",
                vars.name_of(v),
                missing.size()
            );
            return Err(RuleMeshError::UnproducibleVariable {
                var: vars.name_of(v),
                missing: missing.size(),
            });
        }
    }

    place_allocations(&mut mlg, rules, facts)?;
    place_deletions(&mut mlg, rules, vars, &chains, targets)?;

    // Step 3: create_execution_schedule.
    let plan = compile_node(&mut ctx, &mlg, mlg.root, &BTreeSet::new())?;
    Ok(Some(plan))
}

/// Fill every loop supernode's rotate/common lists from its member
/// variables.
fn analyze_rotations(
    mlg: &mut MultiLevelGraph,
    vars: &VariableRegistry,
) -> Result<(), RuleMeshError> {
    for id in 0..mlg.len() {
        let (level, members) = match &mlg.node(id)?.kind {
            SupernodeKind::Loop(info) => (
                info.level.clone(),
                vars_in(&mlg.node(id)?.graph.all_vertices()).collect::<Vec<_>>(),
            ),
            _ => continue,
        };
        let (rotate, mut common) = rotate_lists(vars, &level, &members);
        if let SupernodeKind::Loop(info) = &mut mlg.node_mut(id)?.kind {
            info.rotate = rotate;
            info.common.append(&mut common);
            info.common.sort_unstable();
            info.common.dedup();
        }
    }
    Ok(())
}

/// Topological rule order over the whole hierarchy. Supernode markers are
/// transparent: their member rules appear in place, the markers themselves
/// are structural and never analyzed directly.
pub fn rule_order(
    mlg: &MultiLevelGraph,
    rules: &RuleDatabase,
    node: NodeId,
) -> Result<Vec<RuleId>, RuleMeshError> {
    let mut out = Vec::new();
    match &mlg.node(node)?.kind {
        SupernodeKind::Dag => {
            let g = &mlg.node(node)?.graph;
            for level in dag_levels(g) {
                for rid in level.iter().filter_map(as_rule) {
                    match rules.get(rid)?.qualifier {
                        Qualifier::Supernode(inner) => {
                            out.extend(rule_order(mlg, rules, inner)?);
                        }
                        _ => out.push(rid),
                    }
                }
            }
        }
        SupernodeKind::Loop(info) => {
            out.extend(rule_order(mlg, rules, info.advance)?);
            out.extend(rule_order(mlg, rules, info.collapse)?);
        }
        SupernodeKind::Conditional(info) => {
            out.extend(rule_order(mlg, rules, info.body)?);
        }
    }
    Ok(out)
}

/// Concurrency levels of one Dag block, starting from its root vertices.
fn dag_levels(g: &Digraph) -> Vec<VertexSet> {
    let all = g.all_vertices();
    let preds = g.transpose();
    let roots: VertexSet = all.iter().filter(|&v| preds.out(v).is_empty()).collect();
    schedule_dag(g, &roots, &all)
}

/// Unify existence across each rotation chain: after a rotation every offset
/// holds what its upper neighbor held, so all chain members share one
/// existence footprint.
fn unify_rotation_existence(
    ctx: &mut CompilerContext,
    mlg: &MultiLevelGraph,
) -> Result<(), RuleMeshError> {
    for id in mlg.ids() {
        if let SupernodeKind::Loop(info) = &mlg.node(id)?.kind {
            for chain in &info.rotate {
                let mut all = EntitySet::new();
                for &v in chain {
                    all.union_with(ctx.sched.existence(v));
                }
                for &v in chain {
                    ctx.sched.seed_existence(v, &all);
                }
            }
        }
    }
    Ok(())
}

fn unify_rotation_requests(
    ctx: &mut CompilerContext,
    mlg: &MultiLevelGraph,
) -> Result<(), RuleMeshError> {
    for id in mlg.ids() {
        if let SupernodeKind::Loop(info) = &mlg.node(id)?.kind {
            for chain in &info.rotate {
                let mut all = EntitySet::new();
                for &v in chain {
                    all.union_with(ctx.sched.requests(v));
                }
                for &v in chain {
                    ctx.sched.add_request(v, &all);
                }
            }
        }
    }
    Ok(())
}

/// Emit the execution plan for one supernode. `suppress` carries rules
/// already emitted by an enclosing node (loop-entry promotes).
fn compile_node(
    ctx: &mut CompilerContext,
    mlg: &MultiLevelGraph,
    node: NodeId,
    suppress: &BTreeSet<RuleId>,
) -> Result<ExecNode, RuleMeshError> {
    match &mlg.node(node)?.kind {
        SupernodeKind::Dag => compile_dag(ctx, mlg, node, suppress),
        SupernodeKind::Loop(_) => compile_loop(ctx, mlg, node, suppress),
        SupernodeKind::Conditional(_) => compile_conditional(ctx, mlg, node, suppress),
    }
}

fn compile_dag(
    ctx: &mut CompilerContext,
    mlg: &MultiLevelGraph,
    node: NodeId,
    suppress: &BTreeSet<RuleId>,
) -> Result<ExecNode, RuleMeshError> {
    let mut seq = Vec::new();
    for &v in &mlg.node(node)?.allocate {
        seq.push(make_alloc(ctx, v));
    }

    let levels = dag_levels(&mlg.node(node)?.graph);
    for level in levels {
        for rid in level.iter().filter_map(as_rule) {
            if suppress.contains(&rid) {
                continue;
            }
            let desc = ctx.rules.get(rid)?;
            match desc.qualifier.clone() {
                Qualifier::Supernode(inner) => {
                    seq.push(compile_node(ctx, mlg, inner, suppress)?);
                }
                q if q.is_recurrence() => {
                    if let Some(n) = make_rename(ctx, rid)? {
                        seq.push(n);
                    }
                }
                _ => {
                    emit_concrete(ctx, rid, &mut seq)?;
                }
            }
        }
    }

    for &v in &mlg.node(node)?.free {
        seq.push(ExecNode::Free {
            name: ctx.vars.name_of(v),
            var: v,
        });
    }
    Ok(ExecNode::Sequence(seq))
}

fn compile_loop(
    ctx: &mut CompilerContext,
    mlg: &MultiLevelGraph,
    node: NodeId,
    suppress: &BTreeSet<RuleId>,
) -> Result<ExecNode, RuleMeshError> {
    let n = mlg.node(node)?;
    let SupernodeKind::Loop(info) = &n.kind else {
        return Err(RuleMeshError::BadSupernode(node));
    };

    let mut seq = Vec::new();
    for &v in &n.allocate {
        seq.push(make_alloc(ctx, v));
    }

    // Loop-entry promotes run once, before the first iteration, and are
    // suppressed inside the phases.
    let mut inner_suppress = suppress.clone();
    for rv in n.graph.all_vertices().iter() {
        let Some(rid) = as_rule(rv) else { continue };
        if ctx.rules.get(rid)?.qualifier == Qualifier::Promote {
            if let Some(rename) = make_rename(ctx, rid)? {
                seq.push(rename);
            }
            inner_suppress.insert(rid);
        }
    }

    let advance = compile_node(ctx, mlg, info.advance, &inner_suppress)?;
    let collapse = compile_node(ctx, mlg, info.collapse, &inner_suppress)?;
    seq.push(ExecNode::Loop {
        level: info.level.clone(),
        advance: Box::new(advance),
        collapse: Box::new(collapse),
        condition: info.condition,
        rotate: info.rotate.clone(),
    });

    for &v in &n.free {
        seq.push(ExecNode::Free {
            name: ctx.vars.name_of(v),
            var: v,
        });
    }
    Ok(ExecNode::Sequence(seq))
}

fn compile_conditional(
    ctx: &mut CompilerContext,
    mlg: &MultiLevelGraph,
    node: NodeId,
    suppress: &BTreeSet<RuleId>,
) -> Result<ExecNode, RuleMeshError> {
    let n = mlg.node(node)?;
    let SupernodeKind::Conditional(info) = &n.kind else {
        return Err(RuleMeshError::BadSupernode(node));
    };
    let label = n
        .marker
        .map(|m| ctx.rules.name_of(m))
        .unwrap_or_else(|| format!("cond#{node}"));
    let body = compile_node(ctx, mlg, info.body, suppress)?;
    Ok(ExecNode::Conditional {
        label,
        condition: info.condition,
        body: Box::new(body),
    })
}

/// Allocation node for one scheduled variable; the container factory comes
/// from the first producing rule that declares one.
fn make_alloc(ctx: &CompilerContext, var: VarId) -> ExecNode {
    let factory = ctx
        .rules
        .rules_producing(var)
        .into_iter()
        .find_map(|rid| {
            ctx.rules
                .get(rid)
                .ok()
                .and_then(|r| r.container_factory(var).cloned())
        });
    ExecNode::Allocate {
        name: ctx.vars.name_of(var),
        var,
        set: ctx.local_need(var),
        factory,
    }
}

/// Storage-move node for a recurrence rule, or `None` when the rule is not
/// requested (its chain never materializes).
fn make_rename(ctx: &CompilerContext, rid: RuleId) -> Result<Option<ExecNode>, RuleMeshError> {
    if ctx.exec_of(rid).is_empty() {
        return Ok(None);
    }
    let r = ctx.rules.get(rid)?;
    let from = r.input_vars().into_iter().next();
    let to = r.output_vars().into_iter().next();
    let (Some(from), Some(to)) = (from, to) else {
        return Err(RuleMeshError::InvariantViolation(format!(
            "recurrence rule `{}` must have a source and a target",
            r.name
        )));
    };
    Ok(Some(ExecNode::Rename {
        name: r.name.clone(),
        from,
        to,
    }))
}

/// Emit the node group for a concrete rule: computation, pre- and
/// postcommunication (or reduction), ordered per the compile options.
fn emit_concrete(
    ctx: &mut CompilerContext,
    rid: RuleId,
    seq: &mut Vec<ExecNode>,
) -> Result<(), RuleMeshError> {
    let desc = ctx.rules.get(rid)?;
    let exec = ctx.exec_of(rid).clone();
    if exec.is_empty() {
        return Ok(());
    }
    // Pure constraints without a body are scheduling-only.
    if desc.class == RuleClass::Constraint && desc.imp.is_none() {
        return Ok(());
    }
    let imp = desc.imp.clone().ok_or_else(|| {
        RuleMeshError::InvariantViolation(format!("rule `{}` has no body", desc.name))
    })?;

    let compute = if imp.thread_safe()
        && ctx.opts.thread_parts > 1
        && exec.size() >= ctx.opts.parallel_threshold
    {
        ExecNode::ParallelPartition {
            name: desc.name.clone(),
            imp,
            parts: exec.partition(ctx.opts.thread_parts),
        }
    } else {
        ExecNode::Rule {
            name: desc.name.clone(),
            imp,
            exec,
        }
    };

    let pre_plan = ctx.precomm.get(&rid).filter(|p| !p.is_empty()).cloned();
    let pre = pre_plan.map(|plan| ExecNode::Communication {
        label: format!("pre {}", desc.name),
        plan,
        tag: ctx.alloc_tag(),
    });

    let post = make_post(ctx, rid)?;

    match ctx.opts.ordering {
        PlanOrdering::Observed => {
            seq.push(compute);
            if let Some(p) = pre {
                seq.push(p);
            }
        }
        PlanOrdering::Documented => {
            if let Some(p) = pre {
                seq.push(p);
            }
            seq.push(compute);
        }
    }
    if let Some(p) = post {
        seq.push(p);
    }
    Ok(())
}

/// Post-compute node: reduction for `Apply` rules, plain postcommunication
/// otherwise.
fn make_post(
    ctx: &mut CompilerContext,
    rid: RuleId,
) -> Result<Option<ExecNode>, RuleMeshError> {
    let desc = ctx.rules.get(rid)?;
    if desc.class == RuleClass::Apply && ctx.is_distributed() {
        let join = desc.join.clone().ok_or_else(|| {
            RuleMeshError::InvariantViolation(format!(
                "reduction rule `{}` has no join operator",
                desc.name
            ))
        })?;
        let var = desc.output_vars().into_iter().next().ok_or_else(|| {
            RuleMeshError::InvariantViolation(format!(
                "reduction rule `{}` has no target",
                desc.name
            ))
        })?;
        let exist = ctx.sched.existence(var).clone();
        let shadow = ctx
            .sched
            .try_record(var)
            .map(|r| r.shadow.clone())
            .unwrap_or_default();
        let dist = ctx
            .facts
            .distribute_info()
            .ok_or(RuleMeshError::NotDistributed("reduction scheduling"))?;
        if shadow.is_empty() {
            // Replicated partials: every rank folds everyone's value.
            ctx.sched.record(var).policy.work_duplication = true;
            return Ok(Some(ExecNode::GroupReduce {
                label: desc.name.clone(),
                var,
                set: exist,
                join,
            }));
        }
        // Shared-entity partials: point-to-point join over the ghost cut.
        ctx.sched.record(var).policy.comm_reduction = true;
        let sends: Vec<_> = dist
            .copy
            .iter()
            .map(|(r, ghost)| (*r, ghost.intersect(&exist)))
            .filter(|(_, s)| !s.is_empty())
            .collect();
        let recvs: Vec<_> = dist
            .xmit
            .iter()
            .map(|(r, xm)| (*r, xm.intersect(&exist)))
            .filter(|(_, s)| !s.is_empty())
            .collect();
        return Ok(Some(ExecNode::Reduction {
            label: desc.name.clone(),
            var,
            join,
            sends,
            recvs,
            probe: parking_lot::Mutex::new(0),
        }));
    }

    let name = desc.name.clone();
    let Some(plan) = ctx.postcomm.get(&rid).filter(|p| !p.is_empty()).cloned() else {
        return Ok(None);
    };
    let tag = ctx.alloc_tag();
    Ok(Some(ExecNode::Communication {
        label: format!("post {name}"),
        plan,
        tag,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Variable;
    use crate::exec::PodJoin;
    use crate::facts::rule::{Clause, RuleDescriptor};
    use crate::facts::store::{DistributeInfo, InMemoryFacts};
    use std::sync::Arc;

    fn apply_fixture() -> (RuleDatabase, VariableRegistry, InMemoryFacts, RuleId, VarId) {
        let mut vars = VariableRegistry::new();
        let partial = vars.intern(Variable::named("partial"));
        let total = vars.intern(Variable::named("total"));
        let mut rules = RuleDatabase::new();
        let rid = rules.add_rule(
            RuleDescriptor::concrete("sum", RuleClass::Apply)
                .source(Clause::direct([partial]))
                .target(Clause::direct([total]))
                .joined_by(Arc::new(PodJoin::new(|a: &mut i64, b: &i64| *a += b))),
        );
        let dist = DistributeInfo {
            rank: 0,
            size: 2,
            my_entities: EntitySet::from_interval(0, 4),
            copy: vec![(1, EntitySet::from_interval(5, 9))],
            xmit: vec![(1, EntitySet::from_interval(0, 4))],
        };
        (rules, vars, InMemoryFacts::distributed(dist), rid, total)
    }

    #[test]
    fn replicated_apply_reduces_groupwise_and_flags_work_duplication() {
        let (rules, vars, facts, rid, total) = apply_fixture();
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched
            .add_existence(total, rid, &EntitySet::from_interval(0, 9));
        let node = make_post(&mut ctx, rid).unwrap().unwrap();
        assert!(matches!(node, ExecNode::GroupReduce { .. }));
        let policy = ctx.sched.try_record(total).unwrap().policy;
        assert!(policy.work_duplication);
        assert!(!policy.comm_reduction);
    }

    #[test]
    fn shadowed_apply_reduces_point_to_point_and_flags_comm_reduction() {
        let (rules, vars, facts, rid, total) = apply_fixture();
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched
            .add_existence(total, rid, &EntitySet::from_interval(0, 9));
        ctx.sched.add_shadow(total, &EntitySet::from_interval(5, 9));
        let node = make_post(&mut ctx, rid).unwrap().unwrap();
        let ExecNode::Reduction { sends, recvs, .. } = node else {
            panic!("expected point-to-point reduction");
        };
        assert_eq!(sends, vec![(1, EntitySet::from_interval(5, 9))]);
        assert_eq!(recvs, vec![(1, EntitySet::from_interval(0, 4))]);
        let policy = ctx.sched.try_record(total).unwrap().policy;
        assert!(policy.comm_reduction);
        assert!(!policy.work_duplication);
    }
}
