//! Recursive decomposition of the dependency graph into a hierarchy of
//! schedulable supernodes.
//!
//! A supernode is either a plain `Dag` block, a `Loop` (bounded temporal
//! recurrence with an advance phase and a collapse/termination phase), or a
//! `Conditional` (branch-dependent execution). Supernodes own sub-digraphs;
//! in the parent graph each is represented by a fresh internal marker rule,
//! so every level of the hierarchy is again a plain digraph over stable
//! signed vertex ids. Loops are the only place cycles are tolerated, and
//! only as bounded recurrences over a time level; any other cycle is fatal.

use crate::entity::{VarId, VariableRegistry};
use crate::facts::rule::{Clause, Qualifier, RuleClass, RuleDatabase, RuleId};
use crate::graph::digraph::{Digraph, VertexSet, as_rule, as_var, rule_vertex, var_vertex};
use crate::rule_error::RuleMeshError;
use log::debug;
use std::collections::BTreeSet;

/// Index of a supernode in the [`MultiLevelGraph`] arena.
pub type NodeId = usize;

#[derive(Debug)]
pub enum SupernodeKind {
    /// Flat acyclic block.
    Dag,
    Loop(LoopInfo),
    Conditional(CondInfo),
}

#[derive(Debug)]
pub struct LoopInfo {
    /// Iteration-counter name (`n` for variables like `x{n}`).
    pub level: String,
    /// Child node holding the advance-phase digraph.
    pub advance: NodeId,
    /// Child node holding the collapse/termination-phase digraph.
    pub collapse: NodeId,
    /// Variable tested each iteration to terminate the loop.
    pub condition: VarId,
    /// Rotation chains, outermost offset first; filled by rotate analysis.
    pub rotate: Vec<Vec<VarId>>,
    /// Loop-invariant inputs shared by both phases.
    pub common: Vec<VarId>,
}

#[derive(Debug)]
pub struct CondInfo {
    pub condition: VarId,
    /// Child node holding the guarded digraph.
    pub body: NodeId,
}

/// One node of the supernode hierarchy, with its owned sub-digraph and the
/// lifetime decoration later passes attach.
#[derive(Debug)]
pub struct Supernode {
    pub parent: Option<NodeId>,
    pub kind: SupernodeKind,
    /// Scheduling digraph of this node. For `Loop`/`Conditional` this is the
    /// undivided subgraph kept for diagnostics; phases live in child nodes.
    pub graph: Digraph,
    /// Internal rule standing for this node in its parent's graph.
    pub marker: Option<RuleId>,
    /// Variables whose storage this node allocates (allocation placement).
    pub allocate: Vec<VarId>,
    /// Variables this node frees once no remaining rule reads them.
    pub free: Vec<VarId>,
}

/// Arena-backed supernode hierarchy.
#[derive(Debug, Default)]
pub struct MultiLevelGraph {
    nodes: Vec<Supernode>,
    pub root: NodeId,
}

impl MultiLevelGraph {
    pub fn node(&self, id: NodeId) -> Result<&Supernode, RuleMeshError> {
        self.nodes.get(id).ok_or(RuleMeshError::BadSupernode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Supernode, RuleMeshError> {
        self.nodes.get_mut(id).ok_or(RuleMeshError::BadSupernode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> std::ops::Range<NodeId> {
        0..self.nodes.len()
    }

    /// Path from `id` up to the root, inclusive.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut cur = id;
        while let Some(p) = self.nodes[cur].parent {
            path.push(p);
            cur = p;
        }
        path
    }

    /// Deepest node on both ancestor paths (the shallowest node that is an
    /// ancestor of each argument is the first common element walking from
    /// the root down).
    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let pa = self.ancestors(a);
        let pb: BTreeSet<_> = self.ancestors(b).into_iter().collect();
        *pa.iter().find(|n| pb.contains(n)).unwrap_or(&self.root)
    }

    fn push(&mut self, node: Supernode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Decompose `g` into a supernode hierarchy, registering marker rules for
/// every supernode in `rules`.
pub fn decompose(
    g: &Digraph,
    rules: &mut RuleDatabase,
    vars: &VariableRegistry,
) -> Result<MultiLevelGraph, RuleMeshError> {
    let mut mlg = MultiLevelGraph::default();
    let handled = BTreeSet::new();
    let root = build_node(&mut mlg, g.clone(), None, rules, vars, &handled)?;
    mlg.root = root;
    Ok(mlg)
}

/// Time levels of variables appearing in `g` that are not yet handled by an
/// enclosing loop, in deterministic order.
fn open_levels(g: &Digraph, vars: &VariableRegistry, handled: &BTreeSet<String>) -> Vec<String> {
    let mut levels = BTreeSet::new();
    for v in g.all_vertices().iter() {
        if let Some(var) = as_var(v) {
            if let Ok(desc) = vars.get(var) {
                if let Some(t) = &desc.time {
                    if !handled.contains(&t.level) {
                        levels.insert(t.level.clone());
                    }
                }
            }
        }
    }
    levels.into_iter().collect()
}

fn vars_at_level(g: &Digraph, vars: &VariableRegistry, level: &str) -> VertexSet {
    let mut out = VertexSet::new();
    for v in g.all_vertices().iter() {
        if let Some(var) = as_var(v) {
            if let Ok(desc) = vars.get(var) {
                if desc.time.as_ref().is_some_and(|t| t.level == level) {
                    out.insert(v);
                }
            }
        }
    }
    out
}

fn build_node(
    mlg: &mut MultiLevelGraph,
    mut g: Digraph,
    parent: Option<NodeId>,
    rules: &mut RuleDatabase,
    vars: &VariableRegistry,
    handled: &BTreeSet<String>,
) -> Result<NodeId, RuleMeshError> {
    // Extracted supernodes are pushed before the Dag that holds their
    // markers exists; collect their ids and reparent them afterwards.
    let mut extracted: Vec<NodeId> = Vec::new();

    // 1) Extract one loop supernode per open time level.
    for level in open_levels(&g, vars, handled) {
        g = extract_loop(mlg, g, rules, vars, handled, &level, &mut extracted)?;
    }

    // 2) Wrap optional (branch-dependent) rules in conditional supernodes.
    g = extract_conditionals(mlg, g, rules, &mut extracted)?;

    // 3) What remains must be acyclic.
    if let Some(cyc) = g.sccs().into_iter().find(|c| c.size() > 1) {
        let witness = cyc
            .iter()
            .filter_map(as_var)
            .map(|v| vars.name_of(v))
            .next()
            .unwrap_or_else(|| format!("{:?}", cyc));
        return Err(RuleMeshError::CycleOutsideLoop(witness));
    }

    let id = mlg.push(Supernode {
        parent,
        kind: SupernodeKind::Dag,
        graph: g,
        marker: None,
        allocate: Vec::new(),
        free: Vec::new(),
    });
    for sn in extracted {
        mlg.nodes[sn].parent = Some(id);
    }
    Ok(id)
}

/// Pull every vertex tied to `level` out of `g` into a loop supernode and
/// splice a marker rule in its place. Returns the rewritten parent graph.
fn extract_loop(
    mlg: &mut MultiLevelGraph,
    g: Digraph,
    rules: &mut RuleDatabase,
    vars: &VariableRegistry,
    handled: &BTreeSet<String>,
    level: &str,
    extracted: &mut Vec<NodeId>,
) -> Result<Digraph, RuleMeshError> {
    let body_vars = vars_at_level(&g, vars, level);
    if body_vars.is_empty() {
        return Ok(g);
    }
    let preds = g.transpose();

    // Rules touching the level: readers and writers of its variables.
    let mut touching = VertexSet::new();
    for v in body_vars.iter() {
        touching.union_with(&g.out(v).clone());
        touching.union_with(&preds.out(v).clone());
    }
    let touching: VertexSet = touching.iter().filter(|&v| v < 0).collect();

    // Collapse rules leave the time level: they read level variables but
    // none of their targets stays at it.
    let mut collapse_rules = VertexSet::new();
    let mut advance_rules = VertexSet::new();
    for rv in touching.iter() {
        if g.out(rv).intersect(&body_vars).is_empty() {
            collapse_rules.insert(rv);
        } else {
            advance_rules.insert(rv);
        }
    }

    let condition = rules_condition(&collapse_rules, rules)?.ok_or_else(|| {
        RuleMeshError::InvariantViolation(format!(
            "loop over level `{level}` has no conditional collapse rule"
        ))
    })?;

    // External inputs and loop outputs.
    let mut ext_in = VertexSet::new();
    for rv in advance_rules.union(&collapse_rules).iter() {
        ext_in.union_with(&preds.out(rv).difference(&body_vars));
    }
    let mut outputs = VertexSet::new();
    for rv in collapse_rules.iter() {
        outputs.union_with(g.out(rv));
    }

    let mut inner_handled = handled.clone();
    inner_handled.insert(level.to_string());

    // Phase subgraphs. External inputs ride along so their edges survive;
    // phase compilers treat them as given.
    let adv_keep = {
        let mut k = body_vars.clone();
        k.union_with(&advance_rules);
        k.union_with(&ext_in);
        for rv in advance_rules.iter() {
            k.union_with(g.out(rv));
        }
        k
    };
    let col_keep = {
        let mut k = collapse_rules.clone();
        for rv in collapse_rules.iter() {
            k.union_with(&preds.out(rv).clone());
            k.union_with(g.out(rv));
        }
        k
    };

    let advance = build_node(mlg, g.subgraph(&adv_keep), None, rules, vars, &inner_handled)?;
    let collapse = build_node(mlg, g.subgraph(&col_keep), None, rules, vars, &inner_handled)?;

    let whole = adv_keep.union(&col_keep);
    let common: Vec<VarId> = ext_in.iter().filter_map(as_var).collect();
    let loop_id = mlg.push(Supernode {
        parent: None, // reparented to the enclosing Dag by build_node
        kind: SupernodeKind::Loop(LoopInfo {
            level: level.to_string(),
            advance,
            collapse,
            condition,
            rotate: Vec::new(),
            common: common.clone(),
        }),
        graph: g.subgraph(&whole),
        marker: None,
        allocate: Vec::new(),
        free: Vec::new(),
    });
    mlg.nodes[advance].parent = Some(loop_id);
    mlg.nodes[collapse].parent = Some(loop_id);
    extracted.push(loop_id);

    // Marker rule splices the loop into the parent graph.
    let marker = rules.add_rule(
        crate::facts::rule::RuleDescriptor::internal(
            format!("loop@{level}"),
            Qualifier::Supernode(loop_id),
        )
        .source(Clause::direct(ext_in.iter().filter_map(as_var)))
        .target(Clause::direct(outputs.iter().filter_map(as_var))),
    );
    mlg.nodes[loop_id].marker = Some(marker);

    debug!(
        "extracted loop over `{level}`: {} advance rules, {} collapse rules, {} outputs",
        advance_rules.size(),
        collapse_rules.size(),
        outputs.size()
    );

    // Rewrite the parent graph.
    let drop = body_vars.union(&touching);
    let mut out = g.subgraph(&g.all_vertices().difference(&drop));
    let mv = rule_vertex(marker);
    for v in ext_in.iter() {
        out.add_edge(v, mv);
    }
    for v in outputs.iter() {
        out.add_edge(mv, v);
    }
    Ok(out)
}

/// The condition variable declared by the loop's collapse rules.
fn rules_condition(
    collapse_rules: &VertexSet,
    rules: &RuleDatabase,
) -> Result<Option<VarId>, RuleMeshError> {
    for rv in collapse_rules.iter() {
        let id = as_rule(rv).expect("rule vertex");
        if let Some(c) = rules.get(id)?.condition {
            return Ok(Some(c));
        }
    }
    Ok(None)
}

/// Wrap each `Optional`-class rule carrying a condition variable into its
/// own conditional supernode.
fn extract_conditionals(
    mlg: &mut MultiLevelGraph,
    g: Digraph,
    rules: &mut RuleDatabase,
    extracted: &mut Vec<NodeId>,
) -> Result<Digraph, RuleMeshError> {
    let mut out = g.clone();
    let preds = g.transpose();
    let rule_vertices: Vec<i32> = g.all_vertices().iter().filter(|&v| v < 0).collect();
    for rv in rule_vertices {
        let id = as_rule(rv).expect("rule vertex");
        let desc = rules.get(id)?;
        let (Some(cond), RuleClass::Optional) = (desc.condition, desc.class) else {
            continue;
        };
        let name = desc.name.clone();

        let mut keep = VertexSet::singleton(rv);
        keep.union_with(&preds.out(rv).clone());
        keep.union_with(g.out(rv));
        // The body is one rule plus its neighbor variables; loops were
        // already pulled out, so it is a plain Dag. Building it directly
        // keeps the guarded rule from being re-wrapped.
        let body = mlg.push(Supernode {
            parent: None,
            kind: SupernodeKind::Dag,
            graph: g.subgraph(&keep),
            marker: None,
            allocate: Vec::new(),
            free: Vec::new(),
        });
        let cond_id = mlg.push(Supernode {
            parent: None, // reparented to the enclosing Dag by build_node
            kind: SupernodeKind::Conditional(CondInfo {
                condition: cond,
                body,
            }),
            graph: g.subgraph(&keep),
            marker: None,
            allocate: Vec::new(),
            free: Vec::new(),
        });
        mlg.nodes[body].parent = Some(cond_id);
        extracted.push(cond_id);

        let marker = rules.add_rule(
            crate::facts::rule::RuleDescriptor::internal(
                format!("cond({})", name),
                Qualifier::Supernode(cond_id),
            )
            .source(Clause::direct(preds.out(rv).iter().filter_map(as_var)))
            .target(Clause::direct(g.out(rv).iter().filter_map(as_var))),
        );
        mlg.nodes[cond_id].marker = Some(marker);

        // Replace the rule vertex with the marker, keeping its edges.
        let rest = out.all_vertices().difference(&VertexSet::singleton(rv));
        let mut rewritten = out.subgraph(&rest);
        let mv = rule_vertex(marker);
        for v in preds.out(rv).iter() {
            if rest.contains(v) {
                rewritten.add_edge(v, mv);
            }
        }
        for v in g.out(rv).iter() {
            if rest.contains(v) {
                rewritten.add_edge(mv, v);
            }
        }
        out = rewritten;
    }
    Ok(out)
}

/// Resolve the supernode a marker rule stands for, if it is one.
pub fn marker_target(rules: &RuleDatabase, id: RuleId) -> Option<NodeId> {
    match rules.get(id).ok()?.qualifier {
        Qualifier::Supernode(n) => Some(n),
        _ => None,
    }
}
