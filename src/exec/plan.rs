//! Executable schedule: the tree of execution nodes the compilers emit.
//!
//! A schedule is data, not control flow: every rule invocation, message
//! exchange, allocation and deallocation is an explicit node, fixed at
//! compile time. Executing a schedule twice against the same initial facts
//! produces the same result; loops and conditionals are the only nodes whose
//! runtime behavior depends on fact values, and then only through their
//! condition variable.

use crate::entity::{EntitySet, VarId};
use crate::exec::comm::Communicator;
use crate::exec::comm_sched::{CommInfo, execute_comm};
use crate::exec::reduce::{JoinOp, execute_comm_reduce, group_all_reduce};
use crate::facts::container::{Container, SliceContainer};
use crate::facts::rule::{ContainerFactory, RuleImpl};
use crate::facts::store::FactStore;
use crate::rule_error::RuleMeshError;
use log::{debug, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// One node of an execution schedule.
pub enum ExecNode {
    /// Invoke a rule body over a fixed entity set.
    Rule {
        name: String,
        imp: Arc<dyn RuleImpl>,
        exec: EntitySet,
    },
    /// Invoke a thread-safe rule body once per entity-set partition.
    ParallelPartition {
        name: String,
        imp: Arc<dyn RuleImpl>,
        parts: Vec<EntitySet>,
    },
    /// Two-stage point-to-point exchange (pre- or postcommunication).
    Communication {
        label: String,
        plan: Vec<CommInfo>,
        tag: u16,
    },
    /// Point-to-point join of partial results over shared entities.
    Reduction {
        label: String,
        var: VarId,
        join: Arc<dyn JoinOp>,
        sends: Vec<(usize, EntitySet)>,
        recvs: Vec<(usize, EntitySet)>,
        /// Largest payload observed so far; sizes the next probe buffers.
        probe: Mutex<usize>,
    },
    /// Hypercube all-reduce of a packed variable; all ranks end identical.
    GroupReduce {
        label: String,
        var: VarId,
        set: EntitySet,
        join: Arc<dyn JoinOp>,
    },
    /// Run children in order.
    Sequence(Vec<ExecNode>),
    /// Bounded temporal recurrence: advance, collapse, test, rotate.
    Loop {
        level: String,
        advance: Box<ExecNode>,
        collapse: Box<ExecNode>,
        condition: VarId,
        /// Buffer rotation chains, outermost time offset first.
        rotate: Vec<Vec<VarId>>,
    },
    /// Run `body` only when the condition variable tests true.
    Conditional {
        label: String,
        condition: VarId,
        body: Box<ExecNode>,
    },
    /// Move storage between recurrence-chain aliases (rename/promote entry).
    Rename {
        name: String,
        from: VarId,
        to: VarId,
    },
    /// Install storage for a variable (via its rule's container factory).
    Allocate {
        name: String,
        var: VarId,
        set: EntitySet,
        factory: Option<ContainerFactory>,
    },
    /// Drop a variable's storage after its last reader.
    Free { name: String, var: VarId },
}

/// Truth test on a condition variable: a `u8` flag container that is
/// non-empty and all-nonzero. An empty domain tests false, so loops whose
/// termination flag has not been produced yet keep running.
pub fn test_condition(facts: &dyn FactStore, var: VarId) -> Result<bool, RuleMeshError> {
    let c = facts.get_variable(var)?;
    let flags = c
        .as_any()
        .downcast_ref::<SliceContainer<u8>>()
        .ok_or_else(|| {
            RuleMeshError::InvariantViolation(format!("condition {var:?} is not a u8 flag store"))
        })?;
    let dom = flags.domain();
    if dom.is_empty() {
        return Ok(false);
    }
    Ok(dom.iter().all(|e| flags.get(e).is_some_and(|&v| v != 0)))
}

impl ExecNode {
    /// Execute this node against `facts`, exchanging over `comm`.
    pub fn execute<C: Communicator>(
        &self,
        facts: &mut dyn FactStore,
        comm: &C,
    ) -> Result<(), RuleMeshError> {
        match self {
            ExecNode::Rule { name, imp, exec } => {
                trace!("rule {name} over {exec:?}");
                imp.compute(facts, exec)
            }
            ExecNode::ParallelPartition { name, imp, parts } => {
                trace!("rule {name} over {} partitions", parts.len());
                run_partitions(name, imp.as_ref(), parts, facts)
            }
            ExecNode::Communication { label, plan, tag } => {
                trace!("comm {label}: {} peers", plan.len());
                execute_comm(facts, plan, comm, *tag)
            }
            ExecNode::Reduction {
                label,
                var,
                join,
                sends,
                recvs,
                probe,
            } => {
                trace!("reduce {label}");
                let mut p = probe.lock();
                execute_comm_reduce(facts, *var, join.as_ref(), sends, recvs, comm, &mut p)
            }
            ExecNode::GroupReduce {
                label,
                var,
                set,
                join,
            } => {
                trace!("all-reduce {label} over {set:?}");
                let c = facts.get_variable(*var)?;
                let mut packed = vec![0u8; c.pack_size(set)];
                let mut pos = 0;
                c.pack(&mut packed, &mut pos, set)?;
                let combined = group_all_reduce(comm, join.as_ref(), packed)?;
                let c = facts.get_variable_mut(*var)?;
                let mut pos = 0;
                c.unpack(&combined, &mut pos, set)
            }
            ExecNode::Sequence(children) => {
                for child in children {
                    child.execute(facts, comm)?;
                }
                Ok(())
            }
            ExecNode::Loop {
                level,
                advance,
                collapse,
                condition,
                rotate,
            } => {
                let mut iter = 0usize;
                loop {
                    advance.execute(facts, comm)?;
                    collapse.execute(facts, comm)?;
                    iter += 1;
                    if test_condition(facts, *condition)? {
                        debug!("loop over `{level}` terminated after {iter} iterations");
                        return Ok(());
                    }
                    for chain in rotate {
                        // Shift each value one offset down; the outermost
                        // buffer is recycled for the next iteration's write.
                        for i in (1..chain.len()).rev() {
                            facts.swap_facts(chain[i], chain[i - 1])?;
                        }
                    }
                }
            }
            ExecNode::Conditional {
                label,
                condition,
                body,
            } => {
                if test_condition(facts, *condition)? {
                    body.execute(facts, comm)
                } else {
                    trace!("conditional {label} skipped");
                    Ok(())
                }
            }
            ExecNode::Rename { name, from, to } => {
                trace!("rename {name}");
                facts.rename_fact(*from, *to)
            }
            ExecNode::Allocate {
                name,
                var,
                set,
                factory,
            } => {
                if facts.get_variable(*var).is_err() {
                    let f = factory.as_ref().ok_or_else(|| {
                        RuleMeshError::InvariantViolation(format!(
                            "no container factory to allocate `{name}`"
                        ))
                    })?;
                    facts.create_fact(*var, f());
                }
                facts.get_variable_mut(*var)?.allocate(set);
                Ok(())
            }
            ExecNode::Free { name, var } => {
                trace!("free {name}");
                facts.delete_fact(*var);
                Ok(())
            }
        }
    }

    /// Render the schedule tree, one node per line.
    pub fn print(&self, out: &mut String, indent: usize) {
        use std::fmt::Write;
        let pad = "  ".repeat(indent);
        match self {
            ExecNode::Rule { name, exec, .. } => {
                let _ = writeln!(out, "{pad}rule {name} over {exec:?}");
            }
            ExecNode::ParallelPartition { name, parts, .. } => {
                let _ = writeln!(out, "{pad}rule {name} on {} threads", parts.len());
            }
            ExecNode::Communication { label, plan, .. } => {
                let _ = writeln!(out, "{pad}comm {label} ({} peers)", plan.len());
            }
            ExecNode::Reduction { label, .. } => {
                let _ = writeln!(out, "{pad}reduce {label}");
            }
            ExecNode::GroupReduce { label, set, .. } => {
                let _ = writeln!(out, "{pad}all-reduce {label} over {set:?}");
            }
            ExecNode::Sequence(children) => {
                let _ = writeln!(out, "{pad}seq {{");
                for child in children {
                    child.print(out, indent + 1);
                }
                let _ = writeln!(out, "{pad}}}");
            }
            ExecNode::Loop {
                level,
                advance,
                collapse,
                rotate,
                ..
            } => {
                let _ = writeln!(out, "{pad}loop over `{level}` {{");
                advance.print(out, indent + 1);
                collapse.print(out, indent + 1);
                if !rotate.is_empty() {
                    let _ = writeln!(out, "{pad}  rotate {} chains", rotate.len());
                }
                let _ = writeln!(out, "{pad}}}");
            }
            ExecNode::Conditional { label, body, .. } => {
                let _ = writeln!(out, "{pad}if {label} {{");
                body.print(out, indent + 1);
                let _ = writeln!(out, "{pad}}}");
            }
            ExecNode::Rename { name, .. } => {
                let _ = writeln!(out, "{pad}rename {name}");
            }
            ExecNode::Allocate { name, set, .. } => {
                let _ = writeln!(out, "{pad}alloc {name} over {set:?}");
            }
            ExecNode::Free { name, .. } => {
                let _ = writeln!(out, "{pad}free {name}");
            }
        }
    }

    /// Flattened count of leaf (non-structural) nodes; used in diagnostics.
    pub fn leaf_count(&self) -> usize {
        match self {
            ExecNode::Sequence(children) => children.iter().map(|c| c.leaf_count()).sum(),
            ExecNode::Loop {
                advance, collapse, ..
            } => advance.leaf_count() + collapse.leaf_count(),
            ExecNode::Conditional { body, .. } => body.leaf_count(),
            _ => 1,
        }
    }
}

impl fmt::Display for ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.print(&mut s, 0);
        f.write_str(&s)
    }
}

#[cfg(feature = "rayon")]
fn run_partitions(
    name: &str,
    imp: &dyn RuleImpl,
    parts: &[EntitySet],
    facts: &mut dyn FactStore,
) -> Result<(), RuleMeshError> {
    if parts.is_empty() {
        return Err(RuleMeshError::EmptyPartition(name.to_string()));
    }
    if !imp.thread_safe() {
        for part in parts {
            imp.compute(facts, part)?;
        }
        return Ok(());
    }
    // Containers are not internally synchronized, so partitions serialize on
    // the store lock; bodies overlap whatever work they do outside it.
    let store = Mutex::new(facts);
    let first_err: Mutex<Option<RuleMeshError>> = Mutex::new(None);
    rayon::scope(|s| {
        for part in parts {
            let store = &store;
            let first_err = &first_err;
            s.spawn(move |_| {
                let mut guard = store.lock();
                if let Err(e) = imp.compute(&mut **guard, part) {
                    first_err.lock().get_or_insert(e);
                }
            });
        }
    });
    match first_err.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(not(feature = "rayon"))]
fn run_partitions(
    name: &str,
    imp: &dyn RuleImpl,
    parts: &[EntitySet],
    facts: &mut dyn FactStore,
) -> Result<(), RuleMeshError> {
    if parts.is_empty() {
        return Err(RuleMeshError::EmptyPartition(name.to_string()));
    }
    for part in parts {
        imp.compute(facts, part)?;
    }
    Ok(())
}
