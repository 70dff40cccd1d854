//! Compiler context: all per-schedule state, threaded through every pass.
//!
//! There is no global mutable state anywhere in the compiler; one context is
//! built per `generate_schedule` call and dropped with the finished plan.

use crate::entity::{EntitySet, VarId, VariableRegistry};
use crate::exec::comm_sched::CommInfo;
use crate::facts::rule::{RuleDatabase, RuleId};
use crate::facts::sched_db::SchedDb;
use crate::facts::store::FactStore;
use std::collections::BTreeMap;

/// Ordering of a rule's computation relative to its precommunication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlanOrdering {
    /// Computation first, then precommunication (legacy plan shape).
    Observed,
    /// Precommunication first, then computation.
    Documented,
}

/// Knobs for one schedule compilation.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub ordering: PlanOrdering,
    /// Partition count for thread-safe rules; `<= 1` disables partitioning.
    pub thread_parts: usize,
    /// Minimum execution-set size before a rule is worth partitioning.
    pub parallel_threshold: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            ordering: PlanOrdering::Observed,
            thread_parts: 1,
            parallel_threshold: 1024,
        }
    }
}

/// Per-schedule compiler state.
pub struct CompilerContext<'a> {
    pub rules: &'a RuleDatabase,
    pub vars: &'a VariableRegistry,
    pub facts: &'a dyn FactStore,
    pub sched: SchedDb,
    pub opts: CompileOptions,
    pub rank: usize,
    pub size: usize,
    /// Existence context per rule (forward pass).
    contexts: BTreeMap<RuleId, EntitySet>,
    /// Final execution set per rule (backward pass, locally restricted).
    exec: BTreeMap<RuleId, EntitySet>,
    /// Derived precommunication lists per rule.
    pub precomm: BTreeMap<RuleId, Vec<CommInfo>>,
    /// Derived postcommunication lists per rule.
    pub postcomm: BTreeMap<RuleId, Vec<CommInfo>>,
    next_tag: u16,
}

impl<'a> CompilerContext<'a> {
    pub fn new(
        rules: &'a RuleDatabase,
        vars: &'a VariableRegistry,
        facts: &'a dyn FactStore,
        opts: CompileOptions,
    ) -> Self {
        let (rank, size) = facts
            .distribute_info()
            .map(|d| (d.rank, d.size))
            .unwrap_or((0, 1));
        CompilerContext {
            rules,
            vars,
            facts,
            sched: SchedDb::new(),
            opts,
            rank,
            size,
            contexts: BTreeMap::new(),
            exec: BTreeMap::new(),
            precomm: BTreeMap::new(),
            postcomm: BTreeMap::new(),
            // Tags below 0x0200 are reserved for reduction control traffic.
            next_tag: 0x0200,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.size > 1
    }

    pub fn set_context(&mut self, rule: RuleId, set: EntitySet) {
        self.contexts.insert(rule, set);
    }

    pub fn context_of(&self, rule: RuleId) -> &EntitySet {
        self.contexts.get(&rule).unwrap_or(EntitySet::empty_ref())
    }

    pub fn set_exec(&mut self, rule: RuleId, set: EntitySet) {
        self.exec.insert(rule, set);
    }

    pub fn exec_of(&self, rule: RuleId) -> &EntitySet {
        self.exec.get(&rule).unwrap_or(EntitySet::empty_ref())
    }

    /// Allocate a tag pair for one communication node (size + data stage).
    pub fn alloc_tag(&mut self) -> u16 {
        let t = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(2);
        t
    }

    /// Entities a variable needs local storage for: its local existence and
    /// requests plus any ghost entities received from other ranks.
    pub fn local_need(&self, var: VarId) -> EntitySet {
        let mut need = self.sched.existence(var).clone();
        need.union_with(self.sched.requests(var));
        if let Some(dist) = self.facts.distribute_info() {
            let mut local = dist.my_entities.clone();
            local.union_with(&dist.clone_region());
            need = need.intersect(&local);
            need.union_with(&self.sched.try_record(var).map_or(EntitySet::EMPTY, |r| {
                r.shadow.intersect(&dist.clone_region())
            }));
        }
        need
    }

    /// Reset derived communication lists (re-run of the request pass).
    pub fn clear_comm(&mut self) {
        self.precomm.clear();
        self.postcomm.clear();
    }
}
