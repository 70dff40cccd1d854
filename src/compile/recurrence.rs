//! Recurrence-chain analysis: collapse rename/promote/generalize/priority
//! rules into storage-sharing chains.
//!
//! These internal rules never compute values; they declare that two
//! variables are the same storage seen through a different name, time level,
//! specificity, or priority. A union-find over variable ids groups each
//! chain; execution moves the container along the chain (see
//! `ExecNode::Rename`), so only the chain's final holder owns storage worth
//! freeing.

use crate::entity::VarId;
use crate::facts::rule::{Qualifier, RuleDatabase};
use crate::facts::sched_db::SchedDb;

/// Union-find over variable ids; representative is the smallest id in each
/// chain so results are deterministic.
pub struct RecurrenceChains {
    parent: Vec<u32>,
    /// Vars that appear as the *source* of some recurrence rule: their
    /// storage moves away, so they are never freed.
    moved: Vec<bool>,
    /// Vars that appear as the *target* of some recurrence rule: their
    /// storage arrives by a move instead of an allocation.
    received: Vec<bool>,
}

impl RecurrenceChains {
    /// Scan `rules` for recurrence-qualified rules, recording each
    /// source→target pair as an alias in `sched` and merging chains.
    pub fn analyze(rules: &RuleDatabase, sched: &mut SchedDb, num_vars: usize) -> Self {
        let mut chains = RecurrenceChains {
            parent: (0..num_vars as u32).collect(),
            moved: vec![false; num_vars],
            received: vec![false; num_vars],
        };
        for (_, r) in rules.iter() {
            if !r.qualifier.is_recurrence() {
                continue;
            }
            // Generalize/priority links relate two *names* for one storage
            // location; rename/promote links relate two *times* of one value.
            let synonym = matches!(r.qualifier, Qualifier::Generalize | Qualifier::Priority);
            for src in r.input_vars() {
                for dst in r.output_vars() {
                    chains.union(src, dst);
                    chains.moved[src.0 as usize] = true;
                    chains.received[dst.0 as usize] = true;
                    sched.add_alias(src, dst);
                    if synonym {
                        sched.add_synonym(src, dst);
                    }
                }
            }
        }
        chains
    }

    pub fn representative(&self, v: VarId) -> VarId {
        let mut cur = v.0;
        while self.parent[cur as usize] != cur {
            cur = self.parent[cur as usize];
        }
        VarId(cur)
    }

    pub fn same_chain(&self, a: VarId, b: VarId) -> bool {
        self.representative(a) == self.representative(b)
    }

    /// Whether this variable's storage moves down the chain (it is a
    /// recurrence source and must not be freed or reallocated).
    pub fn storage_moves_from(&self, v: VarId) -> bool {
        self.moved.get(v.0 as usize).copied().unwrap_or(false)
    }

    /// Whether this variable's storage arrives by a chain move rather than
    /// an allocation.
    pub fn arrives_by_move(&self, v: VarId) -> bool {
        self.received.get(v.0 as usize).copied().unwrap_or(false)
    }

    /// Variables where a chain's storage comes to rest: moved in, never
    /// moved out. These own storage despite never being allocated.
    pub fn final_holders(&self) -> Vec<VarId> {
        (0..self.parent.len() as u32)
            .map(VarId)
            .filter(|&v| self.arrives_by_move(v) && !self.storage_moves_from(v))
            .collect()
    }

    /// All members of `v`'s chain, ascending.
    pub fn chain_members(&self, v: VarId) -> Vec<VarId> {
        let rep = self.representative(v);
        (0..self.parent.len() as u32)
            .map(VarId)
            .filter(|&m| self.representative(m) == rep)
            .collect()
    }

    fn union(&mut self, a: VarId, b: VarId) {
        let (ra, rb) = (self.representative(a), self.representative(b));
        if ra == rb {
            return;
        }
        // Smaller id wins as representative.
        let (keep, fold) = if ra.0 < rb.0 { (ra, rb) } else { (rb, ra) };
        self.parent[fold.0 as usize] = keep.0;
    }
}
