//! Scheduling metadata store: per-variable bookkeeping for one compile.
//!
//! Records are created lazily on first reference, owned by the scheduling
//! pass, and discarded with the [`SchedDb`] once the execution plan has been
//! generated. Actual values live in the fact store; only scheduling facts
//! (existence, requests, aliasing, rotation, duplication policy) live here.

use crate::entity::{EntitySet, VarId};
use crate::facts::rule::RuleId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Duplication-policy bits controlling distributed work replication.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DupPolicy {
    /// Allow recomputing this variable on ranks that ghost it, trading
    /// duplicated work for suppressed communication.
    pub work_duplication: bool,
    /// Allow reduction-side combining of remote contributions.
    pub comm_reduction: bool,
}

/// Scheduling record for one variable.
#[derive(Clone, Debug, Default)]
pub struct VarSched {
    /// Entities each producing rule can compute (existence per rule).
    pub existence_by_rule: BTreeMap<RuleId, EntitySet>,
    /// Union over all producing rules.
    pub existence: EntitySet,
    /// Aggregated request: entities some consumer needs.
    pub requests: EntitySet,
    /// Entities needed locally but owned by another rank.
    pub shadow: EntitySet,
    /// Variables sharing this variable's storage (priority/namespace twins).
    pub synonyms: BTreeSet<VarId>,
    /// Recurrence aliases (rename/promote/generalize/priority chains).
    pub aliases: BTreeSet<VarId>,
    /// Rotation partners inside a loop supernode.
    pub rotations: BTreeSet<VarId>,
    pub policy: DupPolicy,
}

/// Thin scheduling-metadata store keyed by variable.
#[derive(Default, Debug)]
pub struct SchedDb {
    records: HashMap<VarId, VarSched>,
}

impl SchedDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `var`, created empty on first touch.
    pub fn record(&mut self, var: VarId) -> &mut VarSched {
        self.records.entry(var).or_default()
    }

    pub fn try_record(&self, var: VarId) -> Option<&VarSched> {
        self.records.get(&var)
    }

    /// Aggregated existence; empty for untouched variables.
    pub fn existence(&self, var: VarId) -> &EntitySet {
        self.records
            .get(&var)
            .map(|r| &r.existence)
            .unwrap_or(EntitySet::empty_ref())
    }

    /// Aggregated request; empty for untouched variables.
    pub fn requests(&self, var: VarId) -> &EntitySet {
        self.records
            .get(&var)
            .map(|r| &r.requests)
            .unwrap_or(EntitySet::empty_ref())
    }

    /// Existence contributed by one producing rule.
    pub fn rule_existence(&self, var: VarId, rule: RuleId) -> &EntitySet {
        self.records
            .get(&var)
            .and_then(|r| r.existence_by_rule.get(&rule))
            .unwrap_or(EntitySet::empty_ref())
    }

    /// Record that `rule` can produce `set` of `var`, accumulating the
    /// aggregate existence.
    pub fn add_existence(&mut self, var: VarId, rule: RuleId, set: &EntitySet) {
        let rec = self.record(var);
        rec.existence.union_with(set);
        rec.existence_by_rule
            .entry(rule)
            .or_default()
            .union_with(set);
    }

    /// Seed existence with no producing rule (given facts).
    pub fn seed_existence(&mut self, var: VarId, set: &EntitySet) {
        self.record(var).existence.union_with(set);
    }

    pub fn add_request(&mut self, var: VarId, set: &EntitySet) {
        self.record(var).requests.union_with(set);
    }

    pub fn add_shadow(&mut self, var: VarId, set: &EntitySet) {
        self.record(var).shadow.union_with(set);
    }

    /// Register `a` and `b` as synonyms of one storage location.
    pub fn add_synonym(&mut self, a: VarId, b: VarId) {
        self.record(a).synonyms.insert(b);
        self.record(b).synonyms.insert(a);
    }

    pub fn add_alias(&mut self, from: VarId, to: VarId) {
        self.record(from).aliases.insert(to);
        self.record(to).aliases.insert(from);
    }

    pub fn add_rotation(&mut self, a: VarId, b: VarId) {
        self.record(a).rotations.insert(b);
        self.record(b).rotations.insert(a);
    }

    /// Variables touched so far, in id order for deterministic iteration.
    pub fn touched(&self) -> Vec<VarId> {
        let mut vars: Vec<_> = self.records.keys().copied().collect();
        vars.sort_unstable();
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existence_accumulates_per_rule_and_aggregate() {
        let mut db = SchedDb::new();
        let v = VarId(3);
        db.add_existence(v, RuleId(0), &EntitySet::from_interval(0, 4));
        db.add_existence(v, RuleId(1), &EntitySet::from_interval(3, 9));
        assert_eq!(db.existence(v), &EntitySet::from_interval(0, 9));
        assert_eq!(
            db.rule_existence(v, RuleId(0)),
            &EntitySet::from_interval(0, 4)
        );
        assert!(db.rule_existence(v, RuleId(9)).is_empty());
    }

    #[test]
    fn untouched_variables_read_as_empty() {
        let db = SchedDb::new();
        assert!(db.existence(VarId(42)).is_empty());
        assert!(db.requests(VarId(42)).is_empty());
    }

    #[test]
    fn synonyms_are_symmetric() {
        let mut db = SchedDb::new();
        let (a, b) = (VarId(0), VarId(1));
        db.add_synonym(a, b);
        assert!(db.try_record(a).unwrap().synonyms.contains(&b));
        assert!(db.try_record(b).unwrap().synonyms.contains(&a));
    }
}
