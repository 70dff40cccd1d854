//! Rotate-list analysis for loop supernodes.
//!
//! A variable appearing at more than one time offset of the loop's level
//! (`x{n}`, `x{n+1}`) rotates: at the end of every iteration each offset's
//! storage shifts one step down, so the loop allocates one buffer per offset
//! once instead of reallocating per iteration. Level variables seen at a
//! single offset are loop-common.

use crate::entity::{VarId, Variable, VariableRegistry};
use crate::facts::sched_db::SchedDb;
use itertools::Itertools;
use std::collections::BTreeMap;

/// Group `members` (variables appearing in one loop) by storage identity.
/// Returns rotation chains (outermost offset first) and loop-common level
/// variables.
pub fn rotate_lists(
    vars: &VariableRegistry,
    level: &str,
    members: &[VarId],
) -> (Vec<Vec<VarId>>, Vec<VarId>) {
    // Key: identity with the time offset stripped.
    let mut groups: BTreeMap<Variable, Vec<(i32, VarId)>> = BTreeMap::new();
    for &v in members {
        let Ok(desc) = vars.get(v) else { continue };
        let Some(t) = &desc.time else { continue };
        if t.level != level {
            continue;
        }
        let mut key = desc.clone();
        if let Some(kt) = key.time.as_mut() {
            kt.offset = 0;
        }
        groups.entry(key).or_default().push((t.offset, v));
    }

    let mut rotate = Vec::new();
    let mut common = Vec::new();
    for (_, offsets) in groups {
        // Offset descending: the outermost buffer heads its chain.
        let mut chain: Vec<(i32, VarId)> = offsets
            .into_iter()
            .sorted_unstable_by(|a, b| b.0.cmp(&a.0))
            .dedup_by(|a, b| a.0 == b.0)
            .collect();
        if chain.len() > 1 {
            rotate.push(chain.into_iter().map(|(_, v)| v).collect());
        } else if let Some((_, v)) = chain.pop() {
            common.push(v);
        }
    }
    (rotate, common)
}

/// Record rotation partnerships in the scheduling database.
pub fn record_rotations(sched: &mut SchedDb, chains: &[Vec<VarId>]) {
    for chain in chains {
        for pair in chain.windows(2) {
            sched.add_rotation(pair[0], pair[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_offset_variables_rotate_single_offset_are_common() {
        let mut vars = VariableRegistry::new();
        let x0 = vars.intern(Variable::named("x").at("n", 0));
        let x1 = vars.intern(Variable::named("x").at("n", 1));
        let done = vars.intern(Variable::named("done").at("n", 0));
        let other = vars.intern(Variable::named("y").at("m", 0)); // wrong level
        let plain = vars.intern(Variable::named("p")); // no time

        let (rotate, common) = rotate_lists(&vars, "n", &[x0, x1, done, other, plain]);
        assert_eq!(rotate, vec![vec![x1, x0]]); // outermost offset first
        assert_eq!(common, vec![done]);
    }

    #[test]
    fn namespaces_keep_groups_apart() {
        let mut vars = VariableRegistry::new();
        let a0 = vars.intern(Variable::named("x").in_namespace("fluid").at("n", 0));
        let a1 = vars.intern(Variable::named("x").in_namespace("fluid").at("n", 1));
        let b0 = vars.intern(Variable::named("x").in_namespace("solid").at("n", 0));
        let (rotate, common) = rotate_lists(&vars, "n", &[a0, a1, b0]);
        assert_eq!(rotate, vec![vec![a1, a0]]);
        assert_eq!(common, vec![b0]);
    }
}
