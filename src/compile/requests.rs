//! Backward request propagation.
//!
//! Walking rules in reverse topological order: a rule's *requested* set is
//! the union over its target clauses of downstream requests pulled back
//! through the target chains, intersected with the rule's existence context.
//! That set, restricted to locally owned entities in distributed mode, is
//! the rule's final execution set. Requests are then pushed forward through
//! every source and constraint clause into the variables the rule reads.
//! Distributed rules also derive their pre- and postcommunication lists
//! here, identically on every rank.

use crate::compile::context::CompilerContext;
use crate::compile::existential::{pull_back, push_forward};
use crate::entity::EntitySet;
use crate::exec::comm_sched::{postcomm_plan, precomm_plan};
use crate::facts::rule::{Qualifier, RuleClass, RuleId};
use crate::rule_error::RuleMeshError;
use log::trace;

/// Whether a rule's execution set is split across ranks (entity-parallel) or
/// replicated whole on every rank.
fn entity_parallel(class: RuleClass) -> bool {
    !matches!(class, RuleClass::Unit | RuleClass::Singleton)
}

/// Backward pass for one rule.
pub fn process_rule_requests(ctx: &mut CompilerContext, id: RuleId) -> Result<(), RuleMeshError> {
    let r = ctx.rules.get(id)?;

    // Requests pulled back from target variables.
    let mut requested = EntitySet::new();
    for clause in &r.targets {
        let mut req = EntitySet::new();
        for &v in &clause.vars {
            req.union_with(ctx.sched.requests(v));
        }
        requested.union_with(&pull_back(ctx, &clause.mapping, &req, false)?);
    }

    let exec_global = requested.intersect(ctx.context_of(id));
    if exec_global.is_empty() {
        trace!("rule `{}` is never requested; dropping from schedule", r.name);
        ctx.set_exec(id, EntitySet::new());
        return Ok(());
    }

    // Push requests into everything the rule reads, at the entities the
    // chain maps its execution set to.
    for clause in r.sources.iter().chain(r.constraints.iter()) {
        let needed = push_forward(ctx, &clause.mapping, &exec_global)?;
        for &v in &clause.vars {
            ctx.sched.add_request(v, &needed);
        }
        // Mapping relations themselves are read at the pre-image side.
        for level in &clause.mapping {
            for &m in level {
                ctx.sched.add_request(m, &exec_global);
            }
        }
    }
    if let Some(cond) = r.condition {
        ctx.sched.add_request(cond, &exec_global);
    }

    // Local restriction and communication derivation.
    let exec_local = match ctx.facts.distribute_info() {
        Some(dist) if entity_parallel(r.class) => exec_global.intersect(&dist.my_entities),
        _ => exec_global.clone(),
    };

    if ctx.is_distributed() && r.qualifier == Qualifier::Concrete && entity_parallel(r.class) {
        let dist = ctx
            .facts
            .distribute_info()
            .ok_or(RuleMeshError::NotDistributed("request analysis"))?;
        let mut pre = Vec::new();
        for clause in r.sources.iter().chain(r.constraints.iter()) {
            let needed = push_forward(ctx, &clause.mapping, &exec_global)?;
            for &v in &clause.vars {
                pre.extend(precomm_plan(dist, v, &needed));
            }
        }
        // Only mapped (scatter) targets can land values outside the owned
        // set; direct targets write at the execution entities themselves,
        // which are owned by construction. Overlapping multi-rank production
        // of one entity is the reduction path, not postcommunication.
        let mut post = Vec::new();
        for clause in r.targets.iter().filter(|c| !c.mapping.is_empty()) {
            let produced = push_forward(ctx, &clause.mapping, &exec_global)?;
            for &v in &clause.vars {
                post.extend(postcomm_plan(dist, v, &produced));
            }
        }
        if !pre.is_empty() {
            ctx.precomm.insert(id, pre);
        }
        if !post.is_empty() {
            ctx.postcomm.insert(id, post);
        }
    }

    ctx.set_exec(id, exec_local);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::context::CompileOptions;
    use crate::compile::existential::set_rule_existence;
    use crate::entity::{Variable, VariableRegistry};
    use crate::facts::rule::{Clause, RuleDatabase, RuleDescriptor};
    use crate::facts::store::{DistributeInfo, FactStore, InMemoryFacts};

    #[test]
    fn requests_flow_backward_and_restrict_exec() {
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let b = vars.intern(Variable::named("b"));
        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("a_to_b", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .target(Clause::direct([b])),
        );
        let facts = InMemoryFacts::new();
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 99));
        set_rule_existence(&mut ctx, id).unwrap();

        // Only part of b is wanted downstream.
        ctx.sched.add_request(b, &EntitySet::from_interval(10, 29));
        process_rule_requests(&mut ctx, id).unwrap();
        assert_eq!(ctx.exec_of(id), &EntitySet::from_interval(10, 29));
        assert_eq!(ctx.sched.requests(a), &EntitySet::from_interval(10, 29));
    }

    #[test]
    fn unrequested_rule_gets_empty_exec() {
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let b = vars.intern(Variable::named("b"));
        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("a_to_b", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .target(Clause::direct([b])),
        );
        let facts = InMemoryFacts::new();
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 9));
        set_rule_existence(&mut ctx, id).unwrap();
        process_rule_requests(&mut ctx, id).unwrap();
        assert!(ctx.exec_of(id).is_empty());
        assert!(ctx.sched.requests(a).is_empty());
    }

    #[test]
    fn distributed_rule_derives_mirrored_comm_lists() {
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let b = vars.intern(Variable::named("b"));
        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("a_to_b", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .target(Clause::direct([b])),
        );
        // Rank 0 of 2: owns 0..=49, ghosts 50..=59, peers ghost 40..=49.
        let dist = DistributeInfo {
            rank: 0,
            size: 2,
            my_entities: EntitySet::from_interval(0, 49),
            copy: vec![(1, EntitySet::from_interval(50, 59))],
            xmit: vec![(1, EntitySet::from_interval(40, 49))],
        };
        let facts = InMemoryFacts::distributed(dist);
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 99));
        set_rule_existence(&mut ctx, id).unwrap();
        ctx.sched.add_request(b, &EntitySet::from_interval(0, 99));
        process_rule_requests(&mut ctx, id).unwrap();

        // Exec restricted to owned entities.
        assert_eq!(ctx.exec_of(id), &EntitySet::from_interval(0, 49));
        // Precomm pulls ghost copies of a the global execution set needs.
        let pre = &ctx.precomm[&id];
        assert_eq!(pre[0].recv_seq, EntitySet::from_interval(50, 59));
        assert_eq!(pre[0].send_set, EntitySet::from_interval(40, 49));
        // A direct target writes only owned entities; nothing to scatter.
        assert!(!ctx.postcomm.contains_key(&id));
    }

    #[test]
    fn mapped_target_derives_postcomm_scatter() {
        use crate::facts::container::MapContainer;

        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let m = vars.intern(Variable::named("m"));
        let b = vars.intern(Variable::named("b"));
        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("scatter", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .target(Clause::mapped([b], [[m]])),
        );
        // m keeps 0..=39 in place and pushes 40..=69 across the cut.
        let dist = DistributeInfo {
            rank: 0,
            size: 2,
            my_entities: EntitySet::from_interval(0, 69),
            copy: vec![(1, EntitySet::from_interval(70, 99))],
            xmit: vec![(1, EntitySet::from_interval(40, 69))],
        };
        let mut facts = InMemoryFacts::distributed(dist);
        facts.create_fact(
            m,
            Box::new(MapContainer::from_pairs(
                (0..40).map(|e| (e, e)).chain((40..70).map(|e| (e, e + 30))),
            )),
        );
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 69));
        set_rule_existence(&mut ctx, id).unwrap();
        let exist_b = ctx.sched.existence(b).clone();
        ctx.sched.add_request(b, &exist_b);
        process_rule_requests(&mut ctx, id).unwrap();

        assert_eq!(ctx.exec_of(id), &EntitySet::from_interval(0, 69));
        // The image landing in the ghost region is scattered to its owner.
        let post = &ctx.postcomm[&id];
        assert_eq!(post[0].send_set, EntitySet::from_interval(70, 99));
        assert!(post[0].recv_seq.is_empty());
    }
}
