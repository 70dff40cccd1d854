//! Forward existence analysis.
//!
//! For each rule, in topological order: the *context* is the entity set over
//! which the rule could execute — the intersection over its source clauses
//! of existing entities pulled back through the clause mapping chains.
//! Constraints narrow the context; a constraint shortfall is a diagnostic,
//! not an error. Target existence is the forward image of the context
//! through each target chain, accumulated per producing rule in the
//! scheduling database.

use crate::compile::context::CompilerContext;
use crate::entity::{EntitySet, VarId};
use crate::facts::rule::{Clause, RuleClass, RuleId};
use crate::rule_error::RuleMeshError;
use log::warn;

/// Pull `set` back through a mapping chain (innermost level first). Each
/// level is a set of relations whose preimages union. `strict` selects the
/// intersection preimage (existence: every accessed image must be present);
/// otherwise the union preimage (requests: any image suffices).
pub fn pull_back(
    ctx: &CompilerContext,
    mapping: &[Vec<VarId>],
    set: &EntitySet,
    strict: bool,
) -> Result<EntitySet, RuleMeshError> {
    let mut cur = set.clone();
    for level in mapping.iter().rev() {
        let mut next = EntitySet::new();
        for &m in level {
            let pre = ctx.facts.preimage(m, &cur)?;
            next.union_with(if strict { &pre.intersection } else { &pre.union });
        }
        cur = next;
    }
    Ok(cur)
}

/// Push `set` forward through a mapping chain (outermost level first).
pub fn push_forward(
    ctx: &CompilerContext,
    mapping: &[Vec<VarId>],
    set: &EntitySet,
) -> Result<EntitySet, RuleMeshError> {
    let mut cur = set.clone();
    for level in mapping {
        let mut next = EntitySet::new();
        for &m in level {
            next.union_with(&ctx.facts.image(m, &cur)?);
        }
        cur = next;
    }
    Ok(cur)
}

/// Entities at which this clause's variables exist, seen from the rule's
/// side of the mapping chain.
pub fn clause_existence(
    ctx: &CompilerContext,
    clause: &Clause,
) -> Result<EntitySet, RuleMeshError> {
    let mut exist = EntitySet::new();
    for &v in &clause.vars {
        exist.union_with(ctx.sched.existence(v));
    }
    pull_back(ctx, &clause.mapping, &exist, true)
}

/// Forward pass for one rule: compute its context and accumulate target
/// existence (and, in distributed mode, shadow sets).
pub fn set_rule_existence(ctx: &mut CompilerContext, id: RuleId) -> Result<(), RuleMeshError> {
    let r = ctx.rules.get(id)?;

    let mut context = match r.class {
        // Unit rules produce over the whole universe regardless of sources.
        RuleClass::Unit => EntitySet::universe(),
        // Singleton rules produce one parameter-like value at entity 0.
        RuleClass::Singleton => EntitySet::singleton(0),
        _ => {
            let mut c: Option<EntitySet> = None;
            for clause in &r.sources {
                let e = clause_existence(ctx, clause)?;
                c = Some(match c {
                    Some(acc) => acc.intersect(&e),
                    None => e,
                });
            }
            c.unwrap_or_else(EntitySet::universe)
        }
    };

    for clause in &r.constraints {
        let have = clause_existence(ctx, clause)?;
        if !context.is_subset_of(&have) {
            let short = context.difference(&have);
            warn!(
                "rule `{}` cannot satisfy a constraint over {} entities (e.g. {:?}); continuing on the achievable subset",
                r.name,
                short.size(),
                short.min()
            );
            context = context.intersect(&have);
        }
    }

    for clause in &r.targets {
        let produced = push_forward(ctx, &clause.mapping, &context)?;
        for &v in &clause.vars {
            ctx.sched.add_existence(v, id, &produced);
            if let Some(dist) = ctx.facts.distribute_info() {
                // Fill step: entities of this variable that will exist
                // globally but are owned elsewhere become shadow entities.
                let shadow = dist.not_owned(&produced).intersect(&dist.clone_region());
                ctx.sched.add_shadow(v, &shadow);
            }
        }
    }

    ctx.set_context(id, context);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::context::CompileOptions;
    use crate::entity::{Variable, VariableRegistry};
    use crate::facts::container::MapContainer;
    use crate::facts::rule::{RuleDatabase, RuleDescriptor};
    use crate::facts::store::{FactStore, InMemoryFacts};

    #[test]
    fn context_is_intersection_of_pulled_back_sources() {
        // Rule reads a directly and b through relation m (e -> e + 10).
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let b = vars.intern(Variable::named("b"));
        let m = vars.intern(Variable::named("m"));
        let out = vars.intern(Variable::named("out"));

        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("r", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .source(Clause::mapped([b], [[m]]))
                .target(Clause::direct([out])),
        );

        let mut facts = InMemoryFacts::new();
        facts.create_fact(
            m,
            Box::new(MapContainer::from_pairs((0..20).map(|e| (e, e + 10)))),
        );

        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 9));
        // b exists at 13..=25, so through m it covers rule entities 3..=15.
        ctx.sched.seed_existence(b, &EntitySet::from_interval(13, 25));

        set_rule_existence(&mut ctx, id).unwrap();
        assert_eq!(ctx.context_of(id), &EntitySet::from_interval(3, 9));
        assert_eq!(ctx.sched.existence(out), &EntitySet::from_interval(3, 9));
        assert_eq!(
            ctx.sched.rule_existence(out, id),
            &EntitySet::from_interval(3, 9)
        );
    }

    #[test]
    fn constraint_shortfall_narrows_not_fails() {
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let c = vars.intern(Variable::named("c"));
        let out = vars.intern(Variable::named("out"));
        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("r", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .constraint(Clause::direct([c]))
                .target(Clause::direct([out])),
        );
        let facts = InMemoryFacts::new();
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 9));
        ctx.sched.seed_existence(c, &EntitySet::from_interval(5, 9));
        set_rule_existence(&mut ctx, id).unwrap();
        assert_eq!(ctx.context_of(id), &EntitySet::from_interval(5, 9));
    }

    #[test]
    fn mapped_target_produces_forward_image() {
        let mut vars = VariableRegistry::new();
        let a = vars.intern(Variable::named("a"));
        let m = vars.intern(Variable::named("m"));
        let out = vars.intern(Variable::named("out"));
        let mut rules = RuleDatabase::new();
        let id = rules.add_rule(
            RuleDescriptor::concrete("scatter", RuleClass::Pointwise)
                .source(Clause::direct([a]))
                .target(Clause::mapped([out], [[m]])),
        );
        let mut facts = InMemoryFacts::new();
        facts.create_fact(
            m,
            Box::new(MapContainer::from_pairs((0..5).map(|e| (e, e * 2)))),
        );
        let mut ctx = CompilerContext::new(&rules, &vars, &facts, CompileOptions::default());
        ctx.sched.seed_existence(a, &EntitySet::from_interval(0, 4));
        set_rule_existence(&mut ctx, id).unwrap();
        assert_eq!(
            ctx.sched.existence(out),
            &EntitySet::from_intervals([(0, 0), (2, 2), (4, 4), (6, 6), (8, 8)])
        );
    }
}
