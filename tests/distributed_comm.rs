//! Distributed analysis and the two-stage exchange, simulated over
//! in-process ranks.

use rule_mesh::compile::{CompileOptions, PlanOrdering, generate_schedule};
use rule_mesh::entity::{EntitySet, VarId, Variable, VariableRegistry};
use rule_mesh::exec::{CommInfo, LocalComm, execute_comm, postcomm_plan, precomm_plan};
use rule_mesh::facts::{
    Clause, DistributeInfo, FactStore, FnRule, InMemoryFacts, MapContainer, RuleClass,
    RuleDatabase, RuleDescriptor, SliceContainer,
};
use serial_test::serial;
use std::sync::Arc;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 100 entities, 70/30 across two ranks: rank 0 ghosts all of rank 1's
/// entities, rank 1 ghosts the upper 30 of rank 0's.
fn split_70_30() -> (DistributeInfo, DistributeInfo) {
    let d0 = DistributeInfo {
        rank: 0,
        size: 2,
        my_entities: EntitySet::from_interval(0, 69),
        copy: vec![(1, EntitySet::from_interval(70, 99))],
        xmit: vec![(1, EntitySet::from_interval(40, 69))],
    };
    let d1 = DistributeInfo {
        rank: 1,
        size: 2,
        my_entities: EntitySet::from_interval(70, 99),
        copy: vec![(0, EntitySet::from_interval(40, 69))],
        xmit: vec![(0, EntitySet::from_interval(70, 99))],
    };
    (d0, d1)
}

#[test]
fn precomm_receives_exactly_the_missing_entities() {
    init_logs();
    let (d0, d1) = split_70_30();
    let v = VarId(0);
    // The rule needs all 100 entities; 30% of them live on the other rank.
    let requests = EntitySet::from_interval(0, 99);

    let p0 = precomm_plan(&d0, v, &requests);
    assert_eq!(p0.len(), 1);
    assert_eq!(p0[0].recv_seq, EntitySet::from_interval(70, 99));
    assert_eq!(p0[0].send_set, EntitySet::from_interval(40, 69));

    // The owner derives the mirror image from the same global request.
    let p1 = precomm_plan(&d1, v, &requests);
    assert_eq!(p1[0].send_set, p0[0].recv_seq);
    assert_eq!(p1[0].recv_seq, p0[0].send_set);
}

#[test]
fn postcomm_sends_only_entities_not_locally_owned() {
    init_logs();
    let (d0, _) = split_70_30();
    let v = VarId(0);
    // Production straddles the cut; only the non-owned part is scattered.
    let produced = EntitySet::from_interval(60, 99);
    let plan = postcomm_plan(&d0, v, &produced);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].send_set, EntitySet::from_interval(70, 99));
    assert!(plan[0].send_set.intersect(&d0.my_entities).is_empty());
}

#[test]
fn comm_info_serializes_for_plan_inspection() {
    let ci = CommInfo {
        var: VarId(3),
        proc: 1,
        send_set: EntitySet::from_interval(40, 69),
        recv_seq: EntitySet::from_intervals([(70, 79), (90, 99)]),
    };
    let bytes = bincode::serialize(&ci).unwrap();
    let back: CommInfo = bincode::deserialize(&bytes).unwrap();
    assert_eq!(back, ci);
}

#[test]
#[serial]
fn ghost_exchange_fills_the_clone_region() {
    init_logs();
    let (d0, d1) = split_70_30();
    let v = VarId(0);
    let world = LocalComm::world(2);

    let mut handles = Vec::new();
    for (dist, comm) in [d0, d1].into_iter().zip(world) {
        handles.push(std::thread::spawn(move || {
            let requests = EntitySet::from_interval(0, 99);
            let owned = dist.my_entities.clone();
            let ghosts = dist.clone_region();
            let plan = precomm_plan(&dist, v, &requests);
            let mut facts = InMemoryFacts::distributed(dist);
            facts.create_fact(
                v,
                Box::new(SliceContainer::from_fn(&owned, |e| e as f64 * 10.0)),
            );
            execute_comm(&mut facts, &plan, &comm, 0x0200).unwrap();

            let c = facts
                .get_variable(v)
                .unwrap()
                .as_any()
                .downcast_ref::<SliceContainer<f64>>()
                .unwrap();
            // Every ghost now carries its owner's value.
            for e in ghosts.iter() {
                assert_eq!(c.get(e), Some(&(e as f64 * 10.0)));
            }
            // Owned values are untouched.
            for e in owned.iter() {
                assert_eq!(c.get(e), Some(&(e as f64 * 10.0)));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

/// One rank of a two-rank stencil run: `b[e] = a[e] + a[e+1]` with `a`
/// reached through a neighbor relation, so the cut entities must arrive by
/// precommunication before the rule body runs.
fn stencil_rank(dist: DistributeInfo, comm: LocalComm) -> Vec<(i32, f64)> {
    let mut vars = VariableRegistry::new();
    let a = vars.intern(Variable::named("a"));
    let m = vars.intern(Variable::named("m"));
    let b = vars.intern(Variable::named("b"));

    let mut rules = RuleDatabase::new();
    rules.add_rule(
        RuleDescriptor::concrete("stencil", RuleClass::Pointwise)
            .source(Clause::mapped([a], [[m]]))
            .target(Clause::direct([b]))
            .body(Arc::new(FnRule::new(
                move |facts: &mut dyn FactStore, seq: &EntitySet| {
                    let sums: Vec<f64> = {
                        let c = facts
                            .get_variable(a)?
                            .as_any()
                            .downcast_ref::<SliceContainer<f64>>()
                            .unwrap();
                        seq.iter()
                            .map(|e| {
                                let n = if e == 99 { e } else { e + 1 };
                                c.get(e).unwrap() + c.get(n).unwrap()
                            })
                            .collect()
                    };
                    let c = facts
                        .get_variable_mut(b)?
                        .as_any_mut()
                        .downcast_mut::<SliceContainer<f64>>()
                        .unwrap();
                    for (e, v) in seq.iter().zip(sums) {
                        c.set(e, v);
                    }
                    Ok(())
                },
            )))
            .factory(b, || Box::new(SliceContainer::<f64>::new())),
    );

    let owned = dist.my_entities.clone();
    let mut facts = InMemoryFacts::distributed(dist);
    // Every rank allocates the full global domain so existence seeding is
    // identical everywhere; only owned values are meaningful until the
    // precommunication fills the ghosts.
    facts.create_fact(
        a,
        Box::new(SliceContainer::from_fn(
            &EntitySet::from_interval(0, 99),
            |e| if owned.contains(e) { e as f64 } else { 0.0 },
        )),
    );
    facts.create_fact(
        m,
        Box::new(MapContainer::from_pairs(
            (0..99).flat_map(|e| [(e, e), (e, e + 1)]).chain([(99, 99)]),
        )),
    );

    let opts = CompileOptions {
        ordering: PlanOrdering::Documented,
        ..Default::default()
    };
    let plan = generate_schedule(&mut rules, &vars, &facts, &[a, m], &[b], opts)
        .unwrap()
        .expect("stencil has a schedule");
    plan.execute(&mut facts, &comm).unwrap();

    let c = facts
        .get_variable(b)
        .unwrap()
        .as_any()
        .downcast_ref::<SliceContainer<f64>>()
        .unwrap();
    owned.iter().map(|e| (e, *c.get(e).unwrap())).collect()
}

#[test]
#[serial]
fn distributed_stencil_matches_serial_result() {
    init_logs();
    let (d0, d1) = split_70_30();
    let world = LocalComm::world(2);
    let mut handles = Vec::new();
    for (dist, comm) in [d0, d1].into_iter().zip(world) {
        handles.push(std::thread::spawn(move || stencil_rank(dist, comm)));
    }
    let mut results = Vec::new();
    for h in handles {
        results.extend(h.join().unwrap());
    }

    results.sort_by_key(|&(e, _)| e);
    assert_eq!(results.len(), 100);
    for (e, v) in results {
        let expect = if e == 99 { 198.0 } else { (2 * e + 1) as f64 };
        assert_eq!(v, expect, "entity {e}");
    }
}
