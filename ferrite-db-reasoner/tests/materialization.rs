//! End-to-end tests for full materialization and incremental maintenance.
//!
//! The central property: for any fact set, rule set, and update batch,
//! incremental maintenance must leave the store with exactly the fact set
//! a full re-materialization would produce.

use ferrite_db_core::{
    MemoryTupleTable, Rid, Tuple, TuplePattern, TupleStore, TUPLE_STATUS_EDB, TUPLE_STATUS_IDB,
    TUPLE_STATUS_IDB_MERGED,
};
use ferrite_db_reasoner::{
    Atom, DatalogEngine, Literal, NoopMonitor, ReasonerError, Rule, Term,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;

const PATH: u64 = 10;
const EDGE: u64 = 11;
const ROAD: u64 = 12;
const NODE: u64 = 13;
const START: u64 = 14;
const REACH: u64 = 15;
const UNREACHED: u64 = 16;

fn t(s: u64, p: u64, o: u64) -> Tuple {
    [Rid(s), Rid(p), Rid(o)]
}

fn var(name: &str) -> Term {
    Term::var(name)
}

fn atom(s: Term, p: u64, o: Term) -> Atom {
    Atom::new(s, Term::constant(Rid(p)), o)
}

/// path(X, Y) :- edge(X, Y).
/// path(X, Z) :- path(X, Y), edge(Y, Z).
fn path_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            vec![atom(var("X"), PATH, var("Y"))],
            vec![Literal::Atom(atom(var("X"), EDGE, var("Y")))],
        ),
        Rule::new(
            vec![atom(var("X"), PATH, var("Z"))],
            vec![
                Literal::Atom(atom(var("X"), PATH, var("Y"))),
                Literal::Atom(atom(var("Y"), EDGE, var("Z"))),
            ],
        ),
    ]
}

fn engine_with(facts: &[Tuple], rules: Vec<Rule>) -> DatalogEngine<MemoryTupleTable> {
    let store = Arc::new(MemoryTupleTable::new());
    for &fact in facts {
        store.assert_fact(fact, TUPLE_STATUS_EDB | TUPLE_STATUS_IDB);
    }
    let engine = DatalogEngine::new(store);
    engine.add_rules(rules).unwrap();
    engine
}

fn idb(store: &MemoryTupleTable) -> BTreeSet<Tuple> {
    store
        .matches(&TuplePattern::any())
        .into_iter()
        .filter(|(_, _, status)| {
            status & (TUPLE_STATUS_IDB | TUPLE_STATUS_IDB_MERGED) == TUPLE_STATUS_IDB
        })
        .map(|(_, tuple, _)| tuple)
        .collect()
}

/// Materialize the given facts and rules from scratch.
fn full_materialization(facts: &BTreeSet<Tuple>, rules: &[Rule]) -> BTreeSet<Tuple> {
    let facts: Vec<Tuple> = facts.iter().copied().collect();
    let engine = engine_with(&facts, rules.to_vec());
    engine.materialize(&NoopMonitor).unwrap();
    idb(engine.store())
}

#[test]
fn test_join_rule_materializes() {
    // p(X, Y) :- q(X, Z), r(Z, Y) with q(a, b), r(b, c) derives p(a, c).
    let rule = Rule::new(
        vec![atom(var("X"), 20, var("Y"))],
        vec![
            Literal::Atom(atom(var("X"), 21, var("Z"))),
            Literal::Atom(atom(var("Z"), 22, var("Y"))),
        ],
    );
    let engine = engine_with(&[t(1, 21, 2), t(2, 22, 3)], vec![rule]);
    engine.materialize(&NoopMonitor).unwrap();
    assert!(idb(engine.store()).contains(&t(1, 20, 3)));
}

#[test]
fn test_transitive_closure() {
    let engine = engine_with(
        &[t(1, EDGE, 2), t(2, EDGE, 3), t(3, EDGE, 4)],
        path_rules(),
    );
    engine.materialize(&NoopMonitor).unwrap();
    let materialized = idb(engine.store());
    for (from, to) in [(1, 2), (1, 3), (1, 4), (2, 3), (2, 4), (3, 4)] {
        assert!(materialized.contains(&t(from, PATH, to)), "path({from}, {to})");
    }
    assert_eq!(materialized.len(), 3 + 6);
}

#[test]
fn test_materialization_is_idempotent() {
    let engine = engine_with(&[t(1, EDGE, 2), t(2, EDGE, 3)], path_rules());
    engine.materialize(&NoopMonitor).unwrap();
    let first = idb(engine.store());
    engine.materialize(&NoopMonitor).unwrap();
    assert_eq!(first, idb(engine.store()));
}

#[test]
fn test_incremental_delete_and_reinsert() {
    // Deleting r(b, c) must delete p(a, c); re-inserting must re-derive it.
    let rule = Rule::new(
        vec![atom(var("X"), 20, var("Y"))],
        vec![
            Literal::Atom(atom(var("X"), 21, var("Z"))),
            Literal::Atom(atom(var("Z"), 22, var("Y"))),
        ],
    );
    let engine = engine_with(&[t(1, 21, 2), t(2, 22, 3)], vec![rule]);
    engine.materialize(&NoopMonitor).unwrap();
    assert!(idb(engine.store()).contains(&t(1, 20, 3)));

    assert!(engine.store().schedule_delete(t(2, 22, 3)));
    engine.update_incrementally(&NoopMonitor).unwrap();
    let after_delete = idb(engine.store());
    assert!(!after_delete.contains(&t(1, 20, 3)));
    assert!(!after_delete.contains(&t(2, 22, 3)));
    assert!(after_delete.contains(&t(1, 21, 2)));

    engine.store().schedule_insert(t(2, 22, 3)).unwrap();
    engine.update_incrementally(&NoopMonitor).unwrap();
    let after_reinsert = idb(engine.store());
    assert!(after_reinsert.contains(&t(1, 20, 3)));
    assert!(after_reinsert.contains(&t(2, 22, 3)));
}

#[test]
fn test_alternative_proof_survives_deletion() {
    // p is supported by both edge and road; deleting one support keeps p.
    let rules = vec![
        Rule::new(
            vec![atom(var("X"), PATH, var("Y"))],
            vec![Literal::Atom(atom(var("X"), EDGE, var("Y")))],
        ),
        Rule::new(
            vec![atom(var("X"), PATH, var("Y"))],
            vec![Literal::Atom(atom(var("X"), ROAD, var("Y")))],
        ),
    ];
    let engine = engine_with(&[t(1, EDGE, 2), t(1, ROAD, 2)], rules);
    engine.materialize(&NoopMonitor).unwrap();

    engine.store().schedule_delete(t(1, EDGE, 2));
    engine.update_incrementally(&NoopMonitor).unwrap();
    let facts = idb(engine.store());
    assert!(facts.contains(&t(1, PATH, 2)));
    assert!(!facts.contains(&t(1, EDGE, 2)));
}

#[test]
fn test_deep_chain_deletion_cascades() {
    let engine = engine_with(
        &[t(1, EDGE, 2), t(2, EDGE, 3), t(3, EDGE, 4), t(4, EDGE, 5)],
        path_rules(),
    );
    engine.materialize(&NoopMonitor).unwrap();
    assert!(idb(engine.store()).contains(&t(1, PATH, 5)));

    // Cutting the chain in the middle removes every path across the cut.
    engine.store().schedule_delete(t(2, EDGE, 3));
    engine.update_incrementally(&NoopMonitor).unwrap();
    let facts = idb(engine.store());
    for (from, to) in [(1, 3), (1, 4), (1, 5), (2, 3), (2, 4), (2, 5)] {
        assert!(!facts.contains(&t(from, PATH, to)), "path({from}, {to})");
    }
    for (from, to) in [(1, 2), (3, 4), (3, 5), (4, 5)] {
        assert!(facts.contains(&t(from, PATH, to)), "path({from}, {to})");
    }
}

#[test]
fn test_mutually_recursive_predicates_share_component() {
    // s(X, Y) :- t(X, Y) and t(X, Y) :- s(Y, X) form one component.
    let rules = vec![
        Rule::new(
            vec![atom(var("X"), 30, var("Y"))],
            vec![Literal::Atom(atom(var("X"), 31, var("Y")))],
        ),
        Rule::new(
            vec![atom(var("X"), 31, var("Y"))],
            vec![Literal::Atom(atom(var("Y"), 30, var("X")))],
        ),
        Rule::new(
            vec![atom(var("X"), 30, var("Y"))],
            vec![Literal::Atom(atom(var("X"), 32, var("Y")))],
        ),
    ];
    let engine = engine_with(&[t(1, 32, 2)], rules);
    engine.materialize(&NoopMonitor).unwrap();
    assert_eq!(
        engine.component_level(&t(1, 30, 2)),
        engine.component_level(&t(1, 31, 2))
    );
    let facts = idb(engine.store());
    assert!(facts.contains(&t(1, 30, 2)));
    assert!(facts.contains(&t(2, 31, 1)));
    assert!(facts.contains(&t(2, 30, 1)));
    assert!(facts.contains(&t(1, 31, 2)));
}

#[test]
fn test_unstratified_program_is_rejected() {
    // p(X) :- q(X), NOT p(X).
    let rule = Rule::new(
        vec![atom(var("X"), 40, var("X"))],
        vec![
            Literal::Atom(atom(var("X"), 41, var("X"))),
            Literal::Negation(vec![atom(var("X"), 40, var("X"))]),
        ],
    );
    let engine = engine_with(&[t(1, 41, 1)], vec![rule]);
    let error = engine.materialize(&NoopMonitor).unwrap_err();
    assert!(matches!(error, ReasonerError::NotStratified { .. }));
    assert!(!engine.is_stratified());
}

/// reach(X) :- start(X).
/// reach(Y) :- reach(X), edge(X, Y).
/// unreached(X) :- node(X), NOT reach(X).
fn reachability_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            vec![atom(var("X"), REACH, var("X"))],
            vec![Literal::Atom(atom(var("X"), START, var("X")))],
        ),
        Rule::new(
            vec![atom(var("Y"), REACH, var("Y"))],
            vec![
                Literal::Atom(atom(var("X"), REACH, var("X"))),
                Literal::Atom(atom(var("X"), EDGE, var("Y"))),
            ],
        ),
        Rule::new(
            vec![atom(var("X"), UNREACHED, var("X"))],
            vec![
                Literal::Atom(atom(var("X"), NODE, var("X"))),
                Literal::Negation(vec![atom(var("X"), REACH, var("X"))]),
            ],
        ),
    ]
}

#[test]
fn test_stratified_negation_full_and_incremental() {
    let base = vec![
        t(1, NODE, 1),
        t(2, NODE, 2),
        t(3, NODE, 3),
        t(1, START, 1),
        t(1, EDGE, 2),
    ];
    let engine = engine_with(&base, reachability_rules());
    engine.materialize(&NoopMonitor).unwrap();
    let facts = idb(engine.store());
    assert!(facts.contains(&t(1, REACH, 1)));
    assert!(facts.contains(&t(2, REACH, 2)));
    assert!(!facts.contains(&t(3, REACH, 3)));
    assert!(facts.contains(&t(3, UNREACHED, 3)));
    assert!(!facts.contains(&t(2, UNREACHED, 2)));

    let mut edb: BTreeSet<Tuple> = base.into_iter().collect();

    // Extending reachability must retract unreached(3).
    edb.insert(t(2, EDGE, 3));
    engine.store().schedule_insert(t(2, EDGE, 3)).unwrap();
    engine.update_incrementally(&NoopMonitor).unwrap();
    assert_eq!(
        idb(engine.store()),
        full_materialization(&edb, &reachability_rules())
    );
    assert!(!idb(engine.store()).contains(&t(3, UNREACHED, 3)));

    // Cutting the chain must re-derive unreached(2) and unreached(3).
    edb.remove(&t(1, EDGE, 2));
    engine.store().schedule_delete(t(1, EDGE, 2));
    engine.update_incrementally(&NoopMonitor).unwrap();
    assert_eq!(
        idb(engine.store()),
        full_materialization(&edb, &reachability_rules())
    );
    assert!(idb(engine.store()).contains(&t(2, UNREACHED, 2)));
    assert!(idb(engine.store()).contains(&t(3, UNREACHED, 3)));
}

#[test]
fn test_incremental_rule_addition_and_removal() {
    let engine = engine_with(&[t(1, EDGE, 2), t(2, EDGE, 3)], Vec::new());
    engine.materialize(&NoopMonitor).unwrap();
    assert_eq!(idb(engine.store()).len(), 2);

    // Adding the path rules incrementally derives their consequences.
    engine.add_rules(path_rules()).unwrap();
    engine.update_incrementally(&NoopMonitor).unwrap();
    let facts = idb(engine.store());
    assert!(facts.contains(&t(1, PATH, 2)));
    assert!(facts.contains(&t(1, PATH, 3)));
    assert!(facts.contains(&t(2, PATH, 3)));

    // Removing the recursive rule retracts exactly the multi-hop paths.
    let recursive = path_rules().pop().unwrap();
    assert!(engine.remove_rule(&recursive));
    engine.update_incrementally(&NoopMonitor).unwrap();
    let facts = idb(engine.store());
    assert!(facts.contains(&t(1, PATH, 2)));
    assert!(facts.contains(&t(2, PATH, 3)));
    assert!(!facts.contains(&t(1, PATH, 3)));
}

#[test]
fn test_incremental_equals_full_randomized() {
    let nodes: Vec<u64> = (100..106).collect();
    let rules = path_rules();
    let mut rng = StdRng::seed_from_u64(0x0f2b_91d7);
    let mut edb: BTreeSet<Tuple> = BTreeSet::new();
    for _ in 0..12 {
        let from = nodes[rng.gen_range(0..nodes.len())];
        let to = nodes[rng.gen_range(0..nodes.len())];
        edb.insert(t(from, EDGE, to));
    }
    let initial: Vec<Tuple> = edb.iter().copied().collect();
    let engine = engine_with(&initial, rules.clone());
    engine.materialize(&NoopMonitor).unwrap();
    assert_eq!(idb(engine.store()), full_materialization(&edb, &rules));

    for round in 0..25 {
        let current: Vec<Tuple> = edb.iter().copied().collect();
        for _ in 0..rng.gen_range(0..3) {
            if current.is_empty() {
                break;
            }
            let victim = current[rng.gen_range(0..current.len())];
            if edb.remove(&victim) {
                engine.store().schedule_delete(victim);
            }
        }
        for _ in 0..rng.gen_range(0..3) {
            let from = nodes[rng.gen_range(0..nodes.len())];
            let to = nodes[rng.gen_range(0..nodes.len())];
            let edge = t(from, EDGE, to);
            if edb.insert(edge) {
                engine.store().schedule_insert(edge).unwrap();
            }
        }
        engine.update_incrementally(&NoopMonitor).unwrap();
        assert_eq!(
            idb(engine.store()),
            full_materialization(&edb, &rules),
            "divergence after round {round}"
        );
    }
}

#[test]
fn test_multithreaded_materialization_matches_single_threaded() {
    let facts = [
        t(1, EDGE, 2),
        t(2, EDGE, 3),
        t(3, EDGE, 4),
        t(4, EDGE, 1),
        t(4, EDGE, 5),
    ];
    let single = engine_with(&facts, path_rules());
    single.materialize(&NoopMonitor).unwrap();

    let mut parallel = engine_with(&facts, path_rules());
    parallel.set_thread_count(4);
    parallel.materialize(&NoopMonitor).unwrap();
    assert_eq!(idb(single.store()), idb(parallel.store()));
}

#[test]
fn test_aggregation_is_rejected_incrementally() {
    // busy(X) :- node(X), AGGREGATE { edge(X, Y) }.
    let rule = Rule::new(
        vec![atom(var("X"), 50, var("X"))],
        vec![
            Literal::Atom(atom(var("X"), NODE, var("X"))),
            Literal::Aggregate(vec![atom(var("X"), EDGE, var("Y"))]),
        ],
    );
    let engine = engine_with(&[t(1, NODE, 1), t(1, EDGE, 2), t(2, NODE, 2)], vec![rule]);
    engine.materialize(&NoopMonitor).unwrap();
    let facts = idb(engine.store());
    assert!(facts.contains(&t(1, 50, 1)));
    assert!(!facts.contains(&t(2, 50, 2)));

    engine.store().schedule_insert(t(2, EDGE, 3)).unwrap();
    let error = engine.update_incrementally(&NoopMonitor).unwrap_err();
    assert!(matches!(error, ReasonerError::Unsupported(_)));
}

#[test]
fn test_snapshot_round_trip_through_engine() {
    let engine = engine_with(&[t(1, EDGE, 2), t(2, EDGE, 3)], path_rules());
    engine.materialize(&NoopMonitor).unwrap();
    let mut buffer = Vec::new();
    engine.save(&mut buffer).unwrap();

    let restored = engine_with(&[t(1, EDGE, 2), t(2, EDGE, 3)], Vec::new());
    restored.load(buffer.as_slice()).unwrap();
    assert_eq!(restored.rules().len(), 2);
    restored.materialize(&NoopMonitor).unwrap();
    assert_eq!(idb(engine.store()), idb(restored.store()));
}
