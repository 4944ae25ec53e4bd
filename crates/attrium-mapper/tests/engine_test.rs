//! Integration tests for the mapping engine and runtime.
//!
//! Covers loading validation, priority arbitration, clearance ordering,
//! existence semantics, instance resolution, chain-reaction suppression and
//! the update queue behavior.

use attrium_mapper::ast::{
    Assignment, AssignmentKind, AttributePath, BinaryOperator, Expr, PathElement, Scope,
    ScopeSettings, ValueKind,
};
use attrium_mapper::{MapParser, MapperEngine, MapperError, MapperRuntime};
use attrium_store::{AttributeStore, AttributeTypeId, ValueState};

const ROOT: AttributeTypeId = 1;
const ENDPOINT: AttributeTypeId = 2;
const A: AttributeTypeId = 100;
const B: AttributeTypeId = 101;
const C: AttributeTypeId = 102;
const GROUP: AttributeTypeId = 200;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn regular(lhs_kind: ValueKind, lhs: &[AttributeTypeId], rhs: Expr) -> Assignment {
    Assignment {
        kind: AssignmentKind::Regular,
        lhs: AttributePath::from_types(lhs_kind, lhs),
        rhs,
    }
}

fn scope(settings: ScopeSettings, assignments: Vec<Assignment>) -> Scope {
    Scope {
        settings,
        assignments,
    }
}

/// `r'B = r'A + 1`
fn b_follows_a() -> Assignment {
    regular(
        ValueKind::Reported,
        &[B],
        Expr::binary(
            BinaryOperator::Add,
            Expr::attribute(ValueKind::Reported, &[A]),
            Expr::Literal(1.0),
        ),
    )
}

fn runtime_with(scopes: Vec<Scope>) -> MapperRuntime {
    init_tracing();
    let mut engine = MapperEngine::new(ENDPOINT);
    engine.load_ast(&scopes).expect("load failed");
    MapperRuntime::new(engine)
}

fn store_with_endpoint() -> (AttributeStore, attrium_store::AttributeId) {
    let mut store = AttributeStore::new(ROOT);
    let endpoint = store.add_node(ENDPOINT, store.root()).unwrap();
    store.take_events();
    (store, endpoint)
}

#[test]
fn test_constant_assignment_rejected() {
    let mut engine = MapperEngine::new(ENDPOINT);
    let result = engine.load_ast(&vec![scope(
        ScopeSettings::default(),
        vec![regular(ValueKind::Reported, &[B], Expr::Literal(4.0))],
    )]);
    assert!(matches!(result, Err(MapperError::ConstantAssignment(_))));
    assert_eq!(engine.assignment_count(), 0);
}

#[test]
fn test_unknown_function_rejects_whole_load() {
    let mut engine = MapperEngine::new(ENDPOINT);
    let bad = Assignment {
        kind: AssignmentKind::Regular,
        lhs: AttributePath::from_types(ValueKind::Reported, &[B]),
        rhs: Expr::Call {
            function: "frobnicate".into(),
            arguments: vec![Expr::attribute(ValueKind::Reported, &[A])],
        },
    };
    let result = engine.load_ast(&vec![scope(
        ScopeSettings::default(),
        vec![b_follows_a(), bad],
    )]);
    assert!(matches!(result, Err(MapperError::UnknownFunction(_))));
    // Nothing from the unit is committed.
    assert_eq!(engine.assignment_count(), 0);
    assert_eq!(engine.relation_count(), 0);
}

#[test]
fn test_self_referential_assignment_rejected() {
    let mut engine = MapperEngine::new(ENDPOINT);
    // r'A = r'A + 1 reads the value it writes.
    let result = engine.load_ast(&vec![scope(
        ScopeSettings::default(),
        vec![regular(
            ValueKind::Reported,
            &[A],
            Expr::binary(
                BinaryOperator::Add,
                Expr::attribute(ValueKind::Reported, &[A]),
                Expr::Literal(1.0),
            ),
        )],
    )]);
    assert!(matches!(result, Err(MapperError::SelfReferential(_))));
}

#[test]
fn test_load_makes_assignment_reachable_by_dependency() {
    let mut engine = MapperEngine::new(ENDPOINT);
    engine
        .load_ast(&vec![scope(ScopeSettings::default(), vec![b_follows_a()])])
        .unwrap();
    assert_eq!(engine.assignment_count(), 1);
    assert!(engine.relation_count() >= 1);
    assert!(engine.is_watched(A, ValueState::Reported));
    assert!(!engine.is_watched(A, ValueState::Desired));
    assert!(!engine.is_watched(B, ValueState::Reported));
}

#[test]
fn test_end_to_end_reported_propagation() {
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![b_follows_a()])]);
    let (mut store, endpoint) = store_with_endpoint();
    // A second endpoint that must stay untouched.
    let other_endpoint = store.add_node(ENDPOINT, store.root()).unwrap();

    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);

    assert_eq!(store.get_reported_number(b), Some(6.0));
    assert!(store.children_of_type(other_endpoint, B).is_empty());

    // Re-setting the same value re-evaluates and yields the same result.
    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), Some(6.0));
}

#[test]
fn test_desired_propagation() {
    let mut runtime = runtime_with(vec![scope(
        ScopeSettings::default(),
        vec![regular(
            ValueKind::Desired,
            &[B],
            Expr::attribute(ValueKind::Desired, &[A]),
        )],
    )]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();

    store.set_desired_number(a, 9.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_desired_number(b), Some(9.0));
    assert_eq!(store.get_reported_number(b), None);
}

#[test]
fn test_highest_priority_wins_on_known_destination() {
    let mut runtime = runtime_with(vec![
        scope(
            ScopeSettings::with_priority(10),
            vec![regular(
                ValueKind::Reported,
                &[B],
                Expr::binary(
                    BinaryOperator::Multiply,
                    Expr::attribute(ValueKind::Reported, &[A]),
                    Expr::Literal(10.0),
                ),
            )],
        ),
        scope(
            ScopeSettings::with_priority(20),
            vec![regular(
                ValueKind::Reported,
                &[B],
                Expr::binary(
                    BinaryOperator::Multiply,
                    Expr::attribute(ValueKind::Reported, &[A]),
                    Expr::Literal(100.0),
                ),
            )],
        ),
    ]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();

    store.set_reported_number(a, 2.0).unwrap();
    runtime.run_to_completion(&mut store);

    // Only the priority-20 assignment is observable.
    assert_eq!(store.get_reported_number(b), Some(200.0));
}

#[test]
fn test_unknown_destination_runs_all_highest_priority_last() {
    // Destination B does not exist; scopes opt into creation, so all
    // equivalents run in ascending priority and the highest lands last.
    let creating = |priority: i32| ScopeSettings {
        priority,
        create_attributes: true,
        ..ScopeSettings::default()
    };
    let mut runtime = runtime_with(vec![
        scope(
            creating(10),
            vec![regular(
                ValueKind::Reported,
                &[B],
                Expr::binary(
                    BinaryOperator::Multiply,
                    Expr::attribute(ValueKind::Reported, &[A]),
                    Expr::Literal(10.0),
                ),
            )],
        ),
        scope(
            creating(20),
            vec![regular(
                ValueKind::Reported,
                &[B],
                Expr::binary(
                    BinaryOperator::Multiply,
                    Expr::attribute(ValueKind::Reported, &[A]),
                    Expr::Literal(100.0),
                ),
            )],
        ),
    ]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();

    store.set_reported_number(a, 2.0).unwrap();
    runtime.run_to_completion(&mut store);

    let b = store.child_by_type(endpoint, B, 0).expect("B created");
    assert_eq!(store.get_reported_number(b), Some(200.0));
}

#[test]
fn test_clearance_runs_before_regular() {
    // c:r'B = r'A clears B's reported whenever A is truthy; the regular
    // assignment writes afterwards, so its value must survive the wave.
    let clearance = Assignment {
        kind: AssignmentKind::Clearance,
        lhs: AttributePath::from_types(ValueKind::Reported, &[B]),
        rhs: Expr::attribute(ValueKind::Reported, &[A]),
    };
    let mut runtime = runtime_with(vec![scope(
        ScopeSettings::default(),
        vec![clearance, b_follows_a()],
    )]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.set_reported_number(b, 99.0).unwrap();
    store.take_events();

    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);

    assert_eq!(store.get_reported_number(b), Some(6.0));
}

#[test]
fn test_clearance_with_falsy_value_is_a_no_op() {
    let clearance = Assignment {
        kind: AssignmentKind::Clearance,
        lhs: AttributePath::from_types(ValueKind::Reported, &[B]),
        rhs: Expr::attribute(ValueKind::Reported, &[A]),
    };
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![clearance])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.set_reported_number(b, 99.0).unwrap();
    store.take_events();

    store.set_reported_number(a, 0.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), Some(99.0));
}

#[test]
fn test_existence_assignment_creates_and_deletes() {
    // e'B = r'A: nonzero creates B, zero deletes it.
    let mut runtime = runtime_with(vec![scope(
        ScopeSettings::default(),
        vec![regular(
            ValueKind::Existence,
            &[B],
            Expr::attribute(ValueKind::Reported, &[A]),
        )],
    )]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();

    store.set_reported_number(a, 1.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert!(store.child_by_type(endpoint, B, 0).is_some());

    store.set_reported_number(a, 0.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert!(store.child_by_type(endpoint, B, 0).is_none());
}

#[test]
fn test_existence_tracks_node_lifecycle() {
    // e'B = e'A: B mirrors A's existence, across create and delete.
    let mut runtime = runtime_with(vec![scope(
        ScopeSettings::default(),
        vec![regular(
            ValueKind::Existence,
            &[B],
            Expr::attribute(ValueKind::Existence, &[A]),
        )],
    )]);
    let (mut store, endpoint) = store_with_endpoint();

    let a = store.add_node(A, endpoint).unwrap();
    runtime.run_to_completion(&mut store);
    assert!(store.child_by_type(endpoint, B, 0).is_some());

    store.delete_node(a).unwrap();
    runtime.run_to_completion(&mut store);
    assert!(store.child_by_type(endpoint, B, 0).is_none());
    // The deleted node was purged once its event was consumed.
    assert!(store.node_type(a).is_none());
}

#[test]
fn test_chain_reaction_cascades_one_step_per_turn() {
    // r'B = r'A + 1 and r'C = r'B + 1: the second stage must run in a
    // later evaluation turn, not recursively.
    let mut runtime = runtime_with(vec![scope(
        ScopeSettings::default(),
        vec![
            b_follows_a(),
            regular(
                ValueKind::Reported,
                &[C],
                Expr::binary(
                    BinaryOperator::Add,
                    Expr::attribute(ValueKind::Reported, &[B]),
                    Expr::Literal(1.0),
                ),
            ),
        ],
    )]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    let c = store.add_node(C, endpoint).unwrap();
    store.take_events();

    store.set_reported_number(a, 5.0).unwrap();

    // First turn: B is computed, C not yet.
    let more = runtime.evaluate_next_update(&mut store);
    assert!(more);
    assert_eq!(store.get_reported_number(b), Some(6.0));
    assert_eq!(store.get_reported_number(c), None);

    // Second turn: the cascade reaches C.
    runtime.evaluate_next_update(&mut store);
    assert_eq!(store.get_reported_number(c), Some(7.0));
}

#[test]
fn test_chain_reaction_suppression() {
    let no_chain = ScopeSettings {
        chain_reaction: false,
        ..ScopeSettings::default()
    };
    let mut runtime = runtime_with(vec![
        scope(no_chain, vec![b_follows_a()]),
        scope(
            ScopeSettings::default(),
            vec![regular(
                ValueKind::Reported,
                &[C],
                Expr::binary(
                    BinaryOperator::Add,
                    Expr::attribute(ValueKind::Reported, &[B]),
                    Expr::Literal(1.0),
                ),
            )],
        ),
    ]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    let c = store.add_node(C, endpoint).unwrap();
    store.take_events();

    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);

    // B was written, but its update never reached the second rule.
    assert_eq!(store.get_reported_number(b), Some(6.0));
    assert_eq!(store.get_reported_number(c), None);

    // A direct write to B still propagates.
    store.set_reported_number(b, 10.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(c), Some(11.0));
}

#[test]
fn test_clear_desired_on_reported_write() {
    let clearing = ScopeSettings {
        clear_desired: true,
        ..ScopeSettings::default()
    };
    let mut runtime = runtime_with(vec![scope(clearing, vec![b_follows_a()])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.set_desired_number(b, 42.0).unwrap();
    store.take_events();

    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);

    assert_eq!(store.get_reported_number(b), Some(6.0));
    assert_eq!(store.get_desired_number(b), None);
}

#[test]
fn test_update_queue_collapses_duplicate_entries() {
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![b_follows_a()])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.take_events();

    // Two writes before any evaluation collapse into one pending entry.
    store.set_reported_number(a, 5.0).unwrap();
    store.set_reported_number(a, 7.0).unwrap();
    runtime.process_store_events(&mut store);
    assert!(runtime.has_pending_evaluations());

    let more = runtime.evaluate_next_update(&mut store);
    assert!(!more);
    assert!(!runtime.has_pending_evaluations());
    assert_eq!(store.get_reported_number(b), Some(8.0));
}

#[test]
fn test_paused_mapper_drops_updates() {
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![b_follows_a()])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.take_events();

    runtime.pause_mapping();
    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), None);

    runtime.resume_mapping();
    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), Some(6.0));
}

#[test]
fn test_paused_reactions_drop_updates_for_one_node() {
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![b_follows_a()])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.take_events();

    runtime.pause_reactions_to(a);
    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), None);

    runtime.resume_reactions_to(a);
    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), Some(6.0));
}

#[test]
fn test_instance_assignment_with_subscript() {
    // i:r'GROUP[2] = (r'A > 0): a GROUP instance with reported value 2
    // exists exactly while A is positive.
    let instance = Assignment {
        kind: AssignmentKind::Instance,
        lhs: AttributePath::new(
            ValueKind::Reported,
            vec![PathElement::Subscript {
                attr_type: Box::new(Expr::Literal(GROUP as f64)),
                index: Box::new(Expr::Literal(2.0)),
            }],
        ),
        rhs: Expr::binary(
            BinaryOperator::GreaterThan,
            Expr::attribute(ValueKind::Reported, &[A]),
            Expr::Literal(0.0),
        ),
    };
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![instance])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();

    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    let instances = store.children_of_type(endpoint, GROUP);
    assert_eq!(instances.len(), 1);
    assert_eq!(store.get_reported_number(instances[0]), Some(2.0));

    // Re-triggering while the instance exists is a no-op.
    store.set_reported_number(a, 6.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.children_of_type(endpoint, GROUP).len(), 1);

    store.set_reported_number(a, 0.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert!(store.children_of_type(endpoint, GROUP).is_empty());
}

#[test]
fn test_instance_assignment_without_subscript() {
    // i:r'GROUP = r'A: an instance carrying A's value must exist.
    let instance = Assignment {
        kind: AssignmentKind::Instance,
        lhs: AttributePath::from_types(ValueKind::Reported, &[GROUP]),
        rhs: Expr::attribute(ValueKind::Reported, &[A]),
    };
    let mut runtime = runtime_with(vec![scope(ScopeSettings::default(), vec![instance])]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();

    store.set_reported_number(a, 3.0).unwrap();
    runtime.run_to_completion(&mut store);
    let instances = store.children_of_type(endpoint, GROUP);
    assert_eq!(instances.len(), 1);
    assert_eq!(store.get_reported_number(instances[0]), Some(3.0));
}

struct CannedParser(Scope);

impl MapParser for CannedParser {
    fn parse(&self, source: &str) -> Result<Vec<Scope>, String> {
        if source.contains("bad") {
            return Err("syntax error".into());
        }
        Ok(vec![self.0.clone()])
    }
}

#[test]
fn test_load_path_loads_every_uam_file() -> anyhow::Result<()> {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("attrium-mapper-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("one.uam"), "r'101 = r'100 + 1")?;
    std::fs::write(dir.join("two.uam"), "r'102 = r'100 + 2")?;
    std::fs::write(dir.join("ignored.txt"), "not a mapping file")?;

    let parser = CannedParser(scope(ScopeSettings::default(), vec![b_follows_a()]));
    let mut engine = MapperEngine::new(ENDPOINT);
    engine.load_path(&dir, &parser)?;
    assert_eq!(engine.assignment_count(), 2);

    // A bad file fails the batch.
    std::fs::write(dir.join("zz-bad.uam"), "bad")?;
    let result = engine.load_path(&dir, &parser);
    assert!(matches!(result, Err(MapperError::Parse { .. })));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_missing_dependency_leaves_destination_untouched() {
    // r'B = r'A + r'C with C undefined: evaluation fails, nothing applied.
    let mut runtime = runtime_with(vec![scope(
        ScopeSettings::default(),
        vec![regular(
            ValueKind::Reported,
            &[B],
            Expr::binary(
                BinaryOperator::Add,
                Expr::attribute(ValueKind::Reported, &[A]),
                Expr::attribute(ValueKind::Reported, &[C]),
            ),
        )],
    )]);
    let (mut store, endpoint) = store_with_endpoint();
    let a = store.add_node(A, endpoint).unwrap();
    let b = store.add_node(B, endpoint).unwrap();
    store.take_events();

    store.set_reported_number(a, 5.0).unwrap();
    runtime.run_to_completion(&mut store);
    assert_eq!(store.get_reported_number(b), None);
}
