// Signal graph end-to-end behavior: values, bindings, caching, cycles.

use prism_core::ecs::{ComponentKind, Ecs, InstanceKind, Lock, Permissions};
use prism_core::refs::{EntityScope, Name, SignalRef};
use prism_core::signals::SignalExpression;

fn signal_perms() -> Permissions {
    Permissions::new()
        .read_kind(ComponentKind::Name)
        .read_kind(ComponentKind::Focus)
        .write_kind(ComponentKind::Signals)
}

fn scope() -> EntityScope {
    Name::new("test", "")
}

fn signal(ecs: &Ecs, path: &str) -> SignalRef {
    ecs.refs().get_signal_by_path(path, &scope())
}

#[test]
fn set_get_clear_round_trip() {
    let ecs = Ecs::new();
    let x = signal(&ecs, "e/x");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    // Unset signals read as zero
    assert_eq!(x.get_signal(&lock, 0), 0.0);

    x.set_value(&mut lock, 3.14).unwrap();
    assert_eq!(x.get_signal(&lock, 0), 3.14);
    assert!(x.has_value(&lock).unwrap());

    // Non-finite writes are rejected
    x.set_value(&mut lock, f64::NAN).unwrap();
    assert_eq!(x.get_signal(&lock, 0), 3.14);

    x.clear_value(&mut lock).unwrap();
    assert_eq!(x.get_signal(&lock, 0), 0.0);
    assert!(!x.has_value(&lock).unwrap());
}

#[test]
fn expression_dependency_and_dirty_propagation() {
    let ecs = Ecs::new();
    let x = signal(&ecs, "a/x");
    let y = signal(&ecs, "a/y");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    x.set_value(&mut lock, 2.0).unwrap();
    y.set_binding_str(&mut lock, "a/x + 1", &scope()).unwrap();

    assert!(y.is_cacheable(&lock).unwrap());
    assert_eq!(y.get_signal(&lock, 0), 3.0);
    assert!(!y.is_cache_dirty(&lock).unwrap());

    // Subscriber symmetry: x lists y as subscriber, y lists x as dependency
    let subs = x.subscribers(&lock).unwrap();
    let deps = y.dependencies(&lock).unwrap();
    assert!(subs.iter().any(|s| s.ptr_eq(&y)));
    assert!(deps.iter().any(|d| d.ptr_eq(&x)));

    // Writing the dependency dirties the subscriber until re-evaluation
    x.set_value(&mut lock, 10.0).unwrap();
    assert!(y.is_cache_dirty(&lock).unwrap());
    assert_eq!(y.get_signal(&lock, 0), 11.0);
    assert!(!y.is_cache_dirty(&lock).unwrap());
}

#[test]
fn rebinding_rebuilds_edges() {
    let ecs = Ecs::new();
    let x = signal(&ecs, "a/x");
    let z = signal(&ecs, "a/z");
    let y = signal(&ecs, "a/y");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    x.set_value(&mut lock, 1.0).unwrap();
    z.set_value(&mut lock, 5.0).unwrap();

    y.set_binding_str(&mut lock, "a/x + 1", &scope()).unwrap();
    assert_eq!(y.get_signal(&lock, 0), 2.0);

    y.set_binding_str(&mut lock, "a/z * 2", &scope()).unwrap();
    assert_eq!(y.get_signal(&lock, 0), 10.0);

    // The old edge is gone both ways
    assert!(x.subscribers(&lock).unwrap().is_empty());
    assert!(y.dependencies(&lock).unwrap().iter().all(|d| d.ptr_eq(&z)));

    y.clear_binding(&mut lock).unwrap();
    assert!(z.subscribers(&lock).unwrap().is_empty());
    assert_eq!(y.get_signal(&lock, 0), 0.0);
}

#[test]
fn value_overrides_binding() {
    let ecs = Ecs::new();
    let x = signal(&ecs, "a/x");
    let y = signal(&ecs, "a/y");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    x.set_value(&mut lock, 2.0).unwrap();
    y.set_binding_str(&mut lock, "a/x", &scope()).unwrap();
    y.set_value(&mut lock, 42.0).unwrap();
    assert_eq!(y.get_signal(&lock, 0), 42.0);

    // Clearing the value falls back to the binding
    y.clear_value(&mut lock).unwrap();
    assert_eq!(y.get_signal(&lock, 0), 2.0);
}

#[test]
fn parse_errors_leave_null_binding() {
    let ecs = Ecs::new();
    let y = signal(&ecs, "a/y");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    y.set_binding_str(&mut lock, "1 + + 2", &scope()).unwrap();
    assert!(!y.has_binding(&lock).unwrap());
    assert_eq!(y.get_signal(&lock, 0), 0.0);
}

#[test]
fn cycle_terminates_at_depth_limit() {
    let ecs = Ecs::new();
    let p = signal(&ecs, "a/p");
    let q = signal(&ecs, "a/q");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    p.set_binding_str(&mut lock, "a/q", &scope()).unwrap();
    q.set_binding_str(&mut lock, "a/p + 1", &scope()).unwrap();

    // The first top-level evaluation hits the depth bound and poisons to 0
    let p_value = p.get_signal(&lock, 0);
    assert_eq!(p_value, 0.0);

    // q sees either the poisoned cache (1.0) or its own poisoned result
    let q_value = q.get_signal(&lock, 0);
    assert!(q_value == 0.0 || q_value == 1.0, "q = {q_value}");
}

#[test]
fn expression_operators_and_functions() {
    let ecs = Ecs::new();
    let x = signal(&ecs, "a/x");
    let out = signal(&ecs, "a/out");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    let cases: &[(&str, f64, f64)] = &[
        ("a/x + 2 * 3", 1.0, 7.0),
        ("( a/x + 2 ) * 3", 1.0, 9.0),
        ("a/x / 0", 5.0, 0.0),
        ("- a/x", 2.0, -2.0),
        ("! a/x", 0.2, 1.0),
        ("a/x > 2", 3.0, 1.0),
        ("a/x <= 2", 3.0, 0.0),
        ("a/x == 2", 2.0, 1.0),
        ("a/x != 2", 2.0, 0.0),
        ("a/x && 1", 1.0, 1.0),
        ("a/x || 0", 0.0, 0.0),
        ("min ( a/x , 3 )", 5.0, 3.0),
        ("max ( a/x , 3 )", 5.0, 5.0),
        ("floor ( a/x )", 2.7, 2.0),
        ("ceil ( a/x )", 2.1, 3.0),
        ("abs ( 0 - a/x )", 4.0, 4.0),
    ];
    for (source, input, expected) in cases {
        x.set_value(&mut lock, *input).unwrap();
        out.set_binding_str(&mut lock, source, &scope()).unwrap();
        let value = out.get_signal(&lock, 0);
        assert_eq!(value, *expected, "{source} with x={input}");
    }
}

#[test]
fn scoping_is_equivalent_to_reparsing() {
    let ecs = Ecs::new();
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    let scope_a = Name::new("alpha", "");
    let scope_b = Name::new("beta", "");

    let ax = ecs.refs().get_signal_by_path("e/x", &scope_a);
    let bx = ecs.refs().get_signal_by_path("e/x", &scope_b);
    ax.set_value(&mut lock, 1.0).unwrap();
    bx.set_value(&mut lock, 2.0).unwrap();

    let mut expr = SignalExpression::new("e/x + 10", scope_a.clone());
    expr.compile(ecs.refs()).unwrap();
    assert_eq!(expr.evaluate(&lock, 0), 11.0);

    // Re-scoping matches parsing the same source under the new scope
    expr.set_scope(&scope_b, ecs.refs());
    let mut reparsed = SignalExpression::new("e/x + 10", scope_b);
    reparsed.compile(ecs.refs()).unwrap();
    assert_eq!(expr.evaluate(&lock, 0), reparsed.evaluate(&lock, 0));
    assert_eq!(expr.evaluate(&lock, 0), 12.0);
}

#[test]
fn entity_destruction_frees_signals() {
    let ecs = Ecs::new();
    let name = Name::new("test", "owner");
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, Permissions::add_remove())
        .unwrap();
    let entity = lock.new_entity().unwrap();
    lock.set_name(entity, name.clone()).unwrap();

    let sig = signal(&ecs, "owner/health");
    sig.set_value(&mut lock, 100.0).unwrap();
    assert_eq!(sig.get_signal(&lock, 0), 100.0);
    assert_eq!(lock.signals().unwrap().len(), 1);

    lock.destroy(entity).unwrap();
    assert_eq!(lock.signals().unwrap().len(), 0);
    assert_eq!(sig.get_signal(&lock, 0), 0.0);
}

#[test]
fn freed_slots_are_reused_smallest_first() {
    let ecs = Ecs::new();
    let mut lock = ecs
        .start_transaction(InstanceKind::Live, signal_perms())
        .unwrap();

    let a = signal(&ecs, "e/a");
    let b = signal(&ecs, "e/b");
    let c = signal(&ecs, "e/c");
    a.set_value(&mut lock, 1.0).unwrap();
    b.set_value(&mut lock, 2.0).unwrap();
    c.set_value(&mut lock, 3.0).unwrap();

    a.free(&mut lock).unwrap();
    b.free(&mut lock).unwrap();

    // New signals fill the lowest vacated slots first
    let d = signal(&ecs, "e/d");
    d.set_value(&mut lock, 4.0).unwrap();
    let e = signal(&ecs, "e/e");
    e.set_value(&mut lock, 5.0).unwrap();
    assert_eq!(lock.signals().unwrap().len(), 3);
    assert_eq!(d.get_signal(&lock, 0), 4.0);
    assert_eq!(c.get_signal(&lock, 0), 3.0);
}
