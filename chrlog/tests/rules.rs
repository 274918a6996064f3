//! End-to-end behavior of compiled rule programs.

use chrlog::{
    Configuration, ConstraintId, RuleId, Solver, Value,
    ir::{self, ProgramBuilder, RuleBuilder, ValueType},
};

fn compiled(program: &ir::Program) -> chrlog::plan::Program {
    let _ignore = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    chrlog::compile(program, Configuration::default()).unwrap()
}

#[test]
fn antisymmetric_ground_pair_fires_once_then_fails() {
    let mut b = ProgramBuilder::new();
    let leq = b.constraint("leq", [ValueType::Int, ValueType::Int]);
    let mut r = RuleBuilder::new("antisymmetry");
    let (x, y) = (r.var("X"), r.var("Y"));
    r.removed(leq, [x.into(), y.into()]);
    r.removed(leq, [y.into(), x.into()]);
    r.body_unify(x, y);
    let rule = b.push_rule(r);
    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    s.add(leq, [Value::Int(1), Value::Int(2)]).unwrap();
    // Both facts are consumed before the body runs; unifying 2 with 1 then
    // fails the computation without rewinding the removals.
    let err = s.add(leq, [Value::Int(2), Value::Int(1)]).unwrap_err();
    assert!(err.to_string().contains("cannot unify"));
    assert_eq!(s.firings(rule), 1);
    assert_eq!(s.live_count(), 0);
    // the solver stays failed
    assert!(s.add(leq, [Value::Int(5), Value::Int(6)]).is_err());
}

#[test]
fn antisymmetry_unifies_logical_endpoints() {
    let mut b = ProgramBuilder::new();
    let leq = b.constraint("leq", [ValueType::Var, ValueType::Var]);
    let mut r = RuleBuilder::new("antisymmetry");
    let (x, y) = (r.var("X"), r.var("Y"));
    r.removed(leq, [x.into(), y.into()]);
    r.removed(leq, [y.into(), x.into()]);
    r.body_unify(x, y);
    let rule = b.push_rule(r);
    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    let a = s.fresh_var();
    let b_ = s.fresh_var();
    s.add(leq, [a, b_]).unwrap();
    s.add(leq, [b_, a]).unwrap();
    assert_eq!(s.firings(rule), 1);
    assert_eq!(s.live_count(), 0);
    s.unify(a, Value::Int(7)).unwrap();
    // a and b now name the same value
    s.unify(b_, Value::Int(7)).unwrap();
}

fn closure_program() -> (ir::Program, ConstraintId, RuleId) {
    let mut b = ProgramBuilder::new();
    let leq = b.constraint("leq", [ValueType::Int, ValueType::Int]);

    let mut r = RuleBuilder::new("idempotence");
    let (x, y) = (r.var("X"), r.var("Y"));
    r.removed(leq, [x.into(), y.into()]);
    r.kept(leq, [x.into(), y.into()]);
    let _rule = b.push_rule(r);

    let mut r = RuleBuilder::new("transitivity");
    let (x, y, z) = (r.var("X"), r.var("Y"), r.var("Z"));
    r.kept(leq, [x.into(), y.into()]);
    r.kept(leq, [y.into(), z.into()]);
    r.body_add(leq, [x.into(), z.into()]);
    let trans = b.push_rule(r);

    (b.seal(), leq, trans)
}

#[test]
fn transitive_closure_under_set_semantics() {
    let (program, leq, trans) = closure_program();
    let plan = compiled(&program);

    let mut s = Solver::new(&plan);
    s.add(leq, [Value::Int(1), Value::Int(2)]).unwrap();
    s.add(leq, [Value::Int(2), Value::Int(3)]).unwrap();
    s.add(leq, [Value::Int(3), Value::Int(4)]).unwrap();
    assert_eq!(
        s.store_summary(),
        "leq(1, 2)\nleq(1, 3)\nleq(1, 4)\nleq(2, 3)\nleq(2, 4)\nleq(3, 4)\n"
    );
    assert_eq!(s.firings(trans), 4);

    // a duplicate is absorbed before activation: no firings, no new fact
    s.add(leq, [Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(s.firings(trans), 4);
    assert_eq!(s.live_count(), 6);
}

#[test]
fn unary_propagation_fires_once_per_fact() {
    let mut b = ProgramBuilder::new();
    let pair = b.constraint("pair", [ValueType::Var, ValueType::Var]);
    let mark = b.constraint("mark", [ValueType::Var]);
    let mut r = RuleBuilder::new("tag");
    let (x, y) = (r.var("X"), r.var("Y"));
    r.kept(pair, [x.into(), y.into()]);
    r.body_add(mark, [x.into()]);
    let rule = b.push_rule(r);
    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    let v = s.fresh_var();
    let w = s.fresh_var();
    s.add(pair, [v, w]).unwrap();
    assert_eq!(s.firings(rule), 1);

    // each binding reactivates the fact; the history flag rejects a refire
    s.unify(v, Value::Int(1)).unwrap();
    s.unify(w, Value::Int(2)).unwrap();
    assert_eq!(s.firings(rule), 1);
    assert_eq!(s.store_summary(), "mark(1)\npair(1, 2)\n");
}

#[test]
fn guard_becomes_entailed_by_a_later_binding() {
    let mut b = ProgramBuilder::new();
    let val = b.constraint("val", [ValueType::Var]);
    let found = b.constraint("found", [ValueType::Var]);
    let mut r = RuleBuilder::new("watch_three");
    let x = r.var("X");
    r.kept(val, [x.into()]);
    r.guard_eq(x, 3);
    r.body_add(found, [x.into()]);
    let rule = b.push_rule(r);
    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    let v = s.fresh_var();
    s.add(val, [v]).unwrap();
    // X == 3 is not entailed while X is unbound
    assert_eq!(s.firings(rule), 0);
    s.unify(v, Value::Int(3)).unwrap();
    assert_eq!(s.firings(rule), 1);
    assert_eq!(s.store_summary(), "found(3)\nval(3)\n");

    let w = s.fresh_var();
    s.add(val, [w]).unwrap();
    s.unify(w, Value::Int(4)).unwrap();
    assert_eq!(s.firings(rule), 1);
}

#[test]
fn absence_is_rechecked_when_the_blocker_is_removed() {
    let mut b = ProgramBuilder::new();
    let todo = b.constraint("todo", [ValueType::Int]);
    let lock = b.constraint("lock", [ValueType::Int]);
    let done = b.constraint("done", [ValueType::Int]);
    let release = b.constraint("release", [ValueType::Int]);

    let mut r = RuleBuilder::new("run");
    let x = r.var("X");
    r.removed(todo, [x.into()]);
    r.absent(lock, [x.into()]);
    r.body_add(done, [x.into()]);
    let run = b.push_rule(r);

    let mut r = RuleBuilder::new("release");
    let x = r.var("X");
    r.kept(release, [x.into()]);
    r.removed(lock, [x.into()]);
    let _rule = b.push_rule(r);

    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    s.add(lock, [Value::Int(1)]).unwrap();
    s.add(todo, [Value::Int(1)]).unwrap();
    // blocked by lock(1)
    assert_eq!(s.firings(run), 0);
    assert_eq!(s.store_summary(), "lock(1)\ntodo(1)\n");

    // removing the lock re-runs the absence-guarded rule
    s.add(release, [Value::Int(1)]).unwrap();
    assert_eq!(s.firings(run), 1);
    assert_eq!(s.store_summary(), "done(1)\nrelease(1)\n");
}

#[test]
fn explicit_failure_poisons_the_solver() {
    let mut b = ProgramBuilder::new();
    let boom = b.constraint("boom", [ValueType::Int]);
    let mut r = RuleBuilder::new("abort");
    let x = r.var("X");
    r.removed(boom, [x.into()]);
    r.body_fail();
    let _rule = b.push_rule(r);
    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    let err = s.add(boom, [Value::Int(1)]).unwrap_err();
    assert!(err.to_string().contains("signalled failure"));
    assert!(s.add(boom, [Value::Int(2)]).is_err());
}

#[test]
fn body_continues_after_a_reentrant_addition() {
    let mut b = ProgramBuilder::new();
    let src = b.constraint("src", [ValueType::Int]);
    let left = b.constraint("left", [ValueType::Int]);
    let right = b.constraint("right", [ValueType::Int]);
    let mut r = RuleBuilder::new("split");
    let x = r.var("X");
    r.removed(src, [x.into()]);
    r.body_add(left, [x.into()]);
    r.body_add(right, [ir::Expr::add(x, 1)]);
    let _rule = b.push_rule(r);
    let plan = compiled(&b.seal());

    let mut s = Solver::new(&plan);
    s.add(src, [Value::Int(5)]).unwrap();
    assert_eq!(s.store_summary(), "left(5)\nright(6)\n");
}
