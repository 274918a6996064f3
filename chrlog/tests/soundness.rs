//! The optimizer must be observationally invisible: a program compiled with
//! every pass disabled reaches the same final store.

use chrlog::{
    Configuration, ConstraintId, RuleId, Solver, Value,
    ir::{self, ProgramBuilder, RuleBuilder, ValueType},
};
use proptest::prelude::*;

fn closure_program() -> (ir::Program, ConstraintId, RuleId) {
    let mut b = ProgramBuilder::new();
    let leq = b.constraint("leq", [ValueType::Int, ValueType::Int]);

    // Removed-head-first so the walk of a duplicate consumes the newcomer.
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
fn idempotence_after_a_propagation_rule_still_activates_duplicates() {
    let mut b = ProgramBuilder::new();
    let c = b.constraint("c", [ValueType::Int]);
    let out = b.constraint("out", [ValueType::Int]);

    // The propagation occurrence precedes the idempotence rule in program
    // order, so a duplicate must fire it before being consumed. Absorbing
    // the duplicate in storage would lose that firing.
    let mut r = RuleBuilder::new("observe");
    let x = r.var("X");
    r.kept(c, [x.into()]);
    r.body_add(out, [x.into()]);
    let observe = b.push_rule(r);

    let mut r = RuleBuilder::new("dedup");
    let x = r.var("X");
    r.removed(c, [x.into()]);
    r.kept(c, [x.into()]);
    let _dedup = b.push_rule(r);

    let program = b.seal();
    let fast = chrlog::compile(&program, Configuration::default()).unwrap();
    let slow = chrlog::compile(&program, Configuration::unoptimized()).unwrap();

    let mut a = Solver::new(&fast);
    let mut b_ = Solver::new(&slow);
    for s in [&mut a, &mut b_] {
        s.add(c, [Value::Int(1)]).unwrap();
        s.add(c, [Value::Int(1)]).unwrap();
    }
    assert_eq!(a.firings(observe), 2);
    assert_eq!(b_.firings(observe), 2);
    assert_eq!(a.store_summary(), "c(1)\nout(1)\nout(1)\n");
    assert_eq!(a.store_summary(), b_.store_summary());
}

proptest! {
    #[test]
    fn optimized_and_unoptimized_reach_the_same_store(
        edges in proptest::collection::vec((0..4i64, 0..4i64), 0..12),
    ) {
        let (program, leq, trans) = closure_program();
        let fast = chrlog::compile(&program, Configuration::default()).unwrap();
        let slow = chrlog::compile(&program, Configuration::unoptimized()).unwrap();

        let mut a = Solver::new(&fast);
        let mut b = Solver::new(&slow);
        for &(x, y) in &edges {
            a.add(leq, [Value::Int(x), Value::Int(y)]).unwrap();
            b.add(leq, [Value::Int(x), Value::Int(y)]).unwrap();
        }
        prop_assert_eq!(a.store_summary(), b.store_summary());
        // a duplicate dies at the idempotence occurrence before any
        // transitivity occurrence sees it, so the firing traces match too
        prop_assert_eq!(a.firings(trans), b.firings(trans));
    }
}
