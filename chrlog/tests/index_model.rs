//! Random workloads against a naive flat-list model of the same rules,
//! exercising the hash and set indexes through stale entries and compaction.

use chrlog::{
    Configuration, Solver, Value,
    ir::{ProgramBuilder, RuleBuilder, ValueType},
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Action {
    AddP(i64, i64),
    AddQ(i64),
    AddDel(i64),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..3i64, 0..3i64).prop_map(|(x, y)| Action::AddP(x, y)),
        (0..3i64).prop_map(Action::AddQ),
        (0..3i64).prop_map(Action::AddDel),
    ]
}

proptest! {
    #[test]
    fn store_matches_naive_model(actions in proptest::collection::vec(action(), 0..25)) {
        let mut b = ProgramBuilder::new();
        let del = b.constraint("del", [ValueType::Int]);
        let p = b.constraint("p", [ValueType::Int, ValueType::Int]);
        let q = b.constraint("q", [ValueType::Int]);
        let hit = b.constraint("hit", [ValueType::Int, ValueType::Int]);

        // del(X) \ p(X, Y) <=> true
        let mut r = RuleBuilder::new("blocked");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.kept(del, [x.into()]);
        r.removed(p, [x.into(), y.into()]);
        let _rule = b.push_rule(r);

        // q(X), p(X, Y) ==> hit(X, Y)
        let mut r = RuleBuilder::new("probe");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.kept(q, [x.into()]);
        r.kept(p, [x.into(), y.into()]);
        r.body_add(hit, [x.into(), y.into()]);
        let _rule = b.push_rule(r);

        let plan = chrlog::compile(&b.seal(), Configuration::default()).unwrap();
        let mut s = Solver::new(&plan);

        // flat-list model, activation walk in program order
        let mut dels: Vec<i64> = Vec::new();
        let mut ps: Vec<(i64, i64)> = Vec::new();
        let mut qs: Vec<i64> = Vec::new();
        let mut hits: Vec<(i64, i64)> = Vec::new();

        for &act in &actions {
            match act {
                Action::AddP(x, y) => {
                    s.add(p, [Value::Int(x), Value::Int(y)]).unwrap();
                    if dels.contains(&x) {
                        continue;
                    }
                    hits.extend(qs.iter().filter(|&&qx| qx == x).map(|_| (x, y)));
                    ps.push((x, y));
                }
                Action::AddQ(x) => {
                    s.add(q, [Value::Int(x)]).unwrap();
                    qs.push(x);
                    hits.extend(ps.iter().copied().filter(|&(px, _)| px == x));
                }
                Action::AddDel(x) => {
                    s.add(del, [Value::Int(x)]).unwrap();
                    dels.push(x);
                    ps.retain(|&(px, _)| px != x);
                }
            }
        }

        let mut lines: Vec<String> = Vec::new();
        lines.extend(dels.iter().map(|x| format!("del({x})\n")));
        lines.extend(ps.iter().map(|(x, y)| format!("p({x}, {y})\n")));
        lines.extend(qs.iter().map(|x| format!("q({x})\n")));
        lines.extend(hits.iter().map(|(x, y)| format!("hit({x}, {y})\n")));
        lines.sort();
        prop_assert_eq!(s.store_summary(), lines.concat());
    }
}
