//! Passiveness and symmetry optimizer.
//!
//! All passes mutate the IR in one direction only: occurrence `active` flags
//! go `true -> false`, storage classifications go `Always -> Sometimes ->
//! Never`, rules go live -> dead. The driver reruns every pass until nothing
//! changes; termination follows from the monotone decrease of the active
//! occurrence count. None of this changes the set of rule firings, only how
//! much matching code exists to produce them.

use crate::{
    ids::{ConstraintId, RuleId, VarId},
    ir::{BodyStep, CmpOp, Expr, HeadKind, Literal, Program, RuleKind, Storage},
    typed_vec::TVec,
};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) fn run(p: &mut Program, symmetry: bool) {
    let mut rounds = 0_usize;
    loop {
        let mut changed = false;
        changed |= detect_set_semantics(p);
        changed |= eliminate_dead_rules(p);
        changed |= never_removed(p);
        changed |= never_stored(p);
        changed |= passivate_unmatchable(p);
        if symmetry {
            changed |= detect_symmetry(p);
        }
        changed |= refine_storage(p);
        rounds += 1;
        if !changed {
            break;
        }
    }
    tracing::info!(
        rounds,
        active = p.occs.iter().filter(|o| o.active).count(),
        dead_rules = p.rules.iter().filter(|r| r.dead).count(),
        "optimizer fixpoint"
    );
}

fn live_rules(p: &Program) -> impl Iterator<Item = RuleId> + '_ {
    p.rules
        .iter_enumerate()
        .filter(|(_, rule)| !rule.dead)
        .map(|(r, _)| r)
}

/// Marks a rule dead and passivates its occurrences. Killing a rule twice is
/// an IR inconsistency, not a user error.
fn kill_rule(p: &mut Program, r: RuleId, why: &str) {
    assert!(!p.rules[r].dead, "rule {} eliminated twice", p.rules[r].name);
    tracing::debug!(rule = %p.rules[r].name, why, "dead rule eliminated");
    p.rules[r].dead = true;
    let heads = p.rules[r].heads.clone();
    for o in heads {
        p.occs[o].active = false;
    }
}

/// An idempotence rule whose removed head is the constraint's first positive
/// occurrence in program order licenses full duplicate elimination in
/// storage. The rule itself is compiled away: the set-semantic index absorbs
/// the duplicate before it ever activates, which is exactly where the
/// duplicate's walk would have consumed it.
///
/// Any other placement is rejected. An occurrence earlier in the walk must
/// see the duplicate activate before the idempotence rule removes it, and a
/// kept-head-first rule removes the old instance instead, letting the
/// newcomer re-walk everything after it.
fn detect_set_semantics(p: &mut Program) -> bool {
    let mut changed = false;
    for r in live_rules(p).collect::<Vec<_>>() {
        let rule = &p.rules[r];
        if !rule.guard.is_empty() || !rule.body.is_empty() {
            continue;
        }
        if p.negative_heads(r).next().is_some() {
            continue;
        }
        let positive: Vec<_> = p.positive_heads(r).collect();
        let [x, y] = positive[..] else { continue };
        let (kept_o, removed_o) = match (p.occs[x].kind, p.occs[y].kind) {
            (HeadKind::Kept, HeadKind::Removed) => (x, y),
            (HeadKind::Removed, HeadKind::Kept) => (y, x),
            _ => continue,
        };
        let (kept, removed) = (&p.occs[kept_o], &p.occs[removed_o]);
        if kept.constraint != removed.constraint || kept.args != removed.args {
            continue;
        }
        let c = kept.constraint;
        let first_live = p.constraints[c]
            .positive_occs
            .iter()
            .copied()
            .find(|&o| !p.rules[p.occs[o].rule].dead);
        if first_live != Some(removed_o) {
            continue;
        }
        if p.set_semantic.insert(c) {
            tracing::debug!(
                constraint = %p.constraints[c].name,
                rule = %p.rules[r].name,
                "set semantics licensed"
            );
        }
        kill_rule(p, r, "absorbed into set-semantic storage");
        changed = true;
    }
    changed
}

/// A rule with no active positive occurrence, a constant-false guard, or an
/// empty propagation body can never fire (or fires without effect).
fn eliminate_dead_rules(p: &mut Program) -> bool {
    let mut changed = false;
    for r in live_rules(p).collect::<Vec<_>>() {
        let rule = &p.rules[r];
        if p.positive_heads(r).all(|o| !p.occs[o].active) {
            kill_rule(p, r, "no active positive occurrence");
            changed = true;
            continue;
        }
        if rule.guard.iter().any(guard_constant_false) {
            kill_rule(p, r, "unsatisfiable guard");
            changed = true;
            continue;
        }
        if rule.body.is_empty() && p.rule_kind(r) == RuleKind::Propagation {
            kill_rule(p, r, "empty propagation body");
            changed = true;
        }
    }
    changed
}

fn guard_constant_false(g: &crate::ir::GuardTest) -> bool {
    if g.lhs == g.rhs && matches!(g.op, CmpOp::Ne | CmpOp::Lt | CmpOp::Gt) {
        return true;
    }
    match (&g.lhs, &g.rhs) {
        (Expr::Lit(Literal::Int(a)), Expr::Lit(Literal::Int(b))) => {
            let holds = match g.op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            };
            !holds
        }
        (Expr::Lit(Literal::Sym(a)), Expr::Lit(Literal::Sym(b))) => match g.op {
            CmpOp::Eq => a != b,
            CmpOp::Ne => a == b,
            _ => false,
        },
        _ => false,
    }
}

/// Constraints that some live rule can delete from the store.
fn removable_constraints(p: &Program) -> BTreeSet<ConstraintId> {
    let mut out = BTreeSet::new();
    for r in live_rules(p) {
        for o in p.positive_heads(r) {
            // Passive removed occurrences still delete their match when an
            // active partner commits the rule.
            if p.occs[o].kind == HeadKind::Removed {
                out.insert(p.occs[o].constraint);
            }
        }
    }
    out
}

/// A negative occurrence of a never-removed constraint needs no
/// removal-triggered rechecking: the existence it negates can only appear,
/// never disappear, so the absence test at activation time is final.
fn never_removed(p: &mut Program) -> bool {
    let removable = removable_constraints(p);
    let mut changed = false;
    for occ in p.occs.iter_mut() {
        if occ.kind == HeadKind::Negative && occ.active && !removable.contains(&occ.constraint) {
            occ.active = false;
            changed = true;
        }
    }
    changed
}

/// A constraint whose first active occurrence consumes it in a single-headed,
/// guard-free simplification never reaches the store. Everything after that
/// occurrence in the activation walk is unreachable.
fn never_stored(p: &mut Program) -> bool {
    let mut changed = false;
    for c in p.constraints.enumerate().collect::<Vec<_>>() {
        if p.constraints[c].storage == Storage::Never {
            continue;
        }
        let Some(&first_active) = p.constraints[c]
            .positive_occs
            .iter()
            .find(|&&o| p.occs[o].active)
        else {
            continue;
        };
        let occ = &p.occs[first_active];
        let r = occ.rule;
        let consuming = occ.kind == HeadKind::Removed
            && !p.rules[r].dead
            && p.rules[r].guard.is_empty()
            && p.positive_heads(r).count() == 1
            && p.negative_heads(r).next().is_none();
        if !consuming {
            continue;
        }
        tracing::debug!(constraint = %p.constraints[c].name, "never stored");
        p.constraints[c].storage = Storage::Never;
        changed = true;
        let cut = p.occs[first_active].position;
        for &o in &p.constraints[c].positive_occs.clone() {
            if p.occs[o].position > cut && p.occs[o].active {
                p.occs[o].active = false;
            }
        }
        // Absence of a never-stored constraint holds vacuously, and nothing
        // is ever removed from its (nonexistent) store.
        for occ in p.occs.iter_mut() {
            if occ.constraint == c && occ.kind == HeadKind::Negative {
                occ.active = false;
            }
        }
    }
    changed
}

/// An active occurrence whose rule requires a partner lookup against a
/// never-stored constraint can never complete a match.
fn passivate_unmatchable(p: &mut Program) -> bool {
    let mut changed = false;
    for r in live_rules(p).collect::<Vec<_>>() {
        let positive: Vec<_> = p.positive_heads(r).collect();
        for &o in &positive {
            if !p.occs[o].active {
                continue;
            }
            let blocked = positive.iter().any(|&partner| {
                partner != o && p.constraints[p.occs[partner].constraint].storage == Storage::Never
            });
            if blocked {
                p.occs[o].active = false;
                changed = true;
            }
        }
    }
    changed
}

/// Sometimes-stored: an instance may be consumed during its own activation
/// walk, so whether it ends up in the store depends on the runtime path.
fn refine_storage(p: &mut Program) -> bool {
    let removable = removable_constraints(p);
    let mut changed = false;
    for (c, constraint) in p.constraints.iter_enumerate_mut() {
        if constraint.storage == Storage::Always && removable.contains(&c) {
            constraint.storage = Storage::Sometimes;
            changed = true;
        }
    }
    changed
}

/// Two occurrences of the same constraint in one rule are mirror images when
/// swapping their argument variables maps the whole rule onto itself. Only
/// the earlier one then needs matching code: each firing it finds is the
/// same match the later one would find with the roles exchanged.
///
/// Deliberately syntactic. The swap must be a consistent renaming, and the
/// comparison canonicalizes commutative guard atoms and unifications but
/// attempts no entailment reasoning.
fn detect_symmetry(p: &mut Program) -> bool {
    let mut changed = false;
    for r in live_rules(p).collect::<Vec<_>>() {
        let positive: Vec<_> = p.positive_heads(r).collect();
        for i in 0..positive.len() {
            for j in i + 1..positive.len() {
                let (b, a) = (positive[i], positive[j]);
                if !(p.occs[a].active && p.occs[b].active) {
                    continue;
                }
                if p.occs[a].constraint != p.occs[b].constraint {
                    continue;
                }
                if p.occs[b].kind != HeadKind::Removed {
                    continue;
                }
                let Some(swap) = argument_swap(&p.occs[a].args, &p.occs[b].args) else {
                    continue;
                };
                if rule_invariant_under(p, r, &swap) {
                    tracing::debug!(
                        rule = %p.rules[r].name,
                        subsumed = %format!("{a}"),
                        by = %format!("{b}"),
                        "symmetric occurrence passivated"
                    );
                    p.occs[a].active = false;
                    changed = true;
                }
            }
        }
    }
    changed
}

/// The involution exchanging the two argument vectors pointwise, or `None`
/// if the positions demand inconsistent renamings.
fn argument_swap(a: &[VarId], b: &[VarId]) -> Option<BTreeMap<VarId, VarId>> {
    let mut map = BTreeMap::new();
    for (&x, &y) in a.iter().zip(b) {
        for (from, to) in [(x, y), (y, x)] {
            match map.entry(from) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(to);
                }
                std::collections::btree_map::Entry::Occupied(e) => {
                    if *e.get() != to {
                        return None;
                    }
                }
            }
        }
    }
    Some(map)
}

fn rule_invariant_under(p: &Program, r: RuleId, swap: &BTreeMap<VarId, VarId>) -> bool {
    let rule = &p.rules[r];

    let head_shape = |args: &[VarId], rename: bool| -> Vec<VarId> {
        if rename {
            args.iter()
                .map(|v| swap.get(v).copied().unwrap_or(*v))
                .collect()
        } else {
            args.to_vec()
        }
    };
    let heads = |rename: bool| -> Vec<(HeadKind, ConstraintId, Vec<VarId>)> {
        let mut out: Vec<_> = rule
            .heads
            .iter()
            .map(|&o| {
                let occ = &p.occs[o];
                (occ.kind, occ.constraint, head_shape(&occ.args, rename))
            })
            .collect();
        out.sort();
        out
    };
    if heads(false) != heads(true) {
        return false;
    }

    let guards = |rename: bool| -> Vec<crate::ir::GuardTest> {
        let mut out: Vec<_> = rule
            .guard
            .iter()
            .map(|g| {
                if rename {
                    g.rename(swap).canonical()
                } else {
                    g.canonical()
                }
            })
            .collect();
        out.sort();
        out
    };
    if guards(false) != guards(true) {
        return false;
    }

    // Body order is execution order, so it must match element-wise.
    rule.body.iter().all(|step| {
        let renamed: BodyStep = step.rename(swap).canonical();
        renamed == step.canonical()
    })
}

/// Per-rule variable types, derived from the head columns (and compute
/// targets) that bind each variable. `None` for variables never bound.
pub(crate) fn rule_var_types(p: &Program, r: RuleId) -> TVec<VarId, Option<crate::ir::ValueType>> {
    use crate::ir::ValueType;
    let rule = &p.rules[r];
    let mut types: TVec<VarId, Option<ValueType>> =
        TVec::new_with_size(rule.var_names.len(), None);
    for &o in &rule.heads {
        let occ = &p.occs[o];
        for (i, &v) in occ.args.iter().enumerate() {
            let ty = p.constraints[occ.constraint].arg_types[crate::ids::ArgId(i)];
            if types[v].is_none() {
                types[v] = Some(ty);
            }
        }
    }
    for step in &rule.body {
        if let BodyStep::Compute { target, expr } = step {
            let ty = match expr {
                Expr::Lit(Literal::Int(_)) | Expr::BinOp(..) => ValueType::Int,
                Expr::Lit(Literal::Sym(_)) => ValueType::Sym,
                Expr::Var(v) => types[v].unwrap_or(ValueType::Int),
            };
            if types[target].is_none() {
                types[target] = Some(ty);
            }
        }
    }
    types
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ProgramBuilder, RuleBuilder, ValueType};
    use expect_test::expect;

    #[test]
    fn symmetric_occurrence_is_passivated() {
        let mut p = ProgramBuilder::new();
        let leq = p.constraint("leq", [ValueType::Var, ValueType::Var]);
        let mut r = RuleBuilder::new("antisymmetry");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.removed(leq, [x.into(), y.into()]);
        r.removed(leq, [y.into(), x.into()]);
        r.body_unify(x, y);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        expect![[r#"
            Program:

            leq(Var, Var) storage=Sometimes occs=[o0, o1]

            Rule "antisymmetry" [r0]:
              -leq(X, Y) @o0 active
              -leq(Y, X) @o1 passive
              => X = Y
        "#]]
        .assert_eq(&p.dbg_summary());
    }

    #[test]
    fn asymmetric_guard_blocks_symmetry() {
        let mut p = ProgramBuilder::new();
        let e = p.constraint("edge", [ValueType::Int, ValueType::Int]);
        let mut r = RuleBuilder::new("forward");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.removed(e, [x.into(), y.into()]);
        r.removed(e, [y.into(), x.into()]);
        r.guard_lt(x, y);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        // X < Y renamed is Y < X, a different guard: both sides stay active.
        assert!(p.occs.iter().all(|o| o.active));
    }

    #[test]
    fn never_stored_fixpoint() {
        let mut p = ProgramBuilder::new();
        let a = p.constraint("a", [ValueType::Int]);
        let b = p.constraint("b", [ValueType::Int]);
        // a is consumed by its only occurrence; the rule joining on a can
        // then never match, which in turn makes b never-stored.
        let mut r1 = RuleBuilder::new("consume_a");
        let x = r1.var("X");
        r1.removed(a, [x.into()]);
        let _rule = p.push_rule(r1);
        let mut r2 = RuleBuilder::new("join");
        let (x, y) = (r2.var("X"), r2.var("Y"));
        r2.removed(b, [x.into()]);
        r2.kept(a, [y.into()]);
        let _rule = p.push_rule(r2);
        let mut r3 = RuleBuilder::new("consume_b");
        let x = r3.var("X");
        r3.removed(b, [x.into()]);
        let _rule = p.push_rule(r3);
        let mut p = p.seal();
        run(&mut p, true);
        expect![[r#"
            Program:

            a(Int) storage=Never occs=[o0, o2]
            b(Int) storage=Never occs=[o1, o3]

            Rule "consume_a" [r0]:
              -a(X) @o0 active
              => true

            Rule "join" [r1] DEAD:
              -b(X) @o1 passive
              +a(Y) @o2 passive
              => true

            Rule "consume_b" [r2]:
              -b(X) @o3 active
              => true
        "#]]
        .assert_eq(&p.dbg_summary());
    }

    #[test]
    fn constant_false_guard_kills_rule() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("c", [ValueType::Int]);
        let mut r = RuleBuilder::new("never");
        let x = r.var("X");
        r.removed(c, [x.into()]);
        r.guard(CmpOp::Lt, 2, 1);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        assert!(p.rules.iter().all(|r| r.dead));
    }

    #[test]
    fn idempotence_rule_becomes_set_storage() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("reach", [ValueType::Int, ValueType::Int]);
        let mut r = RuleBuilder::new("dedup");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.removed(c, [x.into(), y.into()]);
        r.kept(c, [x.into(), y.into()]);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        assert!(p.set_semantic.contains(&ConstraintId(0)));
        assert!(p.rules.iter().all(|r| r.dead));
    }

    #[test]
    fn idempotence_after_another_occurrence_is_not_a_license() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("c", [ValueType::Int]);
        let out = p.constraint("out", [ValueType::Int]);
        // The propagation occurrence comes first in program order: a
        // duplicate's walk must fire it before the idempotence rule runs.
        let mut r = RuleBuilder::new("observe");
        let x = r.var("X");
        r.kept(c, [x.into()]);
        r.body_add(out, [x.into()]);
        let _rule = p.push_rule(r);
        let mut r = RuleBuilder::new("dedup");
        let x = r.var("X");
        r.removed(c, [x.into()]);
        r.kept(c, [x.into()]);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        assert!(p.set_semantic.is_empty());
        assert!(p.rules.iter().all(|r| !r.dead));
    }

    #[test]
    fn kept_head_first_idempotence_is_not_a_license() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("c", [ValueType::Int]);
        // `c \ c` removes the old instance and lets the newcomer walk on;
        // absorbing at introduction would keep the old one instead.
        let mut r = RuleBuilder::new("dedup");
        let x = r.var("X");
        r.kept(c, [x.into()]);
        r.removed(c, [x.into()]);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        assert!(p.set_semantic.is_empty());
    }

    #[test]
    fn negative_occurrence_of_never_removed_constraint_is_passive() {
        let mut p = ProgramBuilder::new();
        let mark = p.constraint("mark", [ValueType::Int]);
        let c = p.constraint("c", [ValueType::Int]);
        let mut r = RuleBuilder::new("unmarked");
        let x = r.var("X");
        r.removed(c, [x.into()]);
        r.absent(mark, [x.into()]);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        run(&mut p, true);
        // Nothing removes mark, so its absence can never start to hold.
        let neg = p
            .occs
            .iter()
            .find(|o| o.kind == HeadKind::Negative)
            .unwrap();
        assert!(!neg.active);
    }
}
