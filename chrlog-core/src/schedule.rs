//! Schedule synthesis: one ordered matching plan per active occurrence.
//!
//! Partner lookups follow head declaration order. Guard conjuncts float to
//! the earliest point where all their variables are bound, so candidate
//! enumeration is cut off as soon as possible. A different-partners test
//! follows any lookup whose constraint already occupies a bound slot.
//! Lookups get a resumable label exactly when some later step can reject a
//! candidate or when enumeration continues past a firing.
//!
//! The lookup categories referenced by the produced steps are placeholders;
//! the index selector resolves every registered usage to a category
//! afterwards.

use crate::{
    CompileError,
    ids::{ArgId, CategoryId, ConstraintId, LookupId, OccId, RuleId, VarId},
    ir::{CmpOp, Expr, GuardTest, HeadKind, Program, Storage, ValueType},
    optimize,
    plan::{AbsentStep, LookupStep, Procedure, Step},
    typed_vec::TVec,
};
use std::collections::BTreeSet;

/// One keyed query some schedule performs, before index selection.
#[derive(Clone, Debug)]
pub(crate) struct Usage {
    pub(crate) constraint: ConstraintId,
    /// Occurrence the lookup serves, for diagnostics.
    pub(crate) occ: OccId,
    pub(crate) key: BTreeSet<ArgId>,
}

pub(crate) struct Synthesis {
    pub(crate) procedures: TVec<ConstraintId, Vec<Procedure>>,
    pub(crate) on_removal: TVec<ConstraintId, Vec<Procedure>>,
    pub(crate) usages: TVec<LookupId, Usage>,
}

pub(crate) fn synthesize(p: &Program) -> Result<Synthesis, CompileError> {
    let mut out = Synthesis {
        procedures: p.constraints.map(|_| Vec::new()),
        on_removal: p.constraints.map(|_| Vec::new()),
        usages: TVec::new(),
    };

    for (r, rule) in p.rules.iter_enumerate() {
        if rule.dead {
            continue;
        }
        let ctx = RuleCtx::prepare(p, r)?;

        for (slot, &o) in ctx.positive.iter().enumerate() {
            if !p.occs[o].active {
                continue;
            }
            let proc = ctx.schedule(p, &mut out.usages, Some(slot));
            out.procedures[p.occs[o].constraint].push(proc);
        }

        // One removal-triggered recheck per negated constraint that can
        // actually lose facts.
        let mut rechecked: BTreeSet<ConstraintId> = BTreeSet::new();
        for neg in &ctx.negatives {
            let c = p.occs[neg.occ].constraint;
            if p.occs[neg.occ].active && rechecked.insert(c) {
                let mut proc = ctx.schedule(p, &mut out.usages, None);
                proc.occ = neg.occ;
                out.on_removal[c].push(proc);
            }
        }
    }

    // Activation walks the occurrences in program order.
    for (c, procs) in out.procedures.iter_enumerate_mut() {
        procs.sort_by_key(|proc| p.occs[proc.occ].position);
        tracing::debug!(
            constraint = %p.constraints[c].name,
            procedures = procs.len(),
            "synthesized schedules"
        );
    }
    Ok(out)
}

struct NegCtx {
    occ: OccId,
    constraint: ConstraintId,
    /// Bound before the check runs; unkeyed columns are wildcards.
    key: Vec<(ArgId, Expr)>,
    required: BTreeSet<VarId>,
    /// Absence of a never-stored constraint holds vacuously.
    vacuous: bool,
}

struct RuleCtx {
    rule: RuleId,
    /// Positive heads in textual order; the index is the head slot.
    positive: Vec<OccId>,
    guards: Vec<GuardTest>,
    negatives: Vec<NegCtx>,
}

impl RuleCtx {
    fn prepare(p: &Program, r: RuleId) -> Result<Self, CompileError> {
        let rule = &p.rules[r];
        let types = optimize::rule_var_types(p, r);

        let positive: Vec<OccId> = p.positive_heads(r).collect();
        let bindable: BTreeSet<VarId> = positive
            .iter()
            .flat_map(|&o| p.occs[o].args.iter().copied())
            .collect();

        let mut negatives: Vec<NegCtx> = p
            .negative_heads(r)
            .map(|o| {
                let occ = &p.occs[o];
                let key: Vec<(ArgId, Expr)> = occ
                    .args
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| bindable.contains(v))
                    .map(|(i, &v)| (ArgId(i), Expr::Var(v)))
                    .collect();
                let required = key.iter().flat_map(|(_, e)| e.vars()).collect();
                NegCtx {
                    occ: o,
                    constraint: occ.constraint,
                    key,
                    required,
                    vacuous: p.constraints[occ.constraint].storage == Storage::Never,
                }
            })
            .collect();

        let mut guards = Vec::new();
        for g in &rule.guard {
            let vars = g.vars();
            for &v in &vars {
                if types[v] == Some(ValueType::Opaque) {
                    return Err(CompileError::OpaqueGuard {
                        rule: rule.name.clone(),
                        guard: p.guard_str(r, g),
                    });
                }
            }
            if vars.is_subset(&bindable) {
                guards.push(g.clone());
                continue;
            }
            // An equality pinning a variable that only a negative head
            // mentions becomes part of that head's absence key.
            if !fold_into_negative_key(p, g, &bindable, &mut negatives) {
                return Err(CompileError::UnboundGuard {
                    rule: rule.name.clone(),
                    guard: p.guard_str(r, g),
                });
            }
        }

        Ok(RuleCtx {
            rule: r,
            positive,
            guards,
            negatives,
        })
    }

    /// Builds the ordered schedule for one trigger: activation of the fact
    /// at `active_slot`, or (`None`) removal-triggered rechecking, which
    /// starts with nothing bound and enumerates every positive head.
    fn schedule(
        &self,
        p: &Program,
        usages: &mut TVec<LookupId, Usage>,
        active_slot: Option<usize>,
    ) -> Procedure {
        let mut steps: Vec<Step> = Vec::new();
        let mut bound: BTreeSet<VarId> = BTreeSet::new();
        let mut bound_slots: Vec<usize> = Vec::new();
        let mut guards_left: Vec<GuardTest> = self.guards.clone();
        let mut negs_left: Vec<&NegCtx> =
            self.negatives.iter().filter(|n| !n.vacuous).collect();

        if let Some(slot) = active_slot {
            bound.extend(p.occs[self.positive[slot]].args.iter().copied());
            bound_slots.push(slot);
        }
        emit_ready(&mut steps, &mut bound, &mut guards_left, &mut negs_left, usages);

        for (slot, &o) in self.positive.iter().enumerate() {
            if Some(slot) == active_slot {
                continue;
            }
            let occ = &p.occs[o];
            let mut key = Vec::new();
            let mut binds = Vec::new();
            for (i, &v) in occ.args.iter().enumerate() {
                if bound.contains(&v) {
                    key.push((ArgId(i), Expr::Var(v)));
                } else {
                    binds.push((ArgId(i), v));
                }
            }
            let lookup = usages.push(Usage {
                constraint: occ.constraint,
                occ: o,
                key: key.iter().map(|&(a, _)| a).collect(),
            });
            steps.push(Step::Lookup(LookupStep {
                occ: o,
                head_slot: slot,
                category: CategoryId::bogus(),
                lookup,
                key,
                binds: binds.clone(),
                resumable: false,
            }));
            for &prior in &bound_slots {
                if p.occs[self.positive[prior]].constraint == occ.constraint {
                    steps.push(Step::Diff {
                        a: prior,
                        b: slot,
                    });
                }
            }
            bound.extend(binds.iter().map(|&(_, v)| v));
            bound_slots.push(slot);
            emit_ready(&mut steps, &mut bound, &mut guards_left, &mut negs_left, usages);
        }

        assert!(
            guards_left.is_empty() && negs_left.is_empty(),
            "rule {}: unplaceable schedule elements",
            p.rules[self.rule].name
        );

        let active_continues =
            active_slot.is_none_or(|slot| p.occs[self.positive[slot]].kind == HeadKind::Kept);
        label_resumable(&mut steps, active_continues);

        let (occ, active_args) = match active_slot {
            Some(slot) => {
                let o = self.positive[slot];
                (o, p.occs[o].args.clone())
            }
            // Placeholder; the caller substitutes the negative occurrence.
            None => (self.positive[0], Vec::new()),
        };
        Procedure {
            rule: self.rule,
            occ,
            active_slot,
            active_args,
            steps,
        }
    }
}

/// Appends every guard and negative check whose variables are all bound, in
/// declaration order.
fn emit_ready(
    steps: &mut Vec<Step>,
    bound: &mut BTreeSet<VarId>,
    guards_left: &mut Vec<GuardTest>,
    negs_left: &mut Vec<&NegCtx>,
    usages: &mut TVec<LookupId, Usage>,
) {
    guards_left.retain(|g| {
        if g.vars().is_subset(bound) {
            steps.push(Step::Guard(g.clone()));
            false
        } else {
            true
        }
    });
    negs_left.retain(|neg| {
        if neg.required.is_subset(bound) {
            let lookup = usages.push(Usage {
                constraint: neg.constraint,
                occ: neg.occ,
                key: neg.key.iter().map(|&(a, _)| a).collect(),
            });
            steps.push(Step::Absent(AbsentStep {
                occ: neg.occ,
                constraint: neg.constraint,
                category: CategoryId::bogus(),
                lookup,
                key: neg.key.clone(),
            }));
            false
        } else {
            true
        }
    });
}

/// A lookup must keep its enumeration state when any later step can reject
/// the candidate, or when the schedule is re-entered after a firing because
/// the trigger survives it.
fn label_resumable(steps: &mut [Step], active_continues: bool) {
    let n = steps.len();
    for i in 0..n {
        let later = i + 1 < n;
        if let Step::Lookup(l) = &mut steps[i] {
            l.resumable = later || active_continues;
        }
    }
}

/// Folds `fresh == expr` into the absence key of the negative heads that
/// mention `fresh`. Returns false if the guard cannot be placed anywhere.
fn fold_into_negative_key(
    p: &Program,
    g: &GuardTest,
    bindable: &BTreeSet<VarId>,
    negatives: &mut [NegCtx],
) -> bool {
    if g.op != CmpOp::Eq {
        return false;
    }
    let (f, expr) = match (&g.lhs, &g.rhs) {
        (Expr::Var(v), e) if !bindable.contains(v) && e.vars().is_subset(bindable) => (*v, e),
        (e, Expr::Var(v)) if !bindable.contains(v) && e.vars().is_subset(bindable) => (*v, e),
        _ => return false,
    };
    let mut placed = false;
    for neg in negatives.iter_mut() {
        for (i, &v) in p.occs[neg.occ].args.iter().enumerate() {
            if v == f {
                neg.key.push((ArgId(i), expr.clone()));
                neg.key.sort_by_key(|&(a, _)| a);
                neg.required.extend(expr.vars());
                placed = true;
            }
        }
    }
    placed
}
