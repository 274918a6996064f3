//! Compiled output: structured decisions for a downstream renderer.
//!
//! Everything the emission side (or the in-crate interpreter) needs: one
//! storage decision and a set of lookup categories per constraint, one frozen
//! schedule per active occurrence, one firing plan per rule with its history
//! representation and its body split into continuation-sized units. All
//! cross-references are ids into the arenas here, per the occurrence graph
//! being mutually recursive.

use crate::{
    ids::{ArgId, CategoryId, ConstraintId, ContSiteId, LookupId, OccId, RuleId, SymId, VarId},
    ir::{self, Expr, GuardTest, Storage, ValueType},
    typed_vec::TVec,
};
use itertools::Itertools as _;
use std::collections::BTreeSet;

/// How one physical index is organized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CategoryKind {
    /// Insertion-ordered list. O(1) insert, O(n) scan.
    List,
    /// Hash index over an exact-equality key.
    Hash { key: Vec<ArgId> },
    /// Hash index over the full argument tuple that also deduplicates
    /// storage. Insertion of an existing tuple is absorbed.
    SetHash,
}

#[derive(Clone, Debug)]
pub(crate) struct Category {
    pub(crate) constraint: ConstraintId,
    pub(crate) kind: CategoryKind,
    /// Key columns can hold unbound logical variables, so binding one must
    /// reinsert affected facts under their new key.
    pub(crate) needs_rehash: bool,
}

impl Category {
    pub(crate) fn key_columns(&self, arity: usize) -> Vec<ArgId> {
        match &self.kind {
            CategoryKind::List => Vec::new(),
            CategoryKind::Hash { key } => key.clone(),
            CategoryKind::SetHash => (0..arity).map(ArgId).collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ConstraintPlan {
    pub(crate) name: String,
    pub(crate) arg_types: TVec<ArgId, ValueType>,
    pub(crate) storage: Storage,
    pub(crate) categories: Vec<CategoryId>,
    /// Set-semantics index consulted on insertion, when licensed.
    pub(crate) dedup: Option<CategoryId>,
    /// Per-fact history slots this constraint carries.
    pub(crate) flag_slots: usize,
    pub(crate) pset_slots: usize,
}

/// One schedule element.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    Lookup(LookupStep),
    /// Guard conjunct, placed at the earliest point where its variables are
    /// all bound.
    Guard(GuardTest),
    /// Two same-constraint head slots must be matched by distinct facts.
    Diff { a: usize, b: usize },
    /// Negative head: no live fact matching the keyed columns may exist.
    Absent(AbsentStep),
}

#[derive(Clone, Debug)]
pub(crate) struct LookupStep {
    /// Partner occurrence this lookup binds.
    pub(crate) occ: OccId,
    /// Slot in the rule instance's matched-fact array.
    pub(crate) head_slot: usize,
    pub(crate) category: CategoryId,
    pub(crate) lookup: LookupId,
    /// Probe expression per keyed column, evaluated before the lookup.
    pub(crate) key: Vec<(ArgId, Expr)>,
    /// Columns whose variables this lookup newly binds.
    pub(crate) binds: Vec<(ArgId, VarId)>,
    /// Enumeration state must survive, because a later step can reject a
    /// candidate or the schedule resumes after a firing.
    pub(crate) resumable: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct AbsentStep {
    pub(crate) occ: OccId,
    pub(crate) constraint: ConstraintId,
    pub(crate) category: CategoryId,
    pub(crate) lookup: LookupId,
    /// Unkeyed columns act as wildcards.
    pub(crate) key: Vec<(ArgId, Expr)>,
}

/// Compiled matching procedure for one occurrence.
///
/// Activation procedures are seeded with the newly activated fact; removal
/// procedures (for rules with a negative head on a removable constraint)
/// start from nothing and enumerate every positive head.
#[derive(Clone, Debug)]
pub(crate) struct Procedure {
    pub(crate) rule: RuleId,
    pub(crate) occ: OccId,
    /// Head slot the active fact occupies. `None` for removal procedures.
    pub(crate) active_slot: Option<usize>,
    /// Rule variables seeded from the active fact's arguments, in column
    /// order. Empty for removal procedures.
    pub(crate) active_args: Vec<VarId>,
    pub(crate) steps: Vec<Step>,
}

/// Propagation-history representation for one rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HistoryRepr {
    /// Single positive head: a flag bit on the instance itself.
    Flag { slot: usize },
    /// Two positive heads: partner ids recorded on the slot-0 instance.
    PartnerSet { slot: usize },
    /// Shared per-rule set of slot-ordered id tuples.
    TupleSet,
}

#[derive(Clone, Debug)]
pub(crate) struct HeadSlot {
    pub(crate) occ: OccId,
    pub(crate) constraint: ConstraintId,
    pub(crate) removed: bool,
}

/// Local body work that cannot re-enter the engine.
#[derive(Clone, Debug)]
pub(crate) enum LocalStep {
    Compute { target: VarId, expr: Expr },
    Fail,
}

/// Body step that can recursively trigger further matching.
#[derive(Clone, Debug)]
pub(crate) enum ReentrantStep {
    Add {
        constraint: ConstraintId,
        args: Vec<Expr>,
    },
    Unify {
        lhs: Expr,
        rhs: Expr,
    },
}

/// One continuation-sized unit of a rule body. Every unit except the last
/// ends in a re-entrant step.
#[derive(Clone, Debug)]
pub(crate) struct BodyUnit {
    pub(crate) steps: Vec<LocalStep>,
    pub(crate) reentrant: Option<ReentrantStep>,
    /// Continuation to push before performing the re-entrant step. `None`
    /// for the last unit, which returns directly.
    pub(crate) next: Option<ContSiteId>,
}

/// A resumption point: which unit to run and which variables it needs.
#[derive(Clone, Debug)]
pub(crate) struct ContSite {
    pub(crate) rule: RuleId,
    pub(crate) unit: usize,
    /// Live variables captured at the split, in ascending order.
    pub(crate) captures: Vec<VarId>,
}

#[derive(Clone, Debug)]
pub(crate) struct RulePlan {
    pub(crate) name: String,
    pub(crate) dead: bool,
    pub(crate) head_slots: Vec<HeadSlot>,
    pub(crate) history: Option<HistoryRepr>,
    pub(crate) units: Vec<BodyUnit>,
    pub(crate) var_names: TVec<VarId, String>,
}

/// The full compiled program.
#[derive(Clone, Debug)]
pub struct Program {
    pub(crate) symbols: TVec<SymId, String>,
    pub(crate) constraints: TVec<ConstraintId, ConstraintPlan>,
    pub(crate) categories: TVec<CategoryId, Category>,
    pub(crate) rules: TVec<RuleId, RulePlan>,
    /// Per constraint: procedures for its active positive occurrences, in
    /// program order. This is the activation walk.
    pub(crate) procedures: TVec<ConstraintId, Vec<Procedure>>,
    /// Per constraint: procedures to re-run when one of its facts is
    /// removed, one per active negative occurrence of the constraint.
    pub(crate) on_removal: TVec<ConstraintId, Vec<Procedure>>,
    pub(crate) cont_sites: TVec<ContSiteId, ContSite>,
}

impl Program {
    /// Checks the structural invariants of the compiled output. Violations
    /// are internal errors, not user diagnostics.
    pub(crate) fn validate(&self) {
        for (c, procs) in self.procedures.iter_enumerate() {
            for proc in procs {
                let slot = proc.active_slot.expect("activation procedure has a slot");
                let rule = &self.rules[proc.rule];
                assert_eq!(rule.head_slots[slot].constraint, c);
                assert_eq!(rule.head_slots[slot].occ, proc.occ);
                assert_eq!(proc.active_args.len(), self.constraints[c].arg_types.len());
                self.validate_procedure(proc);
            }
        }
        for procs in &self.on_removal {
            for proc in procs {
                assert!(proc.active_slot.is_none());
                assert!(proc.active_args.is_empty());
                self.validate_procedure(proc);
            }
        }
        for (cat_id, cat) in self.categories.iter_enumerate() {
            let plan = &self.constraints[cat.constraint];
            assert!(
                plan.categories.contains(&cat_id),
                "category {cat_id} not registered on {}",
                plan.name
            );
            let arity = plan.arg_types.len();
            let key = cat.key_columns(arity);
            assert!(key.iter().all(|&a| usize::from(a) < arity));
            assert!(key.iter().tuple_windows().all(|(a, b)| a < b));
            let expect_rehash = key
                .iter()
                .any(|&col| plan.arg_types[col] == ValueType::Var);
            assert_eq!(cat.needs_rehash, expect_rehash);
        }
        for (s, site) in self.cont_sites.iter_enumerate() {
            let rule = &self.rules[site.rule];
            assert!(site.unit < rule.units.len(), "site {s} out of range");
            assert!(site.captures.iter().tuple_windows().all(|(a, b)| a < b));
        }
        for (r, rule) in self.rules.iter_enumerate() {
            if rule.dead {
                assert!(rule.units.is_empty());
                continue;
            }
            self.validate_rule(r, rule);
        }
    }

    fn validate_procedure(&self, proc: &Procedure) {
        let rule = &self.rules[proc.rule];
        assert!(!rule.dead, "procedure for dead rule {}", rule.name);

        let mut bound: BTreeSet<VarId> = proc.active_args.iter().copied().collect();
        let mut bound_slots: BTreeSet<usize> = BTreeSet::new();
        bound_slots.extend(proc.active_slot);
        for step in &proc.steps {
            match step {
                Step::Lookup(l) => {
                    let cat = &self.categories[l.category];
                    let plan = &self.constraints[cat.constraint];
                    let arity = plan.arg_types.len();
                    let key_cols: Vec<ArgId> = l.key.iter().map(|&(a, _)| a).collect();
                    assert!(key_cols.iter().tuple_windows().all(|(x, y)| x < y));
                    match &cat.kind {
                        CategoryKind::List => assert!(l.key.is_empty()),
                        CategoryKind::Hash { key } => {
                            assert_eq!(&key_cols, key, "lookup key must match its category");
                        }
                        CategoryKind::SetHash => {
                            assert_eq!(key_cols.len(), arity, "set index is keyed on all columns");
                        }
                    }
                    for (_, probe) in &l.key {
                        probe.visit_vars(&mut |v| {
                            assert!(bound.contains(&v), "probe reads unbound variable");
                        });
                    }
                    let covered: BTreeSet<ArgId> = l
                        .key
                        .iter()
                        .map(|&(a, _)| a)
                        .chain(l.binds.iter().map(|&(a, _)| a))
                        .collect();
                    assert_eq!(covered.len(), arity, "every column is keyed or bound");
                    for &(_, v) in &l.binds {
                        assert!(bound.insert(v), "lookup rebinds an already-bound variable");
                    }
                    bound_slots.insert(l.head_slot);
                }
                Step::Guard(g) => {
                    for v in g.vars() {
                        assert!(bound.contains(&v), "guard reads unbound variable");
                    }
                }
                Step::Diff { a, b } => {
                    assert_ne!(a, b);
                    assert!(bound_slots.contains(a) && bound_slots.contains(b));
                    assert_eq!(
                        rule.head_slots[*a].constraint,
                        rule.head_slots[*b].constraint
                    );
                }
                Step::Absent(a) => {
                    let cat = &self.categories[a.category];
                    assert_eq!(cat.constraint, a.constraint);
                    for (_, probe) in &a.key {
                        probe.visit_vars(&mut |v| {
                            assert!(bound.contains(&v), "absence probe reads unbound variable");
                        });
                    }
                }
            }
        }
        // All positive heads must be matched by the end of the schedule.
        assert_eq!(
            bound_slots.len(),
            rule.head_slots.len(),
            "schedule for {} leaves head slots unmatched",
            rule.name
        );
    }

    fn validate_rule(&self, r: RuleId, rule: &RulePlan) {
        match &rule.history {
            None => {}
            Some(HistoryRepr::Flag { slot }) => {
                assert_eq!(rule.head_slots.len(), 1);
                let c = rule.head_slots[0].constraint;
                assert!(*slot < self.constraints[c].flag_slots);
            }
            Some(HistoryRepr::PartnerSet { slot }) => {
                assert_eq!(rule.head_slots.len(), 2);
                let c = rule.head_slots[0].constraint;
                assert!(*slot < self.constraints[c].pset_slots);
            }
            Some(HistoryRepr::TupleSet) => {
                assert!(rule.head_slots.len() > 2);
            }
        }
        for (i, unit) in rule.units.iter().enumerate() {
            if i + 1 < rule.units.len() {
                assert!(
                    unit.reentrant.is_some(),
                    "only the last unit of {} may end without a re-entrant step",
                    rule.name
                );
            }
            if let Some(next) = unit.next {
                let site = &self.cont_sites[next];
                assert_eq!(site.rule, r);
                assert_eq!(site.unit, i + 1);
            } else {
                assert_eq!(i + 1, rule.units.len(), "missing continuation site");
            }
        }
        // Units after the first run from their site's captures only.
        for site in self.cont_sites.iter().filter(|s| s.rule == r) {
            let mut avail: BTreeSet<VarId> = site.captures.iter().copied().collect();
            for unit in &rule.units[site.unit..] {
                self.validate_unit_reads(unit, &mut avail);
            }
        }
    }

    fn validate_unit_reads(&self, unit: &BodyUnit, avail: &mut BTreeSet<VarId>) {
        let check = |e: &Expr, avail: &BTreeSet<VarId>| {
            e.visit_vars(&mut |v| {
                assert!(avail.contains(&v), "body reads uncaptured variable");
            });
        };
        for step in &unit.steps {
            match step {
                LocalStep::Compute { target, expr } => {
                    check(expr, avail);
                    avail.insert(*target);
                }
                LocalStep::Fail => {}
            }
        }
        match &unit.reentrant {
            Some(ReentrantStep::Add { args, .. }) => args.iter().for_each(|a| check(a, avail)),
            Some(ReentrantStep::Unify { lhs, rhs }) => {
                check(lhs, avail);
                check(rhs, avail);
            }
            None => {}
        }
        // A continuation env can only shrink the frame, never grow it.
        if let Some(next) = unit.next {
            for v in &self.cont_sites[next].captures {
                assert!(avail.contains(v), "capture of unbound variable");
            }
        }
    }

    pub(crate) fn category_str(&self, cat_id: CategoryId) -> String {
        let cat = &self.categories[cat_id];
        let name = &self.constraints[cat.constraint].name;
        let rehash = if cat.needs_rehash { " rehash" } else { "" };
        match &cat.kind {
            CategoryKind::List => format!("{cat_id}: list({name}){rehash}"),
            CategoryKind::Hash { key } => format!(
                "{cat_id}: hash({name}; key=[{}]){rehash}",
                key.iter().map(|a| format!("{a}")).join(", ")
            ),
            CategoryKind::SetHash => format!("{cat_id}: set-hash({name}; all columns){rehash}"),
        }
    }

    #[must_use]
    pub fn dbg_summary(&self) -> String {
        use std::fmt::Write as _;

        let mut buf = String::new();
        macro_rules! wln {
            ($($arg:tt)*) => {
                writeln!(&mut buf, $($arg)*).unwrap();
            }
        }

        wln!("Plan:");
        wln!();
        for (c, plan) in self.constraints.iter_enumerate() {
            let ConstraintPlan {
                name,
                arg_types,
                storage,
                categories,
                dedup,
                flag_slots,
                pset_slots,
            } = plan;
            let dedup = (*dedup).map_or(String::new(), |d| format!(" dedup={d}"));
            let slots = match (*flag_slots, *pset_slots) {
                (0, 0) => String::new(),
                (f, p) => format!(" hist_slots(flag={f}, pset={p})"),
            };
            wln!(
                "{name}({}) storage={storage:?} categories=[{}]{dedup}{slots} procs={}",
                arg_types.iter().map(|t| format!("{t:?}")).join(", "),
                categories.iter().map(|x| format!("{x}")).join(", "),
                self.procedures[c].len(),
            );
        }
        if !self.categories.is_empty() {
            wln!();
            for cat_id in self.categories.enumerate() {
                wln!("{}", self.category_str(cat_id));
            }
        }
        for (r, rule) in self.rules.iter_enumerate() {
            wln!();
            if rule.dead {
                wln!("Rule {:?} [{r}] DEAD", rule.name);
                continue;
            }
            let history = match &rule.history {
                None => String::new(),
                Some(HistoryRepr::Flag { slot }) => format!(" history=flag[{slot}]"),
                Some(HistoryRepr::PartnerSet { slot }) => format!(" history=pset[{slot}]"),
                Some(HistoryRepr::TupleSet) => " history=tuples".to_string(),
            };
            wln!("Rule {:?} [{r}]{history}:", rule.name);
            for proc in self
                .procedures
                .iter()
                .chain(self.on_removal.iter())
                .flatten()
                .filter(|p| p.rule == r)
                .sorted_by_key(|p| p.active_slot.map_or(usize::MAX, |s| s))
            {
                match proc.active_slot {
                    Some(slot) => wln!(
                        "  procedure @{} slot{slot} {}({}):",
                        proc.occ,
                        self.constraints[rule.head_slots[slot].constraint].name,
                        proc.active_args
                            .iter()
                            .map(|v| rule.var_names[v].clone())
                            .join(", "),
                    ),
                    None => wln!("  procedure @{} on-removal:", proc.occ),
                }
                for step in &proc.steps {
                    wln!("    {}", self.step_str(rule, step));
                }
            }
            for (i, unit) in rule.units.iter().enumerate() {
                let next = unit.next.map_or(String::new(), |k| {
                    format!(
                        " then push {k}[{}]",
                        self.cont_sites[k]
                            .captures
                            .iter()
                            .map(|v| rule.var_names[v].clone())
                            .join(", ")
                    )
                });
                let steps = unit
                    .steps
                    .iter()
                    .map(|s| self.local_step_str(rule, s))
                    .join("; ");
                let reentrant = match &unit.reentrant {
                    None => String::new(),
                    Some(s) => {
                        let sep = if steps.is_empty() { "" } else { "; " };
                        format!("{sep}{}", self.reentrant_str(rule, s))
                    }
                };
                let steps = if steps.is_empty() && reentrant.is_empty() {
                    "(empty)".to_string()
                } else {
                    format!("{steps}{reentrant}")
                };
                wln!("  unit {i}: {steps}{next}");
            }
        }
        buf
    }

    fn expr_str(&self, rule: &RulePlan, e: &Expr) -> String {
        match e {
            Expr::Lit(ir::Literal::Int(x)) => format!("{x}"),
            Expr::Lit(ir::Literal::Sym(s)) => format!("'{}", self.symbols[s]),
            Expr::Var(v) => rule.var_names[v].clone(),
            Expr::BinOp(op, lhs, rhs) => {
                let op = match op {
                    ir::BinOp::Add => "+",
                    ir::BinOp::Sub => "-",
                    ir::BinOp::Mul => "*",
                };
                format!(
                    "({} {op} {})",
                    self.expr_str(rule, lhs),
                    self.expr_str(rule, rhs)
                )
            }
        }
    }

    fn step_str(&self, rule: &RulePlan, step: &Step) -> String {
        match step {
            Step::Lookup(l) => {
                let key = l
                    .key
                    .iter()
                    .map(|(a, e)| format!("{a}={}", self.expr_str(rule, e)))
                    .join(", ");
                let binds = l
                    .binds
                    .iter()
                    .map(|(a, v)| format!("{a}->{}", rule.var_names[v].clone()))
                    .join(", ");
                let resumable = if l.resumable { " resumable" } else { "" };
                format!(
                    "lookup slot{} via {} key[{key}] binds[{binds}]{resumable}",
                    l.head_slot, l.category
                )
            }
            Step::Guard(g) => {
                let op = match g.op {
                    ir::CmpOp::Eq => "==",
                    ir::CmpOp::Ne => "!=",
                    ir::CmpOp::Lt => "<",
                    ir::CmpOp::Le => "<=",
                    ir::CmpOp::Gt => ">",
                    ir::CmpOp::Ge => ">=",
                };
                format!(
                    "guard {} {op} {}",
                    self.expr_str(rule, &g.lhs),
                    self.expr_str(rule, &g.rhs)
                )
            }
            Step::Diff { a, b } => format!("diff slot{a} slot{b}"),
            Step::Absent(a) => {
                let key = a
                    .key
                    .iter()
                    .map(|(col, e)| format!("{col}={}", self.expr_str(rule, e)))
                    .join(", ");
                format!(
                    "absent {} via {} key[{key}]",
                    self.constraints[a.constraint].name, a.category
                )
            }
        }
    }

    fn local_step_str(&self, rule: &RulePlan, step: &LocalStep) -> String {
        match step {
            LocalStep::Compute { target, expr } => format!(
                "{} := {}",
                rule.var_names[target],
                self.expr_str(rule, expr)
            ),
            LocalStep::Fail => "fail".to_string(),
        }
    }

    fn reentrant_str(&self, rule: &RulePlan, step: &ReentrantStep) -> String {
        match step {
            ReentrantStep::Add { constraint, args } => format!(
                "add {}({})",
                self.constraints[constraint].name,
                args.iter().map(|a| self.expr_str(rule, a)).join(", ")
            ),
            ReentrantStep::Unify { lhs, rhs } => format!(
                "unify {} = {}",
                self.expr_str(rule, lhs),
                self.expr_str(rule, rhs)
            ),
        }
    }
}
