//! Input representation of a rule program.
//!
//! Constraints, rules, occurrences, guards and bodies, as handed over by the
//! front end. The builder performs the front end's last normalization step:
//! head arguments become distinct variables, with duplicates and literals
//! turned into fresh variables plus equality guard conjuncts. Everything past
//! [`ProgramBuilder::seal`] is consumed read-only, except for the optimizer
//! annotations (`active` flags, storage classification, set semantics).

use crate::{
    ids::{ArgId, ConstraintId, OccId, RuleId, SymId, VarId},
    typed_vec::TVec,
};
use itertools::Itertools as _;
use std::collections::{BTreeMap, BTreeSet};

/// Formal parameter type of a constraint argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    /// Ground integer, has equality and ordering.
    Int,
    /// Interned symbol, has equality.
    Sym,
    /// Logical variable slot, mutable until bound. Indexing on such a column
    /// requires rehash support.
    Var,
    /// No equality operation. Keying an index on such a column is a
    /// generation-blocking error.
    Opaque,
}

/// Storage classification, refined in place by the optimizer.
/// Transitions are monotonic: `Always` -> `Sometimes` -> `Never`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Storage {
    Always,
    Sometimes,
    Never,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeadKind {
    /// Match survives the firing.
    Kept,
    /// Match is deleted at commit.
    Removed,
    /// No matching fact may exist for the rule to fire.
    Negative,
}

/// Rule kind as exposed by the front end, derived from head kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleKind {
    Simplification,
    Propagation,
    Simpagation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Literal {
    Int(i64),
    Sym(SymId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub(crate) fn commutative(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

/// Side-effect-free expression over rule variables.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    Lit(Literal),
    Var(VarId),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
}

impl From<VarId> for Expr {
    fn from(v: VarId) -> Self {
        Expr::Var(v)
    }
}
impl From<i64> for Expr {
    fn from(x: i64) -> Self {
        Expr::Lit(Literal::Int(x))
    }
}
impl From<SymId> for Expr {
    fn from(s: SymId) -> Self {
        Expr::Lit(Literal::Sym(s))
    }
}

impl Expr {
    #[must_use]
    pub fn add(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Expr {
        Expr::BinOp(BinOp::Add, Box::new(lhs.into()), Box::new(rhs.into()))
    }
    #[must_use]
    pub fn sub(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Expr {
        Expr::BinOp(BinOp::Sub, Box::new(lhs.into()), Box::new(rhs.into()))
    }
    #[must_use]
    pub fn mul(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Expr {
        Expr::BinOp(BinOp::Mul, Box::new(lhs.into()), Box::new(rhs.into()))
    }
    pub(crate) fn visit_vars(&self, f: &mut impl FnMut(VarId)) {
        match self {
            Expr::Lit(_) => {}
            Expr::Var(v) => f(*v),
            Expr::BinOp(_, lhs, rhs) => {
                lhs.visit_vars(f);
                rhs.visit_vars(f);
            }
        }
    }
    pub(crate) fn vars(&self) -> BTreeSet<VarId> {
        let mut out = BTreeSet::new();
        self.visit_vars(&mut |v| {
            out.insert(v);
        });
        out
    }
    /// Applies a variable substitution, leaving unmapped variables in place.
    pub(crate) fn rename(&self, map: &BTreeMap<VarId, VarId>) -> Expr {
        match self {
            Expr::Lit(l) => Expr::Lit(*l),
            Expr::Var(v) => Expr::Var(map.get(v).copied().unwrap_or(*v)),
            Expr::BinOp(op, lhs, rhs) => {
                Expr::BinOp(*op, Box::new(lhs.rename(map)), Box::new(rhs.rename(map)))
            }
        }
    }
}

/// One guard conjunct.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuardTest {
    pub(crate) op: CmpOp,
    pub(crate) lhs: Expr,
    pub(crate) rhs: Expr,
}

impl GuardTest {
    pub(crate) fn vars(&self) -> BTreeSet<VarId> {
        let mut out = self.lhs.vars();
        out.extend(self.rhs.vars());
        out
    }
    /// Orders commutative operands so that syntactic comparison ignores
    /// operand order for `==` and `!=`.
    pub(crate) fn canonical(&self) -> GuardTest {
        let mut out = self.clone();
        if out.op.commutative() && out.rhs < out.lhs {
            std::mem::swap(&mut out.lhs, &mut out.rhs);
        }
        out
    }
    pub(crate) fn rename(&self, map: &BTreeMap<VarId, VarId>) -> GuardTest {
        GuardTest {
            op: self.op,
            lhs: self.lhs.rename(map),
            rhs: self.rhs.rename(map),
        }
    }
}

/// One step of a rule body, executed in order at commit.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BodyStep {
    /// Adds a new constraint. Re-enters the engine.
    Add {
        constraint: ConstraintId,
        args: Vec<Expr>,
    },
    /// Unifies two values. Binding a logical variable re-enters the engine
    /// through rehash and reactivation.
    Unify { lhs: Expr, rhs: Expr },
    /// Binds a body-local variable. Runs in place.
    Compute { target: VarId, expr: Expr },
    /// Aborts the whole computation.
    Fail,
}

impl BodyStep {
    pub(crate) fn reentrant(&self) -> bool {
        matches!(self, BodyStep::Add { .. } | BodyStep::Unify { .. })
    }
    pub(crate) fn canonical(&self) -> BodyStep {
        match self {
            BodyStep::Unify { lhs, rhs } if rhs < lhs => BodyStep::Unify {
                lhs: rhs.clone(),
                rhs: lhs.clone(),
            },
            other => other.clone(),
        }
    }
    pub(crate) fn rename(&self, map: &BTreeMap<VarId, VarId>) -> BodyStep {
        match self {
            BodyStep::Add { constraint, args } => BodyStep::Add {
                constraint: *constraint,
                args: args.iter().map(|a| a.rename(map)).collect(),
            },
            BodyStep::Unify { lhs, rhs } => BodyStep::Unify {
                lhs: lhs.rename(map),
                rhs: rhs.rename(map),
            },
            BodyStep::Compute { target, expr } => BodyStep::Compute {
                target: map.get(target).copied().unwrap_or(*target),
                expr: expr.rename(map),
            },
            BodyStep::Fail => BodyStep::Fail,
        }
    }
}

/// A user-defined constraint.
#[derive(Clone, Debug)]
pub struct Constraint {
    pub(crate) name: String,
    pub(crate) arg_types: TVec<ArgId, ValueType>,
    /// Alias used by the source syntax, kept for diagnostics only.
    pub(crate) infix: Option<String>,
    pub(crate) storage: Storage,
    /// Positive occurrences in program order. This is the activation order.
    pub(crate) positive_occs: Vec<OccId>,
}

impl Constraint {
    pub(crate) fn arity(&self) -> usize {
        self.arg_types.len()
    }
}

/// One appearance of a constraint in a rule head.
#[derive(Clone, Debug)]
pub struct Occurrence {
    pub(crate) rule: RuleId,
    pub(crate) constraint: ConstraintId,
    pub(crate) kind: HeadKind,
    /// Index into the owning rule's textual head list.
    pub(crate) head_index: usize,
    /// Program order among this constraint's positive occurrences.
    /// `usize::MAX` for negative occurrences, which are never activated.
    pub(crate) position: usize,
    pub(crate) args: Vec<VarId>,
    /// One-way transition `true -> false`, performed by the optimizer.
    pub(crate) active: bool,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub(crate) name: String,
    /// All heads in textual order, positive and negative.
    pub(crate) heads: Vec<OccId>,
    pub(crate) guard: Vec<GuardTest>,
    pub(crate) body: Vec<BodyStep>,
    /// Set for propagation rules. Firing records partner identities so the
    /// same combination fires at most once.
    pub(crate) needs_history: bool,
    /// Set by dead-rule elimination. Dead rules stay in the arena so rule
    /// ids remain stable.
    pub(crate) dead: bool,
    pub(crate) var_names: TVec<VarId, String>,
}

/// A sealed program: the unit of compilation.
#[derive(Clone, Debug)]
pub struct Program {
    pub(crate) symbols: TVec<SymId, String>,
    pub(crate) constraints: TVec<ConstraintId, Constraint>,
    pub(crate) rules: TVec<RuleId, Rule>,
    pub(crate) occs: TVec<OccId, Occurrence>,
    /// Constraints whose storage may deduplicate full-tuple duplicates,
    /// licensed by an idempotence rule. Filled in by the optimizer.
    pub(crate) set_semantic: BTreeSet<ConstraintId>,
}

impl Program {
    pub(crate) fn positive_heads(&self, rule: RuleId) -> impl Iterator<Item = OccId> + '_ {
        self.rules[rule]
            .heads
            .iter()
            .copied()
            .filter(|&o| self.occs[o].kind != HeadKind::Negative)
    }
    pub(crate) fn negative_heads(&self, rule: RuleId) -> impl Iterator<Item = OccId> + '_ {
        self.rules[rule]
            .heads
            .iter()
            .copied()
            .filter(|&o| self.occs[o].kind == HeadKind::Negative)
    }
    pub(crate) fn rule_kind(&self, rule: RuleId) -> RuleKind {
        let removed = self
            .positive_heads(rule)
            .any(|o| self.occs[o].kind == HeadKind::Removed);
        let kept = self
            .positive_heads(rule)
            .any(|o| self.occs[o].kind == HeadKind::Kept);
        match (kept, removed) {
            (_, false) => RuleKind::Propagation,
            (false, true) => RuleKind::Simplification,
            (true, true) => RuleKind::Simpagation,
        }
    }
    pub(crate) fn var_name(&self, rule: RuleId, v: VarId) -> &str {
        &self.rules[rule].var_names[v]
    }

    pub(crate) fn expr_str(&self, rule: RuleId, e: &Expr) -> String {
        match e {
            Expr::Lit(Literal::Int(x)) => format!("{x}"),
            Expr::Lit(Literal::Sym(s)) => format!("'{}", self.symbols[s]),
            Expr::Var(v) => self.var_name(rule, *v).to_string(),
            Expr::BinOp(op, lhs, rhs) => {
                let op = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                };
                format!(
                    "({} {op} {})",
                    self.expr_str(rule, lhs),
                    self.expr_str(rule, rhs)
                )
            }
        }
    }
    pub(crate) fn guard_str(&self, rule: RuleId, g: &GuardTest) -> String {
        let op = match g.op {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        format!(
            "{} {op} {}",
            self.expr_str(rule, &g.lhs),
            self.expr_str(rule, &g.rhs)
        )
    }
    pub(crate) fn body_step_str(&self, rule: RuleId, step: &BodyStep) -> String {
        match step {
            BodyStep::Add { constraint, args } => format!(
                "{}({})",
                self.constraints[constraint].name,
                args.iter().map(|a| self.expr_str(rule, a)).join(", ")
            ),
            BodyStep::Unify { lhs, rhs } => format!(
                "{} = {}",
                self.expr_str(rule, lhs),
                self.expr_str(rule, rhs)
            ),
            BodyStep::Compute { target, expr } => format!(
                "{} := {}",
                self.var_name(rule, *target),
                self.expr_str(rule, expr)
            ),
            BodyStep::Fail => "fail".to_string(),
        }
    }
    pub(crate) fn occ_str(&self, o: OccId) -> String {
        let occ = &self.occs[o];
        let marker = match occ.kind {
            HeadKind::Kept => "+",
            HeadKind::Removed => "-",
            HeadKind::Negative => "!",
        };
        format!(
            "{marker}{}({})",
            self.constraints[occ.constraint].name,
            occ.args
                .iter()
                .map(|v| self.var_name(occ.rule, *v))
                .join(", ")
        )
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

        wln!("Program:");
        wln!();
        for (c, constraint) in self.constraints.iter_enumerate() {
            let Constraint {
                name,
                arg_types,
                infix,
                storage,
                positive_occs,
            } = constraint;
            let infix = infix
                .as_ref()
                .map(|i| format!(" aka {i:?}"))
                .unwrap_or_default();
            let set = if self.set_semantic.contains(&c) {
                " set"
            } else {
                ""
            };
            wln!(
                "{name}({}){infix} storage={storage:?}{set} occs=[{}]",
                arg_types.iter().map(|t| format!("{t:?}")).join(", "),
                positive_occs.iter().map(|o| format!("{o}")).join(", "),
            );
        }
        for (r, rule) in self.rules.iter_enumerate() {
            let Rule {
                name,
                heads,
                guard,
                body,
                needs_history,
                dead,
                var_names: _,
            } = rule;
            wln!();
            let dead = if *dead { " DEAD" } else { "" };
            let history = if *needs_history { " history" } else { "" };
            wln!("Rule {name:?} [{}]{history}{dead}:", format!("{r}"));
            for &o in heads {
                let occ = &self.occs[o];
                let state = if occ.active { "active" } else { "passive" };
                wln!("  {} @{o} {state}", self.occ_str(o));
            }
            if !guard.is_empty() {
                wln!("  guard {}", guard.iter().map(|g| self.guard_str(r, g)).join(", "));
            }
            if body.is_empty() {
                wln!("  => true");
            } else {
                wln!(
                    "  => {}",
                    body.iter().map(|s| self.body_step_str(r, s)).join("; ")
                );
            }
        }
        buf
    }
}

/// Head argument accepted by the builder. Literals and repeated variables
/// are normalized into fresh variables plus equality guard conjuncts.
#[derive(Copy, Clone, Debug)]
pub enum HeadArg {
    Var(VarId),
    Lit(Literal),
}

impl From<VarId> for HeadArg {
    fn from(v: VarId) -> Self {
        HeadArg::Var(v)
    }
}
impl From<i64> for HeadArg {
    fn from(x: i64) -> Self {
        HeadArg::Lit(Literal::Int(x))
    }
}
impl From<SymId> for HeadArg {
    fn from(s: SymId) -> Self {
        HeadArg::Lit(Literal::Sym(s))
    }
}

/// Builds one rule. Heads, guard conjuncts and body steps are recorded in
/// call order; call order is the textual order of the source rule.
pub struct RuleBuilder {
    name: String,
    var_names: TVec<VarId, String>,
    heads: Vec<(HeadKind, ConstraintId, Vec<HeadArg>)>,
    guard: Vec<GuardTest>,
    body: Vec<BodyStep>,
}

impl RuleBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            var_names: TVec::new(),
            heads: Vec::new(),
            guard: Vec::new(),
            body: Vec::new(),
        }
    }
    /// Declares a rule variable.
    pub fn var(&mut self, name: &str) -> VarId {
        self.var_names.push(name.to_string())
    }
    pub fn kept(&mut self, c: ConstraintId, args: impl IntoIterator<Item = HeadArg>) {
        self.heads.push((HeadKind::Kept, c, args.into_iter().collect()));
    }
    pub fn removed(&mut self, c: ConstraintId, args: impl IntoIterator<Item = HeadArg>) {
        self.heads
            .push((HeadKind::Removed, c, args.into_iter().collect()));
    }
    /// Negative head: no matching fact may exist. Arguments not mentioned
    /// elsewhere act as wildcards.
    pub fn absent(&mut self, c: ConstraintId, args: impl IntoIterator<Item = HeadArg>) {
        self.heads
            .push((HeadKind::Negative, c, args.into_iter().collect()));
    }
    pub fn guard(&mut self, op: CmpOp, lhs: impl Into<Expr>, rhs: impl Into<Expr>) {
        self.guard.push(GuardTest {
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
    }
    pub fn guard_eq(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>) {
        self.guard(CmpOp::Eq, lhs, rhs);
    }
    pub fn guard_ne(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>) {
        self.guard(CmpOp::Ne, lhs, rhs);
    }
    pub fn guard_lt(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>) {
        self.guard(CmpOp::Lt, lhs, rhs);
    }
    pub fn guard_gt(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>) {
        self.guard(CmpOp::Gt, lhs, rhs);
    }
    pub fn body_add(&mut self, c: ConstraintId, args: impl IntoIterator<Item = Expr>) {
        self.body.push(BodyStep::Add {
            constraint: c,
            args: args.into_iter().collect(),
        });
    }
    pub fn body_unify(&mut self, lhs: impl Into<Expr>, rhs: impl Into<Expr>) {
        self.body.push(BodyStep::Unify {
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
    }
    /// Binds a fresh body-local variable to an evaluated expression.
    pub fn body_compute(&mut self, target: VarId, expr: impl Into<Expr>) {
        self.body.push(BodyStep::Compute {
            target,
            expr: expr.into(),
        });
    }
    pub fn body_fail(&mut self) {
        self.body.push(BodyStep::Fail);
    }
}

/// Builds a sealed [`Program`].
///
/// Panics on structural misuse (arity mismatch, undeclared variables);
/// the front end is assumed to hand over resolved, type-checked rules.
#[derive(Default)]
pub struct ProgramBuilder {
    symbols: TVec<SymId, String>,
    symbol_dedup: BTreeMap<String, SymId>,
    constraints: TVec<ConstraintId, Constraint>,
    rules: Vec<Rule>,
    // textual heads per rule, normalized, not yet in the occurrence arena
    rule_heads: Vec<Vec<(HeadKind, ConstraintId, Vec<VarId>)>>,
}

impl ProgramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    pub fn sym(&mut self, name: &str) -> SymId {
        if let Some(&s) = self.symbol_dedup.get(name) {
            return s;
        }
        let s = self.symbols.push(name.to_string());
        self.symbol_dedup.insert(name.to_string(), s);
        s
    }
    pub fn constraint(
        &mut self,
        name: &str,
        arg_types: impl IntoIterator<Item = ValueType>,
    ) -> ConstraintId {
        self.constraint_full(name, None, arg_types)
    }
    pub fn constraint_full(
        &mut self,
        name: &str,
        infix: Option<&str>,
        arg_types: impl IntoIterator<Item = ValueType>,
    ) -> ConstraintId {
        assert!(
            self.constraints.iter().all(|c| c.name != name),
            "duplicate constraint name {name:?}"
        );
        self.constraints.push(Constraint {
            name: name.to_string(),
            arg_types: arg_types.into_iter().collect(),
            infix: infix.map(str::to_string),
            storage: Storage::Always,
            positive_occs: Vec::new(),
        })
    }

    /// Records a rule, normalizing its heads.
    pub fn push_rule(&mut self, rule: RuleBuilder) -> RuleId {
        let RuleBuilder {
            name,
            mut var_names,
            heads,
            mut guard,
            body,
        } = rule;

        assert!(
            heads
                .iter()
                .any(|(kind, _, _)| *kind != HeadKind::Negative),
            "rule {name:?} has no positive head"
        );

        let mut norm_heads = Vec::new();
        let mut positive_vars = BTreeSet::new();
        for (kind, c, args) in heads {
            let constraint = &self.constraints[c];
            assert_eq!(
                args.len(),
                constraint.arity(),
                "rule {name:?}: arity mismatch for {}",
                constraint.name
            );
            let mut seen = BTreeSet::new();
            let mut norm_args = Vec::new();
            for (i, arg) in args.into_iter().enumerate() {
                let v = match arg {
                    HeadArg::Var(v) => {
                        assert!(
                            usize::from(v) < var_names.len(),
                            "rule {name:?}: undeclared variable"
                        );
                        if seen.insert(v) {
                            v
                        } else {
                            // repeated variable within one head
                            let fresh = var_names.push(format!("_{}", var_names.len()));
                            guard.push(GuardTest {
                                op: CmpOp::Eq,
                                lhs: Expr::Var(fresh),
                                rhs: Expr::Var(v),
                            });
                            fresh
                        }
                    }
                    HeadArg::Lit(lit) => {
                        assert!(
                            self.constraints[c].arg_types[ArgId(i)] != ValueType::Opaque,
                            "rule {name:?}: literal in opaque column of {}",
                            self.constraints[c].name
                        );
                        let fresh = var_names.push(format!("_{}", var_names.len()));
                        guard.push(GuardTest {
                            op: CmpOp::Eq,
                            lhs: Expr::Var(fresh),
                            rhs: Expr::Lit(lit),
                        });
                        fresh
                    }
                };
                seen.insert(v);
                norm_args.push(v);
            }
            if kind != HeadKind::Negative {
                positive_vars.extend(norm_args.iter().copied());
            }
            norm_heads.push((kind, c, norm_args));
        }

        // Body variables must be head-bound or computed before use.
        let mut bound = positive_vars.clone();
        for step in &body {
            let check = |e: &Expr, bound: &BTreeSet<VarId>| {
                e.visit_vars(&mut |v| {
                    assert!(
                        bound.contains(&v),
                        "rule {name:?}: body reads unbound variable {:?}",
                        var_names[v]
                    );
                });
            };
            match step {
                BodyStep::Add { args, .. } => args.iter().for_each(|a| check(a, &bound)),
                BodyStep::Unify { lhs, rhs } => {
                    check(lhs, &bound);
                    check(rhs, &bound);
                }
                BodyStep::Compute { target, expr } => {
                    check(expr, &bound);
                    assert!(
                        !bound.contains(target),
                        "rule {name:?}: compute target already bound"
                    );
                    bound.insert(*target);
                }
                BodyStep::Fail => {}
            }
        }

        let needs_history = norm_heads
            .iter()
            .all(|(kind, _, _)| *kind != HeadKind::Removed);

        let r = RuleId(self.rules.len());
        self.rules.push(Rule {
            name,
            heads: Vec::new(),
            guard,
            body,
            needs_history,
            dead: false,
            var_names,
        });
        self.rule_heads.push(norm_heads);
        r
    }

    /// Freezes the program: builds the occurrence arena and assigns every
    /// constraint its positive occurrences in program order.
    #[must_use]
    pub fn seal(self) -> Program {
        let ProgramBuilder {
            symbols,
            symbol_dedup: _,
            mut constraints,
            mut rules,
            rule_heads,
        } = self;

        let mut occs: TVec<OccId, Occurrence> = TVec::new();
        for (ri, heads) in rule_heads.into_iter().enumerate() {
            let r = RuleId(ri);
            for (head_index, (kind, c, args)) in heads.into_iter().enumerate() {
                let o = occs.push(Occurrence {
                    rule: r,
                    constraint: c,
                    kind,
                    head_index,
                    position: usize::MAX,
                    args,
                    active: true,
                });
                rules[ri].heads.push(o);
            }
        }
        // Program order: by rule, then textual head position within the rule.
        for (c, constraint) in constraints.iter_enumerate_mut() {
            let mut positive: Vec<OccId> = occs
                .iter_enumerate()
                .filter(|(_, occ)| occ.constraint == c && occ.kind != HeadKind::Negative)
                .map(|(o, _)| o)
                .collect();
            positive.sort_by_key(|&o| (occs[o].rule, occs[o].head_index));
            for (position, &o) in positive.iter().enumerate() {
                occs[o].position = position;
            }
            constraint.positive_occs = positive;
        }

        tracing::info!(
            constraints = constraints.len(),
            rules = rules.len(),
            occurrences = occs.len(),
            "sealed program"
        );
        Program {
            symbols,
            constraints,
            rules: rules.into_iter().collect(),
            occs,
            set_semantic: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use expect_test::expect;

    fn leq_program() -> Program {
        let mut p = ProgramBuilder::new();
        let leq = p.constraint_full("leq", Some("=<"), [ValueType::Var, ValueType::Var]);
        let mut r = RuleBuilder::new("antisymmetry");
        let x = r.var("X");
        let y = r.var("Y");
        r.removed(leq, [x.into(), y.into()]);
        r.removed(leq, [y.into(), x.into()]);
        r.body_unify(x, y);
        let _rule = p.push_rule(r);
        p.seal()
    }

    #[test]
    fn seal_assigns_positions() {
        let p = leq_program();
        expect![[r#"
            Program:

            leq(Var, Var) aka "=<" storage=Always occs=[o0, o1]

            Rule "antisymmetry" [r0]:
              -leq(X, Y) @o0 active
              -leq(Y, X) @o1 active
              => X = Y
        "#]]
        .assert_eq(&p.dbg_summary());
    }

    #[test]
    fn head_literals_and_repeats_normalize_to_guards() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("p", [ValueType::Int, ValueType::Int]);
        let mut r = RuleBuilder::new("diag");
        let x = r.var("X");
        r.removed(c, [x.into(), x.into()]);
        let mut r2 = RuleBuilder::new("zero");
        let y = r2.var("Y");
        r2.removed(c, [y.into(), 0.into()]);
        let _rule = p.push_rule(r);
        let _rule = p.push_rule(r2);
        let p = p.seal();
        expect![[r#"
            Program:

            p(Int, Int) storage=Always occs=[o0, o1]

            Rule "diag" [r0]:
              -p(X, _1) @o0 active
              guard _1 == X
              => true

            Rule "zero" [r1]:
              -p(Y, _1) @o1 active
              guard _1 == 0
              => true
        "#]]
        .assert_eq(&p.dbg_summary());
    }

    #[test]
    fn propagation_rules_need_history() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("edge", [ValueType::Int, ValueType::Int]);
        let mut r = RuleBuilder::new("transitivity");
        let (x, y, z) = (r.var("X"), r.var("Y"), r.var("Z"));
        r.kept(c, [x.into(), y.into()]);
        r.kept(c, [y.into(), z.into()]);
        r.body_add(c, [x.into(), z.into()]);
        let rule = p.push_rule(r);
        let p = p.seal();
        assert!(p.rules[rule].needs_history);
        assert_eq!(p.rule_kind(rule), RuleKind::Propagation);
    }

    #[test]
    #[should_panic(expected = "arity mismatch")]
    fn arity_mismatch_panics() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("p", [ValueType::Int]);
        let mut r = RuleBuilder::new("bad");
        let x = r.var("X");
        let y = r.var("Y");
        r.removed(c, [x.into(), y.into()]);
        let _rule = p.push_rule(r);
    }
}
