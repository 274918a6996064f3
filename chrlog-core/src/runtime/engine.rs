//! The driving loop.
//!
//! All re-entrancy goes through an explicit task stack, so arbitrarily deep
//! rule cascades run in constant native stack. A firing whose body contains
//! re-entrant steps suspends the current enumeration as an `Enumerate` task
//! and pushes its own continuation beneath the work the body creates; since
//! the stack is LIFO, a newly added fact is fully processed before the rest
//! of the body runs, and the body before the suspended enumeration resumes.

use super::{Failure, store::Store};
use crate::{
    ids::{ConstraintId, ContSiteId, FactId, RuleId, VarId},
    ir::{self, CmpOp, Expr, GuardTest, Storage},
    plan::{self, HistoryRepr, LocalStep, LookupStep, Procedure, ReentrantStep, Step},
    typed_vec::TVec,
    var_binding::{Binder, Value},
};
use hashbrown::HashSet;
use itertools::Itertools as _;

type Env = TVec<VarId, Option<Value>>;

/// A partner-enumeration position inside one procedure.
#[derive(Clone)]
struct Cursor {
    /// Index of the lookup step this cursor belongs to.
    step: usize,
    candidates: Vec<FactId>,
    next: usize,
}

/// One in-flight run of a matching procedure.
#[derive(Clone)]
struct Frame<'p> {
    proc: &'p Procedure,
    constraint: ConstraintId,
    proc_index: usize,
    removal: bool,
    /// The activated fact. `None` for removal re-checks.
    fact: Option<FactId>,
    env: Env,
    slots: Vec<Option<FactId>>,
    sp: usize,
    cursors: Vec<Cursor>,
}

enum Task<'p> {
    /// Run the activation walk of a fact from procedure `proc` onward.
    Activate { fact: FactId, proc: usize },
    /// Resume a suspended partner enumeration.
    Enumerate(Box<Frame<'p>>),
    /// Run a rule body from a continuation site.
    Resume { site: ContSiteId, env: Box<[Value]> },
    /// Re-run absence-guarded rules after a fact of `constraint` died.
    RemovalCheck { constraint: ConstraintId, proc: usize },
}

enum Outcome {
    Exhausted,
    Suspended,
}

enum Firing {
    /// Propagation history already holds this instance.
    Rejected,
    /// Fired; the frame was saved and the body's work now owns the stack.
    Suspended,
    /// Fired inline; enumeration can continue after revalidation.
    Done,
}

/// Executes a compiled program against a growing constraint store.
pub struct Solver<'p> {
    program: &'p plan::Program,
    store: Store,
    binder: Binder,
    /// Shared tuple histories for rules with more than two heads.
    tuple_history: TVec<RuleId, HashSet<Box<[FactId]>>>,
    stack: Vec<Task<'p>>,
    firings: TVec<RuleId, u64>,
    max_depth: usize,
    failed: bool,
}

impl<'p> Solver<'p> {
    pub fn new(program: &'p plan::Program) -> Self {
        Solver {
            program,
            store: Store::new(program),
            binder: Binder::new(),
            tuple_history: program.rules.map(|_| HashSet::new()),
            stack: Vec::new(),
            firings: program.rules.map(|_| 0),
            max_depth: 0,
            failed: false,
        }
    }

    /// A fresh unbound logical variable.
    pub fn fresh_var(&mut self) -> Value {
        Value::Var(self.binder.fresh())
    }

    /// Adds a constraint and runs all resulting work to quiescence.
    pub fn add(
        &mut self,
        constraint: ConstraintId,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<(), Failure> {
        self.check_usable()?;
        self.introduce(constraint, args.into_iter().collect());
        self.settle()
    }

    /// Unifies two values and runs all resulting work to quiescence.
    pub fn unify(&mut self, a: Value, b: Value) -> Result<(), Failure> {
        self.check_usable()?;
        match self.do_unify(a, b) {
            Ok(()) => self.settle(),
            Err(e) => {
                self.poison();
                Err(e)
            }
        }
    }

    /// Times each live rule has fired.
    pub fn firings(&self, rule: RuleId) -> u64 {
        self.firings[rule]
    }

    pub fn live_count(&self) -> usize {
        self.store.live_count()
    }

    /// Live constraints in creation order, arguments resolved.
    pub fn live(&self) -> Vec<(ConstraintId, Vec<Value>)> {
        self.store
            .facts
            .iter()
            .filter(|f| f.alive)
            .map(|f| {
                let args = f.args.iter().map(|&a| self.binder.resolve(a)).collect();
                (f.constraint, args)
            })
            .collect()
    }

    /// High-water mark of the task stack, for checking that deep cascades
    /// stay off the native stack.
    pub fn max_task_depth(&self) -> usize {
        self.max_depth
    }

    /// Sorted rendering of the live store, for tests.
    #[must_use]
    pub fn store_summary(&self) -> String {
        let mut lines: Vec<String> = self
            .store
            .facts
            .iter()
            .filter(|f| f.alive)
            .map(|f| {
                format!(
                    "{}({})",
                    self.program.constraints[f.constraint].name,
                    f.args.iter().map(|&a| self.value_str(a)).join(", ")
                )
            })
            .collect();
        lines.sort();
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    fn value_str(&self, v: Value) -> String {
        match self.binder.resolve(v) {
            Value::Int(x) => format!("{x}"),
            Value::Sym(s) => format!("'{}", self.program.symbols[s]),
            Value::Var(l) => format!("{l}"),
        }
    }

    fn check_usable(&self) -> Result<(), Failure> {
        if self.failed {
            return Err(Failure::new("computation already failed"));
        }
        Ok(())
    }

    fn poison(&mut self) {
        self.failed = true;
        self.stack.clear();
    }

    fn settle(&mut self) -> Result<(), Failure> {
        let r = self.run_loop();
        if r.is_err() {
            self.poison();
        }
        r
    }

    fn run_loop(&mut self) -> Result<(), Failure> {
        loop {
            self.max_depth = self.max_depth.max(self.stack.len());
            let Some(task) = self.stack.pop() else {
                return Ok(());
            };
            match task {
                Task::Activate { fact, proc } => {
                    let constraint = self.store.facts[fact].constraint;
                    self.run_procs(Some(fact), constraint, proc, false)?;
                }
                Task::Enumerate(frame) => self.resume_frame(*frame)?,
                Task::Resume { site, env } => self.run_site(site, &env)?,
                Task::RemovalCheck { constraint, proc } => {
                    self.run_procs(None, constraint, proc, true)?;
                }
            }
            self.store.maybe_compact(self.program, &self.binder);
        }
    }

    /// Creates a fact, registers variable watchers, stores it unless its
    /// storage class or a dedup hit says otherwise, and queues activation.
    fn introduce(&mut self, constraint: ConstraintId, args: Box<[Value]>) {
        let cp = &self.program.constraints[constraint];
        let stored = cp.storage != Storage::Never;
        if stored
            && self
                .store
                .dedup_hit(self.program, &self.binder, constraint, &args)
                .is_some()
        {
            tracing::debug!(constraint = %cp.name, "duplicate absorbed");
            return;
        }
        let fact = self.store.create(self.program, constraint, args);
        for col in 0..self.program.constraints[constraint].arg_types.len() {
            if let Value::Var(root) = self.binder.resolve(self.store.facts[fact].args[col]) {
                self.binder.watch(root, fact);
            }
        }
        if stored {
            self.store.insert(self.program, &self.binder, fact);
        }
        self.stack.push(Task::Activate { fact, proc: 0 });
    }

    /// Applies a unification and queues rehash-and-reactivate for every fact
    /// watching an affected variable.
    fn do_unify(&mut self, a: Value, b: Value) -> Result<(), Failure> {
        let affected = self.binder.unify(a, b)?;
        for f in affected {
            if !self.store.facts[f].alive {
                continue;
            }
            if self.store.rehash(self.program, &self.binder, f) {
                // the binding made this fact a duplicate of a stored one
                self.remove_fact(f);
            } else {
                self.stack.push(Task::Activate { fact: f, proc: 0 });
            }
        }
        Ok(())
    }

    fn remove_fact(&mut self, fact: FactId) {
        let constraint = self.store.facts[fact].constraint;
        self.store.remove(self.program, &self.binder, fact);
        for (rule, key) in std::mem::take(&mut self.store.facts[fact].tuple_refs) {
            self.tuple_history[rule].remove(&key);
        }
        if !self.program.on_removal[constraint].is_empty() {
            self.stack
                .push(Task::RemovalCheck { constraint, proc: 0 });
        }
    }

    /// Runs procedures `start..` of the activation walk (or removal
    /// re-checks) until one suspends or the walk ends.
    fn run_procs(
        &mut self,
        fact: Option<FactId>,
        constraint: ConstraintId,
        start: usize,
        removal: bool,
    ) -> Result<(), Failure> {
        let program = self.program;
        let procs = if removal {
            &program.on_removal[constraint]
        } else {
            &program.procedures[constraint]
        };
        for (i, proc) in procs.iter().enumerate().skip(start) {
            if let Some(f) = fact
                && !self.store.facts[f].alive
            {
                return Ok(());
            }
            let frame = self.start_frame(proc, constraint, i, fact, removal);
            match self.drive(frame)? {
                Outcome::Suspended => return Ok(()),
                Outcome::Exhausted => {}
            }
        }
        Ok(())
    }

    fn start_frame(
        &self,
        proc: &'p Procedure,
        constraint: ConstraintId,
        proc_index: usize,
        fact: Option<FactId>,
        removal: bool,
    ) -> Frame<'p> {
        let rule = &self.program.rules[proc.rule];
        let mut env: Env = TVec::new_with_size(rule.var_names.len(), None);
        let mut slots = vec![None; rule.head_slots.len()];
        if let Some(f) = fact
            && let Some(slot) = proc.active_slot
        {
            slots[slot] = Some(f);
            for (col, &var) in proc.active_args.iter().enumerate() {
                env[var] = Some(self.store.facts[f].args[col]);
            }
        }
        Frame {
            proc,
            constraint,
            proc_index,
            removal,
            fact,
            env,
            slots,
            sp: 0,
            cursors: Vec::new(),
        }
    }

    fn drive(&mut self, mut frame: Frame<'p>) -> Result<Outcome, Failure> {
        let proc = frame.proc;
        loop {
            if frame.sp == proc.steps.len() {
                match self.fire(&mut frame)? {
                    Firing::Suspended => return Ok(Outcome::Suspended),
                    Firing::Rejected => {
                        if !self.backtrack(&mut frame) {
                            return Ok(Outcome::Exhausted);
                        }
                    }
                    Firing::Done => {
                        // the firing mutated the store
                        if !self.revalidate(&mut frame) || !self.backtrack(&mut frame) {
                            return Ok(Outcome::Exhausted);
                        }
                    }
                }
                continue;
            }
            let passed = match &proc.steps[frame.sp] {
                Step::Guard(g) => self.guard_holds(&frame.env, g),
                Step::Diff { a, b } => frame.slots[*a] != frame.slots[*b],
                Step::Absent(a) => match self.eval_key(&frame.env, &a.key) {
                    Some(key) => self
                        .store
                        .probe(self.program, &self.binder, a.category, &key)
                        .is_empty(),
                    None => false,
                },
                Step::Lookup(l) => {
                    let candidates = match self.eval_key(&frame.env, &l.key) {
                        Some(key) => self.store.probe(self.program, &self.binder, l.category, &key),
                        None => Vec::new(),
                    };
                    frame.cursors.push(Cursor {
                        step: frame.sp,
                        candidates,
                        next: 0,
                    });
                    // advancing the fresh cursor selects the first candidate
                    if !self.backtrack(&mut frame) {
                        return Ok(Outcome::Exhausted);
                    }
                    continue;
                }
            };
            if passed {
                frame.sp += 1;
            } else if !self.backtrack(&mut frame) {
                return Ok(Outcome::Exhausted);
            }
        }
    }

    /// Advances the innermost cursor to its next live, still-matching
    /// candidate, popping exhausted cursors. Returns false when the whole
    /// enumeration is exhausted.
    fn backtrack(&mut self, frame: &mut Frame<'p>) -> bool {
        let proc = frame.proc;
        loop {
            let Some(cur) = frame.cursors.last_mut() else {
                return false;
            };
            let Step::Lookup(l) = &proc.steps[cur.step] else {
                unreachable!()
            };
            let mut chosen = None;
            while cur.next < cur.candidates.len() {
                let f = cur.candidates[cur.next];
                cur.next += 1;
                if self.store.facts[f].alive && self.lookup_still_matches(&frame.env, l, f) {
                    chosen = Some(f);
                    break;
                }
            }
            let Some(f) = chosen else {
                frame.cursors.pop();
                continue;
            };
            frame.slots[l.head_slot] = Some(f);
            for &(col, var) in &l.binds {
                frame.env[var] = Some(self.store.facts[f].args[usize::from(col)]);
            }
            frame.sp = cur.step + 1;
            return true;
        }
    }

    /// After a firing, previously matched slots may hold dead facts. Finds
    /// the outermost such cursor and truncates enumeration to it; a false
    /// return means the active fact itself died.
    fn revalidate(&mut self, frame: &mut Frame<'p>) -> bool {
        if let Some(f) = frame.fact
            && !self.store.facts[f].alive
        {
            return false;
        }
        for i in 0..frame.cursors.len() {
            let Step::Lookup(l) = &frame.proc.steps[frame.cursors[i].step] else {
                unreachable!()
            };
            if let Some(f) = frame.slots[l.head_slot]
                && !self.store.facts[f].alive
            {
                frame.cursors.truncate(i + 1);
                return true;
            }
        }
        true
    }

    fn lookup_still_matches(&self, env: &Env, l: &LookupStep, f: FactId) -> bool {
        let args = &self.store.facts[f].args;
        l.key.iter().all(|(col, e)| match self.eval(env, e) {
            Some(v) => self.binder.resolve(args[usize::from(*col)]) == v,
            None => false,
        })
    }

    /// A complete match: test-and-record history, remove consumed heads, run
    /// the body. Bodies with re-entrant steps suspend the frame first so the
    /// stack discipline preserves depth-first order.
    fn fire(&mut self, frame: &mut Frame<'p>) -> Result<Firing, Failure> {
        let program = self.program;
        let rule_id = frame.proc.rule;
        let rp = &program.rules[rule_id];
        let slots: Vec<FactId> = frame.slots.iter().map(|s| s.unwrap()).collect();

        match &rp.history {
            None => {}
            Some(HistoryRepr::Flag { slot }) => {
                let f = slots[0];
                if self.store.facts[f].flags[*slot] {
                    return Ok(Firing::Rejected);
                }
                self.store.facts[f].flags[*slot] = true;
            }
            Some(HistoryRepr::PartnerSet { slot }) => {
                let (f0, f1) = (slots[0], slots[1]);
                if !self.store.facts[f0].psets[*slot].insert(f1) {
                    return Ok(Firing::Rejected);
                }
            }
            Some(HistoryRepr::TupleSet) => {
                let key: Box<[FactId]> = slots.clone().into();
                if !self.tuple_history[rule_id].insert(key.clone()) {
                    return Ok(Firing::Rejected);
                }
                for &f in &slots {
                    self.store.facts[f].tuple_refs.push((rule_id, key.clone()));
                }
            }
        }

        self.firings[rule_id] += 1;
        tracing::debug!(rule = %rp.name, "fired");

        for (i, hs) in rp.head_slots.iter().enumerate() {
            if hs.removed {
                self.remove_fact(slots[i]);
            }
        }

        let reenters = rp.units.iter().any(|u| u.reentrant.is_some());
        if !reenters {
            self.run_units(rule_id, 0, &mut frame.env)?;
            return Ok(Firing::Done);
        }
        let resume = match frame.fact {
            Some(f) => self.store.facts[f].alive,
            None => true,
        };
        if resume {
            self.stack.push(Task::Enumerate(Box::new(frame.clone())));
        }
        self.run_units(rule_id, 0, &mut frame.env)?;
        Ok(Firing::Suspended)
    }

    fn resume_frame(&mut self, mut frame: Frame<'p>) -> Result<(), Failure> {
        let (fact, constraint, index, removal) =
            (frame.fact, frame.constraint, frame.proc_index, frame.removal);
        if self.revalidate(&mut frame)
            && self.backtrack(&mut frame)
            && let Outcome::Suspended = self.drive(frame)?
        {
            return Ok(());
        }
        // this procedure is exhausted; continue the walk
        self.run_procs(fact, constraint, index + 1, removal)
    }

    /// Runs body units from `start` until the first re-entrant step, pushing
    /// the continuation for whatever remains.
    fn run_units(&mut self, rule: RuleId, start: usize, env: &mut Env) -> Result<(), Failure> {
        let program = self.program;
        let rp = &program.rules[rule];
        for unit in &rp.units[start..] {
            for step in &unit.steps {
                match step {
                    LocalStep::Compute { target, expr } => {
                        let v = self.eval(env, expr).ok_or_else(|| {
                            Failure::new(format!(
                                "arithmetic over a non-integer value in rule {}",
                                rp.name
                            ))
                        })?;
                        env[*target] = Some(v);
                    }
                    LocalStep::Fail => {
                        return Err(Failure::new(format!("rule {} signalled failure", rp.name)));
                    }
                }
            }
            let Some(re) = &unit.reentrant else {
                return Ok(());
            };
            if let Some(site) = unit.next {
                let captured: Box<[Value]> = program.cont_sites[site]
                    .captures
                    .iter()
                    .map(|&v| env[v].unwrap())
                    .collect();
                self.stack.push(Task::Resume {
                    site,
                    env: captured,
                });
            }
            return self.perform(re, env);
        }
        Ok(())
    }

    fn run_site(&mut self, site: ContSiteId, values: &[Value]) -> Result<(), Failure> {
        let program = self.program;
        let s = &program.cont_sites[site];
        let rp = &program.rules[s.rule];
        let mut env: Env = TVec::new_with_size(rp.var_names.len(), None);
        for (&var, &v) in s.captures.iter().zip(values) {
            env[var] = Some(v);
        }
        self.run_units(s.rule, s.unit, &mut env)
    }

    fn perform(&mut self, step: &ReentrantStep, env: &Env) -> Result<(), Failure> {
        match step {
            ReentrantStep::Add { constraint, args } => {
                let vals = args
                    .iter()
                    .map(|a| {
                        self.eval(env, a)
                            .ok_or_else(|| Failure::new("arithmetic over a non-integer value"))
                    })
                    .collect::<Result<Box<[Value]>, Failure>>()?;
                self.introduce(*constraint, vals);
                Ok(())
            }
            ReentrantStep::Unify { lhs, rhs } => {
                let a = self
                    .eval(env, lhs)
                    .ok_or_else(|| Failure::new("arithmetic over a non-integer value"))?;
                let b = self
                    .eval(env, rhs)
                    .ok_or_else(|| Failure::new("arithmetic over a non-integer value"))?;
                self.do_unify(a, b)
            }
        }
    }

    /// Evaluates to a resolved value. `None` means an arithmetic operand was
    /// not a ground integer.
    fn eval(&self, env: &Env, e: &Expr) -> Option<Value> {
        match e {
            Expr::Lit(ir::Literal::Int(x)) => Some(Value::Int(*x)),
            Expr::Lit(ir::Literal::Sym(s)) => Some(Value::Sym(*s)),
            Expr::Var(v) => Some(self.binder.resolve(env[*v].unwrap())),
            Expr::BinOp(op, lhs, rhs) => {
                let Value::Int(a) = self.eval(env, lhs)? else {
                    return None;
                };
                let Value::Int(b) = self.eval(env, rhs)? else {
                    return None;
                };
                Some(Value::Int(match op {
                    ir::BinOp::Add => a.wrapping_add(b),
                    ir::BinOp::Sub => a.wrapping_sub(b),
                    ir::BinOp::Mul => a.wrapping_mul(b),
                }))
            }
        }
    }

    fn eval_key(&self, env: &Env, key: &[(crate::ids::ArgId, Expr)]) -> Option<Box<[Value]>> {
        key.iter().map(|(_, e)| self.eval(env, e)).collect()
    }

    /// Entailment, not satisfiability: a comparison over values the binding
    /// state cannot yet decide does not hold. Binding the deciding variable
    /// reactivates the watching facts, which retries the match.
    fn guard_holds(&self, env: &Env, g: &GuardTest) -> bool {
        let (Some(l), Some(r)) = (self.eval(env, &g.lhs), self.eval(env, &g.rhs)) else {
            return false;
        };
        match g.op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l.is_ground() && r.is_ground() && l != r,
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let (Value::Int(a), Value::Int(b)) = (l, r) else {
                    return false;
                };
                match g.op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                }
            }
        }
    }
}
