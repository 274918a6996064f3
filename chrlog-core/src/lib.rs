mod continuation;
mod history;
mod ids;
mod index_selection;
mod optimize;
mod schedule;
mod typed_vec;
mod var_binding;

pub mod ir;
pub mod plan;
pub mod runtime;


pub use ids::{ConstraintId, RuleId, SymId, VarId};
pub use runtime::{Failure, Solver, Value};

/// Compilation toggles, mainly for differential testing of the optimizer.
#[derive(Copy, Clone, Debug)]
pub struct Configuration {
    /// Run passiveness, storage and dead-rule analyses before planning.
    pub optimize: bool,
    /// Passivate occurrences subsumed by an argument symmetry.
    pub symmetry: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            optimize: true,
            symmetry: true,
        }
    }
}

impl Configuration {
    /// Every occurrence active, every constraint stored. Slow but
    /// unconditionally correct; the optimized plan must be observationally
    /// equivalent to this one.
    #[must_use]
    pub fn unoptimized() -> Self {
        Configuration {
            optimize: false,
            symmetry: false,
        }
    }
}

/// Program defects that block plan generation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("guard {guard} in rule {rule} compares opaque values")]
    OpaqueGuard { rule: String, guard: String },
    #[error("guard {guard} in rule {rule} reads a variable no positive head binds")]
    UnboundGuard { rule: String, guard: String },
    #[error("{occ} in rule {rule} would key {constraint} on opaque column {column}")]
    OpaqueKey {
        rule: String,
        occ: String,
        constraint: String,
        column: usize,
    },
}

/// Compiles a sealed rule program into an executable plan.
pub fn compile(program: &ir::Program, config: Configuration) -> Result<plan::Program, CompileError> {
    let mut p = program.clone();
    if config.optimize {
        optimize::run(&mut p, config.symmetry);
    }
    tracing::debug!(
        rules = p.rules.len(),
        constraints = p.constraints.len(),
        "planning"
    );
    let mut synthesis = schedule::synthesize(&p)?;
    let selection = index_selection::select(&p, &mut synthesis)?;
    let hist = history::assign(&p);
    let split = continuation::split(&p);

    let constraints = p
        .constraints
        .iter_enumerate()
        .map(|(c, k)| plan::ConstraintPlan {
            name: k.name.clone(),
            arg_types: k.arg_types.clone(),
            storage: k.storage,
            categories: selection.per_constraint[c].clone(),
            dedup: selection.dedup[c],
            flag_slots: hist.flag_slots[c],
            pset_slots: hist.pset_slots[c],
        })
        .collect();

    let rules = p
        .rules
        .iter_enumerate()
        .map(|(r, rule)| plan::RulePlan {
            name: rule.name.clone(),
            dead: rule.dead,
            head_slots: p
                .positive_heads(r)
                .map(|o| {
                    let occ = &p.occs[o];
                    plan::HeadSlot {
                        occ: o,
                        constraint: occ.constraint,
                        removed: occ.kind == ir::HeadKind::Removed,
                    }
                })
                .collect(),
            history: hist.per_rule[r].clone(),
            units: split.units[r].clone(),
            var_names: rule.var_names.clone(),
        })
        .collect();

    let out = plan::Program {
        symbols: p.symbols.clone(),
        constraints,
        categories: selection.categories,
        rules,
        procedures: synthesis.procedures,
        on_removal: synthesis.on_removal,
        cont_sites: split.sites,
    };
    out.validate();
    Ok(out)
}
