//! Public facade over the rule compiler and its executing runtime.
//!
//! Build a program with [`ir::ProgramBuilder`], compile it with [`compile`],
//! and run it with [`Solver`].

pub use chrlog_core::{
    CompileError, Configuration, ConstraintId, Failure, RuleId, Solver, SymId, Value, VarId,
    compile, ir, plan, runtime,
};
