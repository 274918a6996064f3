//! Executes a compiled plan directly.
//!
//! The interpreter walks the same structures a code generator would render:
//! activation procedures drive partner enumeration, continuation sites carry
//! rule bodies across re-entrant steps, and the explicit task stack replaces
//! native recursion entirely.

mod engine;
mod store;

pub use crate::var_binding::Value;
pub use engine::Solver;

/// Irrecoverable failure of the computation: a failed ground unification, an
/// explicit `fail` body step, or arithmetic over an unbound variable. The
/// store is left as-is; no rewinding happens.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Failure {
    reason: String,
}

impl Failure {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Failure {
            reason: reason.into(),
        }
    }
}
