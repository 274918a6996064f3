//! Typed ids
//!
//! Compile-time entities (constraints, rules, occurrences, variables) and
//! runtime entities (facts, logical variables) are all addressed by index.
//! Cross-references between schedules, categories and continuation sites are
//! ids into arenas, never owning pointers.

use std::{fmt::Debug, hash::Hash};

/// Marks that the type acts like an usize
pub(crate) trait Id:
    Into<usize> + From<usize> + Copy + Default + Debug + Ord + Hash + 'static
{
}
impl<T: Into<usize> + From<usize> + Copy + Default + Debug + Ord + Hash + 'static> Id for T {}

macro_rules! id_wrap {
    ($i:ident, $dbg_prefix:literal, $doc:literal) => {
        #[doc=$doc]
        #[must_use]
        #[derive(Default, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $i(pub(crate) usize);
        impl From<usize> for $i {
            fn from(x: usize) -> Self {
                $i(x)
            }
        }
        impl From<$i> for usize {
            fn from($i(x): $i) -> usize {
                x
            }
        }
        impl std::fmt::Debug for $i {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{self}")
            }
        }
        impl std::fmt::Display for $i {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.0 == usize::MAX {
                    write!(f, "{}_bogus", $dbg_prefix)
                } else {
                    write!(f, "{}{}", $dbg_prefix, self.0)
                }
            }
        }
    };
}

pub(crate) use id_wrap;
id_wrap!(ConstraintId, "c", "id for a user-defined constraint");
id_wrap!(RuleId, "r", "id for a rule");
id_wrap!(OccId, "o", "id for one appearance of a constraint in a rule head");
id_wrap!(VarId, "v", "id for a variable within a rule");
id_wrap!(ArgId, "a", "id for a constraint argument position");
id_wrap!(SymId, "s", "id for an interned symbol");
id_wrap!(LookupId, "u", "reference to a lookup requested by some schedule");
id_wrap!(CategoryId, "ix", "reference to a lookup category (one physical index)");
id_wrap!(ContSiteId, "k", "reference to a continuation resumption site");
id_wrap!(FactId, "f", "runtime id for a constraint instance, in creation order");
id_wrap!(LvId, "l", "runtime id for a logical variable");

impl CategoryId {
    pub(crate) fn bogus() -> Self {
        CategoryId(usize::MAX)
    }
}
