//! Logical variables: union-find aliasing with bind-to-ground.
//!
//! Indexing canonicalizes through parent pointers with path compression, so
//! `resolve` on a shared reference stays cheap. Each root tracks the facts
//! whose stored arguments mention a variable of its class; a bind (or an
//! alias of two classes) hands that watcher list to the engine, which
//! rehashes and reactivates exactly those facts.

use crate::ids::{FactId, LvId, SymId};
use crate::runtime::Failure;
use crate::typed_vec::TVec;
use smallvec::SmallVec;
use std::cell::Cell;

/// A runtime value: ground data or a logical variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Int(i64),
    Sym(SymId),
    Var(LvId),
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Int(x)
    }
}
impl From<SymId> for Value {
    fn from(s: SymId) -> Self {
        Value::Sym(s)
    }
}

impl Value {
    pub(crate) fn is_ground(self) -> bool {
        !matches!(self, Value::Var(_))
    }
}

#[derive(Clone, Debug)]
enum Node {
    Root {
        bound: Option<Value>,
        watchers: SmallVec<[FactId; 4]>,
    },
    Child {
        parent: Cell<LvId>,
    },
}

#[derive(Default)]
pub(crate) struct Binder {
    nodes: TVec<LvId, Node>,
}

impl Binder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fresh(&mut self) -> LvId {
        self.nodes.push(Node::Root {
            bound: None,
            watchers: SmallVec::new(),
        })
    }

    fn find(&self, v: LvId) -> LvId {
        match &self.nodes[v] {
            Node::Root { .. } => v,
            Node::Child { parent } => {
                let root = self.find(parent.get());
                parent.set(root);
                root
            }
        }
    }

    /// Canonicalizes: ground values pass through, a bound variable becomes
    /// its ground value, an unbound one its class root.
    pub(crate) fn resolve(&self, value: Value) -> Value {
        match value {
            Value::Var(v) => {
                let root = self.find(v);
                match &self.nodes[root] {
                    Node::Root { bound: Some(g), .. } => *g,
                    Node::Root { bound: None, .. } => Value::Var(root),
                    Node::Child { .. } => unreachable!(),
                }
            }
            ground => ground,
        }
    }

    /// Registers `fact` for rehash/reactivation when `v`'s class changes.
    pub(crate) fn watch(&mut self, v: LvId, fact: FactId) {
        let root = self.find(v);
        match &mut self.nodes[root] {
            Node::Root { watchers, .. } => watchers.push(fact),
            Node::Child { .. } => unreachable!(),
        }
    }

    /// Unifies two resolved values. Returns the facts that must be rehashed
    /// and reactivated; a mismatch of ground values fails the computation.
    pub(crate) fn unify(&mut self, a: Value, b: Value) -> Result<Vec<FactId>, Failure> {
        let a = self.resolve(a);
        let b = self.resolve(b);
        match (a, b) {
            (a, b) if a == b => Ok(Vec::new()),
            (Value::Var(x), Value::Var(y)) => {
                // Alias two unbound classes; keep the larger watcher list as
                // the root.
                let (mut target, mut src) = (x, y);
                if self.watcher_count(target) < self.watcher_count(src) {
                    std::mem::swap(&mut target, &mut src);
                }
                let old = std::mem::replace(
                    &mut self.nodes[src],
                    Node::Child {
                        parent: Cell::new(target),
                    },
                );
                let Node::Root { watchers: moved, .. } = old else {
                    unreachable!()
                };
                let Node::Root { watchers, .. } = &mut self.nodes[target] else {
                    unreachable!()
                };
                watchers.extend(moved.iter().copied());
                let mut affected: Vec<FactId> = watchers.to_vec();
                affected.sort_unstable();
                affected.dedup();
                Ok(affected)
            }
            (Value::Var(x), ground) | (ground, Value::Var(x)) => {
                let Node::Root { bound, watchers } = &mut self.nodes[x] else {
                    unreachable!()
                };
                *bound = Some(ground);
                let mut affected: Vec<FactId> = std::mem::take(watchers).to_vec();
                affected.sort_unstable();
                affected.dedup();
                Ok(affected)
            }
            (a, b) => Err(Failure::new(format!(
                "cannot unify distinct ground values {a:?} and {b:?}"
            ))),
        }
    }

    fn watcher_count(&self, root: LvId) -> usize {
        match &self.nodes[root] {
            Node::Root { watchers, .. } => watchers.len(),
            Node::Child { .. } => unreachable!(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_then_resolve() {
        let mut b = Binder::new();
        let x = b.fresh();
        let y = b.fresh();
        assert!(b.unify(Value::Var(x), Value::Var(y)).unwrap().is_empty());
        b.unify(Value::Var(x), Value::Int(3)).unwrap();
        assert_eq!(b.resolve(Value::Var(y)), Value::Int(3));
    }

    #[test]
    fn ground_mismatch_fails() {
        let mut b = Binder::new();
        assert!(b.unify(Value::Int(1), Value::Int(2)).is_err());
        assert!(b.unify(Value::Int(1), Value::Int(1)).is_ok());
    }

    #[test]
    fn watchers_move_to_the_root() {
        let mut b = Binder::new();
        let x = b.fresh();
        let y = b.fresh();
        b.watch(x, FactId(0));
        b.watch(y, FactId(1));
        let affected = b.unify(Value::Var(x), Value::Var(y)).unwrap();
        assert_eq!(affected, vec![FactId(0), FactId(1)]);
        let affected = b.unify(Value::Var(y), Value::Int(9)).unwrap();
        assert_eq!(affected, vec![FactId(0), FactId(1)]);
    }
}
