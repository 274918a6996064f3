//! Fact slab and physical indexes.
//!
//! Facts live in a slab and are only ever tombstoned, so fact ids stay
//! stable for history bookkeeping. Indexes hold fact ids keyed by resolved
//! argument values; entries go stale when a fact dies or a key column is
//! rebound, and every probe re-verifies candidates against the current
//! binding state. Stale bulk is reclaimed by an occasional full rebuild.

use crate::{
    ids::{CategoryId, ConstraintId, FactId, RuleId},
    ir::Storage,
    plan::{self, CategoryKind},
    typed_vec::TVec,
    var_binding::{Binder, Value},
};
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::collections::BTreeSet;

pub(crate) struct Fact {
    pub(crate) constraint: ConstraintId,
    pub(crate) args: Box<[Value]>,
    pub(crate) alive: bool,
    /// False for never-stored facts and absorbed duplicates; such facts have
    /// no index entries.
    pub(crate) stored: bool,
    /// Per-fact propagation flags, one per flag slot of the constraint.
    pub(crate) flags: SmallVec<[bool; 2]>,
    /// Per-fact partner sets, one per pset slot of the constraint.
    pub(crate) psets: Vec<BTreeSet<FactId>>,
    /// Back-references into shared per-rule tuple histories, purged when the
    /// fact is removed.
    pub(crate) tuple_refs: Vec<(RuleId, Box<[FactId]>)>,
}

pub(crate) enum IndexRepr {
    List(Vec<FactId>),
    Hash(HashMap<Box<[Value]>, Vec<FactId>>),
    /// Keyed on the full tuple; at most one live fact per key.
    Set(HashMap<Box<[Value]>, FactId>),
}

pub(crate) struct Store {
    pub(crate) facts: TVec<FactId, Fact>,
    indexes: TVec<CategoryId, IndexRepr>,
    live: usize,
    /// Tombstoned entries still occupying index slots.
    stale: usize,
}

impl Store {
    pub(crate) fn new(plan: &plan::Program) -> Self {
        Store {
            facts: TVec::new(),
            indexes: plan.categories.map(|cat| match &cat.kind {
                CategoryKind::List => IndexRepr::List(Vec::new()),
                CategoryKind::Hash { .. } => IndexRepr::Hash(HashMap::new()),
                CategoryKind::SetHash => IndexRepr::Set(HashMap::new()),
            }),
            live: 0,
            stale: 0,
        }
    }

    pub(crate) fn create(
        &mut self,
        plan: &plan::Program,
        constraint: ConstraintId,
        args: Box<[Value]>,
    ) -> FactId {
        let cp = &plan.constraints[constraint];
        assert_eq!(args.len(), cp.arg_types.len(), "arity mismatch");
        self.live += 1;
        self.facts.push(Fact {
            constraint,
            args,
            alive: true,
            stored: false,
            flags: smallvec::smallvec![false; cp.flag_slots],
            psets: vec![BTreeSet::new(); cp.pset_slots],
            tuple_refs: Vec::new(),
        })
    }

    fn key_of(&self, binder: &Binder, cat: &plan::Category, fact: FactId) -> Box<[Value]> {
        let args = &self.facts[fact].args;
        cat.key_columns(args.len())
            .iter()
            .map(|&col| binder.resolve(args[usize::from(col)]))
            .collect()
    }

    /// Checks the dedup index for a live fact whose full tuple resolves
    /// equal to `args`.
    pub(crate) fn dedup_hit(
        &self,
        plan: &plan::Program,
        binder: &Binder,
        constraint: ConstraintId,
        args: &[Value],
    ) -> Option<FactId> {
        let dedup = plan.constraints[constraint].dedup?;
        let key: Box<[Value]> = args.iter().map(|&a| binder.resolve(a)).collect();
        let IndexRepr::Set(set) = &self.indexes[dedup] else {
            unreachable!()
        };
        let &f = set.get(&key)?;
        self.verify(binder, &plan.categories[dedup], f, &key)
            .then_some(f)
    }

    /// Enters the fact into every category of its constraint.
    pub(crate) fn insert(&mut self, plan: &plan::Program, binder: &Binder, fact: FactId) {
        let constraint = self.facts[fact].constraint;
        debug_assert!(plan.constraints[constraint].storage != Storage::Never);
        self.facts[fact].stored = true;
        for &cat_id in &plan.constraints[constraint].categories {
            let key = self.key_of(binder, &plan.categories[cat_id], fact);
            match &mut self.indexes[cat_id] {
                IndexRepr::List(list) => list.push(fact),
                IndexRepr::Hash(map) => map.entry(key).or_default().push(fact),
                IndexRepr::Set(set) => {
                    set.insert(key, fact);
                }
            }
        }
    }

    /// Tombstones the fact. Set entries are dropped eagerly so dedup stays
    /// exact; list and hash entries linger until the next compaction.
    pub(crate) fn remove(&mut self, plan: &plan::Program, binder: &Binder, fact: FactId) {
        let f = &mut self.facts[fact];
        assert!(f.alive, "fact removed twice");
        f.alive = false;
        self.live -= 1;
        if !f.stored {
            return;
        }
        self.stale += 1;
        let constraint = self.facts[fact].constraint;
        for &cat_id in &plan.constraints[constraint].categories {
            if let CategoryKind::SetHash = plan.categories[cat_id].kind {
                let key = self.key_of(binder, &plan.categories[cat_id], fact);
                let IndexRepr::Set(set) = &mut self.indexes[cat_id] else {
                    unreachable!()
                };
                if set.get(&key) == Some(&fact) {
                    set.remove(&key);
                }
            }
        }
    }

    /// Re-enters the fact under its current key in every rehash-sensitive
    /// category. Returns true when the new full tuple collides with another
    /// live fact in a dedup index, in which case the caller absorbs this
    /// fact instead.
    pub(crate) fn rehash(&mut self, plan: &plan::Program, binder: &Binder, fact: FactId) -> bool {
        if !self.facts[fact].stored {
            return false;
        }
        let constraint = self.facts[fact].constraint;
        for &cat_id in &plan.constraints[constraint].categories {
            let cat = &plan.categories[cat_id];
            if !cat.needs_rehash {
                continue;
            }
            let key = self.key_of(binder, cat, fact);
            match &cat.kind {
                CategoryKind::List => {}
                CategoryKind::Hash { .. } => {
                    self.stale += 1;
                    let IndexRepr::Hash(map) = &mut self.indexes[cat_id] else {
                        unreachable!()
                    };
                    map.entry(key).or_default().push(fact);
                }
                CategoryKind::SetHash => {
                    let IndexRepr::Set(set) = &self.indexes[cat_id] else {
                        unreachable!()
                    };
                    if let Some(&other) = set.get(&key)
                        && other != fact
                        && self.verify(binder, cat, other, &key)
                    {
                        return true;
                    }
                    let IndexRepr::Set(set) = &mut self.indexes[cat_id] else {
                        unreachable!()
                    };
                    set.insert(key, fact);
                }
            }
        }
        false
    }

    fn verify(&self, binder: &Binder, cat: &plan::Category, fact: FactId, key: &[Value]) -> bool {
        let f = &self.facts[fact];
        f.alive
            && cat
                .key_columns(f.args.len())
                .iter()
                .zip(key)
                .all(|(&col, &want)| binder.resolve(f.args[usize::from(col)]) == want)
    }

    /// Live candidates currently matching `key` in the given category.
    pub(crate) fn probe(
        &self,
        plan: &plan::Program,
        binder: &Binder,
        cat_id: CategoryId,
        key: &[Value],
    ) -> Vec<FactId> {
        let cat = &plan.categories[cat_id];
        match &self.indexes[cat_id] {
            IndexRepr::List(list) => list
                .iter()
                .copied()
                .filter(|&f| self.facts[f].alive)
                .collect(),
            IndexRepr::Hash(map) => map
                .get(key)
                .map(|bucket| {
                    bucket
                        .iter()
                        .copied()
                        .filter(|&f| self.verify(binder, cat, f, key))
                        .collect()
                })
                .unwrap_or_default(),
            IndexRepr::Set(set) => set
                .get(key)
                .copied()
                .filter(|&f| self.verify(binder, cat, f, key))
                .into_iter()
                .collect(),
        }
    }

    /// Rebuilds every index from the live stored facts once stale entries
    /// outnumber them.
    pub(crate) fn maybe_compact(&mut self, plan: &plan::Program, binder: &Binder) {
        if self.stale < 64 || self.stale <= self.live {
            return;
        }
        self.stale = 0;
        for repr in self.indexes.iter_mut() {
            match repr {
                IndexRepr::List(list) => list.clear(),
                IndexRepr::Hash(map) => map.clear(),
                IndexRepr::Set(set) => set.clear(),
            }
        }
        for fact in self.facts.enumerate() {
            if self.facts[fact].alive && self.facts[fact].stored {
                self.insert(plan, binder, fact);
            }
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }
}
