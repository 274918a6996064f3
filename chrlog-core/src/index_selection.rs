//! Lookup category selection: logical lookups to physical indexes.
//!
//! The schedules register which keyed queries they perform; this pass picks
//! the minimal category set that realizes all of them. Usages with equal key
//! columns share one physical index. Full-tuple lookups on a constraint with
//! set semantics are served by the dedup index itself, so duplicates cost no
//! storage and no scan time.

use crate::{
    CompileError,
    ids::{ArgId, CategoryId, ConstraintId, LookupId},
    ir::{Program, Storage, ValueType},
    plan::{Category, CategoryKind, Step},
    schedule::Synthesis,
    typed_vec::TVec,
};
use itertools::Itertools as _;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
pub(crate) struct Selection {
    pub(crate) categories: TVec<CategoryId, Category>,
    pub(crate) per_constraint: TVec<ConstraintId, Vec<CategoryId>>,
    /// Set-semantics index consulted before storing, when licensed.
    pub(crate) dedup: TVec<ConstraintId, Option<CategoryId>>,
}

pub(crate) fn select(p: &Program, synthesis: &mut Synthesis) -> Result<Selection, CompileError> {
    for usage in &synthesis.usages {
        let constraint = &p.constraints[usage.constraint];
        // The optimizer passivates every occurrence that would search a
        // never-stored constraint; reaching here is an IR inconsistency.
        assert_ne!(
            constraint.storage,
            Storage::Never,
            "lookup against never-stored {}",
            constraint.name
        );
        for &col in &usage.key {
            if constraint.arg_types[col] == ValueType::Opaque {
                let occ = &p.occs[usage.occ];
                return Err(CompileError::OpaqueKey {
                    rule: p.rules[occ.rule].name.clone(),
                    occ: format!("{}", usage.occ),
                    constraint: constraint.name.clone(),
                    column: col.into(),
                });
            }
        }
    }

    let mut categories: TVec<CategoryId, Category> = TVec::new();
    let mut per_constraint: TVec<ConstraintId, Vec<CategoryId>> =
        p.constraints.map(|_| Vec::new());
    let mut dedup: TVec<ConstraintId, Option<CategoryId>> = p.constraints.map(|_| None);
    let mut lookup_category: TVec<LookupId, CategoryId> =
        TVec::new_with_size(synthesis.usages.len(), CategoryId::bogus());

    for (c, constraint) in p.constraints.iter_enumerate() {
        if constraint.storage == Storage::Never {
            continue;
        }
        let arity = constraint.arity();
        let full: BTreeSet<ArgId> = (0..arity).map(ArgId).collect();
        let rehash = |key: &BTreeSet<ArgId>| {
            key.iter()
                .any(|&col| constraint.arg_types[col] == ValueType::Var)
        };

        if p.set_semantic.contains(&c) {
            let cat = categories.push(Category {
                constraint: c,
                kind: CategoryKind::SetHash,
                needs_rehash: rehash(&full),
            });
            per_constraint[c].push(cat);
            dedup[c] = Some(cat);
        }

        let mut by_key: BTreeMap<BTreeSet<ArgId>, Vec<LookupId>> = BTreeMap::new();
        for (u, usage) in synthesis.usages.iter_enumerate() {
            if usage.constraint == c {
                by_key.entry(usage.key.clone()).or_default().push(u);
            }
        }
        for (key, lookups) in by_key {
            let cat = if key == full && dedup[c].is_some() {
                dedup[c].unwrap()
            } else {
                let kind = if key.is_empty() {
                    CategoryKind::List
                } else {
                    CategoryKind::Hash {
                        key: key.iter().copied().collect(),
                    }
                };
                let cat = categories.push(Category {
                    constraint: c,
                    kind,
                    needs_rehash: rehash(&key),
                });
                per_constraint[c].push(cat);
                cat
            };
            for u in lookups {
                lookup_category[u] = cat;
            }
        }
        tracing::debug!(
            constraint = %constraint.name,
            categories = per_constraint[c].iter().map(|x| format!("{x}")).join(", "),
            "selected indexes"
        );
    }

    for procs in synthesis
        .procedures
        .iter_mut()
        .chain(synthesis.on_removal.iter_mut())
    {
        for proc in procs {
            for step in &mut proc.steps {
                match step {
                    Step::Lookup(l) => l.category = lookup_category[l.lookup],
                    Step::Absent(a) => a.category = lookup_category[a.lookup],
                    Step::Guard(_) | Step::Diff { .. } => {}
                }
            }
        }
    }

    Ok(Selection {
        categories,
        per_constraint,
        dedup,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ir::{ProgramBuilder, RuleBuilder, ValueType},
        schedule,
    };

    #[test]
    fn equal_key_sets_share_one_index() {
        let mut p = ProgramBuilder::new();
        let e = p.constraint("edge", [ValueType::Int, ValueType::Int]);
        let q = p.constraint("query", [ValueType::Int]);
        // Two rules probing edge by its first column.
        for name in ["q1", "q2"] {
            let mut r = RuleBuilder::new(name);
            let (x, y) = (r.var("X"), r.var("Y"));
            r.removed(q, [x.into()]);
            r.kept(e, [x.into(), y.into()]);
            let _rule = p.push_rule(r);
        }
        let p = p.seal();
        let mut s = schedule::synthesize(&p).unwrap();
        let sel = select(&p, &mut s).unwrap();
        let edge_cats = &sel.per_constraint[ConstraintId(0)];
        // Both rules probe edge by column 0; the usages collapse into one
        // physical index.
        assert_eq!(edge_cats.len(), 1);
        assert!(matches!(
            sel.categories[edge_cats[0]].kind,
            CategoryKind::Hash { .. }
        ));
    }

    #[test]
    fn set_semantics_serves_full_key_lookups() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("reach", [ValueType::Int, ValueType::Int]);
        let t = p.constraint("probe", [ValueType::Int, ValueType::Int]);
        let mut r = RuleBuilder::new("dedup");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.removed(c, [x.into(), y.into()]);
        r.kept(c, [x.into(), y.into()]);
        let _rule = p.push_rule(r);
        let mut r = RuleBuilder::new("check");
        let (x, y) = (r.var("X"), r.var("Y"));
        r.removed(t, [x.into(), y.into()]);
        r.kept(c, [x.into(), y.into()]);
        let _rule = p.push_rule(r);
        let mut p = p.seal();
        crate::optimize::run(&mut p, true);
        let mut s = schedule::synthesize(&p).unwrap();
        let sel = select(&p, &mut s).unwrap();
        let c0 = ConstraintId(0);
        let ded = sel.dedup[c0].unwrap();
        assert!(matches!(sel.categories[ded].kind, CategoryKind::SetHash));
        // The full-key probe from "check" reuses the dedup index.
        assert_eq!(sel.per_constraint[c0].len(), 1);
    }

    #[test]
    fn opaque_key_is_a_generation_blocking_error() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("c", [ValueType::Opaque]);
        let d = p.constraint("d", [ValueType::Opaque]);
        let mut r = RuleBuilder::new("join");
        let x = r.var("X");
        r.removed(c, [x.into()]);
        r.kept(d, [x.into()]);
        let _rule = p.push_rule(r);
        let p = p.seal();
        let mut s = schedule::synthesize(&p).unwrap();
        let err = select(&p, &mut s).unwrap_err();
        assert!(matches!(err, CompileError::OpaqueKey { column: 0, .. }));
    }
}
