//! Propagation-history representation choice.
//!
//! A propagation rule must fire at most once per partner combination. The
//! record shape follows the positive head count: one head needs a single
//! flag on the instance, two heads a partner-id set on the first slot's
//! instance, more a shared per-rule set of slot-ordered id tuples. Fact ids
//! are allocated at activation and never reused, so a recorded id stays
//! unambiguous for the whole run; entries on a fact die with the fact,
//! tuple-set entries are purged through per-fact back-references.

use crate::{
    ids::{ConstraintId, RuleId},
    ir::Program,
    plan::HistoryRepr,
    typed_vec::TVec,
};

pub(crate) struct HistoryAssignment {
    pub(crate) per_rule: TVec<RuleId, Option<HistoryRepr>>,
    /// Per-fact history slot counts, by constraint.
    pub(crate) flag_slots: TVec<ConstraintId, usize>,
    pub(crate) pset_slots: TVec<ConstraintId, usize>,
}

pub(crate) fn assign(p: &Program) -> HistoryAssignment {
    let mut per_rule: TVec<RuleId, Option<HistoryRepr>> = p.rules.map(|_| None);
    let mut flag_slots: TVec<ConstraintId, usize> = p.constraints.map(|_| 0);
    let mut pset_slots: TVec<ConstraintId, usize> = p.constraints.map(|_| 0);

    for (r, rule) in p.rules.iter_enumerate() {
        if rule.dead || !rule.needs_history {
            continue;
        }
        let heads: Vec<ConstraintId> = p.positive_heads(r).map(|o| p.occs[o].constraint).collect();
        let repr = match heads.len() {
            1 => {
                let c = heads[0];
                let slot = flag_slots[c];
                flag_slots[c] += 1;
                HistoryRepr::Flag { slot }
            }
            2 => {
                let c = heads[0];
                let slot = pset_slots[c];
                pset_slots[c] += 1;
                HistoryRepr::PartnerSet { slot }
            }
            _ => HistoryRepr::TupleSet,
        };
        tracing::debug!(rule = %rule.name, ?repr, "history representation");
        per_rule[r] = Some(repr);
    }
    HistoryAssignment {
        per_rule,
        flag_slots,
        pset_slots,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{ProgramBuilder, RuleBuilder, ValueType};

    #[test]
    fn representation_follows_head_count() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("c", [ValueType::Int]);
        let out = p.constraint("out", [ValueType::Int]);

        let mut r1 = RuleBuilder::new("unary");
        let x = r1.var("X");
        r1.kept(c, [x.into()]);
        r1.body_add(out, [x.into()]);
        let _rule = p.push_rule(r1);

        let mut r2 = RuleBuilder::new("binary");
        let (x, y) = (r2.var("X"), r2.var("Y"));
        r2.kept(c, [x.into()]);
        r2.kept(c, [y.into()]);
        r2.body_add(out, [x.into()]);
        let _rule = p.push_rule(r2);

        let mut r3 = RuleBuilder::new("ternary");
        let (x, y, z) = (r3.var("X"), r3.var("Y"), r3.var("Z"));
        r3.kept(c, [x.into()]);
        r3.kept(c, [y.into()]);
        r3.kept(c, [z.into()]);
        r3.body_add(out, [x.into()]);
        let _rule = p.push_rule(r3);

        let p = p.seal();
        let h = assign(&p);
        assert_eq!(h.per_rule[RuleId(0)], Some(HistoryRepr::Flag { slot: 0 }));
        assert_eq!(
            h.per_rule[RuleId(1)],
            Some(HistoryRepr::PartnerSet { slot: 0 })
        );
        assert_eq!(h.per_rule[RuleId(2)], Some(HistoryRepr::TupleSet));
        assert_eq!(h.flag_slots[ConstraintId(0)], 1);
        assert_eq!(h.pset_slots[ConstraintId(0)], 1);
    }

    #[test]
    fn simplification_needs_no_history() {
        let mut p = ProgramBuilder::new();
        let c = p.constraint("c", [ValueType::Int]);
        let mut r = RuleBuilder::new("drop");
        let x = r.var("X");
        r.removed(c, [x.into()]);
        let _rule = p.push_rule(r);
        let p = p.seal();
        let h = assign(&p);
        assert_eq!(h.per_rule[RuleId(0)], None);
        assert_eq!(h.flag_slots[ConstraintId(0)], 0);
    }
}
