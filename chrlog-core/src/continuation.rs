//! Body splitting for the trampoline.
//!
//! A rule body runs in place until a step that can re-enter the engine: a
//! constraint addition, or a unification (binding a logical variable rehashes
//! and reactivates facts). The remainder of the body is packaged as a
//! continuation carrying exactly the variables it still reads, computed by
//! backward liveness. Only the last re-entrant step runs without pushing a
//! continuation, which is what keeps native stack depth flat over
//! arbitrarily long firing chains.

use crate::{
    ids::{ContSiteId, RuleId, VarId},
    ir::{BodyStep, Program},
    plan::{BodyUnit, ContSite, LocalStep, ReentrantStep},
    typed_vec::TVec,
};
use std::collections::BTreeSet;

pub(crate) struct Split {
    pub(crate) units: TVec<RuleId, Vec<BodyUnit>>,
    pub(crate) sites: TVec<ContSiteId, ContSite>,
}

pub(crate) fn split(p: &Program) -> Split {
    let mut sites: TVec<ContSiteId, ContSite> = TVec::new();
    let units = p
        .rules
        .iter_enumerate()
        .map(|(r, rule)| {
            if rule.dead {
                return Vec::new();
            }
            split_rule(r, &rule.body, &mut sites)
        })
        .collect();
    Split { units, sites }
}

fn split_rule(r: RuleId, body: &[BodyStep], sites: &mut TVec<ContSiteId, ContSite>) -> Vec<BodyUnit> {
    let mut units: Vec<BodyUnit> = Vec::new();
    let mut cur: Vec<LocalStep> = Vec::new();
    for step in body {
        match step {
            BodyStep::Compute { target, expr } => cur.push(LocalStep::Compute {
                target: *target,
                expr: expr.clone(),
            }),
            BodyStep::Fail => cur.push(LocalStep::Fail),
            BodyStep::Add { constraint, args } => units.push(BodyUnit {
                steps: std::mem::take(&mut cur),
                reentrant: Some(ReentrantStep::Add {
                    constraint: *constraint,
                    args: args.clone(),
                }),
                next: None,
            }),
            BodyStep::Unify { lhs, rhs } => units.push(BodyUnit {
                steps: std::mem::take(&mut cur),
                reentrant: Some(ReentrantStep::Unify {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                }),
                next: None,
            }),
        }
    }
    if !cur.is_empty() {
        units.push(BodyUnit {
            steps: cur,
            reentrant: None,
            next: None,
        });
    }

    // Live variables at each unit entry, back to front.
    let mut live: BTreeSet<VarId> = BTreeSet::new();
    let mut live_in: Vec<Vec<VarId>> = vec![Vec::new(); units.len()];
    for (i, unit) in units.iter().enumerate().rev() {
        match &unit.reentrant {
            Some(ReentrantStep::Add { args, .. }) => {
                for a in args {
                    a.visit_vars(&mut |v| {
                        live.insert(v);
                    });
                }
            }
            Some(ReentrantStep::Unify { lhs, rhs }) => {
                for e in [lhs, rhs] {
                    e.visit_vars(&mut |v| {
                        live.insert(v);
                    });
                }
            }
            None => {}
        }
        for step in unit.steps.iter().rev() {
            match step {
                LocalStep::Compute { target, expr } => {
                    live.remove(target);
                    expr.visit_vars(&mut |v| {
                        live.insert(v);
                    });
                }
                LocalStep::Fail => {}
            }
        }
        live_in[i] = live.iter().copied().collect();
    }

    for i in 1..units.len() {
        let site = sites.push(ContSite {
            rule: r,
            unit: i,
            captures: live_in[i].clone(),
        });
        units[i - 1].next = Some(site);
    }
    units
}
