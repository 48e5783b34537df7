//! Value Hoisting Resolver.
//!
//! Structured emission runs twice per function: the first pass records where
//! every SPIR-V ID is defined (as a path of nested regions) and every use that
//! couldn't see its definition, and [`HoistPlan::from_record`] turns that into
//! the results each construct must produce (and the parameters each loop's
//! `continuing` block must take), which the second pass then emits.

use crate::{spv, Error, FxIndexSet, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;

/// Identity of a structured node (`if`/`switch`/`loop`, including synthetic
/// `if`s) which is stable across both emission passes (nodes are created in
/// the same order by both).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId(pub(super) u32);

/// Which region of its structured node a [`ScopeElem`] refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Then,
    Else,
    Case(u32),
    Body,
    Continuing,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScopeElem {
    pub control: ControlId,
    pub role: Role,
}

/// Regions enclosing some point, outermost first (empty for the function body).
pub type ScopePath = SmallVec<[ScopeElem; 4]>;

/// Observations made by the first emission pass.
#[derive(Default)]
pub struct HoistRecord {
    pub def_paths: FxHashMap<spv::Id, ScopePath>,

    /// Uses which couldn't see the definition of their ID, in emission order.
    pub unresolved_uses: Vec<(spv::Id, ScopePath)>,

    /// Loops whose `continuing` block can exit the loop (through `break_if`).
    pub loops_exiting_from_continuing: FxHashSet<ControlId>,
}

impl HoistRecord {
    pub fn record_def(&mut self, id: spv::Id, path: ScopePath) {
        self.def_paths.insert(id, path);
    }

    pub fn record_unresolved_use(&mut self, id: spv::Id, path: ScopePath) {
        self.unresolved_uses.push((id, path));
    }
}

#[derive(Default, Debug)]
pub struct HoistPlan {
    /// IDs each structured node produces as results, in output order.
    results: FxHashMap<ControlId, FxIndexSet<spv::Id>>,

    /// IDs each loop passes from its body to its `continuing` block.
    continuing_params: FxHashMap<ControlId, FxIndexSet<spv::Id>>,
}

impl HoistPlan {
    pub fn from_record(record: &HoistRecord) -> Result<Self> {
        let mut plan = Self::default();

        for (id, use_path) in &record.unresolved_uses {
            let id = *id;
            let def_path = record
                .def_paths
                .get(&id)
                .ok_or(Error::UnresolvableHoist { id })?;

            let common = def_path
                .iter()
                .zip(use_path)
                .take_while(|(d, u)| d == u)
                .count();

            // Definitions in an enclosing region can only be missed by uses
            // preceding them, which no amount of hoisting can fix.
            if common == def_path.len() {
                return Err(Error::UnresolvableHoist { id });
            }

            let mut hoist_from = common;
            if let Some(u) = use_path.get(common) {
                let d = def_path[common];
                if d.control == u.control && d.role == Role::Body && u.role == Role::Continuing {
                    trace!(%id, loop_control = ?d.control, "hoisting into continuing block parameter");
                    plan.continuing_params
                        .entry(d.control)
                        .or_default()
                        .insert(id);
                    hoist_from = common + 1;
                }
            }
            for elem in &def_path[hoist_from..] {
                trace!(%id, control = ?elem.control, "hoisting into construct result");
                plan.results.entry(elem.control).or_default().insert(id);
            }
        }

        // Loop results defined in the body must also reach `break_if`, through
        // the `continuing` block's parameters.
        let mut exiting_loops: Vec<_> = record.loops_exiting_from_continuing.iter().copied().collect();
        exiting_loops.sort();
        for loop_control in exiting_loops {
            let Some(results) = plan.results.get(&loop_control) else {
                continue;
            };
            let from_body: SmallVec<[spv::Id; 4]> = results
                .iter()
                .copied()
                .filter(|id| {
                    record.def_paths[id].contains(&ScopeElem {
                        control: loop_control,
                        role: Role::Body,
                    })
                })
                .collect();
            if !from_body.is_empty() {
                plan.continuing_params
                    .entry(loop_control)
                    .or_default()
                    .extend(from_body);
            }
        }

        Ok(plan)
    }

    pub fn results(&self, control: ControlId) -> impl Iterator<Item = spv::Id> + '_ {
        self.results.get(&control).into_iter().flatten().copied()
    }

    pub fn continuing_params(&self, control: ControlId) -> impl Iterator<Item = spv::Id> + '_ {
        self.continuing_params
            .get(&control)
            .into_iter()
            .flatten()
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.continuing_params.is_empty()
    }
}
