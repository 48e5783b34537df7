//! Structurization: recovering the region tree of a function from its
//! [`ControlFlowGraph`] and merge annotations.
//!
//! The pipeline, per function, is:
//! * [`DominatorTree::compute`] (from [`cfg`](crate::cfg))
//! * [`Constructs::build`](construct::Constructs::build): construct intervals
//!   and nesting (also validating merge placement)
//! * [`classify_edge`](construct::Constructs::classify_edge): the structured
//!   meaning of every branch, queried on demand by emission
//! * two emission passes, with a [`HoistPlan`](hoist::HoistPlan) computed
//!   in between from what the first pass observed
//! * (optionally) verification of the resulting [`FuncDefBody`]

// NOTE(eddyb) all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod construct;
pub mod edge;
mod emit;
pub mod hoist;
pub mod verify;

use crate::cfg::{ControlFlowGraph, DominatorTree};
use crate::spv::lower::FuncEnv;
use crate::{Context, FuncDefBody, Result};
use construct::Constructs;
use hoist::HoistPlan;
use serde::Deserialize;
use tracing::debug;

/// Toggles for behavior where more than one structured form is valid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Emit `break_if` for a conditional branch ending a `continuing` block,
    /// between the loop header and the loop merge. When disabled, such a
    /// branch sets a flag, and the `continuing` block ends in `break_if %flag`.
    pub collapse_break_if: bool,

    /// Leave a construct normally (instead of through a deferral flag, checked
    /// after the construct) when its merge block contains nothing but a branch
    /// that has the same meaning as the exit being taken.
    pub pass_through_trivial_merges: bool,

    /// Run [`verify::verify_func_body`] on every structurized function.
    pub verify: bool,
}

impl Config {
    pub const DEFAULT: Self = Self {
        collapse_break_if: true,
        pass_through_trivial_merges: true,
        verify: true,
    };

    /// Every transformation disabled, always using the most general form.
    pub const GENERAL: Self = Self {
        collapse_break_if: false,
        pass_through_trivial_merges: false,
        ..Self::DEFAULT
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub struct Structurizer<'a> {
    cx: &'a Context,
    config: &'a Config,
}

impl<'a> Structurizer<'a> {
    pub fn new(cx: &'a Context, config: &'a Config) -> Self {
        Self { cx, config }
    }

    /// Structurize one function, given its CFG and the environment resolving
    /// every ID defined outside of its blocks (module-level values, function
    /// parameters), and the types of all IDs it defines.
    ///
    /// On failure, nothing is kept from the (partially) emitted function.
    pub fn structurize_func(
        &self,
        cfg: &ControlFlowGraph,
        env: &FuncEnv<'_>,
    ) -> Result<FuncDefBody> {
        let dom = DominatorTree::compute(cfg);
        let constructs = Constructs::build(cfg, &dom)?;
        debug!(
            blocks = cfg.len(),
            reachable_blocks = constructs.order.len(),
            constructs = constructs.len(),
            "built constructs"
        );

        let (_, record) =
            emit::Emitter::new(self.cx, self.config, cfg, &dom, &constructs, env, None)
                .emit_func()?;
        let plan = HoistPlan::from_record(&record)?;
        debug!(
            unresolved_uses = record.unresolved_uses.len(),
            hoisting = !plan.is_empty(),
            "planned value hoisting"
        );

        let (func_def_body, _) =
            emit::Emitter::new(self.cx, self.config, cfg, &dom, &constructs, env, Some(&plan))
                .emit_func()?;

        if self.config.verify {
            verify::verify_func_body(self.cx, &func_def_body)?;
        }
        Ok(func_def_body)
    }
}
