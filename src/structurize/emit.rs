//! Structured Emitter: building the region tree of one function.
//!
//! Emission is a recursive walk, where every region ([`Block`] of the output)
//! is a [`Frame`] on a stack, filled from a queue of [`SeqItem`]s. Blocks of
//! the CFG are emitted (by [`SeqItem::Chain`]) in place, following forward
//! edges, while every other edge becomes an exit (see [`EdgeKind`]), which is
//! resolved against the frame stack (see [`Emitter::emit_exit`]).

use super::construct::{ConstructIdx, ConstructKind, Constructs};
use super::edge::EdgeKind;
use super::hoist::{ControlId, HoistPlan, HoistRecord, Role, ScopeElem, ScopePath};
use super::Config;
use crate::cfg::{self, BlockIdx, ControlFlowGraph, DominatorTree};
use crate::spv::lower::{FuncEnv, LoweredInst};
use crate::spv::{self, spec};
use crate::{
    BinaryOp, Block, BlockDef, BlockParamDecl, CaseSelector, ConstDef, ConstKind, Context,
    EntityDefs, Error, FuncDefBody, InstOp, Node, NodeDef, NodeKind, NodeOutputDecl, Result,
    SwitchCase, Terminator, Type, TypeDef, UnaryOp, Value,
};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use std::collections::VecDeque;
use tracing::trace;

/// What a region is part of, which determines how it can be left.
#[derive(Copy, Clone, Debug)]
enum FrameKind {
    FuncBody,

    /// Either arm of an `if` construct.
    IfArm {
        construct: ConstructIdx,
        node: Node,
    },

    /// The `true` arm of the guard `if` of a premerge block.
    PremergeArm {
        construct: ConstructIdx,
        premerge: u32,
        node: Node,
    },

    SwitchCase {
        construct: ConstructIdx,
        node: Node,
    },
    LoopBody {
        construct: ConstructIdx,
        node: Node,
    },
    LoopContinuing {
        construct: ConstructIdx,
        node: Node,
    },

    /// Arm of a synthetic `if` (with no construct of its own), only ever left
    /// by reaching its end, while any exits are taken from inside it.
    Nested { node: Node },
}

impl FrameKind {
    fn node(self) -> Option<Node> {
        match self {
            FrameKind::FuncBody => None,
            FrameKind::IfArm { node, .. }
            | FrameKind::PremergeArm { node, .. }
            | FrameKind::SwitchCase { node, .. }
            | FrameKind::LoopBody { node, .. }
            | FrameKind::LoopContinuing { node, .. }
            | FrameKind::Nested { node } => Some(node),
        }
    }

    /// Whether an exit of kind `kind` is taken by leaving this region.
    fn handles(self, kind: EdgeKind) -> bool {
        match (self, kind) {
            (
                FrameKind::IfArm { construct, .. } | FrameKind::PremergeArm { construct, .. },
                EdgeKind::IfBreak(c) | EdgeKind::IfPremerge(c, _),
            )
            | (FrameKind::SwitchCase { construct, .. }, EdgeKind::SwitchBreak(c))
            | (
                FrameKind::LoopBody { construct, .. } | FrameKind::LoopContinuing { construct, .. },
                EdgeKind::LoopBreak(c),
            )
            | (FrameKind::LoopBody { construct, .. }, EdgeKind::LoopContinue(c))
            | (FrameKind::LoopContinuing { construct, .. }, EdgeKind::BackEdge(c)) => {
                construct == c
            }
            _ => false,
        }
    }

    /// Whether the terminator this region ends in when its sequence runs out
    /// is also how an exit of kind `kind` (handled by this region) is taken.
    fn ends_by(self, kind: EdgeKind) -> bool {
        match self {
            FrameKind::IfArm { .. } | FrameKind::PremergeArm { .. } | FrameKind::SwitchCase { .. } => {
                true
            }
            FrameKind::LoopBody { .. } => matches!(kind, EdgeKind::LoopContinue(_)),
            FrameKind::LoopContinuing { .. } => matches!(kind, EdgeKind::BackEdge(_)),
            FrameKind::FuncBody | FrameKind::Nested { .. } => false,
        }
    }

    /// Whether an exit of kind `kind`, handled by an outer region, can jump
    /// directly out of this region (and its node).
    ///
    /// `exit_if` only leaves the innermost `if`, but `exit_switch`, `exit_loop`
    /// and `continue` may also leave any `if`s nested in their construct, and
    /// `continue` may leave a `switch` as well.
    fn can_be_crossed_by(self, kind: EdgeKind) -> bool {
        match self {
            FrameKind::Nested { .. } => true,
            FrameKind::IfArm { .. } | FrameKind::PremergeArm { .. } => matches!(
                kind,
                EdgeKind::SwitchBreak(_) | EdgeKind::LoopBreak(_) | EdgeKind::LoopContinue(_)
            ),
            FrameKind::SwitchCase { .. } => matches!(kind, EdgeKind::LoopContinue(_)),
            FrameKind::FuncBody | FrameKind::LoopBody { .. } | FrameKind::LoopContinuing { .. } => {
                false
            }
        }
    }

    /// The exit leaving this region's construct through its merge block.
    fn merge_exit(self) -> Option<EdgeKind> {
        match self {
            FrameKind::IfArm { construct, .. } | FrameKind::PremergeArm { construct, .. } => {
                Some(EdgeKind::IfBreak(construct))
            }
            FrameKind::SwitchCase { construct, .. } => Some(EdgeKind::SwitchBreak(construct)),
            FrameKind::LoopBody { construct, .. } | FrameKind::LoopContinuing { construct, .. } => {
                Some(EdgeKind::LoopBreak(construct))
            }
            FrameKind::FuncBody | FrameKind::Nested { .. } => None,
        }
    }
}

struct Frame {
    kind: FrameKind,
    scope: Option<ScopeElem>,

    block: Block,
    nodes: Vec<Node>,

    /// Values of SPIR-V IDs defined in this region (or rebound to the results
    /// of nodes in this region, or to its parameters).
    bindings: FxHashMap<spv::Id, Value>,

    /// `continuing` blocks only: flag set by loop breaks nested in the block,
    /// which can't jump out of the loop directly.
    break_flag: Option<Value>,
}

enum SeqItem {
    /// Emit a CFG block, then continue through its forward edges.
    Chain(BlockIdx),

    /// Emit a loop header, as the start of its loop's body.
    LoopBody(BlockIdx),

    Edge {
        from: BlockIdx,
        to: BlockIdx,
    },
    Exit(EdgeKind),

    /// The guard `if` of a premerge block, right after its `if` construct.
    Guard {
        construct: ConstructIdx,
        premerge: u32,
    },

    /// Take an exit deferred by setting `flag`, if it was set.
    FlagCheck {
        flag: Value,
        kind: EdgeKind,
    },

    Unreachable,
}

/// How an exit is taken, relative to the current frame stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Route {
    /// Reach the end of the current region (and any enclosing nested ones).
    FallOut,

    /// A jump (e.g. `exit_loop` or `continue`) out of all regions in between.
    Direct,

    /// Set a flag and leave the node of the frame at this index, for the exit
    /// to be taken after it (see [`SeqItem::FlagCheck`]).
    Defer(usize),
}

pub(super) struct Emitter<'a> {
    cx: &'a Context,
    config: &'a Config,
    cfg: &'a ControlFlowGraph,
    dom: &'a DominatorTree,
    constructs: &'a Constructs,
    env: &'a FuncEnv<'a>,

    /// Results and `continuing` parameters to emit, `None` in the first pass.
    plan: Option<&'a HoistPlan>,
    record: HoistRecord,

    blocks: EntityDefs<Block, BlockDef>,
    nodes: EntityDefs<Node, NodeDef>,

    frames: Vec<Frame>,
    next_control: u32,
    emitted: Vec<bool>,

    /// Guard variables of the premerge blocks of every `if` construct.
    guards: FxHashMap<ConstructIdx, SmallVec<[Value; 2]>>,

    /// Exits to take (by checking their flag) after a node.
    deferred: FxHashMap<Node, SmallVec<[(Value, EdgeKind); 2]>>,
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidStructure {
        reason: reason.into(),
    }
}

fn prepend(queue: &mut VecDeque<SeqItem>, items: impl IntoIterator<Item = SeqItem>) {
    let items: SmallVec<[_; 4]> = items.into_iter().collect();
    for item in items.into_iter().rev() {
        queue.push_front(item);
    }
}

impl<'a> Emitter<'a> {
    pub(super) fn new(
        cx: &'a Context,
        config: &'a Config,
        cfg: &'a ControlFlowGraph,
        dom: &'a DominatorTree,
        constructs: &'a Constructs,
        env: &'a FuncEnv<'a>,
        plan: Option<&'a HoistPlan>,
    ) -> Self {
        Self {
            cx,
            config,
            cfg,
            dom,
            constructs,
            env,
            plan,
            record: HoistRecord::default(),
            blocks: EntityDefs::new(),
            nodes: EntityDefs::new(),
            frames: vec![],
            next_control: 0,
            emitted: vec![false; cfg.len()],
            guards: FxHashMap::default(),
            deferred: FxHashMap::default(),
        }
    }

    pub(super) fn emit_func(mut self) -> Result<(FuncDefBody, HoistRecord)> {
        let entry = self.cfg.entry();
        let body = self.emit_region(
            FrameKind::FuncBody,
            None,
            &[],
            [SeqItem::Chain(entry)].into(),
        )?;

        // NOTE(eddyb) unused flags would be harmless, but they can only come
        // from a bug in the placement of flag checks.
        if !self.deferred.is_empty() {
            return Err(invalid("deferred exits left unchecked"));
        }

        Ok((
            FuncDefBody {
                blocks: self.blocks,
                nodes: self.nodes,
                body,
            },
            self.record,
        ))
    }

    fn emit_region(
        &mut self,
        kind: FrameKind,
        scope: Option<ScopeElem>,
        params: &[(spv::Id, Type)],
        items: VecDeque<SeqItem>,
    ) -> Result<Block> {
        // HACK(eddyb) the block is defined ahead of time (and its contents
        // replaced at the end) so that its parameters can be referenced.
        let block = self.blocks.define(
            self.cx,
            BlockDef {
                params: params.iter().map(|&(_, ty)| BlockParamDecl { ty }).collect(),
                nodes: vec![],
                terminator: Terminator::Unreachable,
            },
        );
        let bindings = params
            .iter()
            .enumerate()
            .map(|(idx, &(id, _))| {
                (
                    id,
                    Value::BlockParam {
                        block,
                        idx: idx as u32,
                    },
                )
            })
            .collect();
        self.frames.push(Frame {
            kind,
            scope,
            block,
            nodes: vec![],
            bindings,
            break_flag: None,
        });

        let terminator = match self.emit_seq(items)? {
            Some(terminator) => terminator,
            None => self.frame_ending(self.frames.len() - 1)?,
        };

        let frame = self.frames.pop().unwrap();
        assert!(frame.block == block);
        let block_def = &mut self.blocks[block];
        block_def.nodes = frame.nodes;
        block_def.terminator = terminator;
        Ok(block)
    }

    fn emit_seq(&mut self, mut queue: VecDeque<SeqItem>) -> Result<Option<Terminator>> {
        while let Some(item) = queue.pop_front() {
            let terminator = match item {
                SeqItem::Chain(block) => self.emit_block(block, false, &mut queue)?,
                SeqItem::LoopBody(header) => self.emit_block(header, true, &mut queue)?,
                SeqItem::Edge { from, to } => self.emit_edge(from, to, &mut queue)?,
                SeqItem::Exit(kind) => Some(self.emit_exit(kind)?),
                SeqItem::Guard {
                    construct,
                    premerge,
                } => {
                    self.emit_guard(construct, premerge, &mut queue)?;
                    None
                }
                SeqItem::FlagCheck { flag, kind } => {
                    self.emit_flag_check(flag, kind, &mut queue)?;
                    None
                }
                SeqItem::Unreachable => Some(Terminator::Unreachable),
            };
            if let Some(terminator) = terminator {
                if !queue.is_empty() {
                    return Err(invalid("region terminated before the end of its sequence"));
                }
                return Ok(Some(terminator));
            }
        }
        Ok(None)
    }

    fn emit_block(
        &mut self,
        block: BlockIdx,
        as_loop_body: bool,
        queue: &mut VecDeque<SeqItem>,
    ) -> Result<Option<Terminator>> {
        let (cfg, constructs) = (self.cfg, self.constructs);

        if !self.dom.is_reachable(block) {
            return Ok(Some(Terminator::Unreachable));
        }

        let construct = constructs.headed_by(block);
        if let Some(c) = construct {
            if constructs[c].is_loop() && !as_loop_body {
                let items = self.emit_loop(c)?;
                prepend(queue, items);
                return Ok(None);
            }
        }

        let bb = &cfg.blocks[block.index()];
        if std::mem::replace(&mut self.emitted[block.index()], true) {
            return Err(invalid(format!("block %{} reached more than once", bb.label)));
        }
        trace!(?block, label = %bb.label, "emitting block");

        for inst in &bb.insts {
            self.emit_inst(inst)?;
        }

        if let Some(c) = construct {
            let items = match constructs[c].kind {
                ConstructKind::If { .. } => Some(self.emit_if(c)?),
                ConstructKind::Switch { .. } => Some(self.emit_switch(c)?),
                ConstructKind::Loop { .. } => None,
            };
            if let Some(items) = items {
                prepend(queue, items);
                return Ok(None);
            }
        }

        match bb.terminator {
            cfg::Terminator::Return { value } => Ok(Some(Terminator::Return(
                value.map(|value| self.use_id(value)).transpose()?,
            ))),
            cfg::Terminator::Unreachable => Ok(Some(Terminator::Unreachable)),
            cfg::Terminator::Kill => Ok(Some(Terminator::TerminateInvocation)),
            cfg::Terminator::Branch { target } => self.emit_edge(block, target, queue),
            cfg::Terminator::BranchConditional {
                cond,
                true_target,
                false_target,
            } => self.emit_cond_branch(block, cond, true_target, false_target, queue),
            cfg::Terminator::Switch { default, .. } => Err(Error::UnstructuredBranch {
                from: bb.label,
                to: cfg.blocks[default.index()].label,
                reason: "`OpSwitch` without `OpSelectionMerge`",
            }),
        }
    }

    fn emit_inst(&mut self, inst: &spv::InstWithIds) -> Result<()> {
        match self.env.lower_inst(inst)? {
            LoweredInst::Value(value) => {
                if let Some(id) = inst.result_id {
                    self.bind(id, value);
                }
            }
            LoweredInst::Node { op, inputs, output } => {
                let inputs = inputs
                    .iter()
                    .map(|&id| self.use_id(id))
                    .collect::<Result<_>>()?;
                let node = self.push_inst(op, inputs, output);
                if let (Some(id), Some(_)) = (inst.result_id, output) {
                    self.bind(
                        id,
                        Value::NodeOutput {
                            node,
                            output_idx: 0,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn emit_edge(
        &mut self,
        from: BlockIdx,
        to: BlockIdx,
        queue: &mut VecDeque<SeqItem>,
    ) -> Result<Option<Terminator>> {
        let kind = self.constructs.classify_edge(self.cfg, from, to)?;
        trace!(?from, ?to, ?kind, "classified edge");
        if kind == EdgeKind::Forward {
            queue.push_front(SeqItem::Chain(to));
            return Ok(None);
        }
        self.emit_exit(kind).map(Some)
    }

    /// Emit an `OpBranchConditional` that isn't the terminator of a selection
    /// header (i.e. has no `OpSelectionMerge`), as a synthetic `if` around its
    /// exits (or as `break_if`, when it ends a `continuing` block).
    fn emit_cond_branch(
        &mut self,
        from: BlockIdx,
        cond: spv::Id,
        true_target: BlockIdx,
        false_target: BlockIdx,
        queue: &mut VecDeque<SeqItem>,
    ) -> Result<Option<Terminator>> {
        let cfg = self.cfg;
        let true_kind = self.constructs.classify_edge(cfg, from, true_target)?;
        let false_kind = self.constructs.classify_edge(cfg, from, false_target)?;
        trace!(?from, ?true_kind, ?false_kind, "classified conditional branch");

        let cond = self.use_id(cond)?;

        if true_target == false_target {
            let cond = self.push_binary_bool(BinaryOp::Or, cond, cond);
            let mut then_items = VecDeque::from([SeqItem::Edge {
                from,
                to: true_target,
            }]);
            then_items.extend(queue.drain(..));
            let items = self.emit_nested_if(cond, then_items, [SeqItem::Unreachable].into())?;
            prepend(queue, items);
            return Ok(None);
        }

        if self.config.collapse_break_if {
            let top = self.frames.len() - 1;
            if let FrameKind::LoopContinuing { construct, node } = self.frames[top].kind {
                let negate = match (true_kind, false_kind) {
                    (EdgeKind::LoopBreak(a), EdgeKind::BackEdge(b)) if a == construct && b == a => {
                        Some(false)
                    }
                    (EdgeKind::BackEdge(a), EdgeKind::LoopBreak(b)) if a == construct && b == a => {
                        Some(true)
                    }
                    _ => None,
                };
                if let Some(negate) = negate {
                    let mut cond = cond;
                    if negate {
                        cond = self.push_value(
                            InstOp::Unary(UnaryOp::Not),
                            smallvec![cond],
                            self.bool_type(),
                        );
                    }
                    if let Some(flag) = self.frames[top].break_flag {
                        let flag = self.push_load_bool(flag);
                        cond = self.push_binary_bool(BinaryOp::Or, flag, cond);
                    }
                    self.record_continuing_exit(top);
                    return Ok(Some(Terminator::BreakIf {
                        loop_node: node,
                        cond,
                        exit_args: self.result_args(top)?,
                    }));
                }
            }
        }

        match (true_kind, false_kind) {
            (EdgeKind::Forward, EdgeKind::Forward) => Err(Error::UnstructuredBranch {
                from: cfg.blocks[from.index()].label,
                to: cfg.blocks[false_target.index()].label,
                reason: "conditional branch without a merge, to two forward targets",
            }),

            (EdgeKind::Forward, exit) | (exit, EdgeKind::Forward) => {
                let exit_on_true = true_kind != EdgeKind::Forward;
                let forward = if exit_on_true { false_target } else { true_target };

                // A jump can be emitted on its own, with the forward edge
                // continuing the current sequence (after the `if`), otherwise
                // the rest of the sequence has to be nested in the other arm.
                let direct = self.exit_is_direct(exit)?;
                let exit_items = VecDeque::from([SeqItem::Exit(exit)]);
                let other_items = if direct {
                    VecDeque::new()
                } else {
                    let mut items = VecDeque::from([SeqItem::Chain(forward)]);
                    items.extend(queue.drain(..));
                    items
                };
                let (then_items, else_items) = if exit_on_true {
                    (exit_items, other_items)
                } else {
                    (other_items, exit_items)
                };
                let mut items = self.emit_nested_if(cond, then_items, else_items)?;
                if direct {
                    items.push(SeqItem::Chain(forward));
                }
                prepend(queue, items);
                Ok(None)
            }

            (true_kind, false_kind) => {
                let both_direct = self.exit_is_direct(true_kind)? && self.exit_is_direct(false_kind)?;
                let items = self.emit_nested_if(
                    cond,
                    [SeqItem::Exit(true_kind)].into(),
                    [SeqItem::Exit(false_kind)].into(),
                )?;
                prepend(queue, items);
                if both_direct && queue.is_empty() {
                    Ok(Some(Terminator::Unreachable))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn emit_if(&mut self, c: ConstructIdx) -> Result<SmallVec<[SeqItem; 4]>> {
        let (cfg, constructs) = (self.cfg, self.constructs);
        let construct = &constructs[c];
        let header = construct.header;
        let (true_target, false_target, control, premerges) = match &construct.kind {
            ConstructKind::If {
                true_target,
                false_target,
                control,
                premerges,
            } => (*true_target, *false_target, *control, premerges),
            _ => unreachable!("emit_if: not an `if` construct"),
        };
        let cond = match cfg.blocks[header.index()].terminator {
            cfg::Terminator::BranchConditional { cond, .. } => cond,
            _ => unreachable!("emit_if: header not ending in `OpBranchConditional`"),
        };

        let mut cond = self.use_id(cond)?;

        // Both arms entering the same block (other than the merge) can only
        // be represented by one of the arms.
        let duplicate_arm = true_target == false_target && true_target != construct.merge;
        if duplicate_arm {
            cond = self.push_binary_bool(BinaryOp::Or, cond, cond);
        }

        let guards = premerges.iter().map(|_| self.push_var(true)).collect();
        self.guards.insert(c, guards);

        let control_id = self.new_control();
        let node = self.placeholder_node();
        let arm = FrameKind::IfArm { construct: c, node };
        let then_block = self.emit_region(
            arm,
            Some(ScopeElem {
                control: control_id,
                role: Role::Then,
            }),
            &[],
            [SeqItem::Edge {
                from: header,
                to: true_target,
            }]
            .into(),
        )?;
        let else_items = if duplicate_arm {
            SeqItem::Unreachable
        } else {
            SeqItem::Edge {
                from: header,
                to: false_target,
            }
        };
        let else_block = self.emit_region(
            arm,
            Some(ScopeElem {
                control: control_id,
                role: Role::Else,
            }),
            &[],
            [else_items].into(),
        )?;

        let mut items = self.close_node(
            node,
            control_id,
            NodeKind::If {
                cond,
                then_block,
                else_block,
                control,
            },
        )?;
        items.extend((0..premerges.len() as u32).map(|premerge| SeqItem::Guard {
            construct: c,
            premerge,
        }));
        items.push(SeqItem::Chain(construct.merge));
        Ok(items)
    }

    /// Emit `if (load guard) { <premerge block> } else { exit_if }`.
    fn emit_guard(
        &mut self,
        c: ConstructIdx,
        premerge: u32,
        queue: &mut VecDeque<SeqItem>,
    ) -> Result<()> {
        let guard = self.guards[&c][premerge as usize];
        let premerge_block = self.constructs.premerges(c)[premerge as usize];

        let cond = self.push_load_bool(guard);
        let control_id = self.new_control();
        let node = self.placeholder_node();
        let then_block = self.emit_region(
            FrameKind::PremergeArm {
                construct: c,
                premerge,
                node,
            },
            Some(ScopeElem {
                control: control_id,
                role: Role::Then,
            }),
            &[],
            [SeqItem::Chain(premerge_block)].into(),
        )?;
        let else_block = self.emit_region(
            FrameKind::Nested { node },
            Some(ScopeElem {
                control: control_id,
                role: Role::Else,
            }),
            &[],
            VecDeque::new(),
        )?;
        let items = self.close_node(
            node,
            control_id,
            NodeKind::If {
                cond,
                then_block,
                else_block,
                control: spec::SelectionControl::None,
            },
        )?;
        prepend(queue, items);
        Ok(())
    }

    fn emit_switch(&mut self, c: ConstructIdx) -> Result<SmallVec<[SeqItem; 4]>> {
        let (cfg, constructs) = (self.cfg, self.constructs);
        let construct = &constructs[c];
        let header = construct.header;
        let control = match construct.kind {
            ConstructKind::Switch { control, .. } => control,
            _ => unreachable!("emit_switch: not a `switch` construct"),
        };
        let (selector, default, cases) = match &cfg.blocks[header.index()].terminator {
            cfg::Terminator::Switch {
                selector,
                default,
                cases,
            } => (*selector, *default, cases),
            _ => unreachable!("emit_switch: header not ending in `OpSwitch`"),
        };

        let selector_type = self.env.id_type(selector)?;
        let selector = self.use_id(selector)?;

        // Cases are grouped by target, in the order targets first appear in.
        let mut groups: SmallVec<[(SmallVec<[CaseSelector; 2]>, BlockIdx); 4]> = SmallVec::new();
        for &(literal, target) in cases {
            let value = CaseSelector::Literal(self.case_literal(selector_type, literal)?);
            match groups.iter_mut().find(|(_, t)| *t == target) {
                Some((selectors, _)) => selectors.push(value),
                None => groups.push((smallvec![value], target)),
            }
        }
        match groups.iter_mut().find(|(_, t)| *t == default) {
            Some((selectors, _)) => selectors.push(CaseSelector::Default),
            None => groups.push((smallvec![CaseSelector::Default], default)),
        }

        let control_id = self.new_control();
        let node = self.placeholder_node();
        let mut switch_cases = SmallVec::with_capacity(groups.len());
        for (i, (selectors, target)) in groups.into_iter().enumerate() {
            let block = self.emit_region(
                FrameKind::SwitchCase { construct: c, node },
                Some(ScopeElem {
                    control: control_id,
                    role: Role::Case(i as u32),
                }),
                &[],
                [SeqItem::Edge {
                    from: header,
                    to: target,
                }]
                .into(),
            )?;
            switch_cases.push(SwitchCase { selectors, block });
        }

        let mut items = self.close_node(
            node,
            control_id,
            NodeKind::Switch {
                selector,
                cases: switch_cases,
                control,
            },
        )?;
        items.push(SeqItem::Chain(construct.merge));
        Ok(items)
    }

    fn case_literal(&self, ty: Type, literal: spv::Literal) -> Result<crate::Const> {
        match literal {
            spv::Literal::Int(x) => Ok(self.cx.intern(ConstDef {
                ty,
                kind: ConstKind::Int(x),
            })),
            spv::Literal::Float(_) => Err(Error::Unsupported {
                reason: format!("non-integer `OpSwitch` literal `{literal}`"),
            }),
        }
    }

    fn emit_loop(&mut self, c: ConstructIdx) -> Result<SmallVec<[SeqItem; 4]>> {
        let construct = &self.constructs[c];
        let (header, merge) = (construct.header, construct.merge);
        let (continue_target, control) = match construct.kind {
            ConstructKind::Loop {
                continue_target,
                control,
            } => (continue_target, control),
            _ => unreachable!("emit_loop: not a `loop` construct"),
        };

        let control_id = self.new_control();
        let node = self.placeholder_node();

        let body = self.emit_region(
            FrameKind::LoopBody { construct: c, node },
            Some(ScopeElem {
                control: control_id,
                role: Role::Body,
            }),
            &[],
            [SeqItem::LoopBody(header)].into(),
        )?;

        let params = match self.plan {
            Some(plan) => plan
                .continuing_params(control_id)
                .map(|id| Ok((id, self.env.id_type(id)?)))
                .collect::<Result<SmallVec<[_; 2]>>>()?,
            None => SmallVec::new(),
        };
        let continuing_items = if continue_target == header || !self.dom.is_reachable(continue_target)
        {
            VecDeque::new()
        } else {
            [SeqItem::Chain(continue_target)].into()
        };
        let continuing = self.emit_region(
            FrameKind::LoopContinuing { construct: c, node },
            Some(ScopeElem {
                control: control_id,
                role: Role::Continuing,
            }),
            &params,
            continuing_items,
        )?;

        let mut items = self.close_node(
            node,
            control_id,
            NodeKind::Loop {
                body,
                continuing,
                control,
            },
        )?;
        items.push(SeqItem::Chain(merge));
        Ok(items)
    }

    fn emit_nested_if(
        &mut self,
        cond: Value,
        then_items: VecDeque<SeqItem>,
        else_items: VecDeque<SeqItem>,
    ) -> Result<SmallVec<[SeqItem; 4]>> {
        let control_id = self.new_control();
        let node = self.placeholder_node();
        let then_block = self.emit_region(
            FrameKind::Nested { node },
            Some(ScopeElem {
                control: control_id,
                role: Role::Then,
            }),
            &[],
            then_items,
        )?;
        let else_block = self.emit_region(
            FrameKind::Nested { node },
            Some(ScopeElem {
                control: control_id,
                role: Role::Else,
            }),
            &[],
            else_items,
        )?;
        self.close_node(
            node,
            control_id,
            NodeKind::If {
                cond,
                then_block,
                else_block,
                control: spec::SelectionControl::None,
            },
        )
    }

    /// Emit `if (load flag) { <exit> } else { <rest of the sequence> }`.
    fn emit_flag_check(
        &mut self,
        flag: Value,
        kind: EdgeKind,
        queue: &mut VecDeque<SeqItem>,
    ) -> Result<()> {
        let cond = self.push_load_bool(flag);
        let rest = queue.drain(..).collect();
        let items = self.emit_nested_if(cond, [SeqItem::Exit(kind)].into(), rest)?;
        prepend(queue, items);
        Ok(())
    }

    /// Take an exit from the current position, returning the terminator of
    /// the current region.
    fn emit_exit(&mut self, kind: EdgeKind) -> Result<Terminator> {
        let mut kind = kind;
        let handler = self.handler_frame(kind)?;

        // `break_if` being the only way out of a loop from its `continuing`
        // block, the break is only recorded here, and taken at its end.
        if let (EdgeKind::LoopBreak(c), FrameKind::LoopContinuing { .. }) =
            (kind, self.frames[handler].kind)
        {
            let flag = self.break_flag(handler);
            self.push_store_bool(flag, true);
            self.record_continuing_exit(handler);
            kind = EdgeKind::BackEdge(c);
        }

        let route = self.route(kind, handler);
        trace!(?kind, handler, ?route, "taking exit");
        match route {
            Route::FallOut => {
                self.store_guards(kind, handler);
                self.frame_ending(self.frames.len() - 1)
            }
            Route::Direct => {
                self.store_guards(kind, handler);
                match (self.frames[handler].kind, kind) {
                    (FrameKind::LoopBody { node, .. }, EdgeKind::LoopBreak(_)) => {
                        Ok(Terminator::ExitLoop {
                            node,
                            args: self.result_args(handler)?,
                        })
                    }
                    _ => self.frame_ending(handler),
                }
            }
            Route::Defer(blocking) => {
                let blocking_kind = self.frames[blocking].kind;
                let merge_exit = blocking_kind
                    .merge_exit()
                    .ok_or_else(|| invalid(format!("exit {kind:?} blocked by {blocking_kind:?}")))?;

                if self.config.pass_through_trivial_merges
                    && self.merge_passes_through(merge_exit, kind)
                {
                    trace!(?kind, ?merge_exit, "exiting through trivial merge");
                    return self.emit_exit(merge_exit);
                }

                let flag = self.defer_flag(blocking, kind);
                self.push_store_bool(flag, true);
                self.emit_exit(merge_exit)
            }
        }
    }

    fn handler_frame(&self, kind: EdgeKind) -> Result<usize> {
        self.frames
            .iter()
            .rposition(|frame| frame.kind.handles(kind))
            .ok_or_else(|| invalid(format!("no enclosing region to take exit {kind:?} from")))
    }

    fn route(&self, kind: EdgeKind, handler: usize) -> Route {
        let crossed = &self.frames[handler + 1..];
        if let Some(i) = crossed
            .iter()
            .rposition(|frame| !frame.kind.can_be_crossed_by(kind))
        {
            return Route::Defer(handler + 1 + i);
        }
        let only_nested = crossed
            .iter()
            .all(|frame| matches!(frame.kind, FrameKind::Nested { .. }));
        if only_nested && self.frames[handler].kind.ends_by(kind) {
            Route::FallOut
        } else {
            Route::Direct
        }
    }

    fn exit_is_direct(&self, kind: EdgeKind) -> Result<bool> {
        let handler = self.handler_frame(kind)?;
        if let (EdgeKind::LoopBreak(_), FrameKind::LoopContinuing { .. }) =
            (kind, self.frames[handler].kind)
        {
            return Ok(false);
        }
        Ok(self.route(kind, handler) == Route::Direct)
    }

    /// Whether leaving a construct through `merge_exit` also ends up taking
    /// `kind`, without executing anything else on the way.
    fn merge_passes_through(&self, merge_exit: EdgeKind, kind: EdgeKind) -> bool {
        let merge = match merge_exit.target(self.constructs) {
            Some(merge) => merge,
            None => return false,
        };
        let bb = &self.cfg.blocks[merge.index()];
        if !self.dom.is_reachable(merge) || !bb.insts.is_empty() || bb.merge.is_some() {
            return false;
        }
        match bb.terminator {
            cfg::Terminator::Branch { target } => {
                matches!(self.constructs.classify_edge(self.cfg, merge, target), Ok(k) if k == kind)
            }
            _ => false,
        }
    }

    /// Set to `false` the guards of premerge blocks skipped by `kind`.
    fn store_guards(&mut self, kind: EdgeKind, handler: usize) {
        let (c, to_slot) = match kind {
            EdgeKind::IfBreak(c) => (c, self.constructs.premerges(c).len() as u32 + 1),
            EdgeKind::IfPremerge(c, premerge) => (c, premerge + 1),
            _ => return,
        };
        let from_slot = match self.frames[handler].kind {
            FrameKind::PremergeArm { premerge, .. } => premerge + 1,
            _ => 0,
        };
        let guards = self.guards.get(&c).cloned().unwrap_or_default();
        for (i, guard) in guards.into_iter().enumerate() {
            let slot = i as u32 + 1;
            if from_slot < slot && slot < to_slot {
                self.push_store_bool(guard, false);
            }
        }
    }

    /// The terminator the region `frames[frame_idx]` ends in when its sequence
    /// runs out (with the values currently visible as arguments).
    fn frame_ending(&mut self, frame_idx: usize) -> Result<Terminator> {
        let (kind, break_flag) = {
            let frame = &self.frames[frame_idx];
            (frame.kind, frame.break_flag)
        };
        Ok(match kind {
            FrameKind::FuncBody => Terminator::Unreachable,
            FrameKind::IfArm { node, .. }
            | FrameKind::PremergeArm { node, .. }
            | FrameKind::Nested { node } => Terminator::ExitIf {
                node,
                args: self.result_args(frame_idx)?,
            },
            FrameKind::SwitchCase { node, .. } => Terminator::ExitSwitch {
                node,
                args: self.result_args(frame_idx)?,
            },
            FrameKind::LoopBody { node, .. } => Terminator::Continue {
                loop_node: node,
                args: self.continuing_args(frame_idx)?,
            },
            FrameKind::LoopContinuing { node, .. } => match break_flag {
                Some(flag) => {
                    let cond = self.push_load_bool(flag);
                    Terminator::BreakIf {
                        loop_node: node,
                        cond,
                        exit_args: self.result_args(frame_idx)?,
                    }
                }
                None => Terminator::NextIteration { loop_node: node },
            },
        })
    }

    fn control_of(&self, frame_idx: usize) -> Option<ControlId> {
        self.frames[frame_idx].scope.map(|scope| scope.control)
    }

    fn result_args(&self, frame_idx: usize) -> Result<SmallVec<[Value; 2]>> {
        match (self.plan, self.control_of(frame_idx)) {
            (Some(plan), Some(control)) => self.hoisted_args(plan.results(control)),
            _ => Ok(SmallVec::new()),
        }
    }

    fn continuing_args(&self, frame_idx: usize) -> Result<SmallVec<[Value; 2]>> {
        match (self.plan, self.control_of(frame_idx)) {
            (Some(plan), Some(control)) => self.hoisted_args(plan.continuing_params(control)),
            _ => Ok(SmallVec::new()),
        }
    }

    /// Values of `ids` as currently visible, or `undef` on paths that never
    /// defined them.
    fn hoisted_args(&self, ids: impl Iterator<Item = spv::Id>) -> Result<SmallVec<[Value; 2]>> {
        ids.map(|id| match self.lookup(id) {
            Some(value) => Ok(value),
            None => Ok(Value::Const(self.cx.undef(self.env.id_type(id)?))),
        })
        .collect()
    }

    fn lookup(&self, id: spv::Id) -> Option<Value> {
        self.env.value(id).or_else(|| {
            self.frames
                .iter()
                .rev()
                .find_map(|frame| frame.bindings.get(&id).copied())
        })
    }

    fn use_id(&mut self, id: spv::Id) -> Result<Value> {
        if let Some(value) = self.lookup(id) {
            return Ok(value);
        }
        match self.plan {
            None => {
                let ty = self.env.id_type(id)?;
                let path = self.scope_path();
                trace!(%id, ?path, "use of ID not (yet) visible");
                self.record.record_unresolved_use(id, path);
                Ok(Value::Const(self.cx.undef(ty)))
            }
            Some(_) => Err(Error::UnresolvableHoist { id }),
        }
    }

    fn bind(&mut self, id: spv::Id, value: Value) {
        if self.plan.is_none() {
            let path = self.scope_path();
            self.record.record_def(id, path);
        }
        self.frames.last_mut().unwrap().bindings.insert(id, value);
    }

    fn scope_path(&self) -> ScopePath {
        self.frames.iter().filter_map(|frame| frame.scope).collect()
    }

    fn new_control(&mut self) -> ControlId {
        let control = ControlId(self.next_control);
        self.next_control += 1;
        control
    }

    // HACK(eddyb) structured nodes are defined before their child blocks (which
    // need to refer to them), and replaced by `close_node`.
    fn placeholder_node(&mut self) -> Node {
        self.nodes.define(
            self.cx,
            NodeDef {
                kind: NodeKind::Inst {
                    op: InstOp::Let,
                    inputs: SmallVec::new(),
                },
                outputs: SmallVec::new(),
            },
        )
    }

    /// Finish a structured node, append it to the current region, and bind
    /// the IDs hoisted out of it to its results. Returns the checks for any
    /// exits deferred until after the node.
    fn close_node(
        &mut self,
        node: Node,
        control: ControlId,
        kind: NodeKind,
    ) -> Result<SmallVec<[SeqItem; 4]>> {
        let results: SmallVec<[spv::Id; 4]> = match self.plan {
            Some(plan) => plan.results(control).collect(),
            None => SmallVec::new(),
        };
        let outputs = results
            .iter()
            .map(|&id| {
                Ok(NodeOutputDecl {
                    ty: self.env.id_type(id)?,
                })
            })
            .collect::<Result<_>>()?;
        self.nodes[node] = NodeDef { kind, outputs };

        let frame = self.frames.last_mut().unwrap();
        frame.nodes.push(node);
        for (output_idx, id) in results.into_iter().enumerate() {
            frame.bindings.insert(
                id,
                Value::NodeOutput {
                    node,
                    output_idx: output_idx as u32,
                },
            );
        }

        Ok(self
            .deferred
            .remove(&node)
            .into_iter()
            .flatten()
            .map(|(flag, kind)| SeqItem::FlagCheck { flag, kind })
            .collect())
    }

    /// Flag (declared right before the node of `frames[blocking]`) recording
    /// that `kind` is to be taken after that node.
    fn defer_flag(&mut self, blocking: usize, kind: EdgeKind) -> Value {
        let node = self.frames[blocking].kind.node().unwrap();
        let existing = self
            .deferred
            .get(&node)
            .and_then(|deferred| deferred.iter().find(|&&(_, k)| k == kind));
        if let Some(&(flag, _)) = existing {
            return flag;
        }

        let var = self.define_var(false);
        self.frames[blocking - 1].nodes.push(var);
        let flag = Value::NodeOutput {
            node: var,
            output_idx: 0,
        };
        self.deferred.entry(node).or_default().push((flag, kind));
        flag
    }

    fn break_flag(&mut self, frame_idx: usize) -> Value {
        if let Some(flag) = self.frames[frame_idx].break_flag {
            return flag;
        }
        let var = self.define_var(false);
        let frame = &mut self.frames[frame_idx];
        frame.nodes.insert(0, var);
        let flag = Value::NodeOutput {
            node: var,
            output_idx: 0,
        };
        frame.break_flag = Some(flag);
        flag
    }

    fn record_continuing_exit(&mut self, frame_idx: usize) {
        if let Some(control) = self.control_of(frame_idx) {
            self.record.loops_exiting_from_continuing.insert(control);
        }
    }

    fn bool_type(&self) -> Type {
        self.cx.intern(TypeDef::Bool)
    }

    fn define_inst(&mut self, op: InstOp, inputs: SmallVec<[Value; 2]>, output: Option<Type>) -> Node {
        self.nodes.define(
            self.cx,
            NodeDef {
                kind: NodeKind::Inst { op, inputs },
                outputs: output.map(|ty| NodeOutputDecl { ty }).into_iter().collect(),
            },
        )
    }

    fn push_inst(&mut self, op: InstOp, inputs: SmallVec<[Value; 2]>, output: Option<Type>) -> Node {
        let node = self.define_inst(op, inputs, output);
        self.frames.last_mut().unwrap().nodes.push(node);
        node
    }

    fn push_value(&mut self, op: InstOp, inputs: SmallVec<[Value; 2]>, ty: Type) -> Value {
        Value::NodeOutput {
            node: self.push_inst(op, inputs, Some(ty)),
            output_idx: 0,
        }
    }

    fn push_binary_bool(&mut self, op: BinaryOp, a: Value, b: Value) -> Value {
        self.push_value(InstOp::Binary(op), smallvec![a, b], self.bool_type())
    }

    /// Function-local `bool` variable, with initializer `init`.
    fn define_var(&mut self, init: bool) -> Node {
        let ptr_type = self.cx.intern(TypeDef::Ptr {
            storage_class: spec::StorageClass::Function,
            pointee: self.bool_type(),
        });
        let init = Value::Const(self.cx.bool_const(init));
        self.define_inst(InstOp::Var, smallvec![init], Some(ptr_type))
    }

    fn push_var(&mut self, init: bool) -> Value {
        let node = self.define_var(init);
        self.frames.last_mut().unwrap().nodes.push(node);
        Value::NodeOutput {
            node,
            output_idx: 0,
        }
    }

    fn push_load_bool(&mut self, ptr: Value) -> Value {
        self.push_value(InstOp::Load, smallvec![ptr], self.bool_type())
    }

    fn push_store_bool(&mut self, ptr: Value, value: bool) {
        let value = Value::Const(self.cx.bool_const(value));
        self.push_inst(InstOp::Store, smallvec![ptr, value], None);
    }
}
