//! Control-flow graph (CFG) of SPIR-V basic blocks, and analyses over it
//! (traversal orders and dominators).

use crate::spv::{self, spec};
use crate::{Context, Error, Result};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

/// Index of a [`BasicBlock`] in its [`ControlFlowGraph`].
///
/// Blocks keep their original order (that of their `OpLabel`s), so the entry
/// block is always [`BlockIdx::ENTRY`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIdx(u32);

impl BlockIdx {
    pub const ENTRY: Self = Self(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for BlockIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

#[derive(Debug)]
pub struct BasicBlock {
    /// Result ID of the `OpLabel` starting this block.
    pub label: spv::Id,

    /// All instructions other than the merge instruction and the terminator.
    pub insts: Vec<spv::InstWithIds>,

    pub merge: Option<Merge>,
    pub terminator: Terminator,
}

/// Merge instruction (`OpSelectionMerge`/`OpLoopMerge`), marking its block
/// as the header of a structured construct.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Merge {
    Selection {
        merge: BlockIdx,
        control: spec::SelectionControl,
    },
    Loop {
        merge: BlockIdx,
        continue_target: BlockIdx,
        control: spec::LoopControl,
    },
}

impl Merge {
    pub fn merge_block(&self) -> BlockIdx {
        match *self {
            Merge::Selection { merge, .. } | Merge::Loop { merge, .. } => merge,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Branch {
        target: BlockIdx,
    },
    BranchConditional {
        cond: spv::Id,
        true_target: BlockIdx,
        false_target: BlockIdx,
    },
    Switch {
        selector: spv::Id,
        default: BlockIdx,
        cases: SmallVec<[(spv::Literal, BlockIdx); 4]>,
    },
    Return {
        value: Option<spv::Id>,
    },
    Unreachable,

    /// `OpKill`/`OpTerminateInvocation`.
    Kill,
}

impl Terminator {
    /// All targets, in operand order (duplicates included).
    pub fn targets(&self) -> SmallVec<[BlockIdx; 4]> {
        match self {
            Terminator::Branch { target } => [*target].into_iter().collect(),
            Terminator::BranchConditional {
                true_target,
                false_target,
                ..
            } => [*true_target, *false_target].into_iter().collect(),
            Terminator::Switch { default, cases, .. } => [*default]
                .into_iter()
                .chain(cases.iter().map(|&(_, target)| target))
                .collect(),
            Terminator::Return { .. } | Terminator::Unreachable | Terminator::Kill => {
                SmallVec::new()
            }
        }
    }
}

/// The CFG of one function: its [`BasicBlock`]s plus predecessor lists.
///
/// The graph is immutable once built, all later analyses only keep side
/// tables indexed by [`BlockIdx`].
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,

    block_by_label: FxHashMap<spv::Id, BlockIdx>,
    preds: Vec<SmallVec<[BlockIdx; 4]>>,
}

/// A block, as first partitioned out of the instruction stream.
struct RawBlock {
    label: spv::Id,
    insts: Vec<spv::InstWithIds>,
    merge: Option<spv::InstWithIds>,
    terminator: Option<spv::InstWithIds>,
}

fn malformed_function(block: Option<spv::Id>, reason: String) -> Error {
    Error::MalformedFunction { block, reason }
}

fn id_operand(block: spv::Id, inst: &spv::InstWithIds, idx: usize) -> Result<spv::Id> {
    match inst.operands.get(idx) {
        Some(&spv::Operand::Id(id)) => Ok(id),
        _ => Err(malformed_function(
            Some(block),
            format!("{} expects an ID as operand #{idx}", inst.opcode),
        )),
    }
}

impl ControlFlowGraph {
    /// Build the CFG from the instructions of one function body (everything
    /// between its `OpFunctionParameter`s and its `OpFunctionEnd`).
    pub fn from_func_insts(
        cx: &Context,
        insts: impl IntoIterator<Item = spv::InstWithIds>,
    ) -> Result<Self> {
        let raw_blocks = Self::partition(insts)?;

        let mut block_by_label = FxHashMap::default();
        for (i, raw_block) in raw_blocks.iter().enumerate() {
            let idx = BlockIdx(i.try_into().map_err(|_| {
                malformed_function(None, "more than 2^32 blocks in one function".into())
            })?);
            if block_by_label.insert(raw_block.label, idx).is_some() {
                return Err(malformed_function(
                    Some(raw_block.label),
                    "label defines multiple blocks".into(),
                ));
            }
        }

        let mut blocks = Vec::with_capacity(raw_blocks.len());
        for raw_block in raw_blocks {
            let label = raw_block.label;
            let target = |id: spv::Id| {
                block_by_label.get(&id).copied().ok_or_else(|| {
                    malformed_function(
                        Some(label),
                        format!("branch to %{id}, which is not a block"),
                    )
                })
            };

            // NOTE(eddyb) `partition` guarantees every block has a terminator.
            let terminator_inst = match raw_block.terminator {
                Some(inst) => inst,
                None => unreachable!("cfg::ControlFlowGraph::from_func_insts: missing terminator"),
            };
            let terminator = match terminator_inst.opcode {
                spec::Opcode::OpBranch => Terminator::Branch {
                    target: target(id_operand(label, &terminator_inst, 0)?)?,
                },
                spec::Opcode::OpBranchConditional => Terminator::BranchConditional {
                    cond: id_operand(label, &terminator_inst, 0)?,
                    true_target: target(id_operand(label, &terminator_inst, 1)?)?,
                    false_target: target(id_operand(label, &terminator_inst, 2)?)?,
                },
                spec::Opcode::OpSwitch => {
                    let selector = id_operand(label, &terminator_inst, 0)?;
                    let default = target(id_operand(label, &terminator_inst, 1)?)?;
                    let pairs = &terminator_inst.operands[2..];
                    if pairs.len() % 2 != 0 {
                        return Err(malformed_function(
                            Some(label),
                            "OpSwitch has an unpaired case literal".into(),
                        ));
                    }
                    let cases = pairs
                        .chunks(2)
                        .map(|pair| match *pair {
                            [spv::Operand::Literal(literal), spv::Operand::Id(id)] => {
                                Ok((literal, target(id)?))
                            }
                            _ => Err(malformed_function(
                                Some(label),
                                "OpSwitch expects `literal %target` pairs".into(),
                            )),
                        })
                        .collect::<Result<_>>()?;
                    Terminator::Switch {
                        selector,
                        default,
                        cases,
                    }
                }
                spec::Opcode::OpReturn => Terminator::Return { value: None },
                spec::Opcode::OpReturnValue => Terminator::Return {
                    value: Some(id_operand(label, &terminator_inst, 0)?),
                },
                spec::Opcode::OpUnreachable => Terminator::Unreachable,
                spec::Opcode::OpKill | spec::Opcode::OpTerminateInvocation => Terminator::Kill,
                opcode => unreachable!("cfg::ControlFlowGraph::from_func_insts: {opcode} is not a terminator"),
            };

            let merge = raw_block
                .merge
                .map(|merge_inst| {
                    let malformed_merge = |reason: String| Error::MalformedMerge {
                        block: label,
                        reason,
                    };
                    let merge_target = |idx| {
                        let id = id_operand(label, &merge_inst, idx)?;
                        block_by_label.get(&id).copied().ok_or_else(|| {
                            malformed_merge(format!("target %{id} is not a block"))
                        })
                    };
                    let control_name = |idx| match merge_inst.operands.get(idx) {
                        Some(&spv::Operand::Enumerant(name)) => Ok(&cx[name]),
                        _ => Err(malformed_merge(format!(
                            "{} expects a control mask as operand #{idx}",
                            merge_inst.opcode
                        ))),
                    };
                    match merge_inst.opcode {
                        spec::Opcode::OpSelectionMerge => {
                            if !matches!(
                                terminator,
                                Terminator::BranchConditional { .. } | Terminator::Switch { .. }
                            ) {
                                return Err(malformed_merge(
                                    "OpSelectionMerge must precede \
                                     OpBranchConditional or OpSwitch"
                                        .into(),
                                ));
                            }
                            let name = control_name(1)?;
                            Ok(Merge::Selection {
                                merge: merge_target(0)?,
                                control: spec::SelectionControl::from_name(name).ok_or_else(
                                    || malformed_merge(format!("unknown selection control `{name}`")),
                                )?,
                            })
                        }
                        spec::Opcode::OpLoopMerge => {
                            if !matches!(
                                terminator,
                                Terminator::Branch { .. } | Terminator::BranchConditional { .. }
                            ) {
                                return Err(malformed_merge(
                                    "OpLoopMerge must precede OpBranch or OpBranchConditional"
                                        .into(),
                                ));
                            }
                            let name = control_name(2)?;
                            Ok(Merge::Loop {
                                merge: merge_target(0)?,
                                continue_target: merge_target(1)?,
                                control: spec::LoopControl::from_mask(name).ok_or_else(|| {
                                    malformed_merge(format!("unknown loop control `{name}`"))
                                })?,
                            })
                        }
                        opcode => unreachable!("cfg::ControlFlowGraph::from_func_insts: {opcode} is not a merge"),
                    }
                })
                .transpose()?;

            blocks.push(BasicBlock {
                label,
                insts: raw_block.insts,
                merge,
                terminator,
            });
        }

        let mut preds: Vec<SmallVec<[BlockIdx; 4]>> = vec![SmallVec::new(); blocks.len()];
        for (i, block) in blocks.iter().enumerate() {
            for target in block.terminator.targets() {
                let pred = BlockIdx(i as u32);
                let target_preds = &mut preds[target.index()];
                if !target_preds.contains(&pred) {
                    target_preds.push(pred);
                }
            }
        }

        Ok(Self {
            blocks,
            block_by_label,
            preds,
        })
    }

    /// Split the instruction stream at `OpLabel`s, checking that every block
    /// ends in exactly one terminator, optionally preceded by a merge.
    fn partition(insts: impl IntoIterator<Item = spv::InstWithIds>) -> Result<Vec<RawBlock>> {
        let mut raw_blocks = vec![];
        let mut current: Option<RawBlock> = None;

        let finish = |block: RawBlock, raw_blocks: &mut Vec<RawBlock>| {
            if block.terminator.is_none() {
                return Err(malformed_function(Some(block.label), "no terminator".into()));
            }
            raw_blocks.push(block);
            Ok(())
        };

        for inst in insts {
            let opcode = inst.opcode;
            if opcode.is_debuginfo() {
                continue;
            }

            if opcode == spec::Opcode::OpLabel {
                if let Some(block) = current.take() {
                    finish(block, &mut raw_blocks)?;
                }
                let label = inst.result_id.ok_or_else(|| {
                    malformed_function(None, "OpLabel without a result ID".into())
                })?;
                current = Some(RawBlock {
                    label,
                    insts: vec![],
                    merge: None,
                    terminator: None,
                });
                continue;
            }

            let block = current.as_mut().ok_or_else(|| {
                malformed_function(None, format!("{opcode} outside of any block"))
            })?;
            if block.terminator.is_some() {
                return Err(malformed_function(
                    Some(block.label),
                    format!("{opcode} follows the terminator"),
                ));
            }

            if opcode.is_merge() {
                if block.merge.is_some() {
                    return Err(Error::MalformedMerge {
                        block: block.label,
                        reason: "multiple merge instructions".into(),
                    });
                }
                block.merge = Some(inst);
            } else if opcode.is_terminator() {
                block.terminator = Some(inst);
            } else {
                if block.merge.is_some() {
                    return Err(Error::MalformedMerge {
                        block: block.label,
                        reason: format!(
                            "merge instruction must immediately precede the terminator \
                             (found {opcode} in between)"
                        ),
                    });
                }
                block.insts.push(inst);
            }
        }
        if let Some(block) = current {
            finish(block, &mut raw_blocks)?;
        }

        Ok(raw_blocks)
    }

    pub fn entry(&self) -> BlockIdx {
        BlockIdx::ENTRY
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_indices(&self) -> impl Iterator<Item = BlockIdx> {
        (0..self.blocks.len() as u32).map(BlockIdx)
    }

    pub fn block_by_label(&self, label: spv::Id) -> Option<BlockIdx> {
        self.block_by_label.get(&label).copied()
    }

    pub fn predecessors(&self, block: BlockIdx) -> &[BlockIdx] {
        &self.preds[block.index()]
    }

    /// Blocks reachable from the entry (through terminators only), in
    /// reverse post-order (RPO).
    ///
    /// RPO iteration over a CFG provides certain guarantees, most importantly
    /// that SSA definitions are visited before any of their uses (and every
    /// block after its immediate dominator).
    pub fn rev_post_order(&self) -> Vec<BlockIdx> {
        let mut post_order = Vec::with_capacity(self.blocks.len());
        self.traverse(
            self.entry(),
            &mut vec![false; self.blocks.len()],
            &|block| self.blocks[block.index()].terminator.targets(),
            &mut |block| post_order.push(block),
        );
        post_order.reverse();
        post_order
    }

    /// Like [`rev_post_order`](Self::rev_post_order), but a header's merge
    /// block (and a loop's continue target) are visited before its other
    /// successors, so they end up *after* everything nested in the construct.
    ///
    /// In this order, every construct covers a contiguous range of positions
    /// (starting at its header, ending just before its merge block), and
    /// merge/continue targets are included even when no branch reaches them.
    pub fn structured_order(&self) -> Vec<BlockIdx> {
        let mut post_order = Vec::with_capacity(self.blocks.len());
        self.traverse(
            self.entry(),
            &mut vec![false; self.blocks.len()],
            &|block| {
                let block = &self.blocks[block.index()];
                let mut successors: SmallVec<[BlockIdx; 4]> = SmallVec::new();
                match block.merge {
                    Some(Merge::Selection { merge, .. }) => successors.push(merge),
                    Some(Merge::Loop {
                        merge,
                        continue_target,
                        ..
                    }) => successors.extend([merge, continue_target]),
                    None => {}
                }
                // NOTE(eddyb) reversed so that e.g. the `true` target of an
                // `OpBranchConditional` is finished last, i.e. comes first in RPO.
                successors.extend(block.terminator.targets().into_iter().rev());
                successors
            },
            &mut |block| post_order.push(block),
        );
        post_order.reverse();
        post_order
    }

    fn traverse(
        &self,
        block: BlockIdx,
        visited: &mut [bool],
        successors: &impl Fn(BlockIdx) -> SmallVec<[BlockIdx; 4]>,
        post_order_visit: &mut impl FnMut(BlockIdx),
    ) {
        if visited[block.index()] {
            return;
        }
        visited[block.index()] = true;

        for target in successors(block) {
            self.traverse(target, visited, successors, post_order_visit);
        }

        post_order_visit(block);
    }
}

/// Dominator tree of the blocks reachable from the entry, computed with the
/// Cooper-Harvey-Kennedy iterative algorithm (over reverse post-order).
pub struct DominatorTree {
    /// Immediate dominator of each block (`None` for the entry, and for
    /// unreachable blocks).
    idom: Vec<Option<BlockIdx>>,

    /// Position of each reachable block in the reverse post-order.
    rpo_index: Vec<Option<u32>>,
}

impl DominatorTree {
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let rpo = cfg.rev_post_order();

        let mut rpo_index = vec![None; cfg.len()];
        for (i, &block) in rpo.iter().enumerate() {
            rpo_index[block.index()] = Some(i as u32);
        }

        // NOTE(eddyb) during the fixpoint, the entry is its own `idom`.
        let mut idom: Vec<Option<BlockIdx>> = vec![None; cfg.len()];
        if let Some(&entry) = rpo.first() {
            idom[entry.index()] = Some(entry);
        }

        let intersect = |idom: &[Option<BlockIdx>], mut a: BlockIdx, mut b: BlockIdx| {
            let pos = |block: BlockIdx| rpo_index[block.index()];
            while a != b {
                while pos(a) > pos(b) {
                    a = idom[a.index()].unwrap_or(a);
                }
                while pos(b) > pos(a) {
                    b = idom[b.index()].unwrap_or(b);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom = None;
                for &pred in cfg.predecessors(block) {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        if let Some(&entry) = rpo.first() {
            idom[entry.index()] = None;
        }

        Self { idom, rpo_index }
    }

    pub fn is_reachable(&self, block: BlockIdx) -> bool {
        self.rpo_index[block.index()].is_some()
    }

    pub fn idom(&self, block: BlockIdx) -> Option<BlockIdx> {
        self.idom[block.index()]
    }

    /// Whether `a` dominates `b` (reflexively, i.e. `dominates(x, x)` holds).
    ///
    /// Always `false` if either block is unreachable.
    pub fn dominates(&self, a: BlockIdx, b: BlockIdx) -> bool {
        let (Some(a_pos), Some(_)) = (self.rpo_index[a.index()], self.rpo_index[b.index()]) else {
            return false;
        };
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                // Dominators always precede in RPO, no need to look further up.
                Some(parent) if self.rpo_index[parent.index()] >= Some(a_pos) => current = parent,
                _ => return false,
            }
        }
    }
}
