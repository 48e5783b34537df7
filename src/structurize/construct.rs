//! Construct Classifier: structured constructs (`if`/`switch`/`loop`) as
//! nested intervals of [`ControlFlowGraph::structured_order`].

use crate::cfg::{BlockIdx, ControlFlowGraph, DominatorTree, Merge, Terminator};
use crate::spv::spec;
use crate::{Error, Result};
use smallvec::SmallVec;
use std::ops::Index;

/// Index of a [`Construct`] in its [`Constructs`] (headers in structured order).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstructIdx(u32);

impl ConstructIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstructKind {
    If {
        true_target: BlockIdx,
        false_target: BlockIdx,
        control: spec::SelectionControl,

        /// Blocks joining both arms before the merge block (see [`Constructs::build`]),
        /// sorted by structured position.
        premerges: SmallVec<[BlockIdx; 2]>,
    },
    Switch {
        control: spec::SelectionControl,

        /// All distinct targets (default first, then cases in operand order).
        case_targets: SmallVec<[BlockIdx; 4]>,
    },
    Loop {
        continue_target: BlockIdx,
        control: spec::LoopControl,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Construct {
    pub kind: ConstructKind,

    pub header: BlockIdx,
    pub merge: BlockIdx,

    pub parent: Option<ConstructIdx>,

    /// Structured positions covered by this construct, `begin..end` (i.e.
    /// from its header, up to but excluding its merge block).
    pub begin: u32,
    pub end: u32,

    /// Loops only: first position of the continuing part (`end` if the loop
    /// is its own continue target, or for `if`/`switch`).
    pub continuing_begin: u32,
}

impl Construct {
    pub fn contains_pos(&self, pos: u32) -> bool {
        (self.begin..self.end).contains(&pos)
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, ConstructKind::Loop { .. })
    }
}

/// Side tables describing the structured constructs of one function.
///
/// Nothing here refers back into [`ControlFlowGraph`] other than by [`BlockIdx`],
/// so building it twice over the same graph always produces the same result.
#[derive(Debug, PartialEq, Eq)]
pub struct Constructs {
    constructs: Vec<Construct>,

    /// Reachable blocks (plus reachable constructs' merge/continue targets),
    /// in structured order.
    pub order: Vec<BlockIdx>,
    position: Vec<Option<u32>>,

    /// Constructs containing each block, outermost first (a header is in its
    /// own construct).
    owners: Vec<SmallVec<[ConstructIdx; 4]>>,

    header_construct: Vec<Option<ConstructIdx>>,
}

impl Index<ConstructIdx> for Constructs {
    type Output = Construct;

    fn index(&self, idx: ConstructIdx) -> &Construct {
        &self.constructs[idx.index()]
    }
}

impl Constructs {
    pub fn build(cfg: &ControlFlowGraph, dom: &DominatorTree) -> Result<Self> {
        let order = cfg.structured_order();
        let mut position = vec![None; cfg.len()];
        for (pos, &block) in order.iter().enumerate() {
            position[block.index()] = Some(pos as u32);
        }

        let mut constructs: Vec<Construct> = vec![];
        let mut owners = vec![SmallVec::new(); cfg.len()];
        let mut header_construct = vec![None; cfg.len()];

        let mut stack: SmallVec<[ConstructIdx; 4]> = SmallVec::new();
        for (pos, &b) in order.iter().enumerate() {
            let pos = pos as u32;
            while let Some(&top) = stack.last() {
                if constructs[top.index()].end > pos {
                    break;
                }
                stack.pop();
            }

            let block = &cfg.blocks[b.index()];
            let label = block.label;
            let malformed = |reason: String| Error::MalformedMerge {
                block: label,
                reason,
            };

            let Some(merge_annotation) = block.merge else {
                owners[b.index()] = stack.clone();
                continue;
            };
            let header = b;

            let merge = merge_annotation.merge_block();
            let merge_label = cfg.blocks[merge.index()].label;
            let end = position[merge.index()].ok_or_else(|| {
                malformed(format!("merge block %{merge_label} is not in structured order"))
            })?;
            if end <= pos {
                return Err(malformed(format!(
                    "merge block %{merge_label} does not follow its header"
                )));
            }
            if dom.is_reachable(merge) && !dom.dominates(header, merge) {
                return Err(malformed(format!(
                    "header does not dominate its merge block %{merge_label}"
                )));
            }

            let parent = stack.last().copied();
            if let Some(parent) = parent {
                let parent = &constructs[parent.index()];
                let parent_label = cfg.blocks[parent.header.index()].label;
                if end > parent.end {
                    return Err(malformed(format!(
                        "construct is not nested in its parent construct (headed by %{parent_label})"
                    )));
                }
                if pos < parent.continuing_begin && end > parent.continuing_begin {
                    return Err(malformed(format!(
                        "construct straddles the continue target of the loop headed by %{parent_label}"
                    )));
                }
            }

            let (kind, continuing_begin) = match (merge_annotation, &block.terminator) {
                (
                    Merge::Selection { control, .. },
                    &Terminator::BranchConditional {
                        true_target,
                        false_target,
                        ..
                    },
                ) => {
                    let premerges = Self::joins_below(&order, &position, dom, header, end)
                        .filter(|&b| b != true_target && b != false_target)
                        .collect();
                    (
                        ConstructKind::If {
                            true_target,
                            false_target,
                            control,
                            premerges,
                        },
                        end,
                    )
                }
                (Merge::Selection { control, .. }, Terminator::Switch { .. }) => {
                    let mut case_targets: SmallVec<[BlockIdx; 4]> = SmallVec::new();
                    for target in block.terminator.targets() {
                        if !case_targets.contains(&target) {
                            case_targets.push(target);
                        }
                    }
                    if let Some(join) = Self::joins_below(&order, &position, dom, header, end)
                        .find(|b| !case_targets.contains(b))
                    {
                        return Err(Error::UnstructuredBranch {
                            from: label,
                            to: cfg.blocks[join.index()].label,
                            reason: "switch cases join before reaching the merge block",
                        });
                    }
                    (
                        ConstructKind::Switch {
                            control,
                            case_targets,
                        },
                        end,
                    )
                }
                (
                    Merge::Loop {
                        continue_target,
                        control,
                        ..
                    },
                    _,
                ) => {
                    let continue_label = cfg.blocks[continue_target.index()].label;
                    if continue_target == merge {
                        return Err(malformed(
                            "continue target and merge block must differ".into(),
                        ));
                    }
                    let continuing_begin = if continue_target == header {
                        end
                    } else {
                        let continue_pos = position[continue_target.index()]
                            .filter(|&p| pos < p && p < end)
                            .ok_or_else(|| {
                                malformed(format!(
                                    "continue target %{continue_label} is outside of the loop"
                                ))
                            })?;
                        if dom.is_reachable(continue_target)
                            && !dom.dominates(header, continue_target)
                        {
                            return Err(malformed(format!(
                                "header does not dominate its continue target %{continue_label}"
                            )));
                        }
                        continue_pos
                    };
                    (
                        ConstructKind::Loop {
                            continue_target,
                            control,
                        },
                        continuing_begin,
                    )
                }
                // NOTE(eddyb) `ControlFlowGraph::from_func_insts` only accepts
                // `OpSelectionMerge` before `OpBranchConditional`/`OpSwitch`.
                (Merge::Selection { .. }, _) => {
                    return Err(malformed("OpSelectionMerge on a non-selection".into()));
                }
            };

            let idx = ConstructIdx(constructs.len() as u32);
            constructs.push(Construct {
                kind,
                header,
                merge,
                parent,
                begin: pos,
                end,
                continuing_begin,
            });
            header_construct[header.index()] = Some(idx);
            stack.push(idx);
            owners[header.index()] = stack.clone();
        }

        Ok(Self {
            constructs,
            order,
            position,
            owners,
            header_construct,
        })
    }

    /// Reachable blocks strictly inside `header..end`, immediately dominated by
    /// `header` (i.e. joins of multiple paths out of the header itself).
    fn joins_below<'a>(
        order: &'a [BlockIdx],
        position: &'a [Option<u32>],
        dom: &'a DominatorTree,
        header: BlockIdx,
        end: u32,
    ) -> impl Iterator<Item = BlockIdx> + 'a {
        let begin = position[header.index()].map_or(0, |p| p as usize + 1);
        order[begin..end as usize]
            .iter()
            .copied()
            .filter(move |&b| dom.is_reachable(b) && dom.idom(b) == Some(header))
    }

    pub fn len(&self) -> usize {
        self.constructs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstructIdx, &Construct)> {
        self.constructs
            .iter()
            .enumerate()
            .map(|(i, c)| (ConstructIdx(i as u32), c))
    }

    pub fn position(&self, block: BlockIdx) -> Option<u32> {
        self.position[block.index()]
    }

    pub fn owners(&self, block: BlockIdx) -> &[ConstructIdx] {
        &self.owners[block.index()]
    }

    pub fn headed_by(&self, block: BlockIdx) -> Option<ConstructIdx> {
        self.header_construct[block.index()]
    }

    pub fn premerges(&self, c: ConstructIdx) -> &[BlockIdx] {
        match &self[c].kind {
            ConstructKind::If { premerges, .. } => premerges,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spv::read::ModuleParser;
    use crate::Context;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU32;

    fn build(text: &str) -> Result<(ControlFlowGraph, Constructs)> {
        let cx = Context::new();
        let insts = ModuleParser::read_from_spvasm_str(&cx, text)?.collect::<Result<Vec<_>>>()?;
        let cfg = ControlFlowGraph::from_func_insts(&cx, insts)?;
        let dom = DominatorTree::compute(&cfg);
        let constructs = Constructs::build(&cfg, &dom)?;
        Ok((cfg, constructs))
    }

    fn block(cfg: &ControlFlowGraph, label: u32) -> BlockIdx {
        cfg.block_by_label(NonZeroU32::new(label).unwrap()).unwrap()
    }

    const IF_IN_LOOP: &str = "
        %10 = OpLabel
              OpBranch %20
        %20 = OpLabel
              OpLoopMerge %99 %50 None
              OpBranch %30
        %30 = OpLabel
              OpSelectionMerge %40 None
              OpBranchConditional %1 %35 %40
        %35 = OpLabel
              OpBranch %40
        %40 = OpLabel
              OpBranch %50
        %50 = OpLabel
              OpBranchConditional %1 %20 %99
        %99 = OpLabel
              OpReturn
    ";

    #[test]
    fn nesting_and_owners() {
        let (cfg, constructs) = build(IF_IN_LOOP).unwrap();
        assert_eq!(constructs.len(), 2);

        let l = constructs.headed_by(block(&cfg, 20)).unwrap();
        let c = constructs.headed_by(block(&cfg, 30)).unwrap();
        assert_eq!(constructs[c].parent, Some(l));
        assert_eq!(constructs[l].merge, block(&cfg, 99));
        assert_eq!(
            constructs[l].continuing_begin,
            constructs.position(block(&cfg, 50)).unwrap()
        );

        assert_eq!(constructs.owners(block(&cfg, 10)), &[]);
        assert_eq!(constructs.owners(block(&cfg, 35)), &[l, c]);
        assert_eq!(constructs.owners(block(&cfg, 40)), &[l]);
        assert_eq!(constructs.owners(block(&cfg, 99)), &[]);
    }

    #[test]
    fn classification_is_idempotent() {
        let (cfg, first) = build(IF_IN_LOOP).unwrap();
        let second = Constructs::build(&cfg, &DominatorTree::compute(&cfg)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn premerge_blocks() {
        let (cfg, constructs) = build(
            "
            %10 = OpLabel
                  OpSelectionMerge %99 None
                  OpBranchConditional %1 %20 %30
            %20 = OpLabel
                  OpBranchConditional %1 %99 %40
            %30 = OpLabel
                  OpBranchConditional %1 %99 %40
            %40 = OpLabel
                  OpBranch %99
            %99 = OpLabel
                  OpReturn
            ",
        )
        .unwrap();
        let c = constructs.headed_by(block(&cfg, 10)).unwrap();
        assert_eq!(constructs.premerges(c), &[block(&cfg, 40)]);
    }

    #[test]
    fn merge_block_may_be_a_loop_header() {
        let (cfg, constructs) = build(
            "
            %10 = OpLabel
                  OpSelectionMerge %20 None
                  OpBranchConditional %1 %15 %20
            %15 = OpLabel
                  OpBranch %20
            %20 = OpLabel
                  OpLoopMerge %99 %20 None
                  OpBranchConditional %1 %20 %99
            %99 = OpLabel
                  OpReturn
            ",
        )
        .unwrap();
        let c = constructs.headed_by(block(&cfg, 10)).unwrap();
        let l = constructs.headed_by(block(&cfg, 20)).unwrap();
        assert_eq!(constructs[c].merge, block(&cfg, 20));
        assert_eq!(constructs[l].parent, None);
        assert_eq!(constructs[l].continuing_begin, constructs[l].end);
    }

    #[test]
    fn malformed_constructs() {
        // Continue target outside of the loop.
        let err = build(
            "
            %10 = OpLabel
                  OpBranch %20
            %20 = OpLabel
                  OpLoopMerge %30 %10 None
                  OpBranch %30
            %30 = OpLabel
                  OpReturn
            ",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedMerge { .. }), "{err}");

        // Merge block not dominated by its header.
        let err = build(
            "
            %10 = OpLabel
                  OpBranchConditional %1 %20 %30
            %20 = OpLabel
                  OpSelectionMerge %30 None
                  OpBranchConditional %1 %25 %30
            %25 = OpLabel
                  OpBranch %30
            %30 = OpLabel
                  OpReturn
            ",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedMerge { .. }), "{err}");

        // Two switch cases joining before the merge block.
        let err = build(
            "
            %10 = OpLabel
                  OpSelectionMerge %99 None
                  OpSwitch %1 %20 1 %30
            %20 = OpLabel
                  OpBranch %40
            %30 = OpLabel
                  OpBranch %40
            %40 = OpLabel
                  OpBranch %99
            %99 = OpLabel
                  OpReturn
            ",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnstructuredBranch { .. }), "{err}");
    }
}
