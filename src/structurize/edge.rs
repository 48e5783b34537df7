//! Edge Classifier: the structured meaning of every CFG edge.

use super::construct::{ConstructIdx, ConstructKind, Constructs};
use crate::cfg::{BlockIdx, ControlFlowGraph};
use crate::{Error, Result};

/// Classification of a CFG edge relative to the constructs containing its source.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Into a later position of the innermost region containing the source,
    /// i.e. expressed by just continuing the current sequence.
    Forward,

    IfBreak(ConstructIdx),

    /// Into the premerge block (by index) of an `if` construct.
    IfPremerge(ConstructIdx, u32),

    SwitchBreak(ConstructIdx),
    LoopBreak(ConstructIdx),

    /// From a loop body to the loop's continue target (also, to the header of
    /// a loop that is its own continue target).
    LoopContinue(ConstructIdx),

    /// From the continuing part of a loop back to its header.
    BackEdge(ConstructIdx),
}

impl EdgeKind {
    /// The block an edge of this kind leads to (`None` for `Forward`, which
    /// could lead anywhere).
    pub fn target(self, constructs: &Constructs) -> Option<BlockIdx> {
        Some(match self {
            EdgeKind::Forward => return None,
            EdgeKind::IfBreak(c) | EdgeKind::SwitchBreak(c) | EdgeKind::LoopBreak(c) => {
                constructs[c].merge
            }
            EdgeKind::IfPremerge(c, idx) => constructs.premerges(c)[idx as usize],
            EdgeKind::LoopContinue(c) => match constructs[c].kind {
                ConstructKind::Loop {
                    continue_target, ..
                } => continue_target,
                _ => return None,
            },
            EdgeKind::BackEdge(c) => constructs[c].header,
        })
    }
}

impl Constructs {
    /// Classify the edge `from -> to`, which must be an edge of `cfg`.
    ///
    /// Edges from a selection header into its own arms are `Forward`, any other
    /// edge entering an `if` arm or a `switch` case from the side is an error.
    pub fn classify_edge(
        &self,
        cfg: &ControlFlowGraph,
        from: BlockIdx,
        to: BlockIdx,
    ) -> Result<EdgeKind> {
        let unstructured = |reason| Error::UnstructuredBranch {
            from: cfg.blocks[from.index()].label,
            to: cfg.blocks[to.index()].label,
            reason,
        };

        let from_pos = self
            .position(from)
            .ok_or_else(|| unstructured("branch from a block outside of the structured order"))?;
        let to_pos = self.position(to);
        let is_later = to_pos.map_or(false, |to_pos| to_pos > from_pos);

        let chain = self.owners(from);
        for (depth, &c) in chain.iter().rev().enumerate() {
            let construct = &self[c];
            if to == construct.merge {
                return Ok(match construct.kind {
                    ConstructKind::If { .. } => EdgeKind::IfBreak(c),
                    ConstructKind::Switch { .. } => EdgeKind::SwitchBreak(c),
                    ConstructKind::Loop { .. } => EdgeKind::LoopBreak(c),
                });
            }

            let to_inside = to_pos.map_or(false, |p| construct.contains_pos(p) && p != construct.begin);
            match &construct.kind {
                &ConstructKind::Loop {
                    continue_target, ..
                } => {
                    let from_continuing = from_pos >= construct.continuing_begin;
                    if to == construct.header {
                        return if continue_target == construct.header {
                            Ok(EdgeKind::LoopContinue(c))
                        } else if from_continuing {
                            Ok(EdgeKind::BackEdge(c))
                        } else {
                            Err(unstructured("back edge from outside of the continue construct"))
                        };
                    }
                    if to == continue_target && !from_continuing {
                        return Ok(EdgeKind::LoopContinue(c));
                    }
                    if depth == 0 && to_inside {
                        let to_continuing = to_pos >= Some(construct.continuing_begin);
                        if from_continuing != to_continuing {
                            return Err(unstructured(
                                "branch between the body and continuing parts of a loop",
                            ));
                        }
                    }
                }
                ConstructKind::If {
                    true_target,
                    false_target,
                    premerges,
                    ..
                } => {
                    if from != construct.header
                        && to_inside
                        && (to == *true_target || to == *false_target)
                    {
                        return Err(unstructured("branch into an arm of an `if` from outside of it"));
                    }
                    if let Some(idx) = premerges.iter().position(|&p| p == to) {
                        if !is_later {
                            return Err(unstructured("backward branch to a premerge block"));
                        }
                        return Ok(EdgeKind::IfPremerge(c, idx as u32));
                    }
                }
                ConstructKind::Switch { case_targets, .. } => {
                    if from != construct.header && to_inside && case_targets.contains(&to) {
                        return Err(Error::SwitchFallthrough {
                            from: cfg.blocks[from.index()].label,
                            to: cfg.blocks[to.index()].label,
                        });
                    }
                }
            }

            // Anything else inside the innermost construct is just sequencing,
            // anything outside it must be one of the exits checked above.
            if depth == 0 && to_inside {
                return if is_later {
                    Ok(EdgeKind::Forward)
                } else {
                    Err(unstructured("backward branch to a block other than a loop header"))
                };
            }
        }

        if chain.is_empty() && to_pos.is_some() {
            return if is_later {
                Ok(EdgeKind::Forward)
            } else {
                Err(unstructured("backward branch outside of any loop"))
            };
        }
        Err(unstructured(
            "branch out of a construct to a block other than its merge or continue target",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::DominatorTree;
    use crate::spv::read::ModuleParser;
    use crate::Context;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU32;

    struct Fixture {
        cfg: ControlFlowGraph,
        constructs: Constructs,
    }

    impl Fixture {
        fn new(text: &str) -> Self {
            let cx = Context::new();
            let insts = ModuleParser::read_from_spvasm_str(&cx, text)
                .unwrap()
                .collect::<Result<Vec<_>>>()
                .unwrap();
            let cfg = ControlFlowGraph::from_func_insts(&cx, insts).unwrap();
            let constructs = Constructs::build(&cfg, &DominatorTree::compute(&cfg)).unwrap();
            Self { cfg, constructs }
        }

        fn block(&self, label: u32) -> BlockIdx {
            self.cfg
                .block_by_label(NonZeroU32::new(label).unwrap())
                .unwrap()
        }

        fn construct(&self, header: u32) -> ConstructIdx {
            self.constructs.headed_by(self.block(header)).unwrap()
        }

        fn classify(&self, from: u32, to: u32) -> Result<EdgeKind> {
            self.constructs
                .classify_edge(&self.cfg, self.block(from), self.block(to))
        }
    }

    #[test]
    fn loop_edges() {
        let f = Fixture::new(
            "
            %10 = OpLabel
                  OpBranch %20
            %20 = OpLabel
                  OpLoopMerge %99 %50 None
                  OpBranchConditional %1 %30 %99
            %30 = OpLabel
                  OpSelectionMerge %40 None
                  OpBranchConditional %1 %35 %40
            %35 = OpLabel
                  OpBranchConditional %1 %99 %50
            %40 = OpLabel
                  OpBranch %50
            %50 = OpLabel
                  OpBranch %20
            %99 = OpLabel
                  OpReturn
            ",
        );
        let l = f.construct(20);
        let c = f.construct(30);

        assert_eq!(f.classify(10, 20).unwrap(), EdgeKind::Forward);
        assert_eq!(f.classify(20, 30).unwrap(), EdgeKind::Forward);
        assert_eq!(f.classify(20, 99).unwrap(), EdgeKind::LoopBreak(l));
        assert_eq!(f.classify(30, 35).unwrap(), EdgeKind::Forward);
        assert_eq!(f.classify(30, 40).unwrap(), EdgeKind::IfBreak(c));
        assert_eq!(f.classify(35, 99).unwrap(), EdgeKind::LoopBreak(l));
        assert_eq!(f.classify(35, 50).unwrap(), EdgeKind::LoopContinue(l));
        assert_eq!(f.classify(40, 50).unwrap(), EdgeKind::LoopContinue(l));
        assert_eq!(f.classify(50, 20).unwrap(), EdgeKind::BackEdge(l));

        assert_eq!(
            EdgeKind::LoopContinue(l).target(&f.constructs),
            Some(f.block(50))
        );
    }

    #[test]
    fn self_continuing_loop_back_edge_is_a_continue() {
        let f = Fixture::new(
            "
            %10 = OpLabel
                  OpBranch %20
            %20 = OpLabel
                  OpLoopMerge %99 %20 None
                  OpBranchConditional %1 %20 %99
            %99 = OpLabel
                  OpReturn
            ",
        );
        let l = f.construct(20);
        assert_eq!(f.classify(20, 20).unwrap(), EdgeKind::LoopContinue(l));
        assert_eq!(f.classify(20, 99).unwrap(), EdgeKind::LoopBreak(l));
    }

    #[test]
    fn premerge_edges() {
        let f = Fixture::new(
            "
            %10 = OpLabel
                  OpSelectionMerge %99 None
                  OpBranchConditional %1 %20 %30
            %20 = OpLabel
                  OpBranchConditional %1 %99 %40
            %30 = OpLabel
                  OpBranch %40
            %40 = OpLabel
                  OpBranch %99
            %99 = OpLabel
                  OpReturn
            ",
        );
        let c = f.construct(10);
        assert_eq!(f.classify(20, 40).unwrap(), EdgeKind::IfPremerge(c, 0));
        assert_eq!(f.classify(30, 40).unwrap(), EdgeKind::IfPremerge(c, 0));
        assert_eq!(f.classify(40, 99).unwrap(), EdgeKind::IfBreak(c));
    }

    #[test]
    fn switch_fallthrough() {
        let f = Fixture::new(
            "
            %10 = OpLabel
                  OpSelectionMerge %99 None
                  OpSwitch %1 %99 1 %20 2 %30
            %20 = OpLabel
                  OpBranch %30
            %30 = OpLabel
                  OpBranch %99
            %99 = OpLabel
                  OpReturn
            ",
        );
        let err = f.classify(20, 30).unwrap_err();
        assert!(matches!(err, Error::SwitchFallthrough { .. }), "{err}");
        assert!(err.is_internal());
    }

    #[test]
    fn unstructured_edges() {
        let f = Fixture::new(
            "
            %10 = OpLabel
                  OpSelectionMerge %99 None
                  OpBranchConditional %1 %20 %30
            %20 = OpLabel
                  OpBranch %30
            %30 = OpLabel
                  OpBranch %99
            %99 = OpLabel
                  OpReturn
            ",
        );
        let err = f.classify(20, 30).unwrap_err();
        assert!(matches!(err, Error::UnstructuredBranch { .. }), "{err}");
    }
}
