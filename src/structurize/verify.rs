//! Structural verification of an emitted [`FuncDefBody`].
//!
//! Checks that every terminator leaves its block in a way the region tree
//! allows (e.g. `exit_if` only leaving the `if` owning its block, `continue`
//! only leaving the body of the innermost loop), that every argument list
//! matches what it's passed to, and that every value is used only where its
//! definition is visible.

use crate::func_at::FuncAt;
use crate::visit::{InnerVisit, Visitor};
use crate::{
    Block, Const, Context, Error, Func, FuncDefBody, Node, NodeKind, Result, Terminator, Type,
    TypeDef, Value,
};
use rustc_hash::FxHashSet;

/// What a block is to its parent [`Node`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BlockRole {
    IfArm,
    SwitchCase,
    LoopBody,
    LoopContinuing,
}

pub fn verify_func_body(cx: &Context, func_def_body: &FuncDefBody) -> Result<()> {
    let mut verifier = Verifier {
        cx,
        func_at: func_def_body.at(()),
        enclosing: vec![],
        visible: vec![],
        error: None,
    };
    func_def_body.inner_visit_with(&mut verifier);
    match verifier.error {
        Some(reason) => Err(Error::InvalidStructure { reason }),
        None => Ok(()),
    }
}

struct Verifier<'a> {
    cx: &'a Context,

    func_at: FuncAt<'a, ()>,

    /// The block being visited and all its ancestors, each with its parent
    /// node (outermost first, and without the function body).
    enclosing: Vec<(Node, BlockRole)>,

    /// Values defined so far by each block being visited (parallel to the
    /// block stack, so one longer than `enclosing`).
    visible: Vec<FxHashSet<Value>>,

    /// The first failure (later ones are likely consequences of it).
    error: Option<String>,
}

impl<'a> Verifier<'a> {
    fn fail(&mut self, reason: impl FnOnce() -> String) {
        if self.error.is_none() {
            self.error = Some(reason());
        }
    }

    fn role_in_parent(&self, block: Block) -> Option<(Node, BlockRole)> {
        let &(parent, _) = self.enclosing.last()?;
        // HACK(eddyb) `enclosing` is only pushed to by `visit_node_def`, right
        // before visiting its child blocks, with a placeholder role.
        let role = match &self.func_at.at(parent).def().kind {
            NodeKind::Inst { .. } => unreachable!("verify: block inside an instruction"),
            NodeKind::If { .. } => BlockRole::IfArm,
            NodeKind::Switch { .. } => BlockRole::SwitchCase,
            &NodeKind::Loop { body, .. } => {
                if block == body {
                    BlockRole::LoopBody
                } else {
                    BlockRole::LoopContinuing
                }
            }
        };
        Some((parent, role))
    }

    fn output_count(&self, node: Node) -> usize {
        self.func_at.at(node).def().outputs.len()
    }

    /// Find the region `node` is left from, when crossing (only) the kinds of
    /// regions in `crossable`, and check that its role is `role`.
    fn check_exit_target(
        &mut self,
        what: &str,
        node: Node,
        role: BlockRole,
        crossable: &[BlockRole],
    ) {
        let found = self
            .enclosing
            .iter()
            .rev()
            .find(|&&(_, r)| !crossable.contains(&r))
            .copied();
        if found != Some((node, role)) {
            let from = self.enclosing.last().copied();
            self.fail(|| format!("`{what}` of {node:?} must leave its {role:?} (from {from:?})"));
        }
    }

    fn check_bool_cond(&mut self, what: &str, cond: Value) {
        // NOTE(eddyb) function parameters aren't typed in the body, and can't
        // be checked here.
        let ty = self.func_at.at(cond).type_of(self.cx);
        if let Some(ty) = ty {
            if !matches!(self.cx[ty], TypeDef::Bool) {
                self.fail(|| format!("`{what}` condition {cond:?} isn't a `bool`"));
            }
        }
    }

    fn check_arg_count(&mut self, what: &str, found: usize, expected: usize) {
        if found != expected {
            self.fail(|| format!("`{what}` passes {found} values, expected {expected}"));
        }
    }
}

impl<'a> Visitor<'a> for Verifier<'a> {
    // FIXME(eddyb) check types and constants against their uses.
    fn visit_type_use(&mut self, _ty: Type) {}
    fn visit_const_use(&mut self, _ct: Const) {}
    fn visit_func_use(&mut self, _func: Func) {}

    fn visit_block_def(&mut self, func_at_block: FuncAt<'a, Block>) {
        let block = func_at_block.position;
        let role = self.role_in_parent(block);
        if let Some(role) = role {
            *self.enclosing.last_mut().unwrap() = role;
        }

        let def = func_at_block.def();
        if !def.params.is_empty() && !matches!(role, Some((_, BlockRole::LoopContinuing))) {
            self.fail(|| format!("{block:?} has parameters, but isn't a `continuing` block"));
        }

        let params = (0..def.params.len() as u32).map(|idx| Value::BlockParam { block, idx });
        self.visible.push(params.collect());
        func_at_block.inner_visit_with(self);
        self.visible.pop();
    }

    fn visit_node_def(&mut self, func_at_node: FuncAt<'a, Node>) {
        let node = func_at_node.position;
        if let NodeKind::If { cond, .. } = func_at_node.def().kind {
            self.check_bool_cond("if", cond);
        }

        // Only children see the node's parent role replaced with their own.
        self.enclosing.push((node, BlockRole::IfArm));
        func_at_node.inner_visit_with(self);
        self.enclosing.pop();

        let outputs = (0..func_at_node.def().outputs.len() as u32)
            .map(|output_idx| Value::NodeOutput { node, output_idx });
        self.visible.last_mut().unwrap().extend(outputs);
    }

    fn visit_terminator(&mut self, terminator: &'a Terminator) {
        use BlockRole::{IfArm, LoopBody, LoopContinuing, SwitchCase};

        match terminator {
            Terminator::Return(_) | Terminator::Unreachable | Terminator::TerminateInvocation => {}
            &Terminator::ExitIf { node, ref args } => {
                self.check_exit_target("exit_if", node, IfArm, &[]);
                self.check_arg_count("exit_if", args.len(), self.output_count(node));
            }
            &Terminator::ExitSwitch { node, ref args } => {
                self.check_exit_target("exit_switch", node, SwitchCase, &[IfArm]);
                self.check_arg_count("exit_switch", args.len(), self.output_count(node));
            }
            &Terminator::ExitLoop { node, ref args } => {
                self.check_exit_target("exit_loop", node, LoopBody, &[IfArm]);
                self.check_arg_count("exit_loop", args.len(), self.output_count(node));
            }
            &Terminator::Continue {
                loop_node,
                ref args,
            } => {
                self.check_exit_target("continue", loop_node, LoopBody, &[IfArm, SwitchCase]);
                if let NodeKind::Loop { continuing, .. } = self.func_at.at(loop_node).def().kind {
                    let expected = self.func_at.at(continuing).def().params.len();
                    self.check_arg_count("continue", args.len(), expected);
                }
            }
            &Terminator::NextIteration { loop_node } => {
                self.check_exit_target("next_iteration", loop_node, LoopContinuing, &[]);
            }
            &Terminator::BreakIf {
                loop_node,
                cond,
                ref exit_args,
            } => {
                self.check_exit_target("break_if", loop_node, LoopContinuing, &[]);
                self.check_bool_cond("break_if", cond);
                self.check_arg_count("break_if", exit_args.len(), self.output_count(loop_node));
            }
        }
        terminator.inner_visit_with(self);
    }

    fn visit_value_use(&mut self, v: &'a Value) {
        match *v {
            Value::Const(_) | Value::FuncParam { .. } => {}
            Value::NodeOutput { .. } | Value::BlockParam { .. } => {
                if !self.visible.iter().any(|defs| defs.contains(v)) {
                    self.fail(|| format!("{v:?} used where its definition isn't visible"));
                }
            }
        }
        v.inner_visit_with(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockDef, ConstDef, ConstKind, EntityDefs, InstOp, NodeDef, NodeOutputDecl};
    use smallvec::{smallvec, SmallVec};

    struct Builder<'a> {
        cx: &'a Context,
        blocks: EntityDefs<Block, BlockDef>,
        nodes: EntityDefs<Node, NodeDef>,
    }

    impl<'a> Builder<'a> {
        fn new(cx: &'a Context) -> Self {
            Self {
                cx,
                blocks: EntityDefs::new(),
                nodes: EntityDefs::new(),
            }
        }

        fn block(&mut self, nodes: Vec<Node>, terminator: Terminator) -> Block {
            self.blocks.define(
                self.cx,
                BlockDef {
                    params: SmallVec::new(),
                    nodes,
                    terminator,
                },
            )
        }

        fn node(&mut self, kind: NodeKind, outputs: usize) -> Node {
            let ty = self.cx.intern(TypeDef::Bool);
            self.nodes.define(
                self.cx,
                NodeDef {
                    kind,
                    outputs: (0..outputs).map(|_| NodeOutputDecl { ty }).collect(),
                },
            )
        }

        fn true_value(&self) -> Value {
            Value::Const(self.cx.bool_const(true))
        }

        fn finish(self, body: Block) -> FuncDefBody {
            FuncDefBody {
                blocks: self.blocks,
                nodes: self.nodes,
                body,
            }
        }
    }

    /// `if true { <then> } else { exit_if }`, with its `then` terminator
    /// built by `then_terminator` (given the `if` node).
    fn if_in_loop(
        cx: &Context,
        then_terminator: impl FnOnce(Node, Node) -> Terminator,
    ) -> FuncDefBody {
        let mut b = Builder::new(cx);
        let cond = b.true_value();

        let loop_node = b.node(
            NodeKind::Inst {
                op: InstOp::Let,
                inputs: SmallVec::new(),
            },
            0,
        );
        let if_node = b.node(
            NodeKind::Inst {
                op: InstOp::Let,
                inputs: SmallVec::new(),
            },
            0,
        );
        let then_block = b.block(vec![], then_terminator(loop_node, if_node));
        let else_block = b.block(
            vec![],
            Terminator::ExitIf {
                node: if_node,
                args: SmallVec::new(),
            },
        );
        b.nodes[if_node].kind = NodeKind::If {
            cond,
            then_block,
            else_block,
            control: crate::spv::spec::SelectionControl::None,
        };
        let body = b.block(
            vec![if_node],
            Terminator::Continue {
                loop_node,
                args: SmallVec::new(),
            },
        );
        let continuing = b.block(vec![], Terminator::NextIteration { loop_node });
        b.nodes[loop_node].kind = NodeKind::Loop {
            body,
            continuing,
            control: crate::spv::spec::LoopControl::None,
        };
        let func_body = b.block(vec![loop_node], Terminator::Return(None));
        b.finish(func_body)
    }

    #[test]
    fn exits_crossing_ifs() {
        let cx = Context::new();

        let exit_loop = if_in_loop(&cx, |loop_node, _| Terminator::ExitLoop {
            node: loop_node,
            args: SmallVec::new(),
        });
        verify_func_body(&cx, &exit_loop).unwrap();

        let cont = if_in_loop(&cx, |loop_node, _| Terminator::Continue {
            loop_node,
            args: SmallVec::new(),
        });
        verify_func_body(&cx, &cont).unwrap();

        let exit_if = if_in_loop(&cx, |_, if_node| Terminator::ExitIf {
            node: if_node,
            args: SmallVec::new(),
        });
        verify_func_body(&cx, &exit_if).unwrap();
    }

    #[test]
    fn misplaced_terminators() {
        let cx = Context::new();

        let next_iteration_in_body =
            if_in_loop(&cx, |loop_node, _| Terminator::NextIteration { loop_node });
        assert!(matches!(
            verify_func_body(&cx, &next_iteration_in_body),
            Err(Error::InvalidStructure { .. })
        ));

        let exit_if_with_args = if_in_loop(&cx, |_, if_node| Terminator::ExitIf {
            node: if_node,
            args: smallvec![Value::Const(cx.bool_const(false))],
        });
        assert!(verify_func_body(&cx, &exit_if_with_args).is_err());

        // `exit_if` naming the loop, which isn't even an `if`.
        let exit_if_of_loop = if_in_loop(&cx, |loop_node, _| Terminator::ExitIf {
            node: loop_node,
            args: SmallVec::new(),
        });
        assert!(verify_func_body(&cx, &exit_if_of_loop).is_err());
    }

    #[test]
    fn uses_must_see_definitions() {
        let cx = Context::new();
        let mut b = Builder::new(&cx);
        let bool_ty = cx.intern(TypeDef::Bool);
        let undef = Value::Const(cx.intern(ConstDef {
            ty: bool_ty,
            kind: ConstKind::Undef,
        }));

        // `%x` is defined in the `then` block, but returned after the `if`.
        let x = b.node(
            NodeKind::Inst {
                op: InstOp::Let,
                inputs: smallvec![undef],
            },
            1,
        );
        let x_value = Value::NodeOutput {
            node: x,
            output_idx: 0,
        };
        let if_node = b.node(
            NodeKind::Inst {
                op: InstOp::Let,
                inputs: SmallVec::new(),
            },
            0,
        );
        let then_block = b.block(
            vec![x],
            Terminator::ExitIf {
                node: if_node,
                args: SmallVec::new(),
            },
        );
        let else_block = b.block(
            vec![],
            Terminator::ExitIf {
                node: if_node,
                args: SmallVec::new(),
            },
        );
        let cond = b.true_value();
        b.nodes[if_node].kind = NodeKind::If {
            cond,
            then_block,
            else_block,
            control: crate::spv::spec::SelectionControl::None,
        };
        let func_body = b.block(vec![if_node], Terminator::Return(Some(x_value)));
        let body = b.finish(func_body);

        let err = verify_func_body(&cx, &body).unwrap_err();
        assert!(err.to_string().contains("isn't visible"), "{err}");
    }
}
