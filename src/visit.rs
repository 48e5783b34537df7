//! Immutable traversal of the structured IR ([`Visitor`] and [`InnerVisit`]).

use crate::func_at::FuncAt;
use crate::{
    spv, Block, Const, ConstDef, ConstKind, DeclDef, Func, FuncDecl, FuncDefBody, FuncParam,
    InstOp, Module, Node, NodeKind, Terminator, Type, TypeDef, Value,
};

// FIXME(eddyb) `Sized` bound shouldn't be needed but removing it requires
// writing `impl Visitor<'a> + ?Sized` in `fn inner_visit_with` signatures.
pub trait Visitor<'a>: Sized {
    // Context-interned leaves (no default provided).
    // FIXME(eddyb) treat these separately somehow and allow e.g. automatic deep
    // visiting (with a set to avoid repeat visits) if a `Rc<Context>` is provided.
    fn visit_type_use(&mut self, ty: Type);
    fn visit_const_use(&mut self, ct: Const);

    // Module-stored (but context-allocated indices) leaves (no default provided).
    fn visit_func_use(&mut self, func: Func);

    // Leaves (noop default behavior).
    fn visit_spv_dialect(&mut self, _dialect: &spv::Dialect) {}

    // Non-leaves (defaulting to calling `.inner_visit_with(self)`).
    fn visit_module(&mut self, module: &'a Module) {
        module.inner_visit_with(self);
    }
    fn visit_type_def(&mut self, ty_def: &'a TypeDef) {
        ty_def.inner_visit_with(self);
    }
    fn visit_const_def(&mut self, ct_def: &'a ConstDef) {
        ct_def.inner_visit_with(self);
    }
    fn visit_func_decl(&mut self, func_decl: &'a FuncDecl) {
        func_decl.inner_visit_with(self);
    }
    fn visit_block_def(&mut self, func_at_block: FuncAt<'a, Block>) {
        func_at_block.inner_visit_with(self);
    }
    fn visit_node_def(&mut self, func_at_node: FuncAt<'a, Node>) {
        func_at_node.inner_visit_with(self);
    }
    fn visit_terminator(&mut self, terminator: &'a Terminator) {
        terminator.inner_visit_with(self);
    }
    fn visit_value_use(&mut self, v: &'a Value) {
        v.inner_visit_with(self);
    }
}

/// Trait implemented on "visitable" types, to further "explore" a type by
/// visiting its "interior" (i.e. variants and/or fields).
///
/// That is, an `impl InnerVisit for X` will call the relevant `Visitor` method
/// for each `X` field, effectively performing a single level of a deep visit.
/// Also, if `Visitor::visit_X` exists for a given `X`, its default should be to
/// call `X::inner_visit_with` (i.e. so that visiting is mostly-deep by default).
pub trait InnerVisit {
    // FIXME(eddyb) the naming here isn't great, can it be improved?
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>);
}

impl InnerVisit for Module {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        // FIXME(eddyb) this can't be exhaustive because of the private `cx` field.
        let Self {
            dialect,
            funcs,
            func_order,
            ..
        } = self;

        visitor.visit_spv_dialect(dialect);
        for &func in func_order {
            visitor.visit_func_use(func);
            visitor.visit_func_decl(&funcs[func]);
        }
    }
}

impl InnerVisit for TypeDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match self {
            TypeDef::Void | TypeDef::Bool | TypeDef::Int { .. } | TypeDef::Float { .. } => {}
            &TypeDef::Vector { elem, count: _ } => visitor.visit_type_use(elem),
            &TypeDef::Ptr {
                storage_class: _,
                pointee,
            } => visitor.visit_type_use(pointee),
            TypeDef::Func { ret, params } => {
                visitor.visit_type_use(*ret);
                for &ty in params {
                    visitor.visit_type_use(ty);
                }
            }
        }
    }
}

impl InnerVisit for ConstDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { ty, kind } = self;

        visitor.visit_type_use(*ty);
        match kind {
            ConstKind::Bool(_)
            | ConstKind::Int(_)
            | ConstKind::Float { .. }
            | ConstKind::Null
            | ConstKind::Undef => {}
            ConstKind::Composite(elems) => {
                for &ct in elems {
                    visitor.visit_const_use(ct);
                }
            }
        }
    }
}

impl InnerVisit for FuncDecl {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self {
            name: _,
            ret_type,
            params,
            entry_point: _,
            def,
        } = self;

        visitor.visit_type_use(*ret_type);
        for param in params {
            param.inner_visit_with(visitor);
        }
        def.inner_visit_with(visitor);
    }
}

impl InnerVisit for FuncParam {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { ty } = *self;

        visitor.visit_type_use(ty);
    }
}

impl<D: InnerVisit> InnerVisit for DeclDef<D> {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match self {
            Self::Imported => {}
            Self::Present(def) => def.inner_visit_with(visitor),
        }
    }
}

impl InnerVisit for FuncDefBody {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        visitor.visit_block_def(self.at_body());
    }
}

// NOTE(eddyb) `FuncAt` is `Copy` and holds its own borrows, so it's visited
// by value (through inherent methods, as it can't implement `InnerVisit`).
impl<'a> FuncAt<'a, Block> {
    pub fn inner_visit_with(self, visitor: &mut impl Visitor<'a>) {
        let def = self.def();
        for param in &def.params {
            visitor.visit_type_use(param.ty);
        }
        for func_at_node in self.at_nodes() {
            visitor.visit_node_def(func_at_node);
        }
        visitor.visit_terminator(&def.terminator);
    }
}

impl<'a> FuncAt<'a, Node> {
    pub fn inner_visit_with(self, visitor: &mut impl Visitor<'a>) {
        let def = self.def();
        for output in &def.outputs {
            visitor.visit_type_use(output.ty);
        }
        match &def.kind {
            NodeKind::Inst { op, inputs } => {
                if let InstOp::Call(func) = *op {
                    visitor.visit_func_use(func);
                }
                for v in inputs {
                    visitor.visit_value_use(v);
                }
            }
            NodeKind::If { cond: v, .. } | NodeKind::Switch { selector: v, .. } => {
                visitor.visit_value_use(v);
            }
            NodeKind::Loop { .. } => {}
        }
        for block in self.child_blocks() {
            visitor.visit_block_def(self.at(block));
        }
    }
}

impl InnerVisit for Terminator {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match self {
            Terminator::Return(v) => {
                if let Some(v) = v {
                    visitor.visit_value_use(v);
                }
            }
            Terminator::Unreachable
            | Terminator::TerminateInvocation
            | Terminator::NextIteration { .. } => {}
            Terminator::ExitIf { args, .. }
            | Terminator::ExitSwitch { args, .. }
            | Terminator::ExitLoop { args, .. }
            | Terminator::Continue { args, .. } => {
                for v in args {
                    visitor.visit_value_use(v);
                }
            }
            Terminator::BreakIf {
                cond, exit_args, ..
            } => {
                visitor.visit_value_use(cond);
                for v in exit_args {
                    visitor.visit_value_use(v);
                }
            }
        }
    }
}

impl InnerVisit for Value {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match *self {
            Self::Const(ct) => visitor.visit_const_use(ct),
            Self::FuncParam { idx: _ }
            | Self::NodeOutput {
                node: _,
                output_idx: _,
            }
            | Self::BlockParam { block: _, idx: _ } => {}
        }
    }
}
