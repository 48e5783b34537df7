//! Traversal helpers for intra-function entities.
//!
//! `FuncAt<P>` is like `(&FuncDefBody, P)` (where `P` is some type describing
//! a "position" in the function), except:
//! * it only borrows the `EntityDefs` fields of `FuncDefBody`
//!   * this also avoids accidentally accessing parts of the function definition
//!     without going through `P` (as `EntityDefs` requires keys for any access)
//! * it's a dedicated type with inherent methods and trait `impl`s

use crate::{
    Block, BlockDef, Context, EntityDefs, FuncDefBody, Node, NodeDef, NodeKind, Type, Value,
};
use smallvec::SmallVec;

/// Immutable traversal (i.e. visiting) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper
/// (e.g. `Block`, `Node` or `Value`).
#[derive(Copy, Clone)]
pub struct FuncAt<'a, P: Copy> {
    pub blocks: &'a EntityDefs<Block, BlockDef>,
    pub nodes: &'a EntityDefs<Node, NodeDef>,

    pub position: P,
}

impl<'a, P: Copy> FuncAt<'a, P> {
    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAt<'a, P2> {
        FuncAt {
            blocks: self.blocks,
            nodes: self.nodes,
            position: new_position,
        }
    }
}

impl<'a> FuncAt<'a, Block> {
    pub fn def(self) -> &'a BlockDef {
        &self.blocks[self.position]
    }

    /// The [`Node`]s of this block, in execution order.
    pub fn at_nodes(self) -> impl Iterator<Item = FuncAt<'a, Node>> {
        self.def().nodes.iter().map(move |&node| self.at(node))
    }
}

impl<'a> FuncAt<'a, Node> {
    pub fn def(self) -> &'a NodeDef {
        &self.nodes[self.position]
    }

    /// Blocks owned by this node (none for instructions), in the order they
    /// appear in (`then`/`else`, cases, `body`/`continuing`).
    pub fn child_blocks(self) -> SmallVec<[Block; 4]> {
        match &self.def().kind {
            NodeKind::Inst { .. } => SmallVec::new(),
            &NodeKind::If {
                then_block,
                else_block,
                ..
            } => [then_block, else_block].into_iter().collect(),
            NodeKind::Switch { cases, .. } => cases.iter().map(|case| case.block).collect(),
            &NodeKind::Loop {
                body, continuing, ..
            } => [body, continuing].into_iter().collect(),
        }
    }
}

impl FuncAt<'_, Value> {
    /// The type of this value, or `None` for function parameters (which can
    /// only be typed through the [`FuncDecl`](crate::FuncDecl)).
    pub fn type_of(self, cx: &Context) -> Option<Type> {
        match self.position {
            Value::Const(ct) => Some(cx[ct].ty),
            Value::FuncParam { .. } => None,
            Value::NodeOutput { node, output_idx } => self.nodes[node]
                .outputs
                .get(output_idx as usize)
                .map(|output| output.ty),
            Value::BlockParam { block, idx } => {
                self.blocks[block].params.get(idx as usize).map(|param| param.ty)
            }
        }
    }
}

impl FuncDefBody {
    /// Start immutably traversing the function at `position`.
    pub fn at<P: Copy>(&self, position: P) -> FuncAt<'_, P> {
        FuncAt {
            blocks: &self.blocks,
            nodes: &self.nodes,
            position,
        }
    }

    /// Start immutably traversing the function at its outermost block.
    pub fn at_body(&self) -> FuncAt<'_, Block> {
        self.at(self.body)
    }
}
