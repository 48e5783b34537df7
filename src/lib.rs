//! Structured control-flow reconstruction for SPIR-V functions.
//!
//! SPIR-V encodes structured control-flow as an ordinary CFG of basic blocks,
//! *annotated* with merge instructions (`OpSelectionMerge`/`OpLoopMerge`) that
//! declare where each `if`/`switch`/`loop` construct ends. This crate recovers
//! the explicit region tree from that encoding: nested `if`/`switch`/`loop`
//! nodes with `exit_if`/`exit_switch`/`exit_loop`/`continue`/`next_iteration`/
//! `break_if` terminators, and values that cross region boundaries threaded
//! through construct results (or continuing block parameters).
//!
//! #### Notable types/modules
//!
//! ##### IR data types
// HACK(eddyb) using `(struct.Context.html)` to link `Context`, not `context::Context`.
//! * [`Context`](struct.Context.html): handles interning ([`Type`]s, [`Const`]s, etc.) and allocating entity handles
//! * [`Module`]: owns [`Func`]s (in declaration order, see [`Module::func_order`])
//! * [`FuncDefBody`]: owns [`Block`]s and [`Node`]s (rooted by [`body`](FuncDefBody::body))
//!
//! ##### Utilities and passes
//! * [`spv::read`]/[`spv::lower`]: SPIR-V assembly parsing and lowering
//! * [`cfg`]: basic block graph, orderings and dominators
//! * [`structurize`]: the structurizer itself (constructs, edges, hoisting, emission)
//! * [`print`](mod@print): textual serialization of the structured IR
//!
//! ```
//! let module = spv_structurize::Module::lower_from_spvasm(
//!     std::rc::Rc::new(spv_structurize::Context::new()),
//!     "
//!                OpCapability Shader
//!                OpMemoryModel Logical GLSL450
//!                OpEntryPoint GLCompute %main \"main\"
//!                OpExecutionMode %main LocalSize 1 1 1
//!                OpName %main \"main\"
//!        %void = OpTypeVoid
//!          %fn = OpTypeFunction %void
//!        %main = OpFunction %void None %fn
//!       %entry = OpLabel
//!                OpReturn
//!                OpFunctionEnd
//!     ",
//!     &spv_structurize::structurize::Config::DEFAULT,
//! )
//! .unwrap();
//! assert!(module.print().contains("func():void"));
//! ```

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(
    // NOTE(eddyb) ignored for readability (`match` used when `if let` is too long).
    clippy::single_match_else,

    // NOTE(eddyb) ignored because it's misguided to suggest `let mut s = ...;`
    // and `s.push_str(...);` when `+` is equivalent and does not require `let`.
    clippy::string_add,
)]
#![forbid(unsafe_code)]

// NOTE(eddyb) all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod cfg;
mod context;
pub mod func_at;
pub mod print;
pub mod spv;
pub mod structurize;
pub mod visit;

use smallvec::SmallVec;

// HACK(eddyb) work around the lack of an `FxIndexSet` type alias elsewhere.
#[doc(hidden)]
type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

// NOTE(eddyb) these reexports are all documented inside `context`.
pub use context::{Context, EntityDefs};

/// Interned handle for a [`str`].
pub use context::InternedStr;

/// Errors produced while reading, lowering, structurizing or verifying a module.
///
/// Every per-function failure is atomic: no partial structured output exists
/// for a function that failed (see also [`Error::InFunction`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("unsupported: {reason}")]
    Unsupported { reason: String },

    #[error("malformed module: {reason}")]
    MalformedModule { reason: String },

    /// Missing/duplicate terminator, or instructions outside of any block
    /// (`block` is the offending block, when there is one).
    #[error(
        "malformed function{}: {reason}",
        .block.map_or(String::new(), |block| format!(" in block %{block}"))
    )]
    MalformedFunction {
        block: Option<spv::Id>,
        reason: String,
    },

    /// Misplaced merge instruction, or merge/continue target not in the function.
    #[error("malformed merge in block %{block}: {reason}")]
    MalformedMerge { block: spv::Id, reason: String },

    /// A `switch` case branching directly into another case.
    #[error("switch case %{from} falls through into case %{to}")]
    SwitchFallthrough { from: spv::Id, to: spv::Id },

    /// An edge which fits none of the structured edge kinds.
    #[error("unstructured branch from %{from} to %{to}: {reason}")]
    UnstructuredBranch {
        from: spv::Id,
        to: spv::Id,
        reason: &'static str,
    },

    #[error("cannot make %{id} available at one of its uses")]
    UnresolvableHoist { id: spv::Id },

    /// The emitted region tree failed structural verification.
    #[error("invalid structured output: {reason}")]
    InvalidStructure { reason: String },

    /// Any per-function failure, with `message` referring to IDs by their
    /// original `%name`s (`source` still refers to them by number).
    #[error("in function `{func}`: {message}")]
    InFunction {
        func: String,
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap a failure inside the function `func`, replacing every `%<number>`
    /// in its message that has an entry in `id_names` with `%<name>`.
    pub fn in_function(
        func: String,
        source: Error,
        id_names: &rustc_hash::FxHashMap<spv::Id, String>,
    ) -> Self {
        let numeric = source.to_string();
        let mut message = String::with_capacity(numeric.len());
        let mut rest = &numeric[..];
        while let Some(i) = rest.find('%') {
            let (before, after) = rest.split_at(i + 1);
            message += before;
            let digits = after.find(|c: char| !c.is_ascii_digit()).unwrap_or(after.len());
            let (number, after) = after.split_at(digits);
            let name = number
                .parse::<u32>()
                .ok()
                .and_then(spv::Id::new)
                .and_then(|id| id_names.get(&id));
            message += name.map_or(number, String::as_str);
            rest = after;
        }
        message += rest;

        Error::InFunction {
            func,
            message,
            source: Box::new(source),
        }
    }

    /// Whether this error indicates a violated invariant of well-formed
    /// structured SPIR-V (or of the structurizer itself), i.e. it's in the
    /// "internal compiler error" class rather than a diagnosable input error.
    pub fn is_internal(&self) -> bool {
        match self {
            Error::SwitchFallthrough { .. }
            | Error::UnstructuredBranch { .. }
            | Error::UnresolvableHoist { .. }
            | Error::InvalidStructure { .. } => true,

            Error::InFunction { source, .. } => source.is_internal(),

            Error::Parse { .. }
            | Error::Unsupported { .. }
            | Error::MalformedModule { .. }
            | Error::MalformedFunction { .. }
            | Error::MalformedMerge { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// HACK(eddyb) this only serves to disallow modifying the `cx` field of `Module`.
#[doc(hidden)]
mod sealed {
    use super::*;
    use std::rc::Rc;

    pub struct Module {
        /// Context used for everything interned, in this module.
        ///
        /// Notable choices made for this field:
        /// * private to disallow switching the context of a module
        /// * `Rc` sharing to allow multiple modules to use the same context
        ///   (`Context: !Sync` because of the interners so it can't be `Arc`)
        cx: Rc<Context>,

        pub dialect: spv::Dialect,

        pub funcs: EntityDefs<Func, FuncDecl>,

        /// All [`Func`]s in `funcs`, in their original declaration order.
        pub func_order: Vec<Func>,
    }

    impl std::fmt::Debug for Module {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Module")
                .field("func_order", &self.func_order)
                .finish_non_exhaustive()
        }
    }

    impl Module {
        pub fn new(cx: Rc<Context>, dialect: spv::Dialect) -> Self {
            Self {
                cx,

                dialect,

                funcs: Default::default(),
                func_order: vec![],
            }
        }

        // FIXME(eddyb) `cx_ref` might be the better default in situations where
        // the module doesn't need to be modified, figure out if that's common.
        pub fn cx(&self) -> Rc<Context> {
            self.cx.clone()
        }

        pub fn cx_ref(&self) -> &Rc<Context> {
            &self.cx
        }
    }
}
pub use sealed::Module;

/// Entity handle for a [`FuncDecl`] (a function).
pub use context::Func;

pub struct FuncDecl {
    /// Debug name (from `OpName`), if any.
    pub name: Option<InternedStr>,

    pub ret_type: Type,
    pub params: SmallVec<[FuncParam; 2]>,

    /// Set for functions used as shader entry-points (by `OpEntryPoint`).
    pub entry_point: Option<EntryPoint>,

    pub def: DeclDef<FuncDefBody>,
}

#[derive(Copy, Clone)]
pub struct FuncParam {
    pub ty: Type,
}

#[derive(Clone)]
pub struct EntryPoint {
    pub stage: spv::spec::ExecutionModel,
    pub name: InternedStr,

    /// Only present for compute shaders declaring `LocalSize`.
    pub workgroup_size: Option<[u32; 3]>,
}

/// Declaration with an optional definition (e.g. a function with no blocks,
/// only declaring its signature, which SPIR-V uses for linking imports).
pub enum DeclDef<D> {
    Imported,
    Present(D),
}

/// The body of a function definition, a tree of [`Block`]s and [`Node`]s.
pub struct FuncDefBody {
    pub blocks: EntityDefs<Block, BlockDef>,
    pub nodes: EntityDefs<Node, NodeDef>,

    /// The outermost [`Block`], executed on function entry.
    ///
    /// It can only be left through `Return`/`Unreachable`/`TerminateInvocation`.
    pub body: Block,
}

/// Entity handle for a [`BlockDef`] (a straight-line sequence of [`Node`]s).
pub use context::Block;

/// A block is an ordered sequence of [`Node`]s, ended by exactly one [`Terminator`].
///
/// Blocks are always owned by either a [`FuncDefBody`] (its `body`), or a
/// structured [`Node`] (`If`, `Switch` or `Loop`).
#[derive(Clone)]
pub struct BlockDef {
    /// Only used by `continuing` blocks of loops, receiving the arguments
    /// passed by `Terminator::Continue` (values hoisted out of the loop body).
    pub params: SmallVec<[BlockParamDecl; 2]>,

    pub nodes: Vec<Node>,

    pub terminator: Terminator,
}

#[derive(Copy, Clone)]
pub struct BlockParamDecl {
    pub ty: Type,
}

/// Entity handle for a [`NodeDef`] (an instruction, or a structured construct).
pub use context::Node;

#[derive(Clone)]
pub struct NodeDef {
    pub kind: NodeKind,

    /// Values produced by this node: an instruction's result (if any), or
    /// the results of a structured construct (set by its exit terminators).
    pub outputs: SmallVec<[NodeOutputDecl; 2]>,
}

#[derive(Copy, Clone)]
pub struct NodeOutputDecl {
    pub ty: Type,
}

#[derive(Clone)]
pub enum NodeKind {
    Inst {
        op: InstOp,
        inputs: SmallVec<[Value; 2]>,
    },

    /// Executes `then_block` if `cond` is `true`, `else_block` otherwise,
    /// both of which must exit through `Terminator::ExitIf` (or jump further out).
    If {
        cond: Value,
        then_block: Block,
        else_block: Block,
        control: spv::spec::SelectionControl,
    },

    Switch {
        selector: Value,
        cases: SmallVec<[SwitchCase; 4]>,
        control: spv::spec::SelectionControl,
    },

    /// Executes `body` then `continuing` repeatedly, until exited through
    /// `Terminator::ExitLoop` (from `body`) or `Terminator::BreakIf` (from
    /// `continuing`).
    Loop {
        body: Block,
        continuing: Block,
        control: spv::spec::LoopControl,
    },
}

#[derive(Clone)]
pub struct SwitchCase {
    pub selectors: SmallVec<[CaseSelector; 2]>,
    pub block: Block,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum CaseSelector {
    Literal(Const),
    Default,
}

#[derive(Clone, PartialEq, Eq)]
pub enum InstOp {
    /// Copy of its single input (from `OpCopyObject`).
    Let,

    /// Function-local variable, with an optional initializer input.
    Var,
    Load,
    Store,

    Call(Func),

    Binary(BinaryOp),
    Unary(UnaryOp),

    /// Inputs are `(false_value, true_value, cond)`.
    Select,

    Construct,
    Access(SmallVec<[u32; 2]>),

    Convert,
    Bitcast,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negation,
    Complement,
}

/// The single way a [`Block`] is left, transferring control to its parent
/// [`Node`] (or further outwards, for `Return`/`ExitLoop`/`Continue` etc.).
#[derive(Clone)]
pub enum Terminator {
    Return(Option<Value>),
    Unreachable,
    TerminateInvocation,

    /// Leave the `If` node `node`, setting its outputs to `args`.
    ExitIf {
        node: Node,
        args: SmallVec<[Value; 2]>,
    },
    ExitSwitch {
        node: Node,
        args: SmallVec<[Value; 2]>,
    },
    ExitLoop {
        node: Node,
        args: SmallVec<[Value; 2]>,
    },

    /// Leave the body of `loop_node` for its `continuing` block, whose
    /// parameters receive `args`.
    Continue {
        loop_node: Node,
        args: SmallVec<[Value; 2]>,
    },

    /// Leave the `continuing` block of `loop_node`, starting its body again.
    NextIteration {
        loop_node: Node,
    },

    /// Leave the `continuing` block of `loop_node`, exiting the loop (with
    /// `exit_args` as its outputs) if `cond` is `true`, or starting its body
    /// again otherwise.
    BreakIf {
        loop_node: Node,
        cond: Value,
        exit_args: SmallVec<[Value; 2]>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Const(Const),

    FuncParam { idx: u32 },

    /// One of the outputs of a [`Node`] (the result of an instruction, or one
    /// of the results of a structured construct).
    NodeOutput { node: Node, output_idx: u32 },

    /// One of the parameters of a (`continuing`) [`Block`].
    BlockParam { block: Block, idx: u32 },
}

/// Interned handle for a [`TypeDef`].
pub use context::Type;

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TypeDef {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { elem: Type, count: u32 },
    Ptr {
        storage_class: spv::spec::StorageClass,
        pointee: Type,
    },
    Func {
        ret: Type,
        params: SmallVec<[Type; 4]>,
    },
}

/// Interned handle for a [`ConstDef`].
pub use context::Const;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ConstKind {
    Bool(bool),
    Int(i64),

    /// `f64` bit-pattern (of the value, even for narrower float types).
    Float {
        bits: u64,
    },

    Null,
    Undef,

    Composite(SmallVec<[Const; 4]>),
}

impl Context {
    /// Get the `undef` constant of type `ty`.
    pub fn undef(&self, ty: Type) -> Const {
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Undef,
        })
    }

    /// Get the `bool` constant `b`.
    pub fn bool_const(&self, b: bool) -> Const {
        let ty = self.intern(TypeDef::Bool);
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Bool(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn in_function_names_ids() {
        let id = |n| spv::Id::new(n).unwrap();
        let id_names = [(id(1), "entry".to_string()), (id(12), "12".to_string())]
            .into_iter()
            .collect();
        let err = Error::in_function(
            "main".into(),
            Error::UnstructuredBranch {
                from: id(1),
                to: id(12),
                reason: "100% unstructured, see %3",
            },
            &id_names,
        );
        assert_eq!(
            err.to_string(),
            "in function `main`: unstructured branch from %entry to %12: 100% unstructured, see %3"
        );
        assert!(err.is_internal());
    }
}
