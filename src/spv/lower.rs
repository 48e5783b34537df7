//! SPIR-V to structured IR lowering.
//!
//! Module-level instructions (types, constants, names, entry-points) are
//! lowered as they're read, while the instructions of every function body
//! are collected and only structurized once the whole module was read (as
//! `OpFunctionCall`s can refer to functions declared later).

use crate::spv::{self, spec};
use crate::structurize::{self, Structurizer};
use crate::{
    BinaryOp, ConstDef, ConstKind, Context, DeclDef, EntryPoint, Error, Func, FuncDecl,
    FuncDefBody, FuncParam, InstOp, InternedStr, Result, Type, TypeDef, UnaryOp, Value,
};
use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::rc::Rc;
use tracing::{debug, debug_span};

/// Structured IR definition of a module-level SPIR-V ID.
enum IdDef {
    Type(Type),
    Const(crate::Const),
    Func(Func),

    /// Result of an instruction with no use as a value (e.g. `OpString`).
    Other(spec::Opcode),
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::MalformedModule {
        reason: reason.into(),
    }
}

fn id_operand(inst: &spv::InstWithIds, idx: usize) -> Result<spv::Id> {
    match inst.operands.get(idx) {
        Some(&spv::Operand::Id(id)) => Ok(id),
        _ => Err(invalid(format!(
            "{} expects an ID as operand #{idx}",
            inst.opcode
        ))),
    }
}

fn literal_operand(inst: &spv::InstWithIds, idx: usize) -> Result<spv::Literal> {
    match inst.operands.get(idx) {
        Some(&spv::Operand::Literal(literal)) => Ok(literal),
        _ => Err(invalid(format!(
            "{} expects a literal as operand #{idx}",
            inst.opcode
        ))),
    }
}

fn u32_operand(inst: &spv::InstWithIds, idx: usize) -> Result<u32> {
    match literal_operand(inst, idx)? {
        spv::Literal::Int(x) => u32::try_from(x).map_err(|_| {
            invalid(format!("{}: operand #{idx} ({x}) out of range", inst.opcode))
        }),
        literal @ spv::Literal::Float(_) => Err(invalid(format!(
            "{}: operand #{idx} ({literal}) must be an integer",
            inst.opcode
        ))),
    }
}

fn word_operand(inst: &spv::InstWithIds, idx: usize) -> Result<InternedStr> {
    match inst.operands.get(idx) {
        Some(&spv::Operand::Enumerant(word)) => Ok(word),
        _ => Err(invalid(format!(
            "{} expects an enumerant as operand #{idx}",
            inst.opcode
        ))),
    }
}

fn string_operand(inst: &spv::InstWithIds, idx: usize) -> Result<InternedStr> {
    match inst.operands.get(idx) {
        Some(&spv::Operand::String(s)) => Ok(s),
        _ => Err(invalid(format!(
            "{} expects a string as operand #{idx}",
            inst.opcode
        ))),
    }
}

fn type_of(id_defs: &FxHashMap<spv::Id, IdDef>, id: spv::Id) -> Result<Type> {
    match id_defs.get(&id) {
        Some(&IdDef::Type(ty)) => Ok(ty),
        Some(_) => Err(invalid(format!("%{id} is not a type"))),
        None => Err(invalid(format!("type %{id} used before its definition"))),
    }
}

/// A function (while its instructions are still being collected).
struct PendingFunc {
    id: spv::Id,
    func: Func,
    params: SmallVec<[spv::Id; 2]>,

    /// Everything from the first `OpLabel` up to (excluding) `OpFunctionEnd`.
    body_insts: Vec<spv::InstWithIds>,
}

/// Lowering of a single instruction in a function body, before its inputs
/// are resolved to [`Value`]s (which depends on where the instruction ends
/// up in the structured output).
pub enum LoweredInst {
    Node {
        op: InstOp,
        inputs: SmallVec<[spv::Id; 4]>,
        output: Option<Type>,
    },

    /// Instructions which are just another name for an existing value
    /// (e.g. `OpUndef`), and don't need a node.
    Value(Value),
}

/// Everything about the IDs used by one function, that is known before
/// structurizing it (i.e. independent of its control-flow).
pub struct FuncEnv<'a> {
    cx: &'a Context,
    id_defs: &'a FxHashMap<spv::Id, IdDef>,

    /// Index and type of every `OpFunctionParameter`.
    params: FxHashMap<spv::Id, (u32, Type)>,

    /// Result types of all the instructions in the function's blocks.
    local_types: FxHashMap<spv::Id, Type>,
}

impl<'a> FuncEnv<'a> {
    fn new(
        cx: &'a Context,
        id_defs: &'a FxHashMap<spv::Id, IdDef>,
        params: impl IntoIterator<Item = (spv::Id, Type)>,
        body_insts: &[spv::InstWithIds],
    ) -> Result<Self> {
        let params = params
            .into_iter()
            .enumerate()
            .map(|(idx, (id, ty))| (id, (idx as u32, ty)))
            .collect();
        let local_types = body_insts
            .iter()
            .filter_map(|inst| Some((inst.result_id?, inst.result_type_id?)))
            .map(|(id, ty)| Ok((id, type_of(id_defs, ty)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            cx,
            id_defs,
            params,
            local_types,
        })
    }

    /// The value of `id` if it's the same everywhere in the function (i.e.
    /// it's a constant or a parameter), `None` for IDs defined in blocks.
    pub fn value(&self, id: spv::Id) -> Option<Value> {
        if let Some(&(idx, _)) = self.params.get(&id) {
            return Some(Value::FuncParam { idx });
        }
        match self.id_defs.get(&id) {
            Some(&IdDef::Const(ct)) => Some(Value::Const(ct)),
            _ => None,
        }
    }

    pub fn id_type(&self, id: spv::Id) -> Result<Type> {
        if let Some(&ty) = self.local_types.get(&id) {
            return Ok(ty);
        }
        if let Some(&(_, ty)) = self.params.get(&id) {
            return Ok(ty);
        }
        match self.id_defs.get(&id) {
            Some(&IdDef::Const(ct)) => Ok(self.cx[ct].ty),
            Some(IdDef::Type(_)) => Err(invalid(format!("type %{id} used as a value"))),
            Some(IdDef::Func(_)) => Err(invalid(format!("function %{id} used as a value"))),
            Some(IdDef::Other(opcode)) => {
                Err(invalid(format!("result %{id} of {opcode} used as a value")))
            }
            None => Err(Error::MalformedFunction {
                block: None,
                reason: format!("%{id} is used but never defined"),
            }),
        }
    }

    pub fn lower_inst(&self, inst: &spv::InstWithIds) -> Result<LoweredInst> {
        use spec::Opcode as O;

        let output = inst
            .result_type_id
            .map(|ty| type_of(self.id_defs, ty))
            .transpose()?
            .filter(|&ty| self.cx[ty] != TypeDef::Void);
        let mut inputs: SmallVec<[spv::Id; 4]> = inst.id_operands().collect();

        let op = match inst.opcode {
            O::OpUndef => {
                let ty = output.ok_or_else(|| invalid("OpUndef of type void"))?;
                return Ok(LoweredInst::Value(Value::Const(self.cx.undef(ty))));
            }

            O::OpCopyObject => InstOp::Let,

            O::OpVariable => {
                let storage_class = &self.cx[word_operand(inst, 0)?];
                if spec::StorageClass::from_name(storage_class) != Some(spec::StorageClass::Function)
                {
                    return Err(Error::Unsupported {
                        reason: format!("`OpVariable` with `{storage_class}` storage in a function"),
                    });
                }
                InstOp::Var
            }
            O::OpLoad => InstOp::Load,
            O::OpStore => InstOp::Store,

            O::OpFunctionCall => {
                let callee = id_operand(inst, 0)?;
                let func = match self.id_defs.get(&callee) {
                    Some(&IdDef::Func(func)) => func,
                    _ => return Err(invalid(format!("OpFunctionCall of %{callee}, not a function"))),
                };
                inputs.remove(0);
                InstOp::Call(func)
            }

            O::OpIAdd | O::OpFAdd => InstOp::Binary(BinaryOp::Add),
            O::OpISub | O::OpFSub => InstOp::Binary(BinaryOp::Sub),
            O::OpIMul | O::OpFMul => InstOp::Binary(BinaryOp::Mul),
            O::OpUDiv | O::OpSDiv | O::OpFDiv => InstOp::Binary(BinaryOp::Div),
            O::OpUMod | O::OpSRem | O::OpSMod | O::OpFRem | O::OpFMod => {
                InstOp::Binary(BinaryOp::Mod)
            }
            O::OpLogicalAnd | O::OpBitwiseAnd => InstOp::Binary(BinaryOp::And),
            O::OpLogicalOr | O::OpBitwiseOr => InstOp::Binary(BinaryOp::Or),
            O::OpBitwiseXor => InstOp::Binary(BinaryOp::Xor),
            O::OpShiftLeftLogical => InstOp::Binary(BinaryOp::ShiftLeft),
            O::OpShiftRightLogical | O::OpShiftRightArithmetic => {
                InstOp::Binary(BinaryOp::ShiftRight)
            }
            O::OpLogicalEqual | O::OpIEqual | O::OpFOrdEqual => InstOp::Binary(BinaryOp::Equal),
            O::OpLogicalNotEqual | O::OpINotEqual | O::OpFOrdNotEqual => {
                InstOp::Binary(BinaryOp::NotEqual)
            }
            O::OpULessThan | O::OpSLessThan | O::OpFOrdLessThan => {
                InstOp::Binary(BinaryOp::LessThan)
            }
            O::OpULessThanEqual | O::OpSLessThanEqual | O::OpFOrdLessThanEqual => {
                InstOp::Binary(BinaryOp::LessThanEqual)
            }
            O::OpUGreaterThan | O::OpSGreaterThan | O::OpFOrdGreaterThan => {
                InstOp::Binary(BinaryOp::GreaterThan)
            }
            O::OpUGreaterThanEqual | O::OpSGreaterThanEqual | O::OpFOrdGreaterThanEqual => {
                InstOp::Binary(BinaryOp::GreaterThanEqual)
            }

            O::OpLogicalNot => InstOp::Unary(UnaryOp::Not),
            O::OpNot => InstOp::Unary(UnaryOp::Complement),
            O::OpSNegate | O::OpFNegate => InstOp::Unary(UnaryOp::Negation),

            O::OpSelect => {
                // `OpSelect %cond %true %false` becomes `select %false %true %cond`.
                if inputs.len() != 3 {
                    return Err(invalid("OpSelect expects 3 ID operands"));
                }
                inputs.swap(0, 2);
                InstOp::Select
            }

            O::OpCompositeConstruct => InstOp::Construct,
            O::OpCompositeExtract => {
                let indices = (1..inst.operands.len())
                    .map(|idx| u32_operand(inst, idx))
                    .collect::<Result<_>>()?;
                InstOp::Access(indices)
            }

            O::OpConvertFToU | O::OpConvertFToS | O::OpConvertSToF | O::OpConvertUToF => {
                InstOp::Convert
            }
            O::OpBitcast => InstOp::Bitcast,

            O::OpPhi => {
                return Err(Error::Unsupported {
                    reason: "`OpPhi` (values crossing constructs must go through memory \
                             or be used where they're visible)"
                        .into(),
                });
            }

            opcode => {
                return Err(Error::Unsupported {
                    reason: format!("{opcode} in a function body"),
                });
            }
        };

        Ok(LoweredInst::Node { op, inputs, output })
    }
}

impl crate::Module {
    /// Read SPIR-V assembly (see [`spv::read`]) and lower it, structurizing
    /// every function with a body, according to `config`.
    pub fn lower_from_spvasm(
        cx: Rc<Context>,
        text: &str,
        config: &structurize::Config,
    ) -> Result<Self> {
        let parser = spv::read::ModuleParser::read_from_spvasm_str(&cx, text)?;
        Self::lower_from_module_parser(cx.clone(), parser, config)
    }

    pub fn lower_from_module_parser(
        cx: Rc<Context>,
        mut parser: spv::read::ModuleParser<'_>,
        config: &structurize::Config,
    ) -> Result<Self> {
        let mut module = Self::new(cx.clone(), spv::Dialect::default());

        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
        enum Seq {
            Capability,
            Extension,
            ExtInstImport,
            MemoryModel,
            EntryPoint,
            ExecutionMode,
            DebugStringAndSource,
            DebugName,
            DebugModuleProcessed,
            Decoration,

            // NOTE(eddyb) not its own section, but only a "checkpoint", forcing
            // instructions following `OpLine`/`OpNoLine` into later sections.
            DebugLine,

            Globals,
            Functions,
        }
        let mut seq = None;

        let mut has_memory_model = false;
        let mut id_defs = FxHashMap::default();
        let mut names = FxHashMap::<spv::Id, InternedStr>::default();
        let mut entry_points = vec![];
        let mut workgroup_sizes = FxHashMap::<spv::Id, [u32; 3]>::default();
        let mut current_func: Option<PendingFunc> = None;
        let mut pending_funcs = vec![];

        for inst in parser.by_ref() {
            let inst = inst?;
            let opcode = inst.opcode;

            if opcode == spec::Opcode::OpNop {
                continue;
            }

            // Inside functions, everything (including `OpLine`) is kept for
            // the block graph, which knows to ignore debuginfo.
            if let Some(func) = &mut current_func {
                match opcode {
                    spec::Opcode::OpFunctionParameter => {
                        if !func.body_insts.is_empty() {
                            return Err(invalid("OpFunctionParameter after the first OpLabel"));
                        }
                        let idx = func.params.len();
                        let expected = module.funcs[func.func].params.get(idx).map(|p| p.ty);
                        let ty = type_of(&id_defs, inst.result_type_id.unwrap())?;
                        if expected != Some(ty) {
                            return Err(invalid(format!(
                                "OpFunctionParameter #{idx} of %{} doesn't match the function type",
                                func.id
                            )));
                        }
                        func.params.push(inst.result_id.unwrap());
                    }
                    spec::Opcode::OpFunctionEnd => {
                        let func = current_func.take().unwrap();
                        let expected = module.funcs[func.func].params.len();
                        if func.params.len() != expected {
                            return Err(invalid(format!(
                                "function %{} has {} OpFunctionParameter, expected {expected}",
                                func.id,
                                func.params.len()
                            )));
                        }
                        pending_funcs.push(func);
                    }
                    spec::Opcode::OpFunction => {
                        return Err(invalid("nested OpFunction while still in a function"));
                    }
                    _ if opcode.is_debuginfo() || opcode == spec::Opcode::OpLabel => {
                        func.body_insts.push(inst);
                    }
                    _ if func.body_insts.is_empty() => {
                        return Err(Error::MalformedFunction {
                            block: None,
                            reason: format!("{opcode} outside of any block"),
                        });
                    }
                    _ => func.body_insts.push(inst),
                }
                continue;
            }

            if opcode.is_debuginfo() {
                seq = seq.max(Some(Seq::DebugLine));
                continue;
            }

            let result_id = inst.result_id;
            let next_seq = match opcode {
                spec::Opcode::OpCapability => {
                    let cap = word_operand(&inst, 0)?;
                    module.dialect.capabilities.insert(cx[cap].to_string());
                    Seq::Capability
                }
                spec::Opcode::OpExtension => {
                    let ext = string_operand(&inst, 0)?;
                    module.dialect.extensions.insert(cx[ext].to_string());
                    Seq::Extension
                }
                spec::Opcode::OpExtInstImport => {
                    id_defs.insert(result_id.unwrap(), IdDef::Other(opcode));
                    Seq::ExtInstImport
                }
                spec::Opcode::OpMemoryModel => {
                    if has_memory_model {
                        return Err(invalid("duplicate OpMemoryModel"));
                    }
                    has_memory_model = true;
                    module.dialect.addressing_model = Some(cx[word_operand(&inst, 0)?].to_string());
                    module.dialect.memory_model = Some(cx[word_operand(&inst, 1)?].to_string());
                    Seq::MemoryModel
                }
                spec::Opcode::OpEntryPoint => {
                    let model_name = &cx[word_operand(&inst, 0)?];
                    let stage = spec::ExecutionModel::from_name(model_name).ok_or_else(|| {
                        invalid(format!("unknown execution model `{model_name}`"))
                    })?;
                    entry_points.push((id_operand(&inst, 1)?, stage, string_operand(&inst, 2)?));
                    Seq::EntryPoint
                }
                spec::Opcode::OpExecutionMode => {
                    let target = id_operand(&inst, 0)?;
                    if &cx[word_operand(&inst, 1)?] == "LocalSize" {
                        let size = (2..inst.operands.len().min(5))
                            .map(|idx| u32_operand(&inst, idx))
                            .collect::<Result<ArrayVec<u32, 3>>>()?;
                        let size = size
                            .into_inner()
                            .map_err(|_| invalid("LocalSize expects 3 operands"))?;
                        workgroup_sizes.insert(target, size);
                    }
                    Seq::ExecutionMode
                }
                spec::Opcode::OpString => {
                    id_defs.insert(result_id.unwrap(), IdDef::Other(opcode));
                    Seq::DebugStringAndSource
                }
                spec::Opcode::OpSource
                | spec::Opcode::OpSourceContinued
                | spec::Opcode::OpSourceExtension => Seq::DebugStringAndSource,
                spec::Opcode::OpName => {
                    names.insert(id_operand(&inst, 0)?, string_operand(&inst, 1)?);
                    Seq::DebugName
                }
                spec::Opcode::OpMemberName => Seq::DebugName,
                spec::Opcode::OpModuleProcessed => Seq::DebugModuleProcessed,
                spec::Opcode::OpDecorate | spec::Opcode::OpMemberDecorate => Seq::Decoration,

                spec::Opcode::OpTypeVoid
                | spec::Opcode::OpTypeBool
                | spec::Opcode::OpTypeInt
                | spec::Opcode::OpTypeFloat
                | spec::Opcode::OpTypeVector
                | spec::Opcode::OpTypePointer
                | spec::Opcode::OpTypeFunction => {
                    let ty = lower_type_def(&cx, &id_defs, &inst)?;
                    id_defs.insert(result_id.unwrap(), IdDef::Type(cx.intern(ty)));
                    Seq::Globals
                }

                spec::Opcode::OpConstantTrue
                | spec::Opcode::OpConstantFalse
                | spec::Opcode::OpConstant
                | spec::Opcode::OpConstantNull
                | spec::Opcode::OpConstantComposite => {
                    let ct = lower_const_def(&cx, &id_defs, &inst)?;
                    id_defs.insert(result_id.unwrap(), IdDef::Const(cx.intern(ct)));
                    Seq::Globals
                }

                // `OpUndef` can appear either among constants, or in a
                // function, so at most advance `seq` to globals.
                spec::Opcode::OpUndef => {
                    let ty = type_of(&id_defs, inst.result_type_id.unwrap())?;
                    id_defs.insert(result_id.unwrap(), IdDef::Const(cx.undef(ty)));
                    seq.max(Some(Seq::Globals)).unwrap()
                }

                spec::Opcode::OpVariable => {
                    return Err(Error::Unsupported {
                        reason: "module-scoped `OpVariable`".into(),
                    });
                }

                spec::Opcode::OpFunction => {
                    let func_id = result_id.unwrap();
                    let ret_type = type_of(&id_defs, inst.result_type_id.unwrap())?;
                    let func_type_id = id_operand(&inst, 1)?;
                    let params = match &cx[type_of(&id_defs, func_type_id)?] {
                        TypeDef::Func { ret, params } if *ret == ret_type => params
                            .iter()
                            .map(|&ty| FuncParam { ty })
                            .collect(),
                        _ => {
                            return Err(invalid(format!(
                                "OpFunction %{func_id}: %{func_type_id} is not \
                                 a function type returning its result type"
                            )));
                        }
                    };

                    let func = module.funcs.define(
                        &cx,
                        FuncDecl {
                            name: None,
                            ret_type,
                            params,
                            entry_point: None,
                            def: DeclDef::Imported,
                        },
                    );
                    module.func_order.push(func);
                    id_defs.insert(func_id, IdDef::Func(func));

                    current_func = Some(PendingFunc {
                        id: func_id,
                        func,
                        params: SmallVec::new(),
                        body_insts: vec![],
                    });
                    Seq::Functions
                }

                _ => {
                    return Err(invalid(format!("{opcode} outside of a function")));
                }
            };
            if !(seq <= Some(next_seq)) {
                return Err(invalid(format!(
                    "out of order: {next_seq:?} instructions must precede {seq:?} instructions",
                    seq = seq.unwrap(),
                )));
            }
            seq = Some(next_seq);
        }

        if !has_memory_model {
            return Err(invalid("missing OpMemoryModel"));
        }
        if let Some(func) = current_func {
            return Err(invalid(format!(
                "OpFunction %{} without matching OpFunctionEnd",
                func.id
            )));
        }

        for (&id, &name) in &names {
            if let Some(&IdDef::Func(func)) = id_defs.get(&id) {
                module.funcs[func].name = Some(name);
            }
        }
        for (target, stage, name) in entry_points {
            let func = match id_defs.get(&target) {
                Some(&IdDef::Func(func)) => func,
                _ => return Err(invalid(format!("OpEntryPoint %{target} is not a function"))),
            };
            module.funcs[func].entry_point = Some(EntryPoint {
                stage,
                name,
                workgroup_size: workgroup_sizes.get(&target).copied(),
            });
        }

        let structurizer = Structurizer::new(&cx, config);
        for pending in pending_funcs {
            if pending.body_insts.is_empty() {
                continue;
            }

            let func_name = match module.funcs[pending.func].name {
                Some(name) => cx[name].to_string(),
                None => parser
                    .id_names()
                    .get(&pending.id)
                    .cloned()
                    .unwrap_or_else(|| pending.id.to_string()),
            };
            let _span = debug_span!("structurize", func = %func_name).entered();

            let param_types = module.funcs[pending.func].params.iter().map(|p| p.ty);
            let env = FuncEnv::new(
                &cx,
                &id_defs,
                pending.params.iter().copied().zip(param_types),
                &pending.body_insts,
            );
            let body = env
                .and_then(|env| lower_func_body(&cx, &structurizer, &env, pending.body_insts))
                .map_err(|e| Error::in_function(func_name, e, parser.id_names()))?;
            module.funcs[pending.func].def = DeclDef::Present(body);
        }

        debug!(
            funcs = module.func_order.len(),
            capabilities = module.dialect.capabilities.len(),
            "lowered module"
        );
        Ok(module)
    }
}

fn lower_func_body(
    cx: &Context,
    structurizer: &Structurizer<'_>,
    env: &FuncEnv<'_>,
    body_insts: Vec<spv::InstWithIds>,
) -> Result<FuncDefBody> {
    let cfg = crate::cfg::ControlFlowGraph::from_func_insts(cx, body_insts)?;
    structurizer.structurize_func(&cfg, env)
}

fn lower_type_def(
    cx: &Context,
    id_defs: &FxHashMap<spv::Id, IdDef>,
    inst: &spv::InstWithIds,
) -> Result<TypeDef> {
    Ok(match inst.opcode {
        spec::Opcode::OpTypeVoid => TypeDef::Void,
        spec::Opcode::OpTypeBool => TypeDef::Bool,
        spec::Opcode::OpTypeInt => TypeDef::Int {
            width: u32_operand(inst, 0)?,
            signed: u32_operand(inst, 1)? != 0,
        },
        spec::Opcode::OpTypeFloat => TypeDef::Float {
            width: u32_operand(inst, 0)?,
        },
        spec::Opcode::OpTypeVector => TypeDef::Vector {
            elem: type_of(id_defs, id_operand(inst, 0)?)?,
            count: u32_operand(inst, 1)?,
        },
        spec::Opcode::OpTypePointer => {
            let storage_class = &cx[word_operand(inst, 0)?];
            TypeDef::Ptr {
                storage_class: spec::StorageClass::from_name(storage_class).ok_or_else(|| {
                    invalid(format!("unknown storage class `{storage_class}`"))
                })?,
                pointee: type_of(id_defs, id_operand(inst, 1)?)?,
            }
        }
        spec::Opcode::OpTypeFunction => TypeDef::Func {
            ret: type_of(id_defs, id_operand(inst, 0)?)?,
            params: inst
                .id_operands()
                .skip(1)
                .map(|id| type_of(id_defs, id))
                .collect::<Result<_>>()?,
        },
        opcode => unreachable!("spv::lower::lower_type_def: {opcode} is not a type"),
    })
}

fn lower_const_def(
    cx: &Context,
    id_defs: &FxHashMap<spv::Id, IdDef>,
    inst: &spv::InstWithIds,
) -> Result<ConstDef> {
    let ty = type_of(id_defs, inst.result_type_id.unwrap())?;
    let kind = match inst.opcode {
        spec::Opcode::OpConstantTrue | spec::Opcode::OpConstantFalse => {
            if cx[ty] != TypeDef::Bool {
                return Err(invalid(format!("{} of non-`bool` type", inst.opcode)));
            }
            ConstKind::Bool(inst.opcode == spec::Opcode::OpConstantTrue)
        }
        spec::Opcode::OpConstant => {
            let literal = literal_operand(inst, 0)?;
            match (&cx[ty], literal) {
                (TypeDef::Int { .. }, spv::Literal::Int(x)) => ConstKind::Int(x),
                (TypeDef::Float { .. }, _) => ConstKind::Float {
                    bits: literal.as_f64().to_bits(),
                },
                _ => {
                    return Err(invalid(format!(
                        "OpConstant %{}: literal `{literal}` doesn't fit its type",
                        inst.result_id.unwrap()
                    )));
                }
            }
        }
        spec::Opcode::OpConstantNull => ConstKind::Null,
        spec::Opcode::OpConstantComposite => ConstKind::Composite(
            inst.id_operands()
                .map(|id| match id_defs.get(&id) {
                    Some(&IdDef::Const(ct)) => Ok(ct),
                    _ => Err(invalid(format!(
                        "OpConstantComposite operand %{id} is not a constant"
                    ))),
                })
                .collect::<Result<_>>()?,
        ),
        opcode => unreachable!("spv::lower::lower_const_def: {opcode} is not a constant"),
    };
    Ok(ConstDef { ty, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Module, NodeKind, Terminator};

    const PRELUDE: &str = "
               OpCapability Shader
               OpMemoryModel Logical GLSL450
       %void = OpTypeVoid
       %bool = OpTypeBool
        %i32 = OpTypeInt 32 1
         %fn = OpTypeFunction %void
       %true = OpConstantTrue %bool
      %i32_1 = OpConstant %i32 1
    ";

    fn lower(text: &str) -> Result<Module> {
        Module::lower_from_spvasm(
            Rc::new(Context::new()),
            &format!("{PRELUDE}{text}"),
            &structurize::Config::DEFAULT,
        )
    }

    #[test]
    fn entry_point_and_names() {
        let module = Module::lower_from_spvasm(
            Rc::new(Context::new()),
            r#"
                   OpCapability Shader
                   OpMemoryModel Logical GLSL450
                   OpEntryPoint GLCompute %main "main"
                   OpExecutionMode %main LocalSize 8 4 1
                   OpName %main "main"
           %void = OpTypeVoid
             %fn = OpTypeFunction %void
           %main = OpFunction %void None %fn
          %entry = OpLabel
                   OpReturn
                   OpFunctionEnd
            "#,
            &structurize::Config::DEFAULT,
        )
        .unwrap();

        let cx = module.cx();
        assert!(module.dialect.capabilities.contains("Shader"));
        assert_eq!(module.dialect.memory_model.as_deref(), Some("GLSL450"));

        let func = &module.funcs[module.func_order[0]];
        assert_eq!(&cx[func.name.unwrap()], "main");
        let entry_point = func.entry_point.as_ref().unwrap();
        assert_eq!(entry_point.stage, spec::ExecutionModel::GLCompute);
        assert_eq!(entry_point.workgroup_size, Some([8, 4, 1]));

        let body = match &func.def {
            DeclDef::Present(body) => body,
            DeclDef::Imported => panic!("function body missing"),
        };
        assert!(matches!(
            body.blocks[body.body].terminator,
            Terminator::Return(None)
        ));
    }

    #[test]
    fn instructions_and_params() {
        let module = lower(
            "
          %fn_i = OpTypeFunction %i32 %i32
             %f = OpFunction %i32 None %fn_i
             %x = OpFunctionParameter %i32
            %10 = OpLabel
            %11 = OpIAdd %i32 %x %i32_1
            %12 = OpSelect %i32 %true %11 %x
            %13 = OpUndef %i32
                  OpReturnValue %12
                  OpFunctionEnd
        ",
        )
        .unwrap();

        let func = &module.funcs[module.func_order[0]];
        let body = match &func.def {
            DeclDef::Present(body) => body,
            DeclDef::Imported => panic!("function body missing"),
        };
        let block = &body.blocks[body.body];
        assert_eq!(block.nodes.len(), 2);

        let add = &body.nodes[block.nodes[0]];
        match &add.kind {
            NodeKind::Inst { op, inputs } => {
                assert!(*op == InstOp::Binary(BinaryOp::Add));
                assert_eq!(inputs[0], Value::FuncParam { idx: 0 });
            }
            _ => panic!("expected an instruction"),
        }

        // `select` takes the `false` value first, and the condition last.
        let select = &body.nodes[block.nodes[1]];
        match &select.kind {
            NodeKind::Inst { op, inputs } => {
                assert!(*op == InstOp::Select);
                assert_eq!(inputs[0], Value::FuncParam { idx: 0 });
                assert_eq!(
                    inputs[1],
                    Value::NodeOutput {
                        node: block.nodes[0],
                        output_idx: 0
                    }
                );
                assert!(matches!(inputs[2], Value::Const(_)));
            }
            _ => panic!("expected an instruction"),
        }
        assert!(matches!(
            block.terminator,
            Terminator::Return(Some(Value::NodeOutput { .. }))
        ));
    }

    #[test]
    fn declarations_without_blocks_are_imported() {
        let module = lower(
            "
            %f = OpFunction %void None %fn
                 OpFunctionEnd
        ",
        )
        .unwrap();
        let func = &module.funcs[module.func_order[0]];
        assert!(matches!(func.def, DeclDef::Imported));
    }

    #[test]
    fn module_errors() {
        let err = lower("%t2 = OpTypeBool\nOpCapability Shader").unwrap_err();
        assert!(err.to_string().contains("out of order"), "{err}");

        let err = Module::lower_from_spvasm(
            Rc::new(Context::new()),
            "OpCapability Shader",
            &structurize::Config::DEFAULT,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing OpMemoryModel"), "{err}");

        let err = lower(
            "
          %ptr = OpTypePointer Private %i32
            %g = OpVariable %ptr Private
        ",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }), "{err}");

        let err = lower("%f = OpFunction %void None %fn\n%l = OpLabel\nOpReturn").unwrap_err();
        assert!(err.to_string().contains("without matching OpFunctionEnd"), "{err}");
    }

    #[test]
    fn phi_is_unsupported() {
        let err = lower(
            "
     %with_phi = OpFunction %void None %fn
           %10 = OpLabel
                 OpBranch %20
           %20 = OpLabel
           %21 = OpPhi %i32 %i32_1 %10
                 OpReturn
                 OpFunctionEnd
        ",
        )
        .unwrap_err();
        match &err {
            Error::InFunction { func, source, .. } => {
                // No `OpName`, so the assembly name is used.
                assert_eq!(func, "with_phi");
                assert!(matches!(**source, Error::Unsupported { .. }), "{source}");
            }
            _ => panic!("unexpected error: {err}"),
        }
        assert!(!err.is_internal());
    }
}
