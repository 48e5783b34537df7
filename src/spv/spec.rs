//! SPIR-V opcodes and enumerants (the subset understood by this crate).
//!
//! Unlike a full SPIR-V grammar, the opcode set here is closed: instructions
//! outside of it can't even be read, and the result shape of every opcode
//! (result ID, result type ID) is known statically.

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use std::fmt;

/// Whether an instruction defines a result ID, and if so, whether that result
/// is typed (i.e. a "Result Type" ID operand precedes all other operands).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultShape {
    None,
    Untyped,
    Typed,
}

macro_rules! def_opcodes {
    ($($name:ident = $op:literal $shape:ident),+ $(,)?) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name = $op),+
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),+];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),+
                }
            }

            pub fn result_shape(self) -> ResultShape {
                match self {
                    $(Opcode::$name => ResultShape::$shape),+
                }
            }
        }
    };
}

def_opcodes! {
    OpNop = 0 None,
    OpUndef = 1 Typed,
    OpSourceContinued = 2 None,
    OpSource = 3 None,
    OpSourceExtension = 4 None,
    OpName = 5 None,
    OpMemberName = 6 None,
    OpString = 7 Untyped,
    OpLine = 8 None,
    OpExtension = 10 None,
    OpExtInstImport = 11 Untyped,
    OpMemoryModel = 14 None,
    OpEntryPoint = 15 None,
    OpExecutionMode = 16 None,
    OpCapability = 17 None,

    OpTypeVoid = 19 Untyped,
    OpTypeBool = 20 Untyped,
    OpTypeInt = 21 Untyped,
    OpTypeFloat = 22 Untyped,
    OpTypeVector = 23 Untyped,
    OpTypePointer = 32 Untyped,
    OpTypeFunction = 33 Untyped,

    OpConstantTrue = 41 Typed,
    OpConstantFalse = 42 Typed,
    OpConstant = 43 Typed,
    OpConstantComposite = 44 Typed,
    OpConstantNull = 46 Typed,

    OpFunction = 54 Typed,
    OpFunctionParameter = 55 Typed,
    OpFunctionEnd = 56 None,
    OpFunctionCall = 57 Typed,

    OpVariable = 59 Typed,
    OpLoad = 61 Typed,
    OpStore = 62 None,

    OpDecorate = 71 None,
    OpMemberDecorate = 72 None,

    OpCompositeConstruct = 80 Typed,
    OpCompositeExtract = 81 Typed,
    OpCopyObject = 83 Typed,

    OpConvertFToU = 109 Typed,
    OpConvertFToS = 110 Typed,
    OpConvertSToF = 111 Typed,
    OpConvertUToF = 112 Typed,
    OpBitcast = 124 Typed,

    OpSNegate = 126 Typed,
    OpFNegate = 127 Typed,
    OpIAdd = 128 Typed,
    OpFAdd = 129 Typed,
    OpISub = 130 Typed,
    OpFSub = 131 Typed,
    OpIMul = 132 Typed,
    OpFMul = 133 Typed,
    OpUDiv = 134 Typed,
    OpSDiv = 135 Typed,
    OpFDiv = 136 Typed,
    OpUMod = 137 Typed,
    OpSRem = 138 Typed,
    OpSMod = 139 Typed,
    OpFRem = 140 Typed,
    OpFMod = 141 Typed,

    OpLogicalEqual = 164 Typed,
    OpLogicalNotEqual = 165 Typed,
    OpLogicalOr = 166 Typed,
    OpLogicalAnd = 167 Typed,
    OpLogicalNot = 168 Typed,
    OpSelect = 169 Typed,
    OpIEqual = 170 Typed,
    OpINotEqual = 171 Typed,
    OpUGreaterThan = 172 Typed,
    OpSGreaterThan = 173 Typed,
    OpUGreaterThanEqual = 174 Typed,
    OpSGreaterThanEqual = 175 Typed,
    OpULessThan = 176 Typed,
    OpSLessThan = 177 Typed,
    OpULessThanEqual = 178 Typed,
    OpSLessThanEqual = 179 Typed,
    OpFOrdEqual = 180 Typed,
    OpFOrdNotEqual = 182 Typed,
    OpFOrdLessThan = 184 Typed,
    OpFOrdGreaterThan = 186 Typed,
    OpFOrdLessThanEqual = 188 Typed,
    OpFOrdGreaterThanEqual = 190 Typed,

    OpShiftRightLogical = 194 Typed,
    OpShiftRightArithmetic = 195 Typed,
    OpShiftLeftLogical = 196 Typed,
    OpBitwiseOr = 197 Typed,
    OpBitwiseXor = 198 Typed,
    OpBitwiseAnd = 199 Typed,
    OpNot = 200 Typed,

    OpPhi = 245 Typed,
    OpLoopMerge = 246 None,
    OpSelectionMerge = 247 None,
    OpLabel = 248 Untyped,
    OpBranch = 249 None,
    OpBranchConditional = 250 None,
    OpSwitch = 251 None,
    OpKill = 252 None,
    OpReturn = 253 None,
    OpReturnValue = 254 None,
    OpUnreachable = 255 None,

    OpNoLine = 317 None,
    OpModuleProcessed = 330 None,
    OpTerminateInvocation = 4416 None,
}

lazy_static! {
    static ref OPCODES_BY_NAME: FxHashMap<&'static str, Opcode> =
        Opcode::ALL.iter().map(|&opcode| (opcode.name(), opcode)).collect();
}

impl Opcode {
    pub fn from_name(name: &str) -> Option<Self> {
        OPCODES_BY_NAME.get(name).copied()
    }

    /// Whether this opcode ends a block (and so can only appear last in it).
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::OpBranch
                | Opcode::OpBranchConditional
                | Opcode::OpSwitch
                | Opcode::OpReturn
                | Opcode::OpReturnValue
                | Opcode::OpUnreachable
                | Opcode::OpKill
                | Opcode::OpTerminateInvocation
        )
    }

    /// Whether this opcode is `OpSelectionMerge` or `OpLoopMerge`, which must
    /// immediately precede the terminator of a structured construct's header.
    pub fn is_merge(self) -> bool {
        matches!(self, Opcode::OpSelectionMerge | Opcode::OpLoopMerge)
    }

    /// Debuginfo-only opcodes, which may appear anywhere and carry no semantics.
    pub fn is_debuginfo(self) -> bool {
        matches!(self, Opcode::OpLine | Opcode::OpNoLine | Opcode::OpNop)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! def_enumerants {
    ($($(#[$attr:meta])* $group:ident { $($name:ident),+ $(,)? })+) => {$(
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $group {
            $($name),+
        }

        impl $group {
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($name) => Some($group::$name),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($group::$name => stringify!($name)),+
                }
            }
        }
    )+};
}

def_enumerants! {
    /// `SelectionControl` mask (only the hint itself, combinations are rejected).
    SelectionControl { None, Flatten, DontFlatten }

    /// `LoopControl` mask, reduced to its unrolling hint (other bits, e.g.
    /// `DependencyInfinite`, are accepted but not preserved).
    LoopControl { None, Unroll, DontUnroll }

    StorageClass {
        UniformConstant,
        Input,
        Uniform,
        Output,
        Workgroup,
        CrossWorkgroup,
        Private,
        Function,
        Generic,
        PushConstant,
        AtomicCounter,
        Image,
        StorageBuffer,
    }

    ExecutionModel {
        Vertex,
        TessellationControl,
        TessellationEvaluation,
        Geometry,
        Fragment,
        GLCompute,
        Kernel,
    }
}

impl LoopControl {
    /// Parse a (possibly `|`-combined) `LoopControl` operand.
    pub fn from_mask(mask: &str) -> Option<Self> {
        let mut control = LoopControl::None;
        for bit in mask.split('|') {
            match LoopControl::from_name(bit) {
                Some(LoopControl::None) => {}
                Some(hint) => control = hint,
                None => match bit {
                    "DependencyInfinite" | "DependencyLength" | "MinIterations"
                    | "MaxIterations" | "IterationMultiple" | "PeelCount"
                    | "PartialCount" => {}
                    _ => return None,
                },
            }
        }
        Some(control)
    }
}

impl StorageClass {
    /// Name of this storage class in the printed IR (e.g. `ptr<function, ...>`).
    pub fn print_name(self) -> &'static str {
        match self {
            StorageClass::UniformConstant => "handle",
            StorageClass::Input => "__in",
            StorageClass::Uniform => "uniform",
            StorageClass::Output => "__out",
            StorageClass::Workgroup => "workgroup",
            StorageClass::CrossWorkgroup => "cross_workgroup",
            StorageClass::Private => "private",
            StorageClass::Function => "function",
            StorageClass::Generic => "generic",
            StorageClass::PushConstant => "push_constant",
            StorageClass::AtomicCounter => "atomic_counter",
            StorageClass::Image => "image",
            StorageClass::StorageBuffer => "storage",
        }
    }
}
