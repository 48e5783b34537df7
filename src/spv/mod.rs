//! SPIR-V support, mainly reading SPIR-V assembly ([`read`]) and lowering
//! it into structured IR ([`lower`]).

// NOTE(eddyb) all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod lower;
pub mod read;
pub mod spec;

use crate::InternedStr;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU32;

/// Semantic properties of a SPIR-V module (not tied to any IDs).
#[derive(Clone, Default)]
pub struct Dialect {
    pub capabilities: BTreeSet<String>,
    pub extensions: BTreeSet<String>,

    pub addressing_model: Option<String>,
    pub memory_model: Option<String>,
}

/// SPIR-V ID.
pub type Id = NonZeroU32;

/// A full SPIR-V instruction, as read from SPIR-V assembly (opcode, result
/// ID/type, and all other operands, in their original order).
#[derive(Clone, Debug, PartialEq)]
pub struct InstWithIds {
    pub opcode: spec::Opcode,

    // FIXME(eddyb) consider nesting "Result Type ID" in "Result ID".
    pub result_type_id: Option<Id>,
    pub result_id: Option<Id>,

    pub operands: SmallVec<[Operand; 4]>,
}

impl InstWithIds {
    /// All ID operands (excluding the result type/result IDs), in order.
    pub fn id_operands(&self) -> impl Iterator<Item = Id> + '_ {
        self.operands.iter().filter_map(|operand| match *operand {
            Operand::Id(id) => Some(id),
            _ => None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Operand {
    Id(Id),
    Literal(Literal),

    /// Enumerant word(s), e.g. `None`, `Function` or `Unroll|DependencyInfinite`.
    Enumerant(InternedStr),

    String(InternedStr),
}

/// Numeric literal operand (exact integer, or floating-point).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Literal {
    Int(i64),

    /// `f64` bit-pattern.
    Float(u64),
}

impl Literal {
    pub fn as_f64(self) -> f64 {
        match self {
            Literal::Int(x) => x as f64,
            Literal::Float(bits) => f64::from_bits(bits),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Literal::Int(x) => write!(f, "{x}"),
            Literal::Float(bits) => write!(f, "{:?}", f64::from_bits(bits)),
        }
    }
}
