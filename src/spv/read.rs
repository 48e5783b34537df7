//! Low-level parsing of SPIR-V assembly (the `spirv-as` text form).

use crate::spv::{self, spec};
use crate::{Context, Error, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::num::NonZeroU32;

/// One lexical token of an assembly line.
#[derive(Clone, Debug, PartialEq)]
enum Token<'a> {
    /// `%name` (without the `%`).
    Id(&'a str),

    /// `=` (only valid after a result ID).
    Eq,

    Literal(spv::Literal),

    /// Quoted string, with escapes already processed.
    String(Cow<'a, str>),

    /// Any other bare word: opcodes and enumerants.
    Word(&'a str),
}

enum InstParseError {
    UnterminatedString,
    InvalidLiteral(String),
    InvalidId(String),
    UnknownOpcode(String),
    MissingOpcode,
    MissingResultId { opcode: spec::Opcode },
    UnexpectedResultId { opcode: spec::Opcode },
    MissingResultType { opcode: spec::Opcode },
    DuplicateResultId(String),
}

impl InstParseError {
    fn message(&self) -> Cow<'static, str> {
        match self {
            Self::UnterminatedString => "unterminated string literal".into(),
            Self::InvalidLiteral(s) => format!("invalid numeric literal `{s}`").into(),
            Self::InvalidId(s) => format!("invalid ID `%{s}`").into(),
            Self::UnknownOpcode(s) => format!("unknown or unsupported opcode `{s}`").into(),
            Self::MissingOpcode => "expected an opcode".into(),
            Self::MissingResultId { opcode } => format!("{opcode} requires a result ID").into(),
            Self::UnexpectedResultId { opcode } => {
                format!("{opcode} does not produce a result ID").into()
            }
            Self::MissingResultType { opcode } => {
                format!("{opcode} requires a result type ID operand").into()
            }
            Self::DuplicateResultId(name) => {
                format!("ID %{name} is a result of multiple instructions").into()
            }
        }
    }
}

fn tokenize(line: &str) -> std::result::Result<SmallVec<[Token<'_>; 8]>, InstParseError> {
    let mut tokens = SmallVec::new();
    let mut rest = line;
    loop {
        rest = rest.trim_start();
        let Some(c) = rest.chars().next() else {
            break;
        };
        if c == ';' {
            break;
        }
        if c == '"' {
            let mut value = String::new();
            let mut chars = rest[1..].char_indices();
            let end = loop {
                match chars.next() {
                    Some((i, '"')) => break i + 1,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, escaped)) => value.push(escaped),
                        None => return Err(InstParseError::UnterminatedString),
                    },
                    Some((_, c)) => value.push(c),
                    None => return Err(InstParseError::UnterminatedString),
                }
            };
            tokens.push(Token::String(value.into()));
            rest = &rest[end + 1..];
            continue;
        }

        let len = rest
            .find(|c: char| c.is_whitespace() || c == ';' || c == '"')
            .unwrap_or(rest.len());
        let (word, after) = rest.split_at(len);
        rest = after;

        tokens.push(if word == "=" {
            Token::Eq
        } else if let Some(name) = word.strip_prefix('%') {
            if name.is_empty() {
                return Err(InstParseError::InvalidId(name.to_string()));
            }
            Token::Id(name)
        } else if word.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+') {
            Token::Literal(
                parse_literal(word).ok_or_else(|| InstParseError::InvalidLiteral(word.into()))?,
            )
        } else {
            Token::Word(word)
        });
    }
    Ok(tokens)
}

fn parse_literal(s: &str) -> Option<spv::Literal> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let x = i64::try_from(u64::from_str_radix(hex, 16).ok()?).ok()?;
        return Some(spv::Literal::Int(if negative { -x } else { x }));
    }
    if digits.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
        let x: f64 = s.parse().ok()?;
        return Some(spv::Literal::Float(x.to_bits()));
    }
    s.parse().ok().map(spv::Literal::Int)
}

/// Iterator over the instructions of a SPIR-V assembly module, one per line.
///
/// Textual `%name`s are mapped to numeric [`spv::Id`]s: `%<N>` (decimal, as
/// emitted by `spirv-dis --raw-id`) keeps its number, and any other name gets
/// a fresh one (above all such numbers), in order of first appearance.
pub struct ModuleParser<'a> {
    cx: &'a Context,

    lines: std::iter::Enumerate<std::str::Lines<'a>>,

    ids_by_name: FxHashMap<&'a str, spv::Id>,
    next_fresh_id: u32,

    /// IDs defined so far in the module.
    defined_ids: FxHashSet<spv::Id>,

    /// Original `%name` of every ID seen so far.
    id_names: FxHashMap<spv::Id, String>,
}

impl<'a> ModuleParser<'a> {
    pub fn read_from_spvasm_str(cx: &'a Context, text: &'a str) -> Result<Self> {
        // Reserve every numeric `%<N>` up-front, so fresh IDs never collide.
        let mut max_numeric_id = 0;
        for (line_idx, line) in text.lines().enumerate() {
            let tokens = tokenize(line).map_err(|e| Error::Parse {
                line: line_idx + 1,
                reason: e.message().into_owned(),
            })?;
            for token in tokens {
                if let Token::Id(name) = token {
                    if let Ok(n) = name.parse::<u32>() {
                        max_numeric_id = max_numeric_id.max(n);
                    }
                }
            }
        }

        Ok(Self {
            cx,
            lines: text.lines().enumerate(),
            ids_by_name: FxHashMap::default(),
            next_fresh_id: max_numeric_id + 1,
            defined_ids: FxHashSet::default(),
            id_names: FxHashMap::default(),
        })
    }

    /// Original `%name` (without the `%`) of every ID parsed so far.
    pub fn id_names(&self) -> &FxHashMap<spv::Id, String> {
        &self.id_names
    }

    fn id(&mut self, name: &'a str) -> std::result::Result<spv::Id, InstParseError> {
        if let Some(&id) = self.ids_by_name.get(name) {
            return Ok(id);
        }
        let id = match name.parse::<u32>() {
            Ok(n) => NonZeroU32::new(n).ok_or_else(|| InstParseError::InvalidId(name.into()))?,
            Err(_) => {
                let id = NonZeroU32::new(self.next_fresh_id)
                    .ok_or_else(|| InstParseError::InvalidId(name.into()))?;
                self.next_fresh_id = self
                    .next_fresh_id
                    .checked_add(1)
                    .ok_or_else(|| InstParseError::InvalidId(name.into()))?;
                id
            }
        };
        self.ids_by_name.insert(name, id);
        self.id_names.insert(id, name.to_string());
        Ok(id)
    }

    fn inst(
        &mut self,
        tokens: SmallVec<[Token<'a>; 8]>,
    ) -> std::result::Result<spv::InstWithIds, InstParseError> {
        let mut tokens = tokens.into_iter().peekable();

        let first = tokens.next();
        let followed_by_eq = matches!(tokens.peek(), Some(Token::Eq));
        let result_name = match first {
            Some(Token::Id(name)) if followed_by_eq => {
                tokens.next();
                Some(name)
            }
            Some(Token::Word(word)) => {
                return self.inst_after_result(None, word, tokens);
            }
            _ => return Err(InstParseError::MissingOpcode),
        };
        match tokens.next() {
            Some(Token::Word(word)) => self.inst_after_result(result_name, word, tokens),
            _ => Err(InstParseError::MissingOpcode),
        }
    }

    fn inst_after_result(
        &mut self,
        result_name: Option<&'a str>,
        opcode_name: &str,
        mut operand_tokens: impl Iterator<Item = Token<'a>>,
    ) -> std::result::Result<spv::InstWithIds, InstParseError> {
        let opcode = spec::Opcode::from_name(opcode_name)
            .ok_or_else(|| InstParseError::UnknownOpcode(opcode_name.into()))?;

        let shape = opcode.result_shape();
        let result_id = match (result_name, shape) {
            (Some(name), spec::ResultShape::Untyped | spec::ResultShape::Typed) => {
                let id = self.id(name)?;
                if !self.defined_ids.insert(id) {
                    return Err(InstParseError::DuplicateResultId(name.into()));
                }
                Some(id)
            }
            (None, spec::ResultShape::None) => None,
            (None, _) => return Err(InstParseError::MissingResultId { opcode }),
            (Some(_), spec::ResultShape::None) => {
                return Err(InstParseError::UnexpectedResultId { opcode });
            }
        };

        let result_type_id = if shape == spec::ResultShape::Typed {
            match operand_tokens.next() {
                Some(Token::Id(name)) => Some(self.id(name)?),
                _ => return Err(InstParseError::MissingResultType { opcode }),
            }
        } else {
            None
        };

        let mut operands = SmallVec::new();
        for token in operand_tokens {
            operands.push(match token {
                Token::Id(name) => spv::Operand::Id(self.id(name)?),
                Token::Literal(literal) => spv::Operand::Literal(literal),
                Token::String(s) => spv::Operand::String(self.cx.intern(&*s)),
                Token::Word(word) => spv::Operand::Enumerant(self.cx.intern(word)),
                Token::Eq => return Err(InstParseError::InvalidLiteral("=".into())),
            });
        }

        Ok(spv::InstWithIds {
            opcode,
            result_type_id,
            result_id,
            operands,
        })
    }
}

impl Iterator for ModuleParser<'_> {
    type Item = Result<spv::InstWithIds>;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line_idx, line) = self.lines.next()?;
            let invalid = |e: InstParseError| Error::Parse {
                line: line_idx + 1,
                reason: e.message().into_owned(),
            };

            let tokens = match tokenize(line) {
                Ok(tokens) => tokens,
                Err(e) => return Some(Err(invalid(e))),
            };
            if tokens.is_empty() {
                continue;
            }
            return Some(self.inst(tokens).map_err(invalid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_all(cx: &Context, text: &str) -> Result<Vec<spv::InstWithIds>> {
        ModuleParser::read_from_spvasm_str(cx, text)?.collect()
    }

    #[test]
    fn numeric_ids_are_kept_and_names_are_fresh() {
        let cx = Context::new();
        let mut parser = ModuleParser::read_from_spvasm_str(
            &cx,
            "
                %void = OpTypeVoid   ; comment
                  %20 = OpTypeBool
                %true = OpConstantTrue %20
            ",
        )
        .unwrap();
        let insts: Vec<_> = parser.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(insts.len(), 3);

        assert_eq!(insts[0].result_id, NonZeroU32::new(21));
        assert_eq!(insts[1].result_id, NonZeroU32::new(20));
        assert_eq!(insts[2].result_type_id, NonZeroU32::new(20));
        assert_eq!(insts[2].result_id, NonZeroU32::new(22));
        assert_eq!(parser.id_names()[&NonZeroU32::new(22).unwrap()], "true");
    }

    #[test]
    fn operands() {
        let cx = Context::new();
        let insts = parse_all(
            &cx,
            r#"
                OpEntryPoint GLCompute %main "main\"x"
                OpLoopMerge %merge %cont Unroll|DependencyInfinite
                OpSwitch %sel %default -1 %a 0x10 %b
                %f = OpConstant %f32 1.5
            "#,
        )
        .unwrap();

        assert_eq!(insts[0].opcode, spec::Opcode::OpEntryPoint);
        assert_eq!(
            insts[0].operands[2],
            spv::Operand::String(cx.intern("main\"x"))
        );
        assert_eq!(
            insts[1].operands[2],
            spv::Operand::Enumerant(cx.intern("Unroll|DependencyInfinite"))
        );
        assert_eq!(insts[2].operands[2], spv::Operand::Literal(spv::Literal::Int(-1)));
        assert_eq!(insts[2].operands[4], spv::Operand::Literal(spv::Literal::Int(16)));
        assert_eq!(
            insts[3].operands[0],
            spv::Operand::Literal(spv::Literal::Float(1.5f64.to_bits()))
        );
    }

    #[test]
    fn errors_carry_line_numbers() {
        let cx = Context::new();
        let err = parse_all(&cx, "%void = OpTypeVoid\n%x = OpFrobnicate\n").unwrap_err();
        match err {
            Error::Parse { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("OpFrobnicate"), "{reason}");
            }
            _ => panic!("unexpected error: {err}"),
        }

        assert!(parse_all(&cx, "OpReturn %x = OpTypeVoid").is_err());
        assert!(parse_all(&cx, "%x = OpReturn").is_err());
        assert!(parse_all(&cx, "%a = OpTypeVoid\n%a = OpTypeBool").is_err());
        assert!(parse_all(&cx, "OpName %a \"unterminated").is_err());
    }
}
