//! Textual serialization of the structured IR.
//!
//! The format is a small WGSL/Tint-like language, with one line per
//! instruction, structured node or terminator, and nested blocks indented:
//! ```text
//! %3:i32 = if %c [t: $B2, f: $B3] {  # if_1
//!   $B2: {  # true
//!     exit_if %2  # if_1
//!   }
//!   ...
//! ```
//!
//! Values (`%N`) and blocks (`$BN`) are numbered in the order they're first
//! printed, across the whole module (i.e. numbers are never reused between
//! functions), while structured nodes are numbered separately for each kind
//! (`if_N`, `switch_N`, `loop_N`).

use crate::func_at::FuncAt;
use crate::spv::spec::ExecutionModel;
use crate::{
    BinaryOp, Block, CaseSelector, Const, ConstKind, Context, DeclDef, Func, FuncDecl, InstOp,
    Module, Node, NodeKind, Terminator, Type, TypeDef, UnaryOp, Value,
};
use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt::Write;

impl Module {
    /// Print the whole module (all functions, in declaration order).
    pub fn print(&self) -> String {
        let mut printer = Printer::new(self);
        for (i, &func) in self.func_order.iter().enumerate() {
            if i > 0 {
                printer.out.push('\n');
            }
            printer.print_func_decl(func, &self.funcs[func]);
        }
        printer.out
    }
}

struct Printer<'a> {
    cx: &'a Context,
    module: &'a Module,

    out: String,
    indent: usize,

    next_value_idx: usize,
    next_block_idx: usize,

    func_names: FxHashMap<Func, String>,
    used_func_names: FxHashSet<String>,

    /// Names of the parameters of the function being printed.
    func_param_names: Vec<String>,

    value_names: FxHashMap<Value, String>,
    block_names: FxHashMap<Block, String>,

    /// `if_N`/`switch_N`/`loop_N` labels of structured nodes.
    node_labels: FxHashMap<Node, String>,
    node_counts: [usize; 3],
}

impl<'a> Printer<'a> {
    fn new(module: &'a Module) -> Self {
        Self {
            cx: module.cx_ref(),
            module,

            out: String::new(),
            indent: 0,

            next_value_idx: 1,
            next_block_idx: 1,

            func_names: FxHashMap::default(),
            used_func_names: FxHashSet::default(),
            func_param_names: vec![],
            value_names: FxHashMap::default(),
            block_names: FxHashMap::default(),
            node_labels: FxHashMap::default(),
            node_counts: [0; 3],
        }
    }

    fn fresh_value_name(&mut self) -> String {
        let name = format!("%{}", self.next_value_idx);
        self.next_value_idx += 1;
        name
    }

    fn func_name(&mut self, func: Func) -> String {
        if let Some(name) = self.func_names.get(&func) {
            return name.clone();
        }

        let name = match self.module.funcs[func].name {
            Some(name) => {
                // Named functions still take up a number.
                let idx = self.next_value_idx;
                self.next_value_idx += 1;

                let base = &self.cx[name];
                let mut name = format!("%{base}");
                if self.used_func_names.contains(&name) {
                    name = format!("%{base}_{idx}");
                }
                name
            }
            None => self.fresh_value_name(),
        };
        self.used_func_names.insert(name.clone());
        self.func_names.insert(func, name.clone());
        name
    }

    fn value_name(&mut self, v: Value) -> String {
        match v {
            Value::Const(ct) => self.const_to_string(ct),
            Value::FuncParam { idx } => match self.func_param_names.get(idx as usize) {
                Some(name) => name.clone(),
                None => format!("%<missing param {idx}>"),
            },
            Value::NodeOutput { .. } | Value::BlockParam { .. } => {
                if let Some(name) = self.value_names.get(&v) {
                    return name.clone();
                }
                let name = self.fresh_value_name();
                self.value_names.insert(v, name.clone());
                name
            }
        }
    }

    fn values_to_string(&mut self, values: &[Value]) -> String {
        values.iter().map(|&v| self.value_name(v)).join(", ")
    }

    fn block_name(&mut self, block: Block) -> String {
        if let Some(name) = self.block_names.get(&block) {
            return name.clone();
        }
        let name = format!("$B{}", self.next_block_idx);
        self.next_block_idx += 1;
        self.block_names.insert(block, name.clone());
        name
    }

    fn node_label(&mut self, node: Node, kind: &NodeKind) -> String {
        if let Some(label) = self.node_labels.get(&node) {
            return label.clone();
        }
        let (prefix, count) = match kind {
            NodeKind::Inst { .. } => unreachable!("print: instructions have no labels"),
            NodeKind::If { .. } => ("if", &mut self.node_counts[0]),
            NodeKind::Switch { .. } => ("switch", &mut self.node_counts[1]),
            NodeKind::Loop { .. } => ("loop", &mut self.node_counts[2]),
        };
        *count += 1;
        let label = format!("{prefix}_{count}");
        self.node_labels.insert(node, label.clone());
        label
    }

    fn line(&mut self, line: impl std::fmt::Display) {
        for _ in 0..self.indent {
            self.out += "  ";
        }
        // NOTE(eddyb) writing to a `String` can't fail.
        let _ = writeln!(self.out, "{line}");
    }

    fn type_to_string(&self, ty: Type) -> String {
        match &self.cx[ty] {
            TypeDef::Void => "void".into(),
            TypeDef::Bool => "bool".into(),
            &TypeDef::Int { width, signed } => format!("{}{width}", if signed { 'i' } else { 'u' }),
            &TypeDef::Float { width } => format!("f{width}"),
            &TypeDef::Vector { elem, count } => {
                format!("vec{count}<{}>", self.type_to_string(elem))
            }
            &TypeDef::Ptr {
                storage_class,
                pointee,
            } => format!(
                "ptr<{}, {}, read_write>",
                storage_class.print_name(),
                self.type_to_string(pointee)
            ),
            TypeDef::Func { ret, params } => format!(
                "fn({}) -> {}",
                params.iter().map(|&ty| self.type_to_string(ty)).format(", "),
                self.type_to_string(*ret)
            ),
        }
    }

    fn const_to_string(&self, ct: Const) -> String {
        let ct_def = &self.cx[ct];
        match &ct_def.kind {
            ConstKind::Bool(b) => b.to_string(),
            &ConstKind::Int(x) => self.scalar_to_string(ct_def.ty, x, 0.0),
            &ConstKind::Float { bits } => self.scalar_to_string(ct_def.ty, 0, f64::from_bits(bits)),
            ConstKind::Null => self.zero_to_string(ct_def.ty),
            ConstKind::Undef => "undef".into(),
            ConstKind::Composite(elems) => format!(
                "{}({})",
                self.type_to_string(ct_def.ty),
                elems.iter().map(|&elem| self.const_to_string(elem)).format(", ")
            ),
        }
    }

    /// Print a scalar literal of type `ty`, taking its value from `int` or
    /// `float`, whichever matches `ty`.
    fn scalar_to_string(&self, ty: Type, int: i64, float: f64) -> String {
        match self.cx[ty] {
            TypeDef::Int { signed: true, .. } => format!("{int}i"),
            TypeDef::Int { signed: false, .. } => format!("{int}u"),
            TypeDef::Float { width } => {
                let suffix = match width {
                    16 => "h",
                    32 => "f",
                    _ => "lf",
                };
                format!("{float:?}{suffix}")
            }
            _ => format!("{}({int})", self.type_to_string(ty)),
        }
    }

    fn zero_to_string(&self, ty: Type) -> String {
        match self.cx[ty] {
            TypeDef::Bool => "false".into(),
            TypeDef::Int { .. } | TypeDef::Float { .. } => self.scalar_to_string(ty, 0, 0.0),
            TypeDef::Vector { elem, count } => format!(
                "{}({})",
                self.type_to_string(ty),
                (0..count).map(|_| self.zero_to_string(elem)).format(", ")
            ),
            TypeDef::Void | TypeDef::Ptr { .. } | TypeDef::Func { .. } => {
                format!("{}(null)", self.type_to_string(ty))
            }
        }
    }

    fn print_func_decl(&mut self, func: Func, func_decl: &'a FuncDecl) {
        let name = self.func_name(func);

        self.func_param_names = func_decl
            .params
            .iter()
            .map(|_| self.fresh_value_name())
            .collect();
        let params = func_decl
            .params
            .iter()
            .zip(&self.func_param_names)
            .map(|(param, name)| format!("{name}:{}", self.type_to_string(param.ty)))
            .join(", ");

        let mut attrs = String::new();
        if let Some(entry_point) = &func_decl.entry_point {
            attrs += match entry_point.stage {
                ExecutionModel::GLCompute => "@compute ",
                ExecutionModel::Fragment => "@fragment ",
                ExecutionModel::Vertex => "@vertex ",
                ExecutionModel::TessellationControl
                | ExecutionModel::TessellationEvaluation
                | ExecutionModel::Geometry
                | ExecutionModel::Kernel => "",
            };
            if let Some([x, y, z]) = entry_point.workgroup_size {
                let _ = write!(attrs, "@workgroup_size({x}u, {y}u, {z}u) ");
            }
        }

        let sig = format!(
            "{name} = {attrs}func({params}):{}",
            self.type_to_string(func_decl.ret_type)
        );
        match &func_decl.def {
            DeclDef::Imported => self.line(format_args!("{sig}  # import")),
            DeclDef::Present(func_def_body) => {
                self.line(format_args!("{sig} {{"));
                self.indent += 1;
                self.print_block(func_def_body.at_body(), None);
                self.indent -= 1;
                self.line("}");
            }
        }
    }

    /// Print a block (its label, contents and closing brace), with `role`
    /// describing it relative to its parent node (if any).
    fn print_block(&mut self, func_at_block: FuncAt<'a, Block>, role: Option<&str>) {
        let block = func_at_block.position;
        let def = func_at_block.def();

        let name = self.block_name(block);
        let params = if def.params.is_empty() {
            String::new()
        } else {
            let params = (0..def.params.len() as u32)
                .map(|idx| {
                    let name = self.value_name(Value::BlockParam { block, idx });
                    format!("{name}:{}", self.type_to_string(def.params[idx as usize].ty))
                })
                .join(", ");
            format!(" ({params})")
        };
        match role {
            Some(role) => self.line(format_args!("{name}{params}: {{  # {role}")),
            None => self.line(format_args!("{name}{params}: {{")),
        }

        self.indent += 1;
        for func_at_node in func_at_block.at_nodes() {
            self.print_node(func_at_node);
        }
        self.print_terminator(func_at_block, &def.terminator);
        self.indent -= 1;

        self.line("}");
    }

    fn print_node(&mut self, func_at_node: FuncAt<'a, Node>) {
        let node = func_at_node.position;
        let def = func_at_node.def();

        let outputs = (0..def.outputs.len() as u32)
            .map(|output_idx| {
                let name = self.value_name(Value::NodeOutput { node, output_idx });
                format!("{name}:{}", self.type_to_string(def.outputs[output_idx as usize].ty))
            })
            .join(", ");
        let lhs = if outputs.is_empty() {
            outputs
        } else {
            outputs + " = "
        };

        match &def.kind {
            NodeKind::Inst { op, inputs } => {
                let op_name = match op {
                    InstOp::Call(func) => format!("call {}", self.func_name(*func)),
                    _ => inst_op_name(op).to_string(),
                };
                let mut operands = self.values_to_string(inputs);
                if let InstOp::Access(indices) = op {
                    operands = [operands]
                        .into_iter()
                        .chain(indices.iter().map(|idx| format!("{idx}u")))
                        .filter(|s| !s.is_empty())
                        .join(", ");
                }
                let sep = match (op, operands.is_empty()) {
                    (_, true) => "",
                    (InstOp::Call(_), false) => ", ",
                    (_, false) => " ",
                };
                self.line(format_args!("{lhs}{op_name}{sep}{operands}"));
            }
            &NodeKind::If {
                cond,
                then_block,
                else_block,
                control: _,
            } => {
                let label = self.node_label(node, &def.kind);
                let cond = self.value_name(cond);
                let (t, f) = (self.block_name(then_block), self.block_name(else_block));
                self.line(format_args!("{lhs}if {cond} [t: {t}, f: {f}] {{  # {label}"));
                self.indent += 1;
                self.print_block(func_at_node.at(then_block), Some("true"));
                self.print_block(func_at_node.at(else_block), Some("false"));
                self.indent -= 1;
                self.line("}");
            }
            NodeKind::Switch {
                selector,
                cases,
                control: _,
            } => {
                let label = self.node_label(node, &def.kind);
                let selector = self.value_name(*selector);
                let cases_str = cases
                    .iter()
                    .map(|case| {
                        let selectors = case
                            .selectors
                            .iter()
                            .map(|sel| match *sel {
                                CaseSelector::Literal(ct) => self.const_to_string(ct),
                                CaseSelector::Default => "default".into(),
                            })
                            .join(" ");
                        format!("c: ({selectors}, {})", self.block_name(case.block))
                    })
                    .join(", ");
                self.line(format_args!("{lhs}switch {selector} [{cases_str}] {{  # {label}"));
                self.indent += 1;
                for case in cases {
                    self.print_block(func_at_node.at(case.block), Some("case"));
                }
                self.indent -= 1;
                self.line("}");
            }
            &NodeKind::Loop {
                body,
                continuing,
                control: _,
            } => {
                let label = self.node_label(node, &def.kind);
                let (b, c) = (self.block_name(body), self.block_name(continuing));
                self.line(format_args!("{lhs}loop [b: {b}, c: {c}] {{  # {label}"));
                self.indent += 1;
                self.print_block(func_at_node.at(body), Some("body"));
                self.print_block(func_at_node.at(continuing), Some("continuing"));
                self.indent -= 1;
                self.line("}");
            }
        }
    }

    fn print_terminator(&mut self, func_at: FuncAt<'a, Block>, terminator: &Terminator) {
        let with_args = |printer: &mut Self, keyword: &str, args: &[Value]| {
            if args.is_empty() {
                keyword.to_string()
            } else {
                format!("{keyword} {}", printer.values_to_string(args))
            }
        };

        let line = match terminator {
            Terminator::Return(None) => "ret".to_string(),
            &Terminator::Return(Some(v)) => format!("ret {}", self.value_name(v)),
            Terminator::Unreachable => "unreachable".to_string(),
            Terminator::TerminateInvocation => "terminate_invocation".to_string(),
            Terminator::ExitIf { node, args }
            | Terminator::ExitSwitch { node, args }
            | Terminator::ExitLoop { node, args } => {
                let keyword = match terminator {
                    Terminator::ExitIf { .. } => "exit_if",
                    Terminator::ExitSwitch { .. } => "exit_switch",
                    _ => "exit_loop",
                };
                let label = self.node_label(*node, &func_at.at(*node).def().kind);
                format!("{}  # {label}", with_args(self, keyword, args))
            }
            Terminator::Continue { loop_node, args } => {
                let target = match func_at.at(*loop_node).def().kind {
                    NodeKind::Loop { continuing, .. } => self.block_name(continuing),
                    _ => unreachable!("print: `continue` of non-loop"),
                };
                format!("{}  # -> {target}", with_args(self, "continue", args))
            }
            &Terminator::NextIteration { loop_node } => {
                let target = match func_at.at(loop_node).def().kind {
                    NodeKind::Loop { body, .. } => self.block_name(body),
                    _ => unreachable!("print: `next_iteration` of non-loop"),
                };
                format!("next_iteration  # -> {target}")
            }
            Terminator::BreakIf {
                loop_node,
                cond,
                exit_args,
            } => {
                let loop_kind = &func_at.at(*loop_node).def().kind;
                let body = match *loop_kind {
                    NodeKind::Loop { body, .. } => self.block_name(body),
                    _ => unreachable!("print: `break_if` of non-loop"),
                };
                let label = self.node_label(*loop_node, loop_kind);
                let cond = self.value_name(*cond);
                let exit_args = if exit_args.is_empty() {
                    String::new()
                } else {
                    format!(" exit_loop: [{}]", self.values_to_string(exit_args))
                };
                format!("break_if {cond}{exit_args}  # -> [t: exit_loop {label}, f: {body}]")
            }
        };
        self.line(line);
    }
}

fn inst_op_name(op: &InstOp) -> &'static str {
    match op {
        InstOp::Let => "let",
        InstOp::Var => "var",
        InstOp::Load => "load",
        InstOp::Store => "store",
        InstOp::Call(_) => "call",
        InstOp::Binary(op) => match op {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::ShiftLeft => "shl",
            BinaryOp::ShiftRight => "shr",
            BinaryOp::Equal => "eq",
            BinaryOp::NotEqual => "neq",
            BinaryOp::LessThan => "lt",
            BinaryOp::LessThanEqual => "lte",
            BinaryOp::GreaterThan => "gt",
            BinaryOp::GreaterThanEqual => "gte",
        },
        InstOp::Unary(op) => match op {
            UnaryOp::Not => "not",
            UnaryOp::Negation => "negation",
            UnaryOp::Complement => "complement",
        },
        InstOp::Select => "select",
        InstOp::Construct => "construct",
        InstOp::Access(_) => "access",
        InstOp::Convert => "convert",
        InstOp::Bitcast => "bitcast",
    }
}

#[cfg(test)]
mod tests {
    use crate::{structurize, Context, Module};
    use std::rc::Rc;

    fn print_spvasm(text: &str) -> String {
        let module =
            Module::lower_from_spvasm(Rc::new(Context::new()), text, &structurize::Config::DEFAULT)
                .unwrap();
        module.print()
    }

    const PRELUDE: &str = "
               OpCapability Shader
               OpMemoryModel Logical GLSL450
";

    #[test]
    fn types_and_constants() {
        let out = print_spvasm(&format!(
            "{PRELUDE}
       %void = OpTypeVoid
        %i32 = OpTypeInt 32 1
        %u32 = OpTypeInt 32 0
        %f32 = OpTypeFloat 32
      %v2i32 = OpTypeVector %i32 2
         %fn = OpTypeFunction %v2i32 %u32 %f32
      %i32_1 = OpConstant %i32 -1
      %i32_2 = OpConstant %i32 2
      %f32_h = OpConstant %f32 0.5
       %pair = OpConstantComposite %v2i32 %i32_1 %i32_2
       %zero = OpConstantNull %v2i32
          %f = OpFunction %v2i32 None %fn
          %a = OpFunctionParameter %u32
          %b = OpFunctionParameter %f32
      %entry = OpLabel
        %sum = OpIAdd %v2i32 %pair %zero
        %mul = OpFMul %f32 %b %f32_h
               OpReturnValue %sum
               OpFunctionEnd
"
        ));
        pretty_assertions::assert_eq!(
            out,
            "\
%1 = func(%2:u32, %3:f32):vec2<i32> {
  $B1: {
    %4:vec2<i32> = add vec2<i32>(-1i, 2i), vec2<i32>(0i, 0i)
    %5:f32 = mul %3, 0.5f
    ret %4
  }
}
"
        );
    }

    #[test]
    fn named_funcs_and_calls() {
        let out = print_spvasm(&format!(
            "{PRELUDE}
               OpEntryPoint Fragment %main \"main\"
               OpName %main \"main\"
               OpName %helper \"helper\"
       %void = OpTypeVoid
        %i32 = OpTypeInt 32 1
     %fn_i32 = OpTypeFunction %i32
    %fn_void = OpTypeFunction %void
     %i32_7 = OpConstant %i32 7
       %main = OpFunction %void None %fn_void
      %entry = OpLabel
          %x = OpFunctionCall %i32 %helper
               OpReturn
               OpFunctionEnd
     %helper = OpFunction %i32 None %fn_i32
     %entry2 = OpLabel
               OpReturnValue %i32_7
               OpFunctionEnd
"
        ));
        pretty_assertions::assert_eq!(
            out,
            "\
%main = @fragment func():void {
  $B1: {
    %2:i32 = call %helper
    ret
  }
}

%helper = func():i32 {
  $B2: {
    ret 7i
  }
}
"
        );
    }
}
