//! Check structurized functions against the unstructured CFG they came from,
//! by interpreting both (for every assignment of their `bool` parameters) and
//! comparing the observable behavior: the sequence of `%mark` calls, followed
//! by how execution ended.

use rustc_hash::FxHashMap;
use spv_structurize::spv::{self, spec::Opcode};
use spv_structurize::structurize::Config;
use spv_structurize::{
    BinaryOp, Block, CaseSelector, ConstKind, Context, DeclDef, FuncDefBody, InstOp, Module, Node,
    NodeKind, Terminator, UnaryOp, Value,
};
use std::rc::Rc;

/// Blocks (or structured regions) entered before giving up on termination.
const FUEL: usize = 2000;

/// `%mark` calls observed before giving up on termination.
const MAX_EVENTS: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Val {
    Bool(bool),
    Int(i64),
    Ptr(usize),
    Undef,
}

impl Val {
    fn bool(self) -> bool {
        match self {
            Val::Bool(b) => b,
            v => panic!("expected bool, found {v:?}"),
        }
    }
    fn int(self) -> i64 {
        match self {
            Val::Int(x) => x,
            v => panic!("expected integer, found {v:?}"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Outcome {
    Returned,
    Unreachable,
    Killed,
    TooManyEvents,
    OutOfFuel,
}

#[derive(Debug, PartialEq, Eq)]
struct Trace {
    events: Vec<i64>,
    outcome: Outcome,
}

struct SpvFunc {
    name: String,
    params: Vec<spv::Id>,
    entry: spv::Id,
    blocks: FxHashMap<spv::Id, Vec<spv::InstWithIds>>,
}

/// Split the (non-imported) functions of `text` into their blocks, also
/// collecting the values of all scalar constants.
fn read_spv_funcs(text: &str) -> (FxHashMap<spv::Id, Val>, Vec<SpvFunc>) {
    let cx = Context::new();
    let mut parser = spv::read::ModuleParser::read_from_spvasm_str(&cx, text).unwrap();
    let insts = parser.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
    let names = parser.id_names();

    let mut consts = FxHashMap::default();
    let mut funcs = vec![];
    let mut current: Option<SpvFunc> = None;
    let mut current_block = None;
    for inst in insts {
        match inst.opcode {
            Opcode::OpConstantTrue => {
                consts.insert(inst.result_id.unwrap(), Val::Bool(true));
            }
            Opcode::OpConstantFalse => {
                consts.insert(inst.result_id.unwrap(), Val::Bool(false));
            }
            Opcode::OpConstant => {
                let x = match inst.operands[0] {
                    spv::Operand::Literal(spv::Literal::Int(x)) => x,
                    _ => unreachable!(),
                };
                consts.insert(inst.result_id.unwrap(), Val::Int(x));
            }
            Opcode::OpFunction => {
                let id = inst.result_id.unwrap();
                current = Some(SpvFunc {
                    name: names.get(&id).cloned().unwrap_or_else(|| id.to_string()),
                    params: vec![],
                    entry: id,
                    blocks: FxHashMap::default(),
                });
                current_block = None;
            }
            Opcode::OpFunctionParameter => {
                current.as_mut().unwrap().params.push(inst.result_id.unwrap());
            }
            Opcode::OpFunctionEnd => {
                let func = current.take().unwrap();
                if !func.blocks.is_empty() {
                    funcs.push(func);
                }
            }
            Opcode::OpLabel => {
                let func = current.as_mut().unwrap();
                let label = inst.result_id.unwrap();
                if func.blocks.is_empty() {
                    func.entry = label;
                }
                func.blocks.insert(label, vec![]);
                current_block = Some(label);
            }
            _ => {
                if let Some(label) = current_block {
                    current.as_mut().unwrap().blocks.get_mut(&label).unwrap().push(inst);
                }
            }
        }
    }
    (consts, funcs)
}

fn run_spv(func: &SpvFunc, consts: &FxHashMap<spv::Id, Val>, args: &[bool]) -> Trace {
    let mut vals = consts.clone();
    vals.extend(func.params.iter().zip(args).map(|(&id, &b)| (id, Val::Bool(b))));

    let mut events = vec![];
    let mut block = func.entry;
    for _ in 0..FUEL {
        let mut next = None;
        for inst in &func.blocks[&block] {
            let ids = inst.id_operands().collect::<Vec<_>>();
            let val = |id: spv::Id| vals[&id];
            let result = match inst.opcode {
                Opcode::OpSelectionMerge | Opcode::OpLoopMerge => None,
                Opcode::OpFunctionCall => {
                    events.push(val(ids[1]).int());
                    if events.len() > MAX_EVENTS {
                        return Trace {
                            events,
                            outcome: Outcome::TooManyEvents,
                        };
                    }
                    None
                }
                Opcode::OpLogicalNot => Some(Val::Bool(!val(ids[0]).bool())),
                Opcode::OpLogicalOr => Some(Val::Bool(val(ids[0]).bool() || val(ids[1]).bool())),
                Opcode::OpLogicalAnd => Some(Val::Bool(val(ids[0]).bool() && val(ids[1]).bool())),
                Opcode::OpSelect => Some(if val(ids[0]).bool() {
                    val(ids[1])
                } else {
                    val(ids[2])
                }),
                Opcode::OpBranch => {
                    next = Some(ids[0]);
                    None
                }
                Opcode::OpBranchConditional => {
                    next = Some(if val(ids[0]).bool() { ids[1] } else { ids[2] });
                    None
                }
                Opcode::OpSwitch => {
                    let selector = val(ids[0]).int();
                    let target = inst.operands[2..]
                        .chunks(2)
                        .find_map(|pair| match *pair {
                            [spv::Operand::Literal(spv::Literal::Int(x)), spv::Operand::Id(target)]
                                if x == selector =>
                            {
                                Some(target)
                            }
                            _ => None,
                        })
                        .unwrap_or(ids[1]);
                    next = Some(target);
                    None
                }
                Opcode::OpReturn | Opcode::OpUnreachable | Opcode::OpKill => {
                    let outcome = match inst.opcode {
                        Opcode::OpReturn => Outcome::Returned,
                        Opcode::OpUnreachable => Outcome::Unreachable,
                        _ => Outcome::Killed,
                    };
                    return Trace { events, outcome };
                }
                opcode => panic!("run_spv: unsupported {opcode:?}"),
            };
            if let Some(result) = result {
                vals.insert(inst.result_id.unwrap(), result);
            }
        }
        block = next.unwrap();
    }
    Trace {
        events,
        outcome: Outcome::OutOfFuel,
    }
}

/// How a structured region was left.
enum Flow {
    End(Outcome),
    ExitIf(Node, Vec<Val>),
    ExitSwitch(Node, Vec<Val>),
    ExitLoop(Node, Vec<Val>),
    Continue(Node, Vec<Val>),
    NextIteration(Node),
    BreakIf(Node, bool, Vec<Val>),
}

struct StructuredInterp<'a> {
    cx: &'a Context,
    body: &'a FuncDefBody,
    args: &'a [bool],
    vals: FxHashMap<Value, Val>,
    memory: Vec<Val>,
    events: Vec<i64>,
    fuel: usize,
}

impl StructuredInterp<'_> {
    fn eval(&self, v: Value) -> Val {
        match v {
            Value::Const(ct) => match self.cx[ct].kind {
                ConstKind::Bool(b) => Val::Bool(b),
                ConstKind::Int(x) => Val::Int(x),
                ConstKind::Undef => Val::Undef,
                _ => panic!("eval: unsupported constant"),
            },
            Value::FuncParam { idx } => Val::Bool(self.args[idx as usize]),
            Value::NodeOutput { .. } | Value::BlockParam { .. } => self.vals[&v],
        }
    }

    fn eval_all(&self, vs: &[Value]) -> Vec<Val> {
        vs.iter().map(|&v| self.eval(v)).collect()
    }

    fn set_outputs(&mut self, node: Node, outputs: Vec<Val>) {
        for (output_idx, x) in outputs.into_iter().enumerate() {
            let output_idx = output_idx as u32;
            self.vals.insert(Value::NodeOutput { node, output_idx }, x);
        }
    }

    fn run_block(&mut self, block: Block) -> Flow {
        if self.fuel == 0 {
            return Flow::End(Outcome::OutOfFuel);
        }
        self.fuel -= 1;

        let body = self.body;
        let def = &body.blocks[block];
        for &node in &def.nodes {
            if let Some(flow) = self.run_node(node) {
                return flow;
            }
        }
        match &def.terminator {
            Terminator::Return(_) => Flow::End(Outcome::Returned),
            Terminator::Unreachable => Flow::End(Outcome::Unreachable),
            Terminator::TerminateInvocation => Flow::End(Outcome::Killed),
            Terminator::ExitIf { node, args } => Flow::ExitIf(*node, self.eval_all(args)),
            Terminator::ExitSwitch { node, args } => Flow::ExitSwitch(*node, self.eval_all(args)),
            Terminator::ExitLoop { node, args } => Flow::ExitLoop(*node, self.eval_all(args)),
            Terminator::Continue { loop_node, args } => {
                Flow::Continue(*loop_node, self.eval_all(args))
            }
            Terminator::NextIteration { loop_node } => Flow::NextIteration(*loop_node),
            Terminator::BreakIf {
                loop_node,
                cond,
                exit_args,
            } => Flow::BreakIf(
                *loop_node,
                self.eval(*cond).bool(),
                self.eval_all(exit_args),
            ),
        }
    }

    fn run_node(&mut self, node: Node) -> Option<Flow> {
        let body = self.body;
        match &body.nodes[node].kind {
            NodeKind::Inst { op, inputs } => {
                let inputs = self.eval_all(inputs);
                let output = match op {
                    InstOp::Let => Some(inputs[0]),
                    InstOp::Var => {
                        self.memory.push(inputs.first().copied().unwrap_or(Val::Undef));
                        Some(Val::Ptr(self.memory.len() - 1))
                    }
                    InstOp::Load => match inputs[0] {
                        Val::Ptr(slot) => Some(self.memory[slot]),
                        v => panic!("load from {v:?}"),
                    },
                    InstOp::Store => match inputs[0] {
                        Val::Ptr(slot) => {
                            self.memory[slot] = inputs[1];
                            None
                        }
                        v => panic!("store to {v:?}"),
                    },
                    InstOp::Call(_) => {
                        self.events.push(inputs[0].int());
                        if self.events.len() > MAX_EVENTS {
                            return Some(Flow::End(Outcome::TooManyEvents));
                        }
                        None
                    }
                    InstOp::Unary(UnaryOp::Not) => Some(Val::Bool(!inputs[0].bool())),
                    InstOp::Binary(BinaryOp::Or) => {
                        Some(Val::Bool(inputs[0].bool() || inputs[1].bool()))
                    }
                    InstOp::Binary(BinaryOp::And) => {
                        Some(Val::Bool(inputs[0].bool() && inputs[1].bool()))
                    }
                    InstOp::Select => Some(if inputs[2].bool() {
                        inputs[1]
                    } else {
                        inputs[0]
                    }),
                    _ => panic!("run_node: unsupported instruction"),
                };
                if let Some(output) = output {
                    self.set_outputs(node, vec![output]);
                }
                None
            }
            &NodeKind::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                let block = if self.eval(cond).bool() {
                    then_block
                } else {
                    else_block
                };
                match self.run_block(block) {
                    Flow::ExitIf(exited, outputs) if exited == node => {
                        self.set_outputs(node, outputs);
                        None
                    }
                    flow => Some(flow),
                }
            }
            NodeKind::Switch {
                selector, cases, ..
            } => {
                let selector = self.eval(*selector).int();
                let matches = |sel: &CaseSelector| match *sel {
                    CaseSelector::Literal(ct) => self.cx[ct].kind == ConstKind::Int(selector),
                    CaseSelector::Default => false,
                };
                let case = cases
                    .iter()
                    .find(|case| case.selectors.iter().any(matches))
                    .or_else(|| {
                        cases
                            .iter()
                            .find(|case| case.selectors.contains(&CaseSelector::Default))
                    })
                    .unwrap();
                match self.run_block(case.block) {
                    Flow::ExitSwitch(exited, outputs) if exited == node => {
                        self.set_outputs(node, outputs);
                        None
                    }
                    flow => Some(flow),
                }
            }
            &NodeKind::Loop {
                body, continuing, ..
            } => loop {
                match self.run_block(body) {
                    Flow::Continue(loop_node, args) if loop_node == node => {
                        for (idx, x) in args.into_iter().enumerate() {
                            let idx = idx as u32;
                            self.vals.insert(
                                Value::BlockParam {
                                    block: continuing,
                                    idx,
                                },
                                x,
                            );
                        }
                    }
                    Flow::ExitLoop(exited, outputs) if exited == node => {
                        self.set_outputs(node, outputs);
                        return None;
                    }
                    flow => return Some(flow),
                }
                match self.run_block(continuing) {
                    Flow::NextIteration(loop_node) if loop_node == node => {}
                    Flow::BreakIf(loop_node, cond, outputs) if loop_node == node => {
                        if cond {
                            self.set_outputs(node, outputs);
                            return None;
                        }
                    }
                    flow => return Some(flow),
                }
            },
        }
    }
}

fn run_structured(cx: &Context, body: &FuncDefBody, args: &[bool]) -> Trace {
    let mut interp = StructuredInterp {
        cx,
        body,
        args,
        vals: FxHashMap::default(),
        memory: vec![],
        events: vec![],
        fuel: FUEL,
    };
    let outcome = match interp.run_block(body.body) {
        Flow::End(outcome) => outcome,
        _ => panic!("run_structured: function body exited a construct"),
    };
    Trace {
        events: interp.events,
        outcome,
    }
}

fn assert_equivalent(text: &str, config: &Config) {
    let (consts, spv_funcs) = read_spv_funcs(text);

    let module = Module::lower_from_spvasm(Rc::new(Context::new()), text, config).unwrap();
    let cx = module.cx_ref();
    let bodies = module
        .func_order
        .iter()
        .filter_map(|&func| match &module.funcs[func].def {
            DeclDef::Imported => None,
            DeclDef::Present(body) => Some(body),
        })
        .collect::<Vec<_>>();
    assert_eq!(bodies.len(), spv_funcs.len());

    for (spv_func, body) in spv_funcs.iter().zip(bodies) {
        let param_count = spv_func.params.len();
        for bits in 0..(1u32 << param_count) {
            let args = (0..param_count)
                .map(|i| bits & (1 << i) != 0)
                .collect::<Vec<_>>();
            let expected = run_spv(spv_func, &consts, &args);
            let found = run_structured(cx, body, &args);
            assert_eq!(
                found, expected,
                "`{}` diverges for arguments {args:?}",
                spv_func.name
            );
        }
    }
}

const FUNCS: &str = r#"
               OpCapability Shader
               OpCapability Linkage
               OpMemoryModel Logical GLSL450
               OpName %mark "mark"
               OpName %nested_premerge "nested_premerge"
               OpName %break_or_continue "break_or_continue"
               OpName %switch_in_loop "switch_in_loop"
               OpName %nested_loops "nested_loops"
               OpName %trivial_switch_merge "trivial_switch_merge"
               OpName %skip_premerge "skip_premerge"
       %void = OpTypeVoid
       %bool = OpTypeBool
        %i32 = OpTypeInt 32 1
    %fn_mark = OpTypeFunction %void %i32
      %fn_ab = OpTypeFunction %void %bool %bool
      %i32_0 = OpConstant %i32 0
      %i32_1 = OpConstant %i32 1
      %i32_2 = OpConstant %i32 2
      %i32_3 = OpConstant %i32 3
      %i32_4 = OpConstant %i32 4
      %i32_5 = OpConstant %i32 5
      %i32_6 = OpConstant %i32 6

       %mark = OpFunction %void None %fn_mark
     %mark_x = OpFunctionParameter %i32
               OpFunctionEnd

%nested_premerge = OpFunction %void None %fn_ab
       %f1_a = OpFunctionParameter %bool
       %f1_b = OpFunctionParameter %bool
   %f1_entry = OpLabel
      %f1_c0 = OpFunctionCall %void %mark %i32_0
               OpSelectionMerge %f1_merge None
               OpBranchConditional %f1_a %f1_then %f1_else
    %f1_then = OpLabel
      %f1_c1 = OpFunctionCall %void %mark %i32_1
               OpSelectionMerge %f1_inner_merge None
               OpBranchConditional %f1_b %f1_inner_then %f1_inner_merge
%f1_inner_then = OpLabel
      %f1_c2 = OpFunctionCall %void %mark %i32_2
               OpBranch %f1_inner_merge
%f1_inner_merge = OpLabel
      %f1_c3 = OpFunctionCall %void %mark %i32_3
               OpBranch %f1_pm
    %f1_else = OpLabel
      %f1_c4 = OpFunctionCall %void %mark %i32_4
               OpBranch %f1_pm
      %f1_pm = OpLabel
      %f1_c5 = OpFunctionCall %void %mark %i32_5
               OpBranch %f1_merge
   %f1_merge = OpLabel
      %f1_c6 = OpFunctionCall %void %mark %i32_6
               OpReturn
               OpFunctionEnd

%break_or_continue = OpFunction %void None %fn_ab
       %f2_a = OpFunctionParameter %bool
       %f2_b = OpFunctionParameter %bool
   %f2_entry = OpLabel
      %f2_c0 = OpFunctionCall %void %mark %i32_0
               OpBranch %f2_header
  %f2_header = OpLabel
               OpLoopMerge %f2_merge %f2_cont None
               OpBranch %f2_body
    %f2_body = OpLabel
      %f2_c1 = OpFunctionCall %void %mark %i32_1
               OpSelectionMerge %f2_sel_merge None
               OpBranchConditional %f2_a %f2_then %f2_sel_merge
    %f2_then = OpLabel
      %f2_c2 = OpFunctionCall %void %mark %i32_2
               OpBranchConditional %f2_b %f2_merge %f2_cont
%f2_sel_merge = OpLabel
      %f2_c3 = OpFunctionCall %void %mark %i32_3
               OpBranch %f2_cont
    %f2_cont = OpLabel
      %f2_c4 = OpFunctionCall %void %mark %i32_4
               OpBranchConditional %f2_b %f2_merge %f2_header
   %f2_merge = OpLabel
      %f2_c5 = OpFunctionCall %void %mark %i32_5
               OpReturn
               OpFunctionEnd

%switch_in_loop = OpFunction %void None %fn_ab
       %f3_a = OpFunctionParameter %bool
       %f3_b = OpFunctionParameter %bool
   %f3_entry = OpLabel
      %f3_c0 = OpFunctionCall %void %mark %i32_0
               OpBranch %f3_header
  %f3_header = OpLabel
               OpLoopMerge %f3_merge %f3_cont None
               OpBranch %f3_body
    %f3_body = OpLabel
     %f3_sel = OpSelect %i32 %f3_a %i32_1 %i32_2
      %f3_c1 = OpFunctionCall %void %mark %i32_1
               OpSelectionMerge %f3_smerge None
               OpSwitch %f3_sel %f3_default 1 %f3_case1
   %f3_case1 = OpLabel
      %f3_c2 = OpFunctionCall %void %mark %i32_2
               OpBranchConditional %f3_b %f3_merge %f3_smerge
 %f3_default = OpLabel
      %f3_c3 = OpFunctionCall %void %mark %i32_3
               OpBranchConditional %f3_b %f3_cont %f3_smerge
  %f3_smerge = OpLabel
      %f3_c4 = OpFunctionCall %void %mark %i32_4
               OpBranch %f3_cont
    %f3_cont = OpLabel
      %f3_c5 = OpFunctionCall %void %mark %i32_5
               OpBranchConditional %f3_a %f3_header %f3_merge
   %f3_merge = OpLabel
      %f3_c6 = OpFunctionCall %void %mark %i32_6
               OpReturn
               OpFunctionEnd

%nested_loops = OpFunction %void None %fn_ab
       %f4_a = OpFunctionParameter %bool
       %f4_b = OpFunctionParameter %bool
   %f4_entry = OpLabel
      %f4_c0 = OpFunctionCall %void %mark %i32_0
               OpBranch %f4_oh
      %f4_oh = OpLabel
               OpLoopMerge %f4_om %f4_oc None
               OpBranch %f4_ih
      %f4_ih = OpLabel
               OpLoopMerge %f4_im %f4_ic None
               OpBranch %f4_ib
      %f4_ib = OpLabel
      %f4_c1 = OpFunctionCall %void %mark %i32_1
               OpBranchConditional %f4_a %f4_im %f4_ic
      %f4_ic = OpLabel
      %f4_c2 = OpFunctionCall %void %mark %i32_2
               OpBranchConditional %f4_b %f4_im %f4_ih
      %f4_im = OpLabel
      %f4_c3 = OpFunctionCall %void %mark %i32_3
               OpBranch %f4_oc
      %f4_oc = OpLabel
      %f4_c4 = OpFunctionCall %void %mark %i32_4
               OpBranchConditional %f4_b %f4_om %f4_oh
      %f4_om = OpLabel
      %f4_c5 = OpFunctionCall %void %mark %i32_5
               OpReturn
               OpFunctionEnd

%trivial_switch_merge = OpFunction %void None %fn_ab
       %f5_a = OpFunctionParameter %bool
       %f5_b = OpFunctionParameter %bool
   %f5_entry = OpLabel
      %f5_c0 = OpFunctionCall %void %mark %i32_0
               OpBranch %f5_header
  %f5_header = OpLabel
               OpLoopMerge %f5_merge %f5_cont None
               OpBranch %f5_body
    %f5_body = OpLabel
     %f5_sel = OpSelect %i32 %f5_a %i32_1 %i32_2
      %f5_c1 = OpFunctionCall %void %mark %i32_1
               OpSelectionMerge %f5_smerge None
               OpSwitch %f5_sel %f5_smerge 1 %f5_case1
   %f5_case1 = OpLabel
      %f5_c2 = OpFunctionCall %void %mark %i32_2
               OpBranchConditional %f5_b %f5_merge %f5_smerge
  %f5_smerge = OpLabel
               OpBranch %f5_merge
    %f5_cont = OpLabel
      %f5_c3 = OpFunctionCall %void %mark %i32_3
               OpBranch %f5_header
   %f5_merge = OpLabel
      %f5_c4 = OpFunctionCall %void %mark %i32_4
               OpReturn
               OpFunctionEnd

%skip_premerge = OpFunction %void None %fn_ab
       %f6_a = OpFunctionParameter %bool
       %f6_b = OpFunctionParameter %bool
   %f6_entry = OpLabel
      %f6_c0 = OpFunctionCall %void %mark %i32_0
               OpSelectionMerge %f6_merge None
               OpBranchConditional %f6_a %f6_then %f6_else
    %f6_then = OpLabel
      %f6_c1 = OpFunctionCall %void %mark %i32_1
               OpBranchConditional %f6_b %f6_merge %f6_pm
    %f6_else = OpLabel
      %f6_c2 = OpFunctionCall %void %mark %i32_2
               OpBranch %f6_pm
      %f6_pm = OpLabel
      %f6_c3 = OpFunctionCall %void %mark %i32_3
               OpBranch %f6_merge
   %f6_merge = OpLabel
      %f6_c4 = OpFunctionCall %void %mark %i32_4
               OpReturn
               OpFunctionEnd
"#;

#[test]
fn default_config_preserves_behavior() {
    assert_equivalent(FUNCS, &Config::DEFAULT);
}

#[test]
fn general_config_preserves_behavior() {
    assert_equivalent(FUNCS, &Config::GENERAL);
}
