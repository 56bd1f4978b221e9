//! lower_cf_instrs: structured control flow to basic blocks
//!
//! Each structured construct bound by a let becomes a branch/jump web: the
//! let's tail moves into a join block whose parameters are the construct's
//! yields, cases become blocks terminated by jumps to the join, and loops
//! get a header block their continue-merges jump back to.

use shade_ir::arena::{ArenaConfig, NodeId, Nodes};
use shade_ir::module::Program;
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    rewrite_nodes,
};

#[derive(Clone, Copy, Default)]
struct MergeTargets {
    selection: Option<NodeId>,
    cont: Option<NodeId>,
    brk: Option<NodeId>,
}

struct LowerCfInstrs<'a> {
    rw: RewriteCtx<'a>,
    merge_stack: Vec<MergeTargets>,
}

impl<'a> LowerCfInstrs<'a> {
    /// Fresh destination variables for a let's binders, memoized so the
    /// join body (the rewritten tail) sees them as its parameters.
    fn fresh_vars_for(&mut self, old_vars: Nodes) -> Nodes {
        let old_vars = self.rw.src_arena.node_list(old_vars).to_vec();
        let mut fresh = Vec::with_capacity(old_vars.len());
        for old in old_vars {
            let NodeData::Variable { name, ty, .. } = self.rw.src_arena.data(old).clone() else {
                panic!("let binder is not a variable");
            };
            let ty = ty.map(|t| rewrite_node(self, t));
            let name = self.rw.src_arena.str(name).to_owned();
            let var = self.rw.dst_arena.fresh_var(ty, &name);
            self.rw.register_processed(old, var);
            fresh.push(var);
        }
        self.rw.dst_arena.intern_list(&fresh)
    }

    fn new_block(&mut self, base: &str, params: Nodes) -> NodeId {
        let name = self.rw.dst_arena.unique_name(base);
        self.rw.dst_arena.node(NodeData::BasicBlock {
            name,
            params,
            body: None,
        })
    }

    /// The join block receiving the construct's yields: its parameters are
    /// the let's variables and its body is the let's tail.
    fn build_join(&mut self, vars: Nodes, tail: Option<NodeId>) -> NodeId {
        let params = self.fresh_vars_for(vars);
        let join = self.new_block("join", params);
        if let Some(tail) = tail {
            let body = rewrite_node(self, tail);
            self.rw.dst_arena.set_basic_block_body(join, body);
        }
        join
    }

    /// Lower one case body into a block, with the given merge targets
    /// active while it is rewritten.
    fn build_case_block(&mut self, base: &str, case: NodeId, targets: MergeTargets) -> NodeId {
        let src_params = shade_ir::get_abstraction_params(self.rw.src_arena, case);
        let params = self.fresh_vars_for(src_params);
        let block = self.new_block(base, params);
        let body = shade_ir::get_abstraction_body(self.rw.src_arena, case)
            .expect("case without a body");
        self.merge_stack.push(targets);
        let body = rewrite_node(self, body);
        self.merge_stack.pop();
        self.rw.dst_arena.set_basic_block_body(block, body);
        block
    }

    fn merge_targets(&self) -> MergeTargets {
        *self
            .merge_stack
            .last()
            .expect("merge outside a structured construct")
    }
}

impl<'a> Rewriter<'a> for LowerCfInstrs<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    // merges and the bodies around them rewrite against the innermost
    // enclosing construct
    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::Let {
                instruction,
                vars,
                tail,
            } => match self.rw.src_arena.data(instruction).clone() {
                NodeData::If {
                    condition,
                    then_case,
                    else_case,
                    ..
                } => {
                    let condition = rewrite_node(self, condition);
                    let join = self.build_join(vars, tail);
                    // loop merges still target the enclosing loop
                    let mut targets = self.merge_stack.last().copied().unwrap_or_default();
                    targets.selection = Some(join);
                    let true_target = self.build_case_block("if_true", then_case, targets);
                    let false_target = match else_case {
                        Some(case) => self.build_case_block("if_false", case, targets),
                        None => {
                            // an else-less if yields nothing; the false
                            // edge enters the join directly
                            assert!(
                                self.rw.src_arena.node_list(vars).is_empty(),
                                "if without else cannot bind values"
                            );
                            join
                        }
                    };
                    let args = self.rw.dst_arena.empty();
                    self.rw.dst_arena.node(NodeData::Branch {
                        condition,
                        true_target,
                        false_target,
                        args,
                    })
                }
                NodeData::Loop {
                    initial_args, body, ..
                } => {
                    let initial_args = rewrite_nodes(self, initial_args);
                    let brk = self.build_join(vars, tail);
                    // the header's parameters are the loop case's own
                    let src_params = shade_ir::get_abstraction_params(self.rw.src_arena, body);
                    let params = self.fresh_vars_for(src_params);
                    let header = self.new_block("loop_header", params);
                    let targets = MergeTargets {
                        cont: Some(header),
                        brk: Some(brk),
                        ..Default::default()
                    };
                    let case_body = shade_ir::get_abstraction_body(self.rw.src_arena, body)
                        .expect("loop without a body");
                    self.merge_stack.push(targets);
                    let case_body = rewrite_node(self, case_body);
                    self.merge_stack.pop();
                    self.rw.dst_arena.set_basic_block_body(header, case_body);
                    self.rw.dst_arena.node(NodeData::Jump {
                        target: header,
                        args: initial_args,
                    })
                }
                NodeData::Match {
                    inspect,
                    literals,
                    cases,
                    default_case,
                    ..
                } => {
                    let inspect = rewrite_node(self, inspect);
                    let join = self.build_join(vars, tail);
                    let mut targets = self.merge_stack.last().copied().unwrap_or_default();
                    targets.selection = Some(join);
                    let literals = rewrite_nodes(self, literals);
                    let literals = self.rw.dst_arena.node_list(literals).to_vec();
                    let src_cases = self.rw.src_arena.node_list(cases).to_vec();
                    let mut case_blocks = Vec::with_capacity(src_cases.len());
                    for case in src_cases {
                        case_blocks.push(self.build_case_block("match_case", case, targets));
                    }
                    let default_block =
                        self.build_case_block("match_default", default_case, targets);

                    // a chain of eq tests, innermost first
                    let mut next = default_block;
                    let mut chain: Option<NodeId> = None;
                    for (i, (&lit, &case_block)) in
                        literals.iter().zip(&case_blocks).enumerate().rev()
                    {
                        let arena = &mut self.rw.dst_arena;
                        let ta = arena.empty();
                        let operands = arena.intern_list(&[inspect, lit]);
                        let test = arena.prim_op(shade_ir::Op::Eq, ta, operands);
                        let test_ty = arena.node_type(test);
                        let cond = arena.fresh_var(test_ty, "scrutinee_eq");
                        let cond_vars = arena.singleton(cond);
                        let args = arena.empty();
                        let branch = arena.node(NodeData::Branch {
                            condition: cond,
                            true_target: case_block,
                            false_target: next,
                            args,
                        });
                        let body = arena.node(NodeData::Let {
                            instruction: test,
                            vars: cond_vars,
                            tail: Some(branch),
                        });
                        if i == 0 {
                            chain = Some(body);
                        } else {
                            let empty = arena.empty();
                            let test_block = {
                                let name = arena.unique_name("match_test");
                                arena.node(NodeData::BasicBlock {
                                    name,
                                    params: empty,
                                    body: Some(body),
                                })
                            };
                            next = test_block;
                        }
                    }
                    chain.unwrap_or_else(|| {
                        let args = self.rw.dst_arena.empty();
                        self.rw.dst_arena.node(NodeData::Jump {
                            target: next,
                            args,
                        })
                    })
                }
                _ => recreate_node_identity(self, node),
            },

            NodeData::MergeSelection { args } => {
                let target = self
                    .merge_targets()
                    .selection
                    .expect("selection merge outside if/match");
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::Jump { target, args })
            }
            NodeData::MergeContinue { args } => {
                let target = self.merge_targets().cont.expect("continue outside a loop");
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::Jump { target, args })
            }
            NodeData::MergeBreak { args } => {
                let target = self.merge_targets().brk.expect("break outside a loop");
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::Jump { target, args })
            }

            _ => recreate_node_identity(self, node),
        }
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = LowerCfInstrs {
        rw: RewriteCtx::new(src, aconfig),
        merge_stack: Vec::new(),
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
