//! lower_callf: calls become continuation passing
//!
//! A call in the middle of a body splits it: everything after the call
//! becomes a return continuation whose address is pushed on the uniform
//! stack, and the call itself becomes a tail call. Returns in functions
//! that can be entered this way pop the continuation and tail-call it.
//!
//! Leaf functions opt out entirely: they are still called and return
//! natively, which the backends support directly.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    rewrite_nodes,
};

struct LowerCallf<'a> {
    rw: RewriteCtx<'a>,
    /// Returns stay native in leaf functions and entry points.
    keep_returns: bool,
}

impl<'a> LowerCallf<'a> {
    /// Whether the callee value is the address of a leaf function.
    fn is_leaf_callee(&self, callee: NodeId) -> bool {
        let NodeData::FnAddr { function } = self.rw.src_arena.data(callee) else {
            return false;
        };
        matches!(
            self.rw.src_arena.data(*function),
            NodeData::Function { .. }
        ) && shade_ir::lookup_annotation(self.rw.src_arena, *function, "Leaf").is_some()
    }

    /// The function type of a continuation taking these (qualified)
    /// parameter types.
    fn continuation_type(&mut self, param_types: &[NodeId]) -> NodeId {
        let params = self.rw.dst_arena.intern_list(param_types);
        let returns = self.rw.dst_arena.empty();
        self.rw.dst_arena.node(NodeData::FnType { params, returns })
    }
}

impl<'a> Rewriter<'a> for LowerCallf<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::Let {
                instruction,
                vars,
                tail: Some(tail),
            } => {
                let NodeData::Call { callee, args } =
                    self.rw.src_arena.data(instruction).clone()
                else {
                    return recreate_node_identity(self, node);
                };
                if self.is_leaf_callee(callee) {
                    return recreate_node_identity(self, node);
                }
                let callee = rewrite_node(self, callee);
                let args = rewrite_nodes(self, args);

                // the rest of the body becomes the return continuation
                let old_vars = self.rw.src_arena.node_list(vars).to_vec();
                let mut params = Vec::with_capacity(old_vars.len());
                let mut param_types = Vec::with_capacity(old_vars.len());
                for old in old_vars {
                    let NodeData::Variable { name, ty, .. } =
                        self.rw.src_arena.data(old).clone()
                    else {
                        panic!("let binder is not a variable");
                    };
                    let ty = ty.map(|t| rewrite_node(self, t));
                    let name = self.rw.src_arena.str(name).to_owned();
                    let var = self.rw.dst_arena.fresh_var(ty, &name);
                    self.rw.register_processed(old, var);
                    if let Some(ty) = ty {
                        param_types.push(ty);
                    }
                    params.push(var);
                }
                let cont_body = rewrite_node(self, tail);
                let arena = &mut self.rw.dst_arena;
                let name = arena.unique_name("return_cont");
                let params = arena.intern_list(&params);
                let cont = arena.node(NodeData::BasicBlock {
                    name,
                    params,
                    body: Some(cont_body),
                });

                let cont_ty = self.continuation_type(&param_types);
                let arena = &mut self.rw.dst_arena;
                let cont_addr = arena.node(NodeData::FnAddr { function: cont });
                let ta = arena.singleton(cont_ty);
                let operands = arena.singleton(cont_addr);
                let push = arena.prim_op(Op::PushStackUniform, ta, operands);
                let no_vars = arena.empty();
                let tail_call = arena.node(NodeData::TailCall { callee, args });
                arena.node(NodeData::Let {
                    instruction: push,
                    vars: no_vars,
                    tail: Some(tail_call),
                })
            }

            NodeData::Return { values } if !self.keep_returns => {
                let values = rewrite_nodes(self, values);
                let value_ids = self.rw.dst_arena.node_list(values).to_vec();
                let types: Vec<_> = value_ids
                    .iter()
                    .map(|&v| shade_ir::value_type(&self.rw.dst_arena, v))
                    .collect();
                let cont_ty = self.continuation_type(&types);
                let arena = &mut self.rw.dst_arena;
                let ta = arena.singleton(cont_ty);
                let no_operands = arena.empty();
                let pop = arena.prim_op(Op::PopStackUniform, ta, no_operands);
                let pop_ty = arena.node_type(pop);
                let cont = arena.fresh_var(pop_ty, "return_addr");
                let cont_vars = arena.singleton(cont);
                let tail_call = arena.node(NodeData::TailCall {
                    callee: cont,
                    args: values,
                });
                arena.node(NodeData::Let {
                    instruction: pop,
                    vars: cont_vars,
                    tail: Some(tail_call),
                })
            }

            _ => recreate_node_identity(self, node),
        }
    }

    fn process_decl_body(&mut self, old: NodeId, new: NodeId) {
        if matches!(self.rw.src_arena.data(old), NodeData::Function { .. }) {
            let leaf = shade_ir::lookup_annotation(self.rw.src_arena, old, "Leaf").is_some();
            let entry =
                shade_ir::lookup_annotation(self.rw.src_arena, old, "EntryPoint").is_some();
            self.keep_returns = leaf || entry;
        }
        crate::rewrite::recreate_decl_body(self, old, new);
        self.keep_returns = true;
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = LowerCallf {
        rw: RewriteCtx::new(src, aconfig),
        keep_returns: true,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
