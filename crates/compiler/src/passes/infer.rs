//! infer_program: reconstruct everything under the typing rules
//!
//! The destination arena has `check_types` (and folding) enabled, so every
//! node re-derives its qualified type on construction. The pass itself only
//! fills the gaps the parser left: unqualified signature types default to
//! varying, constants to uniform, and let outputs take the yield types of
//! their instruction.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::NodeData;
use shade_ir::types::unpack_yield_types;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, recreate_node_identity, rewrite_module, rewrite_node, rewrite_nodes,
    rewrite_opt, rewrite_string,
};

struct InferPass<'a> {
    rw: RewriteCtx<'a>,
}

impl<'a> InferPass<'a> {
    /// Wrap a bare data type with the given default qualification.
    fn ensure_qualified(&mut self, ty: NodeId, uniform: bool) -> NodeId {
        if matches!(
            self.rw.dst_arena.data(ty),
            NodeData::QualifiedType { .. }
        ) {
            ty
        } else {
            self.rw.dst_arena.qualified_type(uniform, ty)
        }
    }
}

impl<'a> Rewriter<'a> for InferPass<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            // a variable reaching this path is a binder whose type the
            // parser wrote down; values may differ per lane unless declared
            // otherwise
            NodeData::Variable { name, ty, .. } => {
                let ty = rewrite_opt(self, ty).unwrap_or_else(|| {
                    panic!(
                        "variable '{}' has no declared type to infer from",
                        self.rw.src_arena.str(name)
                    )
                });
                let ty = self.ensure_qualified(ty, false);
                let name = self.rw.src_arena.str(name).to_owned();
                self.rw.dst_arena.fresh_var(Some(ty), &name)
            }

            // let outputs take the instruction's freshly derived yields
            NodeData::Let {
                instruction,
                vars,
                tail,
            } => {
                let instruction = rewrite_node(self, instruction);
                let old_vars = self.rw.src_arena.node_list(vars).to_vec();

                // folding may have collapsed the instruction to its values
                let quoted = match self.rw.dst_arena.data(instruction) {
                    NodeData::Quote { values } => Some(*values),
                    _ => None,
                };
                if let (Some(values), Some(tail)) = (quoted, tail) {
                    let values = self.rw.dst_arena.node_list(values).to_vec();
                    if values.len() == old_vars.len() {
                        for (old_var, value) in old_vars.into_iter().zip(values) {
                            self.rw.register_processed(old_var, value);
                        }
                        return rewrite_node(self, tail);
                    }
                }

                let instr_ty = self
                    .rw
                    .dst_arena
                    .node_type(instruction)
                    .expect("instruction must have a derived type under inference");
                let yields = unpack_yield_types(&self.rw.dst_arena, instr_ty);
                assert_eq!(
                    yields.len(),
                    old_vars.len(),
                    "let binds {} variables but its instruction yields {}",
                    old_vars.len(),
                    yields.len()
                );
                let mut fresh = Vec::with_capacity(old_vars.len());
                for (old_var, ty) in old_vars.into_iter().zip(yields) {
                    let name = match self.rw.src_arena.data(old_var) {
                        NodeData::Variable { name, .. } => {
                            self.rw.src_arena.str(*name).to_owned()
                        }
                        other => panic!("let binder is a {}", other.tag_name()),
                    };
                    let var = self.rw.dst_arena.fresh_var(Some(ty), &name);
                    self.rw.register_processed(old_var, var);
                    fresh.push(var);
                }
                let vars = self.rw.dst_arena.intern_list(&fresh);
                let tail = rewrite_opt(self, tail);
                self.rw.dst_arena.node(NodeData::Let {
                    instruction,
                    vars,
                    tail,
                })
            }

            // structured yields may come from either branch: varying unless
            // the front end promised otherwise
            NodeData::If {
                yield_types,
                condition,
                then_case,
                else_case,
            } => {
                let yield_types = self.infer_yield_types(yield_types);
                let condition = rewrite_node(self, condition);
                let then_case = rewrite_node(self, then_case);
                let else_case = rewrite_opt(self, else_case);
                self.rw.dst_arena.node(NodeData::If {
                    yield_types,
                    condition,
                    then_case,
                    else_case,
                })
            }
            NodeData::Match {
                yield_types,
                inspect,
                literals,
                cases,
                default_case,
            } => {
                let yield_types = self.infer_yield_types(yield_types);
                let inspect = rewrite_node(self, inspect);
                let literals = rewrite_nodes(self, literals);
                let cases = rewrite_nodes(self, cases);
                let default_case = rewrite_node(self, default_case);
                self.rw.dst_arena.node(NodeData::Match {
                    yield_types,
                    inspect,
                    literals,
                    cases,
                    default_case,
                })
            }
            NodeData::Loop {
                yield_types,
                initial_args,
                body,
            } => {
                let yield_types = self.infer_yield_types(yield_types);
                let initial_args = rewrite_nodes(self, initial_args);
                let body = rewrite_node(self, body);
                self.rw.dst_arena.node(NodeData::Loop {
                    yield_types,
                    initial_args,
                    body,
                })
            }

            _ => recreate_node_identity(self, node),
        }
    }

    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(decl).clone();
        match data {
            NodeData::Function {
                name,
                annotations,
                params,
                return_types,
                ..
            } => {
                let name = rewrite_string(self, name);
                let annotations = rewrite_nodes(self, annotations);
                let params = rewrite_nodes(self, params);
                let return_types = self.infer_yield_types(return_types);
                self.rw.dst_arena.node(NodeData::Function {
                    name,
                    annotations,
                    params,
                    return_types,
                    body: None,
                })
            }
            NodeData::Constant {
                name,
                annotations,
                type_hint,
                ..
            } => {
                let name = rewrite_string(self, name);
                let annotations = rewrite_nodes(self, annotations);
                let type_hint = rewrite_opt(self, type_hint)
                    .map(|t| self.ensure_qualified(t, true));
                self.rw.dst_arena.node(NodeData::Constant {
                    name,
                    annotations,
                    type_hint,
                    value: None,
                })
            }
            _ => crate::rewrite::recreate_decl_stub(self, decl),
        }
    }
}

impl<'a> InferPass<'a> {
    fn infer_yield_types(&mut self, types: shade_ir::Nodes) -> shade_ir::Nodes {
        let src_types = self.rw.src_arena.node_list(types).to_vec();
        let mut out = Vec::with_capacity(src_types.len());
        for t in src_types {
            let t = rewrite_node(self, t);
            out.push(self.ensure_qualified(t, false));
        }
        self.rw.dst_arena.intern_list(&out)
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = InferPass {
        rw: RewriteCtx::new(src, aconfig),
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
