//! lower_subgroup_vars: materialize subgroup-scoped variables
//!
//! Logical globals declared in subgroup memory move to private memory;
//! every load from one re-establishes the subgroup invariant explicitly by
//! broadcasting the first lane's copy and pinning the result uniform.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};
use shade_ir::types::{AddressSpace, get_unqualified_type};
use shade_ir::BodyBuilder;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    splice_spine_tail,
};

struct LowerSubgroupVars<'a> {
    rw: RewriteCtx<'a>,
}

impl<'a> LowerSubgroupVars<'a> {
    /// Whether a source value is a pointer into subgroup memory.
    fn is_subgroup_pointer(&self, value: NodeId) -> bool {
        let Some(ty) = self.rw.src_arena.node_type(value) else {
            return false;
        };
        let ty = get_unqualified_type(self.rw.src_arena, ty);
        matches!(
            self.rw.src_arena.data(ty),
            NodeData::PtrType {
                addr_space: AddressSpace::Subgroup,
                ..
            }
        )
    }
}

impl<'a> Rewriter<'a> for LowerSubgroupVars<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::PtrType {
                addr_space: AddressSpace::Subgroup,
                pointee,
            } => {
                let pointee = rewrite_node(self, pointee);
                self.rw.dst_arena.node(NodeData::PtrType {
                    addr_space: AddressSpace::Private,
                    pointee,
                })
            }

            NodeData::Let {
                instruction,
                vars,
                tail,
            } => {
                let NodeData::PrimOp {
                    op: Op::Load,
                    operands,
                    ..
                } = self.rw.src_arena.data(instruction).clone()
                else {
                    return recreate_node_identity(self, node);
                };
                let operands = self.rw.src_arena.node_list(operands).to_vec();
                if !self.is_subgroup_pointer(operands[0]) {
                    return recreate_node_identity(self, node);
                }

                let ptr = rewrite_node(self, operands[0]);
                let (spine, result) = {
                    let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
                    let loaded = bb.gen_load(ptr);
                    let agreed = bb.gen1(Op::SubgroupBroadcastFirst, &[], &[loaded]);
                    let result = bb.gen1(Op::SubgroupAssumeUniform, &[], &[agreed]);
                    let placeholder = bb.arena().node(NodeData::Unreachable);
                    (bb.finish_body(placeholder), result)
                };
                let old_vars = self.rw.src_arena.node_list(vars).to_vec();
                assert_eq!(old_vars.len(), 1);
                self.rw.register_processed(old_vars[0], result);
                let tail = tail.expect("a let this late always has a tail");
                let tail = rewrite_node(self, tail);
                splice_spine_tail(&mut self.rw.dst_arena, spine, tail)
            }

            _ => recreate_node_identity(self, node),
        }
    }

    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        let NodeData::GlobalVariable {
            name,
            annotations,
            ty,
            addr_space: AddressSpace::Subgroup,
            init,
        } = self.rw.src_arena.data(decl).clone()
        else {
            return crate::rewrite::recreate_decl_stub(self, decl);
        };
        let name = crate::rewrite::rewrite_string(self, name);
        let annotations = crate::rewrite::rewrite_nodes(self, annotations);
        let ty = rewrite_node(self, ty);
        let init = init.map(|i| rewrite_node(self, i));
        self.rw.dst_arena.node(NodeData::GlobalVariable {
            name,
            annotations,
            ty,
            addr_space: AddressSpace::Private,
            init,
        })
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = LowerSubgroupVars {
        rw: RewriteCtx::new(src, aconfig),
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
