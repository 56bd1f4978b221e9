//! lower_subgroup_ops: emulate subgroup ops on unsupported types
//!
//! Hardware broadcasts operate on 32-bit words. For anything wider (or
//! when full emulation is forced), the varying value is spilled to the top
//! of the per-thread stack, broadcast word by word, and reloaded:
//!
//! 1. compute the byte layout of the type,
//! 2. reinterpret the stack top both as the value's type and as a word
//!    array,
//! 3. store the value, broadcast each word in place,
//! 4. reload and pin the result uniform so the folder can rely on it.
//!
//! The same spill/word-wise/reload shape recurs in the stack and pointer
//! lowerings.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::layout::bytes_to_words;
use shade_ir::module::Program;
use shade_ir::node::{IntWidth, NodeData, Op};
use shade_ir::types::{AddressSpace, get_unqualified_type};
use shade_ir::{BodyBuilder, get_mem_layout};

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    splice_spine_tail,
};

struct LowerSubgroupOps<'a> {
    rw: RewriteCtx<'a>,
    emulate_extended: bool,
    shuffle_workaround: bool,
}

/// Types the hardware can broadcast directly once they are one word wide.
fn is_word_sized_int(arena: &shade_ir::IrArena, ty: NodeId) -> bool {
    matches!(
        arena.data(ty),
        NodeData::IntType {
            width: IntWidth::I32,
            ..
        }
    )
}

/// Scalars and vectors of scalars; everything else always goes through
/// memory.
fn is_extended_type(arena: &shade_ir::IrArena, ty: NodeId, allow_vectors: bool) -> bool {
    match arena.data(ty) {
        NodeData::IntType { .. } | NodeData::FloatType { .. } => true,
        NodeData::PackType { elem, .. } if allow_vectors => {
            is_extended_type(arena, *elem, false)
        }
        _ => false,
    }
}

impl<'a> Rewriter<'a> for LowerSubgroupOps<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let NodeData::Let {
            instruction,
            vars,
            tail,
        } = self.rw.src_arena.data(node).clone()
        else {
            return recreate_node_identity(self, node);
        };
        let NodeData::PrimOp {
            op: Op::SubgroupBroadcastFirst,
            operands,
            ..
        } = self.rw.src_arena.data(instruction).clone()
        else {
            return recreate_node_identity(self, node);
        };

        let operands = self.rw.src_arena.node_list(operands).to_vec();
        let varying_value = rewrite_node(self, operands[0]);
        let value_ty = shade_ir::value_type(&self.rw.dst_arena, varying_value);
        let element_type = get_unqualified_type(&self.rw.dst_arena, value_ty);

        if is_word_sized_int(&self.rw.dst_arena, element_type) {
            return self.word_sized_broadcast(node, varying_value, vars, tail);
        }
        if is_extended_type(&self.rw.dst_arena, element_type, true) && !self.emulate_extended {
            return recreate_node_identity(self, node);
        }

        let layout = get_mem_layout(&self.rw.dst_arena, element_type);
        let words = bytes_to_words(layout.size_in_bytes);

        let (spine, result) = {
            let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
            let u32t = bb.arena().uint32_type();
            let word_array = bb.arena().node(NodeData::ArrayType {
                elem: u32t,
                size: None,
            });
            let raw_ptr_ty = bb.arena().node(NodeData::PtrType {
                addr_space: AddressSpace::Private,
                pointee: word_array,
            });
            let typed_ptr_ty = bb.arena().node(NodeData::PtrType {
                addr_space: AddressSpace::Private,
                pointee: element_type,
            });

            let top = bb.gen1(Op::GetStackBase, &[], &[]);
            let raw_ptr = bb.gen_reinterpret_cast(raw_ptr_ty, top);
            let typed_ptr = bb.gen_reinterpret_cast(typed_ptr_ty, top);
            bb.gen_store(typed_ptr, varying_value);
            for j in 0..words {
                let zero = bb.arena().int32_literal(0);
                let index = bb.arena().int32_literal(j as i32);
                let word_addr = bb.gen_lea(raw_ptr, zero, &[index]);
                let input = bb.gen_load(word_addr);
                let partial = bb.gen1(Op::SubgroupBroadcastFirst, &[], &[input]);
                bb.gen_store(word_addr, partial);
            }
            let reloaded = bb.gen_load(typed_ptr);
            let result = bb.gen1(Op::SubgroupAssumeUniform, &[], &[reloaded]);
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
}

impl<'a> LowerSubgroupOps<'a> {
    /// Word-sized values broadcast directly; the driver workaround swaps
    /// in a shuffle from lane zero pinned uniform.
    fn word_sized_broadcast(
        &mut self,
        node: NodeId,
        varying_value: NodeId,
        vars: shade_ir::Nodes,
        tail: Option<NodeId>,
    ) -> NodeId {
        if !self.shuffle_workaround {
            return recreate_node_identity(self, node);
        }
        let (spine, result) = {
            let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
            let lane0 = bb.arena().uint32_literal(0);
            let shuffled = bb.gen1(Op::SubgroupShuffle, &[], &[varying_value, lane0]);
            let result = bb.gen1(Op::SubgroupAssumeUniform, &[], &[shuffled]);
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
}

pub fn run(config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    if !config.lower.emulate_subgroup_ops && !config.lower.emulate_subgroup_ops_extended_types {
        return Err(CompileError::Unsupported(
            "lower_subgroup_ops needs an emulation mode enabled".into(),
        ));
    }
    let mut pass = LowerSubgroupOps {
        rw: RewriteCtx::new(src, aconfig),
        emulate_extended: config.lower.emulate_subgroup_ops_extended_types,
        shuffle_workaround: config.hacks.spv_shuffle_instead_of_broadcast_first,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
