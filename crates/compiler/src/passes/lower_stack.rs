//! lower_stack: abstract stack ops become pointer arithmetic
//!
//! Two emulated stacks back the abstract operations: a per-thread one in
//! private memory and a per-subgroup one in subgroup memory, each a word
//! array plus a word counter. Pushes store through a typed pointer at the
//! current top and bump the counter by the type's word count; pops do the
//! reverse. The loads and stores produced here still use typed physical
//! pointers; lower_physical_ptrs turns them into buffer indexing.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::layout::bytes_to_words;
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};
use shade_ir::types::AddressSpace;
use shade_ir::{BodyBuilder, get_mem_layout};

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    rewrite_nodes, splice_spine_tail,
};

struct StackGlobals {
    storage: NodeId,
    pointer: NodeId,
}

struct LowerStack<'a> {
    rw: RewriteCtx<'a>,
    thread: StackGlobals,
    subgroup: StackGlobals,
}

fn declare_stack(
    rw: &mut RewriteCtx<'_>,
    name_base: &str,
    addr_space: AddressSpace,
    size_in_bytes: u32,
) -> StackGlobals {
    let arena = &mut rw.dst_arena;
    let internal_name = arena.intern_string("Internal");
    let internal = arena.node(NodeData::Annotation {
        name: internal_name,
    });
    let annotations = arena.singleton(internal);

    let u32t = arena.uint32_type();
    let words = arena.uint32_literal(size_in_bytes / 4);
    let array = arena.node(NodeData::ArrayType {
        elem: u32t,
        size: Some(words),
    });
    let storage_name = arena.intern_string(name_base);
    let storage = arena.node(NodeData::GlobalVariable {
        name: storage_name,
        annotations,
        ty: array,
        addr_space,
        init: None,
    });

    let zero = arena.uint32_literal(0);
    let pointer_name = arena.intern_string(&format!("{}_ptr", name_base));
    let pointer = arena.node(NodeData::GlobalVariable {
        name: pointer_name,
        annotations,
        ty: u32t,
        addr_space,
        init: Some(zero),
    });

    rw.dst_module.add_declaration(storage);
    rw.dst_module.add_declaration(pointer);
    StackGlobals { storage, pointer }
}

impl<'a> LowerStack<'a> {
    fn stack_for(&self, op: Op) -> &StackGlobals {
        match op {
            Op::GetStackBaseUniform | Op::PushStackUniform | Op::PopStackUniform => {
                &self.subgroup
            }
            _ => &self.thread,
        }
    }

    /// Expand one abstract stack instruction; returns the replacement
    /// spine with `results` substituted for the let's outputs.
    fn expand(
        &mut self,
        op: Op,
        type_args: &[NodeId],
        operands: &[NodeId],
        old_vars: &[NodeId],
        tail: Option<NodeId>,
    ) -> NodeId {
        let stack = self.stack_for(op);
        let (storage, pointer) = (stack.storage, stack.pointer);

        let (spine, results) = {
            let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
            let storage_ref = bb.arena().node(NodeData::RefDecl { decl: storage });
            let pointer_ref = bb.arena().node(NodeData::RefDecl { decl: pointer });

            let results: Vec<NodeId> = match op {
                Op::GetStackPointer => {
                    vec![bb.gen_load(pointer_ref)]
                }
                Op::SetStackPointer => {
                    bb.gen_store(pointer_ref, operands[0]);
                    vec![]
                }
                Op::GetStackBase | Op::GetStackBaseUniform => {
                    let sp = bb.gen_load(pointer_ref);
                    let zero = bb.arena().int32_literal(0);
                    vec![bb.gen_lea(storage_ref, zero, &[sp])]
                }
                Op::PushStack | Op::PushStackUniform => {
                    let ty = type_args[0];
                    let layout = get_mem_layout(bb.arena(), ty);
                    let words = bytes_to_words(layout.size_in_bytes);
                    let addr_space = stack_addr_space(op);
                    let sp = bb.gen_load(pointer_ref);
                    let zero = bb.arena().int32_literal(0);
                    let top = bb.gen_lea(storage_ref, zero, &[sp]);
                    let typed_ptr_ty = bb.arena().node(NodeData::PtrType {
                        addr_space,
                        pointee: ty,
                    });
                    let typed = bb.gen_reinterpret_cast(typed_ptr_ty, top);
                    bb.gen_store(typed, operands[0]);
                    let bump = bb.arena().uint32_literal(words);
                    let new_sp = bb.gen1(Op::Add, &[], &[sp, bump]);
                    bb.gen_store(pointer_ref, new_sp);
                    vec![]
                }
                Op::PopStack | Op::PopStackUniform => {
                    let ty = type_args[0];
                    let layout = get_mem_layout(bb.arena(), ty);
                    let words = bytes_to_words(layout.size_in_bytes);
                    let addr_space = stack_addr_space(op);
                    let sp = bb.gen_load(pointer_ref);
                    let shrink = bb.arena().uint32_literal(words);
                    let new_sp = bb.gen1(Op::Sub, &[], &[sp, shrink]);
                    bb.gen_store(pointer_ref, new_sp);
                    let zero = bb.arena().int32_literal(0);
                    let top = bb.gen_lea(storage_ref, zero, &[new_sp]);
                    let typed_ptr_ty = bb.arena().node(NodeData::PtrType {
                        addr_space,
                        pointee: ty,
                    });
                    let typed = bb.gen_reinterpret_cast(typed_ptr_ty, top);
                    vec![bb.gen_load(typed)]
                }
                other => panic!("not a stack op: {}", other.name()),
            };
            let placeholder = bb.arena().node(NodeData::Unreachable);
            (bb.finish_body(placeholder), results)
        };

        assert_eq!(results.len(), old_vars.len());
        for (&old, new) in old_vars.iter().zip(results) {
            self.rw.register_processed(old, new);
        }
        let tail = tail.expect("a let this late always has a tail");
        let tail = rewrite_node(self, tail);
        splice_spine_tail(&mut self.rw.dst_arena, spine, tail)
    }
}

fn stack_addr_space(op: Op) -> AddressSpace {
    match op {
        Op::GetStackBaseUniform | Op::PushStackUniform | Op::PopStackUniform => {
            AddressSpace::Subgroup
        }
        _ => AddressSpace::Private,
    }
}

fn is_stack_op(op: Op) -> bool {
    matches!(
        op,
        Op::GetStackBase
            | Op::GetStackBaseUniform
            | Op::GetStackPointer
            | Op::SetStackPointer
            | Op::PushStack
            | Op::PopStack
            | Op::PushStackUniform
            | Op::PopStackUniform
    )
}

impl<'a> Rewriter<'a> for LowerStack<'a> {
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
            op,
            type_args,
            operands,
        } = self.rw.src_arena.data(instruction).clone()
        else {
            return recreate_node_identity(self, node);
        };
        if !is_stack_op(op) {
            return recreate_node_identity(self, node);
        }

        let type_args = rewrite_nodes(self, type_args);
        let type_args = self.rw.dst_arena.node_list(type_args).to_vec();
        let operands = rewrite_nodes(self, operands);
        let operands = self.rw.dst_arena.node_list(operands).to_vec();
        let old_vars = self.rw.src_arena.node_list(vars).to_vec();
        self.expand(op, &type_args, &operands, &old_vars, tail)
    }
}

pub fn run(config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut rw = RewriteCtx::new(src, aconfig);
    let thread = declare_stack(
        &mut rw,
        "thread_stack",
        AddressSpace::Private,
        config.per_thread_stack_size,
    );
    let subgroup = declare_stack(
        &mut rw,
        "subgroup_stack",
        AddressSpace::Subgroup,
        config.per_subgroup_stack_size,
    );
    let mut pass = LowerStack {
        rw,
        thread,
        subgroup,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
