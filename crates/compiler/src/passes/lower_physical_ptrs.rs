//! lower_physical_ptrs: physical pointers become integer addresses
//!
//! Each physical address space is emulated by one word-array buffer in
//! SSBO memory. Pointer values become 64-bit byte addresses; globals in a
//! physical space become fixed offsets into their space's buffer; loads
//! and stores decompose into word accesses, with scalars reassembled by
//! shifts and composites rebuilt member by member. Private memory is
//! partitioned per lane: the dereference scales the word index by the
//! lane id.
//!
//! Buffer contents start zeroed (the runtime's contract), which is what
//! the stack pointer globals rely on.

use std::collections::HashMap;

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::layout::{bytes_to_words, record_member_offset};
use shade_ir::module::Program;
use shade_ir::node::{FloatWidth, IntWidth, NodeData, Op, RecordKind};
use shade_ir::types::{AddressSpace, get_unqualified_type};
use shade_ir::{BodyBuilder, get_mem_layout};

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_node, splice_spine_tail,
};

/// Static placement of the physical globals: byte offsets within their
/// space, plus each space's total footprint.
struct Placement {
    offsets: HashMap<NodeId, u64>,
    totals: HashMap<AddressSpace, u64>,
}

fn place_globals(src: &Program) -> Placement {
    let arena = &src.arena;
    let mut offsets = HashMap::new();
    let mut totals: HashMap<AddressSpace, u64> = HashMap::new();
    for &decl in src.module.declarations() {
        let NodeData::GlobalVariable { ty, addr_space, .. } = arena.data(decl) else {
            continue;
        };
        if !addr_space.is_physical() {
            continue;
        }
        let layout = get_mem_layout(arena, *ty);
        let cursor = totals.entry(*addr_space).or_default();
        let align = layout.alignment_in_bytes.max(4) as u64;
        let offset = cursor.div_ceil(align) * align;
        offsets.insert(decl, offset);
        *cursor = offset + layout.size_in_bytes as u64;
    }
    Placement { offsets, totals }
}

struct LowerPhysicalPtrs<'a> {
    rw: RewriteCtx<'a>,
    placement: Placement,
    buffers: HashMap<AddressSpace, NodeId>,
}

impl<'a> LowerPhysicalPtrs<'a> {
    fn buffer_for(&mut self, space: AddressSpace) -> NodeId {
        if let Some(&b) = self.buffers.get(&space) {
            return b;
        }
        let arena = &mut self.rw.dst_arena;
        let internal_name = arena.intern_string("Internal");
        let internal = arena.node(NodeData::Annotation {
            name: internal_name,
        });
        let annotations = arena.singleton(internal);
        let u32t = arena.uint32_type();
        let array = arena.node(NodeData::ArrayType {
            elem: u32t,
            size: None,
        });
        let name = arena.intern_string(&format!("physical_memory_{}", space.name()));
        let buffer = arena.node(NodeData::GlobalVariable {
            name,
            annotations,
            ty: array,
            addr_space: AddressSpace::Ssbo,
            init: None,
        });
        self.rw.dst_module.add_declaration(buffer);
        self.buffers.insert(space, buffer);
        buffer
    }

    /// Words per thread of private memory, for the lane partitioning.
    fn private_stride_words(&self) -> u64 {
        let total = self.placement.totals.get(&AddressSpace::Private).copied().unwrap_or(0);
        bytes_to_words(total as u32) as u64
    }

    /// The address space behind a source pointer-typed value.
    fn src_pointer_space(&self, value: NodeId) -> Option<(AddressSpace, NodeId)> {
        let ty = self.rw.src_arena.node_type(value)?;
        let ty = get_unqualified_type(self.rw.src_arena, ty);
        match self.rw.src_arena.data(ty) {
            NodeData::PtrType {
                addr_space,
                pointee,
            } if addr_space.is_physical() => Some((*addr_space, *pointee)),
            _ => None,
        }
    }
}

/// The u32 word index inside a space's buffer for a byte address.
fn gen_word_index(
    bb: &mut BodyBuilder<'_>,
    space: AddressSpace,
    addr: NodeId,
    private_stride: u64,
) -> NodeId {
    let two = bb.arena().uint64_literal(2);
    let word = bb.gen1(Op::RshiftLogical, &[], &[addr, two]);
    let scaled = if space == AddressSpace::Private {
        let lane = bb.gen1(Op::SubgroupLocalId, &[], &[]);
        let u64t = bb.arena().uint64_type();
        let lane = bb.gen_convert(u64t, lane);
        let stride = bb.arena().uint64_literal(private_stride);
        let base = bb.gen1(Op::Mul, &[], &[lane, stride]);
        bb.gen1(Op::Add, &[], &[base, word])
    } else {
        word
    };
    let u32t = bb.arena().uint32_type();
    bb.gen_convert(u32t, scaled)
}

/// Load one buffer word at a byte address.
fn gen_word_load(
    bb: &mut BodyBuilder<'_>,
    buffer: NodeId,
    space: AddressSpace,
    addr: NodeId,
    private_stride: u64,
) -> NodeId {
    let index = gen_word_index(bb, space, addr, private_stride);
    let buffer_ref = bb.arena().node(NodeData::RefDecl { decl: buffer });
    let zero = bb.arena().int32_literal(0);
    let slot = bb.gen_lea(buffer_ref, zero, &[index]);
    bb.gen_load(slot)
}

fn gen_word_store(
    bb: &mut BodyBuilder<'_>,
    buffer: NodeId,
    space: AddressSpace,
    addr: NodeId,
    private_stride: u64,
    word: NodeId,
) {
    let index = gen_word_index(bb, space, addr, private_stride);
    let buffer_ref = bb.arena().node(NodeData::RefDecl { decl: buffer });
    let zero = bb.arena().int32_literal(0);
    let slot = bb.gen_lea(buffer_ref, zero, &[index]);
    bb.gen_store(slot, word);
}

fn add_offset(bb: &mut BodyBuilder<'_>, addr: NodeId, offset: u64) -> NodeId {
    if offset == 0 {
        return addr;
    }
    let o = bb.arena().uint64_literal(offset);
    bb.gen1(Op::Add, &[], &[addr, o])
}

/// Reconstruct a value of `ty` (a destination type) from emulated memory
/// at a byte address. Word-aligned scalars; sub-word ints shift out of
/// their containing word.
fn emit_load(
    bb: &mut BodyBuilder<'_>,
    buffer: NodeId,
    space: AddressSpace,
    addr: NodeId,
    private_stride: u64,
    ty: NodeId,
) -> NodeId {
    let data = bb.arena().data(ty).clone();
    match data {
        NodeData::IntType { width, signed } => match width {
            IntWidth::I32 => {
                let word = gen_word_load(bb, buffer, space, addr, private_stride);
                let target = bb.arena().int_type(width, signed);
                bb.gen_reinterpret_cast(target, word)
            }
            IntWidth::I64 => {
                let lo = gen_word_load(bb, buffer, space, addr, private_stride);
                let hi_addr = add_offset(bb, addr, 4);
                let hi = gen_word_load(bb, buffer, space, hi_addr, private_stride);
                let u64t = bb.arena().uint64_type();
                let lo = bb.gen_convert(u64t, lo);
                let hi = bb.gen_convert(u64t, hi);
                let thirty_two = bb.arena().uint64_literal(32);
                let hi = bb.gen1(Op::Lshift, &[], &[hi, thirty_two]);
                let combined = bb.gen1(Op::Or, &[], &[lo, hi]);
                let target = bb.arena().int_type(width, signed);
                bb.gen_reinterpret_cast(target, combined)
            }
            IntWidth::I8 | IntWidth::I16 => {
                // shift the value out of its containing word
                let word_base = bb.arena().uint64_literal(!3u64);
                let aligned = bb.gen1(Op::And, &[], &[addr, word_base]);
                let word = gen_word_load(bb, buffer, space, aligned, private_stride);
                let three = bb.arena().uint64_literal(3);
                let byte_in_word = bb.gen1(Op::And, &[], &[addr, three]);
                let eight = bb.arena().uint64_literal(8);
                let shift = bb.gen1(Op::Mul, &[], &[byte_in_word, eight]);
                let u32t = bb.arena().uint32_type();
                let shift = bb.gen_convert(u32t, shift);
                let shifted = bb.gen1(Op::RshiftLogical, &[], &[word, shift]);
                let target = bb.arena().int_type(width, signed);
                bb.gen_convert(target, shifted)
            }
        },
        NodeData::FloatType { width } => match width {
            FloatWidth::F32 | FloatWidth::F16 => {
                let word = gen_word_load(bb, buffer, space, addr, private_stride);
                let target = bb.arena().float_type(width);
                bb.gen_reinterpret_cast(target, word)
            }
            FloatWidth::F64 => {
                let u64t = bb.arena().uint64_type();
                let wide = emit_load(bb, buffer, space, addr, private_stride, u64t);
                let target = bb.arena().float_type(width);
                bb.gen_reinterpret_cast(target, wide)
            }
        },
        NodeData::BoolType => {
            let word = gen_word_load(bb, buffer, space, addr, private_stride);
            let zero = bb.arena().uint32_literal(0);
            bb.gen1(Op::Neq, &[], &[word, zero])
        }
        NodeData::PackType { elem, width } => {
            let stride = get_mem_layout(bb.arena(), elem).size_in_bytes as u64;
            let mut parts = Vec::with_capacity(width as usize);
            for i in 0..width {
                let at = add_offset(bb, addr, stride * i as u64);
                parts.push(emit_load(bb, buffer, space, at, private_stride, elem));
            }
            let contents = bb.arena().intern_list(&parts);
            bb.arena().node(NodeData::Composite { ty, contents })
        }
        NodeData::RecordType { members, kind } => {
            assert!(matches!(kind, RecordKind::Plain), "loading a return tuple");
            let members = bb.arena().node_list(members).to_vec();
            let mut parts = Vec::with_capacity(members.len());
            for (i, member) in members.into_iter().enumerate() {
                let offset = record_member_offset(bb.arena(), ty, i) as u64;
                let at = add_offset(bb, addr, offset);
                parts.push(emit_load(bb, buffer, space, at, private_stride, member));
            }
            let contents = bb.arena().intern_list(&parts);
            bb.arena().node(NodeData::Composite { ty, contents })
        }
        NodeData::ArrayType {
            elem,
            size: Some(size),
        } => {
            let n = bb.arena().resolve_int_literal(size).unwrap_or(0) as u64;
            let elem_layout = get_mem_layout(bb.arena(), elem);
            let stride = elem_layout
                .size_in_bytes
                .div_ceil(elem_layout.alignment_in_bytes)
                * elem_layout.alignment_in_bytes;
            let mut parts = Vec::with_capacity(n as usize);
            for i in 0..n {
                let at = add_offset(bb, addr, stride as u64 * i);
                parts.push(emit_load(bb, buffer, space, at, private_stride, elem));
            }
            let contents = bb.arena().intern_list(&parts);
            bb.arena().node(NodeData::Composite { ty, contents })
        }
        other => panic!("cannot load a {} from emulated memory", other.tag_name()),
    }
}

fn emit_store(
    bb: &mut BodyBuilder<'_>,
    buffer: NodeId,
    space: AddressSpace,
    addr: NodeId,
    private_stride: u64,
    ty: NodeId,
    value: NodeId,
) {
    let data = bb.arena().data(ty).clone();
    match data {
        NodeData::IntType { width, .. } => match width {
            IntWidth::I32 => {
                let u32t = bb.arena().uint32_type();
                let word = bb.gen_reinterpret_cast(u32t, value);
                gen_word_store(bb, buffer, space, addr, private_stride, word);
            }
            IntWidth::I64 => {
                let u64t = bb.arena().uint64_type();
                let wide = bb.gen_reinterpret_cast(u64t, value);
                let u32t = bb.arena().uint32_type();
                let lo = bb.gen_convert(u32t, wide);
                let thirty_two = bb.arena().uint64_literal(32);
                let hi_wide = bb.gen1(Op::RshiftLogical, &[], &[wide, thirty_two]);
                let hi = bb.gen_convert(u32t, hi_wide);
                gen_word_store(bb, buffer, space, addr, private_stride, lo);
                let hi_addr = add_offset(bb, addr, 4);
                gen_word_store(bb, buffer, space, hi_addr, private_stride, hi);
            }
            IntWidth::I8 | IntWidth::I16 => {
                // read-modify-write the containing word
                let bits = width.bits();
                let word_base = bb.arena().uint64_literal(!3u64);
                let aligned = bb.gen1(Op::And, &[], &[addr, word_base]);
                let word = gen_word_load(bb, buffer, space, aligned, private_stride);
                let three = bb.arena().uint64_literal(3);
                let byte_in_word = bb.gen1(Op::And, &[], &[addr, three]);
                let eight = bb.arena().uint64_literal(8);
                let shift64 = bb.gen1(Op::Mul, &[], &[byte_in_word, eight]);
                let u32t = bb.arena().uint32_type();
                let shift = bb.gen_convert(u32t, shift64);
                let value_mask = bb.arena().uint32_literal((1u64 << bits) as u32 - 1);
                let hole = bb.gen1(Op::Lshift, &[], &[value_mask, shift]);
                let inv_hole = bb.gen1(Op::Not, &[], &[hole]);
                let cleared = bb.gen1(Op::And, &[], &[word, inv_hole]);
                let widened = bb.gen_convert(u32t, value);
                let masked = bb.gen1(Op::And, &[], &[widened, value_mask]);
                let placed = bb.gen1(Op::Lshift, &[], &[masked, shift]);
                let merged = bb.gen1(Op::Or, &[], &[cleared, placed]);
                gen_word_store(bb, buffer, space, aligned, private_stride, merged);
            }
        },
        NodeData::FloatType { width } => {
            let target = match width {
                FloatWidth::F64 => bb.arena().uint64_type(),
                _ => bb.arena().uint32_type(),
            };
            let raw = bb.gen_reinterpret_cast(target, value);
            emit_store(bb, buffer, space, addr, private_stride, target, raw);
        }
        NodeData::BoolType => {
            let one = bb.arena().uint32_literal(1);
            let zero = bb.arena().uint32_literal(0);
            let word = bb.gen1(Op::Select, &[], &[value, one, zero]);
            gen_word_store(bb, buffer, space, addr, private_stride, word);
        }
        NodeData::PackType { elem, width } => {
            let stride = get_mem_layout(bb.arena(), elem).size_in_bytes as u64;
            for i in 0..width {
                let ix = bb.arena().int32_literal(i as i32);
                let part = bb.gen1(Op::Extract, &[], &[value, ix]);
                let at = add_offset(bb, addr, stride * i as u64);
                emit_store(bb, buffer, space, at, private_stride, elem, part);
            }
        }
        NodeData::RecordType { members, .. } => {
            let members = bb.arena().node_list(members).to_vec();
            for (i, member) in members.into_iter().enumerate() {
                let ix = bb.arena().int32_literal(i as i32);
                let part = bb.gen1(Op::Extract, &[], &[value, ix]);
                let offset = record_member_offset(bb.arena(), ty, i) as u64;
                let at = add_offset(bb, addr, offset);
                emit_store(bb, buffer, space, at, private_stride, member, part);
            }
        }
        NodeData::ArrayType {
            elem,
            size: Some(size),
        } => {
            let n = bb.arena().resolve_int_literal(size).unwrap_or(0) as u64;
            let elem_layout = get_mem_layout(bb.arena(), elem);
            let stride = elem_layout
                .size_in_bytes
                .div_ceil(elem_layout.alignment_in_bytes)
                * elem_layout.alignment_in_bytes;
            for i in 0..n {
                let ix = bb.arena().int32_literal(i as i32);
                let part = bb.gen1(Op::Extract, &[], &[value, ix]);
                let at = add_offset(bb, addr, stride as u64 * i);
                emit_store(bb, buffer, space, at, private_stride, elem, part);
            }
        }
        other => panic!("cannot store a {} to emulated memory", other.tag_name()),
    }
}

impl<'a> Rewriter<'a> for LowerPhysicalPtrs<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            // pointer types in physical spaces are integers now
            NodeData::PtrType { addr_space, .. } if addr_space.is_physical() => {
                self.rw.dst_arena.uint64_type()
            }

            // a physical global's address is its placed offset
            NodeData::RefDecl { decl }
                if self.placement.offsets.contains_key(&decl) =>
            {
                let offset = self.placement.offsets[&decl];
                self.rw.dst_arena.uint64_literal(offset)
            }

            NodeData::Let {
                instruction,
                vars,
                tail,
            } => self.process_let(node, instruction, vars, tail),

            _ => recreate_node_identity(self, node),
        }
    }
}

impl<'a> LowerPhysicalPtrs<'a> {
    fn process_let(
        &mut self,
        node: NodeId,
        instruction: NodeId,
        vars: shade_ir::Nodes,
        tail: Option<NodeId>,
    ) -> NodeId {
        let NodeData::PrimOp { op, operands, .. } = self.rw.src_arena.data(instruction).clone()
        else {
            return recreate_node_identity(self, node);
        };
        let operands = self.rw.src_arena.node_list(operands).to_vec();

        let expansion = match op {
            Op::Load => self
                .src_pointer_space(operands[0])
                .map(|(space, pointee)| (space, pointee, op)),
            Op::Store => self
                .src_pointer_space(operands[0])
                .map(|(space, pointee)| (space, pointee, op)),
            Op::Lea => self
                .src_pointer_space(operands[0])
                .map(|(space, pointee)| (space, pointee, op)),
            Op::Reinterpret => {
                // pointer-to-pointer casts are identities on addresses
                match self.src_pointer_space(operands[0]) {
                    Some(_) => {
                        let value = rewrite_node(self, operands[0]);
                        let old_vars = self.rw.src_arena.node_list(vars).to_vec();
                        if old_vars.len() == 1 {
                            self.rw.register_processed(old_vars[0], value);
                            let tail = tail.expect("a let this late always has a tail");
                            return rewrite_node(self, tail);
                        }
                        None
                    }
                    None => None,
                }
            }
            _ => None,
        };
        let Some((space, src_pointee, op)) = expansion else {
            return recreate_node_identity(self, node);
        };

        let buffer = self.buffer_for(space);
        let stride = self.private_stride_words();
        let pointee = rewrite_node(self, src_pointee);
        let addr = rewrite_node(self, operands[0]);

        let (spine, results) = match op {
            Op::Load => {
                let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
                let value = emit_load(&mut bb, buffer, space, addr, stride, pointee);
                let placeholder = bb.arena().node(NodeData::Unreachable);
                (bb.finish_body(placeholder), vec![value])
            }
            Op::Store => {
                let value = rewrite_node(self, operands[1]);
                let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
                emit_store(&mut bb, buffer, space, addr, stride, pointee, value);
                let placeholder = bb.arena().node(NodeData::Unreachable);
                (bb.finish_body(placeholder), vec![])
            }
            Op::Lea => {
                let offset = rewrite_node(self, operands[1]);
                let indices: Vec<NodeId> =
                    operands[2..].iter().map(|&ix| rewrite_node(self, ix)).collect();
                let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
                let value = emit_lea(&mut bb, addr, offset, pointee, &indices);
                let placeholder = bb.arena().node(NodeData::Unreachable);
                (bb.finish_body(placeholder), vec![value])
            }
            _ => unreachable!(),
        };

        let old_vars = self.rw.src_arena.node_list(vars).to_vec();
        assert_eq!(old_vars.len(), results.len());
        for (&old, new) in old_vars.iter().zip(results) {
            self.rw.register_processed(old, new);
        }
        let tail = tail.expect("a let this late always has a tail");
        let tail = rewrite_node(self, tail);
        splice_spine_tail(&mut self.rw.dst_arena, spine, tail)
    }
}

/// Address arithmetic for a lea: the byte offset scales by the pointee
/// stride, then each index steps into the type.
fn emit_lea(
    bb: &mut BodyBuilder<'_>,
    base: NodeId,
    offset: NodeId,
    pointee: NodeId,
    indices: &[NodeId],
) -> NodeId {
    let u64t = bb.arena().uint64_type();
    let pointee_layout = get_mem_layout(bb.arena(), pointee);
    let stride = bb.arena().uint64_literal(pointee_layout.size_in_bytes as u64);
    let offset = bb.gen_convert(u64t, offset);
    let scaled = bb.gen1(Op::Mul, &[], &[offset, stride]);
    let mut addr = bb.gen1(Op::Add, &[], &[base, scaled]);

    let mut ty = pointee;
    for &index in indices {
        let data = bb.arena().data(ty).clone();
        match data {
            NodeData::ArrayType { elem, .. } | NodeData::PackType { elem, .. } => {
                let elem_layout = get_mem_layout(bb.arena(), elem);
                let stride = elem_layout
                    .size_in_bytes
                    .div_ceil(elem_layout.alignment_in_bytes)
                    * elem_layout.alignment_in_bytes;
                let stride = bb.arena().uint64_literal(stride as u64);
                let index = bb.gen_convert(u64t, index);
                let step = bb.gen1(Op::Mul, &[], &[index, stride]);
                addr = bb.gen1(Op::Add, &[], &[addr, step]);
                ty = elem;
            }
            NodeData::RecordType { members, .. } => {
                let i = bb
                    .arena()
                    .resolve_int_literal(index)
                    .expect("record access requires a literal index")
                    as usize;
                let offset = record_member_offset(bb.arena(), ty, i) as u64;
                addr = add_offset(bb, addr, offset);
                ty = bb.arena().node_list(members)[i];
            }
            other => panic!("cannot index into {}", other.tag_name()),
        }
    }
    addr
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let placement = place_globals(src);
    let mut pass = LowerPhysicalPtrs {
        rw: RewriteCtx::new(src, aconfig),
        placement,
        buffers: HashMap::new(),
    };

    // physical globals do not survive; everything else rewrites normally
    let decls = src.module.declarations().to_vec();
    for &decl in &decls {
        if pass.placement.offsets.contains_key(&decl) {
            continue;
        }
        let stub = pass.process_decl_stub(decl);
        pass.rw.register_processed(decl, stub);
        pass.rw.dst_module.add_declaration(stub);
    }
    for &decl in &decls {
        if pass.placement.offsets.contains_key(&decl) {
            continue;
        }
        let stub = pass
            .rw
            .find_processed(decl)
            .expect("declaration lost its stub");
        pass.process_decl_body(decl, stub);
    }

    Ok(pass.rw.finish())
}
