//! lower_int: emulate 64-bit integers on 32-bit targets
//!
//! A 64-bit integer becomes a `{lo: u32, hi: u32}` record. Literals split,
//! arithmetic expands into carry chains, shifts into the classic two-word
//! select dance, comparisons into lexicographic chains. 64-bit division
//! has no closed-form expansion and is rejected.
//!
//! Shift amounts follow the 32-bit hardware rule: the amount is taken
//! modulo 32, which is what the selects below rely on.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{IntWidth, NodeData, Op, RecordKind};
use shade_ir::types::get_unqualified_type;
use shade_ir::BodyBuilder;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    splice_spine_tail,
};

struct LowerInt<'a> {
    rw: RewriteCtx<'a>,
}

fn pair_type(arena: &mut shade_ir::IrArena) -> NodeId {
    let u32t = arena.uint32_type();
    let members = arena.intern_list(&[u32t, u32t]);
    arena.node(NodeData::RecordType {
        members,
        kind: RecordKind::Plain,
    })
}

fn is_wide_int(arena: &shade_ir::IrArena, ty: NodeId) -> bool {
    matches!(
        arena.data(ty),
        NodeData::IntType {
            width: IntWidth::I64,
            ..
        }
    )
}

/// Whether this primop touches 64-bit integers in operands or result.
fn touches_wide_int(arena: &shade_ir::IrArena, instruction: NodeId) -> bool {
    let NodeData::PrimOp {
        type_args,
        operands,
        ..
    } = arena.data(instruction)
    else {
        return false;
    };
    let of_value = |v: NodeId| {
        arena
            .node_type(v)
            .map(|t| is_wide_int(arena, get_unqualified_type(arena, t)))
            .unwrap_or(false)
    };
    arena.node_list(*operands).iter().copied().any(of_value)
        || arena
            .node_list(*type_args)
            .iter()
            .any(|&t| is_wide_int(arena, t))
}

struct Pair {
    lo: NodeId,
    hi: NodeId,
}

fn split(bb: &mut BodyBuilder<'_>, v: NodeId) -> Pair {
    let zero = bb.arena().int32_literal(0);
    let one = bb.arena().int32_literal(1);
    Pair {
        lo: bb.gen1(Op::Extract, &[], &[v, zero]),
        hi: bb.gen1(Op::Extract, &[], &[v, one]),
    }
}

fn join(bb: &mut BodyBuilder<'_>, lo: NodeId, hi: NodeId) -> NodeId {
    let ty = pair_type(bb.arena());
    let contents = bb.arena().intern_list(&[lo, hi]);
    bb.arena().node(NodeData::Composite { ty, contents })
}

/// 0 or 1 as a u32, from a boolean.
fn bool_to_word(bb: &mut BodyBuilder<'_>, b: NodeId) -> NodeId {
    let one = bb.arena().uint32_literal(1);
    let zero = bb.arena().uint32_literal(0);
    bb.gen1(Op::Select, &[], &[b, one, zero])
}

fn signed_view(bb: &mut BodyBuilder<'_>, v: NodeId) -> NodeId {
    let i32t = bb.arena().int32_type();
    bb.gen_reinterpret_cast(i32t, v)
}

fn add64(bb: &mut BodyBuilder<'_>, a: Pair, b: Pair) -> NodeId {
    let lo = bb.gen1(Op::Add, &[], &[a.lo, b.lo]);
    let carried = bb.gen1(Op::Lt, &[], &[lo, a.lo]);
    let carry = bool_to_word(bb, carried);
    let hi = bb.gen1(Op::Add, &[], &[a.hi, b.hi]);
    let hi = bb.gen1(Op::Add, &[], &[hi, carry]);
    join(bb, lo, hi)
}

fn sub64(bb: &mut BodyBuilder<'_>, a: Pair, b: Pair) -> NodeId {
    let borrowed = bb.gen1(Op::Lt, &[], &[a.lo, b.lo]);
    let borrow = bool_to_word(bb, borrowed);
    let lo = bb.gen1(Op::Sub, &[], &[a.lo, b.lo]);
    let hi = bb.gen1(Op::Sub, &[], &[a.hi, b.hi]);
    let hi = bb.gen1(Op::Sub, &[], &[hi, borrow]);
    join(bb, lo, hi)
}

/// Schoolbook 32x32 -> 64 via 16-bit halves, then the cross terms.
fn mul64(bb: &mut BodyBuilder<'_>, a: Pair, b: Pair) -> NodeId {
    let mask = bb.arena().uint32_literal(0xffff);
    let sixteen = bb.arena().uint32_literal(16);

    let a0 = bb.gen1(Op::And, &[], &[a.lo, mask]);
    let a1 = bb.gen1(Op::RshiftLogical, &[], &[a.lo, sixteen]);
    let b0 = bb.gen1(Op::And, &[], &[b.lo, mask]);
    let b1 = bb.gen1(Op::RshiftLogical, &[], &[b.lo, sixteen]);

    let t0 = bb.gen1(Op::Mul, &[], &[a0, b0]);
    let t0_hi = bb.gen1(Op::RshiftLogical, &[], &[t0, sixteen]);
    let t1 = bb.gen1(Op::Mul, &[], &[a1, b0]);
    let t1 = bb.gen1(Op::Add, &[], &[t1, t0_hi]);
    let t1_lo = bb.gen1(Op::And, &[], &[t1, mask]);
    let t1_hi = bb.gen1(Op::RshiftLogical, &[], &[t1, sixteen]);
    let t2 = bb.gen1(Op::Mul, &[], &[a0, b1]);
    let t2 = bb.gen1(Op::Add, &[], &[t2, t1_lo]);
    let t2_hi = bb.gen1(Op::RshiftLogical, &[], &[t2, sixteen]);

    let lo = bb.gen1(Op::Mul, &[], &[a.lo, b.lo]);
    let hi_low_product = bb.gen1(Op::Mul, &[], &[a1, b1]);
    let hi_low_product = bb.gen1(Op::Add, &[], &[hi_low_product, t1_hi]);
    let hi_low_product = bb.gen1(Op::Add, &[], &[hi_low_product, t2_hi]);

    let cross_a = bb.gen1(Op::Mul, &[], &[a.lo, b.hi]);
    let cross_b = bb.gen1(Op::Mul, &[], &[a.hi, b.lo]);
    let hi = bb.gen1(Op::Add, &[], &[hi_low_product, cross_a]);
    let hi = bb.gen1(Op::Add, &[], &[hi, cross_b]);
    join(bb, lo, hi)
}

fn shift64(bb: &mut BodyBuilder<'_>, op: Op, a: Pair, amount: Pair) -> NodeId {
    let s = amount.lo;
    let thirty_two = bb.arena().uint32_literal(32);
    let zero = bb.arena().uint32_literal(0);
    let big = bb.gen1(Op::Gte, &[], &[s, thirty_two]);
    let s_is_zero = bb.gen1(Op::Eq, &[], &[s, zero]);
    let inv = bb.gen1(Op::Sub, &[], &[thirty_two, s]);
    let over = bb.gen1(Op::Sub, &[], &[s, thirty_two]);

    match op {
        Op::Lshift => {
            let lo_small = bb.gen1(Op::Lshift, &[], &[a.lo, s]);
            let lo = bb.gen1(Op::Select, &[], &[big, zero, lo_small]);
            let cross_raw = bb.gen1(Op::RshiftLogical, &[], &[a.lo, inv]);
            let cross = bb.gen1(Op::Select, &[], &[s_is_zero, zero, cross_raw]);
            let hi_small = bb.gen1(Op::Lshift, &[], &[a.hi, s]);
            let hi_small = bb.gen1(Op::Or, &[], &[hi_small, cross]);
            let hi_big = bb.gen1(Op::Lshift, &[], &[a.lo, over]);
            let hi = bb.gen1(Op::Select, &[], &[big, hi_big, hi_small]);
            join(bb, lo, hi)
        }
        Op::RshiftLogical => {
            let hi_small = bb.gen1(Op::RshiftLogical, &[], &[a.hi, s]);
            let hi = bb.gen1(Op::Select, &[], &[big, zero, hi_small]);
            let cross_raw = bb.gen1(Op::Lshift, &[], &[a.hi, inv]);
            let cross = bb.gen1(Op::Select, &[], &[s_is_zero, zero, cross_raw]);
            let lo_small = bb.gen1(Op::RshiftLogical, &[], &[a.lo, s]);
            let lo_small = bb.gen1(Op::Or, &[], &[lo_small, cross]);
            let lo_big = bb.gen1(Op::RshiftLogical, &[], &[a.hi, over]);
            let lo = bb.gen1(Op::Select, &[], &[big, lo_big, lo_small]);
            join(bb, lo, hi)
        }
        Op::RshiftArithm => {
            let hi_signed = signed_view(bb, a.hi);
            let thirty_one = bb.arena().int32_literal(31);
            let fill_signed = bb.gen1(Op::RshiftArithm, &[], &[hi_signed, thirty_one]);
            let u32t = bb.arena().uint32_type();
            let fill = bb.gen_reinterpret_cast(u32t, fill_signed);
            let hi_small_signed = bb.gen1(Op::RshiftArithm, &[], &[hi_signed, s]);
            let hi_small = bb.gen_reinterpret_cast(u32t, hi_small_signed);
            let hi = bb.gen1(Op::Select, &[], &[big, fill, hi_small]);
            let cross_raw = bb.gen1(Op::Lshift, &[], &[a.hi, inv]);
            let cross = bb.gen1(Op::Select, &[], &[s_is_zero, zero, cross_raw]);
            let lo_small = bb.gen1(Op::RshiftLogical, &[], &[a.lo, s]);
            let lo_small = bb.gen1(Op::Or, &[], &[lo_small, cross]);
            let lo_big_signed = bb.gen1(Op::RshiftArithm, &[], &[hi_signed, over]);
            let lo_big = bb.gen_reinterpret_cast(u32t, lo_big_signed);
            let lo = bb.gen1(Op::Select, &[], &[big, lo_big, lo_small]);
            join(bb, lo, hi)
        }
        other => panic!("not a shift: {}", other.name()),
    }
}

fn compare64(bb: &mut BodyBuilder<'_>, op: Op, signed: bool, a: Pair, b: Pair) -> NodeId {
    match op {
        Op::Eq => {
            let lo = bb.gen1(Op::Eq, &[], &[a.lo, b.lo]);
            let hi = bb.gen1(Op::Eq, &[], &[a.hi, b.hi]);
            bb.gen1(Op::And, &[], &[lo, hi])
        }
        Op::Neq => {
            let lo = bb.gen1(Op::Neq, &[], &[a.lo, b.lo]);
            let hi = bb.gen1(Op::Neq, &[], &[a.hi, b.hi]);
            bb.gen1(Op::Or, &[], &[lo, hi])
        }
        Op::Lt | Op::Gt | Op::Lte | Op::Gte => {
            // compare high words (signed when the type is), tie-break on
            // the unsigned low words
            let (ah, bh) = if signed {
                (signed_view(bb, a.hi), signed_view(bb, b.hi))
            } else {
                (a.hi, b.hi)
            };
            let strict = match op {
                Op::Lt | Op::Lte => Op::Lt,
                _ => Op::Gt,
            };
            let hi_strict = bb.gen1(strict, &[], &[ah, bh]);
            let hi_eq = bb.gen1(Op::Eq, &[], &[a.hi, b.hi]);
            let lo_op = match op {
                Op::Lt => Op::Lt,
                Op::Lte => Op::Lte,
                Op::Gt => Op::Gt,
                Op::Gte => Op::Gte,
                _ => unreachable!(),
            };
            let lo_cmp = bb.gen1(lo_op, &[], &[a.lo, b.lo]);
            let tie = bb.gen1(Op::And, &[], &[hi_eq, lo_cmp]);
            bb.gen1(Op::Or, &[], &[hi_strict, tie])
        }
        other => panic!("not a comparison: {}", other.name()),
    }
}

impl<'a> Rewriter<'a> for LowerInt<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::IntType {
                width: IntWidth::I64,
                ..
            } => pair_type(&mut self.rw.dst_arena),

            NodeData::IntLit {
                width: IntWidth::I64,
                value,
                ..
            } => {
                let arena = &mut self.rw.dst_arena;
                let lo = arena.uint32_literal(value as u32);
                let hi = arena.uint32_literal((value >> 32) as u32);
                let ty = pair_type(arena);
                let contents = arena.intern_list(&[lo, hi]);
                arena.node(NodeData::Composite { ty, contents })
            }

            NodeData::Let {
                instruction,
                vars,
                tail,
            } if touches_wide_int(self.rw.src_arena, instruction) => {
                self.expand_wide_let(node, instruction, vars, tail)
            }

            _ => recreate_node_identity(self, node),
        }
    }
}

impl<'a> LowerInt<'a> {
    fn expand_wide_let(
        &mut self,
        node: NodeId,
        instruction: NodeId,
        vars: shade_ir::Nodes,
        tail: Option<NodeId>,
    ) -> NodeId {
        let NodeData::PrimOp {
            op,
            type_args,
            operands,
        } = self.rw.src_arena.data(instruction).clone()
        else {
            return recreate_node_identity(self, node);
        };
        let src_operands = self.rw.src_arena.node_list(operands).to_vec();
        let src_type_args = self.rw.src_arena.node_list(type_args).to_vec();

        // signedness comes from the source operand type
        let src_signed = src_operands.first().and_then(|&v| {
            let t = self.rw.src_arena.node_type(v)?;
            let t = get_unqualified_type(self.rw.src_arena, t);
            match self.rw.src_arena.data(t) {
                NodeData::IntType { signed, .. } => Some(*signed),
                _ => None,
            }
        });

        let operands: Vec<NodeId> = src_operands
            .iter()
            .map(|&v| rewrite_node(self, v))
            .collect();

        let result = match op {
            Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Xor | Op::Not | Op::Neg
            | Op::Lshift | Op::RshiftLogical | Op::RshiftArithm | Op::Eq | Op::Neq | Op::Lt
            | Op::Lte | Op::Gt | Op::Gte => {
                let (spine, value) = {
                    let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
                    let value = expand_arith(
                        &mut bb,
                        op,
                        src_signed.unwrap_or(false),
                        &operands,
                    );
                    let placeholder = bb.arena().node(NodeData::Unreachable);
                    (bb.finish_body(placeholder), value)
                };
                Some((spine, value))
            }
            Op::Convert => {
                let target_src = src_type_args[0];
                let target_wide = is_wide_int(self.rw.src_arena, target_src);
                let source_wide = src_operands
                    .first()
                    .and_then(|&v| self.rw.src_arena.node_type(v))
                    .map(|t| {
                        let t = get_unqualified_type(self.rw.src_arena, t);
                        is_wide_int(self.rw.src_arena, t)
                    })
                    .unwrap_or(false);
                let dst_target = rewrite_node(self, target_src);
                let (spine, value) = {
                    let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
                    let value = match (source_wide, target_wide) {
                        (false, true) => {
                            // widen: sign- or zero-fill the high word
                            let u32t = bb.arena().uint32_type();
                            let lo = bb.gen_convert(u32t, operands[0]);
                            let hi = if src_signed == Some(true) {
                                let signed = signed_view(&mut bb, lo);
                                let thirty_one = bb.arena().int32_literal(31);
                                let fill =
                                    bb.gen1(Op::RshiftArithm, &[], &[signed, thirty_one]);
                                bb.gen_reinterpret_cast(u32t, fill)
                            } else {
                                bb.arena().uint32_literal(0)
                            };
                            join(&mut bb, lo, hi)
                        }
                        (true, false) => {
                            // narrow: take the low word and convert down
                            let zero = bb.arena().int32_literal(0);
                            let lo = bb.gen1(Op::Extract, &[], &[operands[0], zero]);
                            bb.gen_convert(dst_target, lo)
                        }
                        _ => operands[0],
                    };
                    let placeholder = bb.arena().node(NodeData::Unreachable);
                    (bb.finish_body(placeholder), value)
                };
                Some((spine, value))
            }
            Op::Reinterpret => {
                // i64 <-> u64 is the identity on pairs
                let target_src = src_type_args[0];
                if is_wide_int(self.rw.src_arena, target_src) {
                    let placeholder = self.rw.dst_arena.node(NodeData::Unreachable);
                    Some((placeholder, operands[0]))
                } else {
                    panic!(
                        "reinterpreting emulated 64-bit integers as {} is unsupported",
                        self.rw.src_arena.data(target_src).tag_name()
                    )
                }
            }
            Op::Div | Op::Mod => {
                panic!("64-bit division is not supported when emulating int64")
            }
            // loads/stores were lowered to words before this pass; what
            // remains (extract, select, subgroup ops on pairs) rebuilds
            // structurally
            _ => None,
        };

        let Some((spine, value)) = result else {
            return recreate_node_identity(self, node);
        };

        let old_vars = self.rw.src_arena.node_list(vars).to_vec();
        assert_eq!(old_vars.len(), 1);
        self.rw.register_processed(old_vars[0], value);
        let tail = tail.expect("a let this late always has a tail");
        let tail = rewrite_node(self, tail);
        splice_spine_tail(&mut self.rw.dst_arena, spine, tail)
    }
}

fn expand_arith(bb: &mut BodyBuilder<'_>, op: Op, signed: bool, operands: &[NodeId]) -> NodeId {
    match op {
        Op::Add => {
            let a = split(bb, operands[0]);
            let b = split(bb, operands[1]);
            add64(bb, a, b)
        }
        Op::Sub => {
            let a = split(bb, operands[0]);
            let b = split(bb, operands[1]);
            sub64(bb, a, b)
        }
        Op::Mul => {
            let a = split(bb, operands[0]);
            let b = split(bb, operands[1]);
            mul64(bb, a, b)
        }
        Op::And | Op::Or | Op::Xor => {
            let a = split(bb, operands[0]);
            let b = split(bb, operands[1]);
            let lo = bb.gen1(op, &[], &[a.lo, b.lo]);
            let hi = bb.gen1(op, &[], &[a.hi, b.hi]);
            join(bb, lo, hi)
        }
        Op::Not => {
            let a = split(bb, operands[0]);
            let lo = bb.gen1(Op::Not, &[], &[a.lo]);
            let hi = bb.gen1(Op::Not, &[], &[a.hi]);
            join(bb, lo, hi)
        }
        Op::Neg => {
            let zero = bb.arena().uint32_literal(0);
            let z = Pair { lo: zero, hi: zero };
            let a = split(bb, operands[0]);
            sub64(bb, z, a)
        }
        Op::Lshift | Op::RshiftLogical | Op::RshiftArithm => {
            let a = split(bb, operands[0]);
            let amount = split(bb, operands[1]);
            shift64(bb, op, a, amount)
        }
        Op::Eq | Op::Neq | Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
            let a = split(bb, operands[0]);
            let b = split(bb, operands[1]);
            compare64(bb, op, signed, a, b)
        }
        other => panic!("no 64-bit expansion for {}", other.name()),
    }
}

pub fn run(config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    if !config.lower.int64 {
        return Err(CompileError::Unsupported(
            "lower_int runs only when int64 emulation is requested".into(),
        ));
    }
    let mut pass = LowerInt {
        rw: RewriteCtx::new(src, aconfig),
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
