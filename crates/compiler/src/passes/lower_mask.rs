//! lower_mask: concretize the subgroup mask representation
//!
//! The destination arena carries the target representation, so the mask
//! type itself rewrites to a 64-bit integer or a packed ballot vector, and
//! ballots re-derive their type automatically. What needs doing by hand is
//! the mask primops whose expansion is representation-specific.

use shade_ir::arena::{ArenaConfig, MaskRepr, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};
use shade_ir::{BodyBuilder, actual_mask_type};

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    rewrite_nodes, splice_spine_tail,
};

struct LowerMask<'a> {
    rw: RewriteCtx<'a>,
}

impl<'a> LowerMask<'a> {
    /// `(mask >> index) & 1 != 0`; the packed representation selects the
    /// right word first.
    fn expand_is_thread_active(
        &mut self,
        mask: NodeId,
        index: NodeId,
        old_vars: shade_ir::Nodes,
        tail: Option<NodeId>,
    ) -> NodeId {
        let repr = self.rw.dst_arena.config().subgroup_mask_representation;
        let (spine, result) = {
            let mut bb = BodyBuilder::begin(&mut self.rw.dst_arena);
            let result = match repr {
                MaskRepr::Int64 => {
                    let u64t = bb.arena().uint64_type();
                    let wide_index = bb.gen_convert(u64t, index);
                    let shifted = bb.gen1(Op::RshiftLogical, &[], &[mask, wide_index]);
                    let one = bb.arena().uint64_literal(1);
                    let bit = bb.gen1(Op::And, &[], &[shifted, one]);
                    let zero = bb.arena().uint64_literal(0);
                    bb.gen1(Op::Neq, &[], &[bit, zero])
                }
                MaskRepr::PackedBallot => {
                    let thirty_two = bb.arena().uint32_literal(32);
                    let word_ix = bb.gen1(Op::Div, &[], &[index, thirty_two]);
                    let bit_ix = bb.gen1(Op::Mod, &[], &[index, thirty_two]);
                    let word = bb.gen1(Op::Extract, &[], &[mask, word_ix]);
                    let shifted = bb.gen1(Op::RshiftLogical, &[], &[word, bit_ix]);
                    let one = bb.arena().uint32_literal(1);
                    let bit = bb.gen1(Op::And, &[], &[shifted, one]);
                    let zero = bb.arena().uint32_literal(0);
                    bb.gen1(Op::Neq, &[], &[bit, zero])
                }
                MaskRepr::Abstract => unreachable!("checked at pass entry"),
            };
            let placeholder = bb.arena().node(NodeData::Unreachable);
            (bb.finish_body(placeholder), result)
        };

        let old_vars = self.rw.src_arena.node_list(old_vars).to_vec();
        assert_eq!(old_vars.len(), 1);
        self.rw.register_processed(old_vars[0], result);
        let tail = tail.expect("a let this late always has a tail");
        let tail = rewrite_node(self, tail);
        splice_spine_tail(&mut self.rw.dst_arena, spine, tail)
    }

    fn empty_mask_value(&mut self) -> NodeId {
        let repr = self.rw.dst_arena.config().subgroup_mask_representation;
        let arena = &mut self.rw.dst_arena;
        match repr {
            MaskRepr::Int64 => arena.uint64_literal(0),
            MaskRepr::PackedBallot => {
                let ty = actual_mask_type(arena);
                let zero = arena.uint32_literal(0);
                let contents = arena.intern_list(&[zero, zero, zero, zero]);
                arena.node(NodeData::Composite { ty, contents })
            }
            MaskRepr::Abstract => unreachable!("checked at pass entry"),
        }
    }
}

impl<'a> Rewriter<'a> for LowerMask<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::MaskType => actual_mask_type(&mut self.rw.dst_arena),

            NodeData::Let {
                instruction,
                vars,
                tail,
            } => {
                let instr_data = self.rw.src_arena.data(instruction).clone();
                if let NodeData::PrimOp { op, operands, .. } = instr_data {
                    match op {
                        Op::EmptyMask => {
                            let value = self.empty_mask_value();
                            let old_vars = self.rw.src_arena.node_list(vars).to_vec();
                            assert_eq!(old_vars.len(), 1);
                            self.rw.register_processed(old_vars[0], value);
                            let tail = tail.expect("a let this late always has a tail");
                            return rewrite_node(self, tail);
                        }
                        Op::SubgroupActiveMask => {
                            // an active mask is a ballot of true
                            let t = self.rw.dst_arena.true_literal();
                            let arena = &mut self.rw.dst_arena;
                            let ta = arena.empty();
                            let ops = arena.singleton(t);
                            let ballot = arena.prim_op(Op::SubgroupBallot, ta, ops);
                            let new_vars = rewrite_nodes(self, vars);
                            let tail = tail.map(|t| rewrite_node(self, t));
                            return self.rw.dst_arena.node(NodeData::Let {
                                instruction: ballot,
                                vars: new_vars,
                                tail,
                            });
                        }
                        Op::MaskIsThreadActive => {
                            let operands = self.rw.src_arena.node_list(operands).to_vec();
                            let mask = rewrite_node(self, operands[0]);
                            let index = rewrite_node(self, operands[1]);
                            return self.expand_is_thread_active(mask, index, vars, tail);
                        }
                        _ => {}
                    }
                }
                recreate_node_identity(self, node)
            }

            _ => recreate_node_identity(self, node),
        }
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    if matches!(aconfig.subgroup_mask_representation, MaskRepr::Abstract) {
        return Err(CompileError::Unsupported(
            "lower_mask requires a concrete mask representation".into(),
        ));
    }
    let mut pass = LowerMask {
        rw: RewriteCtx::new(src, aconfig),
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
