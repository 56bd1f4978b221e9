//! simt2d: leave the SIMT model
//!
//! Varying values become explicit N-wide packs (N the subgroup size),
//! uniform values stay scalar, and every function takes a leading lane
//! mask. Operations that mix packs and scalars splat the scalar; the few
//! surviving subgroup intrinsics become lane-indexed pack operations. The
//! destination arena runs with `is_simt` off, so qualification degrades to
//! uniform everywhere.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};
use shade_ir::types::get_unqualified_type;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    rewrite_nodes, rewrite_string,
};

struct Simt2d<'a> {
    rw: RewriteCtx<'a>,
    width: u32,
    /// The lane-mask parameter of the function currently being rewritten.
    current_mask: Option<NodeId>,
}

impl<'a> Simt2d<'a> {
    fn pack_of(&mut self, elem: NodeId) -> NodeId {
        let width = self.width;
        self.rw.dst_arena.node(NodeData::PackType { elem, width })
    }

    /// Repeat a scalar value into a full pack.
    fn splat(&mut self, value: NodeId) -> NodeId {
        let ty = shade_ir::value_type(&self.rw.dst_arena, value);
        let elem = get_unqualified_type(&self.rw.dst_arena, ty);
        let pack = self.pack_of(elem);
        let contents = vec![value; self.width as usize];
        let contents = self.rw.dst_arena.intern_list(&contents);
        self.rw.dst_arena.node(NodeData::Composite {
            ty: pack,
            contents,
        })
    }

    fn is_pack_value(&self, value: NodeId) -> bool {
        let Some(ty) = self.rw.dst_arena.node_type(value) else {
            return false;
        };
        let ty = get_unqualified_type(&self.rw.dst_arena, ty);
        matches!(self.rw.dst_arena.data(ty), NodeData::PackType { .. })
    }
}

/// Operations whose operands must agree in width after the transform.
fn is_lanewise(op: Op) -> bool {
    use Op::*;
    matches!(
        op,
        Add | Sub
            | Mul
            | Div
            | Mod
            | Neg
            | And
            | Or
            | Xor
            | Not
            | Lshift
            | RshiftLogical
            | RshiftArithm
            | Eq
            | Neq
            | Gt
            | Gte
            | Lt
            | Lte
            | Select
    )
}

impl<'a> Rewriter<'a> for Simt2d<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            // varying data widens to a pack, uniform data stays scalar
            NodeData::QualifiedType { uniform, inner } => {
                let inner = rewrite_node(self, inner);
                let inner = if uniform { inner } else { self.pack_of(inner) };
                self.rw.dst_arena.qualified_type(true, inner)
            }

            NodeData::PrimOp {
                op,
                type_args,
                operands,
            } => {
                let type_args = rewrite_nodes(self, type_args);
                let operands = rewrite_nodes(self, operands);
                let operand_ids = self.rw.dst_arena.node_list(operands).to_vec();

                match op {
                    Op::SubgroupBroadcastFirst => {
                        let v = operand_ids[0];
                        if self.is_pack_value(v) {
                            let zero = self.rw.dst_arena.int32_literal(0);
                            let ops = self.rw.dst_arena.intern_list(&[v, zero]);
                            let ta = self.rw.dst_arena.empty();
                            return self.rw.dst_arena.prim_op(Op::Extract, ta, ops);
                        }
                        let values = self.rw.dst_arena.singleton(v);
                        self.rw.dst_arena.quote(values)
                    }
                    Op::SubgroupAssumeUniform => {
                        let values = self.rw.dst_arena.singleton(operand_ids[0]);
                        self.rw.dst_arena.quote(values)
                    }
                    Op::SubgroupLocalId => {
                        let lanes: Vec<NodeId> = (0..self.width)
                            .map(|i| self.rw.dst_arena.uint32_literal(i))
                            .collect();
                        let u32t = self.rw.dst_arena.uint32_type();
                        let pack = self.pack_of(u32t);
                        let contents = self.rw.dst_arena.intern_list(&lanes);
                        let v = self.rw.dst_arena.node(NodeData::Composite {
                            ty: pack,
                            contents,
                        });
                        let values = self.rw.dst_arena.singleton(v);
                        self.rw.dst_arena.quote(values)
                    }
                    Op::SubgroupElect => {
                        let mut lanes = Vec::with_capacity(self.width as usize);
                        lanes.push(self.rw.dst_arena.true_literal());
                        for _ in 1..self.width {
                            lanes.push(self.rw.dst_arena.false_literal());
                        }
                        let bool_t = self.rw.dst_arena.bool_type();
                        let pack = self.pack_of(bool_t);
                        let contents = self.rw.dst_arena.intern_list(&lanes);
                        let v = self.rw.dst_arena.node(NodeData::Composite {
                            ty: pack,
                            contents,
                        });
                        let values = self.rw.dst_arena.singleton(v);
                        self.rw.dst_arena.quote(values)
                    }
                    Op::SubgroupBallot | Op::SubgroupShuffle | Op::SubgroupActiveMask => {
                        panic!(
                            "{} must be lowered before leaving SIMT",
                            op.name()
                        )
                    }
                    _ if is_lanewise(op) => {
                        let any_pack =
                            operand_ids.iter().any(|&v| self.is_pack_value(v));
                        let operands = if any_pack {
                            let splatted: Vec<NodeId> = operand_ids
                                .into_iter()
                                .map(|v| {
                                    if self.is_pack_value(v) {
                                        v
                                    } else {
                                        self.splat(v)
                                    }
                                })
                                .collect();
                            self.rw.dst_arena.intern_list(&splatted)
                        } else {
                            operands
                        };
                        self.rw.dst_arena.prim_op(op, type_args, operands)
                    }
                    _ => self.rw.dst_arena.prim_op(op, type_args, operands),
                }
            }

            NodeData::Call { callee, args } => {
                let callee = rewrite_node(self, callee);
                let args = rewrite_nodes(self, args);
                let mask = self.current_mask.expect("call outside a function");
                let mut full = vec![mask];
                full.extend_from_slice(self.rw.dst_arena.node_list(args));
                let args = self.rw.dst_arena.intern_list(&full);
                self.rw.dst_arena.node(NodeData::Call { callee, args })
            }

            _ => recreate_node_identity(self, node),
        }
    }

    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        let NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            ..
        } = self.rw.src_arena.data(decl).clone()
        else {
            return crate::rewrite::recreate_decl_stub(self, decl);
        };
        let name = rewrite_string(self, name);
        let annotations = rewrite_nodes(self, annotations);

        // the lane mask leads every signature
        let u64t = self.rw.dst_arena.uint64_type();
        let mask_ty = self.rw.dst_arena.qualified_type(true, u64t);
        let mask = self.rw.dst_arena.fresh_var(Some(mask_ty), "lane_mask");

        let params = rewrite_nodes(self, params);
        let mut full = vec![mask];
        full.extend_from_slice(self.rw.dst_arena.node_list(params));
        let params = self.rw.dst_arena.intern_list(&full);
        let return_types = rewrite_nodes(self, return_types);
        self.rw.dst_arena.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: None,
        })
    }

    fn process_decl_body(&mut self, old: NodeId, new: NodeId) {
        if matches!(self.rw.src_arena.data(old), NodeData::Function { .. }) {
            let params = shade_ir::get_abstraction_params(&self.rw.dst_arena, new);
            self.current_mask = self.rw.dst_arena.node_list(params).first().copied();
        }
        crate::rewrite::recreate_decl_body(self, old, new);
        self.current_mask = None;
    }
}

pub fn run(config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    if !config.lower.simt_to_explicit_simd {
        return Err(CompileError::Unsupported(
            "simt2d runs only when explicit SIMD is requested".into(),
        ));
    }
    let mut pass = Simt2d {
        rw: RewriteCtx::new(src, aconfig),
        width: config.subgroup_size,
        current_mask: None,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
