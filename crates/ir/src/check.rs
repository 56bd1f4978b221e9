//! On-construction typing rules
//!
//! Each grammar variant with a typing rule derives a qualified result type
//! from its operand types. Failure is fatal: a mismatch here is a bug in
//! whichever pass built the node, never user error.

use crate::arena::{IrArena, MaskRepr, NodeId, Nodes};
use crate::node::{IntWidth, NodeData, Op};
use crate::types::{get_unqualified_type, is_qualified_uniform, pack_yield_types};

/// The concrete type of a mask value under the arena's configured
/// representation.
pub fn actual_mask_type(arena: &mut IrArena) -> NodeId {
    match arena.config().subgroup_mask_representation {
        MaskRepr::Abstract => arena.mask_type(),
        MaskRepr::Int64 => arena.uint64_type(),
        MaskRepr::PackedBallot => {
            let elem = arena.uint32_type();
            arena.node(NodeData::PackType { elem, width: 4 })
        }
    }
}

/// Wrap a data type with a uniformity qualifier. Outside SIMT mode there is
/// no varying data, so everything degrades to uniform.
fn q(arena: &mut IrArena, uniform: bool, inner: NodeId) -> NodeId {
    let uniform = uniform || !arena.config().is_simt;
    arena.qualified_type(uniform, inner)
}

fn value_ty(arena: &IrArena, v: NodeId) -> NodeId {
    arena.node_type(v).unwrap_or_else(|| {
        panic!(
            "operand {} has no derived type in a typed arena",
            arena.data(v).tag_name()
        )
    })
}

fn operand_types(arena: &IrArena, operands: Nodes) -> Vec<NodeId> {
    arena
        .node_list(operands)
        .iter()
        .map(|&v| value_ty(arena, v))
        .collect()
}

/// Varying < Uniform: the result of combining operands is uniform only when
/// every operand is.
fn meet(arena: &IrArena, types: &[NodeId]) -> bool {
    types.iter().all(|&t| is_qualified_uniform(arena, t))
}

fn expect_same_data_type(arena: &IrArena, op: Op, types: &[NodeId]) -> NodeId {
    let first = get_unqualified_type(arena, types[0]);
    for &t in &types[1..] {
        let u = get_unqualified_type(arena, t);
        assert_eq!(
            first,
            u,
            "{}: operand type mismatch ({} vs {})",
            op.name(),
            arena.data(first).tag_name(),
            arena.data(u).tag_name()
        );
    }
    first
}

/// Step a composite or pointee type through one access index.
fn walk_index(arena: &IrArena, t: NodeId, index: NodeId) -> NodeId {
    match arena.data(t) {
        NodeData::ArrayType { elem, .. } => *elem,
        NodeData::PackType { elem, .. } => *elem,
        NodeData::RecordType { members, .. } => {
            let i = arena
                .resolve_int_literal(index)
                .expect("record access requires a literal index") as usize;
            arena.node_list(*members)[i]
        }
        other => panic!("cannot index into {}", other.tag_name()),
    }
}

pub(crate) fn derive_type(arena: &mut IrArena, data: &NodeData) -> Option<NodeId> {
    use NodeData::*;
    match data {
        IntLit { width, signed, .. } => {
            let t = arena.int_type(*width, *signed);
            Some(q(arena, true, t))
        }
        FloatLit { width, .. } => {
            let t = arena.float_type(*width);
            Some(q(arena, true, t))
        }
        BoolLit { .. } => {
            let t = arena.bool_type();
            Some(q(arena, true, t))
        }
        Composite { ty, contents } => {
            let uniform = meet(arena, &operand_types(arena, *contents));
            Some(q(arena, uniform, *ty))
        }
        Undef { ty } => Some(q(arena, true, *ty)),
        Variable { ty, .. } => *ty,
        FnAddr { function } => {
            // functions and continuation blocks are both addressable; a
            // block's address types as a function returning nothing
            let (params, returns) = match arena.data(*function) {
                Function {
                    params,
                    return_types,
                    ..
                } => (*params, Some(*return_types)),
                BasicBlock { params, .. } => (*params, None),
                other => panic!("fn_addr of {}", other.tag_name()),
            };
            let returns = match returns {
                Some(r) => r,
                None => arena.empty(),
            };
            let param_types: Vec<_> = arena
                .node_list(params)
                .iter()
                .map(|&p| value_ty(arena, p))
                .collect();
            let params = arena.intern_list(&param_types);
            let t = arena.node(FnType {
                params,
                returns,
            });
            Some(q(arena, true, t))
        }
        RefDecl { decl } => match arena.data(*decl).clone() {
            GlobalVariable { ty, addr_space, .. } => {
                let t = arena.node(PtrType {
                    addr_space,
                    pointee: ty,
                });
                Some(q(arena, true, t))
            }
            Constant { type_hint, .. } => {
                let hint =
                    type_hint.expect("constant referenced before its type hint was rewritten");
                let inner = get_unqualified_type(arena, hint);
                Some(q(arena, true, inner))
            }
            other => panic!("ref_decl of {}", other.tag_name()),
        },

        PrimOp {
            op,
            type_args,
            operands,
        } => Some(derive_primop_type(arena, *op, *type_args, *operands)),

        Call { callee, args } => {
            let callee_t = get_unqualified_type(arena, value_ty(arena, *callee));
            let (params, returns) = match arena.data(callee_t) {
                FnType { params, returns } => (*params, *returns),
                other => panic!("call through non-function type {}", other.tag_name()),
            };
            let expected = arena.node_list(params).to_vec();
            let actual = operand_types(arena, *args);
            assert_eq!(expected.len(), actual.len(), "call arity mismatch");
            for (e, a) in expected.iter().zip(&actual) {
                assert_eq!(
                    get_unqualified_type(arena, *e),
                    get_unqualified_type(arena, *a),
                    "call argument type mismatch"
                );
            }
            let returns = arena.node_list(returns).to_vec();
            Some(pack_yield_types(arena, &returns))
        }

        If {
            yield_types,
            condition,
            ..
        } => {
            let cond_t = get_unqualified_type(arena, value_ty(arena, *condition));
            assert!(
                matches!(arena.data(cond_t), BoolType),
                "if condition must be boolean"
            );
            let yields = arena.node_list(*yield_types).to_vec();
            Some(pack_yield_types(arena, &yields))
        }
        Match { yield_types, .. } | Loop { yield_types, .. } => {
            let yields = arena.node_list(*yield_types).to_vec();
            Some(pack_yield_types(arena, &yields))
        }
        Quote { values } => {
            let types = operand_types(arena, *values);
            Some(pack_yield_types(arena, &types))
        }

        // types, terminators, abstractions, declarations and annotations
        // carry no derived type
        _ => None,
    }
}

fn derive_primop_type(arena: &mut IrArena, op: Op, type_args: Nodes, operands: Nodes) -> NodeId {
    use Op::*;
    let types = operand_types(arena, operands);
    let targs = arena.node_list(type_args).to_vec();
    let ops = arena.node_list(operands).to_vec();
    match op {
        Add | Sub | Mul | Div | Mod | And | Or | Xor => {
            assert_eq!(types.len(), 2, "{} expects two operands", op.name());
            let t = expect_same_data_type(arena, op, &types);
            let uniform = meet(arena, &types);
            q(arena, uniform, t)
        }
        Lshift | RshiftLogical | RshiftArithm => {
            assert_eq!(types.len(), 2, "{} expects two operands", op.name());
            let t = get_unqualified_type(arena, types[0]);
            let uniform = meet(arena, &types);
            q(arena, uniform, t)
        }
        Neg | Not => {
            assert_eq!(types.len(), 1, "{} expects one operand", op.name());
            let t = get_unqualified_type(arena, types[0]);
            let uniform = meet(arena, &types);
            q(arena, uniform, t)
        }
        Eq | Neq | Gt | Gte | Lt | Lte => {
            assert_eq!(types.len(), 2, "{} expects two operands", op.name());
            let t = expect_same_data_type(arena, op, &types);
            let uniform = meet(arena, &types);
            // comparing packs compares lanewise
            let b = match arena.data(t) {
                NodeData::PackType { width, .. } => {
                    let width = *width;
                    let elem = arena.bool_type();
                    arena.node(NodeData::PackType { elem, width })
                }
                _ => arena.bool_type(),
            };
            q(arena, uniform, b)
        }
        Select => {
            assert_eq!(types.len(), 3, "select expects three operands");
            let cond_t = get_unqualified_type(arena, types[0]);
            let cond_ok = match arena.data(cond_t) {
                NodeData::BoolType => true,
                NodeData::PackType { elem, .. } => {
                    matches!(arena.data(*elem), NodeData::BoolType)
                }
                _ => false,
            };
            assert!(cond_ok, "select condition must be boolean");
            let t = expect_same_data_type(arena, op, &types[1..]);
            let uniform = meet(arena, &types);
            q(arena, uniform, t)
        }
        Convert | Reinterpret => {
            assert_eq!(targs.len(), 1, "{} expects one type argument", op.name());
            assert_eq!(types.len(), 1);
            let uniform = meet(arena, &types);
            q(arena, uniform, targs[0])
        }
        Extract => {
            assert!(types.len() >= 2, "extract expects a composite and indices");
            let mut t = get_unqualified_type(arena, types[0]);
            for &ix in &ops[1..] {
                t = walk_index(arena, t, ix);
            }
            let uniform = meet(arena, &types);
            q(arena, uniform, t)
        }
        Insert => {
            assert!(types.len() >= 3, "insert expects composite, value, indices");
            let t = get_unqualified_type(arena, types[0]);
            let uniform = meet(arena, &types);
            q(arena, uniform, t)
        }
        Alloca => {
            assert_eq!(targs.len(), 1, "alloca expects one type argument");
            let t = arena.node(NodeData::PtrType {
                addr_space: crate::types::AddressSpace::Function,
                pointee: targs[0],
            });
            q(arena, false, t)
        }
        Load => {
            assert_eq!(types.len(), 1, "load expects a pointer");
            let ptr_t = get_unqualified_type(arena, types[0]);
            let (addr_space, pointee) = match arena.data(ptr_t) {
                NodeData::PtrType {
                    addr_space,
                    pointee,
                } => (*addr_space, *pointee),
                other => panic!("load through non-pointer {}", other.tag_name()),
            };
            let uniform = is_qualified_uniform(arena, types[0]) && addr_space.is_uniform();
            q(arena, uniform, pointee)
        }
        Store => {
            assert_eq!(types.len(), 2, "store expects a pointer and a value");
            let ptr_t = get_unqualified_type(arena, types[0]);
            let pointee = match arena.data(ptr_t) {
                NodeData::PtrType { pointee, .. } => *pointee,
                other => panic!("store through non-pointer {}", other.tag_name()),
            };
            assert_eq!(
                pointee,
                get_unqualified_type(arena, types[1]),
                "store value type mismatch"
            );
            arena.unit_type()
        }
        Lea => {
            assert!(types.len() >= 2, "lea expects a pointer and an offset");
            let ptr_t = get_unqualified_type(arena, types[0]);
            let (addr_space, pointee) = match arena.data(ptr_t) {
                NodeData::PtrType {
                    addr_space,
                    pointee,
                } => (*addr_space, *pointee),
                other => panic!("lea through non-pointer {}", other.tag_name()),
            };
            let mut t = pointee;
            for &ix in &ops[2..] {
                t = walk_index(arena, t, ix);
            }
            let uniform = meet(arena, &types);
            let out = arena.node(NodeData::PtrType {
                addr_space,
                pointee: t,
            });
            q(arena, uniform, out)
        }
        GetStackBase => {
            let u8t = arena.int_type(IntWidth::I8, false);
            let arr = arena.node(NodeData::ArrayType {
                elem: u8t,
                size: None,
            });
            let t = arena.node(NodeData::PtrType {
                addr_space: crate::types::AddressSpace::Private,
                pointee: arr,
            });
            q(arena, false, t)
        }
        GetStackBaseUniform => {
            let u8t = arena.int_type(IntWidth::I8, false);
            let arr = arena.node(NodeData::ArrayType {
                elem: u8t,
                size: None,
            });
            let t = arena.node(NodeData::PtrType {
                addr_space: crate::types::AddressSpace::Subgroup,
                pointee: arr,
            });
            q(arena, true, t)
        }
        GetStackPointer => {
            let t = arena.uint32_type();
            q(arena, false, t)
        }
        SetStackPointer => {
            assert_eq!(types.len(), 1);
            arena.unit_type()
        }
        PushStack | PushStackUniform => {
            assert_eq!(targs.len(), 1, "{} expects one type argument", op.name());
            assert_eq!(types.len(), 1);
            assert_eq!(
                get_unqualified_type(arena, types[0]),
                targs[0],
                "{}: pushed value does not match the type argument",
                op.name()
            );
            arena.unit_type()
        }
        PopStack => {
            assert_eq!(targs.len(), 1, "pop_stack expects one type argument");
            q(arena, false, targs[0])
        }
        PopStackUniform => {
            assert_eq!(targs.len(), 1, "pop_stack_uniform expects one type argument");
            q(arena, true, targs[0])
        }
        SubgroupBroadcastFirst | SubgroupAssumeUniform => {
            assert_eq!(types.len(), 1, "{} expects one operand", op.name());
            let t = get_unqualified_type(arena, types[0]);
            q(arena, true, t)
        }
        SubgroupShuffle => {
            assert_eq!(types.len(), 2, "shuffle expects a value and a lane");
            let t = get_unqualified_type(arena, types[0]);
            q(arena, false, t)
        }
        SubgroupElect => {
            let b = arena.bool_type();
            q(arena, false, b)
        }
        SubgroupActiveMask | EmptyMask => {
            let m = actual_mask_type(arena);
            q(arena, true, m)
        }
        SubgroupBallot => {
            assert_eq!(types.len(), 1, "ballot expects one operand");
            let m = actual_mask_type(arena);
            q(arena, true, m)
        }
        SubgroupLocalId => {
            let t = arena.uint32_type();
            q(arena, false, t)
        }
        MaskIsThreadActive => {
            assert_eq!(types.len(), 2, "mask_is_thread_active expects two operands");
            let uniform = meet(arena, &types);
            let b = arena.bool_type();
            q(arena, uniform, b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;

    fn typed_arena() -> IrArena {
        IrArena::new(ArenaConfig {
            name_bound: true,
            check_types: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_literal_types_are_uniform() {
        let mut a = typed_arena();
        let x = a.int32_literal(3);
        let t = a.node_type(x).unwrap();
        assert!(is_qualified_uniform(&a, t));
        let int32 = a.int32_type();
        assert_eq!(get_unqualified_type(&a, t), int32);
    }

    #[test]
    fn test_add_meets_qualification() {
        let mut a = typed_arena();
        let int32 = a.int32_type();
        let varying = a.qualified_type(false, int32);
        let v = a.fresh_var(Some(varying), "v");
        let lit = a.int32_literal(1);
        let ta = a.empty();
        let operands = a.intern_list(&[v, lit]);
        let sum = a.prim_op(Op::Add, ta, operands);
        let t = a.node_type(sum).unwrap();
        assert!(!is_qualified_uniform(&a, t));
        assert_eq!(get_unqualified_type(&a, t), int32);
    }

    #[test]
    fn test_broadcast_makes_uniform() {
        let mut a = typed_arena();
        let int64 = a.int64_type();
        let varying = a.qualified_type(false, int64);
        let v = a.fresh_var(Some(varying), "v");
        let ta = a.empty();
        let operands = a.singleton(v);
        let b = a.prim_op(Op::SubgroupBroadcastFirst, ta, operands);
        let t = a.node_type(b).unwrap();
        assert!(is_qualified_uniform(&a, t));
        assert_eq!(get_unqualified_type(&a, t), int64);
    }

    #[test]
    fn test_load_uniformity_follows_address_space() {
        let mut a = typed_arena();
        let int32 = a.int32_type();
        let private_ptr = a.node(NodeData::PtrType {
            addr_space: crate::types::AddressSpace::Private,
            pointee: int32,
        });
        let qp = a.qualified_type(true, private_ptr);
        let p = a.fresh_var(Some(qp), "p");
        let ta = a.empty();
        let operands = a.singleton(p);
        let loaded = a.prim_op(Op::Load, ta, operands);
        let t = a.node_type(loaded).unwrap();
        // private memory is per-thread: never uniform, even through a
        // uniform pointer
        assert!(!is_qualified_uniform(&a, t));
    }

    #[test]
    #[should_panic(expected = "operand type mismatch")]
    fn test_add_rejects_mixed_widths() {
        let mut a = typed_arena();
        let x = a.int32_literal(1);
        let y = a.int64_literal(1);
        let ta = a.empty();
        let operands = a.intern_list(&[x, y]);
        let _ = a.prim_op(Op::Add, ta, operands);
    }

    #[test]
    fn test_mask_type_follows_representation() {
        let mut a = IrArena::new(ArenaConfig {
            check_types: true,
            subgroup_mask_representation: MaskRepr::Int64,
            ..Default::default()
        });
        let ta = a.empty();
        let ops = a.empty();
        let m = a.prim_op(Op::EmptyMask, ta, ops);
        let t = a.node_type(m).unwrap();
        let u64t = a.uint64_type();
        assert_eq!(get_unqualified_type(&a, t), u64t);
    }
}
