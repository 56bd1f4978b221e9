//! Local algebraic simplification at construction time
//!
//! Folds are value-preserving under every enabled static semantics: constant
//! arithmetic, identity operands, and dead lets. A successful fold returns a
//! node that replaces the one under construction (usually a [`Quote`] so the
//! result still sits in instruction position). Substitution of quoted lets
//! into their tails is the rewriter's job, since it crosses arenas.
//!
//! [`Quote`]: crate::node::NodeData::Quote

use std::collections::HashSet;

use crate::arena::{IrArena, NodeId};
use crate::node::{IntWidth, NodeData, Op};

/// Truncate a 64-bit result to the literal's width.
fn wrap(width: IntWidth, value: u64) -> u64 {
    match width {
        IntWidth::I64 => value,
        _ => value & ((1u64 << width.bits()) - 1),
    }
}

fn int_lit(arena: &IrArena, id: NodeId) -> Option<(IntWidth, bool, u64)> {
    match arena.data(id) {
        NodeData::IntLit { width, signed, value } => Some((*width, *signed, *value)),
        _ => None,
    }
}

fn bool_lit(arena: &IrArena, id: NodeId) -> Option<bool> {
    match arena.data(id) {
        NodeData::BoolLit { value } => Some(*value),
        _ => None,
    }
}

/// Whether `root` (or anything it references) mentions one of `vars`.
fn uses_any(arena: &IrArena, root: NodeId, vars: &[NodeId]) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if vars.contains(&id) {
            return true;
        }
        stack.extend(arena.data(id).children(arena));
    }
    false
}

pub(crate) fn fold_node(arena: &mut IrArena, data: &NodeData) -> Option<NodeId> {
    match data {
        NodeData::PrimOp { op, operands, .. } => {
            let ops = arena.node_list(*operands).to_vec();
            fold_primop(arena, *op, &ops)
        }
        // dead let: a pure instruction whose outputs the tail never reads
        NodeData::Let {
            instruction,
            vars,
            tail: Some(tail),
        } => {
            let pure = match arena.data(*instruction) {
                NodeData::PrimOp { op, .. } => op.is_pure(),
                NodeData::Quote { .. } => true,
                _ => false,
            };
            let vars = arena.node_list(*vars).to_vec();
            if pure && !uses_any(arena, *tail, &vars) {
                return Some(*tail);
            }
            None
        }
        _ => None,
    }
}

fn fold_primop(arena: &mut IrArena, op: Op, ops: &[NodeId]) -> Option<NodeId> {
    use Op::*;
    match op {
        Add | Sub | Mul | Div | Mod | And | Or | Xor | Lshift | RshiftLogical | RshiftArithm => {
            fold_int_arith(arena, op, ops)
        }
        Eq | Neq | Gt | Gte | Lt | Lte => fold_comparison(arena, op, ops),
        Neg => {
            if ops.len() != 1 {
                return None;
            }
            let (w, s, v) = int_lit(arena, ops[0])?;
            let lit = arena.int_literal(w, s, wrap(w, v.wrapping_neg()));
            Some(arena.quote_single(lit))
        }
        Not => {
            if ops.len() != 1 {
                return None;
            }
            if let Some(b) = bool_lit(arena, ops[0]) {
                let lit = if b {
                    arena.false_literal()
                } else {
                    arena.true_literal()
                };
                return Some(arena.quote_single(lit));
            }
            let (w, s, v) = int_lit(arena, ops[0])?;
            let lit = arena.int_literal(w, s, wrap(w, !v));
            Some(arena.quote_single(lit))
        }
        Select => {
            if ops.len() != 3 {
                return None;
            }
            let c = bool_lit(arena, ops[0])?;
            let chosen = if c { ops[1] } else { ops[2] };
            Some(arena.quote_single(chosen))
        }
        // broadcasting or pinning an already-uniform literal is a no-op
        SubgroupBroadcastFirst | SubgroupAssumeUniform => {
            if ops.len() != 1 {
                return None;
            }
            if int_lit(arena, ops[0]).is_some() || bool_lit(arena, ops[0]).is_some() {
                return Some(arena.quote_single(ops[0]));
            }
            None
        }
        _ => None,
    }
}

fn fold_int_arith(arena: &mut IrArena, op: Op, ops: &[NodeId]) -> Option<NodeId> {
    use Op::*;
    if ops.len() != 2 {
        return None;
    }
    let lhs = int_lit(arena, ops[0]);
    let rhs = int_lit(arena, ops[1]);

    // both constant: evaluate
    if let (Some((w, s, a)), Some((_, _, b))) = (lhs, rhs) {
        let sa = arena.resolve_int_literal(ops[0]).unwrap();
        let sb = arena.resolve_int_literal(ops[1]).unwrap();
        let raw = match op {
            Add => a.wrapping_add(b),
            Sub => a.wrapping_sub(b),
            Mul => a.wrapping_mul(b),
            Div if b != 0 => {
                if s {
                    (sa.wrapping_div(sb)) as u64
                } else {
                    a / b
                }
            }
            Mod if b != 0 => {
                if s {
                    (sa.wrapping_rem(sb)) as u64
                } else {
                    a % b
                }
            }
            And => a & b,
            Or => a | b,
            Xor => a ^ b,
            Lshift => a.wrapping_shl(b as u32),
            RshiftLogical => wrap(w, a).wrapping_shr(b as u32),
            RshiftArithm => (sa.wrapping_shr(b as u32)) as u64,
            _ => return None,
        };
        let lit = arena.int_literal(w, s, wrap(w, raw));
        return Some(arena.quote_single(lit));
    }

    // identities
    let lhs_val = lhs.map(|(_, _, v)| v);
    let rhs_val = rhs.map(|(_, _, v)| v);
    let identity = match op {
        Add | Or | Xor => {
            if rhs_val == Some(0) {
                Some(ops[0])
            } else if lhs_val == Some(0) {
                Some(ops[1])
            } else {
                None
            }
        }
        Sub | Lshift | RshiftLogical | RshiftArithm => {
            if rhs_val == Some(0) {
                Some(ops[0])
            } else {
                None
            }
        }
        Mul => {
            if rhs_val == Some(1) {
                Some(ops[0])
            } else if lhs_val == Some(1) {
                Some(ops[1])
            } else {
                None
            }
        }
        Div => {
            if rhs_val == Some(1) {
                Some(ops[0])
            } else {
                None
            }
        }
        _ => None,
    };
    identity.map(|v| arena.quote_single(v))
}

fn fold_comparison(arena: &mut IrArena, op: Op, ops: &[NodeId]) -> Option<NodeId> {
    use Op::*;
    if ops.len() != 2 {
        return None;
    }
    let (_, signed, _) = int_lit(arena, ops[0])?;
    int_lit(arena, ops[1])?;
    let a = arena.resolve_int_literal(ops[0]).unwrap();
    let b = arena.resolve_int_literal(ops[1]).unwrap();
    let (ua, ub) = (a as u64, b as u64);
    let result = match op {
        Eq => a == b,
        Neq => a != b,
        Gt => {
            if signed {
                a > b
            } else {
                ua > ub
            }
        }
        Gte => {
            if signed {
                a >= b
            } else {
                ua >= ub
            }
        }
        Lt => {
            if signed {
                a < b
            } else {
                ua < ub
            }
        }
        Lte => {
            if signed {
                a <= b
            } else {
                ua <= ub
            }
        }
        _ => return None,
    };
    let lit = if result {
        arena.true_literal()
    } else {
        arena.false_literal()
    };
    Some(arena.quote_single(lit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;

    fn folding_arena() -> IrArena {
        IrArena::new(ArenaConfig {
            check_types: true,
            allow_fold: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_constant_addition_folds() {
        let mut a = folding_arena();
        let two = a.int32_literal(2);
        let three = a.int32_literal(3);
        let ta = a.empty();
        let ops = a.intern_list(&[two, three]);
        let folded = a.prim_op(Op::Add, ta, ops);
        let five = a.int32_literal(5);
        match a.data(folded) {
            NodeData::Quote { values } => assert_eq!(a.node_list(*values), &[five]),
            other => panic!("expected a quote, got {}", other.tag_name()),
        }
    }

    #[test]
    fn test_add_zero_is_identity() {
        let mut a = folding_arena();
        let int32 = a.int32_type();
        let vt = a.qualified_type(false, int32);
        let x = a.fresh_var(Some(vt), "x");
        let zero = a.int32_literal(0);
        let ta = a.empty();
        let ops = a.intern_list(&[x, zero]);
        let folded = a.prim_op(Op::Add, ta, ops);
        match a.data(folded) {
            NodeData::Quote { values } => assert_eq!(a.node_list(*values), &[x]),
            other => panic!("expected a quote, got {}", other.tag_name()),
        }
    }

    #[test]
    fn test_signed_comparison_folds() {
        let mut a = folding_arena();
        let neg = a.int32_literal(-1);
        let one = a.int32_literal(1);
        let ta = a.empty();
        let ops = a.intern_list(&[neg, one]);
        let folded = a.prim_op(Op::Lt, ta, ops);
        let t = a.true_literal();
        match a.data(folded) {
            NodeData::Quote { values } => assert_eq!(a.node_list(*values), &[t]),
            other => panic!("expected a quote, got {}", other.tag_name()),
        }
    }

    #[test]
    fn test_unfoldable_op_is_left_alone() {
        let mut a = folding_arena();
        let int32 = a.int32_type();
        let vt = a.qualified_type(false, int32);
        let x = a.fresh_var(Some(vt), "x");
        let y = a.fresh_var(Some(vt), "y");
        let ta = a.empty();
        let ops = a.intern_list(&[x, y]);
        let node = a.prim_op(Op::Add, ta, ops);
        assert!(matches!(a.data(node), NodeData::PrimOp { op: Op::Add, .. }));
    }

    #[test]
    fn test_dead_let_is_elided() {
        let mut a = folding_arena();
        let two = a.int32_literal(2);
        let quoted = a.quote_single(two);
        let int32 = a.int32_type();
        let ut = a.qualified_type(true, int32);
        let v = a.fresh_var(Some(ut), "v");
        let vars = a.singleton(v);
        let ret_vals = a.empty();
        let ret = a.node(NodeData::Return { values: ret_vals });
        let l = a.node(NodeData::Let {
            instruction: quoted,
            vars,
            tail: Some(ret),
        });
        assert_eq!(l, ret);
    }

    #[test]
    fn test_live_let_is_kept() {
        let mut a = folding_arena();
        let two = a.int32_literal(2);
        let quoted = a.quote_single(two);
        let int32 = a.int32_type();
        let ut = a.qualified_type(true, int32);
        let v = a.fresh_var(Some(ut), "v");
        let vars = a.singleton(v);
        let ret_vals = a.singleton(v);
        let ret = a.node(NodeData::Return { values: ret_vals });
        let l = a.node(NodeData::Let {
            instruction: quoted,
            vars,
            tail: Some(ret),
        });
        assert!(matches!(a.data(l), NodeData::Let { .. }));
    }
}
