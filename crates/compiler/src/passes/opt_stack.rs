//! opt_stack: cancel adjacent push/pop pairs
//!
//! Spilling passes produce `push v; pop` sequences when a value is saved
//! and immediately restored. A pop directly following a push of the same
//! type on the same stack just forwards the pushed value.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
};

struct OptStack<'a> {
    rw: RewriteCtx<'a>,
}

/// `Some((pop_op, type, value))` when the instruction is a push that a
/// matching pop can absorb.
fn as_push(arena: &shade_ir::IrArena, instr: NodeId) -> Option<(Op, NodeId, NodeId)> {
    let NodeData::PrimOp {
        op,
        type_args,
        operands,
    } = arena.data(instr)
    else {
        return None;
    };
    let pop_op = match op {
        Op::PushStack => Op::PopStack,
        Op::PushStackUniform => Op::PopStackUniform,
        _ => return None,
    };
    let ty = *arena.node_list(*type_args).first()?;
    let value = *arena.node_list(*operands).first()?;
    Some((pop_op, ty, value))
}

fn as_pop(arena: &shade_ir::IrArena, instr: NodeId) -> Option<(Op, NodeId)> {
    let NodeData::PrimOp { op, type_args, .. } = arena.data(instr) else {
        return None;
    };
    if !matches!(op, Op::PopStack | Op::PopStackUniform) {
        return None;
    }
    let ty = *arena.node_list(*type_args).first()?;
    Some((*op, ty))
}

impl<'a> Rewriter<'a> for OptStack<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let arena = self.rw.src_arena;
        if let NodeData::Let {
            instruction: push_instr,
            vars: push_vars,
            tail: Some(tail),
        } = arena.data(node)
            && arena.node_list(*push_vars).is_empty()
            && let Some((pop_op, push_ty, value)) = as_push(arena, *push_instr)
            && let NodeData::Let {
                instruction: pop_instr,
                vars: pop_vars,
                tail: Some(pop_tail),
            } = arena.data(*tail)
            && let Some((op, pop_ty)) = as_pop(arena, *pop_instr)
            && op == pop_op
            && push_ty == pop_ty
        {
            let pop_vars = arena.node_list(*pop_vars).to_vec();
            let pop_tail = *pop_tail;
            let value = rewrite_node(self, value);
            if let [var] = pop_vars.as_slice() {
                self.rw.register_processed(*var, value);
                return rewrite_node(self, pop_tail);
            }
        }
        recreate_node_identity(self, node)
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = OptStack {
        rw: RewriteCtx::new(src, aconfig),
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
