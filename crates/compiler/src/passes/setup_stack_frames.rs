//! setup_stack_frames: save and restore the stack pointer per function
//!
//! Every function gets a frame: the abstract stack pointer is read on
//! entry, and every return restores it first, so locals and spills pushed
//! during the body never leak. opt_stack later removes the bookkeeping
//! where nothing was pushed.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, recreate_node_identity, rewrite_module, rewrite_nodes,
};

struct SetupStackFrames<'a> {
    rw: RewriteCtx<'a>,
    /// The destination variable holding the entry stack pointer of the
    /// function currently being rewritten.
    frame_sp: Option<NodeId>,
}

impl<'a> Rewriter<'a> for SetupStackFrames<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    // returns rewrite against the current function's saved stack pointer
    fn should_memoize(&mut self, node: NodeId) -> bool {
        !crate::rewrite::is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        if let NodeData::Return { values } = data
            && let Some(sp) = self.frame_sp
        {
            let values = rewrite_nodes(self, values);
            let arena = &mut self.rw.dst_arena;
            let ta = arena.empty();
            let operands = arena.singleton(sp);
            let restore = arena.prim_op(Op::SetStackPointer, ta, operands);
            let vars = arena.empty();
            let ret = arena.node(NodeData::Return { values });
            return arena.node(NodeData::Let {
                instruction: restore,
                vars,
                tail: Some(ret),
            });
        }
        recreate_node_identity(self, node)
    }

    fn process_decl_body(&mut self, old: NodeId, new: NodeId) {
        let NodeData::Function {
            body: Some(body), ..
        } = self.rw.src_arena.data(old).clone()
        else {
            crate::rewrite::recreate_decl_body(self, old, new);
            return;
        };

        let arena = &mut self.rw.dst_arena;
        let ta = arena.empty();
        let operands = arena.empty();
        let read_sp = arena.prim_op(Op::GetStackPointer, ta, operands);
        let sp_ty = arena.node_type(read_sp);
        let sp = arena.fresh_var(sp_ty, "frame_sp");
        let vars = arena.singleton(sp);

        self.frame_sp = Some(sp);
        let body = crate::rewrite::rewrite_node(self, body);
        self.frame_sp = None;

        let full = self.rw.dst_arena.node(NodeData::Let {
            instruction: read_sp,
            vars,
            tail: Some(body),
        });
        self.rw.dst_arena.set_function_body(new, full);
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = SetupStackFrames {
        rw: RewriteCtx::new(src, aconfig),
        frame_sp: None,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
