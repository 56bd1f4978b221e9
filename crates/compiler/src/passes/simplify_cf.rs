//! opt_simplify_cf: jump threading and block merging
//!
//! Two local rewrites, applied together:
//! - forwarder elimination: a jump to a block that only jumps on, passing
//!   its own parameters through unchanged, goes straight to the final
//!   target;
//! - single-predecessor merging: a block entered by exactly one jump and
//!   referenced nowhere else is inlined at its jump site.

use std::collections::{HashMap, HashSet};

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, recreate_node_identity, rewrite_module, rewrite_node, rewrite_nodes,
};

#[derive(Default, Clone, Copy)]
struct BlockUsage {
    jumps: usize,
    others: usize,
}

fn analyze_block_usage(src: &Program) -> HashMap<NodeId, BlockUsage> {
    let arena = &src.arena;
    let mut usage: HashMap<NodeId, BlockUsage> = HashMap::new();
    for id in arena.node_ids() {
        let data = arena.data(id);
        let jump_target = match data {
            NodeData::Jump { target, .. } => Some(*target),
            _ => None,
        };
        for child in data.children(arena) {
            if !matches!(arena.data(child), NodeData::BasicBlock { .. }) {
                continue;
            }
            let entry = usage.entry(child).or_default();
            if jump_target == Some(child) {
                entry.jumps += 1;
            } else {
                entry.others += 1;
            }
        }
    }
    usage
}

/// A pure forwarder: empty spine, terminator `jump T(params...)` passing
/// its own parameters in order. Returns the final target after skipping
/// every forwarder in a chain.
fn thread_target(arena: &shade_ir::IrArena, mut target: NodeId) -> NodeId {
    let mut hops = 0;
    loop {
        // cyclic forwarder chains exist in degenerate programs; stop
        // threading rather than spin
        if hops > 64 {
            return target;
        }
        let NodeData::BasicBlock {
            params,
            body: Some(body),
            ..
        } = arena.data(target)
        else {
            return target;
        };
        let NodeData::Jump {
            target: next,
            args,
        } = arena.data(*body)
        else {
            return target;
        };
        if arena.node_list(*args) != arena.node_list(*params) {
            return target;
        }
        target = *next;
        hops += 1;
    }
}

fn is_self_referential(src: &Program, bb: NodeId) -> bool {
    let arena = &src.arena;
    let Some(body) = shade_ir::get_abstraction_body(arena, bb) else {
        return false;
    };
    let mut stack = vec![body];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if id == bb {
            return true;
        }
        stack.extend(arena.data(id).children(arena));
    }
    false
}

struct SimplifyCf<'a> {
    rw: RewriteCtx<'a>,
    inlinable: HashSet<NodeId>,
}

impl<'a> Rewriter<'a> for SimplifyCf<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::Jump { target, args } => {
                let target = thread_target(self.rw.src_arena, target);
                if self.inlinable.contains(&target) {
                    let args = rewrite_nodes(self, args);
                    let params = shade_ir::get_abstraction_params(self.rw.src_arena, target);
                    let params = self.rw.src_arena.node_list(params).to_vec();
                    let args = self.rw.dst_arena.node_list(args).to_vec();
                    assert_eq!(params.len(), args.len(), "jump arity mismatch");
                    for (param, arg) in params.into_iter().zip(args) {
                        self.rw.register_processed(param, arg);
                    }
                    let body = shade_ir::get_abstraction_body(self.rw.src_arena, target)
                        .expect("inlinable block has a body");
                    return rewrite_node(self, body);
                }
                let target = rewrite_node(self, target);
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::Jump { target, args })
            }
            NodeData::Branch {
                condition,
                true_target,
                false_target,
                args,
            } => {
                let condition = rewrite_node(self, condition);
                let true_target = thread_target(self.rw.src_arena, true_target);
                let false_target = thread_target(self.rw.src_arena, false_target);
                let true_target = rewrite_node(self, true_target);
                let false_target = rewrite_node(self, false_target);
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::Branch {
                    condition,
                    true_target,
                    false_target,
                    args,
                })
            }
            _ => recreate_node_identity(self, node),
        }
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let usage = analyze_block_usage(src);
    let inlinable = usage
        .into_iter()
        .filter(|(bb, u)| u.jumps == 1 && u.others == 0 && !is_self_referential(src, *bb))
        .map(|(bb, _)| bb)
        .collect();
    let mut pass = SimplifyCf {
        rw: RewriteCtx::new(src, aconfig),
        inlinable,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
