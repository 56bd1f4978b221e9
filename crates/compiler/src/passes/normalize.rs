//! normalize: canonicalize control flow after binding
//!
//! Binding already chains parsed instruction lists into let spines; what
//! remains is inlining singleton continuations: a basic block entered by
//! exactly one jump and referenced nowhere else is spliced into its
//! predecessor, with its parameters substituted by the jump arguments.

use std::collections::HashMap;

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

/// Count how every basic block is entered or referenced.
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

/// Whether a block's body mentions the block itself (a self loop).
fn is_self_referential(src: &Program, bb: NodeId) -> bool {
    let arena = &src.arena;
    let Some(body) = shade_ir::get_abstraction_body(arena, bb) else {
        return false;
    };
    let mut stack = vec![body];
    let mut seen = std::collections::HashSet::new();
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

struct NormalizePass<'a> {
    rw: RewriteCtx<'a>,
    inlinable: std::collections::HashSet<NodeId>,
}

impl<'a> Rewriter<'a> for NormalizePass<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        if let NodeData::Jump { target, args } = data
            && self.inlinable.contains(&target)
        {
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
        recreate_node_identity(self, node)
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let usage = analyze_block_usage(src);
    let inlinable = usage
        .into_iter()
        .filter(|(bb, u)| u.jumps == 1 && u.others == 0 && !is_self_referential(src, *bb))
        .map(|(bb, _)| bb)
        .collect();
    let mut pass = NormalizePass {
        rw: RewriteCtx::new(src, aconfig),
        inlinable,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
