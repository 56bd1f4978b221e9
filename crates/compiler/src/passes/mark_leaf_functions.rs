//! mark_leaf_functions: annotate functions that perform no calls
//!
//! A leaf function neither calls nor tail-calls anything, so callers may
//! keep using it through the native call instruction and later passes can
//! skip the continuation machinery for it.

use std::collections::{HashMap, HashSet};

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, recreate_decl_stub, rewrite_module, rewrite_nodes, rewrite_string,
};

/// Which functions each function calls, and whether it makes any call at
/// all (including indirect ones whose target is unknown).
struct CallGraph {
    calls_out: HashMap<NodeId, bool>,
}

impl CallGraph {
    fn build(program: &Program) -> Self {
        let arena = &program.arena;
        let mut calls_out = HashMap::new();
        for &decl in program.module.declarations() {
            if !matches!(arena.data(decl), NodeData::Function { .. }) {
                continue;
            }
            let mut makes_calls = false;
            let mut stack: Vec<NodeId> =
                shade_ir::get_abstraction_body(arena, decl).into_iter().collect();
            let mut seen = HashSet::new();
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                match arena.data(id) {
                    NodeData::Call { .. } | NodeData::TailCall { .. } | NodeData::Join { .. } => {
                        makes_calls = true;
                    }
                    // stay inside this function
                    NodeData::Function { .. } => continue,
                    _ => {}
                }
                stack.extend(arena.data(id).children(arena));
            }
            calls_out.insert(decl, makes_calls);
        }
        CallGraph { calls_out }
    }

    fn is_leaf(&self, f: NodeId) -> bool {
        self.calls_out.get(&f) == Some(&false)
    }
}

struct MarkLeafFunctions<'a> {
    rw: RewriteCtx<'a>,
    leaves: HashSet<NodeId>,
}

impl<'a> Rewriter<'a> for MarkLeafFunctions<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        if !self.leaves.contains(&decl) {
            return recreate_decl_stub(self, decl);
        }
        let NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            ..
        } = self.rw.src_arena.data(decl).clone()
        else {
            return recreate_decl_stub(self, decl);
        };
        let name = rewrite_string(self, name);
        let annotations = rewrite_nodes(self, annotations);
        let leaf_name = self.rw.dst_arena.intern_string("Leaf");
        let leaf = self.rw.dst_arena.node(NodeData::Annotation { name: leaf_name });
        let annotations = self.rw.dst_arena.append_nodes(annotations, leaf);
        let params = rewrite_nodes(self, params);
        let return_types = rewrite_nodes(self, return_types);
        self.rw.dst_arena.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: None,
        })
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let graph = CallGraph::build(src);
    let leaves = src
        .module
        .declarations()
        .iter()
        .copied()
        .filter(|&d| graph.is_leaf(d))
        .collect();
    let mut pass = MarkLeafFunctions {
        rw: RewriteCtx::new(src, aconfig),
        leaves,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_ir::arena::IrArena;
    use shade_ir::module::Module;

    fn make_fn(arena: &mut IrArena, name: &str, body: Option<NodeId>) -> NodeId {
        let name = arena.intern_string(name);
        let annotations = arena.empty();
        let params = arena.empty();
        let return_types = arena.empty();
        arena.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body,
        })
    }

    #[test]
    fn test_leaf_detection() {
        let mut a = IrArena::new(ArenaConfig {
            name_bound: true,
            ..Default::default()
        });

        // leaf: just returns
        let values = a.empty();
        let ret = a.node(NodeData::Return { values });
        let leaf = make_fn(&mut a, "leaf", Some(ret));

        // caller: tail-calls the leaf
        let addr = a.node(NodeData::FnAddr { function: leaf });
        let args = a.empty();
        let tc = a.node(NodeData::TailCall { callee: addr, args });
        let caller = make_fn(&mut a, "caller", Some(tc));

        let mut m = Module::new("t");
        m.add_declaration(leaf);
        m.add_declaration(caller);
        let src = Program { arena: a, module: m };

        let out = run(
            &CompilerConfig::default(),
            &src,
            ArenaConfig {
                name_bound: true,
                ..Default::default()
            },
        )
        .unwrap();
        let leaf2 = out.module.find_declaration(&out.arena, "leaf").unwrap();
        let caller2 = out.module.find_declaration(&out.arena, "caller").unwrap();
        assert!(shade_ir::lookup_annotation(&out.arena, leaf2, "Leaf").is_some());
        assert!(shade_ir::lookup_annotation(&out.arena, caller2, "Leaf").is_none());
    }
}
