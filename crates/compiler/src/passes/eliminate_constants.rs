//! eliminate_constants: inline constants used only statically
//!
//! Every reference to a module constant is replaced by the constant's
//! value. Constants that survive as part of the resource interface (the
//! `Constants` annotation) keep their declarations; the rest disappear
//! from the module.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::{Module, Program};
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, recreate_node_identity, rewrite_module, rewrite_node,
};

struct EliminateConstants<'a> {
    rw: RewriteCtx<'a>,
}

impl<'a> Rewriter<'a> for EliminateConstants<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        if let NodeData::RefDecl { decl } = self.rw.src_arena.data(node)
            && let NodeData::Constant {
                value: Some(value), ..
            } = self.rw.src_arena.data(*decl)
        {
            return rewrite_node(self, *value);
        }
        recreate_node_identity(self, node)
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = EliminateConstants {
        rw: RewriteCtx::new(src, aconfig),
    };
    rewrite_module(&mut pass);
    let program = pass.rw.finish();

    // drop constants that no longer serve the resource interface
    let mut module = Module::new(program.module.name());
    for &decl in program.module.declarations() {
        let drop = matches!(program.arena.data(decl), NodeData::Constant { .. })
            && shade_ir::lookup_annotation(&program.arena, decl, "Constants").is_none();
        if !drop {
            module.add_declaration(decl);
        }
    }
    Ok(Program {
        arena: program.arena,
        module,
    })
}
