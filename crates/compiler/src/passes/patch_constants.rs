//! patch_constants: give the injected placeholder constants their values
//!
//! Runs immediately before inference so the final values participate in
//! typing and folding. The constants carry explicit type hints, so a later
//! placement would stay well-typed, but the pipeline does not exercise
//! that.

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::internal_constants::{SUBGROUP_SIZE_NAME, SUBGROUPS_PER_WG_NAME};
use crate::passes::PassResult;
use crate::rewrite::{RewriteCtx, Rewriter, recreate_decl_body, rewrite_module};

struct PatchConstants<'a> {
    rw: RewriteCtx<'a>,
    subgroup_size: u32,
}

impl<'a> Rewriter<'a> for PatchConstants<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn process_decl_body(&mut self, old: NodeId, new: NodeId) {
        if matches!(self.rw.src_arena.data(old), NodeData::Constant { .. }) {
            let name = shade_ir::get_decl_name(self.rw.src_arena, old);
            let value = match name {
                SUBGROUP_SIZE_NAME => Some(self.subgroup_size),
                // one subgroup per workgroup until workgroup shapes are
                // part of the configuration
                SUBGROUPS_PER_WG_NAME => Some(1),
                _ => None,
            };
            if let Some(value) = value {
                let lit = self.rw.dst_arena.uint32_literal(value);
                self.rw.dst_arena.set_constant_value(new, lit);
                return;
            }
        }
        recreate_decl_body(self, old, new)
    }
}

pub fn run(config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = PatchConstants {
        rw: RewriteCtx::new(src, aconfig),
        subgroup_size: config.subgroup_size,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
