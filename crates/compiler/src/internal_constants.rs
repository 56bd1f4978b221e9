//! Compiler-injected declarations
//!
//! The front end may reference a handful of constants the compiler owns,
//! like the subgroup size. The driver injects placeholders into the parsed
//! module before binding; the patch_constants pass later overwrites their
//! bodies with the configured values.

use shade_ir::arena::NodeId;
use shade_ir::module::Program;
use shade_ir::node::NodeData;
use shade_ir::types::AddressSpace;

use crate::config::CompilerConfig;

pub const SUBGROUP_SIZE_NAME: &str = "SUBGROUP_SIZE";
pub const SUBGROUPS_PER_WG_NAME: &str = "SUBGROUPS_PER_WORKGROUP";

/// The scheduler's next-continuation slot, injected when dynamic scheduling
/// is requested; lower_tailcalls creates it on demand otherwise.
pub const NEXT_FN_NAME: &str = "builtin_next_fn";

fn dummy_constant(program: &mut Program, name: &str) -> NodeId {
    let arena = &mut program.arena;
    let name = arena.intern_string(name);
    let internal_name = arena.intern_string("Internal");
    let internal = arena.node(NodeData::Annotation {
        name: internal_name,
    });
    let annotations = arena.singleton(internal);
    let u32t = arena.uint32_type();
    let hint = arena.qualified_type(true, u32t);
    let placeholder = arena.uint32_literal(0);
    let decl = arena.node(NodeData::Constant {
        name,
        annotations,
        type_hint: Some(hint),
        value: Some(placeholder),
    });
    program.module.add_declaration(decl);
    decl
}

/// Inject the placeholder constants into a freshly parsed module. Must run
/// before bind_program so references to them resolve.
pub fn generate_dummy_constants(config: &CompilerConfig, program: &mut Program) {
    dummy_constant(program, SUBGROUP_SIZE_NAME);
    dummy_constant(program, SUBGROUPS_PER_WG_NAME);

    if config.dynamic_scheduling {
        let arena = &mut program.arena;
        let name = arena.intern_string(NEXT_FN_NAME);
        let internal_name = arena.intern_string("Internal");
        let internal = arena.node(NodeData::Annotation {
            name: internal_name,
        });
        let annotations = arena.singleton(internal);
        let ty = arena.uint32_type();
        let decl = arena.node(NodeData::GlobalVariable {
            name,
            annotations,
            ty,
            addr_space: AddressSpace::Private,
            init: None,
        });
        program.module.add_declaration(decl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_ir::arena::{ArenaConfig, IrArena};
    use shade_ir::module::Module;

    #[test]
    fn test_dummy_constants_are_injected() {
        let mut program = Program {
            arena: IrArena::new(ArenaConfig::default()),
            module: Module::new("t"),
        };
        let config = CompilerConfig::default();
        generate_dummy_constants(&config, &mut program);
        assert!(
            program
                .module
                .find_declaration(&program.arena, SUBGROUP_SIZE_NAME)
                .is_some()
        );
        assert!(
            program
                .module
                .find_declaration(&program.arena, SUBGROUPS_PER_WG_NAME)
                .is_some()
        );
        // no scheduler slot unless dynamic scheduling is on
        assert!(
            program
                .module
                .find_declaration(&program.arena, NEXT_FN_NAME)
                .is_none()
        );
    }
}
