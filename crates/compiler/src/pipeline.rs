//! The pass pipeline
//!
//! Passes run in a fixed order; each one rewrites the module into a fresh
//! arena whose configuration the driver owns. After every pass the module
//! is dumped to the logging channel and audited by the verifier; the
//! previous arena is dropped once its successor exists.

use shade_ir::arena::{ArenaConfig, MaskRepr};
use shade_ir::module::Program;
use tracing::debug;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::passes;
use crate::passes::PassFn;
use crate::verify::verify_program;

/// Render the module for the logging channel, honoring the dump filters.
fn dump_module(config: &CompilerConfig, program: &Program) -> String {
    let mut filtered = shade_ir::Module::new(program.module.name());
    for &decl in program.module.declarations() {
        let internal =
            shade_ir::lookup_annotation(&program.arena, decl, "Internal").is_some();
        let builtin = shade_ir::lookup_annotation(&program.arena, decl, "Builtin").is_some();
        if (internal && config.logging.skip_generated)
            || (builtin && config.logging.skip_builtin)
        {
            continue;
        }
        filtered.add_declaration(decl);
    }
    shade_ir::print_module(&program.arena, &filtered)
}

fn apply(
    config: &CompilerConfig,
    program: Program,
    aconfig: ArenaConfig,
    name: &str,
    pass: PassFn,
) -> Result<Program, CompileError> {
    debug!("running {}", name);
    let next = pass(config, &program, aconfig)?;
    debug!("after {}:\n{}", name, dump_module(config, &next));
    verify_program(&next)?;
    // the old arena dies here
    Ok(next)
}

/// Run the whole lowering pipeline. The input is a bound-or-parsed module
/// (textual references still allowed); the output is the emittable
/// dialect: no unbound names, no structured control flow, no first-class
/// continuations, no physical-pointer accesses, masks concrete.
pub fn run_compiler_passes(
    config: &CompilerConfig,
    program: Program,
) -> Result<Program, CompileError> {
    let mut aconfig = ArenaConfig {
        name_bound: true,
        check_types: false,
        allow_fold: false,
        subgroup_mask_representation: MaskRepr::Abstract,
        is_simt: true,
    };

    let mut program = apply(config, program, aconfig, "bind_program", passes::bind::run)?;
    program = apply(config, program, aconfig, "normalize", passes::normalize::run)?;
    program = apply(
        config,
        program,
        aconfig,
        "patch_constants",
        passes::patch_constants::run,
    )?;

    aconfig.check_types = true;
    aconfig.allow_fold = true;
    program = apply(config, program, aconfig, "infer_program", passes::infer::run)?;

    program = apply(
        config,
        program,
        aconfig,
        "setup_stack_frames",
        passes::setup_stack_frames::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "mark_leaf_functions",
        passes::mark_leaf_functions::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "lower_cf_instrs",
        passes::lower_cf_instrs::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "opt_restructurize",
        passes::restructure::run,
    )?;
    program = apply(config, program, aconfig, "lower_callf", passes::lower_callf::run)?;
    program = apply(
        config,
        program,
        aconfig,
        "opt_simplify_cf",
        passes::simplify_cf::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "lower_continuations",
        passes::lower_continuations::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "opt_simplify_cf",
        passes::simplify_cf::run,
    )?;
    program = apply(config, program, aconfig, "opt_stack", passes::opt_stack::run)?;
    // regions opt_restructurize re-formed dissolve again before
    // scheduling; the unstructured dialect is what the trampoline takes
    program = apply(
        config,
        program,
        aconfig,
        "lower_cf_instrs",
        passes::lower_cf_instrs::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "lower_tailcalls",
        passes::lower_tailcalls::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "eliminate_constants",
        passes::eliminate_constants::run,
    )?;

    // 64-bit masks need 64-bit integers and SPIR-V 1.3 group operations;
    // otherwise fall back to the packed ballot form
    aconfig.subgroup_mask_representation =
        if config.lower.int64 || !config.target_spirv_version.at_least(1, 3) {
            MaskRepr::PackedBallot
        } else {
            MaskRepr::Int64
        };
    program = apply(config, program, aconfig, "lower_mask", passes::lower_mask::run)?;

    if config.lower.emulate_subgroup_ops || config.lower.emulate_subgroup_ops_extended_types {
        program = apply(
            config,
            program,
            aconfig,
            "lower_subgroup_ops",
            passes::lower_subgroup_ops::run,
        )?;
    }

    program = apply(config, program, aconfig, "lower_stack", passes::lower_stack::run)?;
    program = apply(
        config,
        program,
        aconfig,
        "lower_physical_ptrs",
        passes::lower_physical_ptrs::run,
    )?;
    program = apply(
        config,
        program,
        aconfig,
        "lower_subgroup_vars",
        passes::lower_subgroup_vars::run,
    )?;

    if config.lower.int64 {
        program = apply(config, program, aconfig, "lower_int", passes::lower_int::run)?;
    }

    if config.lower.simt_to_explicit_simd {
        aconfig.is_simt = false;
        program = apply(config, program, aconfig, "simt2d", passes::simt2d::run)?;
    }

    Ok(program)
}
