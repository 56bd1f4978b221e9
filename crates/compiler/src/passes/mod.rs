//! The lowering passes
//!
//! Each pass rewrites a whole program into a fresh arena, preserving the
//! static semantics of its input and leaving its output verifiable. The
//! driver in `pipeline` owns the order and the arena-config transitions.

use shade_ir::arena::ArenaConfig;
use shade_ir::module::Program;

use crate::config::CompilerConfig;
use crate::error::CompileError;

pub type PassResult = Result<Program, CompileError>;

/// Signature shared by every pass: source program in, fresh program out,
/// destination arena configured by the driver.
pub type PassFn = fn(&CompilerConfig, &Program, ArenaConfig) -> PassResult;

pub mod bind;
pub mod eliminate_constants;
pub mod infer;
pub mod lower_callf;
pub mod lower_cf_instrs;
pub mod lower_continuations;
pub mod lower_int;
pub mod lower_mask;
pub mod lower_physical_ptrs;
pub mod lower_stack;
pub mod lower_subgroup_ops;
pub mod lower_subgroup_vars;
pub mod lower_tailcalls;
pub mod mark_leaf_functions;
pub mod normalize;
pub mod opt_stack;
pub mod patch_constants;
pub mod restructure;
pub mod setup_stack_frames;
pub mod simplify_cf;
pub mod simt2d;
