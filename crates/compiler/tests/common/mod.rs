//! Shared builders for pipeline tests: small programs constructed the way
//! the parser would hand them over.
#![allow(dead_code)]

use shade_ir::arena::{ArenaConfig, IrArena, NodeId, Nodes};
use shade_ir::module::{Module, Program};
use shade_ir::node::NodeData;

pub fn parsed_arena() -> IrArena {
    IrArena::new(ArenaConfig::default())
}

pub fn typed_arena() -> IrArena {
    IrArena::new(ArenaConfig {
        name_bound: true,
        check_types: true,
        allow_fold: true,
        ..Default::default()
    })
}

pub fn unbound(arena: &mut IrArena, name: &str) -> NodeId {
    let name = arena.intern_string(name);
    arena.node(NodeData::Unbound { name })
}

pub fn untyped_var(arena: &mut IrArena, name: &str) -> NodeId {
    arena.fresh_var(None, name)
}

pub fn annotation(arena: &mut IrArena, name: &str) -> NodeId {
    let name = arena.intern_string(name);
    arena.node(NodeData::Annotation { name })
}

pub fn function(
    arena: &mut IrArena,
    name: &str,
    annotations: &[NodeId],
    params: &[NodeId],
    return_types: &[NodeId],
    body: Option<NodeId>,
) -> NodeId {
    let name = arena.intern_string(name);
    let annotations = arena.intern_list(annotations);
    let params = arena.intern_list(params);
    let return_types = arena.intern_list(return_types);
    arena.node(NodeData::Function {
        name,
        annotations,
        params,
        return_types,
        body,
    })
}

/// A tail-less let, the shape parsed blocks carry.
pub fn parsed_let(arena: &mut IrArena, instruction: NodeId, vars: &[NodeId]) -> NodeId {
    let vars = arena.intern_list(vars);
    arena.node(NodeData::Let {
        instruction,
        vars,
        tail: None,
    })
}

pub fn parsed_block(
    arena: &mut IrArena,
    instructions: &[NodeId],
    continuations_vars: &[NodeId],
    continuations: &[NodeId],
    terminator: NodeId,
) -> NodeId {
    let instructions = arena.intern_list(instructions);
    let continuations_vars = arena.intern_list(continuations_vars);
    let continuations = arena.intern_list(continuations);
    arena.node(NodeData::ParsedBlock {
        instructions,
        continuations_vars,
        continuations,
        terminator,
    })
}

pub fn ret(arena: &mut IrArena, values: &[NodeId]) -> NodeId {
    let values = arena.intern_list(values);
    arena.node(NodeData::Return { values })
}

pub fn program(arena: IrArena, name: &str, decls: &[NodeId]) -> Program {
    let mut module = Module::new(name);
    for &d in decls {
        module.add_declaration(d);
    }
    Program { arena, module }
}

/// Every node reachable from the module's declarations.
pub fn reachable_nodes(program: &Program) -> Vec<NodeId> {
    let arena = &program.arena;
    let mut seen = std::collections::HashSet::new();
    let mut stack: Vec<NodeId> = program.module.declarations().to_vec();
    let mut out = Vec::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        out.push(id);
        stack.extend(arena.data(id).children(arena));
    }
    out
}

/// Count reachable primops with the given operation.
pub fn count_primops(program: &Program, op: shade_ir::Op) -> usize {
    reachable_nodes(program)
        .into_iter()
        .filter(|&id| {
            matches!(
                program.arena.data(id),
                NodeData::PrimOp { op: o, .. } if *o == op
            )
        })
        .count()
}

/// The default arena config the pipeline uses for its early passes.
pub fn bound_config() -> ArenaConfig {
    ArenaConfig {
        name_bound: true,
        ..Default::default()
    }
}

pub fn inferred_config() -> ArenaConfig {
    ArenaConfig {
        name_bound: true,
        check_types: true,
        allow_fold: true,
        ..Default::default()
    }
}

pub fn nodes(arena: &mut IrArena, ids: &[NodeId]) -> Nodes {
    arena.intern_list(ids)
}
