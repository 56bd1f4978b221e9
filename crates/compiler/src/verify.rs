//! Inter-pass invariant audit
//!
//! Runs after every pass. A failure here is a bug in the pass that just
//! ran, never user error; diagnostics go to the logging channel and the
//! pipeline aborts with [`CompileError::Verify`].

use std::collections::{HashMap, HashSet};

use shade_ir::arena::NodeId;
use shade_ir::module::Program;
use shade_ir::node::NodeData;
use shade_ir::{extract_annotation_value, get_decl_name, lookup_annotation};
use tracing::{error, warn};

use crate::error::CompileError;

fn fail(message: String) -> CompileError {
    error!("{}", message);
    CompileError::Verify(message)
}

pub fn verify_program(program: &Program) -> Result<(), CompileError> {
    let arena = &program.arena;

    // arena isolation: every reference a node holds stays in its arena
    for id in arena.node_ids() {
        for child in arena.data(id).children(arena) {
            if !arena.owns(child) {
                return Err(fail(format!(
                    "node {} references a node outside its arena",
                    arena.data(id).tag_name()
                )));
            }
        }
    }

    // structural uniqueness: hash-consable payloads never occur twice
    let mut seen: HashMap<&NodeData, NodeId> = HashMap::new();
    for id in arena.node_ids() {
        let data = arena.data(id);
        if data.is_unique() {
            continue;
        }
        if let Some(prior) = seen.insert(data, id) {
            return Err(fail(format!(
                "two structurally equal {} nodes were allocated separately (ids {:?}, {:?})",
                data.tag_name(),
                prior,
                id
            )));
        }
    }

    // declarations listed by the module must be declaration-tagged and
    // listed once
    let mut decl_set = HashSet::new();
    for &decl in program.module.declarations() {
        if !arena.owns(decl) {
            return Err(fail("module lists a declaration from another arena".into()));
        }
        if !arena.data(decl).is_declaration() {
            return Err(fail(format!(
                "module lists a {} as a declaration",
                arena.data(decl).tag_name()
            )));
        }
        if !decl_set.insert(decl) {
            return Err(fail(format!(
                "declaration {} is listed twice",
                get_decl_name(arena, decl)
            )));
        }
    }

    // in a typed arena, every instruction and value carries a derived type
    if arena.config().check_types {
        for id in arena.node_ids() {
            let data = arena.data(id);
            let needs_type = data.is_instruction()
                || matches!(
                    data,
                    NodeData::IntLit { .. }
                        | NodeData::FloatLit { .. }
                        | NodeData::BoolLit { .. }
                        | NodeData::Variable { .. }
                        | NodeData::FnAddr { .. }
                        | NodeData::RefDecl { .. }
                );
            if needs_type && arena.node_type(id).is_none() {
                return Err(fail(format!(
                    "{} has no derived type in a typed arena",
                    data.tag_name()
                )));
            }
        }
    }

    // a bound module contains no textual references
    if arena.config().name_bound {
        for id in arena.node_ids() {
            if let NodeData::Unbound { name } = arena.data(id) {
                return Err(fail(format!(
                    "unbound reference to '{}' in a name-bound arena",
                    arena.str(*name)
                )));
            }
        }
    }

    // let spines: once the parser shapes are gone, every let has a tail and
    // that tail is a let or a terminator
    let parsed = arena
        .node_ids()
        .any(|id| matches!(arena.data(id), NodeData::ParsedBlock { .. }));
    if !parsed {
        for id in arena.node_ids() {
            if let NodeData::Let { tail, .. } = arena.data(id) {
                match tail {
                    None => {
                        return Err(fail("let without a tail outside a parsed block".into()));
                    }
                    Some(tail) => {
                        if !arena.data(*tail).is_terminator() {
                            return Err(fail(format!(
                                "let tail is a {}, expected a let or terminator",
                                arena.data(*tail).tag_name()
                            )));
                        }
                    }
                }
            }
        }
    }

    verify_variable_containment(program)?;
    verify_entry_point_args(program);

    Ok(())
}

/// Every variable used inside a function must be bound by that function:
/// as a parameter, a let output, or a case/block parameter. Catches the
/// classic rewriter bug of leaking variables across abstractions.
fn verify_variable_containment(program: &Program) -> Result<(), CompileError> {
    let arena = &program.arena;
    for &decl in program.module.declarations() {
        let NodeData::Function { params, body, .. } = arena.data(decl) else {
            continue;
        };
        let Some(body) = body else { continue };

        let mut bound: HashSet<NodeId> = arena.node_list(*params).iter().copied().collect();
        let mut used: Vec<NodeId> = Vec::new();
        let mut stack = vec![*body];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match arena.data(id) {
                NodeData::Let { vars, .. } => {
                    bound.extend(arena.node_list(*vars));
                }
                NodeData::Case { params, .. } | NodeData::BasicBlock { params, .. } => {
                    bound.extend(arena.node_list(*params));
                }
                NodeData::Variable { .. } => used.push(id),
                // a function address is a reference, not an inlined body
                NodeData::Function { .. } => continue,
                _ => {}
            }
            stack.extend(arena.data(id).children(arena));
        }

        for var in used {
            if !bound.contains(&var) {
                return Err(fail(format!(
                    "function {} uses a variable bound elsewhere",
                    get_decl_name(arena, decl)
                )));
            }
        }
    }
    Ok(())
}

/// Best-effort: an `EntryPointArgs` global should point back at a function
/// annotated `EntryPoint`. Missing payloads only warn.
fn verify_entry_point_args(program: &Program) {
    let arena = &program.arena;
    for &decl in program.module.declarations() {
        if !matches!(arena.data(decl), NodeData::GlobalVariable { .. }) {
            continue;
        }
        let Some(ann) = lookup_annotation(arena, decl, "EntryPointArgs") else {
            continue;
        };
        let Some(value) = extract_annotation_value(arena, ann) else {
            warn!(
                "EntryPointArgs on {} carries no function reference",
                get_decl_name(arena, decl)
            );
            continue;
        };
        let NodeData::FnAddr { function } = arena.data(value) else {
            warn!(
                "EntryPointArgs on {} does not reference a function address",
                get_decl_name(arena, decl)
            );
            continue;
        };
        if lookup_annotation(arena, *function, "EntryPoint").is_none() {
            warn!(
                "EntryPointArgs on {} references a function without EntryPoint",
                get_decl_name(arena, decl)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_ir::arena::{ArenaConfig, IrArena};
    use shade_ir::module::Module;

    #[test]
    fn test_verify_accepts_simple_module() {
        let mut a = IrArena::new(ArenaConfig {
            name_bound: true,
            check_types: true,
            ..Default::default()
        });
        let five = a.int32_literal(5);
        let values = a.singleton(five);
        let ret = a.node(NodeData::Return { values });
        let name = a.intern_string("f");
        let annotations = a.empty();
        let params = a.empty();
        let int32 = a.int32_type();
        let qt = a.qualified_type(true, int32);
        let return_types = a.singleton(qt);
        let f = a.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: Some(ret),
        });
        let mut m = Module::new("t");
        m.add_declaration(f);
        let p = Program { arena: a, module: m };
        assert!(verify_program(&p).is_ok());
    }

    #[test]
    fn test_verify_rejects_unbound_in_bound_arena() {
        let mut a = IrArena::new(ArenaConfig {
            name_bound: true,
            ..Default::default()
        });
        let name = a.intern_string("x");
        let _ = a.node(NodeData::Unbound { name });
        let m = Module::new("t");
        let p = Program { arena: a, module: m };
        assert!(verify_program(&p).is_err());
    }

    #[test]
    fn test_verify_rejects_leaked_variable() {
        let mut a = IrArena::new(ArenaConfig::default());
        let stray = a.fresh_var(None, "stray");
        let values = a.singleton(stray);
        let ret = a.node(NodeData::Return { values });
        let name = a.intern_string("f");
        let annotations = a.empty();
        let params = a.empty();
        let return_types = a.empty();
        let f = a.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: Some(ret),
        });
        let mut m = Module::new("t");
        m.add_declaration(f);
        let p = Program { arena: a, module: m };
        assert!(verify_program(&p).is_err());
    }
}
