//! Compact textual dump of modules and nodes
//!
//! One declaration per block, let spines one instruction per line. This is
//! a debugging surface for logs and tests, not a parseable syntax.

use crate::arena::{IrArena, NodeId, Nodes};
use crate::module::Module;
use crate::node::{FloatWidth, IntWidth, NodeData, RecordKind};

pub fn print_module(arena: &IrArena, module: &Module) -> String {
    let mut out = String::new();
    out.push_str(&format!("module {} {{\n", module.name()));
    for &decl in module.declarations() {
        print_decl(arena, decl, &mut out);
    }
    out.push_str("}\n");
    out
}

pub fn print_node(arena: &IrArena, node: NodeId) -> String {
    let mut out = String::new();
    print_body(arena, node, 1, &mut out);
    out
}

fn int_type_name(width: IntWidth, signed: bool) -> &'static str {
    match (width, signed) {
        (IntWidth::I8, true) => "i8",
        (IntWidth::I8, false) => "u8",
        (IntWidth::I16, true) => "i16",
        (IntWidth::I16, false) => "u16",
        (IntWidth::I32, true) => "i32",
        (IntWidth::I32, false) => "u32",
        (IntWidth::I64, true) => "i64",
        (IntWidth::I64, false) => "u64",
    }
}

/// Inline rendering of types and values.
pub fn print_inline(arena: &IrArena, node: NodeId) -> String {
    use NodeData::*;
    match arena.data(node) {
        IntType { width, signed } => int_type_name(*width, *signed).to_owned(),
        FloatType { width } => match width {
            FloatWidth::F16 => "f16".into(),
            FloatWidth::F32 => "f32".into(),
            FloatWidth::F64 => "f64".into(),
        },
        BoolType => "bool".into(),
        MaskType => "mask".into(),
        PackType { elem, width } => {
            format!("pack<{}, {}>", print_inline(arena, *elem), width)
        }
        RecordType { members, kind } => {
            let inner = print_list(arena, *members, ", ");
            match kind {
                RecordKind::Plain => format!("struct {{{}}}", inner),
                RecordKind::MultipleReturn => format!("({})", inner),
            }
        }
        ArrayType { elem, size } => match size {
            Some(s) => format!(
                "[{}; {}]",
                print_inline(arena, *elem),
                print_inline(arena, *s)
            ),
            None => format!("[{}]", print_inline(arena, *elem)),
        },
        PtrType {
            addr_space,
            pointee,
        } => format!("ptr<{}, {}>", addr_space.name(), print_inline(arena, *pointee)),
        FnType { params, returns } => format!(
            "fn({}) -> ({})",
            print_list(arena, *params, ", "),
            print_list(arena, *returns, ", ")
        ),
        QualifiedType { uniform, inner } => format!(
            "{} {}",
            if *uniform { "uniform" } else { "varying" },
            print_inline(arena, *inner)
        ),
        IntLit { width, signed, .. } => {
            let v = arena.resolve_int_literal(node).unwrap_or(0);
            format!("{}{}", v, int_type_name(*width, *signed))
        }
        FloatLit { bits, .. } => format!("float_bits({:#x})", bits),
        BoolLit { value } => format!("{}", value),
        StringLit { string } => format!("{:?}", arena.str(*string)),
        Composite { contents, .. } => {
            format!("composite({})", print_list(arena, *contents, ", "))
        }
        Undef { ty } => format!("undef<{}>", print_inline(arena, *ty)),
        Variable { name, id, .. } => format!("%{}.{}", arena.str(*name), id),
        Unbound { name } => format!("`{}`", arena.str(*name)),
        FnAddr { function } => format!("&{}", crate::module::get_decl_name(arena, *function)),
        RefDecl { decl } => format!("@{}", crate::module::get_decl_name(arena, *decl)),
        PrimOp {
            op,
            type_args,
            operands,
        } => {
            let mut s = op.name().to_owned();
            if !arena.node_list(*type_args).is_empty() {
                s.push_str(&format!("<{}>", print_list(arena, *type_args, ", ")));
            }
            s.push_str(&format!(" {}", print_list(arena, *operands, ", ")));
            s
        }
        Call { callee, args } => format!(
            "call {}({})",
            print_inline(arena, *callee),
            print_list(arena, *args, ", ")
        ),
        Quote { values } => format!("quote {}", print_list(arena, *values, ", ")),
        BasicBlock { name, .. } => format!("bb {}", arena.str(*name)),
        Function { name, .. } => format!("fn {}", arena.str(*name)),
        other => other.tag_name().to_owned(),
    }
}

fn print_list(arena: &IrArena, ns: Nodes, sep: &str) -> String {
    arena
        .node_list(ns)
        .iter()
        .map(|&n| print_inline(arena, n))
        .collect::<Vec<_>>()
        .join(sep)
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn print_body(arena: &IrArena, node: NodeId, depth: usize, out: &mut String) {
    use NodeData::*;
    match arena.data(node) {
        Let {
            instruction,
            vars,
            tail,
        } => {
            indent(depth, out);
            if arena.node_list(*vars).is_empty() {
                out.push_str(&format!("{}\n", print_inline(arena, *instruction)));
            } else {
                out.push_str(&format!(
                    "let {} = {}\n",
                    print_list(arena, *vars, ", "),
                    print_inline(arena, *instruction)
                ));
            }
            if let Some(tail) = tail {
                print_body(arena, *tail, depth, out);
            }
        }
        Return { values } => {
            indent(depth, out);
            out.push_str(&format!("return {}\n", print_list(arena, *values, ", ")));
        }
        Jump { target, args } => {
            indent(depth, out);
            out.push_str(&format!(
                "jump {}({})",
                print_inline(arena, *target),
                print_list(arena, *args, ", ")
            ));
            out.push('\n');
        }
        Branch {
            condition,
            true_target,
            false_target,
            args,
        } => {
            indent(depth, out);
            out.push_str(&format!(
                "branch {}, {}, {} ({})\n",
                print_inline(arena, *condition),
                print_inline(arena, *true_target),
                print_inline(arena, *false_target),
                print_list(arena, *args, ", ")
            ));
        }
        Join { join_point, args } => {
            indent(depth, out);
            out.push_str(&format!(
                "join {}({})\n",
                print_inline(arena, *join_point),
                print_list(arena, *args, ", ")
            ));
        }
        TailCall { callee, args } => {
            indent(depth, out);
            out.push_str(&format!(
                "tail_call {}({})\n",
                print_inline(arena, *callee),
                print_list(arena, *args, ", ")
            ));
        }
        MergeSelection { args } => {
            indent(depth, out);
            out.push_str(&format!("merge {}\n", print_list(arena, *args, ", ")));
        }
        MergeContinue { args } => {
            indent(depth, out);
            out.push_str(&format!("continue {}\n", print_list(arena, *args, ", ")));
        }
        MergeBreak { args } => {
            indent(depth, out);
            out.push_str(&format!("break {}\n", print_list(arena, *args, ", ")));
        }
        Unreachable => {
            indent(depth, out);
            out.push_str("unreachable\n");
        }
        _ => {
            indent(depth, out);
            out.push_str(&print_inline(arena, node));
            out.push('\n');
        }
    }
}

fn print_decl(arena: &IrArena, decl: NodeId, out: &mut String) {
    use NodeData::*;
    match arena.data(decl) {
        Function {
            name,
            params,
            return_types,
            body,
            ..
        } => {
            let params_s = arena
                .node_list(*params)
                .iter()
                .map(|&p| {
                    let ty = arena
                        .node_type(p)
                        .map(|t| format!("{} ", print_inline(arena, t)))
                        .unwrap_or_default();
                    format!("{}{}", ty, print_inline(arena, p))
                })
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(
                "  fn @{}({}) -> ({}) {{\n",
                arena.str(*name),
                params_s,
                print_list(arena, *return_types, ", ")
            ));
            if let Some(body) = body {
                print_body(arena, *body, 2, out);
            }
            out.push_str("  }\n");
        }
        Constant {
            name,
            type_hint,
            value,
            ..
        } => {
            let hint = type_hint
                .map(|t| format!(": {}", print_inline(arena, t)))
                .unwrap_or_default();
            let v = value
                .map(|v| format!(" = {}", print_inline(arena, v)))
                .unwrap_or_default();
            out.push_str(&format!("  const @{}{}{}\n", arena.str(*name), hint, v));
        }
        GlobalVariable {
            name,
            ty,
            addr_space,
            init,
            ..
        } => {
            let i = init
                .map(|v| format!(" = {}", print_inline(arena, v)))
                .unwrap_or_default();
            out.push_str(&format!(
                "  global {} @{}: {}{}\n",
                addr_space.name(),
                arena.str(*name),
                print_inline(arena, *ty),
                i
            ));
        }
        NominalType { name, body, .. } => {
            let b = body
                .map(|b| format!(" = {}", print_inline(arena, b)))
                .unwrap_or_default();
            out.push_str(&format!("  type @{}{}\n", arena.str(*name), b));
        }
        other => {
            out.push_str(&format!("  {}\n", other.tag_name()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;

    #[test]
    fn test_print_simple_function() {
        let mut a = IrArena::new(ArenaConfig {
            check_types: true,
            ..Default::default()
        });
        let five = a.int32_literal(5);
        let values = a.singleton(five);
        let ret = a.node(NodeData::Return { values });
        let name = a.intern_string("main");
        let annotations = a.empty();
        let params = a.empty();
        let int32 = a.int32_type();
        let rt = a.qualified_type(true, int32);
        let return_types = a.singleton(rt);
        let f = a.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: Some(ret),
        });
        let mut m = Module::new("demo");
        m.add_declaration(f);
        let text = print_module(&a, &m);
        assert!(text.contains("fn @main"));
        assert!(text.contains("return 5i32"));
    }
}
