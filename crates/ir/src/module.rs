//! Modules and declaration helpers
//!
//! A module is a named list of top-level declarations living in one arena.
//! The helpers here are how passes interrogate declarations: names,
//! annotations, abstraction bodies.

use crate::arena::{IrArena, NodeId, Nodes};
use crate::node::NodeData;

#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    decls: Vec<NodeId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            decls: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declarations(&self) -> &[NodeId] {
        &self.decls
    }

    pub fn add_declaration(&mut self, decl: NodeId) {
        self.decls.push(decl);
    }

    pub fn find_declaration(&self, arena: &IrArena, name: &str) -> Option<NodeId> {
        self.decls
            .iter()
            .copied()
            .find(|&d| get_decl_name(arena, d) == name)
    }
}

/// An arena together with the module it holds; what passes consume and
/// produce. The arena outlives the module's contents by construction.
pub struct Program {
    pub arena: IrArena,
    pub module: Module,
}

/// The name of a function, constant, global variable or nominal type.
pub fn get_decl_name(arena: &IrArena, decl: NodeId) -> &str {
    match arena.data(decl) {
        NodeData::Function { name, .. }
        | NodeData::Constant { name, .. }
        | NodeData::GlobalVariable { name, .. }
        | NodeData::NominalType { name, .. } => arena.str(*name),
        other => panic!("get_decl_name on {}", other.tag_name()),
    }
}

pub fn get_decl_annotations(arena: &IrArena, decl: NodeId) -> Nodes {
    match arena.data(decl) {
        NodeData::Function { annotations, .. }
        | NodeData::Constant { annotations, .. }
        | NodeData::GlobalVariable { annotations, .. }
        | NodeData::NominalType { annotations, .. } => *annotations,
        other => panic!("get_decl_annotations on {}", other.tag_name()),
    }
}

pub fn get_annotation_name(arena: &IrArena, annotation: NodeId) -> &str {
    match arena.data(annotation) {
        NodeData::Annotation { name }
        | NodeData::AnnotationValue { name, .. }
        | NodeData::AnnotationValues { name, .. } => arena.str(*name),
        other => panic!("get_annotation_name on {}", other.tag_name()),
    }
}

/// The annotation with the given name attached to a declaration, if any.
pub fn lookup_annotation(arena: &IrArena, decl: NodeId, name: &str) -> Option<NodeId> {
    let annotations = get_decl_annotations(arena, decl);
    arena
        .node_list(annotations)
        .iter()
        .copied()
        .find(|&a| get_annotation_name(arena, a) == name)
}

pub fn extract_annotation_value(arena: &IrArena, annotation: NodeId) -> Option<NodeId> {
    match arena.data(annotation) {
        NodeData::AnnotationValue { value, .. } => Some(*value),
        _ => None,
    }
}

pub fn extract_annotation_values(arena: &IrArena, annotation: NodeId) -> Vec<NodeId> {
    match arena.data(annotation) {
        NodeData::AnnotationValue { value, .. } => vec![*value],
        NodeData::AnnotationValues { values, .. } => arena.node_list(*values).to_vec(),
        _ => Vec::new(),
    }
}

/// The string literal attached to an annotation, if present.
pub fn extract_annotation_string_payload<'a>(
    arena: &'a IrArena,
    annotation: NodeId,
) -> Option<&'a str> {
    let value = extract_annotation_value(arena, annotation)?;
    match arena.data(value) {
        NodeData::StringLit { string } => Some(arena.str(*string)),
        _ => None,
    }
}

/// True when the declaration carries `name` with the exact string payload.
pub fn lookup_annotation_with_string_payload(
    arena: &IrArena,
    decl: NodeId,
    name: &str,
    expected: &str,
) -> bool {
    lookup_annotation(arena, decl, name)
        .and_then(|a| extract_annotation_string_payload(arena, a))
        == Some(expected)
}

// ---- abstractions ----

pub fn get_abstraction_name(arena: &IrArena, abs: NodeId) -> &str {
    match arena.data(abs) {
        NodeData::Function { name, .. } | NodeData::BasicBlock { name, .. } => arena.str(*name),
        NodeData::Case { .. } => "case",
        other => panic!("get_abstraction_name on {}", other.tag_name()),
    }
}

pub fn get_abstraction_params(arena: &IrArena, abs: NodeId) -> Nodes {
    match arena.data(abs) {
        NodeData::Function { params, .. }
        | NodeData::BasicBlock { params, .. }
        | NodeData::Case { params, .. } => *params,
        other => panic!("get_abstraction_params on {}", other.tag_name()),
    }
}

pub fn get_abstraction_body(arena: &IrArena, abs: NodeId) -> Option<NodeId> {
    match arena.data(abs) {
        NodeData::Function { body, .. } | NodeData::BasicBlock { body, .. } => *body,
        NodeData::Case { body, .. } => Some(*body),
        other => panic!("get_abstraction_body on {}", other.tag_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;

    fn make_annotated_fn(a: &mut IrArena) -> NodeId {
        let entry = a.intern_string("EntryPoint");
        let payload = a.intern_string("compute");
        let lit = a.node(NodeData::StringLit { string: payload });
        let ann = a.node(NodeData::AnnotationValue {
            name: entry,
            value: lit,
        });
        let name = a.intern_string("main");
        let annotations = a.singleton(ann);
        let params = a.empty();
        let return_types = a.empty();
        a.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: None,
        })
    }

    #[test]
    fn test_annotation_lookup() {
        let mut a = IrArena::new(ArenaConfig::default());
        let f = make_annotated_fn(&mut a);
        let ann = lookup_annotation(&a, f, "EntryPoint").unwrap();
        assert_eq!(get_annotation_name(&a, ann), "EntryPoint");
        assert_eq!(extract_annotation_string_payload(&a, ann), Some("compute"));
        assert!(lookup_annotation(&a, f, "Internal").is_none());
        assert!(lookup_annotation_with_string_payload(
            &a,
            f,
            "EntryPoint",
            "compute"
        ));
    }

    #[test]
    fn test_module_find_declaration() {
        let mut a = IrArena::new(ArenaConfig::default());
        let f = make_annotated_fn(&mut a);
        let mut m = Module::new("test");
        m.add_declaration(f);
        assert_eq!(m.find_declaration(&a, "main"), Some(f));
        assert_eq!(m.find_declaration(&a, "other"), None);
        assert_eq!(get_decl_name(&a, f), "main");
    }
}
