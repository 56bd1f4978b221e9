//! Arena allocation and hash-consing
//!
//! An [`IrArena`] owns every node, string and node list of one IR
//! generation. Construction goes through [`IrArena::node`], which runs the
//! typing rules and the folder when the arena's [`ArenaConfig`] enables
//! them, then canonicalizes through the hash-cons table: within one arena,
//! structurally equal hash-consable payloads always yield the same
//! [`NodeId`]. Declarations and basic blocks bypass the table so rewriters
//! can allocate stubs and patch their bodies later; those patch operations
//! refuse to run once the arena is frozen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::node::{FloatWidth, IntWidth, NodeData, Op, RecordKind};
use crate::{check, fold};

/// Tags every arena in the process so node ids can be audited for arena
/// confusion. Purely diagnostic; carries no other state.
static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a node within its arena. The arena tag makes accidental
/// cross-arena dereferences a hard error instead of silent garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) arena: u32,
    pub(crate) index: u32,
}

/// An interned, immutable, ordered sequence of nodes. Copying is free;
/// structural equality is id equality within one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nodes {
    pub(crate) arena: u32,
    pub(crate) index: u32,
}

/// An interned immutable string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId {
    pub(crate) arena: u32,
    pub(crate) index: u32,
}

/// How subgroup masks are represented in types and primops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskRepr {
    /// The opaque MaskType.
    #[default]
    Abstract,
    /// A single 64-bit integer.
    Int64,
    /// Four packed 32-bit integers (SPV KHR ballot layout).
    PackedBallot,
}

/// Per-arena knobs. Passes flip these between generations.
#[derive(Debug, Clone, Copy)]
pub struct ArenaConfig {
    /// When false, name references are still textual `Unbound` nodes.
    pub name_bound: bool,
    /// Run the typing rules on construction.
    pub check_types: bool,
    /// Run the folder on construction.
    pub allow_fold: bool,
    pub subgroup_mask_representation: MaskRepr,
    /// Whether qualified types and subgroup ops are meaningful.
    pub is_simt: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            name_bound: false,
            check_types: false,
            allow_fold: false,
            subgroup_mask_representation: MaskRepr::Abstract,
            is_simt: true,
        }
    }
}

pub struct IrArena {
    id: u32,
    config: ArenaConfig,
    nodes: Vec<NodeData>,
    /// Derived qualified type per node, parallel to `nodes`.
    types: Vec<Option<NodeId>>,
    /// Content-addressed table for hash-consable variants.
    interned: HashMap<NodeData, u32>,
    strings: Vec<String>,
    string_table: HashMap<String, u32>,
    lists: Vec<Vec<NodeId>>,
    list_table: HashMap<Vec<NodeId>, u32>,
    next_var_id: u32,
    next_name_id: u32,
    frozen: bool,
}

impl IrArena {
    pub fn new(config: ArenaConfig) -> Self {
        IrArena {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            config,
            nodes: Vec::new(),
            types: Vec::new(),
            interned: HashMap::new(),
            strings: Vec::new(),
            string_table: HashMap::new(),
            lists: Vec::new(),
            list_table: HashMap::new(),
            next_var_id: 0,
            next_name_id: 0,
            frozen: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids, in allocation order. For the verifier's full walks.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        let arena = self.id;
        (0..self.nodes.len() as u32).map(move |index| NodeId { arena, index })
    }

    /// Whether this id belongs to this arena.
    pub fn owns(&self, id: NodeId) -> bool {
        id.arena == self.id && (id.index as usize) < self.nodes.len()
    }

    pub fn owns_list(&self, ns: Nodes) -> bool {
        ns.arena == self.id && (ns.index as usize) < self.lists.len()
    }

    /// No further construction or patching is allowed after this.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    // ---- access ----

    pub fn data(&self, id: NodeId) -> &NodeData {
        assert_eq!(id.arena, self.id, "node id from a different arena");
        &self.nodes[id.index as usize]
    }

    /// The derived qualified type of a node, when the arena is typed and the
    /// variant has a typing rule.
    pub fn node_type(&self, id: NodeId) -> Option<NodeId> {
        assert_eq!(id.arena, self.id, "node id from a different arena");
        self.types[id.index as usize]
    }

    pub fn str(&self, s: StringId) -> &str {
        assert_eq!(s.arena, self.id, "string id from a different arena");
        &self.strings[s.index as usize]
    }

    pub fn node_list(&self, ns: Nodes) -> &[NodeId] {
        assert_eq!(ns.arena, self.id, "node list from a different arena");
        &self.lists[ns.index as usize]
    }

    // ---- interning ----

    pub fn intern_string(&mut self, s: &str) -> StringId {
        if let Some(&index) = self.string_table.get(s) {
            return StringId { arena: self.id, index };
        }
        assert!(!self.frozen, "arena is frozen");
        let index = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.string_table.insert(s.to_owned(), index);
        StringId { arena: self.id, index }
    }

    /// A name guaranteed not to collide with any other `unique_name` result
    /// from this arena.
    pub fn unique_name(&mut self, base: &str) -> StringId {
        let n = self.next_name_id;
        self.next_name_id += 1;
        let name = format!("{}_{}", base, n);
        self.intern_string(&name)
    }

    pub fn intern_list(&mut self, ids: &[NodeId]) -> Nodes {
        for id in ids {
            assert_eq!(id.arena, self.id, "interning a foreign node id");
        }
        if let Some(&index) = self.list_table.get(ids) {
            return Nodes { arena: self.id, index };
        }
        assert!(!self.frozen, "arena is frozen");
        let index = self.lists.len() as u32;
        self.lists.push(ids.to_vec());
        self.list_table.insert(ids.to_vec(), index);
        Nodes { arena: self.id, index }
    }

    pub fn empty(&mut self) -> Nodes {
        self.intern_list(&[])
    }

    pub fn singleton(&mut self, id: NodeId) -> Nodes {
        self.intern_list(&[id])
    }

    pub fn append_nodes(&mut self, ns: Nodes, id: NodeId) -> Nodes {
        let mut v = self.node_list(ns).to_vec();
        v.push(id);
        self.intern_list(&v)
    }

    pub fn concat_nodes(&mut self, a: Nodes, b: Nodes) -> Nodes {
        let mut v = self.node_list(a).to_vec();
        v.extend_from_slice(self.node_list(b));
        self.intern_list(&v)
    }

    // ---- construction ----

    /// Construct a node: run the typing rules and the folder per the arena
    /// config, then canonicalize. Hash-consable payloads that already exist
    /// return the existing id; unique variants always allocate.
    pub fn node(&mut self, data: NodeData) -> NodeId {
        assert!(!self.frozen, "arena is frozen");

        let ty = if self.config.check_types {
            check::derive_type(self, &data)
        } else {
            None
        };

        if self.config.allow_fold {
            if let Some(folded) = fold::fold_node(self, &data) {
                return folded;
            }
        }

        if data.is_unique() {
            return self.alloc(data, ty);
        }

        if let Some(&index) = self.interned.get(&data) {
            return NodeId { arena: self.id, index };
        }

        let id = self.alloc(data.clone(), ty);
        self.interned.insert(data, id.index);
        id
    }

    fn alloc(&mut self, data: NodeData, ty: Option<NodeId>) -> NodeId {
        let index = self.nodes.len() as u32;
        self.nodes.push(data);
        self.types.push(ty);
        NodeId { arena: self.id, index }
    }

    /// A fresh variable. Never unifies with any other variable.
    pub fn fresh_var(&mut self, ty: Option<NodeId>, name: &str) -> NodeId {
        let name = self.intern_string(name);
        let id = self.next_var_id;
        self.next_var_id += 1;
        self.node(NodeData::Variable { name, ty, id })
    }

    // ---- declaration patching ----
    //
    // Declarations are the only mutable nodes; mutation is confined to the
    // pass that allocated them and must cease before the arena freezes.

    pub fn set_function_body(&mut self, f: NodeId, new_body: NodeId) {
        assert!(!self.frozen, "arena is frozen");
        assert_eq!(f.arena, self.id);
        match &mut self.nodes[f.index as usize] {
            NodeData::Function { body, .. } => *body = Some(new_body),
            other => panic!("set_function_body on {}", other.tag_name()),
        }
    }

    pub fn set_basic_block_body(&mut self, bb: NodeId, new_body: NodeId) {
        assert!(!self.frozen, "arena is frozen");
        assert_eq!(bb.arena, self.id);
        match &mut self.nodes[bb.index as usize] {
            NodeData::BasicBlock { body, .. } => *body = Some(new_body),
            other => panic!("set_basic_block_body on {}", other.tag_name()),
        }
    }

    pub fn set_constant_value(&mut self, c: NodeId, new_value: NodeId) {
        assert!(!self.frozen, "arena is frozen");
        assert_eq!(c.arena, self.id);
        match &mut self.nodes[c.index as usize] {
            NodeData::Constant { value, .. } => *value = Some(new_value),
            other => panic!("set_constant_value on {}", other.tag_name()),
        }
    }

    pub fn set_nominal_type_body(&mut self, n: NodeId, new_body: NodeId) {
        assert!(!self.frozen, "arena is frozen");
        assert_eq!(n.arena, self.id);
        match &mut self.nodes[n.index as usize] {
            NodeData::NominalType { body, .. } => *body = Some(new_body),
            other => panic!("set_nominal_type_body on {}", other.tag_name()),
        }
    }
}

/// Shorthand constructors for the nodes passes build constantly.
impl IrArena {
    pub fn int_type(&mut self, width: IntWidth, signed: bool) -> NodeId {
        self.node(NodeData::IntType { width, signed })
    }

    pub fn int32_type(&mut self) -> NodeId {
        self.int_type(IntWidth::I32, true)
    }

    pub fn uint32_type(&mut self) -> NodeId {
        self.int_type(IntWidth::I32, false)
    }

    pub fn int64_type(&mut self) -> NodeId {
        self.int_type(IntWidth::I64, true)
    }

    pub fn uint64_type(&mut self) -> NodeId {
        self.int_type(IntWidth::I64, false)
    }

    pub fn float_type(&mut self, width: FloatWidth) -> NodeId {
        self.node(NodeData::FloatType { width })
    }

    pub fn bool_type(&mut self) -> NodeId {
        self.node(NodeData::BoolType)
    }

    pub fn mask_type(&mut self) -> NodeId {
        self.node(NodeData::MaskType)
    }

    /// The empty multiple-return record: the type of instructions yielding
    /// nothing.
    pub fn unit_type(&mut self) -> NodeId {
        let members = self.empty();
        self.node(NodeData::RecordType {
            members,
            kind: RecordKind::MultipleReturn,
        })
    }

    pub fn qualified_type(&mut self, uniform: bool, inner: NodeId) -> NodeId {
        self.node(NodeData::QualifiedType { uniform, inner })
    }

    pub fn int_literal(&mut self, width: IntWidth, signed: bool, value: u64) -> NodeId {
        self.node(NodeData::IntLit { width, signed, value })
    }

    pub fn int32_literal(&mut self, value: i32) -> NodeId {
        self.int_literal(IntWidth::I32, true, value as u32 as u64)
    }

    pub fn uint32_literal(&mut self, value: u32) -> NodeId {
        self.int_literal(IntWidth::I32, false, value as u64)
    }

    pub fn int64_literal(&mut self, value: i64) -> NodeId {
        self.int_literal(IntWidth::I64, true, value as u64)
    }

    pub fn uint64_literal(&mut self, value: u64) -> NodeId {
        self.int_literal(IntWidth::I64, false, value)
    }

    pub fn true_literal(&mut self) -> NodeId {
        self.node(NodeData::BoolLit { value: true })
    }

    pub fn false_literal(&mut self) -> NodeId {
        self.node(NodeData::BoolLit { value: false })
    }

    pub fn prim_op(&mut self, op: Op, type_args: Nodes, operands: Nodes) -> NodeId {
        self.node(NodeData::PrimOp { op, type_args, operands })
    }

    /// Turns values into an instruction; the enclosing let folds away later.
    pub fn quote(&mut self, values: Nodes) -> NodeId {
        self.node(NodeData::Quote { values })
    }

    pub fn quote_single(&mut self, value: NodeId) -> NodeId {
        let values = self.singleton(value);
        self.quote(values)
    }

    /// The signed integer payload of a node, when it is an integer literal.
    pub fn resolve_int_literal(&self, id: NodeId) -> Option<i64> {
        match self.data(id) {
            NodeData::IntLit { width, signed, value } => {
                let v = *value;
                Some(if *signed {
                    // sign-extend from the literal's width
                    let shift = 64 - width.bits();
                    ((v << shift) as i64) >> shift
                } else {
                    v as i64
                })
            }
            _ => None,
        }
    }
}

/// The first element of an interned sequence.
pub fn first(arena: &IrArena, ns: Nodes) -> NodeId {
    arena.node_list(ns)[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_cons_same_arena() {
        let mut a = IrArena::new(ArenaConfig::default());
        let x = a.int32_literal(7);
        let y = a.int32_literal(7);
        assert_eq!(x, y);
        let z = a.int32_literal(8);
        assert_ne!(x, z);
    }

    #[test]
    fn test_hash_cons_distinct_arenas() {
        let mut a = IrArena::new(ArenaConfig::default());
        let mut b = IrArena::new(ArenaConfig::default());
        let x = a.int32_literal(7);
        let y = b.int32_literal(7);
        assert_ne!(x, y);
    }

    #[test]
    fn test_declarations_are_unique() {
        let mut a = IrArena::new(ArenaConfig::default());
        let name = a.intern_string("c");
        let annotations = a.empty();
        let c1 = a.node(NodeData::Constant {
            name,
            annotations,
            type_hint: None,
            value: None,
        });
        let c2 = a.node(NodeData::Constant {
            name,
            annotations,
            type_hint: None,
            value: None,
        });
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_fresh_vars_never_unify() {
        let mut a = IrArena::new(ArenaConfig::default());
        let v1 = a.fresh_var(None, "x");
        let v2 = a.fresh_var(None, "x");
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_list_interning() {
        let mut a = IrArena::new(ArenaConfig::default());
        let x = a.int32_literal(1);
        let y = a.int32_literal(2);
        let l1 = a.intern_list(&[x, y]);
        let l2 = a.intern_list(&[x, y]);
        assert_eq!(l1, l2);
        let l3 = a.append_nodes(l1, x);
        assert_eq!(a.node_list(l3), &[x, y, x]);
        let l4 = a.concat_nodes(l1, l1);
        assert_eq!(a.node_list(l4), &[x, y, x, y]);
    }

    #[test]
    fn test_string_interning() {
        let mut a = IrArena::new(ArenaConfig::default());
        let s1 = a.intern_string("foo");
        let s2 = a.intern_string("foo");
        assert_eq!(s1, s2);
        assert_eq!(a.str(s1), "foo");
        let u1 = a.unique_name("bb");
        let u2 = a.unique_name("bb");
        assert_ne!(u1, u2);
    }

    #[test]
    fn test_resolve_int_literal_sign_extension() {
        let mut a = IrArena::new(ArenaConfig::default());
        let neg = a.int_literal(IntWidth::I8, true, 0xFF);
        assert_eq!(a.resolve_int_literal(neg), Some(-1));
        let pos = a.int_literal(IntWidth::I8, false, 0xFF);
        assert_eq!(a.resolve_int_literal(pos), Some(255));
    }

    #[test]
    #[should_panic(expected = "different arena")]
    fn test_cross_arena_access_panics() {
        let mut a = IrArena::new(ArenaConfig::default());
        let b = IrArena::new(ArenaConfig::default());
        let x = a.int32_literal(1);
        let _ = b.data(x);
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn test_frozen_arena_rejects_construction() {
        let mut a = IrArena::new(ArenaConfig::default());
        a.freeze();
        let _ = a.int32_literal(1);
    }
}
