//! Address spaces and qualified-type helpers.

use crate::arena::{IrArena, NodeId};
use crate::node::NodeData;

/// Where a pointer points. Physical spaces use a flat integer address model;
/// logical spaces are opaque handles resolved statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Private,
    Shared,
    Subgroup,
    Global,
    GlobalLogical,
    /// Constant buffer memory.
    Uniform,
    Ssbo,
    PushConstant,
    /// Local allocations (alloca results).
    Function,
    Generic,
}

impl AddressSpace {
    /// Spaces where pointers are ordinary integers indexing flat storage.
    pub fn is_physical(self) -> bool {
        use AddressSpace::*;
        matches!(self, Private | Shared | Subgroup | Global | Generic)
    }

    /// Whether a load from this space yields the same data for every thread
    /// of a subgroup (given a uniform address). Per-thread spaces do not.
    pub fn is_uniform(self) -> bool {
        use AddressSpace::*;
        !matches!(self, Private | Function | Generic)
    }

    pub fn name(self) -> &'static str {
        use AddressSpace::*;
        match self {
            Private => "private",
            Shared => "shared",
            Subgroup => "subgroup",
            Global => "global",
            GlobalLogical => "global_logical",
            Uniform => "uniform",
            Ssbo => "ssbo",
            PushConstant => "push_constant",
            Function => "function",
            Generic => "generic",
        }
    }
}

/// Strips the qualifier off a type, if there is one.
pub fn get_unqualified_type(arena: &IrArena, ty: NodeId) -> NodeId {
    match arena.data(ty) {
        NodeData::QualifiedType { inner, .. } => *inner,
        _ => ty,
    }
}

/// Whether a qualified type is uniform. Unqualified types are treated as
/// uniform (they only occur in non-SIMT arenas).
pub fn is_qualified_uniform(arena: &IrArena, ty: NodeId) -> bool {
    match arena.data(ty) {
        NodeData::QualifiedType { uniform, .. } => *uniform,
        _ => true,
    }
}

/// Derived qualified type of a value node. Panics when the arena was built
/// without `check_types`.
pub fn value_type(arena: &IrArena, value: NodeId) -> NodeId {
    arena
        .node_type(value)
        .unwrap_or_else(|| panic!("value {} has no derived type", arena.data(value).tag_name()))
}

/// The types an instruction yields, unpacked from the multiple-return
/// convention: unit record means zero, a multiple-return record is one entry
/// per member, anything else is a single yield.
pub fn unpack_yield_types(arena: &IrArena, instr_ty: NodeId) -> Vec<NodeId> {
    match arena.data(instr_ty) {
        NodeData::RecordType {
            members,
            kind: crate::node::RecordKind::MultipleReturn,
        } => arena.node_list(*members).to_vec(),
        _ => vec![instr_ty],
    }
}

/// Inverse of [`unpack_yield_types`]: wrap a list of qualified types into a
/// single instruction type.
pub fn pack_yield_types(arena: &mut IrArena, types: &[NodeId]) -> NodeId {
    match types.len() {
        1 => types[0],
        _ => {
            let members = arena.intern_list(types);
            arena.node(NodeData::RecordType {
                members,
                kind: crate::node::RecordKind::MultipleReturn,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_spaces() {
        assert!(AddressSpace::Private.is_physical());
        assert!(AddressSpace::Global.is_physical());
        assert!(!AddressSpace::Ssbo.is_physical());
        assert!(!AddressSpace::Function.is_physical());
    }

    #[test]
    fn test_uniform_spaces() {
        assert!(AddressSpace::Subgroup.is_uniform());
        assert!(AddressSpace::Ssbo.is_uniform());
        assert!(!AddressSpace::Private.is_uniform());
        assert!(!AddressSpace::Function.is_uniform());
    }
}
