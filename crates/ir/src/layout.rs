//! Byte layout of types
//!
//! The stack, pointer and subgroup lowerings all reason about data as
//! sequences of 32-bit words; this module is their shared answer to "how
//! big is this type".

use crate::arena::{IrArena, NodeId};
use crate::node::NodeData;

pub const WORD_SIZE_IN_BYTES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMemLayout {
    pub size_in_bytes: u32,
    pub alignment_in_bytes: u32,
}

/// Number of 32-bit words needed to hold `bytes`.
pub fn bytes_to_words(bytes: u32) -> u32 {
    bytes.div_ceil(WORD_SIZE_IN_BYTES)
}

fn align_to(offset: u32, alignment: u32) -> u32 {
    offset.div_ceil(alignment) * alignment
}

/// Compute the layout of a data type. Emulated physical pointers are
/// 64-bit integers until lower_int shrinks the world to 32 bits.
pub fn get_mem_layout(arena: &IrArena, ty: NodeId) -> TypeMemLayout {
    match arena.data(ty) {
        NodeData::IntType { width, .. } => {
            let b = width.bytes();
            TypeMemLayout {
                size_in_bytes: b,
                alignment_in_bytes: b,
            }
        }
        NodeData::FloatType { width } => {
            let b = width.bytes();
            TypeMemLayout {
                size_in_bytes: b,
                alignment_in_bytes: b,
            }
        }
        // booleans occupy a full word on the emulated stack
        NodeData::BoolType => TypeMemLayout {
            size_in_bytes: WORD_SIZE_IN_BYTES,
            alignment_in_bytes: WORD_SIZE_IN_BYTES,
        },
        NodeData::PackType { elem, width } => {
            let e = get_mem_layout(arena, *elem);
            TypeMemLayout {
                size_in_bytes: e.size_in_bytes * width,
                alignment_in_bytes: e.alignment_in_bytes,
            }
        }
        NodeData::RecordType { members, .. } => {
            let mut offset = 0;
            let mut alignment = 1;
            for &m in arena.node_list(*members) {
                let l = get_mem_layout(arena, m);
                offset = align_to(offset, l.alignment_in_bytes) + l.size_in_bytes;
                alignment = alignment.max(l.alignment_in_bytes);
            }
            TypeMemLayout {
                size_in_bytes: align_to(offset, alignment),
                alignment_in_bytes: alignment,
            }
        }
        NodeData::ArrayType {
            elem,
            size: Some(size),
        } => {
            let e = get_mem_layout(arena, *elem);
            let n = arena
                .resolve_int_literal(*size)
                .expect("array size must be a literal for layout") as u32;
            let stride = align_to(e.size_in_bytes, e.alignment_in_bytes);
            TypeMemLayout {
                size_in_bytes: stride * n,
                alignment_in_bytes: e.alignment_in_bytes,
            }
        }
        NodeData::PtrType { addr_space, .. } if addr_space.is_physical() => TypeMemLayout {
            size_in_bytes: 8,
            alignment_in_bytes: 8,
        },
        NodeData::MaskType => TypeMemLayout {
            size_in_bytes: 8,
            alignment_in_bytes: 8,
        },
        NodeData::QualifiedType { inner, .. } => get_mem_layout(arena, *inner),
        NodeData::NominalType {
            body: Some(body), ..
        } => get_mem_layout(arena, *body),
        other => panic!("no memory layout for {}", other.tag_name()),
    }
}

/// Offset in bytes of record member `index`.
pub fn record_member_offset(arena: &IrArena, record: NodeId, index: usize) -> u32 {
    match arena.data(record) {
        NodeData::RecordType { members, .. } => {
            let members = arena.node_list(*members);
            let mut offset = 0;
            for (i, &m) in members.iter().enumerate() {
                let l = get_mem_layout(arena, m);
                offset = align_to(offset, l.alignment_in_bytes);
                if i == index {
                    return offset;
                }
                offset += l.size_in_bytes;
            }
            panic!("member index {} out of range", index)
        }
        other => panic!("member offset of {}", other.tag_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;
    use crate::node::{IntWidth, RecordKind};

    #[test]
    fn test_scalar_layouts() {
        let mut a = IrArena::new(ArenaConfig::default());
        let i64t = a.int64_type();
        assert_eq!(
            get_mem_layout(&a, i64t),
            TypeMemLayout {
                size_in_bytes: 8,
                alignment_in_bytes: 8
            }
        );
        let b = a.bool_type();
        assert_eq!(get_mem_layout(&a, b).size_in_bytes, 4);
    }

    #[test]
    fn test_record_padding() {
        let mut a = IrArena::new(ArenaConfig::default());
        let i8t = a.int_type(IntWidth::I8, false);
        let i32t = a.int32_type();
        let members = a.intern_list(&[i8t, i32t]);
        let r = a.node(NodeData::RecordType {
            members,
            kind: RecordKind::Plain,
        });
        let l = get_mem_layout(&a, r);
        // u8 at 0, padding to 4, u32 at 4
        assert_eq!(l.size_in_bytes, 8);
        assert_eq!(l.alignment_in_bytes, 4);
        assert_eq!(record_member_offset(&a, r, 0), 0);
        assert_eq!(record_member_offset(&a, r, 1), 4);
    }

    #[test]
    fn test_words_arithmetic() {
        assert_eq!(bytes_to_words(1), 1);
        assert_eq!(bytes_to_words(4), 1);
        assert_eq!(bytes_to_words(5), 2);
        assert_eq!(bytes_to_words(8), 2);
    }
}
