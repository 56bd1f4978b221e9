//! Shade IR
//!
//! The intermediate representation of the Shade shading-language compiler:
//! a hash-consed, arena-allocated node graph with on-construction typing,
//! local folding, and the building blocks passes use to synthesize code.
//!
//! Everything is a [`node::NodeData`] allocated in an [`arena::IrArena`];
//! structurally equal hash-consable nodes are id-equal within one arena.
//! Declarations are unique mutable handles so rewriters can stub them out
//! and patch bodies after the fact. See the `shade-compiler` crate for the
//! rewriter and the lowering pipeline that consume this IR.

pub mod arena;
pub mod builder;
pub mod layout;
pub mod module;
pub mod node;
pub mod print;
pub mod types;

mod check;
mod fold;

pub use arena::{ArenaConfig, IrArena, MaskRepr, NodeId, Nodes, StringId, first};
pub use builder::BodyBuilder;
pub use check::actual_mask_type;
pub use layout::{TypeMemLayout, bytes_to_words, get_mem_layout};
pub use module::{
    Module, Program, extract_annotation_string_payload, extract_annotation_value,
    extract_annotation_values, get_abstraction_body, get_abstraction_name, get_abstraction_params,
    get_annotation_name, get_decl_annotations, get_decl_name, lookup_annotation,
    lookup_annotation_with_string_payload,
};
pub use node::{FloatWidth, IntWidth, NodeData, Op, RecordKind};
pub use print::{print_module, print_node};
pub use types::{
    AddressSpace, get_unqualified_type, is_qualified_uniform, pack_yield_types,
    unpack_yield_types, value_type,
};
