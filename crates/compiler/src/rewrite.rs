//! The rewriter framework
//!
//! Every pass is a [`Rewriter`]: it owns a [`RewriteCtx`] (source arena and
//! module, destination arena and module, memo map) and overrides `process`
//! where its semantics differ from identity. [`recreate_node_identity`]
//! reconstructs a node with every child rewritten; it is the terminal
//! fallback for pass authors.
//!
//! Declarations rewrite in two phases so cyclic references work: stubs with
//! rewritten signatures are allocated and memoized for every declaration
//! before any body is visited, then bodies are rewritten and patched in.
//! The same discipline applies to basic blocks encountered mid-walk, which
//! may jump to themselves or to siblings.

use std::collections::HashMap;

use shade_ir::arena::{ArenaConfig, IrArena, NodeId, Nodes, StringId};
use shade_ir::module::{Module, Program};
use shade_ir::node::NodeData;

pub struct RewriteCtx<'a> {
    pub src_arena: &'a IrArena,
    pub src_module: &'a Module,
    pub dst_arena: IrArena,
    pub dst_module: Module,
    memo: HashMap<NodeId, NodeId>,
}

impl<'a> RewriteCtx<'a> {
    pub fn new(src: &'a Program, dst_config: ArenaConfig) -> Self {
        RewriteCtx {
            src_arena: &src.arena,
            src_module: &src.module,
            dst_arena: IrArena::new(dst_config),
            dst_module: Module::new(src.module.name()),
            memo: HashMap::new(),
        }
    }

    /// Freeze the destination arena and hand back the finished program.
    /// The memo dies here; it never outlives its pass.
    pub fn finish(mut self) -> Program {
        self.dst_arena.freeze();
        Program {
            arena: self.dst_arena,
            module: self.dst_module,
        }
    }

    /// Look up an already-rewritten node.
    pub fn find_processed(&self, node: NodeId) -> Option<NodeId> {
        self.memo.get(&node).copied()
    }

    /// Record a rewrite, e.g. a declaration stub or a substituted variable.
    pub fn register_processed(&mut self, old: NodeId, new: NodeId) {
        self.memo.insert(old, new);
    }
}

/// Body-shaped nodes: terminators and anonymous abstractions. Hash-consing
/// can share these between functions, so passes that rewrite them
/// differently per enclosing context must bypass the memo for them (see
/// [`Rewriter::should_memoize`]).
pub fn is_body_node(data: &NodeData) -> bool {
    data.is_terminator() || matches!(data, NodeData::Case { .. })
}

pub trait Rewriter<'a>: Sized {
    fn ctx(&mut self) -> &mut RewriteCtx<'a>;

    /// The node-processing hook. The default is a pure identity rewrite.
    fn process(&mut self, node: NodeId) -> NodeId {
        recreate_node_identity(self, node)
    }

    /// Whether a node's rewrite may be cached and reused. Context-sensitive
    /// passes return false for body-shaped nodes: a return or merge that is
    /// structurally shared between two functions must still be rewritten
    /// against each function's own state.
    fn should_memoize(&mut self, _node: NodeId) -> bool {
        true
    }

    /// Build a declaration stub: rewritten signature, no body yet.
    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        recreate_decl_stub(self, decl)
    }

    /// Fill in a stub's body once every declaration is memoized.
    fn process_decl_body(&mut self, old: NodeId, new: NodeId) {
        recreate_decl_body(self, old, new)
    }
}

/// Memoized rewrite of one node. Rewriting the same source node twice
/// yields the same destination node, except where the pass opted out via
/// [`Rewriter::should_memoize`].
pub fn rewrite_node<'a, R: Rewriter<'a>>(r: &mut R, node: NodeId) -> NodeId {
    if !r.should_memoize(node) {
        return r.process(node);
    }
    if let Some(found) = r.ctx().find_processed(node) {
        return found;
    }
    let result = r.process(node);
    r.ctx().register_processed(node, result);
    result
}

pub fn rewrite_opt<'a, R: Rewriter<'a>>(r: &mut R, node: Option<NodeId>) -> Option<NodeId> {
    node.map(|n| rewrite_node(r, n))
}

pub fn rewrite_nodes<'a, R: Rewriter<'a>>(r: &mut R, ns: Nodes) -> Nodes {
    let ids = r.ctx().src_arena.node_list(ns).to_vec();
    let rewritten: Vec<_> = ids.into_iter().map(|n| rewrite_node(r, n)).collect();
    r.ctx().dst_arena.intern_list(&rewritten)
}

pub fn rewrite_string<'a, R: Rewriter<'a>>(r: &mut R, s: StringId) -> StringId {
    let text = r.ctx().src_arena.str(s).to_owned();
    r.ctx().dst_arena.intern_string(&text)
}

/// Rewrite a whole module: stubs for every declaration first, then bodies.
pub fn rewrite_module<'a, R: Rewriter<'a>>(r: &mut R) {
    let decls = r.ctx().src_module.declarations().to_vec();
    let mut stubs = Vec::with_capacity(decls.len());
    for &decl in &decls {
        let stub = match r.ctx().find_processed(decl) {
            Some(existing) => existing,
            None => {
                let stub = r.process_decl_stub(decl);
                r.ctx().register_processed(decl, stub);
                stub
            }
        };
        r.ctx().dst_module.add_declaration(stub);
        stubs.push(stub);
    }
    for (&decl, &stub) in decls.iter().zip(&stubs) {
        r.process_decl_body(decl, stub);
    }
}

/// Rewrite a declaration's header. Function parameters become fresh
/// variables in the destination arena and are memoized so body references
/// resolve to them.
pub fn recreate_decl_stub<'a, R: Rewriter<'a>>(r: &mut R, decl: NodeId) -> NodeId {
    let data = r.ctx().src_arena.data(decl).clone();
    match data {
        NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            ..
        } => {
            let name = rewrite_string(r, name);
            let annotations = rewrite_nodes(r, annotations);
            let params = rewrite_nodes(r, params);
            let return_types = rewrite_nodes(r, return_types);
            r.ctx().dst_arena.node(NodeData::Function {
                name,
                annotations,
                params,
                return_types,
                body: None,
            })
        }
        NodeData::Constant {
            name,
            annotations,
            type_hint,
            ..
        } => {
            let name = rewrite_string(r, name);
            let annotations = rewrite_nodes(r, annotations);
            let type_hint = rewrite_opt(r, type_hint);
            r.ctx().dst_arena.node(NodeData::Constant {
                name,
                annotations,
                type_hint,
                value: None,
            })
        }
        NodeData::GlobalVariable {
            name,
            annotations,
            ty,
            addr_space,
            init,
        } => {
            let name = rewrite_string(r, name);
            let annotations = rewrite_nodes(r, annotations);
            let ty = rewrite_node(r, ty);
            let init = rewrite_opt(r, init);
            r.ctx().dst_arena.node(NodeData::GlobalVariable {
                name,
                annotations,
                ty,
                addr_space,
                init,
            })
        }
        NodeData::NominalType {
            name, annotations, ..
        } => {
            let name = rewrite_string(r, name);
            let annotations = rewrite_nodes(r, annotations);
            r.ctx().dst_arena.node(NodeData::NominalType {
                name,
                annotations,
                body: None,
            })
        }
        other => panic!("not a declaration: {}", other.tag_name()),
    }
}

/// Rewrite a declaration's body into an already-allocated stub.
pub fn recreate_decl_body<'a, R: Rewriter<'a>>(r: &mut R, old: NodeId, new: NodeId) {
    let data = r.ctx().src_arena.data(old).clone();
    match data {
        NodeData::Function { body, .. } => {
            if let Some(body) = body {
                let body = rewrite_node(r, body);
                r.ctx().dst_arena.set_function_body(new, body);
            }
        }
        NodeData::Constant { value, .. } => {
            if let Some(value) = value {
                let value = rewrite_node(r, value);
                r.ctx().dst_arena.set_constant_value(new, value);
            }
        }
        NodeData::GlobalVariable { .. } => {}
        NodeData::NominalType { body, .. } => {
            if let Some(body) = body {
                let body = rewrite_node(r, body);
                r.ctx().dst_arena.set_nominal_type_body(new, body);
            }
        }
        other => panic!("not a declaration: {}", other.tag_name()),
    }
}

/// Reconstruct `node` in the destination arena with every payload field
/// recursively rewritten. Binders are rewritten before the regions they
/// scope over, so variable references always find their fresh definition in
/// the memo.
pub fn recreate_node_identity<'a, R: Rewriter<'a>>(r: &mut R, node: NodeId) -> NodeId {
    let data = r.ctx().src_arena.data(node).clone();
    match data {
        // declarations reached organically: stub, memoize, then body
        _ if data.is_declaration() => {
            if let Some(found) = r.ctx().find_processed(node) {
                return found;
            }
            let stub = r.process_decl_stub(node);
            r.ctx().register_processed(node, stub);
            r.process_decl_body(node, stub);
            stub
        }

        NodeData::BasicBlock { name, params, body } => {
            if let Some(found) = r.ctx().find_processed(node) {
                return found;
            }
            let name = rewrite_string(r, name);
            let params = rewrite_nodes(r, params);
            let stub = r.ctx().dst_arena.node(NodeData::BasicBlock {
                name,
                params,
                body: None,
            });
            // blocks can jump to themselves; memoize before the body
            r.ctx().register_processed(node, stub);
            if let Some(body) = body {
                let body = rewrite_node(r, body);
                r.ctx().dst_arena.set_basic_block_body(stub, body);
            }
            stub
        }

        NodeData::Variable { name, ty, .. } => {
            let name = r.ctx().src_arena.str(name).to_owned();
            let ty = rewrite_opt(r, ty);
            r.ctx().dst_arena.fresh_var(ty, &name)
        }

        NodeData::Let {
            instruction,
            vars,
            tail,
        } => {
            let instruction = rewrite_node(r, instruction);
            // a folded instruction substitutes its values straight into the
            // tail and the let disappears
            let quoted = match r.ctx().dst_arena.data(instruction) {
                NodeData::Quote { values } => Some(*values),
                _ => None,
            };
            if let (Some(values), Some(tail)) = (quoted, tail)
                && r.ctx().dst_arena.config().allow_fold
            {
                let values = r.ctx().dst_arena.node_list(values).to_vec();
                let old_vars = r.ctx().src_arena.node_list(vars).to_vec();
                if values.len() == old_vars.len() {
                    for (old_var, value) in old_vars.into_iter().zip(values) {
                        r.ctx().register_processed(old_var, value);
                    }
                    return rewrite_node(r, tail);
                }
            }
            let vars = rewrite_nodes(r, vars);
            let tail = rewrite_opt(r, tail);
            r.ctx().dst_arena.node(NodeData::Let {
                instruction,
                vars,
                tail,
            })
        }

        NodeData::Case { params, body } => {
            let params = rewrite_nodes(r, params);
            let body = rewrite_node(r, body);
            r.ctx().dst_arena.node(NodeData::Case { params, body })
        }

        NodeData::ParsedBlock {
            instructions,
            continuations_vars,
            continuations,
            terminator,
        } => {
            let instructions = rewrite_nodes(r, instructions);
            let continuations_vars = rewrite_nodes(r, continuations_vars);
            let continuations = rewrite_nodes(r, continuations);
            let terminator = rewrite_node(r, terminator);
            r.ctx().dst_arena.node(NodeData::ParsedBlock {
                instructions,
                continuations_vars,
                continuations,
                terminator,
            })
        }

        // everything else is a plain structural rebuild
        NodeData::IntType { width, signed } => {
            r.ctx().dst_arena.node(NodeData::IntType { width, signed })
        }
        NodeData::FloatType { width } => r.ctx().dst_arena.node(NodeData::FloatType { width }),
        NodeData::BoolType => r.ctx().dst_arena.node(NodeData::BoolType),
        NodeData::MaskType => r.ctx().dst_arena.node(NodeData::MaskType),
        NodeData::Unreachable => r.ctx().dst_arena.node(NodeData::Unreachable),
        NodeData::PackType { elem, width } => {
            let elem = rewrite_node(r, elem);
            r.ctx().dst_arena.node(NodeData::PackType { elem, width })
        }
        NodeData::RecordType { members, kind } => {
            let members = rewrite_nodes(r, members);
            r.ctx().dst_arena.node(NodeData::RecordType { members, kind })
        }
        NodeData::ArrayType { elem, size } => {
            let elem = rewrite_node(r, elem);
            let size = rewrite_opt(r, size);
            r.ctx().dst_arena.node(NodeData::ArrayType { elem, size })
        }
        NodeData::PtrType {
            addr_space,
            pointee,
        } => {
            let pointee = rewrite_node(r, pointee);
            r.ctx().dst_arena.node(NodeData::PtrType {
                addr_space,
                pointee,
            })
        }
        NodeData::FnType { params, returns } => {
            let params = rewrite_nodes(r, params);
            let returns = rewrite_nodes(r, returns);
            r.ctx().dst_arena.node(NodeData::FnType { params, returns })
        }
        NodeData::QualifiedType { uniform, inner } => {
            let inner = rewrite_node(r, inner);
            r.ctx()
                .dst_arena
                .node(NodeData::QualifiedType { uniform, inner })
        }
        NodeData::IntLit {
            width,
            signed,
            value,
        } => r.ctx().dst_arena.node(NodeData::IntLit {
            width,
            signed,
            value,
        }),
        NodeData::FloatLit { width, bits } => {
            r.ctx().dst_arena.node(NodeData::FloatLit { width, bits })
        }
        NodeData::BoolLit { value } => r.ctx().dst_arena.node(NodeData::BoolLit { value }),
        NodeData::StringLit { string } => {
            let string = rewrite_string(r, string);
            r.ctx().dst_arena.node(NodeData::StringLit { string })
        }
        NodeData::Composite { ty, contents } => {
            let ty = rewrite_node(r, ty);
            let contents = rewrite_nodes(r, contents);
            r.ctx().dst_arena.node(NodeData::Composite { ty, contents })
        }
        NodeData::Undef { ty } => {
            let ty = rewrite_node(r, ty);
            r.ctx().dst_arena.node(NodeData::Undef { ty })
        }
        NodeData::Unbound { name } => {
            let name = rewrite_string(r, name);
            r.ctx().dst_arena.node(NodeData::Unbound { name })
        }
        NodeData::FnAddr { function } => {
            let function = rewrite_node(r, function);
            r.ctx().dst_arena.node(NodeData::FnAddr { function })
        }
        NodeData::RefDecl { decl } => {
            let decl = rewrite_node(r, decl);
            r.ctx().dst_arena.node(NodeData::RefDecl { decl })
        }
        NodeData::PrimOp {
            op,
            type_args,
            operands,
        } => {
            let type_args = rewrite_nodes(r, type_args);
            let operands = rewrite_nodes(r, operands);
            r.ctx().dst_arena.node(NodeData::PrimOp {
                op,
                type_args,
                operands,
            })
        }
        NodeData::Call { callee, args } => {
            let callee = rewrite_node(r, callee);
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::Call { callee, args })
        }
        NodeData::If {
            yield_types,
            condition,
            then_case,
            else_case,
        } => {
            let yield_types = rewrite_nodes(r, yield_types);
            let condition = rewrite_node(r, condition);
            let then_case = rewrite_node(r, then_case);
            let else_case = rewrite_opt(r, else_case);
            r.ctx().dst_arena.node(NodeData::If {
                yield_types,
                condition,
                then_case,
                else_case,
            })
        }
        NodeData::Match {
            yield_types,
            inspect,
            literals,
            cases,
            default_case,
        } => {
            let yield_types = rewrite_nodes(r, yield_types);
            let inspect = rewrite_node(r, inspect);
            let literals = rewrite_nodes(r, literals);
            let cases = rewrite_nodes(r, cases);
            let default_case = rewrite_node(r, default_case);
            r.ctx().dst_arena.node(NodeData::Match {
                yield_types,
                inspect,
                literals,
                cases,
                default_case,
            })
        }
        NodeData::Loop {
            yield_types,
            initial_args,
            body,
        } => {
            let yield_types = rewrite_nodes(r, yield_types);
            let initial_args = rewrite_nodes(r, initial_args);
            let body = rewrite_node(r, body);
            r.ctx().dst_arena.node(NodeData::Loop {
                yield_types,
                initial_args,
                body,
            })
        }
        NodeData::Quote { values } => {
            let values = rewrite_nodes(r, values);
            r.ctx().dst_arena.node(NodeData::Quote { values })
        }
        NodeData::Return { values } => {
            let values = rewrite_nodes(r, values);
            r.ctx().dst_arena.node(NodeData::Return { values })
        }
        NodeData::Jump { target, args } => {
            let target = rewrite_node(r, target);
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::Jump { target, args })
        }
        NodeData::Branch {
            condition,
            true_target,
            false_target,
            args,
        } => {
            let condition = rewrite_node(r, condition);
            let true_target = rewrite_node(r, true_target);
            let false_target = rewrite_node(r, false_target);
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::Branch {
                condition,
                true_target,
                false_target,
                args,
            })
        }
        NodeData::Join { join_point, args } => {
            let join_point = rewrite_node(r, join_point);
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::Join { join_point, args })
        }
        NodeData::TailCall { callee, args } => {
            let callee = rewrite_node(r, callee);
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::TailCall { callee, args })
        }
        NodeData::MergeSelection { args } => {
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::MergeSelection { args })
        }
        NodeData::MergeContinue { args } => {
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::MergeContinue { args })
        }
        NodeData::MergeBreak { args } => {
            let args = rewrite_nodes(r, args);
            r.ctx().dst_arena.node(NodeData::MergeBreak { args })
        }
        NodeData::Annotation { name } => {
            let name = rewrite_string(r, name);
            r.ctx().dst_arena.node(NodeData::Annotation { name })
        }
        NodeData::AnnotationValue { name, value } => {
            let name = rewrite_string(r, name);
            let value = rewrite_node(r, value);
            r.ctx()
                .dst_arena
                .node(NodeData::AnnotationValue { name, value })
        }
        NodeData::AnnotationValues { name, values } => {
            let name = rewrite_string(r, name);
            let values = rewrite_nodes(r, values);
            r.ctx()
                .dst_arena
                .node(NodeData::AnnotationValues { name, values })
        }
        NodeData::Function { .. }
        | NodeData::Constant { .. }
        | NodeData::GlobalVariable { .. }
        | NodeData::NominalType { .. } => unreachable!("handled by the declaration guard"),
    }
}

/// Replace the placeholder terminator at the end of a builder-made spine
/// with the real tail. Lowering passes build their expansion against an
/// `Unreachable` placeholder (the builder holds the arena borrow while the
/// tail still needs the rewriter), then splice the rewritten tail in.
pub fn splice_spine_tail(
    arena: &mut IrArena,
    spine: NodeId,
    new_tail: NodeId,
) -> NodeId {
    match arena.data(spine).clone() {
        NodeData::Let {
            instruction,
            vars,
            tail: Some(tail),
        } => {
            let tail = splice_spine_tail(arena, tail, new_tail);
            arena.node(NodeData::Let {
                instruction,
                vars,
                tail: Some(tail),
            })
        }
        NodeData::Unreachable => new_tail,
        other => panic!("unexpected spine node {}", other.tag_name()),
    }
}

/// A pass that changes nothing: every node identity-rewritten into a fresh
/// arena. Useful on its own for arena-config transitions.
pub struct IdentityRewriter<'a> {
    pub rw: RewriteCtx<'a>,
}

impl<'a> Rewriter<'a> for IdentityRewriter<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }
}

/// Identity-rewrite a whole program into an arena with the given config.
pub fn rewrite_identity(src: &Program, dst_config: ArenaConfig) -> Program {
    let mut pass = IdentityRewriter {
        rw: RewriteCtx::new(src, dst_config),
    };
    rewrite_module(&mut pass);
    pass.rw.finish()
}
