//! bind_program: resolve textual references to node pointers
//!
//! Scope rules: root declarations are visible program-wide; function
//! parameters shadow in their body; let-bound variables shadow in their
//! tail; the continuations of a parsed block are stubbed first, so any
//! instruction in the block and any continuation body may reference any
//! sibling continuation.
//!
//! Scope-sensitive nodes are walked with direct recursion: the rewriter
//! memo would conflate two occurrences of the same interned `Unbound` node
//! that resolve differently in different scopes. Only scope-independent
//! nodes (types, literals, declarations) go through the memoized path.

use std::collections::HashSet;

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::{Module, Program};
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, recreate_decl_stub, recreate_node_identity, rewrite_module,
    rewrite_node, rewrite_opt, rewrite_string,
};

struct BindEntry {
    name: String,
    node: NodeId,
}

struct BindPass<'a> {
    rw: RewriteCtx<'a>,
    /// Root declarations, visible everywhere.
    roots: Vec<BindEntry>,
    /// The lexical scope stack: parameters, let outputs, continuations.
    locals: Vec<BindEntry>,
}

impl<'a> Rewriter<'a> for BindPass<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    /// Reached only from scope-independent positions (types, annotation
    /// payloads); local bindings are intentionally out of reach here.
    fn process(&mut self, node: NodeId) -> NodeId {
        match self.rw.src_arena.data(node) {
            NodeData::Unbound { name } => {
                let name = self.rw.src_arena.str(*name).to_owned();
                self.resolve_root(&name)
            }
            _ => recreate_node_identity(self, node),
        }
    }

    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        let stub = recreate_decl_stub(self, decl);
        let name = shade_ir::get_decl_name(self.rw.src_arena, decl).to_owned();
        self.roots.push(BindEntry { name, node: stub });
        stub
    }

    fn process_decl_body(&mut self, old: NodeId, new: NodeId) {
        let data = self.rw.src_arena.data(old).clone();
        match data {
            NodeData::Function { params, body, .. } => {
                let Some(body) = body else { return };
                let save = self.locals.len();
                self.push_param_bindings(params, new);
                let body = self.bind_node(body);
                self.rw.dst_arena.set_function_body(new, body);
                self.locals.truncate(save);
            }
            NodeData::Constant { value, .. } => {
                if let Some(value) = value {
                    let value = self.bind_value(value);
                    self.rw.dst_arena.set_constant_value(new, value);
                }
            }
            NodeData::GlobalVariable { .. } => {}
            NodeData::NominalType { body, .. } => {
                if let Some(body) = body {
                    let body = rewrite_node(self, body);
                    self.rw.dst_arena.set_nominal_type_body(new, body);
                }
            }
            other => panic!("not a declaration: {}", other.tag_name()),
        }
    }
}

impl<'a> BindPass<'a> {
    fn resolve(&self, name: &str) -> NodeId {
        for entry in self.locals.iter().rev() {
            if entry.name == name {
                return entry.node;
            }
        }
        self.resolve_root(name)
    }

    fn resolve_root(&self, name: &str) -> NodeId {
        for entry in self.roots.iter().rev() {
            if entry.name == name {
                return entry.node;
            }
        }
        panic!("could not resolve '{}'", name)
    }

    /// Bind the parameters of a source abstraction to the fresh parameters
    /// of its destination stub.
    fn push_param_bindings(&mut self, src_params: shade_ir::Nodes, dst_abs: NodeId) {
        let dst_params = shade_ir::get_abstraction_params(&self.rw.dst_arena, dst_abs);
        let src_params = self.rw.src_arena.node_list(src_params).to_vec();
        let dst_params = self.rw.dst_arena.node_list(dst_params).to_vec();
        assert_eq!(src_params.len(), dst_params.len());
        for (src, dst) in src_params.into_iter().zip(dst_params) {
            let NodeData::Variable { name, .. } = self.rw.src_arena.data(src) else {
                panic!("abstraction parameter is not a variable");
            };
            self.locals.push(BindEntry {
                name: self.rw.src_arena.str(*name).to_owned(),
                node: dst,
            });
        }
    }

    /// A fresh destination variable for a source binder, with its declared
    /// type bound. Pushes the scope entry.
    fn bind_binder(&mut self, src_var: NodeId) -> NodeId {
        let NodeData::Variable { name, ty, .. } = self.rw.src_arena.data(src_var).clone() else {
            panic!("binder is not a variable");
        };
        let ty = rewrite_opt(self, ty);
        let name = self.rw.src_arena.str(name).to_owned();
        let fresh = self.rw.dst_arena.fresh_var(ty, &name);
        self.locals.push(BindEntry { name, node: fresh });
        fresh
    }

    /// Resolve in value position: declarations become addressable values.
    fn bind_value(&mut self, node: NodeId) -> NodeId {
        let bound = self.bind_node(node);
        let is_code = matches!(
            self.rw.dst_arena.data(bound),
            NodeData::Function { .. } | NodeData::BasicBlock { .. }
        );
        if is_code {
            return self.rw.dst_arena.node(NodeData::FnAddr { function: bound });
        }
        let is_data_decl = matches!(
            self.rw.dst_arena.data(bound),
            NodeData::Constant { .. } | NodeData::GlobalVariable { .. }
        );
        if is_data_decl {
            return self.rw.dst_arena.node(NodeData::RefDecl { decl: bound });
        }
        bound
    }

    fn bind_values(&mut self, ns: shade_ir::Nodes) -> shade_ir::Nodes {
        let ids = self.rw.src_arena.node_list(ns).to_vec();
        let bound: Vec<_> = ids.into_iter().map(|n| self.bind_value(n)).collect();
        self.rw.dst_arena.intern_list(&bound)
    }

    /// Stub a continuation: rewritten signature, body patched later.
    fn stub_continuation(&mut self, cont: NodeId) -> NodeId {
        let NodeData::BasicBlock { name, params, .. } = self.rw.src_arena.data(cont).clone()
        else {
            panic!("continuation is not a basic block");
        };
        let src_params = self.rw.src_arena.node_list(params).to_vec();
        let mut fresh = Vec::with_capacity(src_params.len());
        for p in src_params {
            let NodeData::Variable { name, ty, .. } = self.rw.src_arena.data(p).clone() else {
                panic!("continuation parameter is not a variable");
            };
            let ty = rewrite_opt(self, ty);
            let name = self.rw.src_arena.str(name).to_owned();
            fresh.push(self.rw.dst_arena.fresh_var(ty, &name));
        }
        let name = rewrite_string(self, name);
        let params = self.rw.dst_arena.intern_list(&fresh);
        self.rw.dst_arena.node(NodeData::BasicBlock {
            name,
            params,
            body: None,
        })
    }

    fn bind_continuation_body(&mut self, src: NodeId, stub: NodeId) {
        let NodeData::BasicBlock { params, body, .. } = self.rw.src_arena.data(src).clone()
        else {
            panic!("continuation is not a basic block");
        };
        let Some(body) = body else { return };
        let save = self.locals.len();
        self.push_param_bindings(params, stub);
        let body = self.bind_node(body);
        self.rw.dst_arena.set_basic_block_body(stub, body);
        self.locals.truncate(save);
    }

    fn bind_node(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::Unbound { name } => {
                let name = self.rw.src_arena.str(name).to_owned();
                self.resolve(&name)
            }

            NodeData::Variable { .. } => {
                panic!("binders are handled at their binding sites")
            }

            NodeData::ParsedBlock {
                instructions,
                continuations_vars,
                continuations,
                terminator,
            } => {
                let save = self.locals.len();

                // stubs first, so everything in the block sees every
                // continuation
                let cont_vars = self.rw.src_arena.node_list(continuations_vars).to_vec();
                let conts = self.rw.src_arena.node_list(continuations).to_vec();
                assert_eq!(cont_vars.len(), conts.len());
                let mut stubs = Vec::with_capacity(conts.len());
                for (&var, &cont) in cont_vars.iter().zip(&conts) {
                    let stub = self.stub_continuation(cont);
                    let NodeData::Variable { name, .. } = self.rw.src_arena.data(var) else {
                        panic!("continuation binder is not a variable");
                    };
                    self.locals.push(BindEntry {
                        name: self.rw.src_arena.str(*name).to_owned(),
                        node: stub,
                    });
                    stubs.push(stub);
                }

                // the straight-line section becomes a let spine
                let instrs = self.rw.src_arena.node_list(instructions).to_vec();
                let mut bound = Vec::with_capacity(instrs.len());
                for l in instrs {
                    let NodeData::Let {
                        instruction,
                        vars,
                        tail: None,
                    } = self.rw.src_arena.data(l).clone()
                    else {
                        panic!("parsed block instructions must be tail-less lets");
                    };
                    let instruction = self.bind_node(instruction);
                    let src_vars = self.rw.src_arena.node_list(vars).to_vec();
                    let fresh: Vec<_> =
                        src_vars.into_iter().map(|v| self.bind_binder(v)).collect();
                    let vars = self.rw.dst_arena.intern_list(&fresh);
                    bound.push((instruction, vars));
                }

                let mut body = self.bind_node(terminator);
                for (instruction, vars) in bound.into_iter().rev() {
                    body = self.rw.dst_arena.node(NodeData::Let {
                        instruction,
                        vars,
                        tail: Some(body),
                    });
                }

                // now the continuation bodies, which may reference the
                // spine's variables and each other
                for (&cont, &stub) in conts.iter().zip(&stubs) {
                    self.bind_continuation_body(cont, stub);
                }

                self.locals.truncate(save);
                body
            }

            NodeData::Let {
                instruction,
                vars,
                tail,
            } => {
                let instruction = self.bind_node(instruction);
                let src_vars = self.rw.src_arena.node_list(vars).to_vec();
                let fresh: Vec<_> = src_vars.into_iter().map(|v| self.bind_binder(v)).collect();
                let vars = self.rw.dst_arena.intern_list(&fresh);
                let tail = tail.map(|t| self.bind_node(t));
                self.rw.dst_arena.node(NodeData::Let {
                    instruction,
                    vars,
                    tail,
                })
            }

            NodeData::Case { params, body } => {
                let save = self.locals.len();
                let src_params = self.rw.src_arena.node_list(params).to_vec();
                let fresh: Vec<_> = src_params
                    .into_iter()
                    .map(|v| self.bind_binder(v))
                    .collect();
                let params = self.rw.dst_arena.intern_list(&fresh);
                let body = self.bind_node(body);
                self.locals.truncate(save);
                self.rw.dst_arena.node(NodeData::Case { params, body })
            }

            NodeData::BasicBlock { .. } => {
                let stub = self.stub_continuation(node);
                self.bind_continuation_body(node, stub);
                stub
            }

            NodeData::PrimOp {
                op,
                type_args,
                operands,
            } => {
                let type_args = crate::rewrite::rewrite_nodes(self, type_args);
                let operands = self.bind_values(operands);
                self.rw.dst_arena.node(NodeData::PrimOp {
                    op,
                    type_args,
                    operands,
                })
            }
            NodeData::Call { callee, args } => {
                let callee = self.bind_value(callee);
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::Call { callee, args })
            }
            NodeData::If {
                yield_types,
                condition,
                then_case,
                else_case,
            } => {
                let yield_types = crate::rewrite::rewrite_nodes(self, yield_types);
                let condition = self.bind_value(condition);
                let then_case = self.bind_node(then_case);
                let else_case = else_case.map(|c| self.bind_node(c));
                self.rw.dst_arena.node(NodeData::If {
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
                let yield_types = crate::rewrite::rewrite_nodes(self, yield_types);
                let inspect = self.bind_value(inspect);
                let literals = self.bind_values(literals);
                let src_cases = self.rw.src_arena.node_list(cases).to_vec();
                let cases: Vec<_> = src_cases.into_iter().map(|c| self.bind_node(c)).collect();
                let cases = self.rw.dst_arena.intern_list(&cases);
                let default_case = self.bind_node(default_case);
                self.rw.dst_arena.node(NodeData::Match {
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
                let yield_types = crate::rewrite::rewrite_nodes(self, yield_types);
                let initial_args = self.bind_values(initial_args);
                let body = self.bind_node(body);
                self.rw.dst_arena.node(NodeData::Loop {
                    yield_types,
                    initial_args,
                    body,
                })
            }
            NodeData::Quote { values } => {
                let values = self.bind_values(values);
                self.rw.dst_arena.node(NodeData::Quote { values })
            }

            NodeData::Return { values } => {
                let values = self.bind_values(values);
                self.rw.dst_arena.node(NodeData::Return { values })
            }
            NodeData::Jump { target, args } => {
                let target = self.bind_node(target);
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::Jump { target, args })
            }
            NodeData::Branch {
                condition,
                true_target,
                false_target,
                args,
            } => {
                let condition = self.bind_value(condition);
                let true_target = self.bind_node(true_target);
                let false_target = self.bind_node(false_target);
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::Branch {
                    condition,
                    true_target,
                    false_target,
                    args,
                })
            }
            NodeData::Join { join_point, args } => {
                let join_point = self.bind_value(join_point);
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::Join { join_point, args })
            }
            NodeData::TailCall { callee, args } => {
                let callee = self.bind_value(callee);
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::TailCall { callee, args })
            }
            NodeData::MergeSelection { args } => {
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::MergeSelection { args })
            }
            NodeData::MergeContinue { args } => {
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::MergeContinue { args })
            }
            NodeData::MergeBreak { args } => {
                let args = self.bind_values(args);
                self.rw.dst_arena.node(NodeData::MergeBreak { args })
            }
            NodeData::Unreachable => self.rw.dst_arena.node(NodeData::Unreachable),

            NodeData::FnAddr { function } => {
                // resolves and re-wraps
                self.bind_value(function)
            }
            NodeData::Composite { ty, contents } => {
                let ty = rewrite_node(self, ty);
                let contents = self.bind_values(contents);
                self.rw.dst_arena.node(NodeData::Composite { ty, contents })
            }

            // scope-independent: types, literals, annotations
            _ => rewrite_node(self, node),
        }
    }
}

/// Prune declarations unreachable from the chosen entry point.
fn specialize(program: Program, entry_point: &str) -> PassResult {
    let Some(root) = program.module.find_declaration(&program.arena, entry_point) else {
        return Err(CompileError::Unsupported(format!(
            "specialization entry point '{}' is not declared",
            entry_point
        )));
    };
    let arena = program.arena;
    let mut reachable = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        stack.extend(arena.data(id).children(&arena));
    }
    let mut module = Module::new(program.module.name());
    for &decl in program.module.declarations() {
        if reachable.contains(&decl) {
            module.add_declaration(decl);
        }
    }
    Ok(Program { arena, module })
}

pub fn run(config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let mut pass = BindPass {
        rw: RewriteCtx::new(src, aconfig),
        roots: Vec::new(),
        locals: Vec::new(),
    };
    rewrite_module(&mut pass);
    let program = pass.rw.finish();
    match &config.specialization.entry_point {
        Some(entry) => specialize(program, entry),
        None => Ok(program),
    }
}
