//! lower_tailcalls: compile tail calls to a scheduler trampoline
//!
//! Every function that participates in scheduling (everything not marked
//! `Leaf`) gets a numeric id and its body becomes a basic block of a single
//! host function. The host runs a per-subgroup dispatch loop: read the
//! next-continuation slot, compare against the known ids, and jump to the
//! matching block. A tail call pushes its arguments, writes the callee's id
//! into the slot and jumps back to the loop; id 0 exits. Function addresses
//! are now plain 32-bit ids, so function-typed values shrink to integers.
//!
//! Leaf functions are carried over untouched; direct calls to them remain
//! native.

use std::collections::HashMap;

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};
use shade_ir::types::get_unqualified_type;

use crate::config::CompilerConfig;
use crate::internal_constants::NEXT_FN_NAME;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_decl_body, recreate_decl_stub,
    recreate_node_identity, rewrite_node, rewrite_nodes,
};

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Rewriting a scheduled body into the host: returns exit the
    /// scheduler, tail calls go through the slot.
    Host,
    /// Copying a leaf function: everything stays native.
    Leaf,
}

struct LowerTailcalls<'a> {
    rw: RewriteCtx<'a>,
    /// source scheduled function -> scheduler id
    ids: HashMap<NodeId, u32>,
    next_fn: NodeId,
    loop_bb: NodeId,
    mode: Mode,
}

impl<'a> LowerTailcalls<'a> {
    fn store_next(&mut self, id_value: NodeId) -> NodeId {
        let arena = &mut self.rw.dst_arena;
        let slot = arena.node(NodeData::RefDecl { decl: self.next_fn });
        let ta = arena.empty();
        let operands = arena.intern_list(&[slot, id_value]);
        arena.prim_op(Op::Store, ta, operands)
    }

    /// `store next_fn <- id; jump dispatch_loop`
    fn schedule_and_jump(&mut self, id_value: NodeId) -> NodeId {
        let store = self.store_next(id_value);
        let arena = &mut self.rw.dst_arena;
        let no_vars = arena.empty();
        let no_args = arena.empty();
        let jump = arena.node(NodeData::Jump {
            target: self.loop_bb,
            args: no_args,
        });
        arena.node(NodeData::Let {
            instruction: store,
            vars: no_vars,
            tail: Some(jump),
        })
    }
}

impl<'a> Rewriter<'a> for LowerTailcalls<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            // function-typed values are scheduler ids now
            NodeData::FnType { .. } => self.rw.dst_arena.uint32_type(),

            NodeData::FnAddr { function } if self.ids.contains_key(&function) => {
                let id = self.ids[&function];
                self.rw.dst_arena.uint32_literal(id)
            }

            NodeData::TailCall { callee, args } if self.mode == Mode::Host => {
                // arguments travel on the per-thread stack
                let args = rewrite_nodes(self, args);
                let arg_ids = self.rw.dst_arena.node_list(args).to_vec();
                let mut pushes = Vec::with_capacity(arg_ids.len());
                for arg in arg_ids {
                    let ty = shade_ir::value_type(&self.rw.dst_arena, arg);
                    let data_ty = get_unqualified_type(&self.rw.dst_arena, ty);
                    let arena = &mut self.rw.dst_arena;
                    let ta = arena.singleton(data_ty);
                    let operands = arena.singleton(arg);
                    pushes.push(arena.prim_op(Op::PushStack, ta, operands));
                }
                let id_value = rewrite_node(self, callee);
                let mut out = self.schedule_and_jump(id_value);
                for push in pushes.into_iter().rev() {
                    let vars = self.rw.dst_arena.empty();
                    out = self.rw.dst_arena.node(NodeData::Let {
                        instruction: push,
                        vars,
                        tail: Some(out),
                    });
                }
                out
            }

            NodeData::Return { values } if self.mode == Mode::Host => {
                if !self.rw.src_arena.node_list(values).is_empty() {
                    return recreate_node_identity(self, node);
                }
                // the kernel is done: schedule id 0
                let zero = self.rw.dst_arena.uint32_literal(0);
                self.schedule_and_jump(zero)
            }

            _ => recreate_node_identity(self, node),
        }
    }
}

/// Pops for a scheduled function's parameters, registered as the rewrites
/// of the source parameters. Returns the lets to wrap around the body,
/// outermost first.
fn pop_params(pass: &mut LowerTailcalls<'_>, src_params: &[NodeId]) -> Vec<(NodeId, NodeId)> {
    let mut pops = Vec::with_capacity(src_params.len());
    // arguments were pushed left to right, so they pop in reverse
    for &param in src_params.iter().rev() {
        let NodeData::Variable { name, ty, .. } = pass.rw.src_arena.data(param).clone() else {
            panic!("function parameter is not a variable");
        };
        let ty = ty.expect("parameters are typed by now");
        let ty = rewrite_node(pass, ty);
        let data_ty = get_unqualified_type(&pass.rw.dst_arena, ty);
        let name = pass.rw.src_arena.str(name).to_owned();
        let arena = &mut pass.rw.dst_arena;
        let ta = arena.singleton(data_ty);
        let no_operands = arena.empty();
        let pop = arena.prim_op(Op::PopStack, ta, no_operands);
        let pop_ty = arena.node_type(pop);
        let var = arena.fresh_var(pop_ty, &name);
        pass.rw.register_processed(param, var);
        pops.push((pop, var));
    }
    pops
}

fn wrap_lets(pass: &mut LowerTailcalls<'_>, pops: Vec<(NodeId, NodeId)>, body: NodeId) -> NodeId {
    let mut out = body;
    for (pop, var) in pops.into_iter().rev() {
        let vars = pass.rw.dst_arena.singleton(var);
        out = pass.rw.dst_arena.node(NodeData::Let {
            instruction: pop,
            vars,
            tail: Some(out),
        });
    }
    out
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let src_arena = &src.arena;

    // classify: leaves stay functions, everything else gets an id
    let mut scheduled: Vec<NodeId> = Vec::new();
    let mut entry: Option<NodeId> = None;
    for &decl in src.module.declarations() {
        if !matches!(src_arena.data(decl), NodeData::Function { .. }) {
            continue;
        }
        if shade_ir::lookup_annotation(src_arena, decl, "Leaf").is_some() {
            continue;
        }
        scheduled.push(decl);
        if entry.is_none() && shade_ir::lookup_annotation(src_arena, decl, "EntryPoint").is_some()
        {
            entry = Some(decl);
        }
    }
    let ids: HashMap<NodeId, u32> = scheduled
        .iter()
        .enumerate()
        .map(|(i, &f)| (f, i as u32 + 1))
        .collect();

    let mut rw = RewriteCtx::new(src, aconfig);

    // the next-continuation slot: reuse the injected one when present
    let next_fn = {
        let arena = &mut rw.dst_arena;
        let name = arena.intern_string(NEXT_FN_NAME);
        let internal_name = arena.intern_string("Internal");
        let internal = arena.node(NodeData::Annotation {
            name: internal_name,
        });
        let annotations = arena.singleton(internal);
        let ty = arena.uint32_type();
        arena.node(NodeData::GlobalVariable {
            name,
            annotations,
            ty,
            addr_space: shade_ir::AddressSpace::Private,
            init: None,
        })
    };
    if let Some(injected) = src.module.find_declaration(src_arena, NEXT_FN_NAME) {
        rw.register_processed(injected, next_fn);
    }
    rw.dst_module.add_declaration(next_fn);

    let loop_bb = {
        let arena = &mut rw.dst_arena;
        let name = arena.intern_string("dispatch_loop");
        let params = arena.empty();
        arena.node(NodeData::BasicBlock {
            name,
            params,
            body: None,
        })
    };

    let mut pass = LowerTailcalls {
        rw,
        ids,
        next_fn,
        loop_bb,
        mode: Mode::Host,
    };

    // non-function declarations and leaf functions copy over
    let decls = src.module.declarations().to_vec();
    for &decl in &decls {
        if pass.ids.contains_key(&decl) || Some(decl) == entry {
            continue;
        }
        if pass.rw.find_processed(decl).is_some() {
            continue;
        }
        pass.mode = Mode::Leaf;
        let stub = pass.process_decl_stub(decl);
        pass.rw.register_processed(decl, stub);
        pass.rw.dst_module.add_declaration(stub);
    }
    for &decl in &decls {
        if pass.ids.contains_key(&decl) {
            continue;
        }
        if let Some(stub) = pass.rw.find_processed(decl) {
            pass.mode = Mode::Leaf;
            recreate_decl_body(&mut pass, decl, stub);
        }
    }

    // the host: the entry point if there is one, a bare scheduler shell
    // otherwise
    let host = match entry {
        Some(e) => {
            let stub = recreate_decl_stub(&mut pass, e);
            pass.rw.register_processed(e, stub);
            stub
        }
        None => {
            let arena = &mut pass.rw.dst_arena;
            let name = arena.intern_string("scheduler");
            let internal_name = arena.intern_string("Internal");
            let internal = arena.node(NodeData::Annotation {
                name: internal_name,
            });
            let annotations = arena.singleton(internal);
            let params = arena.empty();
            let return_types = arena.empty();
            arena.node(NodeData::Function {
                name,
                annotations,
                params,
                return_types,
                body: None,
            })
        }
    };
    pass.rw.dst_module.add_declaration(host);

    // one block per scheduled function
    pass.mode = Mode::Host;
    let mut blocks: Vec<NodeId> = Vec::with_capacity(scheduled.len());
    for &f in &scheduled {
        let fn_name = shade_ir::get_decl_name(pass.rw.src_arena, f).to_owned();
        let arena = &mut pass.rw.dst_arena;
        let name = arena.intern_string(&fn_name);
        let params = arena.empty();
        blocks.push(arena.node(NodeData::BasicBlock {
            name,
            params,
            body: None,
        }));
    }
    for (&f, &bb) in scheduled.iter().zip(&blocks) {
        let src_params = shade_ir::get_abstraction_params(pass.rw.src_arena, f);
        let src_params = pass.rw.src_arena.node_list(src_params).to_vec();
        let body = shade_ir::get_abstraction_body(pass.rw.src_arena, f)
            .expect("scheduled function has a body");
        let full = if Some(f) == entry {
            // the entry block reads the host's own parameters directly
            rewrite_node(&mut pass, body)
        } else {
            let pops = pop_params(&mut pass, &src_params);
            let body = rewrite_node(&mut pass, body);
            wrap_lets(&mut pass, pops, body)
        };
        pass.rw.dst_arena.set_basic_block_body(bb, full);
    }

    // the dispatch chain: cur == 0 exits, cur == id jumps to the block
    let exit_bb = {
        let arena = &mut pass.rw.dst_arena;
        let name = arena.intern_string("dispatch_exit");
        let params = arena.empty();
        let values = arena.empty();
        let ret = arena.node(NodeData::Return { values });
        arena.node(NodeData::BasicBlock {
            name,
            params,
            body: Some(ret),
        })
    };
    let invalid_bb = {
        let arena = &mut pass.rw.dst_arena;
        let name = arena.intern_string("dispatch_invalid");
        let params = arena.empty();
        let body = arena.node(NodeData::Unreachable);
        arena.node(NodeData::BasicBlock {
            name,
            params,
            body: Some(body),
        })
    };

    let arena = &mut pass.rw.dst_arena;
    let slot = arena.node(NodeData::RefDecl { decl: next_fn });
    let ta = arena.empty();
    let operands = arena.singleton(slot);
    let load_cur = arena.prim_op(Op::Load, ta, operands);
    let cur_ty = arena.node_type(load_cur);
    let cur = arena.fresh_var(cur_ty, "next");
    let cur_vars = arena.singleton(cur);

    // innermost comparison first
    let mut next_target = invalid_bb;
    for (&f, &bb) in scheduled.iter().zip(&blocks).rev() {
        let id = pass.ids[&f];
        let arena = &mut pass.rw.dst_arena;
        let lit = arena.uint32_literal(id);
        let ta = arena.empty();
        let operands = arena.intern_list(&[cur, lit]);
        let test = arena.prim_op(Op::Eq, ta, operands);
        let test_ty = arena.node_type(test);
        let cond = arena.fresh_var(test_ty, "is_next");
        let cond_vars = arena.singleton(cond);
        let no_args = arena.empty();
        let branch = arena.node(NodeData::Branch {
            condition: cond,
            true_target: bb,
            false_target: next_target,
            args: no_args,
        });
        let body = arena.node(NodeData::Let {
            instruction: test,
            vars: cond_vars,
            tail: Some(branch),
        });
        let name = arena.unique_name("dispatch_test");
        let params = arena.empty();
        next_target = arena.node(NodeData::BasicBlock {
            name,
            params,
            body: Some(body),
        });
    }

    // loop header: load the slot, exit on 0, otherwise run the chain
    let arena = &mut pass.rw.dst_arena;
    let zero = arena.uint32_literal(0);
    let ta = arena.empty();
    let operands = arena.intern_list(&[cur, zero]);
    let is_done = arena.prim_op(Op::Eq, ta, operands);
    let done_ty = arena.node_type(is_done);
    let done = arena.fresh_var(done_ty, "done");
    let done_vars = arena.singleton(done);
    let no_args = arena.empty();
    let exit_branch = arena.node(NodeData::Branch {
        condition: done,
        true_target: exit_bb,
        false_target: next_target,
        args: no_args,
    });
    let exit_test = arena.node(NodeData::Let {
        instruction: is_done,
        vars: done_vars,
        tail: Some(exit_branch),
    });
    let loop_body = arena.node(NodeData::Let {
        instruction: load_cur,
        vars: cur_vars,
        tail: Some(exit_test),
    });
    arena.set_basic_block_body(loop_bb, loop_body);

    // host body: run the entry block if there is one, otherwise exit
    // immediately
    let host_body = match entry {
        Some(e) => {
            let bb = blocks[scheduled.iter().position(|&f| f == e).unwrap()];
            let arena = &mut pass.rw.dst_arena;
            let no_args = arena.empty();
            arena.node(NodeData::Jump {
                target: bb,
                args: no_args,
            })
        }
        None => {
            let zero = pass.rw.dst_arena.uint32_literal(0);
            pass.schedule_and_jump(zero)
        }
    };
    pass.rw.dst_arena.set_function_body(host, host_body);

    Ok(pass.rw.finish())
}
