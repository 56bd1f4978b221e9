//! lower_continuations: realize first-class continuations
//!
//! A basic block whose address is taken escapes its function, so it is
//! lifted into a top-level function. Everything it captures from the
//! enclosing scope is spilled: the capture site pushes the free values on
//! the per-thread stack, and the lifted body starts by popping them back.
//! Joins of continuation values become tail calls.

use std::collections::{HashMap, HashSet};

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::{NodeData, Op};
use shade_ir::types::get_unqualified_type;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_node_identity, rewrite_module, rewrite_node,
    rewrite_nodes,
};

/// Basic blocks whose address is taken anywhere in the module.
fn find_captured_blocks(src: &Program) -> HashSet<NodeId> {
    let arena = &src.arena;
    let mut captured = HashSet::new();
    for id in arena.node_ids() {
        if let NodeData::FnAddr { function } = arena.data(id)
            && matches!(arena.data(*function), NodeData::BasicBlock { .. })
        {
            captured.insert(*function);
        }
    }
    captured
}

/// The variables a block's reachable body consumes but does not bind, in
/// first-encounter order of a deterministic walk.
fn free_variables(arena: &shade_ir::IrArena, bb: NodeId) -> Vec<NodeId> {
    let mut bound: HashSet<NodeId> = HashSet::new();
    let mut order: Vec<NodeId> = Vec::new();
    let mut free_set: HashSet<NodeId> = HashSet::new();
    let mut seen = HashSet::new();

    // two-phase walk: first collect everything bound in the subgraph,
    // then collect uses outside that set
    let mut stack = vec![bb];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        match arena.data(id) {
            NodeData::Let { vars, .. } => bound.extend(arena.node_list(*vars)),
            NodeData::Case { params, .. } | NodeData::BasicBlock { params, .. } => {
                bound.extend(arena.node_list(*params))
            }
            NodeData::Function { .. } if id != bb => continue,
            _ => {}
        }
        stack.extend(arena.data(id).children(arena));
    }

    seen.clear();
    let mut walk = vec![bb];
    while let Some(id) = walk.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let NodeData::Variable { .. } = arena.data(id)
            && !bound.contains(&id)
            && free_set.insert(id)
        {
            order.push(id);
        }
        if !matches!(arena.data(id), NodeData::Function { .. }) || id == bb {
            let mut children = arena.data(id).children(arena);
            // pop order must be deterministic: visit children left to right
            children.reverse();
            walk.extend(children);
        }
    }
    order
}

struct LowerContinuations<'a> {
    rw: RewriteCtx<'a>,
    captured: HashSet<NodeId>,
    /// source captured block -> (lifted function, source free variables)
    lifted: HashMap<NodeId, (NodeId, Vec<NodeId>)>,
    /// While lifting, free variables resolve to the popped replacements
    /// and reachable blocks duplicate instead of being shared with the
    /// original function.
    lift_free_map: HashMap<NodeId, NodeId>,
    lift_bb_memo: HashMap<NodeId, NodeId>,
    lifting: bool,
}

impl<'a> Rewriter<'a> for LowerContinuations<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        let data = self.rw.src_arena.data(node);
        if self.lifting && matches!(data, NodeData::BasicBlock { .. }) {
            return false;
        }
        !is_body_node(data)
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::Variable { .. } if self.lifting => {
                if let Some(&mapped) = self.lift_free_map.get(&node) {
                    return mapped;
                }
                recreate_node_identity(self, node)
            }

            NodeData::BasicBlock { .. } if self.lifting => {
                if let Some(&copy) = self.lift_bb_memo.get(&node) {
                    return copy;
                }
                let NodeData::BasicBlock { name, params, body } =
                    self.rw.src_arena.data(node).clone()
                else {
                    unreachable!()
                };
                let name = crate::rewrite::rewrite_string(self, name);
                let params = rewrite_nodes(self, params);
                let stub = self.rw.dst_arena.node(NodeData::BasicBlock {
                    name,
                    params,
                    body: None,
                });
                self.lift_bb_memo.insert(node, stub);
                if let Some(body) = body {
                    let body = rewrite_node(self, body);
                    self.rw.dst_arena.set_basic_block_body(stub, body);
                }
                stub
            }

            NodeData::FnAddr { function }
                if self.captured.contains(&function) && !self.lifting =>
            {
                let lifted = self.lift_block(function);
                self.rw.dst_arena.node(NodeData::FnAddr { function: lifted })
            }

            // a capture site: spill the continuation's captures before the
            // instruction that takes its address
            NodeData::Let { instruction, .. }
                if !self.lifting && self.instruction_captures(instruction) =>
            {
                let captured: Vec<NodeId> = self.captures_of(instruction);
                let mut pushes: Vec<NodeId> = Vec::new();
                for bb in captured {
                    let (_, frees) = self.lift_entry(bb);
                    for free in frees {
                        let value = rewrite_node(self, free);
                        let ty = shade_ir::value_type(&self.rw.dst_arena, value);
                        let data_ty = get_unqualified_type(&self.rw.dst_arena, ty);
                        let arena = &mut self.rw.dst_arena;
                        let ta = arena.singleton(data_ty);
                        let operands = arena.singleton(value);
                        pushes.push(arena.prim_op(Op::PushStack, ta, operands));
                    }
                }
                let rebuilt = recreate_node_identity(self, node);
                let mut out = rebuilt;
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

            NodeData::Join { join_point, args } => {
                let callee = rewrite_node(self, join_point);
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::TailCall { callee, args })
            }

            _ => recreate_node_identity(self, node),
        }
    }
}

impl<'a> LowerContinuations<'a> {
    fn instruction_captures(&self, instruction: NodeId) -> bool {
        !self.captures_of(instruction).is_empty()
    }

    /// Captured blocks referenced directly by an instruction's operands.
    fn captures_of(&self, instruction: NodeId) -> Vec<NodeId> {
        let arena = self.rw.src_arena;
        let mut out = Vec::new();
        for child in arena.data(instruction).children(arena) {
            if let NodeData::FnAddr { function } = arena.data(child)
                && self.captured.contains(function)
            {
                out.push(*function);
            }
        }
        out
    }

    fn lift_entry(&mut self, bb: NodeId) -> (NodeId, Vec<NodeId>) {
        if let Some(entry) = self.lifted.get(&bb) {
            return entry.clone();
        }
        let f = self.lift_block(bb);
        (f, self.lifted[&bb].1.clone())
    }

    /// Build the lifted function for a captured block: fresh parameters,
    /// pops for the captures, then a duplicate of the block's body.
    fn lift_block(&mut self, bb: NodeId) -> NodeId {
        if let Some((f, _)) = self.lifted.get(&bb) {
            return *f;
        }
        let frees = free_variables(self.rw.src_arena, bb);

        let NodeData::BasicBlock { name, params, body } = self.rw.src_arena.data(bb).clone()
        else {
            panic!("captured continuation is not a basic block");
        };

        let was_lifting = self.lifting;
        self.lifting = true;
        let saved_free_map = std::mem::take(&mut self.lift_free_map);
        let saved_bb_memo = std::mem::take(&mut self.lift_bb_memo);

        // fresh parameters
        let src_params = self.rw.src_arena.node_list(params).to_vec();
        let mut new_params = Vec::with_capacity(src_params.len());
        for p in src_params {
            let NodeData::Variable { name, ty, .. } = self.rw.src_arena.data(p).clone() else {
                panic!("block parameter is not a variable");
            };
            let ty = ty.map(|t| rewrite_node(self, t));
            let name = self.rw.src_arena.str(name).to_owned();
            let var = self.rw.dst_arena.fresh_var(ty, &name);
            self.lift_free_map.insert(p, var);
            new_params.push(var);
        }

        // pops for the captures, reverse of the push order
        let mut pops: Vec<(NodeId, NodeId)> = Vec::new();
        for &free in frees.iter().rev() {
            let src_ty = self
                .rw
                .src_arena
                .node_type(free)
                .expect("free variable has a type");
            let ty = rewrite_node(self, src_ty);
            let data_ty = get_unqualified_type(&self.rw.dst_arena, ty);
            let arena = &mut self.rw.dst_arena;
            let ta = arena.singleton(data_ty);
            let no_operands = arena.empty();
            let pop = arena.prim_op(Op::PopStack, ta, no_operands);
            let pop_ty = arena.node_type(pop);
            let name = self.rw.src_arena.str(var_name(self.rw.src_arena, free)).to_owned();
            let var = self.rw.dst_arena.fresh_var(pop_ty, &name);
            self.lift_free_map.insert(free, var);
            pops.push((pop, var));
        }

        let body = body.expect("captured continuation has a body");
        let mut full = rewrite_node(self, body);
        for (pop, var) in pops.into_iter().rev() {
            let vars = self.rw.dst_arena.singleton(var);
            full = self.rw.dst_arena.node(NodeData::Let {
                instruction: pop,
                vars,
                tail: Some(full),
            });
        }

        self.lift_free_map = saved_free_map;
        self.lift_bb_memo = saved_bb_memo;
        self.lifting = was_lifting;

        // the function itself
        let fn_name = self.rw.src_arena.str(name).to_owned();
        let arena = &mut self.rw.dst_arena;
        let fn_name = arena.unique_name(&fn_name);
        let internal_name = arena.intern_string("Internal");
        let internal = arena.node(NodeData::Annotation {
            name: internal_name,
        });
        let annotations = arena.singleton(internal);
        let params = arena.intern_list(&new_params);
        let return_types = arena.empty();
        let lifted = arena.node(NodeData::Function {
            name: fn_name,
            annotations,
            params,
            return_types,
            body: Some(full),
        });
        self.rw.dst_module.add_declaration(lifted);
        self.lifted.insert(bb, (lifted, frees));
        lifted
    }
}

fn var_name(arena: &shade_ir::IrArena, var: NodeId) -> shade_ir::StringId {
    match arena.data(var) {
        NodeData::Variable { name, .. } => *name,
        other => panic!("expected a variable, found {}", other.tag_name()),
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let captured = find_captured_blocks(src);
    let mut pass = LowerContinuations {
        rw: RewriteCtx::new(src, aconfig),
        captured,
        lifted: HashMap::new(),
        lift_free_map: HashMap::new(),
        lift_bb_memo: HashMap::new(),
        lifting: false,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
