//! opt_restructurize: re-form structured regions where safe
//!
//! The inverse of lower_cf_instrs for the easy shape: a branch whose two
//! targets are single-use blocks that both jump to the same single-entry
//! join becomes an If instruction again, with the join's body as the let
//! tail. Backends that require structured control flow get their diamonds
//! back; everything else is left alone.

use std::collections::{HashMap, HashSet};

use shade_ir::arena::{ArenaConfig, NodeId};
use shade_ir::module::Program;
use shade_ir::node::NodeData;

use crate::config::CompilerConfig;
use crate::passes::PassResult;
use crate::rewrite::{
    RewriteCtx, Rewriter, is_body_node, recreate_decl_stub, recreate_node_identity,
    rewrite_module, rewrite_node, rewrite_nodes, rewrite_string,
};

/// A branch eligible for re-structuring, with its join block.
#[derive(Clone, Copy)]
struct Diamond {
    join: NodeId,
}

/// The terminator a block body ends in, following the let spine.
fn spine_terminator(program: &Program, mut body: NodeId) -> NodeId {
    loop {
        match program.arena.data(body) {
            NodeData::Let {
                tail: Some(tail), ..
            } => body = *tail,
            _ => return body,
        }
    }
}

fn count_block_uses(program: &Program) -> HashMap<NodeId, usize> {
    let arena = &program.arena;
    let mut uses: HashMap<NodeId, usize> = HashMap::new();
    for id in arena.node_ids() {
        for child in arena.data(id).children(arena) {
            if matches!(arena.data(child), NodeData::BasicBlock { .. }) {
                *uses.entry(child).or_default() += 1;
            }
        }
    }
    uses
}

fn find_diamonds(program: &Program) -> (HashMap<NodeId, Diamond>, HashSet<NodeId>) {
    let arena = &program.arena;
    let uses = count_block_uses(program);
    let mut diamonds = HashMap::new();
    let mut touched_fns = HashSet::new();

    for &decl in program.module.declarations() {
        if !matches!(arena.data(decl), NodeData::Function { .. }) {
            continue;
        }
        let mut stack: Vec<NodeId> =
            shade_ir::get_abstraction_body(arena, decl).into_iter().collect();
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let NodeData::Branch {
                true_target,
                false_target,
                args,
                ..
            } = arena.data(id)
                && arena.node_list(*args).is_empty()
                && let Some(join) = diamond_join(program, &uses, *true_target, *false_target)
            {
                diamonds.insert(id, Diamond { join });
                touched_fns.insert(decl);
            }
            if !matches!(arena.data(id), NodeData::Function { .. }) || id == decl {
                stack.extend(arena.data(id).children(arena));
            }
        }
    }
    (diamonds, touched_fns)
}

fn diamond_join(
    program: &Program,
    uses: &HashMap<NodeId, usize>,
    a: NodeId,
    b: NodeId,
) -> Option<NodeId> {
    let arena = &program.arena;
    if a == b {
        return None;
    }
    let mut join = None;
    for side in [a, b] {
        let NodeData::BasicBlock { params, body, .. } = arena.data(side) else {
            return None;
        };
        if !arena.node_list(*params).is_empty() || uses.get(&side) != Some(&1) {
            return None;
        }
        let NodeData::Jump { target, .. } = arena.data(spine_terminator(program, (*body)?))
        else {
            return None;
        };
        match join {
            None => join = Some(*target),
            Some(j) if j == *target => {}
            _ => return None,
        }
    }
    let join = join?;
    // the join must have no entries besides the two sides
    if uses.get(&join) != Some(&2) {
        return None;
    }
    Some(join)
}

struct Restructure<'a> {
    rw: RewriteCtx<'a>,
    diamonds: HashMap<NodeId, Diamond>,
    touched_fns: HashSet<NodeId>,
    /// The source join of the diamond currently being rebuilt; jumps to it
    /// become selection merges.
    case_join: Option<NodeId>,
}

impl<'a> Restructure<'a> {
    /// A block body re-expressed as an If case: the jump to the join turns
    /// into a selection merge.
    fn rebuild_case(&mut self, block: NodeId, join: NodeId) -> NodeId {
        let body = shade_ir::get_abstraction_body(self.rw.src_arena, block)
            .expect("diamond side has a body");
        let saved = self.case_join.replace(join);
        let body = rewrite_node(self, body);
        self.case_join = saved;
        let params = self.rw.dst_arena.empty();
        self.rw.dst_arena.node(NodeData::Case { params, body })
    }
}

impl<'a> Rewriter<'a> for Restructure<'a> {
    fn ctx(&mut self) -> &mut RewriteCtx<'a> {
        &mut self.rw
    }

    fn should_memoize(&mut self, node: NodeId) -> bool {
        !is_body_node(self.rw.src_arena.data(node))
    }

    fn process(&mut self, node: NodeId) -> NodeId {
        let data = self.rw.src_arena.data(node).clone();
        match data {
            NodeData::Branch {
                condition,
                true_target,
                false_target,
                ..
            } if self.diamonds.contains_key(&node) => {
                let join = self.diamonds[&node].join;
                let condition = rewrite_node(self, condition);
                let then_case = self.rebuild_case(true_target, join);
                let else_case = self.rebuild_case(false_target, join);

                // the join's parameters become the let's variables, its
                // body the tail
                let join_params =
                    shade_ir::get_abstraction_params(self.rw.src_arena, join);
                let join_params = self.rw.src_arena.node_list(join_params).to_vec();
                let mut vars = Vec::with_capacity(join_params.len());
                let mut yield_types = Vec::with_capacity(join_params.len());
                for p in join_params {
                    let NodeData::Variable { name, ty, .. } =
                        self.rw.src_arena.data(p).clone()
                    else {
                        panic!("join parameter is not a variable");
                    };
                    let ty = ty.map(|t| rewrite_node(self, t));
                    let name = self.rw.src_arena.str(name).to_owned();
                    let var = self.rw.dst_arena.fresh_var(ty, &name);
                    self.rw.register_processed(p, var);
                    if let Some(ty) = ty {
                        yield_types.push(ty);
                    }
                    vars.push(var);
                }
                let yield_types = self.rw.dst_arena.intern_list(&yield_types);
                let vars = self.rw.dst_arena.intern_list(&vars);
                let instruction = self.rw.dst_arena.node(NodeData::If {
                    yield_types,
                    condition,
                    then_case,
                    else_case: Some(else_case),
                });
                let tail = shade_ir::get_abstraction_body(self.rw.src_arena, join)
                    .map(|b| rewrite_node(self, b));
                self.rw.dst_arena.node(NodeData::Let {
                    instruction,
                    vars,
                    tail,
                })
            }

            NodeData::Jump { target, args } if Some(target) == self.case_join => {
                let args = rewrite_nodes(self, args);
                self.rw.dst_arena.node(NodeData::MergeSelection { args })
            }

            _ => recreate_node_identity(self, node),
        }
    }

    fn process_decl_stub(&mut self, decl: NodeId) -> NodeId {
        if !self.touched_fns.contains(&decl) {
            return recreate_decl_stub(self, decl);
        }
        let NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            ..
        } = self.rw.src_arena.data(decl).clone()
        else {
            return recreate_decl_stub(self, decl);
        };
        let name = rewrite_string(self, name);
        let annotations = rewrite_nodes(self, annotations);
        let ann_name = self.rw.dst_arena.intern_string("Structured");
        let ann = self.rw.dst_arena.node(NodeData::Annotation { name: ann_name });
        let annotations = self.rw.dst_arena.append_nodes(annotations, ann);
        let params = rewrite_nodes(self, params);
        let return_types = rewrite_nodes(self, return_types);
        self.rw.dst_arena.node(NodeData::Function {
            name,
            annotations,
            params,
            return_types,
            body: None,
        })
    }
}

pub fn run(_config: &CompilerConfig, src: &Program, aconfig: ArenaConfig) -> PassResult {
    let (diamonds, touched_fns) = find_diamonds(src);
    let mut pass = Restructure {
        rw: RewriteCtx::new(src, aconfig),
        diamonds,
        touched_fns,
        case_join: None,
    };
    rewrite_module(&mut pass);
    Ok(pass.rw.finish())
}
