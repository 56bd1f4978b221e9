//! Imperative synthesis of straight-line code
//!
//! A [`BodyBuilder`] accumulates instructions and chains them into a let
//! spine when finished, so passes never hand-nest lets. The `gen_*` helpers
//! cover the recurring spill/load/store shapes of the lowerings.

use crate::arena::{IrArena, NodeId, Nodes};
use crate::node::{NodeData, Op};
use crate::types::unpack_yield_types;

struct BoundInstruction {
    vars: Nodes,
    instruction: NodeId,
}

pub struct BodyBuilder<'a> {
    arena: &'a mut IrArena,
    pending: Vec<BoundInstruction>,
}

impl<'a> BodyBuilder<'a> {
    pub fn begin(arena: &'a mut IrArena) -> Self {
        BodyBuilder {
            arena,
            pending: Vec::new(),
        }
    }

    pub fn arena(&mut self) -> &mut IrArena {
        self.arena
    }

    /// Append an instruction, returning fresh variables bound to its
    /// yields. Requires a typed arena so the yield count is known; in an
    /// untyped arena use [`BodyBuilder::bind_instruction_extra`].
    ///
    /// Quotes short-circuit: their values are returned directly and no let
    /// is recorded.
    pub fn bind_instruction(&mut self, instruction: NodeId) -> Nodes {
        if let NodeData::Quote { values } = self.arena.data(instruction) {
            return *values;
        }
        let ty = self
            .arena
            .node_type(instruction)
            .expect("bind_instruction requires a typed arena");
        let yields = unpack_yield_types(self.arena, ty);
        let mut vars = Vec::with_capacity(yields.len());
        for ty in yields {
            vars.push(self.arena.fresh_var(Some(ty), "v"));
        }
        let vars = self.arena.intern_list(&vars);
        self.pending.push(BoundInstruction { vars, instruction });
        vars
    }

    /// Like [`BodyBuilder::bind_instruction`], with the yield types given
    /// explicitly. The only way to bind in an untyped arena.
    pub fn bind_instruction_extra(
        &mut self,
        instruction: NodeId,
        provided_types: &[Option<NodeId>],
        output_names: &[&str],
    ) -> Nodes {
        assert_eq!(provided_types.len(), output_names.len());
        let mut vars = Vec::with_capacity(provided_types.len());
        for (ty, name) in provided_types.iter().zip(output_names) {
            vars.push(self.arena.fresh_var(*ty, name));
        }
        let vars = self.arena.intern_list(&vars);
        self.pending.push(BoundInstruction { vars, instruction });
        vars
    }

    /// Chain the pending instructions onto `terminator` as a let spine.
    pub fn finish_body(self, terminator: NodeId) -> NodeId {
        let BodyBuilder { arena, pending } = self;
        let mut body = terminator;
        for bound in pending.into_iter().rev() {
            body = arena.node(NodeData::Let {
                instruction: bound.instruction,
                vars: bound.vars,
                tail: Some(body),
            });
        }
        body
    }

    /// Discard everything bound so far.
    pub fn cancel_body(self) {}

    // ---- generation helpers ----

    pub fn gen_primop(&mut self, op: Op, type_args: Nodes, operands: Nodes) -> Nodes {
        let instruction = self.arena.prim_op(op, type_args, operands);
        self.bind_instruction(instruction)
    }

    /// A primop with exactly one yield; returns the bound value.
    pub fn gen1(&mut self, op: Op, type_args: &[NodeId], operands: &[NodeId]) -> NodeId {
        let type_args = self.arena.intern_list(type_args);
        let operands = self.arena.intern_list(operands);
        let outputs = self.gen_primop(op, type_args, operands);
        crate::arena::first(self.arena, outputs)
    }

    /// A primop yielding nothing.
    pub fn gen0(&mut self, op: Op, type_args: &[NodeId], operands: &[NodeId]) {
        let type_args = self.arena.intern_list(type_args);
        let operands = self.arena.intern_list(operands);
        let instruction = self.arena.prim_op(op, type_args, operands);
        if !matches!(self.arena.data(instruction), NodeData::Quote { .. }) {
            let vars = self.arena.empty();
            self.pending.push(BoundInstruction { vars, instruction });
        }
    }

    pub fn gen_load(&mut self, ptr: NodeId) -> NodeId {
        self.gen1(Op::Load, &[], &[ptr])
    }

    pub fn gen_store(&mut self, ptr: NodeId, value: NodeId) {
        self.gen0(Op::Store, &[], &[ptr, value]);
    }

    pub fn gen_lea(&mut self, base: NodeId, offset: NodeId, indices: &[NodeId]) -> NodeId {
        let mut operands = vec![base, offset];
        operands.extend_from_slice(indices);
        self.gen1(Op::Lea, &[], &operands)
    }

    pub fn gen_reinterpret_cast(&mut self, target: NodeId, value: NodeId) -> NodeId {
        self.gen1(Op::Reinterpret, &[target], &[value])
    }

    pub fn gen_convert(&mut self, target: NodeId, value: NodeId) -> NodeId {
        self.gen1(Op::Convert, &[target], &[value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;

    fn typed_arena() -> IrArena {
        IrArena::new(ArenaConfig {
            name_bound: true,
            check_types: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_finish_body_chains_lets() {
        let mut a = typed_arena();
        let int32 = a.int32_type();
        let vt = a.qualified_type(false, int32);
        let x = a.fresh_var(Some(vt), "x");

        let mut bb = BodyBuilder::begin(&mut a);
        let one = bb.arena().int32_literal(1);
        let sum = bb.gen1(Op::Add, &[], &[x, one]);
        let doubled = bb.gen1(Op::Add, &[], &[sum, sum]);
        let values = bb.arena().singleton(doubled);
        let ret = bb.arena().node(NodeData::Return { values });
        let body = bb.finish_body(ret);

        // two lets, spine-shaped
        let NodeData::Let { tail: Some(t1), .. } = a.data(body) else {
            panic!("expected let")
        };
        let NodeData::Let { tail: Some(t2), .. } = a.data(*t1) else {
            panic!("expected inner let")
        };
        assert!(matches!(a.data(*t2), NodeData::Return { .. }));
    }

    #[test]
    fn test_quote_shortcuts_binding() {
        let mut a = typed_arena();
        let five = a.int32_literal(5);
        let quoted = a.quote_single(five);
        let mut bb = BodyBuilder::begin(&mut a);
        let out = bb.bind_instruction(quoted);
        let values = a.node_list(out).to_vec();
        assert_eq!(values, vec![five]);
    }

    #[test]
    fn test_bind_extra_in_untyped_arena() {
        let mut a = IrArena::new(ArenaConfig::default());
        let ta = a.empty();
        let ops = a.empty();
        let instr = a.prim_op(Op::GetStackPointer, ta, ops);
        let mut bb = BodyBuilder::begin(&mut a);
        let out = bb.bind_instruction_extra(instr, &[None], &["sp"]);
        assert_eq!(a.node_list(out).len(), 1);
        let values = a.empty();
        let ret = a.node(NodeData::Return { values });
        let mut bb = BodyBuilder::begin(&mut a);
        let _ = bb.bind_instruction_extra(instr, &[None], &["sp"]);
        let body = bb.finish_body(ret);
        assert!(matches!(a.data(body), NodeData::Let { .. }));
    }
}
