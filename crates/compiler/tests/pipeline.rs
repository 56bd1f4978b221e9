//! End-to-end pipeline scenarios: each one drives real passes over a
//! module built the way the parser (or an earlier pass) would emit it.

mod common;

use common::*;
use shade_ir::arena::MaskRepr;
use shade_ir::node::{NodeData, Op};
use shade_ir::types::AddressSpace;
use shadec::passes;
use shadec::{CompilerConfig, generate_dummy_constants, run_compiler_passes};

#[test]
fn test_constant_folding_through_inference() {
    // fn f() -> i32 { let v = add 2, 3; return v }
    let mut a = parsed_arena();
    let int32 = a.int32_type();
    let two = a.int32_literal(2);
    let three = a.int32_literal(3);
    let ta = a.empty();
    let ops = a.intern_list(&[two, three]);
    let add = a.prim_op(Op::Add, ta, ops);
    let v = untyped_var(&mut a, "v");
    let l = parsed_let(&mut a, add, &[v]);
    let use_v = unbound(&mut a, "v");
    let term = ret(&mut a, &[use_v]);
    let body = parsed_block(&mut a, &[l], &[], &[], term);
    let f = function(&mut a, "f", &[], &[], &[int32], Some(body));
    let src = program(a, "folding", &[f]);

    let cfg = CompilerConfig::default();
    let p = passes::bind::run(&cfg, &src, bound_config()).unwrap();
    let p = passes::normalize::run(&cfg, &p, bound_config()).unwrap();
    let p = passes::infer::run(&cfg, &p, inferred_config()).unwrap();

    let f = p.module.find_declaration(&p.arena, "f").unwrap();
    let body = shade_ir::get_abstraction_body(&p.arena, f).unwrap();
    let NodeData::Return { values } = p.arena.data(body) else {
        panic!("expected the let to fold into a direct return");
    };
    let values = p.arena.node_list(*values);
    assert_eq!(values.len(), 1);
    assert!(matches!(
        p.arena.data(values[0]),
        NodeData::IntLit { value: 5, .. }
    ));
}

#[test]
fn test_binding_resolves_params_and_functions() {
    // fn foo(x: i32) { tail_call foo(x) }
    let mut a = parsed_arena();
    let int32 = a.int32_type();
    let x = a.fresh_var(Some(int32), "x");
    let callee = unbound(&mut a, "foo");
    let arg = unbound(&mut a, "x");
    let args = a.intern_list(&[arg]);
    let tc = a.node(NodeData::TailCall { callee, args });
    let body = parsed_block(&mut a, &[], &[], &[], tc);
    let foo = function(&mut a, "foo", &[], &[x], &[], Some(body));
    let src = program(a, "binding", &[foo]);

    let cfg = CompilerConfig::default();
    let p = passes::bind::run(&cfg, &src, bound_config()).unwrap();

    for id in reachable_nodes(&p) {
        assert!(
            !matches!(p.arena.data(id), NodeData::Unbound { .. }),
            "unbound reference survived binding"
        );
    }

    let foo = p.module.find_declaration(&p.arena, "foo").unwrap();
    let params = shade_ir::get_abstraction_params(&p.arena, foo);
    let param = p.arena.node_list(params)[0];
    let body = shade_ir::get_abstraction_body(&p.arena, foo).unwrap();
    let NodeData::TailCall { callee, args } = p.arena.data(body) else {
        panic!("expected a tail call");
    };
    let NodeData::FnAddr { function } = p.arena.data(*callee) else {
        panic!("callee should resolve to the function's address");
    };
    assert_eq!(*function, foo);
    assert_eq!(p.arena.node_list(*args), &[param]);
}

#[test]
fn test_hash_consing_within_and_across_arenas() {
    let mut a = parsed_arena();
    let x = a.int32_literal(7);
    let y = a.int32_literal(7);
    assert_eq!(x, y);
    let mut b = parsed_arena();
    let z = b.int32_literal(7);
    assert_ne!(x, z);
}

#[test]
fn test_broadcast_lowering_on_int64() {
    // fn f(v: varying i64) -> uniform i64 { let u = broadcast_first v; return u }
    let mut a = typed_arena();
    let i64t = a.int64_type();
    let varying = a.qualified_type(false, i64t);
    let uniform = a.qualified_type(true, i64t);
    let v = a.fresh_var(Some(varying), "v");
    let ta = a.empty();
    let ops = a.singleton(v);
    let bcast = a.prim_op(Op::SubgroupBroadcastFirst, ta, ops);
    let u = a.fresh_var(Some(uniform), "u");
    let vars = a.singleton(u);
    let term = ret(&mut a, &[u]);
    let body = a.node(NodeData::Let {
        instruction: bcast,
        vars,
        tail: Some(term),
    });
    let f = function(&mut a, "f", &[], &[v], &[uniform], Some(body));
    let src = program(a, "broadcast", &[f]);

    let mut cfg = CompilerConfig::default();
    cfg.lower.emulate_subgroup_ops_extended_types = true;
    let p = passes::lower_subgroup_ops::run(&cfg, &src, inferred_config()).unwrap();

    // an i64 is two words: exactly two word broadcasts remain, pinned
    // uniform once at the end
    assert_eq!(count_primops(&p, Op::SubgroupBroadcastFirst), 2);
    assert_eq!(count_primops(&p, Op::SubgroupAssumeUniform), 1);
    assert!(count_primops(&p, Op::Load) >= 2);
    assert!(count_primops(&p, Op::Store) >= 2);
}

#[test]
fn test_tailcall_trampoline() {
    // f tail-calls g; afterwards f's block writes g's scheduler id and
    // jumps to the dispatch loop
    let mut a = typed_arena();
    let g_term = ret(&mut a, &[]);
    let g = function(&mut a, "g", &[], &[], &[], Some(g_term));
    let g_addr = a.node(NodeData::FnAddr { function: g });
    let no_args = a.empty();
    let f_term = a.node(NodeData::TailCall {
        callee: g_addr,
        args: no_args,
    });
    let f = function(&mut a, "f", &[], &[], &[], Some(f_term));
    let src = program(a, "trampoline", &[f, g]);

    let cfg = CompilerConfig::default();
    let p = passes::lower_tailcalls::run(&cfg, &src, inferred_config()).unwrap();

    let host = p.module.find_declaration(&p.arena, "scheduler").unwrap();
    let mut f_block = None;
    let mut stack = vec![host];
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let NodeData::BasicBlock { name, .. } = p.arena.data(id)
            && p.arena.str(*name) == "f"
        {
            f_block = Some(id);
        }
        stack.extend(p.arena.data(id).children(&p.arena));
    }
    let f_block = f_block.expect("f's body became a block of the scheduler");

    // f was declared first, g second: ids 1 and 2
    let body = shade_ir::get_abstraction_body(&p.arena, f_block).unwrap();
    let NodeData::Let {
        instruction, tail, ..
    } = p.arena.data(body)
    else {
        panic!("expected the store of the callee id");
    };
    let NodeData::PrimOp {
        op: Op::Store,
        operands,
        ..
    } = p.arena.data(*instruction)
    else {
        panic!("expected a store into the next-continuation slot");
    };
    let stored = p.arena.node_list(*operands)[1];
    assert!(matches!(
        p.arena.data(stored),
        NodeData::IntLit { value: 2, .. }
    ));
    let NodeData::Jump { target, .. } = p.arena.data(tail.unwrap()) else {
        panic!("expected a jump back to the dispatch loop");
    };
    let NodeData::BasicBlock { name, .. } = p.arena.data(*target) else {
        panic!("jump target is not a block");
    };
    assert_eq!(p.arena.str(*name), "dispatch_loop");
}

#[test]
fn test_mask_rewrite_to_int64() {
    // let m = empty_mask; let b = mask_is_thread_active m, lane; return b
    let mut a = typed_arena();
    let u32t = a.uint32_type();
    let lane_ty = a.qualified_type(false, u32t);
    let lane = a.fresh_var(Some(lane_ty), "lane");
    let mask_t = a.mask_type();
    let m_ty = a.qualified_type(true, mask_t);
    let m = a.fresh_var(Some(m_ty), "m");
    let bool_t = a.bool_type();
    let b_ty = a.qualified_type(false, bool_t);
    let b = a.fresh_var(Some(b_ty), "b");

    let ta = a.empty();
    let no_ops = a.empty();
    let mk_mask = a.prim_op(Op::EmptyMask, ta, no_ops);
    let test_ops = a.intern_list(&[m, lane]);
    let test = a.prim_op(Op::MaskIsThreadActive, ta, test_ops);

    let term = ret(&mut a, &[b]);
    let b_vars = a.singleton(b);
    let inner = a.node(NodeData::Let {
        instruction: test,
        vars: b_vars,
        tail: Some(term),
    });
    let m_vars = a.singleton(m);
    let body = a.node(NodeData::Let {
        instruction: mk_mask,
        vars: m_vars,
        tail: Some(inner),
    });
    let f = function(&mut a, "f", &[], &[lane], &[b_ty], Some(body));
    let src = program(a, "masks", &[f]);

    let cfg = CompilerConfig::default();
    let mut aconfig = inferred_config();
    aconfig.subgroup_mask_representation = MaskRepr::Int64;
    let p = passes::lower_mask::run(&cfg, &src, aconfig).unwrap();

    for id in p.arena.node_ids() {
        assert!(
            !matches!(p.arena.data(id), NodeData::MaskType),
            "an abstract mask survived lowering"
        );
    }
    assert_eq!(count_primops(&p, Op::EmptyMask), 0);
    assert_eq!(count_primops(&p, Op::MaskIsThreadActive), 0);
}

#[test]
fn test_full_pipeline_reaches_the_emittable_dialect() {
    // a small kernel with structured control flow, run through the whole
    // pass list with the default configuration
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut a = parsed_arena();
    let int32 = a.int32_type();

    let x = a.fresh_var(Some(int32), "x");
    let zero = a.int32_literal(0);
    let ta = a.empty();
    let cmp_ops_srcs = [unbound(&mut a, "x"), zero];
    let cmp_ops = a.intern_list(&cmp_ops_srcs);
    let cmp = a.prim_op(Op::Lt, ta, cmp_ops);
    let c = untyped_var(&mut a, "c");
    let cmp_let = parsed_let(&mut a, cmp, &[c]);

    let one = a.int32_literal(1);
    let merge_one_vals = a.singleton(one);
    let merge_one = a.node(NodeData::MergeSelection {
        args: merge_one_vals,
    });
    let no_params = a.empty();
    let then_case = a.node(NodeData::Case {
        params: no_params,
        body: merge_one,
    });
    let two = a.int32_literal(2);
    let merge_two_vals = a.singleton(two);
    let merge_two = a.node(NodeData::MergeSelection {
        args: merge_two_vals,
    });
    let else_case = a.node(NodeData::Case {
        params: no_params,
        body: merge_two,
    });
    let yields = a.singleton(int32);
    let cond = unbound(&mut a, "c");
    let branch = a.node(NodeData::If {
        yield_types: yields,
        condition: cond,
        then_case,
        else_case: Some(else_case),
    });
    let y = untyped_var(&mut a, "y");
    let if_let = parsed_let(&mut a, branch, &[y]);

    let use_y = unbound(&mut a, "y");
    let term = ret(&mut a, &[use_y]);
    let body = parsed_block(&mut a, &[cmp_let, if_let], &[], &[], term);

    let entry = annotation(&mut a, "EntryPoint");
    let main = function(&mut a, "main", &[entry], &[x], &[int32], Some(body));

    let mut src = program(a, "kernel", &[main]);
    let cfg = CompilerConfig::default();
    generate_dummy_constants(&cfg, &mut src);

    let p = run_compiler_passes(&cfg, src).unwrap();

    for id in p.arena.node_ids() {
        let data = p.arena.data(id);
        assert!(
            !matches!(
                data,
                NodeData::If { .. }
                    | NodeData::Match { .. }
                    | NodeData::Loop { .. }
                    | NodeData::ParsedBlock { .. }
                    | NodeData::Unbound { .. }
                    | NodeData::MaskType
            ),
            "{} survived the full pipeline",
            data.tag_name()
        );
        if let NodeData::PtrType { addr_space, .. } = data {
            assert!(
                !addr_space.is_physical(),
                "a physical pointer type survived lower_physical_ptrs"
            );
        }
        if let NodeData::GlobalVariable { addr_space, .. } = data {
            assert_ne!(*addr_space, AddressSpace::Subgroup);
        }
    }

    // the stack machinery must have been concretized, not dropped
    assert!(
        p.module
            .find_declaration(&p.arena, "physical_memory_private")
            .is_some()
    );
}
