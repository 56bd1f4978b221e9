//! Rewriter invariants: identity rewriting preserves structure, and the
//! memo makes rewrites stable.

mod common;

use common::*;
use shade_ir::node::{NodeData, Op};
use shade_ir::print_module;
use shadec::rewrite::{IdentityRewriter, RewriteCtx, Rewriter, rewrite_module, rewrite_node};
use shadec::rewrite_identity;

fn sample_program() -> shade_ir::Program {
    // fn f(x: i32) -> i32 { let v = add x, 1; return v }
    let mut a = parsed_arena();
    let int32 = a.int32_type();
    let x = a.fresh_var(Some(int32), "x");
    let one = a.int32_literal(1);
    let ta = a.empty();
    let ops = a.intern_list(&[x, one]);
    let add = a.prim_op(Op::Add, ta, ops);
    let v = a.fresh_var(Some(int32), "v");
    let vars = a.singleton(v);
    let term = ret(&mut a, &[v]);
    let body = a.node(NodeData::Let {
        instruction: add,
        vars,
        tail: Some(term),
    });
    let f = function(&mut a, "f", &[], &[x], &[int32], Some(body));
    program(a, "sample", &[f])
}

#[test]
fn test_identity_rewrite_preserves_structure() {
    let src = sample_program();
    let dst = rewrite_identity(&src, *src.arena.config());
    assert_eq!(
        print_module(&src.arena, &src.module),
        print_module(&dst.arena, &dst.module)
    );
}

#[test]
fn test_identity_rewrite_lands_in_a_fresh_arena() {
    let src = sample_program();
    let dst = rewrite_identity(&src, *src.arena.config());
    let f_src = src.module.declarations()[0];
    let f_dst = dst.module.declarations()[0];
    assert_ne!(f_src, f_dst);
    assert!(dst.arena.owns(f_dst));
    assert!(!dst.arena.owns(f_src));
}

#[test]
fn test_memo_makes_rewrites_stable() {
    let src = sample_program();
    let f = src.module.declarations()[0];
    let body = shade_ir::get_abstraction_body(&src.arena, f).unwrap();

    let mut pass = IdentityRewriter {
        rw: RewriteCtx::new(&src, *src.arena.config()),
    };
    rewrite_module(&mut pass);
    let first = rewrite_node(&mut pass, body);
    let second = rewrite_node(&mut pass, body);
    assert_eq!(first, second);
    assert_eq!(pass.ctx().find_processed(body), Some(first));
}
