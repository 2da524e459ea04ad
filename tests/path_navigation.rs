// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod common;

use std::{cell::RefCell, rc::Rc};

use flow_reach::expr::{self, Sort, VariableId};
use flow_reach::flow_graph::{
    FlowEdge, NodeRef, Operation, OuterEdge, OuterEdgeKind, Program, ProgramBuilder,
    StartingNodeInfo,
};
use flow_reach::heap::NullHeap;
use flow_reach::path::{PathArena, PathId};
use flow_reach::versions::{PathVersionHandler, StepSink, VersionMap};

/// Tallies solver-scope events to verify push/pop balance
#[derive(Default)]
struct CountingSink {
    pushes: usize,
    pops: usize,
}

impl StepSink for CountingSink {
    fn before_step_extended(&mut self) {
        self.pushes += 1;
    }

    fn after_retraction(&mut self, steps: usize) {
        self.pops += steps;
    }
}

fn handler_at<S: StepSink>(
    program: &Rc<Program>,
    arena: &Rc<RefCell<PathArena>>,
    root: PathId,
    start: NodeRef,
    sink: S,
) -> PathVersionHandler<S> {
    PathVersionHandler::new(
        Rc::clone(program),
        Rc::clone(arena),
        root,
        StartingNodeInfo::node_only(start),
        Box::new(NullHeap::default()),
        sink,
    )
}

#[test]
fn version_monotonicity_along_a_straight_path() {
    common::init_logger();

    // enter -> body {a = 1; a = a + 1; a = a + 1} -> tail
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("straight");
    let a = pb.variable(g, "a", Sort::Int);
    let enter = pb.enter(g, vec![]);
    let body = pb.inner(
        g,
        vec![
            Operation::Assign {
                target: a,
                value: expr::int_const(1),
            },
            Operation::Assign {
                target: a,
                value: expr::add(vec![expr::var(a), expr::int_const(1)]),
            },
            Operation::Assign {
                target: a,
                value: expr::add(vec![expr::var(a), expr::int_const(1)]),
            },
        ],
    );
    let tail = pb.inner(g, vec![]);
    let e_body_tail = pb.edge(body, tail);
    let e_enter_body = pb.edge(enter, body);
    let program = Rc::new(pb.finish().unwrap());

    let arena = Rc::new(RefCell::new(PathArena::new()));
    let root = arena.borrow_mut().root(tail);
    let at_body = arena
        .borrow_mut()
        .extend(root, FlowEdge::Inner(e_body_tail), body);
    let at_enter = arena
        .borrow_mut()
        .extend(at_body, FlowEdge::Inner(e_enter_body), enter);

    let mut handler = handler_at(&program, &arena, root, tail, ());

    // three assignments replay backward into versions 1..3
    handler.update(at_body);
    assert_eq!(handler.version_of(a), 3);
    assert_eq!(handler.versions().last_used(a), 3);

    handler.update(at_enter);
    assert_eq!(handler.version_of(a), 3);

    // retracting restores the base version and the high-water mark
    handler.update(root);
    assert_eq!(handler.version_of(a), 0);
    assert_eq!(handler.versions().last_used(a), 0);

    // replaying mints the same ascending sequence again
    handler.update(at_body);
    assert_eq!(handler.version_of(a), 3);
    assert_eq!(handler.versions().last_used(a), 3);
}

fn diamond() -> (
    Rc<Program>,
    Rc<RefCell<PathArena>>,
    PathId,
    PathId,
    PathId,
    NodeRef,
    VariableId,
) {
    // enter -> top {x = 1} -> {left {x = x + 1} | right {x = x + 2}} -> bot
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("diamond");
    let x = pb.variable(g, "x", Sort::Int);
    let enter = pb.enter(g, vec![]);
    let top = pb.inner(
        g,
        vec![Operation::Assign {
            target: x,
            value: expr::int_const(1),
        }],
    );
    let left = pb.inner(
        g,
        vec![Operation::Assign {
            target: x,
            value: expr::add(vec![expr::var(x), expr::int_const(1)]),
        }],
    );
    let right = pb.inner(
        g,
        vec![Operation::Assign {
            target: x,
            value: expr::add(vec![expr::var(x), expr::int_const(2)]),
        }],
    );
    let bot = pb.inner(g, vec![]);
    let e_enter_top = pb.edge(enter, top);
    let e_top_left = pb.edge(top, left);
    let e_top_right = pb.edge(top, right);
    let e_left_bot = pb.edge(left, bot);
    let e_right_bot = pb.edge(right, bot);
    let program = Rc::new(pb.finish().unwrap());

    let arena = Rc::new(RefCell::new(PathArena::new()));
    let root = arena.borrow_mut().root(bot);
    let l1 = arena
        .borrow_mut()
        .extend(root, FlowEdge::Inner(e_left_bot), left);
    let l2 = arena
        .borrow_mut()
        .extend(l1, FlowEdge::Inner(e_top_left), top);
    let l3 = arena
        .borrow_mut()
        .extend(l2, FlowEdge::Inner(e_enter_top), enter);
    let r1 = arena
        .borrow_mut()
        .extend(root, FlowEdge::Inner(e_right_bot), right);
    let r2 = arena
        .borrow_mut()
        .extend(r1, FlowEdge::Inner(e_top_right), top);
    let r3 = arena
        .borrow_mut()
        .extend(r2, FlowEdge::Inner(e_enter_top), enter);
    (program, arena, root, l3, r3, bot, x)
}

#[test]
fn update_is_path_symmetric() {
    common::init_logger();

    let (program, arena, root, l3, r3, bot, x) = diamond();
    let mut handler = handler_at(&program, &arena, root, bot, ());

    handler.update(l3);
    let version_before = handler.version_of(x);
    let high_water_before = handler.versions().last_used(x);
    let heap_ops_before = handler.heap().operation_count();

    // navigate away across the common ancestor and back again
    handler.update(r3);
    handler.update(l3);

    assert_eq!(handler.version_of(x), version_before);
    assert_eq!(handler.versions().last_used(x), high_water_before);
    assert_eq!(handler.heap().operation_count(), heap_ops_before);
    assert_eq!(handler.current_path(), l3);
}

#[test]
fn scopes_balance_over_arbitrary_navigation() {
    common::init_logger();

    let (program, arena, root, l3, r3, bot, _) = diamond();
    let mut handler = handler_at(&program, &arena, root, bot, CountingSink::default());

    handler.update(l3);
    handler.update(root);
    handler.update(r3);
    handler.update(root);

    let sink = handler.sink();
    // one scope per edge in either direction, fully balanced back at
    // the root
    assert_eq!(sink.pushes, sink.pops);
    assert_eq!(sink.pushes + sink.pops, 12);
}

#[test]
fn jumping_between_branches_crosses_the_common_ancestor() {
    common::init_logger();

    let (program, arena, root, l3, r3, bot, _) = diamond();
    let mut handler = handler_at(&program, &arena, root, bot, CountingSink::default());

    handler.update(l3);
    // l3 -> r3 retracts three steps and extends three steps without
    // visiting the root handler-externally
    handler.update(r3);

    let sink = handler.sink();
    assert_eq!(sink.pushes, 6);
    assert_eq!(sink.pops, 3);
    assert_eq!(handler.current_path(), r3);
}

#[test]
fn call_and_return_restore_caller_versions() {
    common::init_logger();

    // caller: enter -> pre {y = 5} -> call sum(y) = z -> post
    // callee: enter(p) -> return p + 1
    let mut pb = ProgramBuilder::new();
    let caller = pb.graph("caller");
    let y = pb.variable(caller, "y", Sort::Int);
    let z = pb.variable(caller, "z", Sort::Int);
    let callee = pb.graph("callee");
    let p = pb.variable(callee, "p", Sort::Int);

    let enter_c = pb.enter(caller, vec![]);
    let pre = pb.inner(
        caller,
        vec![Operation::Assign {
            target: y,
            value: expr::int_const(5),
        }],
    );
    let call = pb.call(
        caller,
        flow_reach::flow_graph::CallSite {
            callee: Some(callee),
            display_name: "callee".to_string(),
            arguments: vec![expr::var(y)],
            results: vec![z],
            is_constructor: false,
        },
    );
    let post = pb.inner(caller, vec![]);
    let e_enter_pre = pb.edge(enter_c, pre);
    let e_pre_call = pb.edge(pre, call);
    let e_call_post = pb.edge(call, post);

    let enter_d = pb.enter(callee, vec![p]);
    let ret = pb.ret(
        callee,
        vec![expr::add(vec![expr::var(p), expr::int_const(1)])],
    );
    let e_enter_ret = pb.edge(enter_d, ret);

    let program = Rc::new(pb.finish().unwrap());

    let arena = Rc::new(RefCell::new(PathArena::new()));
    let root = arena.borrow_mut().root(post);
    let at_call = arena
        .borrow_mut()
        .extend(root, FlowEdge::Inner(e_call_post), call);
    let return_edge = FlowEdge::Outer(OuterEdge {
        kind: OuterEdgeKind::Return,
        from: ret,
        to: call,
    });
    let at_ret = arena.borrow_mut().extend(at_call, return_edge, ret);
    let at_enter_d = arena
        .borrow_mut()
        .extend(at_ret, FlowEdge::Inner(e_enter_ret), enter_d);
    let call_edge = FlowEdge::Outer(OuterEdge {
        kind: OuterEdgeKind::MethodCall,
        from: call,
        to: enter_d,
    });
    let at_call_again = arena.borrow_mut().extend(at_enter_d, call_edge, call);
    let at_pre = arena
        .borrow_mut()
        .extend(at_call_again, FlowEdge::Inner(e_pre_call), pre);
    let at_enter_c = arena
        .borrow_mut()
        .extend(at_pre, FlowEdge::Inner(e_enter_pre), enter_c);

    let mut handler = handler_at(&program, &arena, root, post, ());

    // position just before diving into the callee
    handler.update(at_call);
    let y_at_call = handler.version_of(y);
    let z_at_call = handler.version_of(z);

    // cross the Return edge: the caller's locals are shielded behind
    // fresh versions and one call frame is pending
    handler.update(at_enter_d);
    assert_eq!(handler.call_stack_depth(), 1);
    assert_ne!(handler.version_of(y), y_at_call);

    // cross the MethodCall edge: the post-call versions are restored
    handler.update(at_call_again);
    assert_eq!(handler.call_stack_depth(), 0);
    assert_eq!(handler.version_of(y), y_at_call);

    // walk the whole caller prefix, then retract everything
    handler.update(at_enter_c);
    handler.update(root);
    assert_eq!(handler.version_of(y), 0);
    assert_eq!(handler.version_of(z), 0);
    assert_eq!(handler.version_of(p), 0);
    assert_eq!(handler.call_stack_depth(), 0);

    // and the round trip is replayable
    handler.update(at_call);
    assert_eq!(handler.version_of(y), y_at_call);
    assert_eq!(handler.version_of(z), z_at_call);
}

#[test]
fn recursive_reentry_restores_shadowed_frames() {
    common::init_logger();

    // g: enter -> call f(1) = r -> post
    // f: enter(p) -> [p <= 0] return 0
    //    enter(p) -> [p > 0] call f(p - 1) = m -> return m
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("g");
    let r = pb.variable(g, "r", Sort::Int);
    let f = pb.graph("f");
    let p = pb.variable(f, "p", Sort::Int);
    let m = pb.variable(f, "m", Sort::Int);

    let enter_g = pb.enter(g, vec![]);
    let outer_call = pb.call(
        g,
        flow_reach::flow_graph::CallSite {
            callee: Some(f),
            display_name: "f".to_string(),
            arguments: vec![expr::int_const(1)],
            results: vec![r],
            is_constructor: false,
        },
    );
    let post = pb.inner(g, vec![]);
    let e_enter_call = pb.edge(enter_g, outer_call);
    let e_call_post = pb.edge(outer_call, post);

    let enter_f = pb.enter(f, vec![p]);
    let ret_base = pb.ret(f, vec![expr::int_const(0)]);
    let rec_call = pb.call(
        f,
        flow_reach::flow_graph::CallSite {
            callee: Some(f),
            display_name: "f".to_string(),
            arguments: vec![expr::sub(expr::var(p), expr::int_const(1))],
            results: vec![m],
            is_constructor: false,
        },
    );
    let ret_rec = pb.ret(f, vec![expr::var(m)]);
    let e_base = pb.guarded_edge(enter_f, ret_base, expr::le(expr::var(p), expr::int_const(0)));
    let e_rec = pb.guarded_edge(enter_f, rec_call, expr::gt(expr::var(p), expr::int_const(0)));
    let e_call_ret = pb.edge(rec_call, ret_rec);

    let program = Rc::new(pb.finish().unwrap());

    // one backward walk through the recursion: dive two levels in, come
    // two levels back out
    let arena = Rc::new(RefCell::new(PathArena::new()));
    let root = arena.borrow_mut().root(post);
    let outer_return = FlowEdge::Outer(OuterEdge {
        kind: OuterEdgeKind::Return,
        from: ret_rec,
        to: outer_call,
    });
    let inner_return = FlowEdge::Outer(OuterEdge {
        kind: OuterEdgeKind::Return,
        from: ret_base,
        to: rec_call,
    });
    let inner_call_edge = FlowEdge::Outer(OuterEdge {
        kind: OuterEdgeKind::MethodCall,
        from: rec_call,
        to: enter_f,
    });
    let outer_call_edge = FlowEdge::Outer(OuterEdge {
        kind: OuterEdgeKind::MethodCall,
        from: outer_call,
        to: enter_f,
    });

    let (d2, d4, d6, d8, d9) = {
        let mut paths = arena.borrow_mut();
        let d1 = paths.extend(root, FlowEdge::Inner(e_call_post), outer_call);
        let d2 = paths.extend(d1, outer_return, ret_rec);
        let d3 = paths.extend(d2, FlowEdge::Inner(e_call_ret), rec_call);
        let d4 = paths.extend(d3, inner_return, ret_base);
        let d5 = paths.extend(d4, FlowEdge::Inner(e_base), enter_f);
        let d6 = paths.extend(d5, inner_call_edge, rec_call);
        let d7 = paths.extend(d6, FlowEdge::Inner(e_rec), enter_f);
        let d8 = paths.extend(d7, outer_call_edge, outer_call);
        let d9 = paths.extend(d8, FlowEdge::Inner(e_enter_call), enter_g);
        (d2, d4, d6, d8, d9)
    };

    let mut handler = handler_at(&program, &arena, root, post, ());

    // entering the outer call pushes the caller frame
    handler.update(d2);
    assert_eq!(handler.call_stack_depth(), 1);

    // entering the recursive call pushes a second frame on the same
    // stack; the callee's locals are shielded behind fresh versions
    handler.update(d4);
    assert_eq!(handler.call_stack_depth(), 2);
    let p_shadowed = handler.version_of(p);

    // exiting the recursive call restores the shadowed frame exactly
    handler.update(d6);
    assert_eq!(handler.call_stack_depth(), 1);
    assert!(handler.version_of(p) < p_shadowed);

    // exiting the outer call consumes the remaining frame
    handler.update(d8);
    assert_eq!(handler.call_stack_depth(), 0);

    handler.update(d9);

    // a full retraction unwinds both levels in exact reverse order
    handler.update(root);
    assert_eq!(handler.call_stack_depth(), 0);
    assert_eq!(handler.version_of(p), 0);
    assert_eq!(handler.version_of(m), 0);
    assert_eq!(handler.version_of(r), 0);

    // and the whole dive is replayable
    handler.update(d9);
    assert_eq!(handler.call_stack_depth(), 0);
    handler.update(root);
    assert_eq!(handler.version_of(p), 0);
}

#[test]
fn null_reference_is_pinned_to_version_zero() {
    let versions = VersionMap::new();
    assert_eq!(versions.version_of(VariableId::NULL), 0);
    assert_eq!(versions.versioned(VariableId::NULL).version, 0);
}
