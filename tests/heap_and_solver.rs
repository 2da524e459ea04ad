// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod common;

use std::{cell::RefCell, rc::Rc};

use flow_reach::expr::{self, Sort, VariableId, VariableLookup, VersionLookup, VersionedVariable};
use flow_reach::flow_graph::{FlowEdge, Program, ProgramBuilder};
use flow_reach::heap::{EqualityHeap, SymbolicHeap};
use flow_reach::path::PathArena;
use flow_reach::smt::{
    BoundedSearchSolver, IncrementalSolver, SearchConfig, SolveOutcome, SymbolId, SymbolResolver,
    SymbolTable, Value,
};

/// A fixed-version lookup for building version-resolved expressions in
/// isolation
struct AllVersion(u32);

impl VersionLookup for AllVersion {
    fn version_of(&self, _var: VariableId) -> u32 {
        self.0
    }
}

/// Test resolver backed by a shared symbol table and a program's
/// variable registry
struct TestResolver {
    table: Rc<RefCell<SymbolTable>>,
    program: Rc<Program>,
}

impl SymbolResolver for TestResolver {
    fn resolve(&mut self, versioned: VersionedVariable) -> (SymbolId, Sort) {
        let sort = self.program.variable_sort(versioned.variable);
        let sym = self.table.borrow_mut().symbol_for(
            self.program.variable_name(versioned.variable),
            versioned.variable,
            versioned.version,
        );
        (sym, sort)
    }
}

fn two_ints() -> (Rc<Program>, VariableId, VariableId) {
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("ints");
    let a = pb.variable(g, "a", Sort::Int);
    let b = pb.variable(g, "b", Sort::Int);
    let enter = pb.enter(g, vec![a, b]);
    let tail = pb.inner(g, vec![]);
    pb.edge(enter, tail);
    (Rc::new(pb.finish().unwrap()), a, b)
}

//
// bounded-search solver
//

#[test]
fn solver_finds_a_model_for_a_satisfiable_condition() {
    let (program, a, b) = two_ints();
    let table = Rc::new(RefCell::new(SymbolTable::new()));
    let mut resolver = TestResolver {
        table: Rc::clone(&table),
        program: Rc::clone(&program),
    };

    let mut solver = BoundedSearchSolver::new(SearchConfig::default());
    solver.push();
    let cond = expr::gt(expr::var(a), expr::var(b)).with_versions(&AllVersion(0));
    solver.assert(&mut resolver, &cond);

    assert_eq!(solver.check(), SolveOutcome::Sat);
    let model = solver.model().unwrap();
    let sym_a = table.borrow_mut().symbol_for("a", a, 0);
    let sym_b = table.borrow_mut().symbol_for("b", b, 0);
    match (model.interpret(sym_a), model.interpret(sym_b)) {
        (Some(Value::Int(va)), Some(Value::Int(vb))) => assert!(va > vb),
        other => panic!("Unexpected interpretations: {:?}", other),
    }
}

#[test]
fn solver_reports_a_minimal_core_for_a_contradiction() {
    let (program, a, b) = two_ints();
    let table = Rc::new(RefCell::new(SymbolTable::new()));
    let mut resolver = TestResolver {
        table,
        program: Rc::clone(&program),
    };

    let mut solver = BoundedSearchSolver::new(SearchConfig::default());
    solver.push();
    // an irrelevant but satisfiable side constraint
    solver.assert(
        &mut resolver,
        &expr::ge(expr::var(a), expr::int_const(0)).with_versions(&AllVersion(0)),
    );
    solver.push();
    solver.assert(
        &mut resolver,
        &expr::gt(expr::var(a), expr::var(b)).with_versions(&AllVersion(0)),
    );
    solver.assert(
        &mut resolver,
        &expr::le(expr::var(a), expr::var(b)).with_versions(&AllVersion(0)),
    );

    assert_eq!(solver.check(), SolveOutcome::Unsat);
    let core = solver.unsat_core().unwrap();
    // the side constraint is minimized away
    assert_eq!(core, vec![1, 2]);

    // popping the conflicting scope recovers satisfiability
    solver.pop(1);
    assert_eq!(solver.check(), SolveOutcome::Sat);
}

#[test]
fn solver_caps_out_as_unknown() {
    let (program, a, _) = two_ints();
    let table = Rc::new(RefCell::new(SymbolTable::new()));
    let mut resolver = TestResolver {
        table,
        program: Rc::clone(&program),
    };

    let mut solver = BoundedSearchSolver::new(SearchConfig {
        radius: 2,
        max_assignments: 1,
    });
    solver.push();
    solver.assert(
        &mut resolver,
        &expr::eq(
            expr::var(a),
            expr::add(vec![expr::var(a), expr::int_const(1)]),
        )
        .with_versions(&AllVersion(0)),
    );
    assert_eq!(solver.check(), SolveOutcome::Unknown);
}

#[test]
fn symbol_table_mints_monotonically_and_caches() {
    let (_, a, b) = two_ints();
    let mut table = SymbolTable::new();
    let first = table.symbol_for("a", a, 0);
    let again = table.symbol_for("a", a, 0);
    let second = table.symbol_for("a", a, 1);
    let third = table.symbol_for("b", b, 0);
    assert_eq!(first, again);
    assert!(first < second);
    assert!(second < third);
    assert_eq!(table.len(), 3);
}

//
// equality heap
//

#[test]
fn equality_heap_detects_contradictions_and_retracts() {
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("refs");
    let r = pb.variable(g, "r", Sort::Reference);
    let s = pb.variable(g, "s", Sort::Reference);
    let enter = pb.enter(g, vec![r, s]);
    let tail = pb.inner(g, vec![]);
    pb.edge(enter, tail);
    let _program = pb.finish().unwrap();
    let vr = VersionedVariable::new(r, 0);
    let vs = VersionedVariable::new(s, 0);

    let mut heap = EqualityHeap::new();
    heap.assert_equality(true, vr, vs);
    assert!(heap.can_be_satisfiable());

    heap.assert_equality(false, vr, vs);
    assert!(!heap.can_be_satisfiable());

    heap.retract(1);
    assert!(heap.can_be_satisfiable());
    assert_eq!(heap.operation_count(), 1);
}

#[test]
fn equality_heap_keeps_allocations_distinct() {
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("refs");
    let r = pb.variable(g, "r", Sort::Reference);
    let s = pb.variable(g, "s", Sort::Reference);
    let enter = pb.enter(g, vec![r, s]);
    let tail = pb.inner(g, vec![]);
    pb.edge(enter, tail);
    let _program = pb.finish().unwrap();
    let vr = VersionedVariable::new(r, 0);
    let vs = VersionedVariable::new(s, 0);

    let mut heap = EqualityHeap::new();
    heap.allocate(vr);
    heap.allocate(vs);
    assert!(heap.can_be_satisfiable());

    // two distinct allocations cannot alias
    heap.assert_equality(true, vr, vs);
    assert!(!heap.can_be_satisfiable());
    heap.retract(1);

    // and an allocation is never null
    heap.assert_equality(true, vr, VersionedVariable::NULL);
    assert!(!heap.can_be_satisfiable());
}

#[test]
fn equality_heap_answers_decided_queries() {
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("refs");
    let r = pb.variable(g, "r", Sort::Reference);
    let s = pb.variable(g, "s", Sort::Reference);
    let t = pb.variable(g, "t", Sort::Reference);
    let enter = pb.enter(g, vec![r, s, t]);
    let tail = pb.inner(g, vec![]);
    pb.edge(enter, tail);
    let _program = pb.finish().unwrap();
    let vr = VersionedVariable::new(r, 0);
    let vs = VersionedVariable::new(s, 0);
    let vt = VersionedVariable::new(t, 0);

    let mut heap = EqualityHeap::new();
    heap.assert_equality(true, vr, vs);

    assert_eq!(heap.equality_expr(true, vr, vs), expr::bool_const(true));
    assert_eq!(heap.equality_expr(false, vr, vs), expr::bool_const(false));

    // an unrelated pair stays residual
    match heap.equality_expr(true, vr, vt) {
        flow_reach::expr::Expression::RefEqVersioned { equal, left, right } => {
            assert!(equal);
            assert_eq!(left, vr);
            assert_eq!(right, vt);
        }
        other => panic!("Expected a residual comparison, got {}", other),
    }
}

//
// path arena
//

#[test]
fn path_arena_extension_and_merge() {
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("tiny");
    let enter = pb.enter(g, vec![]);
    let mid = pb.inner(g, vec![]);
    let tail = pb.inner(g, vec![]);
    let e1 = pb.edge(enter, mid);
    let e2 = pb.edge(mid, tail);
    let _program = pb.finish().unwrap();

    let mut arena = PathArena::new();
    let root = arena.root(tail);
    assert!(arena.is_root(root));
    assert_eq!(arena.depth(root), 0);

    let p1 = arena.extend(root, FlowEdge::Inner(e2), mid);
    let p2 = arena.extend(p1, FlowEdge::Inner(e1), enter);
    assert_eq!(arena.depth(p2), 2);
    assert_eq!(arena.root_of(p2), root);

    // a merge records an extra predecessor and leading edge
    let sibling = arena.extend(root, FlowEdge::Inner(e2), mid);
    arena.merge_into(p1, root, FlowEdge::Inner(e2));
    assert_eq!(arena.node(p1).preceding().len(), 2);
    assert_eq!(arena.node(p1).leading_edges().len(), 2);
    assert_eq!(arena.primary_preceding(p1), root);
    assert_eq!(arena.depth(sibling), 1);
}

//
// program validation
//

#[test]
fn builder_rejects_malformed_graphs() {
    // no Enter node
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("broken");
    pb.inner(g, vec![]);
    assert!(pb.finish().is_err());

    // two Enter nodes
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("broken");
    pb.enter(g, vec![]);
    pb.enter(g, vec![]);
    assert!(pb.finish().is_err());

    // a node unreachable from Enter
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("broken");
    pb.enter(g, vec![]);
    pb.inner(g, vec![]);
    assert!(pb.finish().is_err());

    // a non-boolean guard
    let mut pb = ProgramBuilder::new();
    let g = pb.graph("broken");
    let enter = pb.enter(g, vec![]);
    let tail = pb.inner(g, vec![]);
    pb.guarded_edge(enter, tail, expr::int_const(1));
    assert!(pb.finish().is_err());
}
