// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use log::debug;
use std::{cell::RefCell, rc::Rc};

use crate::expr::{self, Expression, Sort, VariableId, VariableLookup, VersionedVariable};
use crate::flow_graph::{FlowEdge, FlowNode, NodeRef, Program, StartingNodeInfo};
use crate::heap::{SymbolicHeapContext, SymbolicHeapFactory};
use crate::path::{PathArena, PathId};
use crate::results::{
    ExecutionModel, ExplorationResult, PathCounterExample, VariableValuation, Verdict,
};
use crate::smt::{
    SolveOutcome, SolverFactory, SolverModel, SymbolId, SymbolResolver, SymbolTable,
};
use crate::versions::{PathVersionHandler, StepSink, VersionMap};

/// Resolves versioned variables to shared-table symbols at assertion
/// time
struct TableResolver<'a> {
    symbols: &'a mut SymbolTable,
    program: &'a Program,
}

impl<'a> SymbolResolver for TableResolver<'a> {
    fn resolve(&mut self, versioned: VersionedVariable) -> (SymbolId, Sort) {
        let hint = self.program.variable_name(versioned.variable);
        let sym = self
            .symbols
            .symbol_for(hint, versioned.variable, versioned.version);
        (sym, self.program.variable_sort(versioned.variable))
    }
}

/// Heap context backed by the session's shared symbol table
struct TableHeapContext<'a> {
    symbols: &'a RefCell<SymbolTable>,
}

impl<'a> SymbolicHeapContext for TableHeapContext<'a> {
    fn fresh_symbol(&mut self, hint: &str) -> SymbolId {
        self.symbols.borrow_mut().mint_named(hint)
    }
}

/// Mirrors path navigation into the solver: one scope per extension,
/// batched scope pops after retraction, version-resolved assertions.
/// The scope-structured assertion log doubles as the replay script for
/// session cloning and as the index space of unsatisfiable cores.
struct SolverSink {
    solver: Box<dyn crate::smt::IncrementalSolver>,
    symbols: Rc<RefCell<SymbolTable>>,
    program: Rc<Program>,
    log: Vec<Vec<Expression>>,
}

impl SolverSink {
    fn open_scope(&mut self) {
        self.solver.push();
        self.log.push(vec![]);
    }

    fn close_scopes(&mut self, count: usize) {
        if count > 0 {
            assert!(
                count <= self.log.len(),
                "Solver scope pops must not exceed the pushes"
            );
            self.solver.pop(count);
            let keep = self.log.len() - count;
            self.log.truncate(keep);
        }
    }

    fn post(&mut self, expr: Expression) {
        {
            let mut table = self.symbols.borrow_mut();
            let mut resolver = TableResolver {
                symbols: &mut table,
                program: &*self.program,
            };
            self.solver.assert(&mut resolver, &expr);
        }
        self.log
            .last_mut()
            .expect("An assertion requires an open solver scope")
            .push(expr);
    }

    fn flattened_log(&self) -> Vec<Expression> {
        self.log.iter().flatten().cloned().collect()
    }
}

impl StepSink for SolverSink {
    fn before_step_extended(&mut self) {
        self.open_scope();
    }

    fn after_retraction(&mut self, steps: usize) {
        // done as a batch for performance reasons
        self.close_scopes(steps);
    }

    fn condition_asserted(&mut self, versions: &VersionMap, cond: &Expression) {
        self.post(cond.with_versions(versions));
    }

    fn variable_assigned(
        &mut self,
        versions: &VersionMap,
        variable: VariableId,
        last_version: u32,
        value: &Expression,
    ) {
        if self.program.is_reference(variable) {
            // reference assignments are carried by the symbolic heap
            return;
        }
        let lhs = Expression::Versioned(VersionedVariable::new(variable, last_version));
        let rhs = value.with_versions(versions);
        self.post(expr::eq(lhs, rhs));
    }
}

/// Replays a solved path back to the root, recording the node sequence
/// and the model interpretations of the variables retracted at each
/// step. Assignments retracted across an outer edge surface at the
/// next (earlier) node.
struct ModelRecorder {
    symbols: Rc<RefCell<SymbolTable>>,
    program: Rc<Program>,
    model: Box<dyn SolverModel>,
    nodes: Vec<NodeRef>,
    valuations: Vec<Vec<VariableValuation>>,
    current: Vec<VariableValuation>,
    next: Vec<VariableValuation>,
    postponed: bool,
}

impl ModelRecorder {
    fn interpretation(&self, variable: VariableId, version: u32) -> VariableValuation {
        let hint = self.program.variable_name(variable);
        let sym = self
            .symbols
            .borrow_mut()
            .symbol_for(hint, variable, version);
        VariableValuation {
            variable,
            version,
            value: self.model.interpret(sym),
        }
    }

    fn record(&mut self, variable: VariableId, version: u32) {
        let valuation = self.interpretation(variable, version);
        if self.postponed {
            self.next.push(valuation);
        } else {
            self.current.push(valuation);
        }
    }

    fn record_next(&mut self, variable: VariableId, version: u32) {
        let valuation = self.interpretation(variable, version);
        self.next.push(valuation);
    }
}

impl StepSink for ModelRecorder {
    fn before_step_retracted(&mut self, edge: &FlowEdge) {
        self.nodes.push(edge.from(&self.program));
        self.postponed = matches!(edge, FlowEdge::Outer(_));
        // the accumulated next-node valuations become current for the
        // node just entered
        std::mem::swap(&mut self.current, &mut self.next);
    }

    fn after_step_retracted(&mut self) {
        let flushed = std::mem::take(&mut self.current);
        self.valuations.push(flushed);
    }

    fn assignment_retracted(
        &mut self,
        _versions: &VersionMap,
        variable: VariableId,
        assigned_version: u32,
        _value: Option<&Expression>,
    ) {
        self.record(variable, assigned_version);
    }

    fn random_retracted(&mut self, variable: VariableId, version: u32) {
        self.record(variable, version);
    }
}

/// Owns one incremental solver session, the variable-version handler
/// driving it, and the shared symbol table. Turns solve outcomes into
/// verdicts and materializes their payloads lazily.
pub struct SmtSessionHandler {
    tracker: PathVersionHandler<SolverSink>,
    solver_factory: Rc<dyn SolverFactory>,
    symbols: Rc<RefCell<SymbolTable>>,
    last_verdict: Option<Verdict>,
    last_result: Option<ExplorationResult>,
    heap_pruned: bool,
}

impl SmtSessionHandler {
    pub fn new(
        program: Rc<Program>,
        arena: Rc<RefCell<PathArena>>,
        root: PathId,
        starting: StartingNodeInfo,
        solver_factory: Rc<dyn SolverFactory>,
        heap_factory: &dyn SymbolicHeapFactory,
        symbols: Rc<RefCell<SymbolTable>>,
    ) -> Self {
        let solver = solver_factory.create_solver();
        let sink = SolverSink {
            solver,
            symbols: Rc::clone(&symbols),
            program: Rc::clone(&program),
            log: vec![],
        };
        let heap = {
            let mut ctx = TableHeapContext { symbols: &*symbols };
            heap_factory.create(&mut ctx)
        };
        let mut tracker = PathVersionHandler::new(program, arena, root, starting, heap, sink);

        // the root scope hosts the starting-node assertions
        tracker.sink_mut().open_scope();
        tracker.assert_starting_node();

        Self {
            tracker,
            solver_factory,
            symbols,
            last_verdict: None,
            last_result: None,
            heap_pruned: false,
        }
    }

    pub fn current_path(&self) -> PathId {
        self.tracker.current_path()
    }

    pub fn version_of(&self, var: VariableId) -> u32 {
        self.tracker.version_of(var)
    }

    pub fn last_verdict(&self) -> Option<Verdict> {
        self.last_verdict
    }

    /// The live path condition, in version-resolved form and assertion
    /// order
    pub fn path_condition(&self) -> Vec<Expression> {
        self.tracker.sink().flattened_log()
    }

    /// Navigate to `path` (posting and retracting assertions along the
    /// way) and check satisfiability of the accumulated path condition
    pub fn solve(&mut self, path: PathId) -> Verdict {
        self.tracker.update(path);

        let verdict = if !self.tracker.heap().can_be_satisfiable() {
            // cheap local conflict, no need to consult the solver
            debug!("Heap constraints locally unsatisfiable, pruning");
            self.heap_pruned = true;
            Verdict::Unreachable
        } else {
            self.heap_pruned = false;
            match self.tracker.sink_mut().solver.check() {
                SolveOutcome::Sat => Verdict::Reachable,
                SolveOutcome::Unsat => Verdict::Unreachable,
                SolveOutcome::Unknown => Verdict::Unknown,
            }
        };

        self.last_verdict = Some(verdict);
        // force the payload to be recreated on the next access
        self.last_result = None;
        verdict
    }

    /// Lazily materialized payload of the last verdict
    pub fn last_result(&mut self) -> ExplorationResult {
        let verdict = self
            .last_verdict
            .expect("A result is only available after a solve");
        if self.last_result.is_none() {
            let result = match verdict {
                Verdict::Unknown => ExplorationResult::Unknown,
                Verdict::Unreachable => {
                    ExplorationResult::Unreachable(self.create_counterexample())
                }
                Verdict::Reachable => ExplorationResult::Reachable(self.create_execution_model()),
            };
            self.last_result = Some(result);
        }
        self.last_result.clone().unwrap()
    }

    /// Produce an independent session with identical assertions to
    /// date: a fresh solver replays the scope-structured log, the
    /// version state is cloned copy-on-write
    pub fn clone_session(&self) -> SmtSessionHandler {
        let mut solver = self.solver_factory.create_solver();
        {
            let program = Rc::clone(self.tracker.program());
            let mut table = self.symbols.borrow_mut();
            let mut resolver = TableResolver {
                symbols: &mut table,
                program: &*program,
            };
            for scope in &self.tracker.sink().log {
                solver.push();
                for assertion in scope {
                    solver.assert(&mut resolver, assertion);
                }
            }
        }
        let sink = SolverSink {
            solver,
            symbols: Rc::clone(&self.symbols),
            program: Rc::clone(self.tracker.program()),
            log: self.tracker.sink().log.clone(),
        };
        let mut ctx = TableHeapContext {
            symbols: &*self.symbols,
        };
        let tracker = self.tracker.fork(sink, &mut ctx);
        SmtSessionHandler {
            tracker,
            solver_factory: Rc::clone(&self.solver_factory),
            symbols: Rc::clone(&self.symbols),
            last_verdict: self.last_verdict,
            last_result: self.last_result.clone(),
            heap_pruned: self.heap_pruned,
        }
    }

    fn create_counterexample(&self) -> PathCounterExample {
        if self.heap_pruned {
            return PathCounterExample {
                conflicting: vec![],
                heap_conflict: true,
            };
        }
        let core = self
            .tracker
            .sink()
            .solver
            .unsat_core()
            .expect("An unreachable verdict must provide an unsatisfiable core");
        let log = self.tracker.sink().flattened_log();
        let conflicting = core
            .iter()
            .filter_map(|index| log.get(*index).cloned())
            .collect();
        PathCounterExample {
            conflicting,
            heap_conflict: false,
        }
    }

    fn create_execution_model(&self) -> ExecutionModel {
        let model = self
            .tracker
            .sink()
            .solver
            .model()
            .expect("A reachable verdict must provide a model");
        let program = Rc::clone(self.tracker.program());
        let recorder = ModelRecorder {
            symbols: Rc::clone(&self.symbols),
            program: Rc::clone(&program),
            model,
            nodes: vec![],
            valuations: vec![],
            current: vec![],
            next: vec![],
            postponed: false,
        };
        let mut ctx = TableHeapContext {
            symbols: &*self.symbols,
        };
        let mut replay = self.tracker.fork(recorder, &mut ctx);

        // when solving ended at a procedure entry, seed the deepest
        // node with the parameter interpretations
        let deepest = replay.arena().borrow().flow_node(replay.current_path());
        if let FlowNode::Enter { parameters } = program.node(deepest) {
            for param in parameters {
                let version = replay.version_of(*param);
                replay.sink_mut().record_next(*param, version);
            }
        }

        replay.retract_to_root();

        // the root node closes the trace, together with the starting
        // operations retracted past the solved position
        let root_node = replay.arena().borrow().flow_node(replay.current_path());
        replay.sink_mut().nodes.push(root_node);
        replay.retract_starting_node();
        replay.sink_mut().after_step_retracted();

        // the walk ran from the earliest program point toward the
        // verified location, so the recorded order is already the
        // execution order
        let recorder = replay.into_sink();
        ExecutionModel {
            nodes: recorder.nodes,
            valuations: recorder.valuations,
        }
    }
}
