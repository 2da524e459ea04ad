// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use std::{cell::RefCell, rc::Rc};

use flow_reach::expr::Expression;
use flow_reach::results::ExplorationResult;
use flow_reach::smt::{
    BoundedSearchFactory, IncrementalSolver, SolveOutcome, SolverFactory, SolverModel,
    SymbolResolver,
};

pub fn init_logger() {
    let _ = TermLogger::init(LevelFilter::Debug, Config::default(), TerminalMode::Mixed);
}

/// Collects every reported result for later inspection
pub fn collecting_callback() -> (
    Rc<RefCell<Vec<ExplorationResult>>>,
    Box<dyn FnMut(ExplorationResult)>,
) {
    let store = Rc::new(RefCell::new(vec![]));
    let sink = Rc::clone(&store);
    (store, Box::new(move |result| sink.borrow_mut().push(result)))
}

/// Solver factory that records every asserted expression (including
/// clone replays) while delegating to the bounded-search solver
pub struct SpySolverFactory {
    inner: BoundedSearchFactory,
    pub asserted: Rc<RefCell<Vec<Expression>>>,
}

impl SpySolverFactory {
    pub fn new() -> Self {
        Self {
            inner: BoundedSearchFactory::default(),
            asserted: Rc::new(RefCell::new(vec![])),
        }
    }
}

impl SolverFactory for SpySolverFactory {
    fn create_solver(&self) -> Box<dyn IncrementalSolver> {
        Box::new(SpySolver {
            inner: self.inner.create_solver(),
            asserted: Rc::clone(&self.asserted),
        })
    }
}

struct SpySolver {
    inner: Box<dyn IncrementalSolver>,
    asserted: Rc<RefCell<Vec<Expression>>>,
}

impl IncrementalSolver for SpySolver {
    fn push(&mut self) {
        self.inner.push();
    }

    fn pop(&mut self, count: usize) {
        self.inner.pop(count);
    }

    fn assert(&mut self, resolver: &mut dyn SymbolResolver, expr: &Expression) {
        self.asserted.borrow_mut().push(expr.clone());
        self.inner.assert(resolver, expr);
    }

    fn check(&mut self) -> SolveOutcome {
        self.inner.check()
    }

    fn model(&self) -> Option<Box<dyn SolverModel>> {
        self.inner.model()
    }

    fn unsat_core(&self) -> Option<Vec<usize>> {
        self.inner.unsat_core()
    }
}
