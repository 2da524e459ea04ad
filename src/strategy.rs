// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::explore::{ExplorationState, StateId};
use crate::flow_graph::FlowEdge;
use crate::smt_session::SmtSessionHandler;

/// Which solver session survives a merge of two states
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionChoice {
    New,
    Existing,
}

/// Decides the exploration order and which candidate edges are worth
/// branching into. Heuristics are total: declining to classify an edge
/// means "do not explore it", never a fault.
pub trait ExplorationHeuristic {
    /// A state entered the live set
    fn state_added(&mut self, id: StateId, state: &ExplorationState);

    /// A state left the live set (branched away, merged, or solved)
    fn state_removed(&mut self, id: StateId);

    /// The next state to expand; `None` drains the worklist
    fn pick_next_state(&mut self) -> Option<StateId>;

    /// One decision per candidate edge, in order
    fn do_branch(&mut self, state: &ExplorationState, edges: &[FlowEdge]) -> Vec<bool>;
}

/// Decides whether a newly branched state folds into an existing live
/// state at the same flow-graph position
pub trait MergingHeuristic {
    fn do_merge(&mut self, new: &ExplorationState, existing: &ExplorationState) -> bool;
}

/// Decides when to invoke the solver and how sessions are shared,
/// cloned, and merged
pub trait SmtHeuristic {
    /// Solve this freshly branched state even though it is not final?
    fn do_solve(&mut self, state: &ExplorationState) -> bool;

    /// One decision per solve candidate, in one batch: `true` keeps the
    /// shared source session, `false` requests a clone before solving
    fn do_reuse(
        &mut self,
        source: &Rc<RefCell<SmtSessionHandler>>,
        candidates: &[&ExplorationState],
    ) -> Vec<bool>;

    /// Pick the surviving session when two merged states hold different
    /// ones
    fn select_merged_session(
        &mut self,
        new: &ExplorationState,
        existing: &ExplorationState,
    ) -> SessionChoice;
}

//
// reference implementations
//

/// Depth-first order: newest state first, every edge branched. An
/// optional depth bound turns refusals into "do not explore", which
/// bounds loops and recursion.
pub struct DfsExploration {
    stack: Vec<StateId>,
    alive: HashSet<StateId>,
    max_depth: Option<u32>,
}

impl DfsExploration {
    pub fn new() -> Self {
        Self {
            stack: vec![],
            alive: HashSet::new(),
            max_depth: None,
        }
    }

    pub fn with_max_depth(max_depth: u32) -> Self {
        Self {
            stack: vec![],
            alive: HashSet::new(),
            max_depth: Some(max_depth),
        }
    }
}

impl Default for DfsExploration {
    fn default() -> Self {
        Self::new()
    }
}

impl ExplorationHeuristic for DfsExploration {
    fn state_added(&mut self, id: StateId, _state: &ExplorationState) {
        self.stack.push(id);
        self.alive.insert(id);
    }

    fn state_removed(&mut self, id: StateId) {
        self.alive.remove(&id);
    }

    fn pick_next_state(&mut self) -> Option<StateId> {
        while let Some(id) = self.stack.pop() {
            if self.alive.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    fn do_branch(&mut self, state: &ExplorationState, edges: &[FlowEdge]) -> Vec<bool> {
        let within_bound = self
            .max_depth
            .map_or(true, |bound| state.depth() < bound);
        vec![within_bound; edges.len()]
    }
}

/// Breadth-first order: oldest state first, every edge branched. Lets
/// sibling branches reach a reconvergence point while both are still
/// live, which is what merging heuristics need.
pub struct BfsExploration {
    queue: VecDeque<StateId>,
    alive: HashSet<StateId>,
}

impl BfsExploration {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            alive: HashSet::new(),
        }
    }
}

impl Default for BfsExploration {
    fn default() -> Self {
        Self::new()
    }
}

impl ExplorationHeuristic for BfsExploration {
    fn state_added(&mut self, id: StateId, _state: &ExplorationState) {
        self.queue.push_back(id);
        self.alive.insert(id);
    }

    fn state_removed(&mut self, id: StateId) {
        self.alive.remove(&id);
    }

    fn pick_next_state(&mut self) -> Option<StateId> {
        while let Some(id) = self.queue.pop_front() {
            if self.alive.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    fn do_branch(&mut self, _state: &ExplorationState, edges: &[FlowEdge]) -> Vec<bool> {
        vec![true; edges.len()]
    }
}

/// Keeps every branch separate
pub struct NeverMerge;

impl MergingHeuristic for NeverMerge {
    fn do_merge(&mut self, _new: &ExplorationState, _existing: &ExplorationState) -> bool {
        false
    }
}

/// Folds reconverging branches whenever they arrive at the same
/// flow-graph position (the engine only proposes co-located candidates)
pub struct MergeAtSamePosition;

impl MergingHeuristic for MergeAtSamePosition {
    fn do_merge(&mut self, new: &ExplorationState, existing: &ExplorationState) -> bool {
        new.node() == existing.node()
    }
}

/// Solve only where the engine demands it (final nodes); the first
/// solve candidate keeps the shared session, the rest receive clones;
/// merges keep the existing session.
pub struct SolveOnlyFinal;

impl SmtHeuristic for SolveOnlyFinal {
    fn do_solve(&mut self, _state: &ExplorationState) -> bool {
        false
    }

    fn do_reuse(
        &mut self,
        _source: &Rc<RefCell<SmtSessionHandler>>,
        candidates: &[&ExplorationState],
    ) -> Vec<bool> {
        candidates
            .iter()
            .enumerate()
            .map(|(index, _)| index == 0)
            .collect()
    }

    fn select_merged_session(
        &mut self,
        _new: &ExplorationState,
        _existing: &ExplorationState,
    ) -> SessionChoice {
        SessionChoice::Existing
    }
}

/// Solve every branched state; session sharing as in `SolveOnlyFinal`
pub struct EagerSmt;

impl SmtHeuristic for EagerSmt {
    fn do_solve(&mut self, _state: &ExplorationState) -> bool {
        true
    }

    fn do_reuse(
        &mut self,
        _source: &Rc<RefCell<SmtSessionHandler>>,
        candidates: &[&ExplorationState],
    ) -> Vec<bool> {
        candidates
            .iter()
            .enumerate()
            .map(|(index, _)| index == 0)
            .collect()
    }

    fn select_merged_session(
        &mut self,
        _new: &ExplorationState,
        _existing: &ExplorationState,
    ) -> SessionChoice {
        SessionChoice::Existing
    }
}
