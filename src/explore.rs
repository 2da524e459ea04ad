// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use anyhow::{ensure, Result};
use log::debug;
use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::flow_graph::{FlowEdge, FlowNode, NodeRef, Program, StartingNodeInfo};
use crate::heap::SymbolicHeapFactory;
use crate::path::{PathArena, PathId};
use crate::provider::{EntryPointRecognizer, FlowGraphProvider};
use crate::results::{ExplorationResult, Verdict};
use crate::smt::{SolverFactory, SymbolTable};
use crate::smt_session::SmtSessionHandler;
use crate::strategy::{
    DfsExploration, ExplorationHeuristic, MergingHeuristic, NeverMerge, SessionChoice,
    SmtHeuristic, SolveOnlyFinal,
};

/// Identity of a live exploration state
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

/// Pairs a path with the solver session evaluating it. Multiple states
/// may share one session until their pending assertions diverge, at
/// which point exactly one keeps the original and the others receive
/// clones.
pub struct ExplorationState {
    path: PathId,
    node: NodeRef,
    depth: u32,
    session: Rc<RefCell<SmtSessionHandler>>,
}

impl ExplorationState {
    pub fn path(&self) -> PathId {
        self.path
    }

    pub fn node(&self) -> NodeRef {
        self.node
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn session(&self) -> &Rc<RefCell<SmtSessionHandler>> {
        &self.session
    }
}

/// Cooperative cancellation signal, polled once per exploration
/// iteration and never thrown into
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters of one exploration run
#[derive(Clone, Copy, Debug, Default)]
pub struct ExplorationStats {
    pub iterations: u64,
    pub branches: u64,
    pub merges: u64,
    pub solves: u64,
    pub cancelled: bool,
}

/// External collaborators of the engine: the frozen program, the
/// interprocedural edge provider, and the symbolic-heap factory
pub struct ExplorationContext {
    pub program: Rc<Program>,
    pub provider: Rc<dyn FlowGraphProvider>,
    pub heap_factory: Rc<dyn SymbolicHeapFactory>,
}

/// The worklist loop driving backward path exploration: dequeue a
/// state, compute its candidate ingoing edges, branch per the
/// exploration heuristic, fold reconverging branches per the merging
/// heuristic, and discharge final (or heuristically chosen) states to
/// their solver sessions, reporting each terminal verdict through the
/// result callback.
pub struct Explorer {
    context: ExplorationContext,
    solver_factory: Rc<dyn SolverFactory>,
    starting: StartingNodeInfo,
    recognizer: Box<dyn EntryPointRecognizer>,
    callback: Box<dyn FnMut(ExplorationResult)>,
    symbols: Rc<RefCell<SymbolTable>>,
    arena: Rc<RefCell<PathArena>>,
    states: HashMap<StateId, ExplorationState>,
    /// live states per flow-graph position, the merge candidate index
    states_at: HashMap<NodeRef, Vec<StateId>>,
    next_state: u64,
    exploration_heuristic: Box<dyn ExplorationHeuristic>,
    merging_heuristic: Box<dyn MergingHeuristic>,
    smt_heuristic: Box<dyn SmtHeuristic>,
}

impl Explorer {
    pub fn new(
        context: ExplorationContext,
        solver_factory: Rc<dyn SolverFactory>,
        starting: StartingNodeInfo,
        recognizer: Box<dyn EntryPointRecognizer>,
        callback: Box<dyn FnMut(ExplorationResult)>,
    ) -> Result<Explorer> {
        ensure!(
            !recognizer.is_final_node(starting.node),
            "The starting node must not itself be final"
        );

        let arena = Rc::new(RefCell::new(PathArena::new()));
        let root = arena.borrow_mut().root(starting.node);
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));

        let root_session = SmtSessionHandler::new(
            Rc::clone(&context.program),
            Rc::clone(&arena),
            root,
            starting.clone(),
            Rc::clone(&solver_factory),
            context.heap_factory.as_ref(),
            Rc::clone(&symbols),
        );

        let mut explorer = Explorer {
            context,
            solver_factory,
            starting: starting.clone(),
            recognizer,
            callback,
            symbols,
            arena,
            states: HashMap::new(),
            states_at: HashMap::new(),
            next_state: 0,
            exploration_heuristic: Box::new(DfsExploration::new()),
            merging_heuristic: Box::new(NeverMerge),
            smt_heuristic: Box::new(SolveOnlyFinal),
        };
        explorer.add_state(ExplorationState {
            path: root,
            node: starting.node,
            depth: 0,
            session: Rc::new(RefCell::new(root_session)),
        });
        Ok(explorer)
    }

    pub fn set_exploration_heuristic(&mut self, mut heuristic: Box<dyn ExplorationHeuristic>) {
        let mut ids: Vec<StateId> = self.states.keys().copied().collect();
        ids.sort();
        for id in ids {
            heuristic.state_added(id, &self.states[&id]);
        }
        self.exploration_heuristic = heuristic;
    }

    pub fn set_merging_heuristic(&mut self, heuristic: Box<dyn MergingHeuristic>) {
        self.merging_heuristic = heuristic;
    }

    pub fn set_smt_heuristic(&mut self, heuristic: Box<dyn SmtHeuristic>) {
        self.smt_heuristic = heuristic;
    }

    pub fn starting(&self) -> &StartingNodeInfo {
        &self.starting
    }

    pub fn solver_factory(&self) -> &Rc<dyn SolverFactory> {
        &self.solver_factory
    }

    pub fn live_states(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &ExplorationState)> {
        self.states.iter().map(|(id, state)| (*id, state))
    }

    pub fn path_arena(&self) -> &Rc<RefCell<PathArena>> {
        &self.arena
    }

    pub fn symbol_table(&self) -> &Rc<RefCell<SymbolTable>> {
        &self.symbols
    }

    /// Run the exploration loop to completion or cancellation
    pub async fn explore(&mut self, cancel: &CancellationFlag) -> Result<ExplorationStats> {
        let mut stats = ExplorationStats::default();

        while let Some(id) = self.exploration_heuristic.pick_next_state() {
            let state = self.remove_state(id);
            stats.iterations += 1;

            let edges = self.candidate_edges(&state).await?;
            debug!(
                "Expanding a state at {:?} with {} candidate edge(s)",
                state.node,
                edges.len()
            );

            let decisions = self.exploration_heuristic.do_branch(&state, &edges);
            assert_eq!(
                decisions.len(),
                edges.len(),
                "A branch heuristic must decide every candidate edge"
            );

            let mut to_solve: Vec<StateId> = vec![];
            for (edge, decision) in edges.iter().zip(decisions.iter()) {
                if !*decision {
                    // verification stays uncertain at this location
                    debug!(
                        "Not exploring an edge into {:?}",
                        edge.from(&self.context.program)
                    );
                    continue;
                }
                stats.branches += 1;

                let from_node = edge.from(&self.context.program);
                let (new_path, depth) = {
                    let mut arena = self.arena.borrow_mut();
                    let path = arena.extend(state.path, *edge, from_node);
                    (path, arena.depth(path))
                };
                let branched = ExplorationState {
                    path: new_path,
                    node: from_node,
                    depth,
                    session: Rc::clone(&state.session),
                };

                // try folding into a live state at the same position
                let mut merged = false;
                let candidates: Vec<StateId> = self
                    .states_at
                    .get(&from_node)
                    .cloned()
                    .unwrap_or_default();
                for cid in candidates {
                    let existing = self.states.get(&cid).expect("Location index out of sync");
                    if self.merging_heuristic.do_merge(&branched, existing) {
                        let choice = if Rc::ptr_eq(branched.session(), existing.session()) {
                            SessionChoice::Existing
                        } else {
                            self.smt_heuristic.select_merged_session(&branched, existing)
                        };
                        let existing_path = existing.path;
                        // the surviving state absorbs the new branch as
                        // an additional predecessor
                        self.arena
                            .borrow_mut()
                            .merge_into(existing_path, state.path, *edge);
                        if choice == SessionChoice::New {
                            self.states.get_mut(&cid).unwrap().session =
                                Rc::clone(branched.session());
                        }
                        stats.merges += 1;
                        merged = true;
                        break;
                    }
                }
                if merged {
                    // merging is terminal for the branched state
                    continue;
                }

                let is_final = self.recognizer.is_final_node(from_node);
                let sid = self.add_state(branched);
                let wants_solve = {
                    let branched = self.states.get(&sid).unwrap();
                    is_final || self.smt_heuristic.do_solve(branched)
                };
                if wants_solve {
                    to_solve.push(sid);
                }
            }

            if !to_solve.is_empty() {
                stats.solves += to_solve.len() as u64;

                // decide session reuse in one batch before any solving
                let reuse = {
                    let states = &self.states;
                    let candidates: Vec<&ExplorationState> = to_solve
                        .iter()
                        .map(|sid| states.get(sid).expect("Solve candidate vanished"))
                        .collect();
                    self.smt_heuristic.do_reuse(&state.session, &candidates)
                };
                assert_eq!(
                    reuse.len(),
                    to_solve.len(),
                    "An SMT heuristic must decide every solve candidate"
                );
                for (sid, keep) in to_solve.iter().zip(reuse.iter()) {
                    if !*keep {
                        let cloned = self.states.get(sid).unwrap().session.borrow().clone_session();
                        self.states.get_mut(sid).unwrap().session =
                            Rc::new(RefCell::new(cloned));
                    }
                }

                for sid in to_solve {
                    let (path, node, session) = {
                        let branched = self.states.get(&sid).unwrap();
                        (branched.path, branched.node, Rc::clone(&branched.session))
                    };
                    let verdict = session.borrow_mut().solve(path);
                    debug!("Solved a state at {:?}: {:?}", node, verdict);

                    if verdict != Verdict::Reachable || self.recognizer.is_final_node(node) {
                        let terminated = self.remove_state(sid);
                        let result = terminated.session.borrow_mut().last_result();
                        (self.callback)(result);
                    }
                }
            }

            // check the cancellation before picking the next state; a
            // cancelled run is a well-defined partial result
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
        }

        Ok(stats)
    }

    /// Candidate edges of one backward step, by node kind. Enter nodes
    /// and not-yet-exited modelled calls cross procedure boundaries and
    /// go through the provider.
    async fn candidate_edges(&self, state: &ExplorationState) -> Result<Vec<FlowEdge>> {
        let program = &self.context.program;
        match program.node(state.node) {
            FlowNode::Enter { .. } => {
                let outer = self.context.provider.call_edges_to(state.node).await?;
                Ok(outer.into_iter().map(FlowEdge::Outer).collect())
            }
            FlowNode::Call(site) => {
                // a Call node whose nearest preceding position is an
                // Enter node has already been exited backward; an
                // unmodelled call never dives into its callee
                let exited_backward = {
                    let arena = self.arena.borrow();
                    if arena.is_root(state.path) {
                        false
                    } else {
                        let pred = arena.primary_preceding(state.path);
                        matches!(program.node(arena.flow_node(pred)), FlowNode::Enter { .. })
                    }
                };
                if !site.is_modelled() || exited_backward {
                    Ok(program.ingoing_edges(state.node))
                } else {
                    let outer = self.context.provider.return_edges_to(state.node).await?;
                    Ok(outer.into_iter().map(FlowEdge::Outer).collect())
                }
            }
            _ => Ok(program.ingoing_edges(state.node)),
        }
    }

    fn add_state(&mut self, state: ExplorationState) -> StateId {
        let id = StateId(self.next_state);
        self.next_state += 1;
        self.states_at
            .entry(state.node)
            .or_insert_with(Vec::new)
            .push(id);
        self.states.insert(id, state);
        self.exploration_heuristic
            .state_added(id, &self.states[&id]);
        id
    }

    fn remove_state(&mut self, id: StateId) -> ExplorationState {
        let state = self
            .states
            .remove(&id)
            .expect("Unknown exploration state");
        let emptied = match self.states_at.get_mut(&state.node) {
            Some(ids) => {
                ids.retain(|other| *other != id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.states_at.remove(&state.node);
        }
        self.exploration_heuristic.state_removed(id);
        state
    }
}
