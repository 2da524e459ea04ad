// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use itertools::Itertools;
use std::{cell::RefCell, collections::HashMap, rc::Rc};

use crate::expr::{Expression, VariableId, VersionLookup, VersionedVariable};
use crate::flow_graph::{
    FlowEdge, FlowNode, GraphId, Operation, OuterEdge, OuterEdgeKind, Program, StartingNodeInfo,
};
use crate::heap::{SymbolicHeap, SymbolicHeapContext};
use crate::path::{PathArena, PathId};

/// Backtrackable version stack of one variable. The bottom entry is
/// always version 0; `last_used` only decreases when the popped version
/// equals it, so restored (shadowed) versions never clobber the
/// high-water mark.
#[derive(Clone, Debug)]
pub struct VersionStack {
    versions: Vec<u32>,
    last_used: u32,
}

impl VersionStack {
    pub fn new() -> Self {
        Self {
            versions: vec![0],
            last_used: 0,
        }
    }

    pub fn current(&self) -> u32 {
        *self.versions.last().expect("Version stack underflow")
    }

    pub fn last_used(&self) -> u32 {
        self.last_used
    }

    pub fn push_new(&mut self) -> u32 {
        let version = self.last_used + 1;
        self.last_used = version;
        self.versions.push(version);
        version
    }

    pub fn push_restored(&mut self, version: u32) {
        assert!(
            version <= self.last_used,
            "A restored version must have been used before"
        );
        self.versions.push(version);
    }

    pub fn pop(&mut self) -> u32 {
        assert!(
            self.versions.len() > 1,
            "Cannot retract a version stack past its base"
        );
        let version = self.versions.pop().unwrap();
        if version == self.last_used {
            self.last_used -= 1;
        }
        version
    }
}

impl Default for VersionStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Versions of all variables at the current path position. Stacks are
/// shared copy-on-write between handler clones and only copied by the
/// first divergent push/pop.
#[derive(Clone)]
pub struct VersionMap {
    stacks: HashMap<VariableId, Rc<VersionStack>>,
}

impl VersionMap {
    pub fn new() -> Self {
        Self {
            stacks: HashMap::new(),
        }
    }

    pub fn version_of(&self, var: VariableId) -> u32 {
        if var.is_null() {
            // the null reference always resolves to version 0
            return 0;
        }
        self.stacks.get(&var).map_or(0, |stack| stack.current())
    }

    pub fn versioned(&self, var: VariableId) -> VersionedVariable {
        VersionedVariable::new(var, self.version_of(var))
    }

    pub fn last_used(&self, var: VariableId) -> u32 {
        self.stacks.get(&var).map_or(0, |stack| stack.last_used())
    }

    fn stack_mut(&mut self, var: VariableId) -> &mut VersionStack {
        assert!(!var.is_null(), "The null reference is never reversioned");
        let rc = self
            .stacks
            .entry(var)
            .or_insert_with(|| Rc::new(VersionStack::new()));
        Rc::make_mut(rc)
    }
}

impl Default for VersionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionLookup for VersionMap {
    fn version_of(&self, var: VariableId) -> u32 {
        VersionMap::version_of(self, var)
    }
}

/// Snapshot of one graph's local-variable versions, pushed when a call
/// boundary is crossed and popped to restore them on the way back.
/// Frames are pushed and popped in exact reverse order of the Outer
/// edges they mirror.
#[derive(Clone, Debug)]
pub struct CallFrame {
    graph: GraphId,
    saved: HashMap<VariableId, u32>,
}

/// Receives navigation events as the handler replays path steps. The
/// solver session mirrors scopes and assertions through this; the
/// execution-model reconstruction records interpretations through it.
/// All methods default to no-ops so pure version mechanics can be
/// driven with a unit sink.
pub trait StepSink {
    /// An extension step is about to apply; open one solver scope
    fn before_step_extended(&mut self) {}

    fn before_step_retracted(&mut self, _edge: &FlowEdge) {}

    fn after_step_retracted(&mut self) {}

    /// A whole retraction batch completed; close `steps` scopes at once
    fn after_retraction(&mut self, _steps: usize) {}

    fn condition_asserted(&mut self, _versions: &VersionMap, _cond: &Expression) {}

    fn variable_assigned(
        &mut self,
        _versions: &VersionMap,
        _variable: VariableId,
        _last_version: u32,
        _value: &Expression,
    ) {
    }

    /// The variable's version is already retracted to the assigned
    /// (left-hand side) one when this fires
    fn assignment_retracted(
        &mut self,
        _versions: &VersionMap,
        _variable: VariableId,
        _assigned_version: u32,
        _value: Option<&Expression>,
    ) {
    }

    /// An unconstrained version minted by an unmodelled call was
    /// retracted
    fn random_retracted(&mut self, _variable: VariableId, _version: u32) {}
}

impl StepSink for () {}

/// The mutable half of a version handler, separated from the sink so
/// event callbacks can read versions while the sink is borrowed
pub struct VersionState {
    program: Rc<Program>,
    arena: Rc<RefCell<PathArena>>,
    versions: VersionMap,
    call_stack: Vec<CallFrame>,
    heap: Box<dyn SymbolicHeap>,
    current: PathId,
    starting: StartingNodeInfo,
}

impl VersionState {
    fn clone_with_heap(&self, ctx: &mut dyn SymbolicHeapContext) -> VersionState {
        VersionState {
            program: Rc::clone(&self.program),
            arena: Rc::clone(&self.arena),
            versions: self.versions.clone(),
            call_stack: self.call_stack.clone(),
            heap: self.heap.clone_heap(ctx),
            current: self.current,
            starting: self.starting.clone(),
        }
    }
}

/// Keeps the (variable → version) mapping, the call-frame stack, and
/// the symbolic heap consistent with the current path position, and
/// navigates to any other path in the same tree by retracting to the
/// common ancestor and replaying forward. Never assumes the target is a
/// descendant.
pub struct PathVersionHandler<S: StepSink> {
    state: VersionState,
    sink: S,
}

impl<S: StepSink> PathVersionHandler<S> {
    pub fn new(
        program: Rc<Program>,
        arena: Rc<RefCell<PathArena>>,
        root: PathId,
        starting: StartingNodeInfo,
        heap: Box<dyn SymbolicHeap>,
        sink: S,
    ) -> Self {
        {
            let paths = arena.borrow();
            assert!(paths.is_root(root), "A version handler starts at a root path");
            assert_eq!(
                paths.flow_node(root),
                starting.node,
                "Root path and starting node must coincide"
            );
        }
        Self {
            state: VersionState {
                program,
                arena,
                versions: VersionMap::new(),
                call_stack: vec![],
                heap,
                current: root,
                starting,
            },
            sink,
        }
    }

    pub fn current_path(&self) -> PathId {
        self.state.current
    }

    pub fn version_of(&self, var: VariableId) -> u32 {
        self.state.versions.version_of(var)
    }

    pub fn versioned(&self, var: VariableId) -> VersionedVariable {
        self.state.versions.versioned(var)
    }

    pub fn versions(&self) -> &VersionMap {
        &self.state.versions
    }

    pub fn heap(&self) -> &dyn SymbolicHeap {
        self.state.heap.as_ref()
    }

    pub fn program(&self) -> &Rc<Program> {
        &self.state.program
    }

    pub fn arena(&self) -> &Rc<RefCell<PathArena>> {
        &self.state.arena
    }

    pub fn starting(&self) -> &StartingNodeInfo {
        &self.state.starting
    }

    pub fn call_stack_depth(&self) -> usize {
        self.state.call_stack.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Produce an independent handler with the same state and a new
    /// sink; version stacks stay shared copy-on-write, the heap is
    /// cloned through its context
    pub fn fork<T: StepSink>(
        &self,
        sink: T,
        ctx: &mut dyn SymbolicHeapContext,
    ) -> PathVersionHandler<T> {
        PathVersionHandler {
            state: self.state.clone_with_heap(ctx),
            sink,
        }
    }

    /// Transition from the current path to `target`, anywhere in the
    /// same tree: retract the deeper side to the common ancestor, then
    /// replay the target's prefix forward. Fails only on invariant
    /// violations.
    pub fn update(&mut self, target: PathId) {
        let Self { state, sink } = self;
        let arena = Rc::clone(&state.arena);

        let mut pop_count = 0;
        let mut forward: Vec<PathId> = vec![];
        let mut retracting = state.current;
        let mut targeting = target;
        while retracting != targeting {
            let (retract_depth, target_depth) = {
                let paths = arena.borrow();
                (paths.depth(retracting), paths.depth(targeting))
            };
            if retract_depth > target_depth {
                pop_count += 1;
                let edge = arena.borrow().primary_edge(retracting);
                sink.before_step_retracted(&edge);
                Self::retract_edge(state, sink, edge);
                retracting = arena.borrow().primary_preceding(retracting);
                state.current = retracting;
                sink.after_step_retracted();
            } else {
                forward.push(targeting);
                targeting = arena.borrow().primary_preceding(targeting);
            }
        }

        // scope pops are batched for performance; performed only after
        // the whole rollback completed
        sink.after_retraction(pop_count);

        while let Some(step) = forward.pop() {
            sink.before_step_extended();
            let edge = arena.borrow().primary_edge(step);
            Self::extend_edge(state, sink, edge);
            state.current = step;
        }

        assert_eq!(
            state.current, target,
            "Path navigation must land on the requested path"
        );
    }

    pub fn retract_to_root(&mut self) {
        let root = self.state.arena.borrow().root_of(self.state.current);
        self.update(root);
    }

    /// Assert the starting node's leading operations (and, for a
    /// checked assertion, the negated assertion condition). Performed
    /// once per session, inside the root solver scope.
    pub fn assert_starting_node(&mut self) {
        let Self { state, sink } = self;
        let program = Rc::clone(&state.program);
        let starting = state.starting.clone();

        let operations = match program.node(starting.node) {
            FlowNode::Inner { operations } => operations,
            _ => return,
        };
        let index = match starting.operation_index {
            Some(index) => index,
            None => return,
        };

        if starting.assertion_checked {
            match &operations[index] {
                Operation::Assign { target, value } => {
                    if let Expression::RefEq { equal, left, right } = value {
                        let l = state.versions.versioned(*left);
                        let r = state.versions.versioned(*right);
                        state.heap.assert_equality(!*equal, l, r);
                    } else {
                        let negated = crate::expr::not(crate::expr::var(*target));
                        sink.condition_asserted(&state.versions, &negated);
                    }
                }
                Operation::FieldRead { reference, .. } | Operation::FieldWrite { reference, .. } => {
                    // the checked failure is a null dereference
                    let refv = state.versions.versioned(*reference);
                    state.heap.assert_equality(true, refv, VersionedVariable::NULL);
                }
            }
        }

        for op in operations[..=index].iter().rev() {
            Self::assert_operation(state, sink, op);
        }
    }

    /// Undo the starting-node operations; used when a replay walks past
    /// the solved position down to the root
    pub fn retract_starting_node(&mut self) {
        let Self { state, sink } = self;
        let program = Rc::clone(&state.program);
        let starting = state.starting.clone();

        let operations = match program.node(starting.node) {
            FlowNode::Inner { operations } => operations,
            _ => return,
        };
        let index = match starting.operation_index {
            Some(index) => index,
            None => return,
        };
        for op in operations[..=index].iter() {
            Self::retract_operation(state, sink, op);
        }
    }

    //
    // per-edge semantics
    //

    fn extend_edge(state: &mut VersionState, sink: &mut S, edge: FlowEdge) {
        let program = Rc::clone(&state.program);
        match edge {
            FlowEdge::Inner(ie) => {
                if let Some(guard) = &program.inner_edge(ie).guard {
                    if !guard.is_trivially_true() {
                        if let Expression::RefEq { equal, left, right } = guard {
                            let l = state.versions.versioned(*left);
                            let r = state.versions.versioned(*right);
                            state.heap.assert_equality(*equal, l, r);
                        } else {
                            sink.condition_asserted(&state.versions, guard);
                        }
                    }
                }
                let (from, _) = program.inner_endpoints(ie);
                match program.node(from) {
                    FlowNode::Inner { operations } => {
                        // the walk is backward, so the node's operations
                        // replay in reverse
                        for op in operations.iter().rev() {
                            Self::assert_operation(state, sink, op);
                        }
                    }
                    FlowNode::Call(site) if !site.is_modelled() => {
                        Self::extend_unmodelled(state, site);
                    }
                    _ => (),
                }
            }
            FlowEdge::Outer(oe) => match oe.kind {
                OuterEdgeKind::MethodCall => Self::extend_call(state, sink, &oe),
                OuterEdgeKind::Return => Self::extend_return(state, sink, &oe),
            },
        }
    }

    fn retract_edge(state: &mut VersionState, sink: &mut S, edge: FlowEdge) {
        let program = Rc::clone(&state.program);
        match edge {
            FlowEdge::Inner(ie) => {
                let (from, _) = program.inner_endpoints(ie);
                match program.node(from) {
                    FlowNode::Inner { operations } => {
                        for op in operations.iter() {
                            Self::retract_operation(state, sink, op);
                        }
                    }
                    FlowNode::Call(site) if !site.is_modelled() => {
                        Self::retract_unmodelled(state, sink, site);
                    }
                    _ => (),
                }
                // the guard was asserted before the operations on
                // extension, so it is undone last
                if let Some(guard) = &program.inner_edge(ie).guard {
                    if !guard.is_trivially_true() {
                        if let Expression::RefEq { .. } = guard {
                            state.heap.retract(1);
                        }
                    }
                }
            }
            FlowEdge::Outer(oe) => match oe.kind {
                OuterEdgeKind::MethodCall => Self::retract_call(state, sink, &oe),
                OuterEdgeKind::Return => Self::retract_return(state, sink, &oe),
            },
        }
    }

    fn assert_operation(state: &mut VersionState, sink: &mut S, op: &Operation) {
        match op {
            Operation::Assign { target, value } => {
                let last_version = state.versions.version_of(*target);
                state.versions.stack_mut(*target).push_new();
                Self::assign_variable(state, sink, *target, last_version, value);
            }
            Operation::FieldRead {
                result,
                reference,
                field,
            } => {
                let result = state.versions.versioned(*result);
                let reference = state.versions.versioned(*reference);
                state.heap.read_field(result, reference, *field);
            }
            Operation::FieldWrite {
                reference,
                field,
                value,
            } => {
                let reference = state.versions.versioned(*reference);
                let value = value.with_versions(&state.versions);
                state.heap.write_field(reference, *field, value);
            }
        }
    }

    fn retract_operation(state: &mut VersionState, sink: &mut S, op: &Operation) {
        match op {
            Operation::Assign { target, value } => {
                state.versions.stack_mut(*target).pop();
                let assigned_version = state.versions.version_of(*target);
                Self::retract_variable_assignment(
                    state,
                    sink,
                    *target,
                    assigned_version,
                    Some(value),
                );
            }
            Operation::FieldRead { .. } | Operation::FieldWrite { .. } => {
                state.heap.retract(1);
            }
        }
    }

    fn assign_variable(
        state: &mut VersionState,
        sink: &mut S,
        variable: VariableId,
        last_version: u32,
        value: &Expression,
    ) {
        use crate::expr::VariableLookup;
        let program = Rc::clone(&state.program);
        if program.is_reference(variable) {
            let left = VersionedVariable::new(variable, last_version);
            let right = match value {
                Expression::Var(v) => state.versions.versioned(*v),
                _ => panic!("A reference assignment value must be a plain variable"),
            };
            state.heap.assert_equality(true, left, right);
            sink.variable_assigned(&state.versions, variable, last_version, value);
        } else if let Expression::RefEq { equal, left, right } = value {
            // a boolean capturing a reference comparison; ask the heap
            // for an equivalent expression first
            let l = state.versions.versioned(*left);
            let r = state.versions.versioned(*right);
            let resolved = state.heap.equality_expr(*equal, l, r);
            sink.variable_assigned(&state.versions, variable, last_version, &resolved);
        } else {
            sink.variable_assigned(&state.versions, variable, last_version, value);
        }
    }

    fn retract_variable_assignment(
        state: &mut VersionState,
        sink: &mut S,
        variable: VariableId,
        assigned_version: u32,
        value: Option<&Expression>,
    ) {
        use crate::expr::VariableLookup;
        if state.program.is_reference(variable) {
            state.heap.retract(1);
        }
        sink.assignment_retracted(&state.versions, variable, assigned_version, value);
    }

    fn extend_unmodelled(state: &mut VersionState, site: &crate::flow_graph::CallSite) {
        // the callee body is unavailable; anything could come back
        for result in &site.results {
            state.versions.stack_mut(*result).push_new();
        }
    }

    fn retract_unmodelled(
        state: &mut VersionState,
        sink: &mut S,
        site: &crate::flow_graph::CallSite,
    ) {
        for result in &site.results {
            state.versions.stack_mut(*result).pop();
            let version = state.versions.version_of(*result);
            sink.random_retracted(*result, version);
        }
    }

    fn extend_call(state: &mut VersionState, sink: &mut S, edge: &OuterEdge) {
        let program = Rc::clone(&state.program);
        let site = match program.node(edge.from) {
            FlowNode::Call(site) => site,
            _ => panic!("A MethodCall edge must originate at a Call node"),
        };
        let parameters = match program.node(edge.to) {
            FlowNode::Enter { parameters } => parameters,
            _ => panic!("A MethodCall edge must target an Enter node"),
        };
        let caller_graph = edge.from.graph;

        // capture the parameter versions used deeper along the path,
        // before the caller's locals are touched
        let param_versions: Vec<u32> = parameters
            .iter()
            .map(|param| state.versions.version_of(*param))
            .collect();

        let restorable = state
            .call_stack
            .last()
            .map_or(false, |frame| frame.graph == caller_graph);
        if restorable {
            // restore the versions saved when the matching Return edge
            // was crossed
            let frame = state.call_stack.pop().unwrap();
            for var in program.graph(caller_graph).locals() {
                let saved = *frame
                    .saved
                    .get(var)
                    .expect("A call frame must cover every local of its graph");
                state.versions.stack_mut(*var).push_restored(saved);
            }
        } else {
            // exploration started inside the callee; the caller's
            // pre-call versions are unknown
            for var in program.graph(caller_graph).locals() {
                state.versions.stack_mut(*var).push_new();
            }
        }

        // assert the argument passing
        for ((param, last_version), argument) in parameters
            .iter()
            .zip_eq(param_versions.iter())
            .zip_eq(site.arguments.iter())
        {
            Self::assign_variable(state, sink, *param, *last_version, argument);
        }
    }

    fn retract_call(state: &mut VersionState, sink: &mut S, edge: &OuterEdge) {
        let program = Rc::clone(&state.program);
        let caller_graph = edge.from.graph;

        let mut saved = HashMap::new();
        for var in program.graph(caller_graph).locals() {
            let version = state.versions.stack_mut(*var).pop();
            saved.insert(*var, version);
        }
        state.call_stack.push(CallFrame {
            graph: caller_graph,
            saved,
        });

        let parameters = match program.node(edge.to) {
            FlowNode::Enter { parameters } => parameters,
            _ => panic!("A MethodCall edge must target an Enter node"),
        };
        for param in parameters {
            let version = state.versions.version_of(*param);
            Self::retract_variable_assignment(state, sink, *param, version, None);
        }
    }

    fn extend_return(state: &mut VersionState, sink: &mut S, edge: &OuterEdge) {
        let program = Rc::clone(&state.program);
        let site = match program.node(edge.to) {
            FlowNode::Call(site) => site,
            _ => panic!("A Return edge must target a Call node"),
        };
        let values = match program.node(edge.from) {
            FlowNode::Return { values } => values,
            _ => panic!("A Return edge must originate at a Return node"),
        };
        let caller_graph = edge.to.graph;

        assert!(
            site.results.is_empty() || site.results.len() == values.len(),
            "Mismatched result bindings at a return"
        );

        // fresh versions for the result bindings
        let mut result_versions = Vec::with_capacity(site.results.len());
        for result in &site.results {
            result_versions.push(state.versions.version_of(*result));
            state.versions.stack_mut(*result).push_new();
        }

        // fresh versions for all caller locals, saving the post-call
        // ones for the matching MethodCall-edge extension
        let mut saved = HashMap::new();
        for var in program.graph(caller_graph).locals() {
            saved.insert(*var, state.versions.version_of(*var));
            state.versions.stack_mut(*var).push_new();
        }
        state.call_stack.push(CallFrame {
            graph: caller_graph,
            saved,
        });

        if site.is_constructor {
            let fresh = state.versions.versioned(site.results[0]);
            state.heap.allocate(fresh);
        }

        // assert the return assignments (absent when the call result
        // is unused)
        if !site.results.is_empty() {
            for ((result, last_version), value) in site
                .results
                .iter()
                .zip_eq(result_versions.iter())
                .zip_eq(values.iter())
            {
                Self::assign_variable(state, sink, *result, *last_version, value);
            }
        }
    }

    fn retract_return(state: &mut VersionState, sink: &mut S, edge: &OuterEdge) {
        let program = Rc::clone(&state.program);
        let site = match program.node(edge.to) {
            FlowNode::Call(site) => site,
            _ => panic!("A Return edge must target a Call node"),
        };
        let caller_graph = edge.to.graph;

        // retract either restored or freshly minted local versions
        for var in program.graph(caller_graph).locals() {
            state.versions.stack_mut(*var).pop();
        }

        // retract the result assignments
        for result in &site.results {
            state.versions.stack_mut(*result).pop();
            let assigned_version = state.versions.version_of(*result);
            Self::retract_variable_assignment(state, sink, *result, assigned_version, None);
        }

        if site.is_constructor {
            state.heap.retract(1);
        }

        let frame = state
            .call_stack
            .pop()
            .expect("Return retraction without a matching call frame");
        assert_eq!(
            frame.graph, caller_graph,
            "Mismatched call frame on return retraction"
        );
    }
}
