// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use anyhow::{bail, ensure, Result};
use log::debug;
use petgraph::{
    dot::{self, Dot},
    graph::{EdgeIndex, Graph, NodeIndex},
    visit::{Bfs, EdgeRef},
    EdgeDirection,
};

use crate::expr::{Expression, FieldId, Sort, VariableId, VariableLookup};

/// The following types form the flow-graph IR consumed by the path
/// exploration engine: one graph per procedure, nodes as program
/// points, inner edges as intra-procedural control transfers (with an
/// optional boolean guard), and outer edges crossing graph boundaries
/// at call/return sites.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct GraphId(pub(crate) u32);

impl GraphId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node position across the whole graph collection
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NodeRef {
    pub graph: GraphId,
    pub node: NodeIndex,
}

/// An intra-procedural edge position across the whole graph collection
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct InnerEdgeRef {
    pub graph: GraphId,
    pub edge: EdgeIndex,
}

/// One operation of an inner node, executed unconditionally in sequence
#[derive(Clone, Debug)]
pub enum Operation {
    Assign {
        target: VariableId,
        value: Expression,
    },
    FieldRead {
        result: VariableId,
        reference: VariableId,
        field: FieldId,
    },
    FieldWrite {
        reference: VariableId,
        field: FieldId,
        value: Expression,
    },
}

/// A call site: callee location, arguments, and result bindings. A
/// `None` callee marks an unmodelled call whose body is unavailable;
/// such a call only assigns fresh, unconstrained versions to its
/// results.
#[derive(Clone, Debug)]
pub struct CallSite {
    pub callee: Option<GraphId>,
    pub display_name: String,
    pub arguments: Vec<Expression>,
    pub results: Vec<VariableId>,
    pub is_constructor: bool,
}

impl CallSite {
    pub fn is_modelled(&self) -> bool {
        self.callee.is_some()
    }
}

#[derive(Clone, Debug)]
pub enum FlowNode {
    /// Procedure entry, holding the ordered parameter list
    Enter { parameters: Vec<VariableId> },
    /// Straight-line operation sequence
    Inner { operations: Vec<Operation> },
    /// Call into another graph (or an unmodelled black box)
    Call(CallSite),
    /// Procedure exit, holding the ordered returned expressions
    Return { values: Vec<Expression> },
    /// Distinguished terminal marking an exceptional exit
    Throw,
}

/// Weight of an intra-procedural edge; an absent guard means the
/// transfer is unconditional.
#[derive(Clone, Debug)]
pub struct InnerEdge {
    pub guard: Option<Expression>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OuterEdgeKind {
    MethodCall,
    Return,
}

/// An edge crossing graph boundaries: MethodCall links a Call node to
/// the callee's Enter, Return links a callee's Return node back to the
/// matching Call node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OuterEdge {
    pub kind: OuterEdgeKind,
    pub from: NodeRef,
    pub to: NodeRef,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FlowEdge {
    Inner(InnerEdgeRef),
    Outer(OuterEdge),
}

impl FlowEdge {
    pub fn from(&self, program: &Program) -> NodeRef {
        match self {
            FlowEdge::Inner(ie) => program.inner_endpoints(*ie).0,
            FlowEdge::Outer(oe) => oe.from,
        }
    }

    pub fn to(&self, program: &Program) -> NodeRef {
        match self {
            FlowEdge::Inner(ie) => program.inner_endpoints(*ie).1,
            FlowEdge::Outer(oe) => oe.to,
        }
    }
}

/// The node exploration starts from, optionally narrowed to one
/// operation of an inner node. With `assertion_checked` set, the
/// operation is treated as a checked assertion and its negation (or the
/// corresponding null-dereference condition) is asserted up front.
#[derive(Clone, Debug)]
pub struct StartingNodeInfo {
    pub node: NodeRef,
    pub operation_index: Option<usize>,
    pub assertion_checked: bool,
}

impl StartingNodeInfo {
    pub fn node_only(node: NodeRef) -> Self {
        Self {
            node,
            operation_index: None,
            assertion_checked: false,
        }
    }

    pub fn with_operation(node: NodeRef, operation_index: usize, assertion_checked: bool) -> Self {
        Self {
            node,
            operation_index: Some(operation_index),
            assertion_checked,
        }
    }
}

struct VariableInfo {
    name: String,
    sort: Sort,
    graph: Option<GraphId>,
}

struct FieldInfo {
    name: String,
    sort: Sort,
}

/// One procedure graph
pub struct FlowGraph {
    id: GraphId,
    name: String,
    graph: Graph<FlowNode, InnerEdge>,
    enter: NodeIndex,
    /// all variables of this graph (parameters included), in
    /// registration order; this is the set saved/restored by call
    /// frames
    locals: Vec<VariableId>,
}

impl FlowGraph {
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enter(&self) -> NodeRef {
        NodeRef {
            graph: self.id,
            node: self.enter,
        }
    }

    pub fn locals(&self) -> &[VariableId] {
        &self.locals
    }

    pub fn node(&self, node: NodeIndex) -> &FlowNode {
        self.graph.node_weight(node).expect("Unknown flow node")
    }

    pub fn node_refs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        let id = self.id;
        self.graph
            .node_indices()
            .map(move |node| NodeRef { graph: id, node })
    }

    /// Ingoing intra-procedural edges of a node, the candidate set for
    /// one backward exploration step
    pub fn ingoing_edges(&self, node: NodeIndex) -> Vec<FlowEdge> {
        self.graph
            .edges_directed(node, EdgeDirection::Incoming)
            .map(|edge| {
                FlowEdge::Inner(InnerEdgeRef {
                    graph: self.id,
                    edge: edge.id(),
                })
            })
            .collect()
    }

    /// convert the graph into Dot representation
    pub fn to_dot(&self) -> String {
        format!(
            "{:?}",
            Dot::with_config(
                &self.graph,
                &[dot::Config::EdgeNoLabel, dot::Config::NodeIndexLabel],
            )
        )
    }
}

/// The frozen whole-program graph collection plus the variable and
/// field registries. Built once by `ProgramBuilder`, never mutated
/// during exploration.
pub struct Program {
    graphs: Vec<FlowGraph>,
    variables: Vec<VariableInfo>,
    fields: Vec<FieldInfo>,
}

impl Program {
    pub fn graph(&self, id: GraphId) -> &FlowGraph {
        self.graphs.get(id.index()).expect("Unknown flow graph")
    }

    pub fn graphs(&self) -> impl Iterator<Item = &FlowGraph> {
        self.graphs.iter()
    }

    pub fn node(&self, node: NodeRef) -> &FlowNode {
        self.graph(node.graph).node(node.node)
    }

    pub fn inner_edge(&self, edge: InnerEdgeRef) -> &InnerEdge {
        self.graph(edge.graph)
            .graph
            .edge_weight(edge.edge)
            .expect("Unknown flow edge")
    }

    pub fn inner_endpoints(&self, edge: InnerEdgeRef) -> (NodeRef, NodeRef) {
        let (from, to) = self
            .graph(edge.graph)
            .graph
            .edge_endpoints(edge.edge)
            .expect("Unknown flow edge");
        (
            NodeRef {
                graph: edge.graph,
                node: from,
            },
            NodeRef {
                graph: edge.graph,
                node: to,
            },
        )
    }

    pub fn ingoing_edges(&self, node: NodeRef) -> Vec<FlowEdge> {
        self.graph(node.graph).ingoing_edges(node.node)
    }

    pub fn field_name(&self, field: FieldId) -> &str {
        &self.fields[field.index()].name
    }
}

impl VariableLookup for Program {
    fn variable_sort(&self, var: VariableId) -> Sort {
        self.variables[var.index()].sort
    }

    fn variable_name(&self, var: VariableId) -> &str {
        &self.variables[var.index()].name
    }
}

struct GraphShell {
    name: String,
    graph: Graph<FlowNode, InnerEdge>,
    enter: Option<NodeIndex>,
    locals: Vec<VariableId>,
}

/// Builds and validates a `Program`. Construction mistakes surface as
/// recoverable errors at `finish()`; a finished program upholds the
/// graph invariants the engine asserts on.
pub struct ProgramBuilder {
    variables: Vec<VariableInfo>,
    fields: Vec<FieldInfo>,
    graphs: Vec<GraphShell>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        // the null reference is always variable 0
        let null = VariableInfo {
            name: "null".to_string(),
            sort: Sort::Reference,
            graph: None,
        };
        Self {
            variables: vec![null],
            fields: vec![],
            graphs: vec![],
        }
    }

    pub fn graph(&mut self, name: &str) -> GraphId {
        let id = GraphId(self.graphs.len() as u32);
        self.graphs.push(GraphShell {
            name: name.to_string(),
            graph: Graph::new(),
            enter: None,
            locals: vec![],
        });
        id
    }

    pub fn variable(&mut self, graph: GraphId, name: &str, sort: Sort) -> VariableId {
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(VariableInfo {
            name: name.to_string(),
            sort,
            graph: Some(graph),
        });
        self.shell_mut(graph).locals.push(id);
        id
    }

    pub fn field(&mut self, name: &str, sort: Sort) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldInfo {
            name: name.to_string(),
            sort,
        });
        id
    }

    pub fn enter(&mut self, graph: GraphId, parameters: Vec<VariableId>) -> NodeRef {
        let node = self
            .shell_mut(graph)
            .graph
            .add_node(FlowNode::Enter { parameters });
        self.shell_mut(graph).enter.get_or_insert(node);
        NodeRef { graph, node }
    }

    pub fn inner(&mut self, graph: GraphId, operations: Vec<Operation>) -> NodeRef {
        let node = self
            .shell_mut(graph)
            .graph
            .add_node(FlowNode::Inner { operations });
        NodeRef { graph, node }
    }

    pub fn call(&mut self, graph: GraphId, site: CallSite) -> NodeRef {
        let node = self.shell_mut(graph).graph.add_node(FlowNode::Call(site));
        NodeRef { graph, node }
    }

    pub fn ret(&mut self, graph: GraphId, values: Vec<Expression>) -> NodeRef {
        let node = self
            .shell_mut(graph)
            .graph
            .add_node(FlowNode::Return { values });
        NodeRef { graph, node }
    }

    pub fn throw(&mut self, graph: GraphId) -> NodeRef {
        let node = self.shell_mut(graph).graph.add_node(FlowNode::Throw);
        NodeRef { graph, node }
    }

    pub fn edge(&mut self, from: NodeRef, to: NodeRef) -> InnerEdgeRef {
        self.add_edge(from, to, None)
    }

    pub fn guarded_edge(&mut self, from: NodeRef, to: NodeRef, guard: Expression) -> InnerEdgeRef {
        self.add_edge(from, to, Some(guard))
    }

    fn add_edge(&mut self, from: NodeRef, to: NodeRef, guard: Option<Expression>) -> InnerEdgeRef {
        assert_eq!(
            from.graph, to.graph,
            "Inner edges must not cross graph boundaries"
        );
        let edge = self
            .shell_mut(from.graph)
            .graph
            .add_edge(from.node, to.node, InnerEdge { guard });
        InnerEdgeRef {
            graph: from.graph,
            edge,
        }
    }

    fn shell_mut(&mut self, graph: GraphId) -> &mut GraphShell {
        self.graphs.get_mut(graph.index()).expect("Unknown graph id")
    }

    /// Validate and freeze the program
    pub fn finish(self) -> Result<Program> {
        let lookup = RegistryLookup {
            variables: &self.variables,
        };

        let mut graphs = vec![];
        for (index, shell) in self.graphs.iter().enumerate() {
            let id = GraphId(index as u32);

            // exactly one Enter node, with no incoming edges
            let enter = match shell.enter {
                Some(node) => node,
                None => bail!("Graph '{}' has no Enter node", shell.name),
            };
            let mut enter_count = 0;
            for node in shell.graph.node_indices() {
                if let FlowNode::Enter { .. } = shell.graph.node_weight(node).unwrap() {
                    enter_count += 1;
                }
            }
            ensure!(
                enter_count == 1,
                "Graph '{}' must have exactly one Enter node, found {}",
                shell.name,
                enter_count
            );
            ensure!(
                shell
                    .graph
                    .edges_directed(enter, EdgeDirection::Incoming)
                    .next()
                    .is_none(),
                "Enter node of graph '{}' must have no incoming edges",
                shell.name
            );

            // every node reachable from Enter
            let mut reachable = 0;
            let mut bfs = Bfs::new(&shell.graph, enter);
            while bfs.next(&shell.graph).is_some() {
                reachable += 1;
            }
            if reachable != shell.graph.node_count() {
                debug!(
                    "Graph '{}' has {} node(s) unreachable from Enter",
                    shell.name,
                    shell.graph.node_count() - reachable
                );
                bail!(
                    "All nodes of graph '{}' must be reachable from its Enter node",
                    shell.name
                );
            }

            // guards and node payloads are well-sorted
            for edge in shell.graph.edge_indices() {
                if let Some(guard) = &shell.graph.edge_weight(edge).unwrap().guard {
                    ensure_unversioned(guard)?;
                    let sort = guard.validate(&lookup)?;
                    ensure!(
                        sort == Sort::Bool,
                        "Edge guard in graph '{}' must be boolean",
                        shell.name
                    );
                }
            }
            for node in shell.graph.node_indices() {
                self.validate_node(&lookup, shell, index as u32, node)?;
            }

            graphs.push(FlowGraph {
                id,
                name: shell.name.clone(),
                graph: shell.graph.clone(),
                enter,
                locals: shell.locals.clone(),
            });
        }

        Ok(Program {
            graphs,
            variables: self.variables,
            fields: self.fields,
        })
    }

    fn validate_node(
        &self,
        lookup: &RegistryLookup<'_>,
        shell: &GraphShell,
        graph_id: u32,
        node: NodeIndex,
    ) -> Result<()> {
        match shell.graph.node_weight(node).unwrap() {
            FlowNode::Enter { parameters } => {
                for param in parameters {
                    ensure!(
                        !param.is_null(),
                        "The null reference cannot be a parameter"
                    );
                    ensure!(
                        self.variables[param.index()].graph == Some(GraphId(graph_id)),
                        "Parameter '{}' does not belong to graph '{}'",
                        lookup.variable_name(*param),
                        shell.name
                    );
                }
            }
            FlowNode::Inner { operations } => {
                for op in operations {
                    match op {
                        Operation::Assign { target, value } => {
                            ensure!(
                                !target.is_null(),
                                "The null reference cannot be assigned"
                            );
                            ensure_unversioned(value)?;
                            let sort = value.validate(lookup)?;
                            ensure!(
                                sort == lookup.variable_sort(*target),
                                "Assignment value sort mismatch in graph '{}'",
                                shell.name
                            );
                        }
                        Operation::FieldRead {
                            result,
                            reference,
                            field,
                        } => {
                            ensure!(
                                lookup.is_reference(*reference),
                                "Field read over a non-reference in graph '{}'",
                                shell.name
                            );
                            ensure!(
                                !result.is_null(),
                                "Field read cannot target the null reference"
                            );
                            ensure!(
                                lookup.variable_sort(*result) == self.fields[field.index()].sort,
                                "Field read result sort mismatch in graph '{}'",
                                shell.name
                            );
                        }
                        Operation::FieldWrite {
                            reference,
                            field,
                            value,
                        } => {
                            ensure_unversioned(value)?;
                            let sort = value.validate(lookup)?;
                            ensure!(
                                lookup.is_reference(*reference),
                                "Field write over a non-reference in graph '{}'",
                                shell.name
                            );
                            ensure!(
                                sort == self.fields[field.index()].sort,
                                "Field write value sort mismatch in graph '{}'",
                                shell.name
                            );
                        }
                    }
                }
            }
            FlowNode::Call(site) => {
                for arg in &site.arguments {
                    ensure_unversioned(arg)?;
                    arg.validate(lookup)?;
                }
                if let Some(callee) = site.callee {
                    let callee_shell = self
                        .graphs
                        .get(callee.index())
                        .ok_or_else(|| anyhow::anyhow!("Call to unknown graph"))?;
                    let enter = callee_shell
                        .enter
                        .ok_or_else(|| anyhow::anyhow!("Callee graph has no Enter node"))?;
                    if let FlowNode::Enter { parameters } =
                        callee_shell.graph.node_weight(enter).unwrap()
                    {
                        ensure!(
                            parameters.len() == site.arguments.len(),
                            "Call to '{}' passes {} argument(s), callee expects {}",
                            site.display_name,
                            site.arguments.len(),
                            parameters.len()
                        );
                    }
                    for ret in callee_shell.graph.node_indices() {
                        if let FlowNode::Return { values } =
                            callee_shell.graph.node_weight(ret).unwrap()
                        {
                            ensure!(
                                site.results.is_empty() || site.results.len() == values.len(),
                                "Call to '{}' binds {} result(s), callee returns {}",
                                site.display_name,
                                site.results.len(),
                                values.len()
                            );
                        }
                    }
                } else {
                    ensure!(
                        !site.is_constructor,
                        "An unmodelled call cannot be a constructor call"
                    );
                }
            }
            FlowNode::Return { values } => {
                for value in values {
                    ensure_unversioned(value)?;
                    value.validate(lookup)?;
                }
            }
            FlowNode::Throw => (),
        }
        Ok(())
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RegistryLookup<'a> {
    variables: &'a [VariableInfo],
}

impl<'a> VariableLookup for RegistryLookup<'a> {
    fn variable_sort(&self, var: VariableId) -> Sort {
        self.variables[var.index()].sort
    }

    fn variable_name(&self, var: VariableId) -> &str {
        &self.variables[var.index()].name
    }
}

fn ensure_unversioned(expr: &Expression) -> Result<()> {
    let mut versioned = false;
    collect_versioned(expr, &mut versioned);
    ensure!(
        !versioned,
        "A frozen program must not contain versioned atoms"
    );
    Ok(())
}

fn collect_versioned(expr: &Expression, found: &mut bool) {
    match expr {
        Expression::Versioned(_) | Expression::RefEqVersioned { .. } => *found = true,
        Expression::Bool(_) | Expression::Int(_) | Expression::Var(_) => (),
        Expression::Not(e) | Expression::Neg(e) => collect_versioned(e, found),
        Expression::And(es) | Expression::Or(es) | Expression::Add(es) | Expression::Mul(es) => {
            for e in es {
                collect_versioned(e, found);
            }
        }
        Expression::Implies(l, r)
        | Expression::Sub(l, r)
        | Expression::Eq(l, r)
        | Expression::Lt(l, r)
        | Expression::Le(l, r)
        | Expression::Gt(l, r)
        | Expression::Ge(l, r) => {
            collect_versioned(l, found);
            collect_versioned(r, found);
        }
        Expression::RefEq { .. } => (),
    }
}
